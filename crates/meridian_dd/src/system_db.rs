//! Fjall-backed system keyspace with optimistic transactions.
//!
//! Every read validates the transaction's read version against the store's
//! commit counter, and commits re-validate it under the commit lock, so a
//! transaction observes a consistent snapshot or fails with a retryable
//! conflict. Conflict granularity is the whole store; the distributor is
//! the only writer under the move-keys lock, so conflicts are rare and
//! only ever mean "retry".

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use rand::Rng;

use crate::errors::{DdError, Result};
use crate::keyspace::{key_after, Key, KeyRange};
use crate::system_data::prefixed;

pub struct SystemDb {
    keyspace: Keyspace,
    data: PartitionHandle,
    commit_version: AtomicU64,
    commit_lock: Mutex<()>,
}

impl SystemDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let keyspace = fjall::Config::new(path).open()?;
        let data = keyspace.open_partition("system", PartitionCreateOptions::default())?;
        Ok(Arc::new(Self {
            keyspace,
            data,
            commit_version: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        }))
    }

    pub fn begin(&self) -> SystemTxn<'_> {
        SystemTxn {
            db: self,
            read_version: self.commit_version.load(Ordering::SeqCst),
            writes: BTreeMap::new(),
        }
    }

    /// Absorb a retryable transaction error with a short randomized
    /// back-off; anything else propagates to the caller.
    pub async fn on_error(&self, err: DdError) -> Result<()> {
        if !err.is_retryable() {
            return Err(err);
        }
        let jitter = rand::thread_rng().gen_range(0..20u64);
        tokio::time::sleep(Duration::from_millis(5 + jitter)).await;
        Ok(())
    }
}

pub struct RangeResult {
    pub rows: Vec<(Key, Vec<u8>)>,
    /// True when the scan was cut by `limit`/`byte_limit` before reaching
    /// the end of the requested range.
    pub more: bool,
}

/// A buffered-write transaction over the system store. Reads merge the
/// write set over the on-disk state (read-your-writes).
pub struct SystemTxn<'a> {
    db: &'a SystemDb,
    read_version: u64,
    writes: BTreeMap<Key, Option<Vec<u8>>>,
}

impl SystemTxn<'_> {
    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    fn check_version(&self) -> Result<()> {
        if self.db.commit_version.load(Ordering::SeqCst) != self.read_version {
            return Err(DdError::TransactionConflict);
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_version()?;
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        Ok(self.db.data.get(key)?.map(|v| v.to_vec()))
    }

    /// Ordered scan of `[begin, end)`, bounded by row count and byte size.
    pub fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        byte_limit: usize,
    ) -> Result<RangeResult> {
        self.check_version()?;
        let mut rows: Vec<(Key, Vec<u8>)> = Vec::new();
        let mut bytes = 0usize;

        let mut disk = self.db.data.range(begin.to_vec()..end.to_vec());
        let mut overlay = self.writes.range(begin.to_vec()..end.to_vec());
        let mut next_disk = Self::advance(&mut disk)?;
        let mut next_overlay = overlay.next();

        loop {
            if rows.len() >= limit || bytes >= byte_limit {
                let overlay_rest = next_overlay.map(|(_, v)| v.is_some()).unwrap_or(false)
                    || overlay.clone().any(|(_, v)| v.is_some());
                self.check_version()?;
                return Ok(RangeResult {
                    rows,
                    more: next_disk.is_some() || overlay_rest,
                });
            }
            match (next_disk.take(), next_overlay) {
                (None, None) => break,
                (Some((k, v)), None) => {
                    bytes += k.len() + v.len();
                    rows.push((k, v));
                    next_disk = Self::advance(&mut disk)?;
                }
                (None, Some((k, v))) => {
                    if let Some(v) = v {
                        bytes += k.len() + v.len();
                        rows.push((k.clone(), v.clone()));
                    }
                    next_overlay = overlay.next();
                }
                (Some((dk, dv)), Some((ok, ov))) => {
                    if dk < *ok {
                        bytes += dk.len() + dv.len();
                        rows.push((dk, dv));
                        next_disk = Self::advance(&mut disk)?;
                        next_overlay = Some((ok, ov));
                    } else {
                        if dk == *ok {
                            // Buffered write shadows the stored row.
                            next_disk = Self::advance(&mut disk)?;
                        } else {
                            next_disk = Some((dk, dv));
                        }
                        if let Some(v) = ov {
                            bytes += ok.len() + v.len();
                            rows.push((ok.clone(), v.clone()));
                        }
                        next_overlay = overlay.next();
                    }
                }
            }
        }
        self.check_version()?;
        Ok(RangeResult { rows, more: false })
    }

    /// Last entry at or below `key`, looking no lower than `floor_min`.
    pub fn get_floor(&self, floor_min: &[u8], key: &[u8]) -> Result<Option<(Key, Vec<u8>)>> {
        self.check_version()?;
        let upper = key_after(key);
        let mut disk = self.db.data.range(floor_min.to_vec()..upper.clone());
        let mut overlay = self.writes.range(floor_min.to_vec()..upper);
        let mut disk_back = Self::advance_back(&mut disk)?;
        let mut overlay_back = overlay.next_back();

        loop {
            match (disk_back.take(), overlay_back) {
                (None, None) => return Ok(None),
                (Some((k, v)), None) => return Ok(Some((k, v))),
                (None, Some((k, v))) => match v {
                    Some(v) => return Ok(Some((k.clone(), v.clone()))),
                    None => overlay_back = overlay.next_back(),
                },
                (Some((dk, dv)), Some((ok, ov))) => {
                    if *ok >= dk {
                        if *ok == dk {
                            disk_back = Self::advance_back(&mut disk)?;
                        } else {
                            disk_back = Some((dk, dv));
                        }
                        match ov {
                            Some(v) => return Ok(Some((ok.clone(), v.clone()))),
                            None => overlay_back = overlay.next_back(),
                        }
                    } else {
                        return Ok(Some((dk, dv)));
                    }
                }
            }
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn clear(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    /// Clear every key in `[begin, end)`. The system keyspace is small, so
    /// range clears enumerate stored keys into point tombstones.
    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.check_version()?;
        let mut stored = Vec::new();
        for item in self.db.data.range(begin.to_vec()..end.to_vec()) {
            let (k, _) = item?;
            stored.push(k.to_vec());
        }
        let buffered: Vec<Key> = self
            .writes
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for k in stored.into_iter().chain(buffered) {
            self.writes.insert(k, None);
        }
        Ok(())
    }

    /// Commit buffered writes. Fails with a retryable conflict when any
    /// other transaction committed since this one began. Read-only
    /// transactions never conflict.
    pub fn commit(self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let _guard = self.db.commit_lock.lock().expect("commit lock poisoned");
        if self.db.commit_version.load(Ordering::SeqCst) != self.read_version {
            return Err(DdError::TransactionConflict);
        }
        let mut batch = self.db.keyspace.batch();
        for (key, write) in &self.writes {
            match write {
                Some(value) => batch.insert(&self.db.data, key.clone(), value.clone()),
                None => batch.remove(&self.db.data, key.clone()),
            }
        }
        batch.commit()?;
        self.db.commit_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn advance(
        iter: &mut impl Iterator<Item = fjall::Result<(fjall::Slice, fjall::Slice)>>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        match iter.next() {
            None => Ok(None),
            Some(item) => {
                let (k, v) = item?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
        }
    }

    fn advance_back(
        iter: &mut impl DoubleEndedIterator<Item = fjall::Result<(fjall::Slice, fjall::Slice)>>,
    ) -> Result<Option<(Key, Vec<u8>)>> {
        match iter.next_back() {
            None => Ok(None),
            Some(item) => {
                let (k, v) = item?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
        }
    }
}

/// Read the boundary rows of a range-map key family covering `range`.
///
/// The result is `[(range.begin, v0), (k1, v1), ...]` where `v_i` covers
/// `[k_i, k_{i+1})`; the final row is either a cut boundary (when the scan
/// hit `limit`/`byte_limit`, so the walk resumes there) or `range.end`.
/// Row keys have the family prefix stripped. Always returns at least two
/// rows for a non-empty range.
pub fn krm_get_ranges(
    txn: &SystemTxn<'_>,
    prefix: &[u8],
    range: &KeyRange,
    limit: usize,
    byte_limit: usize,
) -> Result<Vec<(Key, Vec<u8>)>> {
    assert!(!range.is_empty(), "krm_get_ranges on empty range");
    let begin_key = prefixed(prefix, &range.begin);
    let floor_value = txn
        .get_floor(prefix, &begin_key)?
        .map(|(_, v)| v)
        .unwrap_or_default();
    let mut rows = vec![(range.begin.clone(), floor_value)];

    let scan = txn.get_range(
        &key_after(&begin_key),
        &prefixed(prefix, &range.end),
        limit,
        byte_limit,
    )?;
    let cut = scan.more;
    for (k, v) in scan.rows {
        rows.push((k[prefix.len()..].to_vec(), v));
    }
    if !cut {
        rows.push((range.end.clone(), Vec::new()));
    }
    Ok(rows)
}

/// Assign `value` to `[range.begin, range.end)` of a range-map key family,
/// preserving the assignment beyond `range.end`.
pub fn krm_set(
    txn: &mut SystemTxn<'_>,
    prefix: &[u8],
    range: &KeyRange,
    value: &[u8],
) -> Result<()> {
    if range.is_empty() {
        return Ok(());
    }
    let end_key = prefixed(prefix, &range.end);
    let old_end_value = txn
        .get_floor(prefix, &end_key)?
        .map(|(_, v)| v)
        .unwrap_or_default();
    let interior = txn.get_range(
        &key_after(&prefixed(prefix, &range.begin)),
        &end_key,
        usize::MAX,
        usize::MAX,
    )?;
    for (k, _) in interior.rows {
        txn.clear(&k);
    }
    if txn.get(&end_key)?.is_none() {
        txn.set(&end_key, &old_end_value);
    }
    txn.set(&prefixed(prefix, &range.begin), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::all_keys;

    fn open_temp() -> (tempfile::TempDir, Arc<SystemDb>) {
        let dir = tempfile::tempdir().unwrap();
        let db = SystemDb::open(dir.path()).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn read_your_writes_and_commit() {
        let (_dir, db) = open_temp();
        let mut tr = db.begin();
        tr.set(b"a", b"1");
        assert_eq!(tr.get(b"a").unwrap(), Some(b"1".to_vec()));
        tr.commit().unwrap();

        let tr = db.begin();
        assert_eq!(tr.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn racing_commit_conflicts_and_reads_go_stale() {
        let (_dir, db) = open_temp();
        let mut loser = db.begin();
        loser.set(b"k", b"loser");

        let mut winner = db.begin();
        winner.set(b"k", b"winner");
        winner.commit().unwrap();

        assert_eq!(loser.get(b"k").unwrap_err(), DdError::TransactionConflict);
        assert_eq!(loser.commit().unwrap_err(), DdError::TransactionConflict);
    }

    #[tokio::test]
    async fn read_only_transactions_never_conflict() {
        let (_dir, db) = open_temp();
        let reader = db.begin();
        let mut writer = db.begin();
        writer.set(b"k", b"v");
        writer.commit().unwrap();
        reader.commit().unwrap();
    }

    #[tokio::test]
    async fn get_range_merges_overlay_and_disk() {
        let (_dir, db) = open_temp();
        let mut tr = db.begin();
        tr.set(b"b", b"1");
        tr.set(b"d", b"2");
        tr.commit().unwrap();

        let mut tr = db.begin();
        tr.set(b"c", b"3");
        tr.clear(b"d");
        let got = tr.get_range(b"a", b"z", 100, usize::MAX).unwrap();
        assert!(!got.more);
        assert_eq!(
            got.rows,
            vec![
                (b"b".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn get_range_row_limit_reports_more() {
        let (_dir, db) = open_temp();
        let mut tr = db.begin();
        for k in [b"a", b"b", b"c"] {
            tr.set(k, b"v");
        }
        tr.commit().unwrap();

        let tr = db.begin();
        let got = tr.get_range(b"a", b"z", 2, usize::MAX).unwrap();
        assert_eq!(got.rows.len(), 2);
        assert!(got.more);
    }

    #[tokio::test]
    async fn get_floor_prefers_overlay() {
        let (_dir, db) = open_temp();
        let mut tr = db.begin();
        tr.set(b"b", b"disk");
        tr.commit().unwrap();

        let mut tr = db.begin();
        tr.set(b"b", b"overlay");
        let (k, v) = tr.get_floor(b"a", b"c").unwrap().unwrap();
        assert_eq!((k, v), (b"b".to_vec(), b"overlay".to_vec()));

        tr.clear(b"b");
        assert_eq!(tr.get_floor(b"a", b"c").unwrap(), None);
    }

    #[tokio::test]
    async fn krm_round_trip_with_slicing() {
        let (_dir, db) = open_temp();
        let prefix = b"\xff/testmap/";
        let mut tr = db.begin();
        krm_set(&mut tr, prefix, &all_keys(), b"base").unwrap();
        krm_set(&mut tr, prefix, &KeyRange::new(&b"f"[..], &b"m"[..]), b"mid").unwrap();
        tr.commit().unwrap();

        let tr = db.begin();
        let rows = krm_get_ranges(&tr, prefix, &all_keys(), 100, usize::MAX).unwrap();
        let decoded: Vec<(Key, Vec<u8>)> = rows;
        assert_eq!(decoded[0], (b"".to_vec(), b"base".to_vec()));
        assert_eq!(decoded[1], (b"f".to_vec(), b"mid".to_vec()));
        assert_eq!(decoded[2], (b"m".to_vec(), b"base".to_vec()));
        assert_eq!(decoded.last().unwrap().0, all_keys().end);

        // A row-limited read cuts at a boundary the next read resumes from.
        let sliced = krm_get_ranges(&tr, prefix, &all_keys(), 1, usize::MAX).unwrap();
        assert_eq!(sliced.len(), 2);
        let resume = sliced.last().unwrap().0.clone();
        assert!(resume < all_keys().end);
        let rest = krm_get_ranges(
            &tr,
            prefix,
            &KeyRange::new(resume, all_keys().end),
            100,
            usize::MAX,
        )
        .unwrap();
        assert_eq!(rest.last().unwrap().0, all_keys().end);
    }
}
