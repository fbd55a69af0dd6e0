//! The slice of the move-keys contract the distributor invokes directly:
//! removing a permanently failed storage server and re-homing any ranges
//! it uniquely owned. Every transaction revalidates the move-keys lock
//! before writing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::enabled::DdEnabledState;
use crate::errors::{DdError, Result};
use crate::keyspace::{all_keys, KeyRange};
use crate::lock::{check_move_keys_lock_read_only, MoveKeysLock};
use crate::system_data::{
    build_tag_index, decode_key_servers_value, encode_key_servers_value, prefix_range, uid_key,
    KeyServersValue, KEY_SERVERS_PREFIX, SERVER_LIST_PREFIX, SERVER_TAG_PREFIX,
};
use crate::system_db::{krm_get_ranges, krm_set, SystemDb, SystemTxn};
use crate::{Uid, ANONYMOUS_SHARD_ID};

/// Rows per cleanup transaction; keeps each commit bounded.
const REMOVE_SERVER_KRM_LIMIT: usize = 100;

/// Strip `server` from every `keyServers/` assignment. Ranges it uniquely
/// owned are reassigned to `team_for_dropped_range`, chosen from a healthy
/// team by the caller.
pub async fn remove_keys_from_failed_server(
    db: &Arc<SystemDb>,
    lock: &MoveKeysLock,
    enabled: &Arc<DdEnabledState>,
    server: Uid,
    team_for_dropped_range: Vec<Uid>,
) -> Result<()> {
    tracing::warn!(
        server = %server,
        replacement_team = ?team_for_dropped_range,
        "removing keys from failed storage server"
    );
    let mut begin_key = all_keys().begin;
    while begin_key < all_keys().end {
        loop {
            let mut tr = db.begin();
            let attempt = rewrite_slice(
                &mut tr,
                lock,
                enabled,
                server,
                &team_for_dropped_range,
                &begin_key,
            );
            match attempt {
                Ok(next_key) => match tr.commit() {
                    Ok(()) => {
                        begin_key = next_key;
                        break;
                    }
                    Err(err) => db.on_error(err).await?,
                },
                Err(err) => db.on_error(err).await?,
            }
        }
    }
    Ok(())
}

fn rewrite_slice(
    tr: &mut SystemTxn<'_>,
    lock: &MoveKeysLock,
    enabled: &Arc<DdEnabledState>,
    server: Uid,
    team_for_dropped_range: &[Uid],
    begin_key: &[u8],
) -> Result<Vec<u8>> {
    check_move_keys_lock_read_only(tr, lock, enabled)?;
    let tag_range = prefix_range(SERVER_TAG_PREFIX);
    let tag_rows = tr
        .get_range(&tag_range.begin, &tag_range.end, usize::MAX, usize::MAX)?
        .rows;
    let tag_index = build_tag_index(&tag_rows)?;
    let mut tag_of: BTreeMap<Uid, u64> = BTreeMap::new();
    for (tag, id) in &tag_index {
        tag_of.insert(*id, *tag);
    }
    let replacement_tags = tags_for(&tag_of, team_for_dropped_range)?;

    let rows = krm_get_ranges(
        tr,
        KEY_SERVERS_PREFIX,
        &KeyRange::new(begin_key.to_vec(), all_keys().end),
        REMOVE_SERVER_KRM_LIMIT,
        usize::MAX,
    )?;
    for window in rows.windows(2) {
        let (key, value) = &window[0];
        let range = KeyRange::new(key.clone(), window[1].0.clone());
        let (src, dest, src_id, _dest_id) = decode_key_servers_value(&tag_index, value)?;
        if !src.contains(&server) && !dest.contains(&server) {
            continue;
        }
        let new_value = if src.iter().all(|id| *id == server) {
            // The failed server was the only source: hand the range to the
            // replacement team and drop any in-flight destination.
            KeyServersValue {
                src_tags: replacement_tags.clone(),
                dest_tags: Vec::new(),
                src_id: ANONYMOUS_SHARD_ID,
                dest_id: ANONYMOUS_SHARD_ID,
            }
        } else {
            let keep = |ids: &[Uid]| -> Result<Vec<u64>> {
                let kept: Vec<Uid> = ids.iter().copied().filter(|id| *id != server).collect();
                tags_for(&tag_of, &kept)
            };
            KeyServersValue {
                src_tags: keep(&src)?,
                dest_tags: keep(&dest)?,
                src_id,
                dest_id: ANONYMOUS_SHARD_ID,
            }
        };
        krm_set(
            tr,
            KEY_SERVERS_PREFIX,
            &range,
            &encode_key_servers_value(&new_value),
        )?;
    }
    Ok(rows.last().expect("non-empty slice").0.clone())
}

fn tags_for(tag_of: &BTreeMap<Uid, u64>, ids: &[Uid]) -> Result<Vec<u64>> {
    ids.iter()
        .map(|id| {
            tag_of
                .get(id)
                .copied()
                .ok_or_else(|| DdError::CorruptMetadata(format!("server {id} has no tag")))
        })
        .collect()
}

/// Drop the failed server's registration and tag. Callers must have
/// already removed its keys.
pub async fn remove_storage_server(
    db: &Arc<SystemDb>,
    lock: &MoveKeysLock,
    enabled: &Arc<DdEnabledState>,
    server: Uid,
) -> Result<()> {
    tracing::warn!(server = %server, "removing storage server registration");
    loop {
        let mut tr = db.begin();
        let attempt = (|| -> Result<()> {
            check_move_keys_lock_read_only(&tr, lock, enabled)?;
            tr.clear(&uid_key(SERVER_LIST_PREFIX, server));
            tr.clear(&uid_key(SERVER_TAG_PREFIX, server));
            Ok(())
        })();
        match attempt.and_then(|()| tr.commit()) {
            Ok(()) => return Ok(()),
            Err(err) => db.on_error(err).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::take_move_keys_lock;
    use crate::system_data::encode_server_tag;

    async fn seed(db: &Arc<SystemDb>, servers: &[(Uid, u64)]) {
        let mut tr = db.begin();
        for (id, tag) in servers {
            tr.set(&uid_key(SERVER_TAG_PREFIX, *id), &encode_server_tag(*tag));
        }
        tr.commit().unwrap();
    }

    fn seed_range(db: &Arc<SystemDb>, range: &KeyRange, src_tags: Vec<u64>) {
        let mut tr = db.begin();
        let value = encode_key_servers_value(&KeyServersValue {
            src_tags,
            dest_tags: Vec::new(),
            src_id: ANONYMOUS_SHARD_ID,
            dest_id: ANONYMOUS_SHARD_ID,
        });
        krm_set(&mut tr, KEY_SERVERS_PREFIX, range, &value).unwrap();
        tr.commit().unwrap();
    }

    #[tokio::test]
    async fn solely_owned_ranges_move_to_the_replacement_team() {
        let dir = tempfile::tempdir().unwrap();
        let db = SystemDb::open(dir.path()).unwrap();
        let enabled = Arc::new(DdEnabledState::new());
        let failed = Uid::new(1, 0);
        let healthy = [Uid::new(2, 0), Uid::new(3, 0)];
        seed(&db, &[(failed, 1), (healthy[0], 2), (healthy[1], 3)]).await;
        seed_range(&db, &all_keys(), vec![2, 3]);
        seed_range(&db, &KeyRange::new(&b"d"[..], &b"m"[..]), vec![1]);
        seed_range(&db, &KeyRange::new(&b"m"[..], &b"q"[..]), vec![1, 2]);

        let lock = take_move_keys_lock(&db, Uid::new(9, 9)).await.unwrap();
        remove_keys_from_failed_server(&db, &lock, &enabled, failed, healthy.to_vec())
            .await
            .unwrap();

        let tr = db.begin();
        let tag_range = prefix_range(SERVER_TAG_PREFIX);
        let tag_index = build_tag_index(
            &tr.get_range(&tag_range.begin, &tag_range.end, usize::MAX, usize::MAX)
                .unwrap()
                .rows,
        )
        .unwrap();
        let rows = krm_get_ranges(&tr, KEY_SERVERS_PREFIX, &all_keys(), 100, usize::MAX).unwrap();
        for window in rows.windows(2) {
            let (src, dest, _, _) = decode_key_servers_value(&tag_index, &window[0].1).unwrap();
            assert!(!src.contains(&failed), "src still holds failed server");
            assert!(!dest.contains(&failed));
            if window[0].0 == b"d".to_vec() {
                assert_eq!(src, healthy.to_vec());
            }
        }

        remove_storage_server(&db, &lock, &enabled, failed).await.unwrap();
        let tr = db.begin();
        assert!(tr.get(&uid_key(SERVER_TAG_PREFIX, failed)).unwrap().is_none());
    }
}
