//! Reconstruction of the complete shard / team / in-flight-move picture
//! from the persisted system keyspace, consistent with the move-keys lock.
//!
//! The scan runs in two phases. Phase A is a single retriable transaction
//! reading the healthy-zone override, the distribution mode (short-circuit
//! when disabled), the worker and server lists, and the data-move map.
//! Phase B walks the `keyServers/` boundary map in bounded slices,
//! rechecking the lock between slices, and ends with a sentinel shard so
//! consumers can iterate boundary pairs uniformly.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::enabled::DdEnabledState;
use crate::errors::Result;
use crate::keyspace::{all_keys, Key, KeyRange, RangeMap};
use crate::lock::{check_move_keys_lock_read_only, MoveKeysLock};
use crate::system_data::{
    build_tag_index, decode_data_move, decode_dd_mode, decode_healthy_zone,
    decode_process_data, decode_server_list_entry, prefix_range, DataMoveMetaData, ProcessClass,
    ServerListEntry, DATA_DISTRIBUTION_MODE_KEY, DATA_MOVE_PREFIX, HEALTHY_ZONE_KEY,
    IGNORE_SS_FAILURES_ZONE, KEY_SERVERS_PREFIX, SERVER_LIST_PREFIX, SERVER_TAG_PREFIX,
    WORKER_LIST_PREFIX,
};
use crate::system_db::{krm_get_ranges, SystemDb};
use crate::{Uid, ANONYMOUS_SHARD_ID};
use crate::distributor::Knobs;

/// One shard as reconstructed from a `keyServers/` boundary. The range is
/// `[key, next shard's key)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdShardInfo {
    pub key: Key,
    pub primary_src: Vec<Uid>,
    pub remote_src: Vec<Uid>,
    pub primary_dest: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
    pub has_dest: bool,
    pub src_id: Uid,
    pub dest_id: Uid,
}

impl DdShardInfo {
    /// A boundary-only record with no servers, used as the trailing
    /// sentinel.
    pub fn boundary(key: Key) -> Self {
        Self {
            key,
            primary_src: Vec::new(),
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            has_dest: false,
            src_id: ANONYMOUS_SHARD_ID,
            dest_id: ANONYMOUS_SHARD_ID,
        }
    }
}

/// An in-flight or orphaned relocation rediscovered from `dataMoves/`,
/// with its server sets partitioned per DC.
#[derive(Clone, Debug)]
pub struct DataMove {
    pub meta: DataMoveMetaData,
    pub primary_src: Vec<Uid>,
    pub remote_src: Vec<Uid>,
    pub primary_dest: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
    pub valid: bool,
    pub cancelled: bool,
}

impl DataMove {
    /// Placeholder for ranges with no tracked move.
    pub fn invalid() -> Self {
        Self {
            meta: DataMoveMetaData {
                id: ANONYMOUS_SHARD_ID,
                range: KeyRange::default(),
                src: Vec::new(),
                dest: Vec::new(),
                phase: crate::system_data::DataMovePhase::Prepare,
            },
            primary_src: Vec::new(),
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            valid: false,
            cancelled: false,
        }
    }

    pub fn from_meta(
        meta: DataMoveMetaData,
        server_dc: &HashMap<Uid, Option<String>>,
        remote_dc_ids: &[Option<String>],
    ) -> Self {
        let mut mv = Self {
            meta,
            primary_src: Vec::new(),
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            valid: true,
            cancelled: false,
        };
        for id in mv.meta.src.clone() {
            let dc = server_dc.get(&id).cloned().unwrap_or(None);
            if remote_dc_ids.contains(&dc) {
                mv.remote_src.push(id);
            } else {
                mv.primary_src.push(id);
            }
        }
        for id in mv.meta.dest.clone() {
            let dc = server_dc.get(&id).cloned().unwrap_or(None);
            if remote_dc_ids.contains(&dc) {
                mv.remote_dest.push(id);
            } else {
                mv.primary_dest.push(id);
            }
        }
        mv.primary_src.sort();
        mv.remote_src.sort();
        mv.primary_dest.sort();
        mv.remote_dest.sort();
        mv
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Cross-check a shard against this covering move. Violations mark the
    /// move cancelled and log a validation error; they never panic the
    /// scan; recovery is the orchestrator's cancel path.
    pub fn validate_shard(&mut self, shard: &DdShardInfo, range: &KeyRange) {
        if !self.valid {
            if shard.has_dest && shard.dest_id != ANONYMOUS_SHARD_ID {
                tracing::error!(
                    range = ?range,
                    reason = "data move missing",
                    shard_primary_dest = ?shard.primary_dest,
                    shard_remote_dest = ?shard.remote_dest,
                    "data move validation error"
                );
            }
            return;
        }

        assert!(
            self.meta.range.contains_range(range),
            "data move does not cover its shard"
        );

        if !shard.has_dest {
            tracing::error!(
                range = ?range,
                reason = "shard missing destination",
                data_move = ?self.meta,
                "data move validation error"
            );
            self.cancelled = true;
            return;
        }

        if shard.dest_id != self.meta.id {
            tracing::error!(
                range = ?range,
                reason = "data move id mismatch",
                data_move = ?self.meta,
                shard_move_id = %shard.dest_id,
                "data move validation error"
            );
            self.cancelled = true;
            return;
        }

        if !is_subset(&shard.primary_dest, &self.primary_dest)
            || !is_subset(&shard.remote_dest, &self.remote_dest)
        {
            tracing::error!(
                range = ?range,
                reason = "destination set mismatch",
                data_move = ?self.meta,
                shard_primary_dest = ?shard.primary_dest,
                shard_remote_dest = ?shard.remote_dest,
                "data move validation error"
            );
            self.cancelled = true;
        }
    }
}

/// Both sides sorted; true when every element of `inner` is in `outer`.
fn is_subset(inner: &[Uid], outer: &[Uid]) -> bool {
    inner.iter().all(|id| outer.binary_search(id).is_ok())
}

/// The consistent snapshot the orchestrator seeds its epoch from.
pub struct InitialDataDistribution {
    pub mode: i32,
    pub init_healthy_zone_value: Option<String>,
    /// All registered servers, TSS twins last; TSS never join teams.
    pub all_servers: Vec<(ServerListEntry, ProcessClass)>,
    /// Ordered by range, ending with a boundary sentinel at
    /// `all_keys().end`.
    pub shards: Vec<DdShardInfo>,
    pub primary_teams: BTreeSet<Vec<Uid>>,
    pub remote_teams: BTreeSet<Vec<Uid>>,
    pub data_move_map: RangeMap<Arc<Mutex<DataMove>>>,
}

impl InitialDataDistribution {
    fn empty() -> Self {
        Self {
            mode: 1,
            init_healthy_zone_value: None,
            all_servers: Vec::new(),
            shards: Vec::new(),
            primary_teams: BTreeSet::new(),
            remote_teams: BTreeSet::new(),
            data_move_map: RangeMap::new(all_keys(), Arc::new(Mutex::new(DataMove::invalid()))),
        }
    }
}

/// Read `keyServers/`, reconstructing the unique team set and every shard,
/// plus the data-move map discovered in Phase A.
pub async fn get_initial_data_distribution(
    db: &Arc<SystemDb>,
    dd_id: Uid,
    lock: &MoveKeysLock,
    remote_dc_ids: &[Option<String>],
    enabled: &DdEnabledState,
    knobs: &Knobs,
) -> Result<InitialDataDistribution> {
    let mut result = InitialDataDistribution::empty();
    let mut server_dc: HashMap<Uid, Option<String>> = HashMap::new();
    let mut tss_servers: Vec<(ServerListEntry, ProcessClass)> = Vec::new();

    // Phase A: one transaction for everything except keyServers. Retried
    // whole, so partial state is discarded before each attempt.
    let mut succeeded;
    loop {
        server_dc.clear();
        tss_servers.clear();
        result = InitialDataDistribution::empty();
        succeeded = false;
        let tr = db.begin();
        let attempt = (|| -> Result<bool> {
            if let Some(value) = tr.get(HEALTHY_ZONE_KEY)? {
                let zone = decode_healthy_zone(&value)?;
                if zone.expiration_version > tr.read_version()
                    || zone.zone_id == IGNORE_SS_FAILURES_ZONE
                {
                    result.init_healthy_zone_value = Some(zone.zone_id);
                }
            }

            result.mode = decode_dd_mode(tr.get(DATA_DISTRIBUTION_MODE_KEY)?.as_deref());
            if result.mode == 0 || !enabled.is_enabled() {
                // Disabled persistently (mode = 0) or transiently.
                tracing::debug!(dd_id = %dd_id, "initial scan found data distribution disabled");
                return Ok(false);
            }

            let workers_range = prefix_range(WORKER_LIST_PREFIX);
            let workers = tr.get_range(
                &workers_range.begin,
                &workers_range.end,
                usize::MAX,
                usize::MAX,
            )?;
            let mut class_by_process: HashMap<String, ProcessClass> = HashMap::new();
            for (_, value) in &workers.rows {
                let data = decode_process_data(value)?;
                class_by_process.insert(data.process_id.clone(), data.class);
            }

            let servers_range = prefix_range(SERVER_LIST_PREFIX);
            let servers = tr.get_range(
                &servers_range.begin,
                &servers_range.end,
                usize::MAX,
                usize::MAX,
            )?;
            for (_, value) in &servers.rows {
                let entry = decode_server_list_entry(value)?;
                let class = entry
                    .locality
                    .process_id
                    .as_ref()
                    .and_then(|p| class_by_process.get(p).copied())
                    .unwrap_or_default();
                if entry.is_tss {
                    tss_servers.push((entry, class));
                } else {
                    server_dc.insert(entry.id, entry.locality.dc_id.clone());
                    result.all_servers.push((entry, class));
                }
            }

            let moves_range = prefix_range(DATA_MOVE_PREFIX);
            let moves = tr.get_range(
                &moves_range.begin,
                &moves_range.end,
                usize::MAX,
                usize::MAX,
            )?;
            for (_, value) in &moves.rows {
                let meta = decode_data_move(value)?;
                let range = meta.range.clone();
                let mv = DataMove::from_meta(meta, &server_dc, remote_dc_ids);
                // No two valid moves may intersect.
                for (_, existing) in result.data_move_map.intersecting(&range) {
                    assert!(
                        !existing.lock().unwrap().valid,
                        "overlapping valid data moves"
                    );
                }
                result
                    .data_move_map
                    .insert(&range, Arc::new(Mutex::new(mv)));
            }
            Ok(true)
        })();

        match attempt {
            Ok(proceed) => {
                succeeded = true;
                if !proceed {
                    return Ok(result);
                }
                break;
            }
            Err(err) => {
                db.on_error(err).await?;
                // Retrying after Phase A began modifying the result is a
                // bug; the clears above make each attempt start fresh.
                assert!(!succeeded);
                tracing::debug!(dd_id = %dd_id, "initial scan retrying server list read");
            }
        }
    }

    // Phase B: keyServers may be too large for one read, so walk it in
    // bounded slices; each slice begins where the previous left off and
    // revalidates the lock first.
    let mut team_cache: HashMap<Vec<Uid>, (Vec<Uid>, Vec<Uid>)> = HashMap::new();
    let mut begin_key = all_keys().begin;
    while begin_key < all_keys().end {
        loop {
            succeeded = false;
            let tr = db.begin();
            let attempt = (|| -> Result<Vec<(Key, Vec<u8>)>> {
                check_move_keys_lock_read_only(&tr, lock, enabled)?;
                let tag_range = prefix_range(SERVER_TAG_PREFIX);
                let tag_rows = tr
                    .get_range(&tag_range.begin, &tag_range.end, usize::MAX, usize::MAX)?
                    .rows;
                let tag_index = build_tag_index(&tag_rows)?;
                let rows = krm_get_ranges(
                    &tr,
                    KEY_SERVERS_PREFIX,
                    &KeyRange::new(begin_key.clone(), all_keys().end),
                    knobs.move_keys_krm_limit,
                    knobs.move_keys_krm_limit_bytes,
                )?;

                let mut decoded = Vec::with_capacity(rows.len());
                for (key, value) in &rows[..rows.len() - 1] {
                    let (src, dest, src_id, dest_id) =
                        crate::system_data::decode_key_servers_value(&tag_index, value)?;
                    decoded.push((key.clone(), src, dest, src_id, dest_id));
                }

                for (key, src, dest, src_id, dest_id) in decoded {
                    let mut info = DdShardInfo::boundary(key);
                    info.src_id = src_id;
                    info.dest_id = dest_id;
                    if !remote_dc_ids.is_empty() {
                        let (primary, remote) = partition_team(
                            &mut team_cache,
                            &src,
                            &server_dc,
                            remote_dc_ids,
                            &mut result.primary_teams,
                            &mut result.remote_teams,
                        );
                        info.primary_src = primary;
                        info.remote_src = remote;
                        if !dest.is_empty() {
                            info.has_dest = true;
                            let (primary, remote) = partition_team(
                                &mut team_cache,
                                &dest,
                                &server_dc,
                                remote_dc_ids,
                                &mut result.primary_teams,
                                &mut result.remote_teams,
                            );
                            info.primary_dest = primary;
                            info.remote_dest = remote;
                        }
                    } else {
                        info.primary_src = src.clone();
                        if team_cache.insert(src.clone(), (src.clone(), Vec::new())).is_none() {
                            result.primary_teams.insert(src);
                        }
                        if !dest.is_empty() {
                            info.has_dest = true;
                            info.primary_dest = dest.clone();
                            if team_cache
                                .insert(dest.clone(), (dest.clone(), Vec::new()))
                                .is_none()
                            {
                                result.primary_teams.insert(dest);
                            }
                        }
                    }
                    result.shards.push(info);
                }
                Ok(rows)
            })();

            match attempt {
                Ok(rows) => {
                    succeeded = true;
                    assert!(rows.len() > 1);
                    begin_key = rows.last().expect("non-empty slice").0.clone();
                    break;
                }
                Err(err) => {
                    tracing::debug!(dd_id = %dd_id, error = %err, "initial scan retrying key servers slice");
                    db.on_error(err).await?;
                    assert!(!succeeded);
                }
            }
        }
        tokio::task::yield_now().await;
    }

    // A boundary-only shard at the end of the keyspace makes range-pair
    // iteration uniform for the orchestrator.
    result.shards.push(DdShardInfo::boundary(all_keys().end));

    if knobs.shard_encode_location_metadata {
        for i in 0..result.shards.len() - 1 {
            let range = KeyRange::new(
                result.shards[i].key.clone(),
                result.shards[i + 1].key.clone(),
            );
            let mv = result.data_move_map.get(&range.begin).clone();
            mv.lock().unwrap().validate_shard(&result.shards[i], &range);
        }
    }

    // TSS twins join the server list only after teams were built, so they
    // never participate in a team.
    result.all_servers.extend(tss_servers);

    Ok(result)
}

/// Partition a persisted team into its primary and remote halves, caching
/// the split and recording each half in the unique team sets.
fn partition_team(
    team_cache: &mut HashMap<Vec<Uid>, (Vec<Uid>, Vec<Uid>)>,
    servers: &[Uid],
    server_dc: &HashMap<Uid, Option<String>>,
    remote_dc_ids: &[Option<String>],
    primary_teams: &mut BTreeSet<Vec<Uid>>,
    remote_teams: &mut BTreeSet<Vec<Uid>>,
) -> (Vec<Uid>, Vec<Uid>) {
    if let Some((primary, remote)) = team_cache.get(servers) {
        return (primary.clone(), remote.clone());
    }
    let mut primary = Vec::new();
    let mut remote = Vec::new();
    for &id in servers {
        let dc = server_dc.get(&id).cloned().unwrap_or(None);
        if remote_dc_ids.contains(&dc) {
            remote.push(id);
        } else {
            primary.push(id);
        }
    }
    primary_teams.insert(primary.clone());
    remote_teams.insert(remote.clone());
    team_cache.insert(servers.to_vec(), (primary.clone(), remote.clone()));
    (primary, remote)
}

/// Every registered server joined with its process class, TSS included.
pub async fn get_server_list_and_process_classes(
    db: &Arc<SystemDb>,
) -> Result<Vec<(ServerListEntry, ProcessClass)>> {
    loop {
        let tr = db.begin();
        let attempt = (|| -> Result<Vec<(ServerListEntry, ProcessClass)>> {
            let workers_range = prefix_range(WORKER_LIST_PREFIX);
            let workers = tr.get_range(
                &workers_range.begin,
                &workers_range.end,
                usize::MAX,
                usize::MAX,
            )?;
            let mut class_by_process = HashMap::new();
            for (_, value) in &workers.rows {
                let data = decode_process_data(value)?;
                class_by_process.insert(data.process_id.clone(), data.class);
            }
            let servers_range = prefix_range(SERVER_LIST_PREFIX);
            let servers = tr.get_range(
                &servers_range.begin,
                &servers_range.end,
                usize::MAX,
                usize::MAX,
            )?;
            let mut out = Vec::with_capacity(servers.rows.len());
            for (_, value) in &servers.rows {
                let entry = decode_server_list_entry(value)?;
                let class = entry
                    .locality
                    .process_id
                    .as_ref()
                    .and_then(|p| class_by_process.get(p).copied())
                    .unwrap_or_default();
                out.push((entry, class));
            }
            Ok(out)
        })();
        match attempt {
            Ok(out) => return Ok(out),
            Err(err) => db.on_error(err).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_data::DataMovePhase;

    fn shard(dest_id: Uid, primary_dest: &[u64]) -> DdShardInfo {
        let mut info = DdShardInfo::boundary(b"b".to_vec());
        info.has_dest = true;
        info.dest_id = dest_id;
        info.primary_dest = primary_dest.iter().map(|&i| Uid::new(i, 0)).collect();
        info
    }

    fn tracked_move(id: Uid, primary_dest: &[u64]) -> DataMove {
        let dest: Vec<Uid> = primary_dest.iter().map(|&i| Uid::new(i, 0)).collect();
        let meta = DataMoveMetaData {
            id,
            range: KeyRange::new(&b"a"[..], &b"m"[..]),
            src: Vec::new(),
            dest: dest.clone(),
            phase: DataMovePhase::Running,
        };
        DataMove::from_meta(meta, &HashMap::new(), &[])
    }

    #[test]
    fn validate_accepts_matching_move() {
        let id = Uid::new(0xabc, 0);
        let mut mv = tracked_move(id, &[1, 2, 3]);
        let range = KeyRange::new(&b"b"[..], &b"c"[..]);
        mv.validate_shard(&shard(id, &[1, 2]), &range);
        assert!(!mv.cancelled);
    }

    #[test]
    fn validate_cancels_on_dest_set_mismatch() {
        let id = Uid::new(0xabc, 0);
        let mut mv = tracked_move(id, &[1, 2]);
        let range = KeyRange::new(&b"b"[..], &b"c"[..]);
        // The shard claims a destination server the move does not carry.
        mv.validate_shard(&shard(id, &[1, 4]), &range);
        assert!(mv.cancelled);
    }

    #[test]
    fn validate_cancels_on_id_mismatch() {
        let mut mv = tracked_move(Uid::new(1, 0), &[1, 2]);
        let range = KeyRange::new(&b"b"[..], &b"c"[..]);
        mv.validate_shard(&shard(Uid::new(2, 0), &[1]), &range);
        assert!(mv.cancelled);
    }

    #[test]
    fn validate_cancels_when_shard_lost_its_dest() {
        let mut mv = tracked_move(Uid::new(1, 0), &[1, 2]);
        let range = KeyRange::new(&b"b"[..], &b"c"[..]);
        let mut no_dest = shard(Uid::new(1, 0), &[]);
        no_dest.has_dest = false;
        mv.validate_shard(&no_dest, &range);
        assert!(mv.cancelled);
    }

    #[test]
    fn validate_ignores_shards_without_tracked_move() {
        let mut mv = DataMove::invalid();
        let range = KeyRange::new(&b"b"[..], &b"c"[..]);
        mv.validate_shard(&shard(Uid::new(7, 0), &[1]), &range);
        assert!(!mv.cancelled);
        assert!(!mv.valid);
    }

    #[test]
    fn move_partitioning_respects_remote_dcs() {
        let mut server_dc = HashMap::new();
        server_dc.insert(Uid::new(1, 0), Some("east".to_string()));
        server_dc.insert(Uid::new(2, 0), Some("west".to_string()));
        let meta = DataMoveMetaData {
            id: Uid::new(5, 0),
            range: KeyRange::new(&b"a"[..], &b"m"[..]),
            src: vec![Uid::new(1, 0), Uid::new(2, 0)],
            dest: vec![Uid::new(2, 0)],
            phase: DataMovePhase::Running,
        };
        let mv = DataMove::from_meta(meta, &server_dc, &[Some("west".to_string())]);
        assert_eq!(mv.primary_src, vec![Uid::new(1, 0)]);
        assert_eq!(mv.remote_src, vec![Uid::new(2, 0)]);
        assert_eq!(mv.remote_dest, vec![Uid::new(2, 0)]);
        assert!(mv.primary_dest.is_empty());
    }
}
