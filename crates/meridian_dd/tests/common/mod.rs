//! Shared fixtures for integration tests: a temp-dir system store seeded
//! the way the commit pipeline would leave it.

#![allow(dead_code)]

use std::sync::Arc;

use meridian_dd::keyspace::{all_keys, KeyRange};
use meridian_dd::system_data::{
    encode_data_move, encode_database_configuration, encode_dd_mode, encode_key_servers_value,
    encode_server_list_entry, encode_server_tag, uid_key, DataMoveMetaData, DataMovePhase,
    DatabaseConfiguration, KeyServersValue, Locality, RegionInfo, ServerListEntry,
    DATA_DISTRIBUTION_MODE_KEY, DATA_MOVE_PREFIX, KEY_SERVERS_PREFIX, SERVER_LIST_PREFIX,
    SERVER_TAG_PREFIX,
};
use meridian_dd::system_db::{krm_set, SystemDb};
use meridian_dd::{Uid, ANONYMOUS_SHARD_ID};

pub fn open_system_db() -> (tempfile::TempDir, Arc<SystemDb>) {
    let dir = tempfile::tempdir().unwrap();
    let db = SystemDb::open(dir.path()).unwrap();
    (dir, db)
}

pub fn server_id(n: u64) -> Uid {
    Uid::new(n, 0)
}

/// Register a storage server with tag `n`, placed in `dc`.
pub fn register_server(db: &Arc<SystemDb>, n: u64, dc: &str, is_tss: bool) {
    let id = server_id(n);
    let entry = ServerListEntry {
        id,
        address: format!("10.0.0.{n}:4500").parse().unwrap(),
        secondary_address: None,
        locality: Locality {
            dc_id: Some(dc.to_string()),
            zone_id: Some(format!("zone-{n}")),
            process_id: Some(format!("process-{n}")),
        },
        is_tss,
    };
    let mut tr = db.begin();
    tr.set(
        &uid_key(SERVER_LIST_PREFIX, id),
        &encode_server_list_entry(&entry),
    );
    tr.set(&uid_key(SERVER_TAG_PREFIX, id), &encode_server_tag(n));
    tr.commit().unwrap();
}

pub fn set_dd_mode(db: &Arc<SystemDb>, mode: i32) {
    let mut tr = db.begin();
    tr.set(DATA_DISTRIBUTION_MODE_KEY, &encode_dd_mode(mode));
    tr.commit().unwrap();
}

pub fn set_configuration(db: &Arc<SystemDb>, team_size: usize, regions: &[&str]) {
    let conf = DatabaseConfiguration {
        storage_team_size: team_size,
        usable_regions: regions.len().max(1),
        regions: regions
            .iter()
            .map(|dc| RegionInfo {
                dc_id: Some(dc.to_string()),
            })
            .collect(),
    };
    let mut tr = db.begin();
    tr.set(
        meridian_dd::system_data::DATABASE_CONFIGURATION_KEY,
        &encode_database_configuration(&conf),
    );
    tr.commit().unwrap();
}

/// Assign `[range]` to the given source tags (and optionally destination
/// tags plus a tracked move id) in the `keyServers/` boundary map.
pub fn assign_range(
    db: &Arc<SystemDb>,
    range: &KeyRange,
    src_tags: &[u64],
    dest_tags: &[u64],
    dest_id: Option<Uid>,
) {
    let value = KeyServersValue {
        src_tags: src_tags.to_vec(),
        dest_tags: dest_tags.to_vec(),
        src_id: ANONYMOUS_SHARD_ID,
        dest_id: dest_id.unwrap_or(ANONYMOUS_SHARD_ID),
    };
    let mut tr = db.begin();
    krm_set(
        &mut tr,
        KEY_SERVERS_PREFIX,
        range,
        &encode_key_servers_value(&value),
    )
    .unwrap();
    tr.commit().unwrap();
}

/// Bootstrap the whole keyspace onto one team.
pub fn bootstrap_key_servers(db: &Arc<SystemDb>, src_tags: &[u64]) {
    assign_range(db, &all_keys(), src_tags, &[], None);
}

pub fn record_data_move(db: &Arc<SystemDb>, id: Uid, range: KeyRange, src: &[u64], dest: &[u64]) {
    let meta = DataMoveMetaData {
        id,
        range,
        src: src.iter().map(|&n| server_id(n)).collect(),
        dest: dest.iter().map(|&n| server_id(n)).collect(),
        phase: DataMovePhase::Running,
    };
    let mut tr = db.begin();
    tr.set(&uid_key(DATA_MOVE_PREFIX, id), &encode_data_move(&meta));
    tr.commit().unwrap();
}
