//! Layout of the persisted system keyspace the distributor reads and
//! writes, with encode/decode helpers per key family.
//!
//! Values are JSON blobs except `dataDistributionMode`, which is a bare
//! little-endian integer so operator tooling can poke it directly.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::errors::{DdError, Result};
use crate::keyspace::{Key, KeyRange};
use crate::Uid;

pub const MOVE_KEYS_LOCK_OWNER_KEY: &[u8] = b"\xff/moveKeysLock/Owner";
pub const DATA_DISTRIBUTION_MODE_KEY: &[u8] = b"\xff/dataDistributionMode";
pub const HEALTHY_ZONE_KEY: &[u8] = b"\xff/healthyZone";
pub const DATACENTER_REPLICAS_PREFIX: &[u8] = b"\xff/datacenterReplicas/";
pub const KEY_SERVERS_PREFIX: &[u8] = b"\xff/keyServers/";
pub const SERVER_LIST_PREFIX: &[u8] = b"\xff/serverList/";
pub const WORKER_LIST_PREFIX: &[u8] = b"\xff/workers/";
pub const SERVER_TAG_PREFIX: &[u8] = b"\xff/serverTag/";
pub const DATA_MOVE_PREFIX: &[u8] = b"\xff/dataMoves/";
pub const STORAGE_CACHE_SERVER_PREFIX: &[u8] = b"\xff/storageCacheServers/";
pub const WRITE_RECOVERY_KEY: &[u8] = b"\xff/writeRecovery";
pub const SNAPSHOT_END_VERSION_KEY: &[u8] = b"\xff/snapshotEndVersion";
pub const DATABASE_CONFIGURATION_KEY: &[u8] = b"\xff/conf";
const WIGGLE_METRICS_PRIMARY_KEY: &[u8] = b"\xff/storageWiggleMetrics/primary";
const WIGGLE_METRICS_REMOTE_KEY: &[u8] = b"\xff/storageWiggleMetrics/remote";

/// Healthy-zone marker that suppresses failure-triggered relocations for
/// every zone, not just one.
pub const IGNORE_SS_FAILURES_ZONE: &str = "IgnoreSSFailures";

/// Lock owner written when an operator disables data distribution through
/// admin tooling rather than a competing distributor taking over.
pub const DATA_DISTRIBUTION_MODE_LOCK: Uid = Uid(0x5808_19e7_1d93_a6a7, 0xf9a4_7a62_4bbd_2e4e);

pub fn wiggle_metrics_key(primary: bool) -> &'static [u8] {
    if primary {
        WIGGLE_METRICS_PRIMARY_KEY
    } else {
        WIGGLE_METRICS_REMOTE_KEY
    }
}

pub fn prefixed(prefix: &[u8], suffix: &[u8]) -> Key {
    let mut out = Vec::with_capacity(prefix.len() + suffix.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(suffix);
    out
}

pub fn prefix_range(prefix: &[u8]) -> KeyRange {
    let mut end = prefix.to_vec();
    end.push(0xff);
    KeyRange::new(prefix.to_vec(), end)
}

pub fn uid_key(prefix: &[u8], id: Uid) -> Key {
    prefixed(prefix, id.to_hex().as_bytes())
}

pub fn strip_uid(prefix: &[u8], key: &[u8]) -> Result<Uid> {
    let suffix = key
        .strip_prefix(prefix)
        .ok_or_else(|| DdError::CorruptMetadata(format!("key outside {:?}", prefix)))?;
    std::str::from_utf8(suffix)
        .ok()
        .and_then(Uid::from_hex)
        .ok_or_else(|| DdError::CorruptMetadata("malformed uid key".into()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(what: &str, value: &[u8]) -> Result<T> {
    serde_json::from_slice(value)
        .map_err(|err| DdError::CorruptMetadata(format!("{what}: {err}")))
}

fn encode_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("system value serialization cannot fail")
}

// ---------------------------------------------------------------------------
// Lock owner

pub fn encode_lock_owner(owner: Uid) -> Vec<u8> {
    encode_json(&owner)
}

pub fn decode_lock_owner(value: &[u8]) -> Result<Uid> {
    decode_json("lock owner", value)
}

// ---------------------------------------------------------------------------
// Data distribution mode

pub fn encode_dd_mode(mode: i32) -> Vec<u8> {
    mode.to_le_bytes().to_vec()
}

/// Absent or short values read as the default mode 1.
pub fn decode_dd_mode(value: Option<&[u8]>) -> i32 {
    match value {
        Some(v) if v.len() >= 4 => i32::from_le_bytes([v[0], v[1], v[2], v[3]]),
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Healthy zone

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthyZone {
    pub zone_id: String,
    pub expiration_version: u64,
}

pub fn encode_healthy_zone(zone: &HealthyZone) -> Vec<u8> {
    encode_json(zone)
}

pub fn decode_healthy_zone(value: &[u8]) -> Result<HealthyZone> {
    decode_json("healthy zone", value)
}

// ---------------------------------------------------------------------------
// Datacenter replicas

pub fn datacenter_replicas_key(dc_id: &str) -> Key {
    prefixed(DATACENTER_REPLICAS_PREFIX, dc_id.as_bytes())
}

pub fn decode_datacenter_replicas_key(key: &[u8]) -> Result<String> {
    key.strip_prefix(DATACENTER_REPLICAS_PREFIX)
        .and_then(|s| std::str::from_utf8(s).ok())
        .map(str::to_string)
        .ok_or_else(|| DdError::CorruptMetadata("malformed datacenter replicas key".into()))
}

pub fn encode_datacenter_replicas(replicas: usize) -> Vec<u8> {
    encode_json(&replicas)
}

pub fn decode_datacenter_replicas(value: &[u8]) -> Result<usize> {
    decode_json("datacenter replicas", value)
}

// ---------------------------------------------------------------------------
// Server list / worker list / tags

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessClass {
    #[default]
    Unset,
    Storage,
    Transaction,
    Log,
    Stateless,
    Coordinator,
    Test,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    pub dc_id: Option<String>,
    pub zone_id: Option<String>,
    pub process_id: Option<String>,
}

/// Interface blob for one storage server as registered in `serverList/`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListEntry {
    pub id: Uid,
    pub address: SocketAddr,
    pub secondary_address: Option<SocketAddr>,
    pub locality: Locality,
    /// Test-storage-server twins shadow-read but never host a team.
    pub is_tss: bool,
}

pub fn encode_server_list_entry(entry: &ServerListEntry) -> Vec<u8> {
    encode_json(entry)
}

pub fn decode_server_list_entry(value: &[u8]) -> Result<ServerListEntry> {
    decode_json("server list entry", value)
}

/// One worker process as registered in `workers/`, keyed by process id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessData {
    pub process_id: String,
    pub class: ProcessClass,
}

pub fn worker_key(process_id: &str) -> Key {
    prefixed(WORKER_LIST_PREFIX, process_id.as_bytes())
}

pub fn encode_process_data(data: &ProcessData) -> Vec<u8> {
    encode_json(data)
}

pub fn decode_process_data(value: &[u8]) -> Result<ProcessData> {
    decode_json("process data", value)
}

pub fn encode_server_tag(tag: u64) -> Vec<u8> {
    encode_json(&tag)
}

pub fn decode_server_tag(value: &[u8]) -> Result<u64> {
    decode_json("server tag", value)
}

/// Invert `serverTag/` rows (server → tag) into the tag → server index
/// `keyServers/` decoding resolves through.
pub fn build_tag_index(rows: &[(Key, Vec<u8>)]) -> Result<BTreeMap<u64, Uid>> {
    let mut index = BTreeMap::new();
    for (key, value) in rows {
        let id = strip_uid(SERVER_TAG_PREFIX, key)?;
        let tag = decode_server_tag(value)?;
        index.insert(tag, id);
    }
    Ok(index)
}

// ---------------------------------------------------------------------------
// keyServers boundary values

/// Boundary value of the `keyServers/` map. Source and destination servers
/// are stored as tags to keep the (heavily duplicated) values small; ids
/// are resolved through the `serverTag/` index at decode time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyServersValue {
    pub src_tags: Vec<u64>,
    pub dest_tags: Vec<u64>,
    pub src_id: Uid,
    pub dest_id: Uid,
}

pub fn encode_key_servers_value(value: &KeyServersValue) -> Vec<u8> {
    encode_json(value)
}

/// Decode a boundary value into `(src, dest, src_id, dest_id)`. An empty
/// value (uninitialized boundary) decodes as unassigned.
pub fn decode_key_servers_value(
    tag_index: &BTreeMap<u64, Uid>,
    value: &[u8],
) -> Result<(Vec<Uid>, Vec<Uid>, Uid, Uid)> {
    if value.is_empty() {
        return Ok((
            Vec::new(),
            Vec::new(),
            crate::ANONYMOUS_SHARD_ID,
            crate::ANONYMOUS_SHARD_ID,
        ));
    }
    let raw: KeyServersValue = decode_json("key servers value", value)?;
    let resolve = |tags: &[u64]| -> Result<Vec<Uid>> {
        tags.iter()
            .map(|tag| {
                tag_index
                    .get(tag)
                    .copied()
                    .ok_or_else(|| DdError::CorruptMetadata(format!("unknown server tag {tag}")))
            })
            .collect()
    };
    Ok((
        resolve(&raw.src_tags)?,
        resolve(&raw.dest_tags)?,
        raw.src_id,
        raw.dest_id,
    ))
}

// ---------------------------------------------------------------------------
// Data moves

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMovePhase {
    Prepare,
    Running,
    Completing,
    Deleting,
}

/// Persisted record of an in-flight (or orphaned) relocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMoveMetaData {
    pub id: Uid,
    pub range: KeyRange,
    pub src: Vec<Uid>,
    pub dest: Vec<Uid>,
    pub phase: DataMovePhase,
}

pub fn encode_data_move(meta: &DataMoveMetaData) -> Vec<u8> {
    encode_json(meta)
}

pub fn decode_data_move(value: &[u8]) -> Result<DataMoveMetaData> {
    decode_json("data move", value)
}

// ---------------------------------------------------------------------------
// Database configuration

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub dc_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    pub storage_team_size: usize,
    pub usable_regions: usize,
    pub regions: Vec<RegionInfo>,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            storage_team_size: 3,
            usable_regions: 1,
            regions: Vec::new(),
        }
    }
}

pub fn encode_database_configuration(conf: &DatabaseConfiguration) -> Vec<u8> {
    encode_json(conf)
}

pub fn decode_database_configuration(value: &[u8]) -> Result<DatabaseConfiguration> {
    decode_json("database configuration", value)
}

// ---------------------------------------------------------------------------
// Exclusions

/// An operator exclusion: an address, optionally narrowed to one port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressExclusion {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl AddressExclusion {
    pub fn excludes(&self, addr: SocketAddr) -> bool {
        self.ip == addr.ip() && self.port.map(|p| p == addr.port()).unwrap_or(true)
    }
}
