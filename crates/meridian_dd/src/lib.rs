//! Data-distribution control plane for the Meridian store.
//!
//! This crate owns the cluster's mapping from key ranges to storage-server
//! teams: it reconstructs a consistent shard/team/in-flight-move picture from
//! the persisted system keyspace under the move-keys lock, keeps the in-memory
//! shard/team map coherent while relocations execute, schedules per-server
//! rejuvenation through the storage wiggler, and coordinates cluster-wide
//! snapshots across storage, transaction-log, and coordinator workers.
//!
//! The actual byte movement is performed by storage servers; collaborators
//! such as the shard tracker, the relocation queue, and the team collections
//! are reached only through the interfaces in [`workers`].

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod distributor;
pub mod enabled;
pub mod errors;
pub mod init_scan;
pub mod keyspace;
pub mod lock;
pub mod move_keys;
pub mod shard_map;
pub mod snapshot;
pub mod system_data;
pub mod system_db;
pub mod wiggler;
pub mod workers;

pub use distributor::{DataDistributor, Knobs};
pub use enabled::DdEnabledState;
pub use errors::{DdError, Result};

/// Opaque 128-bit identifier for servers, data moves, and snapshots.
///
/// Serialized as a fixed-width hex string so identifiers survive the JSON
/// encoding used throughout the system keyspace.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub u64, pub u64);

impl Uid {
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self(hi, lo)
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(rand::random(), rand::random())
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0 && self.1 == 0
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}{:016x}", self.0, self.1)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let hi = u64::from_str_radix(&s[..16], 16).ok()?;
        let lo = u64::from_str_radix(&s[16..], 16).ok()?;
        Some(Self(hi, lo))
    }

    /// Short form used in log output.
    pub fn short_string(&self) -> String {
        format!("{:016x}", self.0)
    }
}

/// Placeholder move identifier meaning "no tracked move" for a shard.
pub const ANONYMOUS_SHARD_ID: Uid = Uid(u64::MAX, u64::MAX);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.short_string())
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::from_hex(&s).ok_or_else(|| D::Error::custom("malformed uid"))
    }
}

/// Wall-clock seconds since the unix epoch, used for storage metadata
/// creation times and wiggle metrics.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_hex_round_trip() {
        let id = Uid::new(0xdead_beef, 42);
        assert_eq!(Uid::from_hex(&id.to_hex()), Some(id));
        assert_eq!(Uid::from_hex("zz"), None);
    }

    #[test]
    fn uid_json_round_trip() {
        let id = Uid::random();
        let enc = serde_json::to_vec(&id).unwrap();
        let dec: Uid = serde_json::from_slice(&enc).unwrap();
        assert_eq!(id, dec);
    }
}
