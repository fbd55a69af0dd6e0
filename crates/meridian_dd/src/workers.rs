//! Interfaces to everything the distributor plans against but does not
//! implement: transaction-log / storage / coordinator workers for the
//! snapshot protocol, cache-server failure watches, team collections, and
//! the tracker/queue collaborators. The distributor only ever holds these
//! as trait objects; the node (or a test harness) supplies them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};

use crate::enabled::DdEnabledState;
use crate::errors::Result;
use crate::init_scan::InitialDataDistribution;
use crate::keyspace::{KeyRange, RangeMap};
use crate::lock::MoveKeysLock;
use crate::shard_map::ShardsAffectedByTeamFailure;
use crate::system_data::{DatabaseConfiguration, ServerListEntry};
use crate::system_db::SystemDb;
use crate::Uid;

/// Why a relocation was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocateReason {
    Other,
    RebalanceDisk,
    RebalanceRead,
}

/// A planned relocation handed to the queue collaborator.
#[derive(Clone, Debug)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: i32,
    pub reason: RelocateReason,
    /// Identifier of the tracked move this relocation recovers or
    /// cancels; `ANONYMOUS_SHARD_ID` for fresh moves.
    pub data_move_id: Uid,
    /// True when the relocation exists to cancel the tracked move.
    pub cancelled: bool,
}

/// Byte-size metrics for one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMetrics {
    pub keys: KeyRange,
    pub shard_bytes: u64,
}

/// Request served by the shard tracker: metrics for shards intersecting
/// `keys`, at most `shard_limit` entries.
pub struct MetricsListRequest {
    pub keys: KeyRange,
    pub shard_limit: usize,
    pub reply: oneshot::Sender<Result<Vec<ShardMetrics>>>,
}

/// Per-shard state owned by the tracker but cleared by the orchestrator at
/// teardown.
#[derive(Clone, Debug, Default)]
pub struct ShardTrackedData {
    pub last_metrics: Option<ShardMetrics>,
}

pub type TrackedShards = RangeMap<Option<ShardTrackedData>>;

/// A local transaction-log worker, as seen by the snapshot protocol.
#[async_trait]
pub trait TlogWorker: Send + Sync {
    fn id(&self) -> Uid;
    async fn disable_pop(&self, snap_uid: Uid) -> anyhow::Result<()>;
    async fn enable_pop(&self, snap_uid: Uid) -> anyhow::Result<()>;
    async fn snap(&self, snap_payload: &[u8], snap_uid: Uid) -> anyhow::Result<()>;
}

/// A worker that can take a role-tagged snapshot (storage, coordinator).
#[async_trait]
pub trait SnapWorker: Send + Sync {
    fn id(&self) -> Uid;
    async fn snap(&self, snap_payload: &[u8], snap_uid: Uid, role: &str) -> anyhow::Result<()>;
}

/// Failure observation endpoint of a cache server.
#[async_trait]
pub trait FailureWatch: Send + Sync {
    /// Resolves once the server is considered failed.
    async fn wait_failure(&self);
}

/// Wiggler state as reported by one team collection.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WigglerState {
    pub state: u8,
    pub last_state_change: f64,
}

/// The slice of a team collection the orchestrator consults directly.
pub trait TeamCollection: Send + Sync {
    fn team_count(&self) -> usize;
    fn exclusion_safety_check(&self, server_ids: &[Uid]) -> bool;
    fn wiggler_state(&self) -> WigglerState;
    /// A healthy team not containing `exclude`, for re-homing ranges the
    /// failed server uniquely owned.
    fn random_healthy_team(&self, exclude: Uid) -> Vec<Uid>;
}

/// Cluster topology provider: which workers exist right now.
#[async_trait]
pub trait ClusterInfo: Send + Sync {
    /// Transaction-log workers in the local region.
    fn local_tlogs(&self) -> Vec<Arc<dyn TlogWorker>>;
    /// Local storage workers plus the count of currently-failed storage
    /// servers that could not be reached.
    async fn storage_workers(&self) -> anyhow::Result<(Vec<Arc<dyn SnapWorker>>, usize)>;
    async fn coord_workers(&self) -> anyhow::Result<Vec<Arc<dyn SnapWorker>>>;
    /// Failure endpoint for a registered cache server.
    fn cache_server(&self, entry: &ServerListEntry) -> Arc<dyn FailureWatch>;
    /// Bumps whenever cluster controller topology changes; a bump during
    /// a snapshot makes it unsupportable.
    fn db_info_changes(&self) -> watch::Receiver<u64>;
    /// Resolves once the remote region has recovered enough to host a
    /// team collection.
    async fn remote_recovered(&self) {}
}

/// Everything a tracker instance needs from the orchestrator.
pub struct TrackerContext {
    pub init: Arc<InitialDataDistribution>,
    pub db: Arc<SystemDb>,
    pub output: mpsc::UnboundedSender<RelocateShard>,
    pub shard_map: Arc<Mutex<ShardsAffectedByTeamFailure>>,
    pub shards: Arc<Mutex<TrackedShards>>,
    /// Serialized across epochs: each tracker takes the request stream
    /// for its lifetime and releases it at teardown.
    pub metrics_requests: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MetricsListRequest>>>,
    pub restart_ranges: mpsc::UnboundedReceiver<KeyRange>,
    pub ready: watch::Sender<bool>,
    pub any_zero_healthy_teams: watch::Receiver<bool>,
    pub tracker_cancelled: watch::Receiver<bool>,
}

/// Everything the relocation queue needs from the orchestrator.
pub struct QueueContext {
    pub db: Arc<SystemDb>,
    pub input: mpsc::UnboundedReceiver<RelocateShard>,
    pub output: mpsc::UnboundedSender<RelocateShard>,
    pub shard_map: Arc<Mutex<ShardsAffectedByTeamFailure>>,
    pub lock: MoveKeysLock,
    pub enabled: Arc<DdEnabledState>,
    pub ready: watch::Receiver<bool>,
    pub processing_unhealthy: watch::Sender<bool>,
    pub processing_wiggle: watch::Sender<bool>,
    /// Combined team size across regions.
    pub team_size: usize,
    pub single_region_team_size: usize,
}

/// Everything a team collection needs from the orchestrator.
pub struct TeamCollectionContext {
    pub db: Arc<SystemDb>,
    pub lock: MoveKeysLock,
    pub enabled: Arc<DdEnabledState>,
    pub output: mpsc::UnboundedSender<RelocateShard>,
    pub shard_map: Arc<Mutex<ShardsAffectedByTeamFailure>>,
    pub configuration: DatabaseConfiguration,
    pub is_primary: bool,
    pub dc_ids: Vec<Option<String>>,
    pub ready: watch::Receiver<bool>,
    pub zero_healthy_teams: watch::Sender<bool>,
    pub processing_unhealthy: watch::Receiver<bool>,
    pub processing_wiggle: watch::Receiver<bool>,
    /// Set (once) to request removal of a permanently failed server; the
    /// orchestrator performs the removal under the lock at teardown.
    pub remove_failed_server: Arc<Mutex<Option<Uid>>>,
}

/// Builds the collaborator futures for one epoch of the inner loop. Each
/// future runs until torn down; returning an error restarts the epoch.
pub trait CollaboratorFactory: Send + Sync {
    fn tracker(&self, ctx: TrackerContext) -> BoxFuture<'static, Result<()>>;
    fn queue(&self, ctx: QueueContext) -> BoxFuture<'static, Result<()>>;
    fn team_collection(
        &self,
        ctx: TeamCollectionContext,
    ) -> (Arc<dyn TeamCollection>, BoxFuture<'static, Result<()>>);
    /// Tenant-map monitor, when tenant awareness is configured.
    fn tenant_monitor(&self, db: Arc<SystemDb>) -> Option<BoxFuture<'static, Result<()>>> {
        let _ = db;
        None
    }
}
