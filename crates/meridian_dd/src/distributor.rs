//! The data-distribution orchestrator: owns the move-keys lock, seeds the
//! shard/team map from the initial scan, schedules recovery of in-flight
//! moves, spawns and restarts the collaborator stack, and serves the
//! distributor RPC surface (halt, metrics, snapshot, exclusion checks,
//! wiggler state).

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::enabled::DdEnabledState;
use crate::errors::{DdError, Result};
use crate::init_scan::{get_initial_data_distribution, get_server_list_and_process_classes};
use crate::keyspace::{all_keys, KeyRange, RangeMap};
use crate::lock::{poll_move_keys_lock, take_move_keys_lock, MoveKeysLock};
use crate::move_keys::{remove_keys_from_failed_server, remove_storage_server};
use crate::shard_map::{ShardsAffectedByTeamFailure, Team};
use crate::snapshot::dd_snap_create;
use crate::system_data::{
    decode_database_configuration, decode_datacenter_replicas, decode_datacenter_replicas_key,
    decode_dd_mode, decode_lock_owner, decode_server_list_entry, encode_datacenter_replicas,
    prefix_range, strip_uid, uid_key, AddressExclusion, DatabaseConfiguration,
    DATABASE_CONFIGURATION_KEY, DATACENTER_REPLICAS_PREFIX, DATA_DISTRIBUTION_MODE_KEY,
    DATA_DISTRIBUTION_MODE_LOCK, MOVE_KEYS_LOCK_OWNER_KEY, STORAGE_CACHE_SERVER_PREFIX,
};
use crate::system_db::SystemDb;
use crate::workers::{
    ClusterInfo, CollaboratorFactory, MetricsListRequest, QueueContext, RelocateReason,
    RelocateShard, ShardMetrics, TeamCollection, TeamCollectionContext, TrackedShards,
    TrackerContext, WigglerState,
};
use crate::{Uid, ANONYMOUS_SHARD_ID};

/// Tunable limits and timeouts. Defaults match production settings; tests
/// shrink the delays.
#[derive(Clone, Debug)]
pub struct Knobs {
    /// Max `keyServers/` rows per initial-scan slice.
    pub move_keys_krm_limit: usize,
    /// Max `keyServers/` bytes per initial-scan slice.
    pub move_keys_krm_limit_bytes: usize,
    /// Period of the background move-keys lock revalidation.
    pub movekeys_lock_polling_delay: Duration,
    /// Poll period while waiting for data distribution to be re-enabled.
    pub dd_enabled_check_delay: Duration,
    /// Reconcile period of the cache-server watcher.
    pub cache_server_reconcile_delay: Duration,
    /// Outer bound on one snapshot request.
    pub snap_create_max_timeout: Duration,
    pub max_storage_snapshot_fault_tolerance: usize,
    pub max_coordinator_snapshot_fault_tolerance: usize,
    /// Whether shards carry persisted move identifiers that can be
    /// cross-checked against the data-move map.
    pub shard_encode_location_metadata: bool,
    pub dd_tenant_awareness_enabled: bool,
    pub priority_recover_move: i32,
    pub priority_team_unhealthy: i32,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            move_keys_krm_limit: 2000,
            move_keys_krm_limit_bytes: 100_000,
            movekeys_lock_polling_delay: Duration::from_secs(5),
            dd_enabled_check_delay: Duration::from_secs(1),
            cache_server_reconcile_delay: Duration::from_secs(5),
            snap_create_max_timeout: Duration::from_secs(180),
            max_storage_snapshot_fault_tolerance: 1,
            max_coordinator_snapshot_fault_tolerance: 1,
            shard_encode_location_metadata: true,
            dd_tenant_awareness_enabled: false,
            priority_recover_move: 110,
            priority_team_unhealthy: 700,
        }
    }
}

// ---------------------------------------------------------------------------
// RPC surface

pub struct HaltRequest {
    pub requester_id: Uid,
    pub reply: oneshot::Sender<()>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MetricsReply {
    List(Vec<ShardMetrics>),
    MidShardSize(u64),
}

pub struct MetricsRequest {
    pub keys: KeyRange,
    pub shard_limit: usize,
    /// Reply with only the median shard byte size instead of the list.
    pub mid_only: bool,
    pub reply: oneshot::Sender<Result<MetricsReply>>,
}

pub struct SnapRequest {
    pub snap_payload: Vec<u8>,
    pub snap_uid: Uid,
    pub reply: oneshot::Sender<Result<()>>,
}

pub struct ExclusionCheckRequest {
    pub exclusions: Vec<AddressExclusion>,
    pub reply: oneshot::Sender<ExclusionCheckReply>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExclusionCheckReply {
    pub safe: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WigglerStateReply {
    pub primary: u8,
    pub last_state_change_primary: f64,
    pub remote: u8,
    pub last_state_change_remote: f64,
}

pub struct WigglerStateRequest {
    pub reply: oneshot::Sender<WigglerStateReply>,
}

/// Caller-side handle to a running distributor.
#[derive(Clone)]
pub struct DistributorHandle {
    halt_tx: mpsc::UnboundedSender<HaltRequest>,
    metrics_tx: mpsc::UnboundedSender<MetricsRequest>,
    snap_tx: mpsc::UnboundedSender<SnapRequest>,
    excl_tx: mpsc::UnboundedSender<ExclusionCheckRequest>,
    wiggler_tx: mpsc::UnboundedSender<WigglerStateRequest>,
}

/// Server-side request streams consumed by [`DataDistributor::run`].
pub struct DistributorRequests {
    halt_rx: mpsc::UnboundedReceiver<HaltRequest>,
    metrics_rx: mpsc::UnboundedReceiver<MetricsRequest>,
    snap_rx: mpsc::UnboundedReceiver<SnapRequest>,
    excl_rx: mpsc::UnboundedReceiver<ExclusionCheckRequest>,
    wiggler_rx: mpsc::UnboundedReceiver<WigglerStateRequest>,
}

pub fn distributor_channel() -> (DistributorHandle, DistributorRequests) {
    let (halt_tx, halt_rx) = mpsc::unbounded_channel();
    let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = mpsc::unbounded_channel();
    let (excl_tx, excl_rx) = mpsc::unbounded_channel();
    let (wiggler_tx, wiggler_rx) = mpsc::unbounded_channel();
    (
        DistributorHandle {
            halt_tx,
            metrics_tx,
            snap_tx,
            excl_tx,
            wiggler_tx,
        },
        DistributorRequests {
            halt_rx,
            metrics_rx,
            snap_rx,
            excl_rx,
            wiggler_rx,
        },
    )
}

impl DistributorHandle {
    pub async fn halt(&self, requester_id: Uid) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.halt_tx
            .send(HaltRequest {
                requester_id,
                reply,
            })
            .map_err(|_| DdError::BrokenPromise)?;
        rx.await.map_err(|_| DdError::BrokenPromise)
    }

    pub async fn metrics(
        &self,
        keys: KeyRange,
        shard_limit: usize,
        mid_only: bool,
    ) -> Result<MetricsReply> {
        let (reply, rx) = oneshot::channel();
        self.metrics_tx
            .send(MetricsRequest {
                keys,
                shard_limit,
                mid_only,
                reply,
            })
            .map_err(|_| DdError::BrokenPromise)?;
        rx.await.map_err(|_| DdError::BrokenPromise)?
    }

    pub async fn snapshot(&self, snap_payload: Vec<u8>, snap_uid: Uid) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.snap_tx
            .send(SnapRequest {
                snap_payload,
                snap_uid,
                reply,
            })
            .map_err(|_| DdError::BrokenPromise)?;
        rx.await.map_err(|_| DdError::BrokenPromise)?
    }

    pub async fn exclusion_safety_check(
        &self,
        exclusions: Vec<AddressExclusion>,
    ) -> Result<ExclusionCheckReply> {
        let (reply, rx) = oneshot::channel();
        self.excl_tx
            .send(ExclusionCheckRequest { exclusions, reply })
            .map_err(|_| DdError::BrokenPromise)?;
        rx.await.map_err(|_| DdError::BrokenPromise)
    }

    pub async fn wiggler_state(&self) -> Result<WigglerStateReply> {
        let (reply, rx) = oneshot::channel();
        self.wiggler_tx
            .send(WigglerStateRequest { reply })
            .map_err(|_| DdError::BrokenPromise)?;
        rx.await.map_err(|_| DdError::BrokenPromise)
    }
}

// ---------------------------------------------------------------------------
// Shared helpers

pub async fn get_database_configuration(db: &Arc<SystemDb>) -> Result<DatabaseConfiguration> {
    loop {
        let tr = db.begin();
        let attempt = tr.get(DATABASE_CONFIGURATION_KEY).and_then(|value| {
            Ok(match value {
                Some(value) => decode_database_configuration(&value)?,
                None => DatabaseConfiguration::default(),
            })
        });
        match attempt {
            Ok(conf) => return Ok(conf),
            Err(err) => db.on_error(err).await?,
        }
    }
}

/// Block until both the persisted mode and the in-memory toggle allow
/// data distribution to run.
pub async fn wait_for_data_distribution_enabled(
    db: &Arc<SystemDb>,
    enabled: &DdEnabledState,
    knobs: &Knobs,
) -> Result<()> {
    loop {
        tokio::time::sleep(knobs.dd_enabled_check_delay).await;
        let tr = db.begin();
        match tr.get(DATA_DISTRIBUTION_MODE_KEY) {
            Ok(value) => {
                let mode = decode_dd_mode(value.as_deref());
                if mode != 0 && enabled.is_enabled() {
                    tracing::info!("waiting for data distribution enabled succeeded");
                    return Ok(());
                }
                tracing::debug!(mode, in_memory = enabled.is_enabled(), "data distribution still disabled");
            }
            Err(err) => db.on_error(err).await?,
        }
    }
}

/// Authoritative re-check used to demote a lock conflict: data
/// distribution counts as enabled when the mode allows it, or when the
/// lock owner is not the reserved operator-disable owner.
pub async fn is_data_distribution_enabled(
    db: &Arc<SystemDb>,
    enabled: &DdEnabledState,
) -> Result<bool> {
    loop {
        let tr = db.begin();
        let attempt = (|| -> Result<bool> {
            let mode = decode_dd_mode(tr.get(DATA_DISTRIBUTION_MODE_KEY)?.as_deref());
            if mode != 0 && enabled.is_enabled() {
                return Ok(true);
            }
            let owner = match tr.get(MOVE_KEYS_LOCK_OWNER_KEY)? {
                Some(value) => decode_lock_owner(&value)?,
                None => Uid::default(),
            };
            Ok(enabled.is_enabled() && owner != DATA_DISTRIBUTION_MODE_LOCK)
        })();
        match attempt {
            Ok(result) => return Ok(result),
            Err(err) => db.on_error(err).await?,
        }
    }
}

/// Median shard byte size via partial selection; the input order is not
/// otherwise meaningful.
pub fn median_shard_size(mut metrics: Vec<ShardMetrics>) -> u64 {
    if metrics.is_empty() {
        return 0;
    }
    let mid = metrics.len() / 2;
    let (_, nth, _) =
        metrics.select_nth_unstable_by(mid, |a, b| a.shard_bytes.cmp(&b.shard_bytes));
    nth.shard_bytes
}

async fn dd_get_metrics(
    metrics_list: mpsc::UnboundedSender<MetricsListRequest>,
    req: MetricsRequest,
) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let forwarded = metrics_list
        .send(MetricsListRequest {
            keys: req.keys.clone(),
            shard_limit: req.shard_limit,
            reply: reply_tx,
        })
        .is_ok();
    let result = if forwarded {
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(DdError::BrokenPromise),
        }
    } else {
        Err(DdError::BrokenPromise)
    };
    let reply = result.map(|list| {
        if req.mid_only {
            MetricsReply::MidShardSize(median_shard_size(list))
        } else {
            MetricsReply::List(list)
        }
    });
    let _ = req.reply.send(reply);
}

/// Forward the relocation output stream back into the queue's input.
async fn yield_relocations(
    mut output_rx: mpsc::UnboundedReceiver<RelocateShard>,
    input_tx: mpsc::UnboundedSender<RelocateShard>,
) -> Result<()> {
    while let Some(relocation) = output_rx.recv().await {
        if input_tx.send(relocation).is_err() {
            break;
        }
    }
    Ok(())
}

/// Keep `output` equal to the OR of the input cells.
async fn any_true(mut inputs: Vec<watch::Receiver<bool>>, output: watch::Sender<bool>) -> Result<()> {
    loop {
        let value = inputs.iter().any(|rx| *rx.borrow());
        let _ = output.send(value);
        let changes = inputs
            .iter_mut()
            .map(|rx| Box::pin(rx.changed()))
            .collect::<Vec<_>>();
        let (changed, _, _) = futures_util::future::select_all(changes).await;
        if changed.is_err() {
            return Ok(());
        }
    }
}

/// Watch the cache-server registrations, clearing the key of any cache
/// server whose failure endpoint fires. The known set reconciles on a
/// fixed period.
pub async fn cache_server_watcher(
    db: Arc<SystemDb>,
    cluster: Arc<dyn ClusterInfo>,
    knobs: Arc<Knobs>,
) -> Result<()> {
    let mut known: BTreeSet<Uid> = BTreeSet::new();
    let mut watchers: JoinSet<()> = JoinSet::new();
    loop {
        let tr = db.begin();
        let attempt = (|| -> Result<Vec<(Uid, crate::system_data::ServerListEntry)>> {
            let range = prefix_range(STORAGE_CACHE_SERVER_PREFIX);
            let rows = tr.get_range(&range.begin, &range.end, usize::MAX, usize::MAX)?;
            let mut entries = Vec::with_capacity(rows.rows.len());
            for (key, value) in rows.rows {
                let id = strip_uid(STORAGE_CACHE_SERVER_PREFIX, &key)?;
                entries.push((id, decode_server_list_entry(&value)?));
            }
            Ok(entries)
        })();
        match attempt {
            Ok(entries) => {
                let mut current = BTreeSet::new();
                for (id, entry) in entries {
                    current.insert(id);
                    if !known.contains(&id) {
                        let endpoint = cluster.cache_server(&entry);
                        let db = db.clone();
                        watchers.spawn(async move {
                            endpoint.wait_failure().await;
                            clear_cache_server_key(&db, id).await;
                        });
                    }
                }
                known = current;
                tokio::time::sleep(knobs.cache_server_reconcile_delay).await;
                while watchers.try_join_next().is_some() {}
            }
            Err(err) => db.on_error(err).await?,
        }
    }
}

async fn clear_cache_server_key(db: &Arc<SystemDb>, id: Uid) {
    loop {
        let mut tr = db.begin();
        tr.clear(&uid_key(STORAGE_CACHE_SERVER_PREFIX, id));
        match tr.commit() {
            Ok(()) => {
                tracing::info!(cache_server = %id, "cleared failed cache server registration");
                return;
            }
            Err(err) => {
                if db.on_error(err).await.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The orchestrator

pub struct DataDistributor {
    dd_id: Uid,
    db: Arc<SystemDb>,
    cluster: Arc<dyn ClusterInfo>,
    factory: Arc<dyn CollaboratorFactory>,
    enabled: Arc<DdEnabledState>,
    knobs: Arc<Knobs>,
    team_collections: Mutex<Vec<Arc<dyn TeamCollection>>>,
    metrics_list_tx: mpsc::UnboundedSender<MetricsListRequest>,
    metrics_list_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MetricsListRequest>>>,
}

impl DataDistributor {
    pub fn new(
        dd_id: Uid,
        db: Arc<SystemDb>,
        cluster: Arc<dyn ClusterInfo>,
        factory: Arc<dyn CollaboratorFactory>,
        enabled: Arc<DdEnabledState>,
        knobs: Knobs,
    ) -> Arc<Self> {
        let (metrics_list_tx, metrics_list_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            dd_id,
            db,
            cluster,
            factory,
            enabled,
            knobs: Arc::new(knobs),
            team_collections: Mutex::new(Vec::new()),
            metrics_list_tx,
            metrics_list_rx: Arc::new(tokio::sync::Mutex::new(metrics_list_rx)),
        })
    }

    pub fn enabled_state(&self) -> Arc<DdEnabledState> {
        self.enabled.clone()
    }

    /// Serve the distributor interface while the inner distribution stack
    /// runs. Returns after a halt request, or with the error that killed
    /// the stack when it is not one of the expected distributor errors.
    pub async fn run(self: Arc<Self>, requests: DistributorRequests) -> Result<()> {
        tracing::info!(dd_id = %self.dd_id, "data distributor running");
        let DistributorRequests {
            mut halt_rx,
            mut metrics_rx,
            mut snap_rx,
            mut excl_rx,
            mut wiggler_rx,
        } = requests;

        let cache_watcher = tokio::spawn(cache_server_watcher(
            self.db.clone(),
            self.cluster.clone(),
            self.knobs.clone(),
        ));
        let mut distributor = {
            let this = self.clone();
            tokio::spawn(async move { this.data_distribution().await })
        };
        let mut side_tasks: JoinSet<()> = JoinSet::new();

        let result = loop {
            tokio::select! {
                joined = &mut distributor => {
                    break match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) if err.is_normal_distributor_error() => {
                            tracing::warn!(dd_id = %self.dd_id, error = %err, "data distributor died");
                            Ok(())
                        }
                        Ok(Err(err)) => {
                            tracing::error!(dd_id = %self.dd_id, error = %err, "data distributor error");
                            Err(err)
                        }
                        Err(join_err) => {
                            tracing::error!(dd_id = %self.dd_id, error = %join_err, "data distribution task failed");
                            Err(DdError::OperationCancelled)
                        }
                    };
                }
                Some(req) = halt_rx.recv() => {
                    let _ = req.reply.send(());
                    tracing::info!(dd_id = %self.dd_id, requester = %req.requester_id, "data distributor halted");
                    distributor.abort();
                    break Ok(());
                }
                Some(req) = metrics_rx.recv() => {
                    let metrics_list = self.metrics_list_tx.clone();
                    side_tasks.spawn(dd_get_metrics(metrics_list, req));
                }
                Some(req) = snap_rx.recv() => {
                    let cluster = self.cluster.clone();
                    let db = self.db.clone();
                    let enabled = self.enabled.clone();
                    let knobs = self.knobs.clone();
                    side_tasks.spawn(async move {
                        let result = dd_snap_create(
                            &req.snap_payload,
                            req.snap_uid,
                            &cluster,
                            &db,
                            &enabled,
                            &knobs,
                        )
                        .await;
                        let _ = req.reply.send(result);
                    });
                }
                Some(req) = excl_rx.recv() => {
                    let this = self.clone();
                    side_tasks.spawn(async move { this.exclusion_safety_check(req).await });
                }
                Some(req) = wiggler_rx.recv() => {
                    let _ = req.reply.send(self.storage_wiggler_states());
                }
                Some(_) = side_tasks.join_next(), if !side_tasks.is_empty() => {}
            }
        };
        cache_watcher.abort();
        distributor.abort();
        side_tasks.abort_all();
        result
    }

    fn storage_wiggler_states(&self) -> WigglerStateReply {
        let collections = self.team_collections.lock().unwrap();
        let mut reply = WigglerStateReply::default();
        if let Some(primary) = collections.first() {
            let WigglerState {
                state,
                last_state_change,
            } = primary.wiggler_state();
            reply.primary = state;
            reply.last_state_change_primary = last_state_change;
        }
        if let Some(remote) = collections.get(1) {
            let WigglerState {
                state,
                last_state_change,
            } = remote.wiggler_state();
            reply.remote = state;
            reply.last_state_change_remote = last_state_change;
        }
        reply
    }

    /// Address exclusions are unsafe until a team collection exists and
    /// more than one team is built; otherwise the team collection decides.
    async fn exclusion_safety_check(self: Arc<Self>, req: ExclusionCheckRequest) {
        tracing::debug!(dd_id = %self.dd_id, "exclusion safety check begin");
        let servers = match get_server_list_and_process_classes(&self.db).await {
            Ok(servers) => servers,
            Err(err) => {
                tracing::warn!(dd_id = %self.dd_id, error = %err, "exclusion safety check failed to read servers");
                let _ = req.reply.send(ExclusionCheckReply { safe: false });
                return;
            }
        };
        let collections = self.team_collections.lock().unwrap().clone();
        let safe = 'check: {
            let Some(primary) = collections.first() else {
                tracing::debug!(dd_id = %self.dd_id, "exclusion safety check: no team collection yet");
                break 'check false;
            };
            if primary.team_count() <= 1 {
                // With one team left, marking servers failed can wedge
                // team building entirely.
                tracing::debug!(dd_id = %self.dd_id, "exclusion safety check: not enough teams");
                break 'check false;
            }
            let mut exclude_ids = Vec::new();
            for exclusion in &req.exclusions {
                for (entry, _) in &servers {
                    let matched = exclusion.excludes(entry.address)
                        || entry
                            .secondary_address
                            .map(|addr| exclusion.excludes(addr))
                            .unwrap_or(false);
                    if matched {
                        exclude_ids.push(entry.id);
                    }
                }
            }
            exclude_ids.sort();
            exclude_ids.dedup();
            primary.exclusion_safety_check(&exclude_ids)
        };
        tracing::debug!(dd_id = %self.dd_id, safe, "exclusion safety check finish");
        let _ = req.reply.send(ExclusionCheckReply { safe });
    }

    /// Outer recovery loop: run epochs until a fatal error; tear down and
    /// restart on the expected collaborator errors, removing a failed
    /// server first when one was reported.
    async fn data_distribution(self: Arc<Self>) -> Result<()> {
        loop {
            let (tracker_cancelled_tx, tracker_cancelled_rx) = watch::channel(false);
            let shards: Arc<Mutex<TrackedShards>> =
                Arc::new(Mutex::new(RangeMap::new(all_keys(), None)));
            let failed_server: Arc<Mutex<Option<Uid>>> = Arc::new(Mutex::new(None));
            let mut lock_slot: Option<MoveKeysLock> = None;

            let epoch = self
                .run_epoch(
                    &mut lock_slot,
                    tracker_cancelled_rx,
                    shards.clone(),
                    failed_server.clone(),
                )
                .await;
            let err = match epoch {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let _ = tracker_cancelled_tx.send(true);
            tracing::warn!(dd_id = %self.dd_id, error = %err, "destroying collaborators for restart");

            // Pick replacement teams for a reported failed server before
            // the team collections go away.
            let dropped = failed_server.lock().unwrap().take();
            let mut team_for_dropped_range = Vec::new();
            if let Some(server) = dropped {
                for collection in self.team_collections.lock().unwrap().iter() {
                    team_for_dropped_range.extend(collection.random_healthy_team(server));
                }
            }
            self.team_collections.lock().unwrap().clear();
            shards.lock().unwrap().clear(None);

            if let Some(server) = dropped {
                let lock = lock_slot.expect("failed-server report implies the lock was taken");
                tracing::warn!(dd_id = %self.dd_id, server = %server, "removing failed storage server");
                remove_keys_from_failed_server(
                    &self.db,
                    &lock,
                    &self.enabled,
                    server,
                    team_for_dropped_range,
                )
                .await?;
                remove_storage_server(&self.db, &lock, &self.enabled, server).await?;
            } else if err == DdError::MoveKeysConflict {
                // The conflict is fatal unless DD has in fact been
                // disabled under us.
                let dd_enabled = is_data_distribution_enabled(&self.db, &self.enabled).await?;
                tracing::warn!(
                    dd_id = %self.dd_id,
                    data_distribution_enabled = dd_enabled,
                    "move keys lock conflict"
                );
                if dd_enabled {
                    return Err(err);
                }
            } else if !err.is_normal_dd_queue_error() {
                return Err(err);
            }
        }
    }

    /// One epoch of the inner loop: take the lock, reconcile replica
    /// keys, load the initial distribution, seed the shard map, recover
    /// or cancel persisted moves, then run the collaborators until one of
    /// them fails.
    async fn run_epoch(
        &self,
        lock_slot: &mut Option<MoveKeysLock>,
        tracker_cancelled: watch::Receiver<bool>,
        shards: Arc<Mutex<TrackedShards>>,
        failed_server: Arc<Mutex<Option<Uid>>>,
    ) -> Result<()> {
        let (lock, configuration, remote_dc_ids, init) = loop {
            tracing::info!(dd_id = %self.dd_id, "taking move keys lock");
            let lock = take_move_keys_lock(&self.db, self.dd_id).await?;
            *lock_slot = Some(lock);
            tracing::info!(dd_id = %self.dd_id, "took move keys lock");

            let configuration = get_database_configuration(&self.db).await?;
            let mut primary_dc_ids: Vec<Option<String>> = Vec::new();
            let mut remote_dc_ids: Vec<Option<String>> = Vec::new();
            if let Some(region) = configuration.regions.first() {
                primary_dc_ids.push(region.dc_id.clone());
            }
            if let Some(region) = configuration.regions.get(1) {
                remote_dc_ids.push(region.dc_id.clone());
            }
            tracing::info!(dd_id = %self.dd_id, configuration = ?configuration, "got configuration");

            self.reconcile_datacenter_replicas(&configuration, &primary_dc_ids, &remote_dc_ids)
                .await?;
            tracing::info!(dd_id = %self.dd_id, "updated replica keys");

            let loader_remote_dcs = if configuration.usable_regions > 1 {
                remote_dc_ids.clone()
            } else {
                Vec::new()
            };
            let init = get_initial_data_distribution(
                &self.db,
                self.dd_id,
                &lock,
                &loader_remote_dcs,
                &self.enabled,
                &self.knobs,
            )
            .await?;
            tracing::info!(
                dd_id = %self.dd_id,
                shards = init.shards.len().saturating_sub(1),
                servers = init.all_servers.len(),
                mode = init.mode,
                "got initial data distribution"
            );

            if init.mode != 0 && self.enabled.is_enabled() {
                break (lock, configuration, remote_dc_ids, init);
            }

            tracing::info!(dd_id = %self.dd_id, "data distribution disabled");
            tracing::info!(
                dd_id = %self.dd_id,
                in_flight = 0,
                in_queue = 0,
                average_shard_size = -1i64,
                unhealthy_relocations = 0,
                highest_priority = 0,
                "moving data"
            );
            tracing::info!(dd_id = %self.dd_id, primary = true, total_bytes = 0, unhealthy_servers = 0, "total data in flight");
            tracing::info!(
                dd_id = %self.dd_id,
                primary = false,
                total_bytes = 0,
                unhealthy_servers = 0,
                highest_priority = if configuration.usable_regions > 1 { 0 } else { -1 },
                "total data in flight"
            );
            wait_for_data_distribution_enabled(&self.db, &self.enabled, &self.knobs).await?;
            tracing::info!(dd_id = %self.dd_id, "data distribution enabled");
        };

        assert!(configuration.storage_team_size > 0);

        let (output_tx, output_rx) = mpsc::unbounded_channel::<RelocateShard>();
        let (input_tx, input_rx) = mpsc::unbounded_channel::<RelocateShard>();
        let (shard_map_inner, restart_ranges) = ShardsAffectedByTeamFailure::new();
        let shard_map = Arc::new(Mutex::new(shard_map_inner));
        let (ready_tx, ready_rx) = watch::channel(false);
        let (processing_unhealthy_tx, processing_unhealthy_rx) = watch::channel(false);
        let (processing_wiggle_tx, processing_wiggle_rx) = watch::channel(false);

        // Seed the shard map and schedule recovery of untracked in-flight
        // moves.
        for index in 0..init.shards.len().saturating_sub(1) {
            let shard = &init.shards[index];
            let range = KeyRange::new(shard.key.clone(), init.shards[index + 1].key.clone());
            {
                let mut map = shard_map.lock().unwrap();
                map.define_shard(&range);
                let mut teams = vec![Team::new(shard.primary_src.clone(), true)];
                if configuration.usable_regions > 1 {
                    teams.push(Team::new(shard.remote_src.clone(), false));
                }
                map.move_shard(&range, teams);
            }
            if shard.has_dest && shard.dest_id == ANONYMOUS_SHARD_ID {
                // An in-flight move with no tracked identity: re-schedule
                // it, upgrading the priority when a source team is short.
                let mut unhealthy = shard.primary_src.len() != configuration.storage_team_size;
                if !unhealthy && configuration.usable_regions > 1 {
                    unhealthy = shard.remote_src.len() != configuration.storage_team_size;
                }
                let priority = if unhealthy {
                    self.knobs.priority_team_unhealthy
                } else {
                    self.knobs.priority_recover_move
                };
                let _ = output_tx.send(RelocateShard {
                    keys: range,
                    priority,
                    reason: RelocateReason::Other,
                    data_move_id: ANONYMOUS_SHARD_ID,
                    cancelled: false,
                });
            }
            tokio::task::yield_now().await;
        }

        // Replay or cancel the persisted data moves.
        for (range, tracked) in init.data_move_map.ranges() {
            let tracked = tracked.lock().unwrap();
            if tracked.is_cancelled()
                || (tracked.valid && !self.knobs.shard_encode_location_metadata)
            {
                let _ = output_tx.send(RelocateShard {
                    keys: tracked.meta.range.clone(),
                    priority: self.knobs.priority_recover_move,
                    reason: RelocateReason::Other,
                    data_move_id: tracked.meta.id,
                    cancelled: true,
                });
                tracing::info!(dd_id = %self.dd_id, data_move = ?tracked.meta, "scheduled cancellation of data move");
            } else if tracked.valid {
                assert_eq!(tracked.meta.range, range);
                let mut teams = vec![Team::new(tracked.primary_dest.clone(), true)];
                if !tracked.remote_dest.is_empty() {
                    teams.push(Team::new(tracked.remote_dest.clone(), false));
                }
                {
                    // A data move can cover several shards (e.g. a merge),
                    // so the target shard is re-defined and its tracker
                    // restarted before the destination teams land.
                    let mut map = shard_map.lock().unwrap();
                    map.restart_shard_tracker(range.clone());
                    map.define_shard(&range);
                    map.move_shard(&range, teams);
                }
                let _ = output_tx.send(RelocateShard {
                    keys: range.clone(),
                    priority: self.knobs.priority_recover_move,
                    reason: RelocateReason::Other,
                    data_move_id: tracked.meta.id,
                    cancelled: false,
                });
                tracing::debug!(dd_id = %self.dd_id, data_move = ?tracked.meta, "restored data move");
            }
        }

        // Healthy-team observability cells, one per region, OR-ed together
        // for the tracker.
        let (zero_primary_tx, zero_primary_rx) = watch::channel(true);
        let mut zero_healthy_rxs = vec![zero_primary_rx.clone()];
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let (zero_remote_tx, any_zero_rx) = if configuration.usable_regions > 1 {
            let (zero_remote_tx, zero_remote_rx) = watch::channel(true);
            zero_healthy_rxs.push(zero_remote_rx);
            let (any_tx, any_rx) = watch::channel(true);
            tasks.spawn(any_true(zero_healthy_rxs.clone(), any_tx));
            (Some(zero_remote_tx), any_rx)
        } else {
            (None, zero_primary_rx)
        };

        let team_size = if configuration.usable_regions > 1 {
            2 * configuration.storage_team_size
        } else {
            configuration.storage_team_size
        };

        let init = Arc::new(init);
        tasks.spawn(poll_move_keys_lock(
            self.db.clone(),
            lock,
            self.enabled.clone(),
            self.knobs.movekeys_lock_polling_delay,
        ));
        tasks.spawn(yield_relocations(output_rx, input_tx.clone()));
        tasks.spawn(self.factory.tracker(TrackerContext {
            init: init.clone(),
            db: self.db.clone(),
            output: output_tx.clone(),
            shard_map: shard_map.clone(),
            shards: shards.clone(),
            metrics_requests: self.metrics_list_rx.clone(),
            restart_ranges,
            ready: ready_tx,
            any_zero_healthy_teams: any_zero_rx,
            tracker_cancelled,
        }));
        tasks.spawn(self.factory.queue(QueueContext {
            db: self.db.clone(),
            input: input_rx,
            output: output_tx.clone(),
            shard_map: shard_map.clone(),
            lock,
            enabled: self.enabled.clone(),
            ready: ready_rx.clone(),
            processing_unhealthy: processing_unhealthy_tx,
            processing_wiggle: processing_wiggle_tx,
            team_size,
            single_region_team_size: configuration.storage_team_size,
        }));

        let primary_dc_ids = configuration
            .regions
            .first()
            .map(|r| vec![r.dc_id.clone()])
            .unwrap_or_default();
        let (primary_collection, primary_future) =
            self.factory.team_collection(TeamCollectionContext {
                db: self.db.clone(),
                lock,
                enabled: self.enabled.clone(),
                output: output_tx.clone(),
                shard_map: shard_map.clone(),
                configuration: configuration.clone(),
                is_primary: true,
                dc_ids: primary_dc_ids,
                ready: ready_rx.clone(),
                zero_healthy_teams: zero_primary_tx,
                processing_unhealthy: processing_unhealthy_rx.clone(),
                processing_wiggle: processing_wiggle_rx.clone(),
                remove_failed_server: failed_server.clone(),
            });
        let mut collections = vec![primary_collection];
        tasks.spawn(primary_future);

        if configuration.usable_regions > 1 {
            let (remote_collection, remote_future) =
                self.factory.team_collection(TeamCollectionContext {
                    db: self.db.clone(),
                    lock,
                    enabled: self.enabled.clone(),
                    output: output_tx.clone(),
                    shard_map: shard_map.clone(),
                    configuration: configuration.clone(),
                    is_primary: false,
                    dc_ids: remote_dc_ids.clone(),
                    ready: ready_rx.clone(),
                    zero_healthy_teams: zero_remote_tx.expect("remote cell exists"),
                    processing_unhealthy: processing_unhealthy_rx.clone(),
                    processing_wiggle: processing_wiggle_rx.clone(),
                    remove_failed_server: failed_server.clone(),
                });
            collections.push(remote_collection);
            let cluster = self.cluster.clone();
            tasks.spawn(async move {
                // The remote collection only starts once the remote region
                // has recovered.
                cluster.remote_recovered().await;
                remote_future.await
            });
        }
        *self.team_collections.lock().unwrap() = collections;

        if self.knobs.dd_tenant_awareness_enabled {
            if let Some(monitor) = self.factory.tenant_monitor(self.db.clone()) {
                tasks.spawn(monitor);
            }
        }

        // Run until the first collaborator failure; a clean completion of
        // every collaborator ends the distributor.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join_err) if join_err.is_cancelled() => {
                    tasks.abort_all();
                    return Err(DdError::OperationCancelled);
                }
                Err(join_err) => {
                    tracing::error!(dd_id = %self.dd_id, error = %join_err, "collaborator panicked");
                    tasks.abort_all();
                    return Err(DdError::OperationFailed);
                }
            }
        }
        Ok(())
    }

    /// Clamp per-DC replica records to the configured team size and drop
    /// records for DCs no longer in the configuration.
    async fn reconcile_datacenter_replicas(
        &self,
        configuration: &DatabaseConfiguration,
        primary_dc_ids: &[Option<String>],
        remote_dc_ids: &[Option<String>],
    ) -> Result<()> {
        loop {
            let mut tr = self.db.begin();
            let attempt = (|| -> Result<()> {
                let range = prefix_range(DATACENTER_REPLICAS_PREFIX);
                let rows = tr.get_range(&range.begin, &range.end, usize::MAX, usize::MAX)?;
                for (key, value) in rows.rows {
                    let dc_id = Some(decode_datacenter_replicas_key(&key)?);
                    let replicas = decode_datacenter_replicas(&value)?;
                    let known = primary_dc_ids.contains(&dc_id)
                        || (configuration.usable_regions > 1 && remote_dc_ids.contains(&dc_id));
                    if known {
                        if replicas > configuration.storage_team_size {
                            tr.set(
                                &key,
                                &encode_datacenter_replicas(configuration.storage_team_size),
                            );
                        }
                    } else {
                        tr.clear(&key);
                    }
                }
                Ok(())
            })();
            match attempt.and_then(|()| tr.commit()) {
                Ok(()) => return Ok(()),
                Err(err) => self.db.on_error(err).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(bytes: &[u64]) -> Vec<ShardMetrics> {
        bytes
            .iter()
            .map(|&b| ShardMetrics {
                keys: KeyRange::new(b.to_string().into_bytes(), (b + 1).to_string().into_bytes()),
                shard_bytes: b,
            })
            .collect()
    }

    #[test]
    fn median_of_empty_list_is_zero() {
        assert_eq!(median_shard_size(Vec::new()), 0);
    }

    #[test]
    fn median_does_not_require_sorted_input() {
        assert_eq!(median_shard_size(metrics(&[9, 1, 5, 3, 7])), 5);
        assert_eq!(median_shard_size(metrics(&[4, 2])), 4);
        assert_eq!(median_shard_size(metrics(&[8])), 8);
    }

    #[tokio::test]
    async fn any_true_tracks_inputs() {
        let (a_tx, a_rx) = watch::channel(false);
        let (b_tx, b_rx) = watch::channel(true);
        let (out_tx, out_rx) = watch::channel(false);
        let task = tokio::spawn(any_true(vec![a_rx, b_rx], out_tx));

        tokio::task::yield_now().await;
        assert!(*out_rx.borrow());

        b_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!*out_rx.borrow());

        a_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(*out_rx.borrow());

        task.abort();
    }

    #[test]
    fn default_knobs_are_sane() {
        let knobs = Knobs::default();
        assert!(knobs.move_keys_krm_limit > 0);
        assert!(knobs.priority_team_unhealthy > knobs.priority_recover_move);
    }
}
