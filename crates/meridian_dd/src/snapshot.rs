//! Cluster snapshot coordination: quiesce transaction-log pops, snapshot
//! storage + tlog + coordinator workers with bounded fault tolerance, and
//! re-enable pops under strict failure semantics.
//!
//! Pops must never stay disabled and data distribution must never stay
//! disabled, whatever the exit path. The inline error paths handle the
//! failure classes that re-enable pops; drop guards cover cancellation.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use futures_util::future::try_join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::distributor::{get_database_configuration, Knobs};
use crate::enabled::DdEnabledState;
use crate::errors::{DdError, Result};
use crate::system_data::WRITE_RECOVERY_KEY;
use crate::system_db::SystemDb;
use crate::workers::{ClusterInfo, TlogWorker};
use crate::Uid;

/// Wait until all but `fault_tolerance` of `futures` have succeeded.
///
/// Fails with `error` as soon as the quorum becomes unreachable. After
/// success, stragglers get up to `elapsed * slow_multiplier` extra time
/// but can no longer fail the call.
pub async fn wait_for_most<F>(
    futures: Vec<F>,
    fault_tolerance: usize,
    error: DdError,
    slow_multiplier: f64,
) -> Result<()>
where
    F: Future<Output = anyhow::Result<()>> + Send,
{
    let total = futures.len();
    let needed = total.saturating_sub(fault_tolerance);
    let start = Instant::now();
    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    while succeeded < needed {
        match pending.next().await {
            Some(Ok(())) => succeeded += 1,
            Some(Err(err)) => {
                failed += 1;
                tracing::warn!(error = %err, failed, fault_tolerance, "quorum member failed");
                if failed > fault_tolerance {
                    return Err(error);
                }
            }
            None => return Err(error),
        }
    }

    let grace = start.elapsed().mul_f64(slow_multiplier.max(0.0));
    let _ = tokio::time::timeout(grace, async {
        while pending.next().await.is_some() {}
    })
    .await;
    Ok(())
}

/// Re-enables tlog pops on drop unless defused; covers cancellation of
/// the snapshot future at any point after pops may have been disabled.
struct PopGuard {
    tlogs: Vec<Arc<dyn TlogWorker>>,
    snap_uid: Uid,
    armed: bool,
}

impl PopGuard {
    fn new(tlogs: Vec<Arc<dyn TlogWorker>>, snap_uid: Uid) -> Self {
        Self {
            tlogs,
            snap_uid,
            armed: true,
        }
    }

    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for PopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tlogs = std::mem::take(&mut self.tlogs);
        let snap_uid = self.snap_uid;
        tokio::spawn(async move {
            best_effort_enable_pops(&tlogs, snap_uid).await;
        });
    }
}

/// Try to re-enable pops on every tlog; failures are logged and swallowed.
async fn best_effort_enable_pops(tlogs: &[Arc<dyn TlogWorker>], snap_uid: Uid) {
    for tlog in tlogs {
        if let Err(err) = tlog.enable_pop(snap_uid).await {
            tracing::debug!(
                snap_uid = %snap_uid,
                tlog = %tlog.id(),
                error = %err,
                "ignoring enable-pop failure during snapshot cleanup"
            );
        }
    }
}

/// Restores the enabled state for the owning snapshot on drop.
struct EnabledGuard {
    enabled: Arc<DdEnabledState>,
    snap_uid: Uid,
}

impl Drop for EnabledGuard {
    fn drop(&mut self) {
        let restored = self.enabled.enable_after_snapshot(self.snap_uid);
        if std::thread::panicking() {
            if !restored {
                tracing::error!(snap_uid = %self.snap_uid, "failed to re-enable data distribution");
            }
        } else {
            // Re-enabling must always succeed: nothing else may take the
            // disabled state while this snapshot owns it.
            assert!(restored, "failed to re-enable data distribution");
        }
    }
}

/// The snapshot critical section, steps (b)-(f): disable pops, snapshot
/// storage within fault tolerance, snapshot every tlog, re-enable pops,
/// snapshot a coordinator quorum.
async fn snap_critical_section(
    snap_payload: &[u8],
    snap_uid: Uid,
    tlogs: &[Arc<dyn TlogWorker>],
    pop_guard: &mut PopGuard,
    cluster: &Arc<dyn ClusterInfo>,
    db: &Arc<SystemDb>,
    knobs: &Knobs,
) -> Result<()> {
    try_join_all(tlogs.iter().map(|t| t.disable_pop(snap_uid)))
        .await
        .map_err(|err| {
            tracing::warn!(snap_uid = %snap_uid, error = %err, "disable pop failed");
            DdError::SnapDisableTlogPopFailed
        })?;
    tracing::info!(snap_uid = %snap_uid, tlogs = tlogs.len(), "disabled tlog pops");

    let configuration = get_database_configuration(db).await?;
    let (storage_workers, storage_failures) = cluster.storage_workers().await.map_err(|err| {
        tracing::warn!(snap_uid = %snap_uid, error = %err, "storage worker discovery failed");
        DdError::SnapStorageFailed
    })?;
    let storage_fault_tolerance = knobs
        .max_storage_snapshot_fault_tolerance
        .min(configuration.storage_team_size.saturating_sub(1)) as i64
        - storage_failures as i64;
    if storage_fault_tolerance < 0 {
        // Too many storage servers already down to snapshot consistently.
        return Err(DdError::SnapStorageFailed);
    }
    tracing::info!(
        snap_uid = %snap_uid,
        workers = storage_workers.len(),
        fault_tolerance = storage_fault_tolerance,
        "snapshotting storage workers"
    );
    let storage_snaps: Vec<_> = storage_workers
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            let payload = snap_payload.to_vec();
            async move { worker.snap(&payload, snap_uid, "storage").await }
        })
        .collect();
    wait_for_most(
        storage_snaps,
        storage_fault_tolerance as usize,
        DdError::SnapStorageFailed,
        1.0,
    )
    .await?;

    try_join_all(tlogs.iter().map(|t| t.snap(snap_payload, snap_uid)))
        .await
        .map_err(|err| {
            tracing::warn!(snap_uid = %snap_uid, error = %err, "tlog snapshot failed");
            DdError::SnapTlogFailed
        })?;

    try_join_all(tlogs.iter().map(|t| t.enable_pop(snap_uid)))
        .await
        .map_err(|err| {
            tracing::warn!(snap_uid = %snap_uid, error = %err, "enable pop failed");
            DdError::SnapEnableTlogPopFailed
        })?;
    pop_guard.defuse();
    tracing::info!(snap_uid = %snap_uid, "re-enabled tlog pops");

    let coord_workers = cluster.coord_workers().await.map_err(|err| {
        tracing::warn!(snap_uid = %snap_uid, error = %err, "coordinator discovery failed");
        DdError::SnapCoordFailed
    })?;
    let coord_fault_tolerance = (coord_workers.len() / 2)
        .saturating_sub(1)
        .min(knobs.max_coordinator_snapshot_fault_tolerance);
    let coord_snaps: Vec<_> = coord_workers
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            let payload = snap_payload.to_vec();
            async move { worker.snap(&payload, snap_uid, "coord").await }
        })
        .collect();
    wait_for_most(
        coord_snaps,
        coord_fault_tolerance,
        DdError::SnapCoordFailed,
        1.0,
    )
    .await?;
    tracing::info!(snap_uid = %snap_uid, coords = coord_workers.len(), "snapshotted coordinators");
    Ok(())
}

async fn dd_snap_create_core(
    snap_payload: &[u8],
    snap_uid: Uid,
    cluster: &Arc<dyn ClusterInfo>,
    db: &Arc<SystemDb>,
    knobs: &Knobs,
) -> Result<()> {
    // Persist the write-recovery marker before quiescing anything.
    loop {
        let mut tr = db.begin();
        tr.set(WRITE_RECOVERY_KEY, b"1");
        match tr.commit() {
            Ok(()) => break,
            Err(err) => db.on_error(err).await?,
        }
    }

    let tlogs = cluster.local_tlogs();
    let mut pop_guard = PopGuard::new(tlogs.clone(), snap_uid);
    let result = snap_critical_section(
        snap_payload,
        snap_uid,
        &tlogs,
        &mut pop_guard,
        cluster,
        db,
        knobs,
    )
    .await;

    match result {
        Ok(()) => {
            loop {
                let mut tr = db.begin();
                tr.clear(WRITE_RECOVERY_KEY);
                match tr.commit() {
                    Ok(()) => break,
                    Err(err) => db.on_error(err).await?,
                }
            }
            Ok(())
        }
        Err(err) => {
            tracing::warn!(snap_uid = %snap_uid, error = %err, "snapshot failed");
            let reenable = matches!(
                err,
                DdError::SnapStorageFailed
                    | DdError::SnapTlogFailed
                    | DdError::SnapDisableTlogPopFailed
            );
            pop_guard.defuse();
            if reenable {
                best_effort_enable_pops(&tlogs, snap_uid).await;
            }
            Err(err)
        }
    }
}

/// Run one snapshot request end to end. Disables data distribution for the
/// duration (failing with `operation_failed` if it is already disabled)
/// and restores it on every exit path.
pub async fn dd_snap_create(
    snap_payload: &[u8],
    snap_uid: Uid,
    cluster: &Arc<dyn ClusterInfo>,
    db: &Arc<SystemDb>,
    enabled: &Arc<DdEnabledState>,
    knobs: &Knobs,
) -> Result<()> {
    if !enabled.disable_for_snapshot(snap_uid) {
        tracing::warn!(snap_uid = %snap_uid, "snapshot refused: data distribution already disabled");
        return Err(DdError::OperationFailed);
    }
    let _restore = EnabledGuard {
        enabled: enabled.clone(),
        snap_uid,
    };

    let mut db_changed = cluster.db_info_changes();
    let result = tokio::select! {
        _ = db_changed.changed() => {
            tracing::warn!(snap_uid = %snap_uid, "cluster topology changed during snapshot");
            Err(DdError::SnapWithRecoveryUnsupported)
        }
        res = dd_snap_create_core(snap_payload, snap_uid, cluster, db, knobs) => res,
        _ = tokio::time::sleep(knobs.snap_create_max_timeout) => {
            tracing::warn!(snap_uid = %snap_uid, "snapshot timed out");
            Err(DdError::TimedOut)
        }
    };
    match &result {
        Ok(()) => tracing::info!(snap_uid = %snap_uid, "snapshot succeeded"),
        Err(err) => tracing::warn!(snap_uid = %snap_uid, error = %err, "snapshot request failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn good(
        secs: u64,
        done: Arc<AtomicUsize>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bad(secs: u64) -> impl Future<Output = anyhow::Result<()>> + Send {
        async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Err(anyhow::anyhow!("boom"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tolerance_skips_the_slowest_future() {
        let done = Arc::new(AtomicUsize::new(0));
        let futures = vec![
            good(1, done.clone()),
            good(2, done.clone()),
            good(3, done.clone()),
        ];
        wait_for_most(futures, 1, DdError::OperationFailed, 0.0)
            .await
            .unwrap();
        // Quorum of two reached at the 2s mark; the 3s future never ran to
        // completion.
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tolerance_waits_for_all() {
        let done = Arc::new(AtomicUsize::new(0));
        let futures = vec![
            good(1, done.clone()),
            good(2, done.clone()),
            good(3, done.clone()),
        ];
        wait_for_most(futures, 0, DdError::OperationFailed, 0.0)
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_multiplier_gives_stragglers_time() {
        let done = Arc::new(AtomicUsize::new(0));
        let futures = vec![
            good(1, done.clone()),
            good(2, done.clone()),
            good(3, done.clone()),
        ];
        wait_for_most(futures, 1, DdError::OperationFailed, 1.0)
            .await
            .unwrap();
        // Quorum at 2s plus a 2s grace period covers the 3s straggler.
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_within_tolerance_succeeds() {
        let done = Arc::new(AtomicUsize::new(0));
        let futures: Vec<futures_util::future::BoxFuture<'static, anyhow::Result<()>>> = vec![
            Box::pin(good(1, done.clone())),
            Box::pin(good(2, done.clone())),
            Box::pin(bad(1)),
        ];
        wait_for_most(futures, 1, DdError::OperationFailed, 1.0)
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_beyond_tolerance_raises_supplied_error() {
        let done = Arc::new(AtomicUsize::new(0));
        let futures: Vec<futures_util::future::BoxFuture<'static, anyhow::Result<()>>> = vec![
            Box::pin(good(1, done.clone())),
            Box::pin(good(2, done.clone())),
            Box::pin(bad(1)),
        ];
        let err = wait_for_most(futures, 0, DdError::OperationFailed, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err, DdError::OperationFailed);
    }
}
