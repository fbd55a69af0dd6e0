//! Orchestrator behavior against mock collaborators: epoch restart on a
//! recoverable queue error, recovery relocations for in-flight moves, and
//! the RPC surface.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use meridian_dd::distributor::{distributor_channel, MetricsReply};
use meridian_dd::enabled::DdEnabledState;
use meridian_dd::keyspace::{all_keys, KeyRange};
use meridian_dd::system_data::{AddressExclusion, ServerListEntry};
use meridian_dd::workers::{
    ClusterInfo, CollaboratorFactory, FailureWatch, QueueContext, RelocateShard, ShardMetrics,
    SnapWorker, TeamCollection, TeamCollectionContext, TlogWorker, TrackerContext, WigglerState,
};
use meridian_dd::{DataDistributor, DdError, Knobs, Uid};

use common::*;

struct IdleCluster {
    db_info_tx: watch::Sender<u64>,
}

struct NeverFails;

#[async_trait]
impl FailureWatch for NeverFails {
    async fn wait_failure(&self) {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl ClusterInfo for IdleCluster {
    fn local_tlogs(&self) -> Vec<Arc<dyn TlogWorker>> {
        Vec::new()
    }

    async fn storage_workers(&self) -> anyhow::Result<(Vec<Arc<dyn SnapWorker>>, usize)> {
        Ok((Vec::new(), 0))
    }

    async fn coord_workers(&self) -> anyhow::Result<Vec<Arc<dyn SnapWorker>>> {
        Ok(Vec::new())
    }

    fn cache_server(&self, _entry: &ServerListEntry) -> Arc<dyn FailureWatch> {
        Arc::new(NeverFails)
    }

    fn db_info_changes(&self) -> watch::Receiver<u64> {
        self.db_info_tx.subscribe()
    }
}

struct MockTeamCollection {
    teams: usize,
}

impl TeamCollection for MockTeamCollection {
    fn team_count(&self) -> usize {
        self.teams
    }

    fn exclusion_safety_check(&self, server_ids: &[Uid]) -> bool {
        server_ids.len() < self.teams
    }

    fn wiggler_state(&self) -> WigglerState {
        WigglerState {
            state: 1,
            last_state_change: 42.0,
        }
    }

    fn random_healthy_team(&self, _exclude: Uid) -> Vec<Uid> {
        vec![server_id(2), server_id(3)]
    }
}

struct MockFactory {
    epochs: Arc<AtomicUsize>,
    fail_first_epoch: bool,
    relocations: Arc<Mutex<Vec<RelocateShard>>>,
}

impl CollaboratorFactory for MockFactory {
    fn tracker(&self, ctx: TrackerContext) -> BoxFuture<'static, Result<(), DdError>> {
        Box::pin(async move {
            let _ = ctx.ready.send(true);
            let mut requests = ctx.metrics_requests.lock().await;
            loop {
                match requests.recv().await {
                    Some(req) => {
                        let reply = [100u64, 300, 200]
                            .iter()
                            .map(|&bytes| ShardMetrics {
                                keys: all_keys(),
                                shard_bytes: bytes,
                            })
                            .collect();
                        let _ = req.reply.send(Ok(reply));
                    }
                    None => std::future::pending::<()>().await,
                }
            }
        })
    }

    fn queue(&self, mut ctx: QueueContext) -> BoxFuture<'static, Result<(), DdError>> {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_first_epoch && epoch == 0;
        let sink = self.relocations.clone();
        Box::pin(async move {
            loop {
                match ctx.input.recv().await {
                    Some(relocation) => {
                        sink.lock().unwrap().push(relocation);
                        if fail {
                            return Err(DdError::DataMoveCancelled);
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            }
        })
    }

    fn team_collection(
        &self,
        ctx: TeamCollectionContext,
    ) -> (Arc<dyn TeamCollection>, BoxFuture<'static, Result<(), DdError>>) {
        let collection: Arc<dyn TeamCollection> = Arc::new(MockTeamCollection { teams: 5 });
        let future: BoxFuture<'static, Result<(), DdError>> = Box::pin(async move {
            let _ctx = ctx;
            std::future::pending::<()>().await;
            Ok(())
        });
        (collection, future)
    }
}

struct Harness {
    db: Arc<meridian_dd::system_db::SystemDb>,
    epochs: Arc<AtomicUsize>,
    relocations: Arc<Mutex<Vec<RelocateShard>>>,
    handle: meridian_dd::distributor::DistributorHandle,
    run: tokio::task::JoinHandle<Result<(), DdError>>,
    _dir: tempfile::TempDir,
}

fn start(fail_first_epoch: bool) -> Harness {
    let (dir, db) = open_system_db();
    for n in 1..=3 {
        register_server(&db, n, "east", false);
    }
    set_configuration(&db, 3, &["east"]);
    bootstrap_key_servers(&db, &[1, 2, 3]);
    // A healthy in-flight move with no tracked identity, and an unhealthy
    // one whose source team is short a server.
    assign_range(
        &db,
        &KeyRange::new(&b"m"[..], &b"q"[..]),
        &[1, 2, 3],
        &[1, 2],
        None,
    );
    assign_range(
        &db,
        &KeyRange::new(&b"c"[..], &b"f"[..]),
        &[1, 2],
        &[3],
        None,
    );

    let epochs = Arc::new(AtomicUsize::new(0));
    let relocations = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(MockFactory {
        epochs: epochs.clone(),
        fail_first_epoch,
        relocations: relocations.clone(),
    });
    let (db_info_tx, _) = watch::channel(0);
    let cluster = Arc::new(IdleCluster { db_info_tx });
    let enabled = Arc::new(DdEnabledState::new());
    let distributor = DataDistributor::new(
        Uid::new(0xdd, 1),
        db.clone(),
        cluster,
        factory,
        enabled,
        Knobs::default(),
    );
    let (handle, requests) = distributor_channel();
    let run = tokio::spawn(distributor.run(requests));
    Harness {
        db,
        epochs,
        relocations,
        handle,
        run,
        _dir: dir,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within five seconds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recoverable_queue_error_restarts_the_epoch() {
    let harness = start(true);
    let epochs = harness.epochs.clone();
    wait_for(move || epochs.load(Ordering::SeqCst) >= 2).await;

    // Both epochs scheduled recovery for the untracked in-flight moves,
    // with the short-team range upgraded to the unhealthy priority.
    let pending = harness.relocations.clone();
    wait_for(move || {
        let seen = pending.lock().unwrap();
        seen.iter().any(|r| r.keys == KeyRange::new(&b"m"[..], &b"q"[..]))
            && seen.iter().any(|r| r.keys == KeyRange::new(&b"c"[..], &b"f"[..]))
    })
    .await;
    let knobs = Knobs::default();
    let relocations = harness.relocations.lock().unwrap().clone();
    let healthy = relocations
        .iter()
        .find(|r| r.keys == KeyRange::new(&b"m"[..], &b"q"[..]))
        .expect("recovery relocation for healthy range");
    assert_eq!(healthy.priority, knobs.priority_recover_move);
    let unhealthy = relocations
        .iter()
        .find(|r| r.keys == KeyRange::new(&b"c"[..], &b"f"[..]))
        .expect("recovery relocation for short-team range");
    assert_eq!(unhealthy.priority, knobs.priority_team_unhealthy);

    harness.handle.halt(Uid::new(0xca11, 0)).await.unwrap();
    assert_eq!(harness.run.await.unwrap(), Ok(()));
    drop(harness.db);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_surface_serves_metrics_exclusions_and_wiggler_state() {
    let harness = start(false);
    let epochs = harness.epochs.clone();
    wait_for(move || epochs.load(Ordering::SeqCst) >= 1).await;

    // Metrics (median only): the tracker reports sizes 100/300/200.
    let mut reply = None;
    for _ in 0..100 {
        match harness.handle.metrics(all_keys(), 100, true).await {
            Ok(r) => {
                reply = Some(r);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert_eq!(reply, Some(MetricsReply::MidShardSize(200)));

    let excl = harness
        .handle
        .exclusion_safety_check(vec![AddressExclusion {
            ip: "10.0.0.1".parse().unwrap(),
            port: None,
        }])
        .await
        .unwrap();
    assert!(excl.safe);

    let wiggler = harness.handle.wiggler_state().await.unwrap();
    assert_eq!(wiggler.primary, 1);
    assert_eq!(wiggler.last_state_change_primary, 42.0);
    assert_eq!(wiggler.remote, 0);

    harness.handle.halt(Uid::new(0xca11, 1)).await.unwrap();
    assert_eq!(harness.run.await.unwrap(), Ok(()));
}
