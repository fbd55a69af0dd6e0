//! The storage wiggler: orders storage servers for gradual rejuvenation.
//!
//! Servers queue by (wrongly-configured first, oldest storage metadata
//! first, id as tie-break). An ordered set plus an id-to-metadata handle
//! map gives O(log n) update-in-place and arbitrary removal. Wiggle and
//! round metrics persist in the system keyspace, namespaced per DC.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::Result;
use crate::system_data::wiggle_metrics_key;
use crate::system_db::SystemDb;
use crate::{now_secs, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    SsdBtree,
    Memory,
    RocksDb,
}

/// Storage metadata recorded at server first contact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub created_time: f64,
    pub store_type: StoreType,
    pub wrong_configured: bool,
}

impl StorageMetadata {
    pub fn new(created_time: f64, store_type: StoreType) -> Self {
        Self {
            created_time,
            store_type,
            wrong_configured: false,
        }
    }

    pub fn wrong(created_time: f64, store_type: StoreType) -> Self {
        Self {
            created_time,
            store_type,
            wrong_configured: true,
        }
    }
}

/// Composite queue position. Wrongly-configured servers sort before
/// correctly-configured ones, then by earlier creation time, then by id.
#[derive(Clone, Debug, PartialEq)]
struct QueueEntry {
    wrong_configured: bool,
    created_time: f64,
    id: Uid,
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wrong_configured
            .cmp(&self.wrong_configured)
            .then(self.created_time.total_cmp(&other.created_time))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Exponentially weighted moving average whose only stateful operation is
/// feeding one sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmoothedDuration {
    alpha: f64,
    total: f64,
}

impl SmoothedDuration {
    /// `window` approximates the number of samples that dominate the
    /// average.
    pub fn new(window: f64) -> Self {
        Self {
            alpha: 2.0 / (window.max(1.0) + 1.0),
            total: 0.0,
        }
    }

    pub fn set_total(&mut self, sample: f64) {
        self.total += (sample - self.total) * self.alpha;
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

/// Persistent wiggle bookkeeping, one record per DC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WiggleMetrics {
    pub last_round_start: f64,
    pub last_round_finish: f64,
    pub last_wiggle_start: f64,
    pub last_wiggle_finish: f64,
    pub finished_wiggle: u64,
    pub finished_round: u64,
    pub smoothed_wiggle_duration: SmoothedDuration,
    pub smoothed_round_duration: SmoothedDuration,
}

impl Default for WiggleMetrics {
    fn default() -> Self {
        Self {
            last_round_start: 0.0,
            last_round_finish: 0.0,
            last_wiggle_start: 0.0,
            last_wiggle_finish: 0.0,
            finished_wiggle: 0,
            finished_round: 0,
            smoothed_wiggle_duration: SmoothedDuration::new(20.0),
            smoothed_round_duration: SmoothedDuration::new(20.0),
        }
    }
}

fn queue_entry(id: Uid, metadata: &StorageMetadata) -> QueueEntry {
    QueueEntry {
        wrong_configured: metadata.wrong_configured,
        created_time: metadata.created_time,
        id,
    }
}

pub struct StorageWiggler {
    queue: std::collections::BTreeSet<QueueEntry>,
    handles: HashMap<Uid, StorageMetadata>,
    non_empty: watch::Sender<bool>,
    metrics: WiggleMetrics,
    is_primary: bool,
    db: Arc<SystemDb>,
}

impl StorageWiggler {
    pub fn new(db: Arc<SystemDb>, is_primary: bool) -> Self {
        let (non_empty, _) = watch::channel(false);
        Self {
            queue: Default::default(),
            handles: HashMap::new(),
            non_empty,
            metrics: WiggleMetrics::default(),
            is_primary,
            db,
        }
    }

    pub fn contains(&self, id: Uid) -> bool {
        self.handles.contains_key(&id)
    }

    /// Add a server to the queue. The server must not already be queued.
    pub fn add_server(&mut self, id: Uid, metadata: StorageMetadata) {
        assert!(!self.handles.contains_key(&id), "server already queued");
        self.queue.insert(queue_entry(id, &metadata));
        self.handles.insert(id, metadata);
        let _ = self.non_empty.send(true);
    }

    /// Remove a server if it is still queued; no-op after it was popped.
    pub fn remove_server(&mut self, id: Uid) {
        if let Some(metadata) = self.handles.remove(&id) {
            self.queue.remove(&queue_entry(id, &metadata));
        }
        let _ = self.non_empty.send(!self.queue.is_empty());
    }

    /// Reposition a queued server after its metadata changed; equal
    /// metadata is a no-op.
    pub fn update_metadata(&mut self, id: Uid, metadata: StorageMetadata) {
        let current = self
            .handles
            .get(&id)
            .expect("metadata update for unknown server");
        if *current == metadata {
            return;
        }
        self.queue.remove(&queue_entry(id, current));
        self.queue.insert(queue_entry(id, &metadata));
        self.handles.insert(id, metadata);
    }

    /// Pop the next server to wiggle; `None` when the queue is drained.
    pub fn next_server_id(&mut self) -> Option<Uid> {
        let entry = self.queue.iter().next().cloned()?;
        self.queue.remove(&entry);
        self.handles.remove(&entry.id);
        let _ = self.non_empty.send(!self.queue.is_empty());
        Some(entry.id)
    }

    /// Observable "servers are queued" bit.
    pub fn non_empty(&self) -> watch::Receiver<bool> {
        self.non_empty.subscribe()
    }

    pub fn metrics(&self) -> &WiggleMetrics {
        &self.metrics
    }

    fn should_start_new_round(&self) -> bool {
        self.metrics.last_round_finish >= self.metrics.last_round_start
    }

    fn should_finish_round(&self) -> bool {
        self.queue.is_empty()
    }

    /// Reset persisted counters, carrying the smoothed durations over.
    pub async fn reset_stats(&mut self) -> Result<()> {
        let mut fresh = WiggleMetrics::default();
        fresh.smoothed_wiggle_duration = self.metrics.smoothed_wiggle_duration.clone();
        fresh.smoothed_round_duration = self.metrics.smoothed_round_duration.clone();
        self.metrics = fresh;
        self.persist_metrics().await
    }

    /// Load persisted metrics, if any, for this DC.
    pub async fn restore_stats(&mut self) -> Result<()> {
        let key = wiggle_metrics_key(self.is_primary);
        loop {
            let tr = self.db.begin();
            match tr.get(key) {
                Ok(Some(value)) => {
                    if let Ok(metrics) = serde_json::from_slice(&value) {
                        self.metrics = metrics;
                    }
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Err(err) => self.db.on_error(err).await?,
            }
        }
    }

    pub async fn start_wiggle(&mut self) -> Result<()> {
        self.metrics.last_wiggle_start = now_secs();
        if self.should_start_new_round() {
            self.metrics.last_round_start = self.metrics.last_wiggle_start;
        }
        self.persist_metrics().await
    }

    pub async fn finish_wiggle(&mut self) -> Result<()> {
        self.metrics.last_wiggle_finish = now_secs();
        self.metrics.finished_wiggle += 1;
        let duration = self.metrics.last_wiggle_finish - self.metrics.last_wiggle_start;
        self.metrics.smoothed_wiggle_duration.set_total(duration);

        if self.should_finish_round() {
            self.metrics.last_round_finish = self.metrics.last_wiggle_finish;
            self.metrics.finished_round += 1;
            let duration = self.metrics.last_round_finish - self.metrics.last_round_start;
            self.metrics.smoothed_round_duration.set_total(duration);
        }
        self.persist_metrics().await
    }

    async fn persist_metrics(&self) -> Result<()> {
        let key = wiggle_metrics_key(self.is_primary);
        let value = serde_json::to_vec(&self.metrics).expect("wiggle metrics serialize");
        loop {
            let mut tr = self.db.begin();
            tr.set(key, &value);
            match tr.commit() {
                Ok(()) => return Ok(()),
                Err(err) => self.db.on_error(err).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wiggler() -> (tempfile::TempDir, StorageWiggler) {
        let dir = tempfile::tempdir().unwrap();
        let db = SystemDb::open(dir.path()).unwrap();
        (dir, StorageWiggler::new(db, true))
    }

    #[tokio::test]
    async fn pop_order_prefers_wrong_configured_then_oldest() {
        let (_dir, mut w) = wiggler();
        w.add_server(Uid::new(1, 0), StorageMetadata::new(1.0, StoreType::SsdBtree));
        w.add_server(Uid::new(2, 0), StorageMetadata::wrong(2.0, StoreType::Memory));
        w.add_server(Uid::new(3, 0), StorageMetadata::wrong(3.0, StoreType::RocksDb));
        w.add_server(Uid::new(4, 0), StorageMetadata::new(4.0, StoreType::SsdBtree));

        for expected in [Uid::new(2, 0), Uid::new(3, 0), Uid::new(1, 0), Uid::new(4, 0)] {
            assert_eq!(w.next_server_id(), Some(expected));
        }
        assert_eq!(w.next_server_id(), None);
    }

    #[tokio::test]
    async fn add_then_remove_is_observationally_identity() {
        let (_dir, mut w) = wiggler();
        w.add_server(Uid::new(7, 0), StorageMetadata::new(5.0, StoreType::Memory));
        assert!(*w.non_empty().borrow());
        w.remove_server(Uid::new(7, 0));
        assert!(!*w.non_empty().borrow());
        assert_eq!(w.next_server_id(), None);
        // Removing an already-popped or unknown server is a no-op.
        w.remove_server(Uid::new(7, 0));
    }

    #[tokio::test]
    async fn single_add_pops_that_server() {
        let (_dir, mut w) = wiggler();
        w.add_server(Uid::new(9, 9), StorageMetadata::new(3.0, StoreType::RocksDb));
        assert_eq!(w.next_server_id(), Some(Uid::new(9, 9)));
        assert!(!*w.non_empty().borrow());
    }

    #[tokio::test]
    async fn update_metadata_repositions_entry() {
        let (_dir, mut w) = wiggler();
        w.add_server(Uid::new(1, 0), StorageMetadata::new(1.0, StoreType::SsdBtree));
        w.add_server(Uid::new(2, 0), StorageMetadata::new(2.0, StoreType::SsdBtree));
        // Flagging the younger server wrongly-configured jumps the queue.
        w.update_metadata(Uid::new(2, 0), StorageMetadata::wrong(2.0, StoreType::SsdBtree));
        assert_eq!(w.next_server_id(), Some(Uid::new(2, 0)));
    }

    #[tokio::test]
    async fn metrics_round_trip_through_system_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = SystemDb::open(dir.path()).unwrap();
        let mut w = StorageWiggler::new(db.clone(), true);
        w.start_wiggle().await.unwrap();
        w.finish_wiggle().await.unwrap();
        assert_eq!(w.metrics().finished_wiggle, 1);
        // Queue was empty, so the wiggle closed out a round too.
        assert_eq!(w.metrics().finished_round, 1);

        let mut restored = StorageWiggler::new(db, true);
        restored.restore_stats().await.unwrap();
        assert_eq!(restored.metrics(), w.metrics());
    }

    #[tokio::test]
    async fn primary_and_remote_metrics_are_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let db = SystemDb::open(dir.path()).unwrap();
        let mut primary = StorageWiggler::new(db.clone(), true);
        primary.start_wiggle().await.unwrap();
        primary.finish_wiggle().await.unwrap();

        let mut remote = StorageWiggler::new(db, false);
        remote.restore_stats().await.unwrap();
        assert_eq!(remote.metrics().finished_wiggle, 0);
    }

    #[test]
    fn smoothed_duration_tracks_samples() {
        let mut s = SmoothedDuration::new(1.0);
        s.set_total(10.0);
        assert!(s.total() > 9.9);
        let mut slow = SmoothedDuration::new(100.0);
        slow.set_total(10.0);
        assert!(slow.total() < 1.0);
    }
}
