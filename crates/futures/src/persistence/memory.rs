//! In-memory store implementations
//!
//! These provide the same claim and TTL semantics as the PostgreSQL stores,
//! but only within one process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::trace;

use super::store::*;
use crate::wait::Wait;

/// In-memory named queues
///
/// Claiming pops under a lock, so a message is handed to exactly one caller.
///
/// # Example
///
/// ```
/// use tpq_futures::persistence::InMemoryQueue;
///
/// let queue = InMemoryQueue::new();
/// ```
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<ClaimedMessage>>>,
    next_id: AtomicI64,
    enqueued: Notify,
}

impl InMemoryQueue {
    /// Create an empty queue set
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            enqueued: Notify::new(),
        }
    }

    fn try_claim(&self, queue: &str) -> Option<ClaimedMessage> {
        self.queues.lock().get_mut(queue).and_then(|q| q.pop_front())
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, queue: &str, message: QueueMessage) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(ClaimedMessage { id, message });
        self.enqueued.notify_waiters();
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: &str,
        wait: Wait,
    ) -> Result<Option<ClaimedMessage>, StoreError> {
        let deadline = wait.deadline();

        loop {
            // Register interest before looking, so an enqueue in between is not missed
            let notified = self.enqueued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.try_claim(queue) {
                return Ok(Some(claimed));
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    trace!(queue, "queue empty");
                    return Ok(None);
                }
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                }
                None => notified.await,
            }
        }
    }

    async fn clear(&self, queue: &str) -> Result<u64, StoreError> {
        let removed = self
            .queues
            .lock()
            .remove(queue)
            .map(|q| q.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }

    async fn count(&self, queue: &str) -> Result<u64, StoreError> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }
}

/// In-memory TTL result store
///
/// Expired records are evicted when read. Every write is broadcast to
/// subscribers so waiting handles wake up without waiting for their next poll.
pub struct InMemoryResultStore {
    records: RwLock<ResultMap>,
    ttl: Duration,
    written: broadcast::Sender<String>,
}

/// Record count below which writes never sweep expired records
const SWEEP_THRESHOLD: usize = 1024;

/// Records keyed by result key; `None` expiry means the ttl overflowed
struct ResultMap {
    entries: HashMap<String, (ResultRecord, Option<Instant>)>,
    sweep_at: usize,
}

fn is_live(expires_at: &Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| now < at)
}

impl InMemoryResultStore {
    /// Create a store whose records expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        let (written, _) = broadcast::channel(256);
        Self {
            records: RwLock::new(ResultMap {
                entries: HashMap::new(),
                sweep_at: SWEEP_THRESHOLD,
            }),
            ttl,
            written,
        }
    }

    /// Number of stored (possibly expired) records
    pub fn len(&self) -> usize {
        self.records.read().entries.len()
    }

    /// Check if no record is stored
    pub fn is_empty(&self) -> bool {
        self.records.read().entries.is_empty()
    }

    /// Drop every expired record, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut records = self.records.write();
        Self::sweep(&mut records)
    }

    fn sweep(records: &mut ResultMap) -> usize {
        let now = Instant::now();
        let before = records.entries.len();
        records.entries.retain(|_, (_, expires_at)| is_live(expires_at, now));
        // Sweep again once the live set has doubled
        records.sweep_at = (records.entries.len() * 2).max(SWEEP_THRESHOLD);
        before - records.entries.len()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn set(&self, record: ResultRecord) -> Result<(), StoreError> {
        let uid = record.uid.clone();
        let expires_at = Instant::now().checked_add(self.ttl);
        {
            let mut records = self.records.write();
            if records.entries.len() >= records.sweep_at {
                let swept = Self::sweep(&mut records);
                trace!(swept, "swept expired results");
            }
            records
                .entries
                .insert(result_key(&uid), (record, expires_at));
        }
        // No receivers is fine
        let _ = self.written.send(uid);
        Ok(())
    }

    async fn get(&self, uid: &str) -> Result<Option<ResultRecord>, StoreError> {
        let key = result_key(uid);
        {
            let records = self.records.read();
            match records.entries.get(&key) {
                None => return Ok(None),
                Some((record, expires_at)) if is_live(expires_at, Instant::now()) => {
                    return Ok(Some(record.clone()));
                }
                Some(_) => {}
            }
        }

        trace!(uid, "evicting expired result");
        let mut records = self.records.write();
        // A writer may have refreshed the record in between
        let now = Instant::now();
        if records
            .entries
            .get(&key)
            .is_some_and(|(_, expires_at)| !is_live(expires_at, now))
        {
            records.entries.remove(&key);
        }
        Ok(None)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.written.subscribe())
    }
}

/// In-memory execution statistics
///
/// Each update runs under the shard lock of its row, which makes the deltas
/// atomic with respect to each other.
pub struct InMemoryStatStore {
    stats: DashMap<String, ExecutionStat>,
}

impl InMemoryStatStore {
    /// Create an empty statistics store
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
        }
    }
}

impl Default for InMemoryStatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatStore for InMemoryStatStore {
    async fn record_start(&self, name: &str) -> Result<(), StoreError> {
        let mut stat = self
            .stats
            .entry(name.to_string())
            .or_insert_with(|| ExecutionStat::new(name));
        stat.total += 1;
        stat.running += 1;
        stat.last_seen = Utc::now();
        Ok(())
    }

    async fn record_end(&self, name: &str, failed: bool) -> Result<(), StoreError> {
        if let Some(mut stat) = self.stats.get_mut(name) {
            stat.running = (stat.running - 1).max(0);
            if failed {
                stat.failed += 1;
            }
        }
        Ok(())
    }

    async fn get_stat(&self, name: &str) -> Result<Option<ExecutionStat>, StoreError> {
        Ok(self.stats.get(name).map(|s| s.value().clone()))
    }

    async fn list_stats(&self) -> Result<Vec<ExecutionStat>, StoreError> {
        let mut stats: Vec<_> = self.stats.iter().map(|s| s.value().clone()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn message(uid: &str) -> QueueMessage {
        QueueMessage {
            uid: uid.to_string(),
            name: "tasks::add".to_string(),
            args: "[1,2]".to_string(),
            kwargs: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_queue_fifo_per_name() {
        let queue = InMemoryQueue::new();
        queue.enqueue("a", message("1")).await.unwrap();
        queue.enqueue("a", message("2")).await.unwrap();
        queue.enqueue("b", message("3")).await.unwrap();

        assert_eq!(queue.count("a").await.unwrap(), 2);
        assert_eq!(queue.count("b").await.unwrap(), 1);

        let first = queue.dequeue("a", Wait::IMMEDIATE).await.unwrap().unwrap();
        assert_eq!(first.message.uid, "1");
        let second = queue.dequeue("a", Wait::IMMEDIATE).await.unwrap().unwrap();
        assert_eq!(second.message.uid, "2");
        assert_ne!(first.id, second.id);

        assert!(queue.dequeue("a", Wait::IMMEDIATE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_with_unbounded_wait() {
        let queue = InMemoryQueue::new();
        queue.enqueue("a", message("1")).await.unwrap();

        let claimed = queue
            .dequeue("a", Wait::from_secs(i64::MAX))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.message.uid, "1");

        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            queue.dequeue("a", Wait::For(Duration::MAX)),
        )
        .await;
        assert!(pending.is_err(), "an empty queue keeps blocking");
    }

    #[tokio::test]
    async fn test_queue_clear() {
        let queue = InMemoryQueue::new();
        queue.enqueue("a", message("1")).await.unwrap();
        queue.enqueue("a", message("2")).await.unwrap();

        assert_eq!(queue.clear("a").await.unwrap(), 2);
        assert_eq!(queue.count("a").await.unwrap(), 0);
        assert_eq!(queue.clear("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_times_out() {
        let queue = InMemoryQueue::new();
        let started = std::time::Instant::now();

        let claimed = queue
            .dequeue("a", Wait::For(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(claimed.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryQueue::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue("a", Wait::Forever).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("a", message("late")).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake up")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.message.uid, "late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..200 {
            queue.enqueue("a", message(&i.to_string())).await.unwrap();
        }

        let mut consumers = vec![];
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut ids = vec![];
                while let Some(claimed) = queue.dequeue("a", Wait::IMMEDIATE).await.unwrap() {
                    ids.push(claimed.id);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for consumer in consumers {
            for id in consumer.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "message {id} delivered twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn test_result_set_get_overwrite() {
        let store = InMemoryResultStore::new(Duration::from_secs(60));
        assert!(store.get("u-1").await.unwrap().is_none());

        store
            .set(ResultRecord::new("u-1", "first".to_string(), 0))
            .await
            .unwrap();
        store
            .set(ResultRecord::new("u-1", "second".to_string(), 100))
            .await
            .unwrap();

        let record = store.get("u-1").await.unwrap().unwrap();
        assert_eq!(record.obj, "second");
        assert_eq!(record.progress, 100);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_result_expires() {
        let store = InMemoryResultStore::new(Duration::from_millis(20));
        store
            .set(ResultRecord::new("u-1", "obj".to_string(), 0))
            .await
            .unwrap();
        assert!(store.get("u-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("u-1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unread_results_are_swept_on_write() {
        let store = InMemoryResultStore::new(Duration::from_millis(20));
        for i in 0..SWEEP_THRESHOLD {
            store
                .set(ResultRecord::new(format!("old-{i}"), "obj".to_string(), 0))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), SWEEP_THRESHOLD);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Nobody read the old records; the next write clears them out
        store
            .set(ResultRecord::new("fresh", "obj".to_string(), 0))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryResultStore::new(Duration::from_millis(20));
        store
            .set(ResultRecord::new("u-1", "obj".to_string(), 0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let store = InMemoryResultStore::new(Duration::MAX);
        store
            .set(ResultRecord::new("u-1", "obj".to_string(), 0))
            .await
            .unwrap();
        assert!(store.get("u-1").await.unwrap().is_some());
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_result_write_notifies() {
        let store = InMemoryResultStore::new(Duration::from_secs(60));
        let mut rx = store.subscribe().unwrap();

        store
            .set(ResultRecord::new("u-1", "obj".to_string(), 0))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), "u-1");
    }

    #[tokio::test]
    async fn test_stats_deltas() {
        let stats = InMemoryStatStore::new();
        assert!(stats.get_stat("t").await.unwrap().is_none());

        stats.record_start("t").await.unwrap();
        stats.record_start("t").await.unwrap();
        let stat = stats.get_stat("t").await.unwrap().unwrap();
        assert_eq!((stat.total, stat.running, stat.failed), (2, 2, 0));

        stats.record_end("t", false).await.unwrap();
        stats.record_end("t", true).await.unwrap();
        let stat = stats.get_stat("t").await.unwrap().unwrap();
        assert_eq!((stat.total, stat.running, stat.failed), (2, 0, 1));
        assert!(stat.last_seen >= stat.first_seen);
    }

    #[tokio::test]
    async fn test_running_never_negative() {
        let stats = InMemoryStatStore::new();
        stats.record_start("t").await.unwrap();
        stats.record_end("t", false).await.unwrap();
        stats.record_end("t", false).await.unwrap();

        let stat = stats.get_stat("t").await.unwrap().unwrap();
        assert_eq!(stat.running, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stat_updates() {
        let stats = Arc::new(InMemoryStatStore::new());
        let mut handles = vec![];
        for i in 0..16 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    stats.record_start("t").await.unwrap();
                    stats.record_end("t", i % 2 == 0).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stat = stats.get_stat("t").await.unwrap().unwrap();
        assert_eq!(stat.total, 400);
        assert_eq!(stat.failed, 200);
        assert_eq!(stat.running, 0);

        let all = stats.list_stats().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
