//! Store trait definitions for the queue, result and statistics backends

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::wait::Wait;

/// Prefix of every result key
pub const RESULT_KEY_PREFIX: &str = "futures:";

/// Cache key under which the outcome of invocation `uid` is stored
pub fn result_key(uid: &str) -> String {
    format!("{RESULT_KEY_PREFIX}{uid}")
}

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Message rejected by the queue
    #[error("invalid queue message: {0}")]
    InvalidMessage(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Wire form of one invocation
///
/// The task is referenced by its registered name; `args` and `kwargs` are
/// encoded with the task's serializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub uid: String,
    pub name: String,
    pub args: String,
    pub kwargs: String,
}

/// A message claimed by exactly one consumer
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    /// Backend record id (claim identity, not the invocation id)
    pub id: i64,
    pub message: QueueMessage,
}

/// Stored outcome of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub uid: String,
    /// Encoded success value or failure descriptor
    pub obj: String,
    /// Write time, seconds since the unix epoch
    pub ts: f64,
    pub progress: i32,
}

impl ResultRecord {
    /// Create a record stamped with the current time
    pub fn new(uid: impl Into<String>, obj: String, progress: i32) -> Self {
        Self {
            uid: uid.into(),
            obj,
            ts: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            progress,
        }
    }
}

/// Aggregate execution counters of one task name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStat {
    pub name: String,
    pub running: i64,
    pub total: i64,
    pub failed: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ExecutionStat {
    /// Zeroed counters first seen now
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            running: 0,
            total: 0,
            failed: 0,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// Named queues with exclusive claim semantics
///
/// Implementations must guarantee that no two concurrent `dequeue` calls
/// return the same message.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Append a message, returning its record id
    async fn enqueue(&self, queue: &str, message: QueueMessage) -> Result<i64, StoreError>;

    /// Claim the next message, blocking up to `wait`.
    ///
    /// `Ok(None)` means the queue stayed empty; it is not an error.
    async fn dequeue(&self, queue: &str, wait: Wait)
        -> Result<Option<ClaimedMessage>, StoreError>;

    /// Drop every message of the queue, returning how many were removed
    async fn clear(&self, queue: &str) -> Result<u64, StoreError>;

    /// Number of unclaimed messages
    async fn count(&self, queue: &str) -> Result<u64, StoreError>;
}

/// TTL key/value store of invocation outcomes
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Write (or overwrite) the record under `futures:<uid>`
    async fn set(&self, record: ResultRecord) -> Result<(), StoreError>;

    /// Read a record; `None` when not computed yet or expired
    async fn get(&self, uid: &str) -> Result<Option<ResultRecord>, StoreError>;

    /// Time after which records become eligible for eviction
    fn ttl(&self) -> Duration;

    /// Notifications of written uids, for stores able to push them.
    ///
    /// Waiters fall back to polling when this returns `None`.
    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

/// Per-task execution counters
///
/// Updates are relative deltas so concurrent writers in many processes never
/// race on a read-modify-write.
#[async_trait]
pub trait StatStore: Send + Sync + 'static {
    /// Create the row if absent, then `total += 1`, `running += 1`, `last_seen = now`
    async fn record_start(&self, name: &str) -> Result<(), StoreError>;

    /// `running -= 1`, and `failed += 1` when the invocation failed
    async fn record_end(&self, name: &str, failed: bool) -> Result<(), StoreError>;

    /// Counters of one task name
    async fn get_stat(&self, name: &str) -> Result<Option<ExecutionStat>, StoreError>;

    /// Counters of every task name seen so far
    async fn list_stats(&self) -> Result<Vec<ExecutionStat>, StoreError>;
}
