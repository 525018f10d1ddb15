//! # Futures over a durable queue
//!
//! Schedule a deferred function invocation, have it executed by a pool of
//! worker processes and threads pulling from a queue, and later retrieve the
//! outcome by polling a result store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  submit   ┌──────────────────┐  claim   ┌──────────────────────┐
//! │   Task<A,R>  │ ────────▶ │  Queue (durable) │ ───────▶ │ Supervisor           │
//! │ (registered) │           └──────────────────┘          │  └ WorkerProcess × P │
//! └──────┬───────┘                                         │     └ thread × T     │
//!        │ ResultHandle                                    └──────────┬───────────┘
//!        │ wait()/poll        ┌──────────────────┐   set_result       │
//!        └──────────────────▶ │   ResultStore    │ ◀──────────────────┤
//!                             └──────────────────┘                    │
//!                             ┌──────────────────┐   record_start/end │
//!                             │    StatStore     │ ◀──────────────────┘
//!                             └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tpq_futures::prelude::*;
//!
//! fn add((a, b): (i64, i64)) -> TaskResult<i64> {
//!     Ok(a + b)
//! }
//!
//! let add = Task::wrap(qualified_name!(add), add).on_queue("q");
//! let mut registry = TaskRegistry::new();
//! registry.register(&add);
//!
//! let backends = Backends::in_memory(Duration::from_secs(60));
//! let handle = add.submit(&backends, (3, 6)).await?;
//!
//! // normally done by a worker thread
//! let claimed = Queue::new("q", backends.queue.clone()).dequeue(Wait::IMMEDIATE).await?.unwrap();
//! registry.execute(&claimed.message, &backends).await?;
//!
//! assert_eq!(handle.wait(Wait::Forever).await?, Some(9));
//! ```

pub mod cli;
pub mod config;
pub mod persistence;
pub mod queue;
pub mod results;
pub mod serializer;
pub mod stats;
pub mod task;
pub mod telemetry;
pub mod wait;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::FuturesConfig;
    pub use crate::persistence::{
        Backends, ExecutionStat, InMemoryQueue, InMemoryResultStore, InMemoryStatStore,
        QueueBackend, QueueMessage, ResultRecord, ResultStore, StatStore, StoreError,
    };
    pub use crate::qualified_name;
    pub use crate::queue::Queue;
    pub use crate::serializer::Serializer;
    pub use crate::task::{
        Kwargs, ResultError, ResultHandle, Task, TaskFailure, TaskRegistry, TaskResult,
    };
    pub use crate::wait::Wait;
    pub use crate::worker::{Supervisor, SupervisorConfig, WorkerConfig, WorkerProcess};
}

// Re-export key types at crate root
pub use config::FuturesConfig;
pub use persistence::{
    Backends, ClaimedMessage, ExecutionStat, QueueBackend, QueueMessage, ResultRecord,
    ResultStore, StatStore, StoreError,
};
pub use queue::Queue;
pub use serializer::{SerializationError, Serializer};
pub use task::{
    ExecuteError, Execution, Kwargs, ResultError, ResultHandle, SubmitError, Task, TaskFailure,
    TaskRegistry, TaskResult,
};
pub use wait::Wait;
pub use worker::{
    ProcessHooks, Supervisor, SupervisorConfig, SupervisorError, SupervisorEvent, WorkerConfig,
    WorkerError, WorkerProcess, WorkerState,
};

/// Build a module-qualified task name for a function in scope.
///
/// ```
/// fn add() {}
/// let name = tpq_futures::qualified_name!(add);
/// assert!(name.ends_with("::add"));
/// ```
#[macro_export]
macro_rules! qualified_name {
    ($f:ident) => {
        concat!(module_path!(), "::", stringify!($f))
    };
}
