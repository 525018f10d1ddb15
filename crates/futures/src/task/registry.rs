//! Task registry for type-erased execution
//!
//! Workers only see queue messages: a task name and encoded arguments. The
//! registry maps names back to the typed functions and their serializers.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::definition::{Kwargs, Task, TaskFailure};
use crate::persistence::{Backends, QueueMessage, StoreError};
use crate::results::{encode_failure, encode_success, set_result};
use crate::serializer::{SerializationError, Serializer};
use crate::stats::ExecutionGuard;

/// A decoded call, ready to run; yields the encoded success outcome
pub type PreparedCall = Box<dyn FnOnce() -> Result<String, TaskFailure> + Send>;

/// Type-erased task interface
pub trait ErasedTask: Send + Sync {
    fn name(&self) -> &str;

    fn serializer(&self) -> Serializer;

    /// Decode arguments and bind them to the function
    fn prepare(&self, args: &str, kwargs: &str) -> Result<PreparedCall, SerializationError>;
}

impl<A, R> ErasedTask for Task<A, R>
where
    A: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        Task::name(self)
    }

    fn serializer(&self) -> Serializer {
        Task::serializer(self)
    }

    fn prepare(&self, args: &str, kwargs: &str) -> Result<PreparedCall, SerializationError> {
        let serializer = Task::serializer(self);
        let args: A = serializer.deserialize(args)?;
        let kwargs: Kwargs = serializer.deserialize(kwargs)?;
        let f = self.function();

        Ok(Box::new(move || {
            let value = f(args, kwargs)?;
            encode_success(serializer, &value).map_err(|e| {
                TaskFailure::new("SerializationError", format!("result not serializable: {e}"))
            })
        }))
    }
}

/// Error type for executing a claimed message.
///
/// These are failures of the execution machinery; a failing task function
/// is not an error here, it is recorded as the invocation's outcome.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("task not registered: {0}")]
    UnknownTask(String),

    #[error("failed to decode arguments: {0}")]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary of one executed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub uid: String,
    pub name: String,
    /// The task function returned a failure (or panicked)
    pub failed: bool,
}

/// Registry of tasks a worker can execute
///
/// # Example
///
/// ```
/// use tpq_futures::{Task, TaskRegistry, TaskResult};
///
/// fn add((a, b): (i64, i64)) -> TaskResult<i64> {
///     Ok(a + b)
/// }
///
/// let mut registry = TaskRegistry::new();
/// registry.register(&Task::wrap("tasks::add", add));
/// assert!(registry.contains("tasks::add"));
/// ```
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn ErasedTask>>,
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its name, replacing any previous one
    pub fn register<A, R>(&mut self, task: &Task<A, R>)
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let name = task.name().to_string();
        if self.tasks.insert(name.clone(), Arc::new(task.clone())).is_some() {
            warn!(task = %name, "task registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedTask>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names
    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Execute one claimed message.
    ///
    /// Brackets the call with the task's statistics, catches panics, and
    /// writes the outcome under the message uid. A failing function is
    /// absorbed into the stored outcome; only machinery failures (unknown
    /// task, undecodable arguments, store errors) are returned.
    #[instrument(skip(self, message, backends), fields(uid = %message.uid, task = %message.name))]
    pub async fn execute(
        &self,
        message: &QueueMessage,
        backends: &Backends,
    ) -> Result<Execution, ExecuteError> {
        let task = self
            .get(&message.name)
            .ok_or_else(|| ExecuteError::UnknownTask(message.name.clone()))?;
        let call = task.prepare(&message.args, &message.kwargs)?;
        let serializer = task.serializer();

        let guard = ExecutionGuard::start(backends.stats.clone(), &message.name).await?;

        let outcome = match catch_unwind(AssertUnwindSafe(call)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(TaskFailure::from_panic(payload)),
        };
        let failed = outcome.is_err();

        let obj = match outcome {
            Ok(obj) => {
                debug!("task succeeded");
                Ok(obj)
            }
            Err(failure) => {
                warn!(kind = %failure.kind, message = %failure.message, "task failed");
                encode_failure(serializer, &failure)
            }
        };

        let written = match obj {
            Ok(obj) => set_result(backends.results.as_ref(), &message.uid, obj, 0)
                .await
                .map_err(ExecuteError::from),
            Err(e) => Err(ExecuteError::from(e)),
        };

        guard.finish(failed).await?;
        written?;

        Ok(Execution {
            uid: message.uid.clone(),
            name: message.name.clone(),
            failed,
        })
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .finish()
    }
}
