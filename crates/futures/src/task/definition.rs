//! Task definitions
//!
//! A [`Task`] wraps a plain function with a name, a target queue and a
//! serialization strategy. Calling it runs the function in place; submitting
//! it enqueues an invocation for a worker.

use std::any::type_name;
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::handle::ResultHandle;
use crate::config::FuturesConfig;
use crate::persistence::{Backends, QueueMessage, StoreError};
use crate::queue::Queue;
use crate::serializer::{SerializationError, Serializer};

/// Queue used when a task does not name one
pub const DEFAULT_QUEUE: &str = "futures";

/// Captured failure of a task function.
///
/// Travels through the result store unchanged, so a waiter sees the same
/// `kind` and `message` a direct call would have returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    /// Failure category, e.g. `ZeroDivisionError` or an error type name
    pub kind: String,
    pub message: String,
    /// Stack captured where the failure was created
    pub trace: Option<String>,
}

impl TaskFailure {
    /// Create a failure, capturing the current stack
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Some(Backtrace::force_capture().to_string()),
        }
    }

    /// Wrap an error value; its type name becomes the kind
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }

    /// Describe a caught panic
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self {
            kind: "panic".to_string(),
            message,
            trace: None,
        }
    }

    /// Drop the captured stack
    pub fn without_trace(mut self) -> Self {
        self.trace = None;
        self
    }
}

/// `my::Wrapper<other::Inner>` becomes `Wrapper`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::")
        .next()
        .map(|name| name.trim_start_matches('&'))
        .filter(|name| !name.is_empty())
        .unwrap_or("Error")
}

/// Outcome of a task function
pub type TaskResult<R> = Result<R, TaskFailure>;

/// Keyword arguments of an invocation
///
/// # Example
///
/// ```
/// use tpq_futures::Kwargs;
///
/// let kwargs = Kwargs::new().with("scale", 2);
/// assert_eq!(kwargs.get::<i64>("scale").unwrap(), Some(2));
/// assert_eq!(kwargs.get::<i64>("offset").unwrap(), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(BTreeMap<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one argument
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Typed lookup; a present value of the wrong shape is a `TypeError` failure
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> TaskResult<Option<T>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TaskFailure::new("TypeError", format!("argument '{key}': {e}"))),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Error type for submitting an invocation
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to serialize arguments: {0}")]
    Serialization(#[from] SerializationError),

    #[error("failed to enqueue: {0}")]
    Store(#[from] StoreError),
}

type TaskFn<A, R> = dyn Fn(A, Kwargs) -> TaskResult<R> + Send + Sync;

/// A named deferred-executable function
///
/// `A` is the positional argument type (usually a tuple), `R` the return
/// type. Tasks are immutable; the builder methods consume and return them.
///
/// # Example
///
/// ```
/// use tpq_futures::{qualified_name, Task, TaskResult};
///
/// fn add((a, b): (i64, i64)) -> TaskResult<i64> {
///     Ok(a + b)
/// }
///
/// let task = Task::wrap(qualified_name!(add), add).on_queue("q");
/// assert_eq!(task.call((3, 6)).unwrap(), 9);
/// assert_eq!(task.queue_name(), "q");
/// ```
pub struct Task<A, R> {
    name: String,
    queue_name: String,
    serializer: Serializer,
    f: Arc<TaskFn<A, R>>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Task<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            queue_name: self.queue_name.clone(),
            serializer: self.serializer,
            f: Arc::clone(&self.f),
            _types: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for Task<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl<A, R> Task<A, R>
where
    A: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    /// Wrap a function taking positional arguments only
    pub fn wrap<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> TaskResult<R> + Send + Sync + 'static,
    {
        Self::wrap_with_kwargs(name, move |args, _kwargs| f(args))
    }

    /// Wrap a function that also takes keyword arguments
    pub fn wrap_with_kwargs<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A, Kwargs) -> TaskResult<R> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            queue_name: DEFAULT_QUEUE.to_string(),
            serializer: Serializer::default(),
            f: Arc::new(f),
            _types: PhantomData,
        }
    }

    /// Target a different queue
    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Target the queue configured for the deployment
    pub fn with_config(self, config: &FuturesConfig) -> Self {
        self.on_queue(config.queue_name.as_str())
    }

    /// Use a different serialization strategy
    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Run the function in place, with no side effects beyond its own
    pub fn call(&self, args: A) -> TaskResult<R> {
        (self.f)(args, Kwargs::new())
    }

    pub fn call_with_kwargs(&self, args: A, kwargs: Kwargs) -> TaskResult<R> {
        (self.f)(args, kwargs)
    }

    /// Build the queue message for one invocation under a fresh uid
    pub fn invocation(&self, args: &A, kwargs: &Kwargs) -> Result<QueueMessage, SerializationError> {
        Ok(QueueMessage {
            uid: Uuid::now_v7().to_string(),
            name: self.name.clone(),
            args: self.serializer.serialize(args)?,
            kwargs: self.serializer.serialize(kwargs)?,
        })
    }

    /// Enqueue an invocation and return a handle to its future outcome
    pub async fn submit(&self, backends: &Backends, args: A) -> Result<ResultHandle<R>, SubmitError> {
        self.submit_with_kwargs(backends, args, Kwargs::new()).await
    }

    pub async fn submit_with_kwargs(
        &self,
        backends: &Backends,
        args: A,
        kwargs: Kwargs,
    ) -> Result<ResultHandle<R>, SubmitError> {
        let message = self.invocation(&args, &kwargs)?;
        let uid = message.uid.clone();

        Queue::new(self.queue_name.as_str(), backends.queue.clone())
            .enqueue(message)
            .await?;

        debug!(%uid, task = %self.name, queue = %self.queue_name, "submitted invocation");
        Ok(ResultHandle::new(uid, self.serializer, backends.results.clone())
            .with_poll_interval(backends.result_poll_interval))
    }

    pub(crate) fn function(&self) -> Arc<TaskFn<A, R>> {
        Arc::clone(&self.f)
    }
}
