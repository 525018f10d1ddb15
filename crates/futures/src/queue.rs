//! Named queue adapter
//!
//! Binds a queue name to a [`QueueBackend`] so callers never pass the name
//! around separately.

use std::sync::Arc;

use tracing::debug;

use crate::persistence::{ClaimedMessage, QueueBackend, QueueMessage, StoreError};
use crate::wait::Wait;

/// A single named queue on some backend
#[derive(Clone)]
pub struct Queue {
    name: String,
    backend: Arc<dyn QueueBackend>,
}

impl Queue {
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an invocation message
    pub async fn enqueue(&self, message: QueueMessage) -> Result<i64, StoreError> {
        self.backend.enqueue(&self.name, message).await
    }

    /// Append a message produced outside this crate.
    ///
    /// The value must be a mapping carrying `uid`, `name`, `args` and
    /// `kwargs` strings; anything else is rejected before reaching the
    /// backend.
    pub async fn enqueue_json(&self, value: serde_json::Value) -> Result<i64, StoreError> {
        if !value.is_object() {
            return Err(StoreError::InvalidMessage(format!(
                "expected a mapping, got {}",
                json_kind(&value)
            )));
        }
        let message: QueueMessage = serde_json::from_value(value)
            .map_err(|e| StoreError::InvalidMessage(e.to_string()))?;

        debug!(queue = %self.name, uid = %message.uid, task = %message.name, "accepted external message");
        self.enqueue(message).await
    }

    /// Claim the next message, blocking up to `wait`
    pub async fn dequeue(&self, wait: Wait) -> Result<Option<ClaimedMessage>, StoreError> {
        self.backend.dequeue(&self.name, wait).await
    }

    /// Drop all pending messages
    pub async fn clear(&self) -> Result<u64, StoreError> {
        self.backend.clear(&self.name).await
    }

    /// Number of pending messages
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.backend.count(&self.name).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
