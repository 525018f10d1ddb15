//! Execution statistics bracketing
//!
//! [`ExecutionGuard`] pairs every `record_start` with exactly one
//! `record_end`, including when the executing future is dropped early.

use std::sync::Arc;

use tracing::warn;

use crate::persistence::{StatStore, StoreError};

/// Scoped `running` counter for one invocation
#[must_use = "dropping the guard records the execution as ended"]
pub struct ExecutionGuard {
    stats: Arc<dyn StatStore>,
    name: String,
    finished: bool,
}

impl ExecutionGuard {
    /// Record the start of an invocation of `name`
    pub async fn start(stats: Arc<dyn StatStore>, name: &str) -> Result<Self, StoreError> {
        stats.record_start(name).await?;
        Ok(Self {
            stats,
            name: name.to_string(),
            finished: false,
        })
    }

    /// Record the end of the invocation
    pub async fn finish(mut self, failed: bool) -> Result<(), StoreError> {
        self.finished = true;
        self.stats.record_end(&self.name, failed).await
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let stats = Arc::clone(&self.stats);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = stats.record_end(&name, false).await {
                        warn!(task = %name, error = %e, "failed to record abandoned execution");
                    }
                });
            }
            Err(_) => {
                warn!(task = %name, "execution abandoned outside a runtime; running count not released");
            }
        }
    }
}
