//! Caller-side handle to a submitted invocation

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::persistence::ResultStore;
use crate::results::{get_result, ResultError};
use crate::serializer::Serializer;
use crate::wait::Wait;

/// Default interval between result store polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the future outcome of one invocation
pub struct ResultHandle<R> {
    uid: String,
    serializer: Serializer,
    results: Arc<dyn ResultStore>,
    poll_interval: Duration,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for ResultHandle<R> {
    fn clone(&self) -> Self {
        Self {
            uid: self.uid.clone(),
            serializer: self.serializer,
            results: Arc::clone(&self.results),
            poll_interval: self.poll_interval,
            _result: PhantomData,
        }
    }
}

impl<R> fmt::Debug for ResultHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("uid", &self.uid)
            .field("serializer", &self.serializer)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<R: DeserializeOwned> ResultHandle<R> {
    /// Bind a handle to invocation `uid`
    pub fn new(uid: impl Into<String>, serializer: Serializer, results: Arc<dyn ResultStore>) -> Self {
        Self {
            uid: uid.into(),
            serializer,
            results,
            poll_interval: DEFAULT_POLL_INTERVAL,
            _result: PhantomData,
        }
    }

    /// Change how often the result store is polled
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Check once for the outcome
    pub async fn result(&self) -> Result<Option<R>, ResultError> {
        get_result(self.results.as_ref(), self.serializer, &self.uid).await
    }

    /// Wait for the outcome.
    ///
    /// Polls every `poll_interval` and also wakes early on the store's write
    /// notifications when it has them. Returns `Ok(None)` when `wait`
    /// elapses first; `Wait::IMMEDIATE` checks exactly once.
    pub async fn wait(&self, wait: Wait) -> Result<Option<R>, ResultError> {
        let deadline = wait.deadline();
        let mut written = self.results.subscribe();

        loop {
            if let Some(value) = self.result().await? {
                return Ok(Some(value));
            }

            let mut sleep_for = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                sleep_for = sleep_for.min(deadline - now);
            }

            match written.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = written_for(rx, &self.uid) => {}
                    }
                }
                None => tokio::time::sleep(sleep_for).await,
            }
        }
    }
}

/// Resolve once `uid` is announced, or when notifications become unreliable
async fn written_for(rx: &mut broadcast::Receiver<String>, uid: &str) {
    loop {
        match rx.recv().await {
            Ok(written) if written == uid => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryResultStore;
    use crate::results::{encode_success, set_result};

    fn store() -> Arc<InMemoryResultStore> {
        Arc::new(InMemoryResultStore::new(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_immediate_wait_does_not_block() {
        let results = store();
        let handle: ResultHandle<i64> = ResultHandle::new("u-1", Serializer::Json, results)
            .with_poll_interval(Duration::from_secs(3600));

        let started = std::time::Instant::now();
        assert!(handle.wait(Wait::IMMEDIATE).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let handle: ResultHandle<i64> = ResultHandle::new("u-1", Serializer::Json, store())
            .with_poll_interval(Duration::from_millis(10));

        let value = handle
            .wait(Wait::For(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_write() {
        let results = store();
        let handle: ResultHandle<i64> = ResultHandle::new("u-1", Serializer::Json, results.clone())
            .with_poll_interval(Duration::from_secs(3600));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let obj = encode_success(Serializer::Json, &9i64).unwrap();
            set_result(results.as_ref(), "u-1", obj, 0).await.unwrap();
        });

        let value = tokio::time::timeout(Duration::from_secs(5), handle.wait(Wait::Forever))
            .await
            .expect("wait should be woken by the write notification")
            .unwrap();
        assert_eq!(value, Some(9));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_with_maximal_duration() {
        let results = store();
        let obj = encode_success(Serializer::Json, &4i64).unwrap();
        set_result(results.as_ref(), "u-1", obj, 0).await.unwrap();

        let handle: ResultHandle<i64> = ResultHandle::new("u-1", Serializer::Json, results.clone());
        assert_eq!(handle.wait(Wait::For(Duration::MAX)).await.unwrap(), Some(4));

        let missing: ResultHandle<i64> = ResultHandle::new("u-2", Serializer::Json, results)
            .with_poll_interval(Duration::from_millis(10));
        let pending =
            tokio::time::timeout(Duration::from_millis(50), missing.wait(Wait::For(Duration::MAX))).await;
        assert!(pending.is_err());
    }
}
