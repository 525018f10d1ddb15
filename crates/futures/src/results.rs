//! Result records: encoding outcomes and reading them back
//!
//! An outcome is stored as an encoded [`Outcome`], so a failure decodes into
//! the same [`TaskFailure`] the function returned.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::persistence::{ResultRecord, ResultStore, StoreError};
use crate::serializer::{SerializationError, Serializer};
use crate::task::TaskFailure;

/// Error type for reading an outcome
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    /// The invocation failed; carries the original failure
    #[error("task failed: {0}")]
    Failed(TaskFailure),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to decode result: {0}")]
    Serialization(#[from] SerializationError),
}

impl ResultError {
    /// The original failure, if this is one
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Outcome<T> {
    Success(T),
    Failure(TaskFailure),
}

/// Encode a success value for storage
pub(crate) fn encode_success<T: Serialize>(
    serializer: Serializer,
    value: &T,
) -> Result<String, SerializationError> {
    serializer.serialize(&Outcome::Success(value))
}

/// Encode a failure for storage
pub(crate) fn encode_failure(
    serializer: Serializer,
    failure: &TaskFailure,
) -> Result<String, SerializationError> {
    serializer.serialize(&Outcome::<()>::Failure(failure.clone()))
}

/// Write (or overwrite) the encoded outcome of `uid`
pub async fn set_result(
    store: &dyn ResultStore,
    uid: &str,
    obj: String,
    progress: i32,
) -> Result<(), StoreError> {
    store.set(ResultRecord::new(uid, obj, progress)).await
}

/// Read the outcome of `uid`.
///
/// `Ok(None)` when no record exists yet (or it expired); a recorded failure
/// comes back as [`ResultError::Failed`].
pub async fn get_result<R: DeserializeOwned>(
    store: &dyn ResultStore,
    serializer: Serializer,
    uid: &str,
) -> Result<Option<R>, ResultError> {
    let Some(record) = store.get(uid).await? else {
        trace!(uid, "no result yet");
        return Ok(None);
    };

    match serializer.deserialize::<Outcome<R>>(&record.obj)? {
        Outcome::Success(value) => Ok(Some(value)),
        Outcome::Failure(failure) => Err(ResultError::Failed(failure)),
    }
}
