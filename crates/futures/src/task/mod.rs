//! Task model: definitions, the registry, and result handles

mod definition;
mod handle;
mod registry;

pub use definition::{Kwargs, SubmitError, Task, TaskFailure, TaskResult, DEFAULT_QUEUE};
pub use handle::{ResultHandle, DEFAULT_POLL_INTERVAL};
pub use registry::{ErasedTask, ExecuteError, Execution, PreparedCall, TaskRegistry};

pub use crate::results::ResultError;
