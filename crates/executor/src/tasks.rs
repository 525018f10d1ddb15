//! Tasks this executor knows how to run
//!
//! Producers submit these by name; the names must match on both sides.

use serde::{Deserialize, Serialize};
use tpq_futures::{qualified_name, Kwargs, Serializer, Task, TaskFailure, TaskRegistry, TaskResult};

pub fn add((a, b): (i64, i64)) -> TaskResult<i64> {
    a.checked_add(b)
        .ok_or_else(|| TaskFailure::new("OverflowError", "integer overflow"))
}

pub fn div((a, b): (i64, i64)) -> TaskResult<i64> {
    if b == 0 {
        return Err(TaskFailure::new("ZeroDivisionError", "integer division or modulo by zero"));
    }
    Ok(a / b)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub text: String,
    pub shouted: bool,
}

/// Accepts `shout` as a keyword argument
pub fn greet((name,): (String,), kwargs: Kwargs) -> TaskResult<Greeting> {
    let shouted = kwargs.get::<bool>("shout")?.unwrap_or(false);
    let text = format!("hello, {name}");
    Ok(Greeting {
        text: if shouted { text.to_uppercase() } else { text },
        shouted,
    })
}

pub fn add_task() -> Task<(i64, i64), i64> {
    Task::wrap(qualified_name!(add), add)
}

pub fn div_task() -> Task<(i64, i64), i64> {
    Task::wrap(qualified_name!(div), div)
}

/// JSON-serialized so producers outside Rust can submit it
pub fn greet_task() -> Task<(String,), Greeting> {
    Task::wrap_with_kwargs(qualified_name!(greet), greet).with_serializer(Serializer::Json)
}

/// Registry of every task above, on `queue_name`
pub fn registry(queue_name: &str) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(&add_task().on_queue(queue_name));
    registry.register(&div_task().on_queue(queue_name));
    registry.register(&greet_task().on_queue(queue_name));
    registry
}
