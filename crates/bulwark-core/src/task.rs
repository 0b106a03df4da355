//! Panic capture for user callbacks.
//!
//! Job handlers, breaker callbacks and scale executors run inside
//! `tokio::spawn` so a panic surfaces as a `JoinError` instead of unwinding
//! through the component. These helpers turn that into a plain value.

use std::any::Any;

use tokio::task::JoinError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    Panicked(String),
    Cancelled,
}

/// Best-effort string form of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub fn join_outcome<T>(result: Result<T, JoinError>) -> Result<T, TaskFailure> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            Err(TaskFailure::Panicked(panic_message(payload.as_ref())))
        }
        Err(_) => Err(TaskFailure::Cancelled),
    }
}
