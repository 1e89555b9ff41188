//! Execution backend interface.
//!
//! The backend is the stateful component that actually runs a model. The
//! runner only sees it through this trait: a capacity flag, two event
//! streams (initialization and one prediction), slot bracketing, and
//! control operations.
//!
//! `local` provides an in-process implementation driven by a `Predictor`.

mod local;

use std::time::Duration;

use serde_json::{Map, Value};

use crate::event::EventStream;

pub use local::{LocalBackend, LogSink, PredictContext, Predictor, PredictorError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend cannot start initialization in its current state.
    #[error("invalid backend state: {0}")]
    InvalidState(String),

    #[error("unknown prediction: {0}")]
    UnknownPrediction(String),

    /// The backend died or broke its own invariants; its state is lost.
    #[error("backend crashed: {0}")]
    Crashed(String),

    #[error("{0}")]
    Other(String),
}

pub trait Backend: Send + Sync {
    /// True when no new prediction can be accepted right now.
    fn is_busy(&self) -> bool;

    /// Start initialization. The stream ends with exactly one `Done`.
    fn initialize(&self) -> Result<EventStream, BackendError>;

    /// Claim a concurrency slot for `id` before `execute`.
    fn reserve_slot(&self, id: &str);

    /// Give the slot claimed by `id` back. Idempotent.
    fn release_slot(&self, id: &str);

    /// Run one prediction. The stream ends with exactly one `Done` and
    /// carries a `Heartbeat` roughly every `poll_interval` while the
    /// prediction has nothing else to report.
    fn execute(&self, id: &str, input: Map<String, Value>, poll_interval: Duration) -> EventStream;

    /// Ask the backend to interrupt prediction `id`.
    fn cancel(&self, id: &str) -> Result<(), BackendError>;

    /// Stop the backend unconditionally. Idempotent.
    fn terminate(&self);
}
