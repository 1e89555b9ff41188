//! Event protocol spoken by an execution backend.
//!
//! A backend reports the progress of initialization or of one prediction as a
//! finite, forward-only stream of events that ends with a single `Done`.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Log {
        message: String,
    },

    /// No payload. Gives the consumer a regular point to observe
    /// cancellation and timeouts while the backend is quiet.
    Heartbeat,

    /// Declares whether output is a single value or an appended sequence.
    /// Must precede every `Output` event.
    OutputType {
        multi: bool,
    },

    Output {
        payload: serde_json::Value,
    },

    Done {
        #[serde(default)]
        canceled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Event {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    pub fn output(payload: serde_json::Value) -> Self {
        Self::Output { payload }
    }

    pub fn succeeded() -> Self {
        Self::Done {
            canceled: false,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Done {
            canceled: false,
            error: Some(error.into()),
        }
    }

    pub fn canceled() -> Self {
        Self::Done {
            canceled: true,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Heartbeat => "heartbeat",
            Self::OutputType { .. } => "output_type",
            Self::Output { .. } => "output",
            Self::Done { .. } => "done",
        }
    }
}

/// Stream of events from a backend. An `Err` item means the backend broke
/// mid-stream and its internal state can no longer be trusted.
pub type EventStream = BoxStream<'static, Result<Event, BackendError>>;
