//! Runner-level errors.

use crate::backend::BackendError;
use crate::input::InputError;

/// Errors returned to the caller of the runner.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    /// Backend is at capacity or still initializing. Retry later.
    #[error("runner is busy")]
    Busy,

    #[error("unknown prediction: {0}")]
    UnknownPrediction(String),

    #[error("backend error: {0}")]
    Backend(BackendError),

    /// The task hit an unrecoverable error and process shutdown was requested.
    #[error("{activity} failed with unrecoverable error: {message}")]
    Escalated {
        activity: &'static str,
        message: String,
    },
}

/// Unrecoverable failure of an execution task.
///
/// Returned (instead of a response) only when the backend's state can no
/// longer be trusted. The task supervisor turns it into a shutdown request.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Render an error and its sources, one per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = format!("Error: {}\n", err);
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("Caused by: {}\n", cause));
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn error_chain_lists_sources() {
        let err = Outer(std::io::Error::other("inner"));
        assert_eq!(error_chain(&err), "Error: outer\nCaused by: inner\n");
    }

    #[test]
    fn runner_error_display() {
        assert_eq!(RunnerError::Busy.to_string(), "runner is busy");
        assert_eq!(
            RunnerError::UnknownPrediction("r1".to_string()).to_string(),
            "unknown prediction: r1"
        );
        let escalated = RunnerError::Escalated {
            activity: "setup",
            message: "panicked".to_string(),
        };
        assert_eq!(
            escalated.to_string(),
            "setup failed with unrecoverable error: panicked"
        );
    }
}
