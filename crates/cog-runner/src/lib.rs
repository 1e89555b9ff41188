//! cog-runner: orchestration core of a model prediction server.
//!
//! Accepts prediction requests, drives an execution backend through its
//! event protocol, tracks each request's response record and sends
//! webhooks on lifecycle transitions.

pub mod backend;
pub mod clients;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod input;
pub mod logging;
pub mod probe;
pub mod runner;
pub mod schema;
pub mod shutdown;
mod version;
pub mod webhook;

pub use backend::{Backend, BackendError, LocalBackend, LogSink, PredictContext, Predictor, PredictorError};
pub use clients::{ClientManager, HttpUploader, UploadError, Uploader};
pub use config::RunnerConfig;
pub use error::{PredictError, RunnerError};
pub use event::{Event, EventStream};
pub use handler::{HandlerError, PredictionEventHandler, ResponseHandle};
pub use input::{InputError, PreparedInput};
pub use logging::init_tracing;
pub use probe::{ProbeHelper, ReadinessProbe};
pub use runner::{
    PredictionRunner, PredictionTask, SetupTask, TaskOutcome, predict_and_handle_errors, setup,
};
pub use schema::{PredictionOutput, PredictionRequest, PredictionResponse, SetupResult, Status};
pub use shutdown::ShutdownSignal;
pub use version::{RUNNER_VERSION, user_agent};
pub use webhook::{WebhookConfig, WebhookDispatch, WebhookEvent, WebhookSender};
