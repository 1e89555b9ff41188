//! Per-prediction event handler.
//!
//! Folds a backend event stream into the prediction's response record and
//! fires webhooks on the way. The record stops changing once it reaches a
//! terminal status.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;

use crate::backend::BackendError;
use crate::clients::{UploadError, Uploader};
use crate::event::{Event, EventStream};
use crate::schema::{PredictionOutput, PredictionRequest, PredictionResponse, Status};
use crate::webhook::{WebhookDispatch, WebhookEvent};

const UNEXPECTED_OUTPUT: &str = "Predictor returned unexpected output";
const MISSING_DONE: &str = "backend event stream ended without a done event";

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Predictor unexpectedly returned multiple outputs")]
    MultipleOutputs,

    #[error("Predictor returned unexpected output")]
    NotStreaming,

    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Shared pointer to a live response record.
///
/// Clones point at the same record. Callers get read access through
/// `snapshot`; only the owning handler mutates it.
#[derive(Clone)]
pub struct ResponseHandle(Arc<Mutex<PredictionResponse>>);

impl ResponseHandle {
    pub(crate) fn new(response: PredictionResponse) -> Self {
        Self(Arc::new(Mutex::new(response)))
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn snapshot(&self) -> PredictionResponse {
        self.lock().clone()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().is_terminal()
    }

    /// True when both handles point at the same record.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut PredictionResponse) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, PredictionResponse> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let response = self.lock();
        f.debug_struct("ResponseHandle")
            .field("id", &response.id)
            .field("status", &response.status)
            .finish()
    }
}

pub struct PredictionEventHandler {
    response: ResponseHandle,
    webhook: Option<Arc<dyn WebhookDispatch>>,
    uploader: Arc<dyn Uploader>,
    upload_url: Option<String>,
    // Declared output shape; `Some(true)` for streamed output.
    multi: Option<bool>,
    done_received: bool,
}

impl PredictionEventHandler {
    pub fn new(
        request: &PredictionRequest,
        webhook: Option<Arc<dyn WebhookDispatch>>,
        uploader: Arc<dyn Uploader>,
        upload_url: Option<String>,
        skip_start_event: bool,
    ) -> Self {
        tracing::info!(target: "cog_runner::prediction", prediction_id = %request.id, "starting prediction");

        let handler = Self {
            response: ResponseHandle::new(PredictionResponse::from_request(request)),
            webhook,
            uploader,
            upload_url,
            multi: None,
            done_received: false,
        };
        if !skip_start_event {
            handler.send_webhook(WebhookEvent::Start);
        }
        handler
    }

    pub fn response(&self) -> ResponseHandle {
        self.response.clone()
    }

    /// False when consumption stopped before the backend reported `Done`,
    /// i.e. the backend may still be working on this prediction.
    pub fn received_done(&self) -> bool {
        self.done_received
    }

    pub async fn set_output(&mut self, value: Value) -> Result<(), HandlerError> {
        if self.response.update(|r| r.output.is_some()) {
            return Err(HandlerError::MultipleOutputs);
        }
        let value = self.upload(value).await?;
        self.response.update(|r| {
            if !r.is_terminal() {
                r.output = Some(PredictionOutput::Single(value));
            }
        });
        Ok(())
    }

    pub async fn append_output(&mut self, value: Value) -> Result<(), HandlerError> {
        let streaming = self
            .response
            .update(|r| matches!(r.output, Some(PredictionOutput::Stream(_))));
        if !streaming {
            return Err(HandlerError::NotStreaming);
        }
        let value = self.upload(value).await?;
        let appended = self.response.update(|r| {
            let terminal = r.is_terminal();
            match &mut r.output {
                Some(PredictionOutput::Stream(items)) if !terminal => {
                    items.push(value);
                    true
                }
                _ => false,
            }
        });
        if appended {
            self.send_webhook(WebhookEvent::Output);
        }
        Ok(())
    }

    pub fn append_logs(&self, logs: &str) {
        let appended = self.response.update(|r| {
            if r.is_terminal() {
                return false;
            }
            r.logs.push_str(logs);
            true
        });
        if appended {
            self.send_webhook(WebhookEvent::Logs);
        }
    }

    pub fn succeeded(&self) {
        self.finish(Status::Succeeded, None);
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.finish(Status::Failed, Some(error.into()));
    }

    pub fn canceled(&self) {
        self.finish(Status::Canceled, None);
    }

    /// Consume `events` until `Done` and return the final record.
    ///
    /// Contract violations by the backend fail the prediction and stop
    /// consumption; an `Err` item from the stream is returned as-is.
    pub async fn handle_event_stream(
        &mut self,
        mut events: EventStream,
    ) -> Result<PredictionResponse, BackendError> {
        while let Some(item) = events.next().await {
            match item? {
                Event::Heartbeat => {}
                Event::Log { message } => self.append_logs(&message),
                Event::OutputType { multi } => {
                    if self.multi.is_some() {
                        self.failed(UNEXPECTED_OUTPUT);
                        break;
                    }
                    self.multi = Some(multi);
                    if multi {
                        self.response
                            .update(|r| r.output = Some(PredictionOutput::Stream(Vec::new())));
                    }
                }
                Event::Output { payload } => {
                    let result = match self.multi {
                        None => {
                            self.failed(UNEXPECTED_OUTPUT);
                            break;
                        }
                        Some(true) => self.append_output(payload).await,
                        Some(false) => self.set_output(payload).await,
                    };
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Rejecting prediction output");
                        self.failed(e.to_string());
                        break;
                    }
                }
                Event::Done { canceled, error } => {
                    self.done_received = true;
                    match (canceled, error) {
                        (true, _) => self.canceled(),
                        (false, Some(error)) => self.failed(error),
                        (false, None) => self.succeeded(),
                    }
                    break;
                }
            }
        }

        if !self.response.is_terminal() {
            self.failed(MISSING_DONE);
        }
        Ok(self.response.snapshot())
    }

    async fn upload(&self, value: Value) -> Result<Value, UploadError> {
        self.uploader.upload(value, self.upload_url.as_deref()).await
    }

    fn finish(&self, status: Status, error: Option<String>) {
        let finished = self.response.update(|r| {
            if r.is_terminal() {
                return None;
            }
            let completed_at = Utc::now();
            r.status = status;
            r.completed_at = Some(completed_at);
            if status == Status::Succeeded {
                let started_at = r.started_at.unwrap_or(completed_at);
                let predict_time = (completed_at - started_at)
                    .to_std()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                let mut metrics = r.metrics.take().unwrap_or_default();
                metrics.insert("predict_time".to_string(), Value::from(predict_time));
                r.metrics = Some(metrics);
            }
            if status == Status::Failed {
                r.error = error;
            }
            Some((r.id.clone(), r.predict_time(), r.error.clone()))
        });

        let Some((id, predict_time, error)) = finished else {
            return;
        };
        match status {
            Status::Succeeded => tracing::info!(
                target: "cog_runner::prediction",
                prediction_id = %id,
                predict_time,
                "prediction succeeded"
            ),
            Status::Canceled => tracing::info!(
                target: "cog_runner::prediction",
                prediction_id = %id,
                "prediction canceled"
            ),
            _ => tracing::info!(
                target: "cog_runner::prediction",
                prediction_id = %id,
                error = error.as_deref().unwrap_or_default(),
                "prediction failed"
            ),
        }
        self.send_webhook(WebhookEvent::Completed);
    }

    fn send_webhook(&self, event: WebhookEvent) {
        if let Some(webhook) = &self.webhook {
            let payload = self.response.update(|r| r.to_payload());
            webhook.dispatch(event, payload);
        }
    }
}
