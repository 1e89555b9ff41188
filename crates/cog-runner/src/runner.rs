//! Prediction runner.
//!
//! Owns the backend handle and the table of in-flight predictions. Every
//! initialization and prediction runs on its own tokio task; a supervisor
//! task awaits it, removes the in-flight entry, and turns unrecoverable
//! failures into a process shutdown request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

use crate::backend::{Backend, BackendError};
use crate::clients::ClientManager;
use crate::config::RunnerConfig;
use crate::error::{PredictError, RunnerError, error_chain};
use crate::event::Event;
use crate::handler::{PredictionEventHandler, ResponseHandle};
use crate::input::PreparedInput;
use crate::probe::ReadinessProbe;
use crate::schema::{PredictionRequest, PredictionResponse, SetupResult, Status};
use crate::shutdown::ShutdownSignal;

const MISSING_SETUP_DONE: &str = "Error: did not receive 'done' event from setup!\n";

/// How a prediction task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task returned a final response, whatever its status.
    Completed(PredictionResponse),
    /// The task hit an unrecoverable error and shutdown was requested.
    Failed(String),
    /// The task was aborted by `shutdown()`.
    Aborted,
}

/// Handle to await a prediction task. Clones refer to the same task.
#[derive(Clone)]
pub struct PredictionTask {
    id: String,
    done: watch::Receiver<Option<TaskOutcome>>,
    abort: AbortHandle,
}

impl PredictionTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(&self) -> TaskOutcome {
        let mut done = self.done.clone();
        match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(TaskOutcome::Aborted),
            // Supervisor went away without reporting.
            Err(_) => TaskOutcome::Aborted,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// True when both handles belong to the same task.
    pub fn same_task(&self, other: &Self) -> bool {
        self.done.same_channel(&other.done)
    }

    fn abort(&self) {
        self.abort.abort();
    }
}

impl std::fmt::Debug for PredictionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionTask")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Handle to await backend initialization.
pub struct SetupTask {
    handle: JoinHandle<Result<SetupResult, RunnerError>>,
}

impl SetupTask {
    pub async fn wait(self) -> Result<SetupResult, RunnerError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(RunnerError::Escalated {
                activity: "setup",
                message: e.to_string(),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Clone)]
struct InFlight {
    response: ResponseHandle,
    task: PredictionTask,
}

pub struct PredictionRunner {
    backend: Arc<dyn Backend>,
    config: RunnerConfig,
    clients: ClientManager,
    probe: Arc<dyn ReadinessProbe>,
    shutdown: ShutdownSignal,
    predictions: Arc<DashMap<String, InFlight>>,
}

impl PredictionRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: RunnerConfig,
        clients: ClientManager,
        probe: Arc<dyn ReadinessProbe>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            backend,
            config,
            clients,
            probe,
            shutdown,
            predictions: Arc::new(DashMap::new()),
        }
    }

    /// Start backend initialization in the background.
    pub fn initialize(&self) -> SetupTask {
        let driver = tokio::spawn(
            setup(Arc::clone(&self.backend), Arc::clone(&self.probe))
                .instrument(tracing::info_span!("setup")),
        );

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            match driver.await {
                Ok(result) => result,
                Err(e) => {
                    let message = e.to_string();
                    escalate(&shutdown, "setup", &message);
                    Err(RunnerError::Escalated {
                        activity: "setup",
                        message,
                    })
                }
            }
        });

        SetupTask { handle }
    }

    /// Accept a prediction and start executing it.
    ///
    /// Accepting an id that is already in flight returns the existing pair.
    pub fn accept(
        &self,
        request: PredictionRequest,
    ) -> Result<(ResponseHandle, PredictionTask), RunnerError> {
        // The shard lock is held until the entry is inserted, so the check
        // and the registration cannot interleave with another accept.
        let vacant = match self.predictions.entry(request.id.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                return Ok((existing.response.clone(), existing.task.clone()));
            }
            Entry::Vacant(vacant) => vacant,
        };

        if self.backend.is_busy() {
            return Err(RunnerError::Busy);
        }

        let id = request.id.clone();
        let span = tracing::info_span!("prediction", prediction_id = %id);

        let upload_url = request
            .output_file_prefix
            .clone()
            .or_else(|| self.config.upload_url.clone());
        let handler = span.in_scope(|| {
            PredictionEventHandler::new(
                &request,
                self.clients
                    .make_webhook_sender(request.webhook.as_deref(), &request.webhook_events_filter),
                self.clients.uploader(),
                upload_url,
                self.config.skip_start_event,
            )
        });
        let response = handler.response();

        self.backend.reserve_slot(&id);
        let exec = tokio::spawn(
            predict_and_handle_errors(
                Arc::clone(&self.backend),
                handler,
                request,
                self.clients.download_client().clone(),
                self.config.poll_interval,
            )
            .instrument(span),
        );

        let (done_tx, done_rx) = watch::channel(None);
        let task = PredictionTask {
            id: id.clone(),
            done: done_rx,
            abort: exec.abort_handle(),
        };

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let predictions = Arc::clone(&self.predictions);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = registered_rx.await;
            let outcome = match exec.await {
                Ok(Ok(response)) => TaskOutcome::Completed(response),
                Ok(Err(e)) => {
                    escalate(&shutdown, "prediction", &error_chain(&e));
                    TaskOutcome::Failed(e.to_string())
                }
                Err(e) if e.is_cancelled() => TaskOutcome::Aborted,
                Err(e) => {
                    let message = e.to_string();
                    escalate(&shutdown, "prediction", &message);
                    TaskOutcome::Failed(message)
                }
            };
            predictions.remove(&id);
            done_tx.send_replace(Some(outcome));
        });

        vacant.insert(InFlight {
            response: response.clone(),
            task: task.clone(),
        });
        let _ = registered_tx.send(());

        Ok((response, task))
    }

    pub fn is_busy(&self) -> bool {
        self.backend.is_busy()
    }

    /// Ask the backend to interrupt prediction `id`.
    pub fn cancel(&self, id: &str) -> Result<(), RunnerError> {
        match self.backend.cancel(id) {
            Ok(()) => Ok(()),
            Err(BackendError::UnknownPrediction(_)) => {
                Err(RunnerError::UnknownPrediction(id.to_string()))
            }
            Err(e) => Err(RunnerError::Backend(e)),
        }
    }

    /// Abort every in-flight task and terminate the backend.
    pub fn shutdown(&self) {
        let tasks: Vec<PredictionTask> = self
            .predictions
            .iter()
            .map(|entry| entry.task.clone())
            .collect();
        for task in &tasks {
            task.abort();
        }
        tracing::info!(aborted = tasks.len(), "Runner shutting down");
        self.backend.terminate();
    }

    /// The in-flight pair for `id`, if any.
    pub fn get(&self, id: &str) -> Option<(ResponseHandle, PredictionTask)> {
        self.predictions
            .get(id)
            .map(|entry| (entry.response.clone(), entry.task.clone()))
    }

    pub fn in_flight(&self) -> usize {
        self.predictions.len()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

fn escalate(shutdown: &ShutdownSignal, activity: &'static str, message: &str) {
    tracing::error!(activity, error = %message, "caught exception while running {activity}");
    shutdown.set();
}

/// Run backend initialization and summarize it.
///
/// Fails only with `Busy`, when the backend refuses to start initializing.
pub async fn setup(
    backend: Arc<dyn Backend>,
    probe: Arc<dyn ReadinessProbe>,
) -> Result<SetupResult, RunnerError> {
    let started_at = Utc::now();
    let mut logs = String::new();

    let status = match backend.initialize() {
        Err(BackendError::InvalidState(reason)) => {
            tracing::warn!(%reason, "Backend refused to initialize");
            return Err(RunnerError::Busy);
        }
        Err(e) => {
            tracing::error!(error = %e, "Backend failed to start initialization");
            logs.push_str(&error_chain(&e));
            Status::Failed
        }
        Ok(mut events) => {
            let mut status = None;
            while let Some(item) = events.next().await {
                match item {
                    Ok(Event::Log { message }) => logs.push_str(&message),
                    Ok(Event::Done { error, .. }) => {
                        if let Some(error) = &error {
                            tracing::error!(%error, "Setup failed");
                        }
                        status = Some(if error.is_some() {
                            Status::Failed
                        } else {
                            Status::Succeeded
                        });
                        break;
                    }
                    Ok(Event::Heartbeat) => {}
                    Ok(other) => {
                        tracing::warn!(kind = other.kind(), "Ignoring unexpected event during setup");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Setup event stream failed");
                        logs.push_str(&error_chain(&e));
                        status = Some(Status::Failed);
                        break;
                    }
                }
            }
            status.unwrap_or_else(|| {
                logs.push_str(MISSING_SETUP_DONE);
                Status::Failed
            })
        }
    };

    let completed_at = Utc::now();
    if status == Status::Succeeded {
        probe.ready();
    }
    tracing::info!(%status, "Setup finished");

    Ok(SetupResult {
        started_at,
        completed_at,
        logs,
        status,
    })
}

/// Execute one prediction and classify its failures.
///
/// `Ok` carries the final response for every request-scoped outcome,
/// including failed ones. `Err` means the backend can no longer be trusted.
pub async fn predict_and_handle_errors(
    backend: Arc<dyn Backend>,
    mut handler: PredictionEventHandler,
    request: PredictionRequest,
    client: reqwest::Client,
    poll_interval: Duration,
) -> Result<PredictionResponse, PredictError> {
    let id = request.id;

    let prepared = match PreparedInput::prepare(&request.input, &client).await {
        Ok(prepared) => prepared,
        Err(e) if e.is_request_scoped() => {
            tracing::warn!(error = %e, "failed to download url path from input");
            handler.append_logs(&error_chain(&e));
            handler.failed(e.to_string());
            backend.release_slot(&id);
            return Ok(handler.response().snapshot());
        }
        Err(e) => {
            handler.append_logs(&error_chain(&e));
            handler.failed(e.to_string());
            return Err(e.into());
        }
    };

    let events = backend.execute(&id, prepared.payload().clone(), poll_interval);
    match handler.handle_event_stream(events).await {
        Ok(response) => {
            if !handler.received_done() {
                // Stopped on a contract violation; the backend may still be running it.
                if let Err(e) = backend.cancel(&id) {
                    tracing::debug!(error = %e, "Cancel after early stop failed");
                }
            }
            backend.release_slot(&id);
            Ok(response)
        }
        Err(e) => {
            handler.append_logs(&error_chain(&e));
            handler.failed(e.to_string());
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Map, Value, json};

    use crate::backend::{LocalBackend, PredictContext, Predictor, PredictorError};
    use crate::clients::{UploadError, Uploader};
    use crate::event::EventStream;
    use crate::handler::tests::FailingUploader;
    use crate::schema::PredictionOutput;

    type Item = Result<Event, BackendError>;

    #[derive(Default)]
    struct ScriptedBackend {
        busy: AtomicBool,
        hold: bool,
        init_error: Option<BackendError>,
        setup_events: Mutex<Option<Vec<Item>>>,
        predict_events: Vec<Item>,
        reserved: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
        cancels: Mutex<Vec<String>>,
        executes: AtomicUsize,
        terminated: AtomicBool,
    }

    impl ScriptedBackend {
        fn predicting(events: Vec<Item>) -> Self {
            Self {
                predict_events: events,
                ..Default::default()
            }
        }

        fn setting_up(events: Vec<Item>) -> Self {
            Self {
                setup_events: Mutex::new(Some(events)),
                ..Default::default()
            }
        }

        /// Keep prediction streams open after the scripted events.
        fn holding(mut self) -> Self {
            self.hold = true;
            self
        }

        fn released(&self) -> Vec<String> {
            self.released.lock().unwrap().clone()
        }
    }

    impl Backend for ScriptedBackend {
        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        fn initialize(&self) -> Result<EventStream, BackendError> {
            if let Some(e) = &self.init_error {
                return Err(e.clone());
            }
            let events = self.setup_events.lock().unwrap().take().unwrap_or_default();
            Ok(futures::stream::iter(events).boxed())
        }

        fn reserve_slot(&self, id: &str) {
            self.reserved.lock().unwrap().push(id.to_string());
        }

        fn release_slot(&self, id: &str) {
            self.released.lock().unwrap().push(id.to_string());
        }

        fn execute(&self, _id: &str, _input: Map<String, Value>, _poll: Duration) -> EventStream {
            self.executes.fetch_add(1, Ordering::SeqCst);
            let events = futures::stream::iter(self.predict_events.clone());
            if self.hold {
                events.chain(futures::stream::pending()).boxed()
            } else {
                events.boxed()
            }
        }

        fn cancel(&self, id: &str) -> Result<(), BackendError> {
            if !self.reserved.lock().unwrap().iter().any(|r| r == id) {
                return Err(BackendError::UnknownPrediction(id.to_string()));
            }
            self.cancels.lock().unwrap().push(id.to_string());
            Ok(())
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingProbe(AtomicUsize);

    impl ReadinessProbe for CountingProbe {
        fn ready(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runner_with(backend: Arc<dyn Backend>, clients: ClientManager) -> PredictionRunner {
        PredictionRunner::new(
            backend,
            RunnerConfig::default(),
            clients,
            Arc::new(CountingProbe::default()),
            ShutdownSignal::new(),
        )
    }

    fn runner(backend: Arc<ScriptedBackend>) -> PredictionRunner {
        let clients = ClientManager::new(&RunnerConfig::default()).unwrap();
        runner_with(backend, clients)
    }

    fn request(id: &str, input: Value) -> PredictionRequest {
        let Value::Object(input) = input else {
            panic!("input must be an object");
        };
        PredictionRequest::new(id, input)
    }

    fn completed(outcome: TaskOutcome) -> PredictionResponse {
        match outcome {
            TaskOutcome::Completed(response) => response,
            other => panic!("expected completed task, got {other:?}"),
        }
    }

    fn single_output_script(value: Value) -> Vec<Item> {
        vec![
            Ok(Event::OutputType { multi: false }),
            Ok(Event::Heartbeat),
            Ok(Event::output(value)),
            Ok(Event::succeeded()),
        ]
    }

    #[tokio::test]
    async fn accept_runs_prediction_to_completion() {
        let backend = Arc::new(ScriptedBackend::predicting(single_output_script(json!(10))));
        let runner = runner(backend.clone());

        let (response, task) = runner.accept(request("r1", json!({"x": 5}))).unwrap();
        assert_eq!(task.id(), "r1");

        let final_response = completed(task.wait().await);
        assert_eq!(final_response.status, Status::Succeeded);
        assert_eq!(final_response.output, Some(PredictionOutput::Single(json!(10))));
        assert!(final_response.predict_time().unwrap() >= 0.0);
        assert_eq!(response.snapshot(), final_response);

        assert!(task.is_finished());
        assert_eq!(runner.in_flight(), 0);
        assert_eq!(backend.released(), vec!["r1".to_string()]);
        assert!(!runner.shutdown_signal().is_set());
    }

    #[tokio::test]
    async fn accept_twice_returns_same_pair() {
        let backend = Arc::new(ScriptedBackend::predicting(vec![]).holding());
        let runner = runner(backend.clone());

        let (first_response, first_task) = runner.accept(request("r1", json!({}))).unwrap();
        backend.busy.store(true, Ordering::SeqCst);
        let (second_response, second_task) = runner.accept(request("r1", json!({}))).unwrap();

        assert!(first_response.ptr_eq(&second_response));
        assert!(first_task.same_task(&second_task));
        assert_eq!(backend.reserved.lock().unwrap().len(), 1);
        assert_eq!(runner.in_flight(), 1);
        assert!(runner.get("r1").is_some());

        runner.shutdown();
    }

    #[tokio::test]
    async fn busy_backend_rejects_new_ids() {
        let backend = Arc::new(ScriptedBackend::predicting(vec![]));
        backend.busy.store(true, Ordering::SeqCst);
        let runner = runner(backend.clone());

        assert!(runner.is_busy());
        assert!(matches!(
            runner.accept(request("r2", json!({}))),
            Err(RunnerError::Busy)
        ));
        assert!(backend.reserved.lock().unwrap().is_empty());
        assert_eq!(runner.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_and_tracked() {
        let backend = Arc::new(ScriptedBackend::predicting(vec![]).holding());
        let runner = runner(backend.clone());

        assert!(matches!(
            runner.cancel("nope"),
            Err(RunnerError::UnknownPrediction(id)) if id == "nope"
        ));

        runner.accept(request("r1", json!({}))).unwrap();
        runner.cancel("r1").unwrap();
        assert_eq!(*backend.cancels.lock().unwrap(), vec!["r1".to_string()]);

        runner.shutdown();
    }

    #[tokio::test]
    async fn upload_failure_is_not_escalated() {
        let backend = Arc::new(ScriptedBackend::predicting(single_output_script(json!("file"))));
        let clients = ClientManager::new(&RunnerConfig::default())
            .unwrap()
            .with_uploader(Arc::new(FailingUploader));
        let runner = runner_with(backend.clone(), clients);

        let (_, task) = runner.accept(request("r1", json!({}))).unwrap();
        let response = completed(task.wait().await);

        assert_eq!(response.status, Status::Failed);
        assert_eq!(
            response.error.as_deref(),
            Some("Got error trying to upload output files")
        );
        assert!(!runner.shutdown_signal().is_set());
        assert_eq!(backend.released(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn backend_crash_escalates() {
        let backend = Arc::new(ScriptedBackend::predicting(vec![
            Ok(Event::log("working\n")),
            Err(BackendError::Crashed("worker died".to_string())),
        ]));
        let runner = runner(backend.clone());

        let (response, task) = runner.accept(request("r1", json!({}))).unwrap();
        let outcome = task.wait().await;

        assert!(matches!(outcome, TaskOutcome::Failed(msg) if msg == "backend crashed: worker died"));
        assert!(runner.shutdown_signal().is_set());

        let response = response.snapshot();
        assert_eq!(response.status, Status::Failed);
        assert_eq!(response.error.as_deref(), Some("backend crashed: worker died"));
        assert!(response.logs.starts_with("working\n"));
        assert!(response.logs.contains("Error: backend crashed: worker died"));
        assert!(backend.released().is_empty());
    }

    #[tokio::test]
    async fn download_failure_is_request_scoped() {
        let backend = Arc::new(ScriptedBackend::predicting(single_output_script(json!(1))));
        let runner = runner(backend.clone());

        let (_, task) = runner
            .accept(request("r1", json!({"image": "http://127.0.0.1:1/cat.png"})))
            .unwrap();
        let response = completed(task.wait().await);

        assert_eq!(response.status, Status::Failed);
        assert!(response.error.unwrap().contains("127.0.0.1:1/cat.png"));
        assert!(response.logs.starts_with("Error: "));
        assert_eq!(backend.executes.load(Ordering::SeqCst), 0);
        assert_eq!(backend.released(), vec!["r1".to_string()]);
        assert!(!runner.shutdown_signal().is_set());
    }

    #[tokio::test]
    async fn shutdown_aborts_in_flight_tasks() {
        let backend = Arc::new(ScriptedBackend::predicting(vec![]).holding());
        let runner = runner(backend.clone());

        let (_, task) = runner.accept(request("r1", json!({}))).unwrap();
        runner.shutdown();

        assert!(matches!(task.wait().await, TaskOutcome::Aborted));
        assert!(backend.terminated.load(Ordering::SeqCst));
        assert_eq!(runner.in_flight(), 0);
        assert!(!runner.shutdown_signal().is_set());
    }

    #[tokio::test]
    async fn setup_collects_logs_and_signals_ready() {
        let backend = Arc::new(ScriptedBackend::setting_up(vec![
            Ok(Event::log("loading weights\n")),
            Ok(Event::Heartbeat),
            Ok(Event::succeeded()),
        ]));
        let probe = Arc::new(CountingProbe::default());

        let result = setup(backend, probe.clone()).await.unwrap();
        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(result.logs, "loading weights\n");
        assert!(result.completed_at >= result.started_at);
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn setup_without_done_fails() {
        let backend = Arc::new(ScriptedBackend::setting_up(vec![Ok(Event::log("partial\n"))]));
        let probe = Arc::new(CountingProbe::default());

        let result = setup(backend, probe.clone()).await.unwrap();
        assert_eq!(result.status, Status::Failed);
        assert_eq!(
            result.logs,
            "partial\nError: did not receive 'done' event from setup!\n"
        );
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn setup_done_with_error_fails() {
        let backend = Arc::new(ScriptedBackend::setting_up(vec![Ok(Event::failed("no gpu"))]));
        let probe = Arc::new(CountingProbe::default());

        let result = setup(backend, probe.clone()).await.unwrap();
        assert_eq!(result.status, Status::Failed);
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn setup_stream_error_fails_with_trace() {
        let backend = Arc::new(ScriptedBackend::setting_up(vec![
            Ok(Event::log("a\n")),
            Err(BackendError::Crashed("segfault".to_string())),
        ]));

        let result = setup(backend, Arc::new(CountingProbe::default())).await.unwrap();
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.logs, "a\nError: backend crashed: segfault\n");
    }

    #[tokio::test]
    async fn setup_invalid_state_is_busy() {
        let backend = Arc::new(ScriptedBackend {
            init_error: Some(BackendError::InvalidState("Ready".to_string())),
            ..Default::default()
        });
        let runner = runner(backend);

        assert!(matches!(runner.initialize().wait().await, Err(RunnerError::Busy)));
        assert!(!runner.shutdown_signal().is_set());
    }

    struct PanickingUploader;

    #[async_trait]
    impl Uploader for PanickingUploader {
        async fn upload(&self, _output: Value, _destination: Option<&str>) -> Result<Value, UploadError> {
            panic!("uploader bug");
        }
    }

    #[tokio::test]
    async fn execution_task_panic_escalates() {
        let backend = Arc::new(ScriptedBackend::predicting(single_output_script(json!("file"))));
        let clients = ClientManager::new(&RunnerConfig::default())
            .unwrap()
            .with_uploader(Arc::new(PanickingUploader));
        let runner = runner_with(backend.clone(), clients);

        let (_, task) = runner.accept(request("r1", json!({}))).unwrap();

        assert!(matches!(task.wait().await, TaskOutcome::Failed(_)));
        assert!(runner.shutdown_signal().is_set());
        assert_eq!(runner.in_flight(), 0);
        assert!(backend.released().is_empty());
    }

    struct PanickingReadiness;

    impl ReadinessProbe for PanickingReadiness {
        fn ready(&self) {
            panic!("readiness file bug");
        }
    }

    #[tokio::test]
    async fn setup_driver_panic_escalates() {
        let backend = Arc::new(ScriptedBackend::setting_up(vec![Ok(Event::succeeded())]));
        let runner = PredictionRunner::new(
            backend,
            RunnerConfig::default(),
            ClientManager::new(&RunnerConfig::default()).unwrap(),
            Arc::new(PanickingReadiness),
            ShutdownSignal::new(),
        );

        let result = runner.initialize().wait().await;

        assert!(matches!(
            result,
            Err(RunnerError::Escalated { activity: "setup", .. })
        ));
        assert!(runner.shutdown_signal().is_set());
    }

    #[tokio::test]
    async fn early_stop_cancels_backend_before_release() {
        let backend = Arc::new(ScriptedBackend::predicting(vec![
            Ok(Event::output(json!(1))),
            Ok(Event::succeeded()),
        ]));
        let runner = runner(backend.clone());

        let (_, task) = runner.accept(request("r1", json!({}))).unwrap();
        let response = completed(task.wait().await);

        assert_eq!(response.status, Status::Failed);
        assert_eq!(*backend.cancels.lock().unwrap(), vec!["r1".to_string()]);
        assert_eq!(backend.released(), vec!["r1".to_string()]);
        assert!(!runner.shutdown_signal().is_set());
    }

    #[tokio::test]
    async fn completed_stream_does_not_cancel() {
        let backend = Arc::new(ScriptedBackend::predicting(single_output_script(json!(1))));
        let runner = runner(backend.clone());

        let (_, task) = runner.accept(request("r1", json!({}))).unwrap();
        completed(task.wait().await);

        assert!(backend.cancels.lock().unwrap().is_empty());
        assert_eq!(backend.released(), vec!["r1".to_string()]);
    }

    struct Doubler;

    #[async_trait]
    impl Predictor for Doubler {
        async fn predict(
            &self,
            input: Map<String, Value>,
            ctx: &PredictContext,
        ) -> Result<(), PredictorError> {
            let x = input
                .get("x")
                .and_then(Value::as_i64)
                .ok_or_else(|| PredictorError::new("x must be an integer"))?;
            ctx.log(format!("doubling {x}\n"));
            ctx.set_output(json!(x * 2));
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_backend_end_to_end() {
        let backend = Arc::new(LocalBackend::new(Arc::new(Doubler), 1));
        let clients = ClientManager::new(&RunnerConfig::default()).unwrap();
        let runner = runner_with(backend.clone(), clients);

        assert!(runner.is_busy());
        let setup = runner.initialize().wait().await.unwrap();
        assert_eq!(setup.status, Status::Succeeded);
        assert!(!runner.is_busy());

        let (_, task) = runner.accept(request("r1", json!({"x": 5}))).unwrap();
        let response = completed(task.wait().await);
        assert_eq!(response.status, Status::Succeeded);
        assert_eq!(response.output, Some(PredictionOutput::Single(json!(10))));
        assert_eq!(response.logs, "doubling 5\n");

        let (_, task) = runner.accept(request("r2", json!({"x": "five"}))).unwrap();
        let response = completed(task.wait().await);
        assert_eq!(response.status, Status::Failed);
        assert_eq!(response.error.as_deref(), Some("x must be an integer"));

        assert_eq!(backend.in_flight(), 0);
        assert!(matches!(runner.initialize().wait().await, Err(RunnerError::Busy)));
        runner.shutdown();
        assert!(runner.is_busy());
    }
}
