//! In-process backend driven by a `Predictor` implementation.
//!
//! Each initialization or prediction runs on its own tokio task and reports
//! back through an unbounded channel that the caller consumes as an
//! `EventStream`. Concurrency is bounded by the number of reserved slots.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Backend, BackendError};
use crate::event::{Event, EventStream};

type EventSender = mpsc::UnboundedSender<Result<Event, BackendError>>;

/// Error reported by predictor code. Becomes the prediction's error message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct PredictorError(pub String);

impl PredictorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Model code run by `LocalBackend`.
#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    /// Load the model. Called once.
    async fn setup(&self, _logs: &LogSink) -> Result<(), PredictorError> {
        Ok(())
    }

    /// Run one prediction, reporting output and logs through `ctx`.
    async fn predict(
        &self,
        input: Map<String, Value>,
        ctx: &PredictContext,
    ) -> Result<(), PredictorError>;
}

/// Log writer handed to `Predictor::setup`.
pub struct LogSink {
    tx: EventSender,
}

impl LogSink {
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.tx.unbounded_send(Ok(Event::log(message)));
    }
}

/// Per-prediction handle handed to `Predictor::predict`.
pub struct PredictContext {
    id: String,
    tx: EventSender,
    cancel: CancellationToken,
    // None until the first output call picks the shape.
    multi: Mutex<Option<bool>>,
}

impl PredictContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(Event::log(message));
    }

    /// Report the single output value.
    pub fn set_output(&self, value: Value) {
        self.announce(false);
        self.emit(Event::output(value));
    }

    /// Append one value to a streamed (multi) output.
    pub fn stream_output(&self, value: Value) {
        self.announce(true);
        self.emit(Event::output(value));
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn announce(&self, multi: bool) {
        let mut declared = lock(&self.multi);
        if declared.is_none() {
            *declared = Some(multi);
            self.emit(Event::OutputType { multi });
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.tx.unbounded_send(Ok(event));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendState {
    Idle,
    Initializing,
    Ready,
    Defunct,
}

struct Shared {
    state: BackendState,
    slots: HashMap<String, CancellationToken>,
}

/// Backend that runs a `Predictor` on the current tokio runtime.
pub struct LocalBackend {
    predictor: Arc<dyn Predictor>,
    concurrency: usize,
    shared: Arc<Mutex<Shared>>,
}

impl LocalBackend {
    pub fn new(predictor: Arc<dyn Predictor>, concurrency: usize) -> Self {
        Self {
            predictor,
            concurrency: concurrency.max(1),
            shared: Arc::new(Mutex::new(Shared {
                state: BackendState::Idle,
                slots: HashMap::new(),
            })),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.shared).slots.len()
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.shared).state == BackendState::Ready
    }
}

impl Backend for LocalBackend {
    fn is_busy(&self) -> bool {
        let shared = lock(&self.shared);
        shared.state != BackendState::Ready || shared.slots.len() >= self.concurrency
    }

    fn initialize(&self) -> Result<EventStream, BackendError> {
        {
            let mut shared = lock(&self.shared);
            if shared.state != BackendState::Idle {
                return Err(BackendError::InvalidState(format!(
                    "cannot initialize from {:?}",
                    shared.state
                )));
            }
            shared.state = BackendState::Initializing;
        }

        let (tx, rx) = mpsc::unbounded();
        let predictor = Arc::clone(&self.predictor);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let sink = LogSink { tx: tx.clone() };
            let result = AssertUnwindSafe(predictor.setup(&sink)).catch_unwind().await;
            let done = finish_setup(&shared, result);
            let _ = tx.unbounded_send(done);
        });

        Ok(rx.boxed())
    }

    fn reserve_slot(&self, id: &str) {
        lock(&self.shared)
            .slots
            .entry(id.to_string())
            .or_insert_with(CancellationToken::new);
    }

    fn release_slot(&self, id: &str) {
        lock(&self.shared).slots.remove(id);
    }

    fn execute(&self, id: &str, input: Map<String, Value>, poll_interval: Duration) -> EventStream {
        let cancel = lock(&self.shared)
            .slots
            .entry(id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone();

        let (tx, rx) = mpsc::unbounded();
        let predictor = Arc::clone(&self.predictor);
        let ctx = PredictContext {
            id: id.to_string(),
            tx,
            cancel,
            multi: Mutex::new(None),
        };

        tokio::spawn(async move {
            let done = run_prediction(predictor, input, &ctx, poll_interval).await;
            let _ = ctx.tx.unbounded_send(done);
        });

        rx.boxed()
    }

    fn cancel(&self, id: &str) -> Result<(), BackendError> {
        match lock(&self.shared).slots.get(id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(BackendError::UnknownPrediction(id.to_string())),
        }
    }

    fn terminate(&self) {
        let mut shared = lock(&self.shared);
        if shared.state != BackendState::Defunct {
            tracing::info!("Terminating backend");
        }
        shared.state = BackendState::Defunct;
        for token in shared.slots.values() {
            token.cancel();
        }
    }
}

fn finish_setup(
    shared: &Mutex<Shared>,
    result: Result<Result<(), PredictorError>, Box<dyn Any + Send>>,
) -> Result<Event, BackendError> {
    let mut shared = lock(shared);
    match result {
        Ok(Ok(())) => {
            // terminate() may have run meanwhile; Defunct is final.
            if shared.state == BackendState::Initializing {
                shared.state = BackendState::Ready;
            }
            Ok(Event::succeeded())
        }
        Ok(Err(e)) => {
            shared.state = BackendState::Defunct;
            Ok(Event::failed(e.to_string()))
        }
        Err(panic) => {
            shared.state = BackendState::Defunct;
            Err(BackendError::Crashed(panic_message(panic.as_ref())))
        }
    }
}

async fn run_prediction(
    predictor: Arc<dyn Predictor>,
    input: Map<String, Value>,
    ctx: &PredictContext,
    poll_interval: Duration,
) -> Result<Event, BackendError> {
    if ctx.cancel.is_cancelled() {
        return Ok(Event::canceled());
    }

    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let predict = AssertUnwindSafe(predictor.predict(input, ctx)).catch_unwind();
    tokio::pin!(predict);

    let result = loop {
        tokio::select! {
            result = &mut predict => break Some(result),
            _ = ctx.cancel.cancelled() => break None,
            _ = ticker.tick() => {
                if ctx.tx.is_closed() {
                    tracing::debug!(prediction_id = %ctx.id, "Event consumer went away, cancelling");
                    ctx.cancel.cancel();
                    continue;
                }
                ctx.emit(Event::Heartbeat);
            }
        }
    };

    match result {
        None => Ok(Event::canceled()),
        Some(Ok(_)) if ctx.cancel.is_cancelled() => Ok(Event::canceled()),
        Some(Ok(Ok(()))) => Ok(Event::succeeded()),
        Some(Ok(Err(e))) => Ok(Event::failed(e.to_string())),
        Some(Err(panic)) => Err(BackendError::Crashed(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("predictor panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("predictor panicked: {s}")
    } else {
        "predictor panicked".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
