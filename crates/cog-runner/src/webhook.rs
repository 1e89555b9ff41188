//! Webhook notifications for prediction lifecycle transitions.
//!
//! Implements the cog webhook protocol:
//! - Throttling (default 500ms between non-terminal updates)
//! - Terminal webhooks retried with exponential backoff
//! - WEBHOOK_AUTH_TOKEN bearer authentication
//! - Events filtering (start, output, logs, completed)
//!
//! Each sender delivers from one background queue, so the receiver sees
//! webhooks in dispatch order. The caller is never blocked by a slow or
//! unreachable receiver.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::version::user_agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    Start,
    Output,
    Logs,
    Completed,
}

impl WebhookEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    // Kept as a list (not a set) so that serialized filters have a stable order.
    pub fn default_events() -> Vec<WebhookEvent> {
        vec![Self::Start, Self::Output, Self::Logs, Self::Completed]
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub response_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
    pub request_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            response_interval: Duration::from_millis(
                std::env::var("COG_THROTTLE_RESPONSE_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|s| (s * 1000.0) as u64)
                    .unwrap_or(500),
            ),
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Receiver side of webhook notifications, as seen by the event handler.
///
/// `dispatch` must return immediately; delivery failures are the
/// implementation's concern and never reach the caller.
pub trait WebhookDispatch: Send + Sync {
    fn dispatch(&self, event: WebhookEvent, payload: serde_json::Value);
}

/// Build the HTTP client used for webhook delivery.
pub fn build_webhook_client(config: &WebhookConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Ok(token) = std::env::var("WEBHOOK_AUTH_TOKEN")
        && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
    {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent()) {
        headers.insert(reqwest::header::USER_AGENT, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout)
        .build()
}

type Delivery = (WebhookEvent, serde_json::Value);

/// Webhook sender for one prediction.
///
/// Clones share the throttle state and the delivery queue.
#[derive(Clone)]
pub struct WebhookSender {
    url: String,
    config: WebhookConfig,
    events_filter: HashSet<WebhookEvent>,
    client: reqwest::Client,
    last_sent: Arc<Mutex<Option<Instant>>>,
    // Started on first use; the worker exits once every clone is dropped.
    queue: Arc<OnceLock<mpsc::UnboundedSender<Delivery>>>,
}

impl WebhookSender {
    pub fn new(
        url: String,
        events_filter: impl IntoIterator<Item = WebhookEvent>,
        config: WebhookConfig,
        client: reqwest::Client,
    ) -> Self {
        Self {
            url,
            config,
            events_filter: events_filter.into_iter().collect(),
            client,
            last_sent: Arc::new(Mutex::new(None)),
            queue: Arc::new(OnceLock::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn wants(&self, event: WebhookEvent) -> bool {
        self.events_filter.contains(&event)
    }

    /// Throttle check for non-terminal events. Records the send when allowed.
    fn claim_send_slot(&self) -> bool {
        let mut last = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let allowed = last.is_none_or(|t| t.elapsed() >= self.config.response_interval);
        if allowed {
            *last = Some(Instant::now());
        }
        allowed
    }

    /// Queue a non-terminal webhook (throttled, single attempt, no retry).
    pub fn send(&self, event: WebhookEvent, payload: &serde_json::Value) {
        if !self.wants(event) || !self.claim_send_slot() {
            return;
        }
        self.enqueue(event, payload.clone());
    }

    fn enqueue(&self, event: WebhookEvent, payload: serde_json::Value) {
        let queue = self.queue.get_or_init(|| self.spawn_delivery());
        if queue.send((event, payload)).is_err() {
            tracing::warn!(?event, "Webhook delivery queue closed, dropping webhook");
        }
    }

    fn spawn_delivery(&self) -> mpsc::UnboundedSender<Delivery> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        // Own queue cell, so the worker does not keep its own channel open.
        let worker = Self {
            queue: Arc::new(OnceLock::new()),
            ..self.clone()
        };
        tokio::spawn(async move {
            while let Some((event, payload)) = rx.recv().await {
                if event.is_terminal() {
                    worker.send_terminal(event, &payload).await;
                } else {
                    worker.post_once(&payload).await;
                }
            }
        });
        tx
    }

    async fn post_once(&self, payload: &serde_json::Value) {
        if let Err(e) = self.client.post(&self.url).json(payload).send().await {
            tracing::warn!(error = %e, "Failed to send webhook (non-terminal)");
        }
    }

    /// Send a terminal webhook with exponential backoff retries.
    pub async fn send_terminal(&self, event: WebhookEvent, payload: &serde_json::Value) {
        if !self.wants(event) {
            return;
        }

        let mut attempt = 0;
        loop {
            match self.client.post(&self.url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(status = %status, "Terminal webhook sent successfully");
                        return;
                    }

                    if !self.config.retry_status_codes.contains(&status) {
                        tracing::error!(
                            status = %status,
                            "Terminal webhook failed with non-retryable status"
                        );
                        return;
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(
                            status = %status,
                            attempts = attempt,
                            "Terminal webhook failed after max retries"
                        );
                        return;
                    }

                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        status = %status,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis(),
                        "Terminal webhook failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(
                            error = %e,
                            attempts = attempt,
                            "Terminal webhook failed after max retries"
                        );
                        return;
                    }

                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis(),
                        "Terminal webhook request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base * (1 << attempt.min(10))
    }
}

impl WebhookDispatch for WebhookSender {
    fn dispatch(&self, event: WebhookEvent, payload: serde_json::Value) {
        if !event.is_terminal() {
            self.send(event, &payload);
        } else if self.wants(event) {
            self.enqueue(event, payload);
        }
    }
}
