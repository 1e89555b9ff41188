//! Request and response records shared by the runner and its front-ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::webhook::WebhookEvent;

/// Prediction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Processing,
    Succeeded,
    Canceled,
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prediction output - single value or streamed chunks.
///
/// The shape is chosen once, by the announced output type, and never changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(Value),
    Stream(Vec<Value>),
}

impl PredictionOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, PredictionOutput::Stream(_))
    }

    pub fn len(&self) -> usize {
        match self {
            PredictionOutput::Single(_) => 1,
            PredictionOutput::Stream(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            PredictionOutput::Single(v) => vec![v],
            PredictionOutput::Stream(v) => v,
        }
    }
}

/// A validated prediction request, immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    #[serde(default = "generate_prediction_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_input")]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(
        default = "WebhookEvent::default_events",
        deserialize_with = "deserialize_webhook_events"
    )]
    pub webhook_events_filter: Vec<WebhookEvent>,
    /// Upload destination for output files; overrides the runner's upload URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
}

impl PredictionRequest {
    pub fn new(id: impl Into<String>, input: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            input,
            webhook: None,
            webhook_events_filter: WebhookEvent::default_events(),
            output_file_prefix: None,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>, events: Vec<WebhookEvent>) -> Self {
        self.webhook = Some(url.into());
        self.webhook_events_filter = events;
        self
    }

    pub fn with_output_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_file_prefix = Some(prefix.into());
        self
    }
}

// [compat] A null or missing input is accepted as an empty mapping.
fn deserialize_input<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Map<String, Value>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

// [compat] A null events filter means the default events.
fn deserialize_webhook_events<'de, D>(deserializer: D) -> Result<Vec<WebhookEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Vec<WebhookEvent>>::deserialize(deserializer)?;
    Ok(value.unwrap_or_else(WebhookEvent::default_events))
}

pub fn generate_prediction_id() -> String {
    format!("pred_{}", uuid::Uuid::new_v4().simple())
}

/// The response record for one prediction.
///
/// Mirrors the request's identity and input. Unset optional fields are left
/// out of the JSON form, which is also the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
    pub id: String,
    pub input: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PredictionOutput>,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    pub webhook_events_filter: Vec<WebhookEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
}

impl PredictionResponse {
    /// Build the initial (processing) response for an accepted request.
    pub fn from_request(request: &PredictionRequest) -> Self {
        Self {
            id: request.id.clone(),
            input: request.input.clone(),
            output: None,
            logs: String::new(),
            error: None,
            status: Status::Processing,
            metrics: None,
            created_at: request.created_at,
            started_at: Some(Utc::now()),
            completed_at: None,
            webhook: request.webhook.clone(),
            webhook_events_filter: request.webhook_events_filter.clone(),
            output_file_prefix: request.output_file_prefix.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds recorded under `metrics.predict_time`, if any.
    pub fn predict_time(&self) -> Option<f64> {
        self.metrics
            .as_ref()
            .and_then(|m| m.get("predict_time"))
            .and_then(Value::as_f64)
    }

    /// The response as plain JSON data.
    pub fn to_payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(prediction_id = %self.id, error = %e, "Failed to serialize response");
                serde_json::json!({ "id": self.id, "status": self.status.as_str() })
            }
        }
    }
}

/// Result of running backend initialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupResult {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub logs: String,
    pub status: Status,
}
