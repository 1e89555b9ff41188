//! HTTP collaborators shared by all predictions: input downloads, output
//! uploads and webhook delivery.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::config::RunnerConfig;
use crate::input::decode_data_url;
use crate::version::user_agent;
use crate::webhook::{WebhookConfig, WebhookDispatch, WebhookEvent, WebhookSender, build_webhook_client};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Output files could not be persisted. Fatal for the prediction.
#[derive(Debug, thiserror::Error)]
#[error("Got error trying to upload output files")]
pub struct UploadError {
    #[source]
    source: BoxError,
}

impl UploadError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Turns file-like output values into something a client can fetch.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, output: Value, destination: Option<&str>) -> Result<Value, UploadError>;
}

/// Uploads files with `PUT <destination><filename>`, or inlines them as
/// data URLs when there is no destination.
///
/// A string counts as a file when it is a `data:` URL or an absolute path
/// to an existing regular file. Objects and arrays are walked recursively.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn upload_value<'a>(
        &'a self,
        value: Value,
        destination: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Value, UploadError>> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.upload_value(item, destination).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = Map::new();
                    for (key, item) in map {
                        out.insert(key, self.upload_value(item, destination).await?);
                    }
                    Ok(Value::Object(out))
                }
                Value::String(s) => self.upload_string(s, destination).await,
                other => Ok(other),
            }
        })
    }

    async fn upload_string(&self, s: String, destination: Option<&str>) -> Result<Value, UploadError> {
        if let Some(rest) = s.strip_prefix("data:") {
            let Some(destination) = destination else {
                return Ok(Value::String(s));
            };
            let (name, bytes) = decode_data_url(rest, "output").map_err(UploadError::new)?;
            let mime = mime_guess::from_path(&name).first_or_octet_stream().to_string();
            return self.put(destination, &name, &mime, bytes).await;
        }

        let path = Path::new(&s);
        if !path.is_absolute() || !is_file(path).await {
            return Ok(Value::String(s));
        }

        let bytes = tokio::fs::read(path).await.map_err(UploadError::new)?;
        let mime = mime_guess::from_path(path).first_or_octet_stream().to_string();
        match destination {
            Some(destination) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "output".to_string());
                self.put(destination, &name, &mime, bytes).await
            }
            None => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                Ok(Value::String(format!("data:{mime};base64,{encoded}")))
            }
        }
    }

    async fn put(
        &self,
        destination: &str,
        name: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<Value, UploadError> {
        let url = format!("{destination}{name}");
        tracing::debug!(%url, size = bytes.len(), "Uploading output file");

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(UploadError::new)?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Value::String(location.unwrap_or(url)))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, output: Value, destination: Option<&str>) -> Result<Value, UploadError> {
        self.upload_value(output, destination).await
    }
}

/// Shared HTTP clients and the uploader.
#[derive(Clone)]
pub struct ClientManager {
    download_client: reqwest::Client,
    webhook_client: reqwest::Client,
    webhook_config: WebhookConfig,
    uploader: Arc<dyn Uploader>,
}

impl ClientManager {
    pub fn new(config: &RunnerConfig) -> Result<Self, reqwest::Error> {
        let download_client = reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(config.download_timeout)
            .build()?;
        let upload_client = reqwest::Client::builder()
            .user_agent(user_agent())
            .build()?;
        let webhook_client = build_webhook_client(&config.webhook)?;

        Ok(Self {
            download_client,
            webhook_client,
            webhook_config: config.webhook.clone(),
            uploader: Arc::new(HttpUploader::new(upload_client)),
        })
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn download_client(&self) -> &reqwest::Client {
        &self.download_client
    }

    pub fn uploader(&self) -> Arc<dyn Uploader> {
        Arc::clone(&self.uploader)
    }

    /// Webhook dispatcher for one prediction, or `None` without a URL.
    pub fn make_webhook_sender(
        &self,
        url: Option<&str>,
        events_filter: &[WebhookEvent],
    ) -> Option<Arc<dyn WebhookDispatch>> {
        let url = url.filter(|u| !u.is_empty())?;
        Some(Arc::new(WebhookSender::new(
            url.to_string(),
            events_filter.iter().copied(),
            self.webhook_config.clone(),
            self.webhook_client.clone(),
        )))
    }
}
