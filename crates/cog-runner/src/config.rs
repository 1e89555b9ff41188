//! Runner configuration.

use std::time::Duration;

use crate::webhook::WebhookConfig;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Default destination for output files. A request's
    /// `output_file_prefix` takes precedence.
    pub upload_url: Option<String>,
    /// Do not send the `start` webhook, so the first output webhook is not
    /// throttled behind it.
    pub skip_start_event: bool,
    /// Heartbeat interval requested from the backend while predicting.
    pub poll_interval: Duration,
    /// Timeout for downloading remote inputs.
    pub download_timeout: Duration,
    pub webhook: WebhookConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            upload_url: None,
            skip_start_event: false,
            poll_interval: Duration::from_millis(100),
            download_timeout: Duration::from_secs(60),
            webhook: WebhookConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Defaults overridden by `COG_UPLOAD_URL` and `COG_SKIP_START_EVENT`.
    pub fn from_env() -> Self {
        let upload_url = std::env::var("COG_UPLOAD_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let skip_start_event = std::env::var("COG_SKIP_START_EVENT")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        Self {
            upload_url,
            skip_start_event,
            ..Self::default()
        }
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    pub fn with_skip_start_event(mut self, skip: bool) -> Self {
        self.skip_start_event = skip;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = webhook;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}
