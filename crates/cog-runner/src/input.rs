//! Input materialization.
//!
//! Remote (`http(s)://`) and embedded (`data:`) references in a request's
//! input are resolved to local files before the backend sees them. Files
//! live in a per-request temporary directory that is removed when the
//! `PreparedInput` is dropped.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde_json::{Map, Value};
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to download {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid data URL: {0}")]
    DataUrl(String),

    /// Writing one request's own file failed.
    #[error("failed to write input file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InputError {
    /// True for failures confined to one request (network, bad caller
    /// data, that request's own files). Failing to set up the temporary
    /// directory itself is not.
    pub fn is_request_scoped(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Input payload with references replaced by local paths.
///
/// Owns the temporary files; dropping it cleans them up.
#[derive(Debug)]
pub struct PreparedInput {
    payload: Map<String, Value>,
    dir: Option<TempDir>,
}

// Where a resolved path goes back into the payload.
struct Job {
    key: String,
    index: Option<usize>,
    reference: String,
}

impl PreparedInput {
    /// Resolve every reference in `input` concurrently.
    pub async fn prepare(
        input: &Map<String, Value>,
        client: &reqwest::Client,
    ) -> Result<Self, InputError> {
        let jobs = collect_jobs(input);
        if jobs.is_empty() {
            return Ok(Self {
                payload: input.clone(),
                dir: None,
            });
        }

        tracing::debug!("Resolving {} input reference(s)", jobs.len());

        let dir = tempfile::Builder::new().prefix("cog-input-").tempdir()?;
        let resolutions = jobs.iter().enumerate().map(|(n, job)| {
            let target = dir.path().join(n.to_string());
            resolve(client, target, &job.reference)
        });
        let paths = futures::future::try_join_all(resolutions).await?;

        let mut payload = input.clone();
        for (job, path) in jobs.into_iter().zip(paths) {
            let local = Value::String(path.to_string_lossy().into_owned());
            match (job.index, payload.get_mut(&job.key)) {
                (None, Some(slot)) => *slot = local,
                (Some(i), Some(Value::Array(items))) => {
                    if let Some(slot) = items.get_mut(i) {
                        *slot = local;
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            payload,
            dir: Some(dir),
        })
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Directory holding the materialized files, if any were needed.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}

fn is_reference(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("data:")
}

fn collect_jobs(input: &Map<String, Value>) -> Vec<Job> {
    let mut jobs = Vec::new();
    for (key, value) in input {
        match value {
            Value::String(s) if is_reference(s) => jobs.push(Job {
                key: key.clone(),
                index: None,
                reference: s.clone(),
            }),
            // One level only, as for list-of-file inputs.
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if let Value::String(s) = item
                        && is_reference(s)
                    {
                        jobs.push(Job {
                            key: key.clone(),
                            index: Some(i),
                            reference: s.clone(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    jobs
}

async fn resolve(
    client: &reqwest::Client,
    dir: PathBuf,
    reference: &str,
) -> Result<PathBuf, InputError> {
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| InputError::Write {
            path: dir.clone(),
            source,
        })?;

    let (name, bytes) = match reference.strip_prefix("data:") {
        Some(rest) => decode_data_url(rest, "input")?,
        None => download(client, reference).await?,
    };

    let path = dir.join(name);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|source| InputError::Write {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

async fn download(client: &reqwest::Client, url: &str) -> Result<(String, Vec<u8>), InputError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| InputError::Download {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(InputError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|source| InputError::Download {
            url: url.to_string(),
            source,
        })?;

    Ok((file_name_from_url(url), bytes.to_vec()))
}

const MAX_STEM_LEN: usize = 128;
const MAX_EXT_LEN: usize = 16;

fn file_name_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .map(|name| cap_file_name(&name))
        .unwrap_or_else(|| "input".to_string())
}

// Keeps names well under the filesystem's 255-byte limit.
fn cap_file_name(name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= MAX_EXT_LEN => (stem, Some(ext)),
        _ => (name, None),
    };
    let stem = truncate_at_char_boundary(stem, MAX_STEM_LEN);
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Decode a data URL (`rest` is everything after `data:`) into a file name
/// built from `stem` and the mime type's extension, and the payload bytes.
pub(crate) fn decode_data_url(rest: &str, stem: &str) -> Result<(String, Vec<u8>), InputError> {
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| InputError::DataUrl("missing ',' separator".to_string()))?;

    let bytes = if meta.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| InputError::DataUrl(e.to_string()))?
    } else {
        data.as_bytes().to_vec()
    };

    let mime = meta.split(';').next().unwrap_or_default();
    let name = match mime_guess::get_mime_extensions_str(mime).and_then(|exts| exts.first()) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    };

    Ok((name, bytes))
}
