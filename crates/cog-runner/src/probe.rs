//! Readiness signalling towards the container orchestrator.

use std::path::PathBuf;

/// Receives the single "ready" signal after a successful initialization.
pub trait ReadinessProbe: Send + Sync {
    fn ready(&self);
}

/// Writes the readiness file for the Kubernetes readiness probe.
///
/// Outside Kubernetes (no `KUBERNETES_SERVICE_HOST`) this does nothing.
#[derive(Debug, Clone)]
pub struct ProbeHelper {
    dir: PathBuf,
    enabled: bool,
}

impl ProbeHelper {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from("/var/run/cog"),
            enabled: std::env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        }
    }

    /// Write the readiness file under `dir` regardless of environment.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
        }
    }

    pub fn ready_file(&self) -> PathBuf {
        self.dir.join("ready")
    }
}

impl Default for ProbeHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProbe for ProbeHelper {
    fn ready(&self) {
        if !self.enabled {
            return;
        }

        let file = self.ready_file();
        if file.exists() {
            return;
        }

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(error = %e, dir = %self.dir.display(), "Failed to create readiness directory");
            return;
        }

        if let Err(e) = std::fs::write(&file, b"") {
            tracing::warn!(error = %e, "Failed to write readiness file");
        }
    }
}
