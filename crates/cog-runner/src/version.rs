//! Version information for the runner.

/// Runner version from Cargo.toml
pub const RUNNER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent with every outbound HTTP request (webhooks, uploads, downloads).
pub fn user_agent() -> String {
    format!("cog-runner/{}", RUNNER_VERSION)
}
