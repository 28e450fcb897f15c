//! Version information for snakestream.

/// Broker version from Cargo.toml
pub const SNAKESTREAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub snakestream: &'static str,
    /// Worker program, when the server runs an external worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            snakestream: SNAKESTREAM_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }
}
