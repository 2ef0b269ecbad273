use thiserror::Error;

/// Errors from driving the capture child process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to start capture process: {0}")]
    SpawnFailed(String),

    #[error("failed to spawn transport thread: {0}")]
    ThreadSpawnFailed(String),
}
