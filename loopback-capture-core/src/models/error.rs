use thiserror::Error;

/// Errors that can occur during loopback capture operations.
///
/// Every variant is advisory: the session reports it through the
/// delivery sink and returns to `Idle` where applicable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device not available")]
    DeviceNotAvailable,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("stream start failed: {0}")]
    StreamStartFailed(String),

    #[error("stream stop failed: {0}")]
    StreamStopFailed(String),

    #[error("stream fault: {0}")]
    StreamFault(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("system audio capture unavailable: {0}")]
    Unavailable(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CaptureError {
    /// Whether a later `start()` may succeed after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PermissionDenied | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = CaptureError::StreamStartFailed("no display".into());
        assert_eq!(err.to_string(), "stream start failed: no display");
    }

    #[test]
    fn permission_and_unavailable_are_not_retryable() {
        assert!(!CaptureError::PermissionDenied.is_retryable());
        assert!(!CaptureError::Unavailable("linux".into()).is_retryable());
        assert!(CaptureError::StreamFault("device removed".into()).is_retryable());
    }
}
