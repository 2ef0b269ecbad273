//! Fallback backend for platforms without a loopback implementation.

use std::sync::Arc;

use loopback_capture_core::{
    CaptureBackend, CaptureConfiguration, CaptureError, CaptureStream, StreamListener,
};

/// Backend that refuses to capture, with a reason naming the platform.
#[derive(Debug, Clone, Default)]
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    pub fn new() -> Self {
        Self
    }

    fn unavailable() -> CaptureError {
        CaptureError::Unavailable(format!(
            "system audio capture is not implemented on {}",
            std::env::consts::OS
        ))
    }
}

/// Never constructed; exists to satisfy `CaptureBackend::Stream`.
pub struct UnsupportedStream(());

impl CaptureStream for UnsupportedStream {
    fn stop(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

impl CaptureBackend for UnsupportedBackend {
    type Stream = UnsupportedStream;

    fn name(&self) -> &'static str {
        "Unsupported"
    }

    fn request_permission(&self) -> Result<bool, CaptureError> {
        Err(Self::unavailable())
    }

    fn open_stream(
        &self,
        _config: &CaptureConfiguration,
        _listener: Arc<dyn StreamListener>,
    ) -> Result<UnsupportedStream, CaptureError> {
        Err(Self::unavailable())
    }
}
