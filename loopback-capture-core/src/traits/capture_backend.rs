use std::sync::Arc;

use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;

/// One opaque platform sample container, as handed over by the OS.
///
/// Only the first audio buffer is ever consumed.
pub trait SampleBuffer {
    /// Number of audio buffers in the container.
    fn buffer_count(&self) -> usize;

    /// Raw bytes of the buffer at `index`, or `None` when inaccessible.
    fn buffer(&self, index: usize) -> Option<&[u8]>;
}

impl SampleBuffer for &[u8] {
    fn buffer_count(&self) -> usize {
        1
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        (index == 0).then_some(*self)
    }
}

impl SampleBuffer for Vec<u8> {
    fn buffer_count(&self) -> usize {
        1
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        (index == 0).then_some(self.as_slice())
    }
}

/// Receives events from a running OS stream.
///
/// Both methods are called on the OS capture thread. Buffer arrivals for one
/// stream are serialized by the OS.
pub trait StreamListener: Send + Sync {
    fn on_sample_buffer(&self, buffer: &dyn SampleBuffer);

    /// The stream stopped on its own (device loss, OS revocation, ...).
    fn on_stream_error(&self, message: &str);
}

/// Exclusive handle to one live OS capture stream.
pub trait CaptureStream: Send {
    /// Tear the stream down. Returns once no further listener calls can happen.
    fn stop(&mut self) -> Result<(), CaptureError>;
}

/// Platform-specific system audio capture.
///
/// Implemented by:
/// - `WasapiLoopbackBackend` (Windows)
/// - `UnsupportedBackend` (everything else)
/// - `MockBackend` (tests)
pub trait CaptureBackend: Send + Sync {
    type Stream: CaptureStream;

    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Ask the OS for capture/recording authorization.
    fn request_permission(&self) -> Result<bool, CaptureError>;

    /// Create and start an OS stream. Returns once the OS has confirmed that
    /// capture began; buffers then arrive on `listener`.
    fn open_stream(
        &self,
        config: &CaptureConfiguration,
        listener: Arc<dyn StreamListener>,
    ) -> Result<Self::Stream, CaptureError>;
}
