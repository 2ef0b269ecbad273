//! In-memory backend and sink for exercising the session and registry
//! without audio hardware or permissions.
//!
//! The test thread plays the role of the OS capture thread: it pushes
//! buffers and faults into whatever listener the last opened stream holds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::audio_models::PcmFrame;
use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;
use crate::models::state::CaptureState;
use crate::traits::capture_backend::{CaptureBackend, CaptureStream, SampleBuffer, StreamListener};
use crate::traits::delivery_sink::DeliverySink;

#[derive(Default)]
struct MockInner {
    permission_denied: bool,
    permission_requests: usize,
    fail_next_open: Option<CaptureError>,
    fail_next_stop: Option<CaptureError>,
    fault_during_open: Option<String>,
    listener: Option<(u64, Arc<dyn StreamListener>)>,
    next_stream_id: u64,
    opened: usize,
    active: usize,
    peak_active: usize,
    last_config: Option<CaptureConfiguration>,
}

/// Test-side handle used to drive a `MockBackend`.
#[derive(Default)]
pub struct MockControl {
    inner: Mutex<MockInner>,
}

impl MockControl {
    pub fn deny_permission(&self, denied: bool) {
        self.inner.lock().permission_denied = denied;
    }

    pub fn fail_next_open(&self, error: CaptureError) {
        self.inner.lock().fail_next_open = Some(error);
    }

    pub fn fail_next_stop(&self, error: CaptureError) {
        self.inner.lock().fail_next_stop = Some(error);
    }

    /// Make the next opened stream report a fault before `open_stream` returns.
    pub fn fault_during_next_open(&self, message: &str) {
        self.inner.lock().fault_during_open = Some(message.to_string());
    }

    /// Push one buffer into the live stream. Returns false if no stream is open.
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        self.deliver_sample(&bytes)
    }

    pub fn deliver_sample(&self, sample: &dyn SampleBuffer) -> bool {
        let listener = self.inner.lock().listener.as_ref().map(|(_, l)| Arc::clone(l));
        match listener {
            Some(listener) => {
                listener.on_sample_buffer(sample);
                true
            }
            None => false,
        }
    }

    /// Report an OS-side stream fault on the live stream.
    pub fn fault(&self, message: &str) -> bool {
        let listener = self.inner.lock().listener.as_ref().map(|(_, l)| Arc::clone(l));
        match listener {
            Some(listener) => {
                listener.on_stream_error(message);
                true
            }
            None => false,
        }
    }

    /// Whether an opened stream has not been torn down yet.
    pub fn has_listener(&self) -> bool {
        self.inner.lock().listener.is_some()
    }

    pub fn opened_streams(&self) -> usize {
        self.inner.lock().opened
    }

    pub fn active_streams(&self) -> usize {
        self.inner.lock().active
    }

    /// Most streams that were ever open at the same time.
    pub fn peak_active_streams(&self) -> usize {
        self.inner.lock().peak_active
    }

    pub fn permission_requests(&self) -> usize {
        self.inner.lock().permission_requests
    }

    pub fn last_config(&self) -> Option<CaptureConfiguration> {
        self.inner.lock().last_config.clone()
    }
}

/// `CaptureBackend` whose streams are driven by a shared `MockControl`.
#[derive(Clone)]
pub struct MockBackend {
    control: Arc<MockControl>,
}

impl MockBackend {
    pub fn new() -> (Self, Arc<MockControl>) {
        let control = Arc::new(MockControl::default());
        (
            Self {
                control: Arc::clone(&control),
            },
            control,
        )
    }

    pub fn with_control(control: Arc<MockControl>) -> Self {
        Self { control }
    }
}

impl CaptureBackend for MockBackend {
    type Stream = MockStream;

    fn name(&self) -> &'static str {
        "MockLoopback"
    }

    fn request_permission(&self) -> Result<bool, CaptureError> {
        let mut inner = self.control.inner.lock();
        inner.permission_requests += 1;
        Ok(!inner.permission_denied)
    }

    fn open_stream(
        &self,
        config: &CaptureConfiguration,
        listener: Arc<dyn StreamListener>,
    ) -> Result<MockStream, CaptureError> {
        let (id, fault) = {
            let mut inner = self.control.inner.lock();
            if let Some(err) = inner.fail_next_open.take() {
                return Err(err);
            }
            inner.next_stream_id += 1;
            let id = inner.next_stream_id;
            inner.opened += 1;
            inner.active += 1;
            inner.peak_active = inner.peak_active.max(inner.active);
            inner.last_config = Some(config.clone());
            inner.listener = Some((id, Arc::clone(&listener)));
            (id, inner.fault_during_open.take())
        };

        if let Some(message) = fault {
            listener.on_stream_error(&message);
        }

        Ok(MockStream {
            control: Arc::clone(&self.control),
            id,
            stopped: false,
        })
    }
}

pub struct MockStream {
    control: Arc<MockControl>,
    id: u64,
    stopped: bool,
}

impl CaptureStream for MockStream {
    fn stop(&mut self) -> Result<(), CaptureError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let mut inner = self.control.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        if matches!(inner.listener, Some((id, _)) if id == self.id) {
            inner.listener = None;
        }
        match inner.fail_next_stop.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[derive(Default)]
struct Recorded {
    frames: Vec<PcmFrame>,
    errors: Vec<String>,
    states: Vec<CaptureState>,
}

/// `DeliverySink` that records everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    recorded: Mutex<Recorded>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<PcmFrame> {
        self.recorded.lock().frames.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.recorded.lock().errors.clone()
    }

    pub fn states(&self) -> Vec<CaptureState> {
        self.recorded.lock().states.clone()
    }
}

impl DeliverySink for RecordingSink {
    fn on_pcm_data(&self, frame: &PcmFrame) {
        self.recorded.lock().frames.push(frame.clone());
    }

    fn on_error(&self, message: &str) {
        self.recorded.lock().errors.push(message.to_string());
    }

    fn on_state_changed(&self, state: CaptureState) {
        self.recorded.lock().states.push(state);
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
