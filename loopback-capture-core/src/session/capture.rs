use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::models::audio_models::{PcmFormat, SessionDiagnostics};
use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;
use crate::models::state::CaptureState;
use crate::processing::converter;
use crate::traits::capture_backend::{CaptureBackend, CaptureStream, SampleBuffer, StreamListener};
use crate::traits::delivery_sink::DeliverySink;

#[derive(Default)]
struct Counters {
    streams_opened: AtomicU64,
    frames_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    conversion_failures: AtomicU64,
    stream_faults: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            stream_faults: self.stream_faults.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the caller thread and the OS capture thread.
///
/// Locks are only held long enough to read or swap a value; no lock is held
/// while calling into the sink.
struct Shared {
    state: Mutex<CaptureState>,
    generation: AtomicU64,
    sink: RwLock<Option<Arc<dyn DeliverySink>>>,
    format: RwLock<PcmFormat>,
    counters: Counters,
}

impl Shared {
    fn sink(&self) -> Option<Arc<dyn DeliverySink>> {
        self.sink.read().clone()
    }

    fn notify_state(&self, state: CaptureState) {
        if let Some(sink) = self.sink() {
            sink.on_state_changed(state);
        }
    }

    fn report_error(&self, message: &str) {
        if let Some(sink) = self.sink() {
            sink.on_error(message);
        }
    }

    /// Move `from → to` atomically. Returns false if the state was not `from`.
    fn transition(&self, from: CaptureState, to: CaptureState) -> bool {
        let changed = {
            let mut state = self.state.lock();
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        };
        if changed {
            log::debug!("Capture session: {} → {}", from.name(), to.name());
            self.notify_state(to);
        }
        changed
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Listener handed to the OS stream. Tagged with the generation of the
/// `start()` that created it so late events from an old stream are ignored.
struct SessionListener {
    shared: Arc<Shared>,
    generation: u64,
}

impl StreamListener for SessionListener {
    fn on_sample_buffer(&self, buffer: &dyn SampleBuffer) {
        let shared = &self.shared;
        let capturing = shared.is_current(self.generation) && shared.state.lock().is_capturing();
        if !capturing {
            shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(sink) = shared.sink() else {
            return;
        };

        let format = *shared.format.read();
        match converter::convert(buffer, &format) {
            Ok(frame) => {
                shared.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .bytes_delivered
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                sink.on_pcm_data(&frame);
            }
            Err(e) => {
                shared.counters.conversion_failures.fetch_add(1, Ordering::Relaxed);
                sink.on_error(&e.to_string());
            }
        }
    }

    fn on_stream_error(&self, message: &str) {
        let shared = &self.shared;
        if !shared.is_current(self.generation) {
            log::debug!("Ignoring fault from a retired stream: {}", message);
            return;
        }

        // Only a live (or just-created) stream can fault; a fault racing a
        // caller-initiated stop is superseded by the stop.
        let faulted = shared.transition(CaptureState::Capturing, CaptureState::Idle)
            || shared.transition(CaptureState::Starting, CaptureState::Idle);
        if !faulted {
            log::warn!("Stream error during teardown: {}", message);
            return;
        }

        shared.counters.stream_faults.fetch_add(1, Ordering::Relaxed);
        log::error!("Stream stopped with error: {}", message);
        shared.report_error(&format!("Stream stopped with error: {}", message));
    }
}

/// Owner of the single OS loopback stream.
///
/// `start`/`stop` take `&mut self`: callers must serialize them. Buffer
/// delivery runs on the OS capture thread and only touches shared state.
pub struct CaptureSession<B: CaptureBackend> {
    backend: B,
    config: CaptureConfiguration,
    shared: Arc<Shared>,
    // Non-null while Starting/Capturing. After a stream fault the handle stays
    // parked here until the caller thread releases it.
    stream: Option<B::Stream>,
    permission_granted: bool,
}

impl<B: CaptureBackend> CaptureSession<B> {
    pub fn new(backend: B) -> Self {
        let config = CaptureConfiguration::default();
        Self {
            backend,
            shared: Arc::new(Shared {
                state: Mutex::new(CaptureState::Idle),
                generation: AtomicU64::new(0),
                sink: RwLock::new(None),
                format: RwLock::new(config.format()),
                counters: Counters::default(),
            }),
            config,
            stream: None,
            permission_granted: false,
        }
    }

    pub fn set_sink(&mut self, sink: Option<Arc<dyn DeliverySink>>) {
        *self.shared.sink.write() = sink;
    }

    /// Replace the stream configuration. Only allowed while idle.
    pub fn configure(&mut self, config: CaptureConfiguration) -> Result<(), CaptureError> {
        if !self.state().is_idle() {
            return Err(CaptureError::ConfigurationFailed(
                "can only configure from idle state".into(),
            ));
        }
        config.validate().map_err(CaptureError::ConfigurationFailed)?;

        *self.shared.format.write() = config.format();
        self.config = config;
        Ok(())
    }

    pub fn configuration(&self) -> &CaptureConfiguration {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        *self.shared.state.lock()
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        self.shared.counters.snapshot()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Ask the backend for capture permission unless it was already granted.
    /// A denial is not remembered, so a later call asks again.
    pub fn request_permission(&mut self) -> Result<bool, CaptureError> {
        if self.permission_granted {
            return Ok(true);
        }
        let granted = self.backend.request_permission()?;
        self.permission_granted = granted;
        Ok(granted)
    }

    /// Start capture. Transitions: idle → starting → capturing.
    ///
    /// A no-op returning `Ok` while already capturing. On failure the error is
    /// reported through the sink and the session is back in `Idle`.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state().is_capturing() {
            log::debug!("Capture already running");
            return Ok(());
        }

        self.release_parked_stream();

        if !self.shared.transition(CaptureState::Idle, CaptureState::Starting) {
            return Err(CaptureError::Unknown(format!(
                "cannot start from {} state",
                self.state().name()
            )));
        }

        match self.request_permission() {
            Ok(true) => {}
            Ok(false) => return self.fail_start(CaptureError::PermissionDenied),
            Err(e) => return self.fail_start(e),
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = Arc::new(SessionListener {
            shared: Arc::clone(&self.shared),
            generation,
        });

        let stream = match self.backend.open_stream(&self.config, listener) {
            Ok(stream) => stream,
            Err(e) => return self.fail_start(e),
        };
        self.shared.counters.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.stream = Some(stream);

        if !self.shared.transition(CaptureState::Starting, CaptureState::Capturing) {
            // The stream faulted before we could promote it; the fault has
            // already been reported.
            self.release_parked_stream();
            return Err(CaptureError::StreamFault("stream stopped during startup".into()));
        }

        log::info!(
            "Capturing system audio via {} ({} Hz, {} ch, {}-bit)",
            self.backend.name(),
            self.config.sample_rate,
            self.config.channels,
            self.config.bit_depth
        );
        Ok(())
    }

    /// Stop capture. Transitions: capturing → stopping → idle.
    ///
    /// Safe in every state; a no-op unless capturing.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.shared.transition(CaptureState::Capturing, CaptureState::Stopping) {
            self.release_parked_stream();
            return Ok(());
        }

        let result = match self.stream.take() {
            Some(mut stream) => stream.stop(),
            None => Ok(()),
        };

        self.shared.transition(CaptureState::Stopping, CaptureState::Idle);

        if let Err(ref e) = result {
            log::error!("Failed to stop audio capture: {}", e);
            self.shared
                .report_error(&format!("Failed to stop audio capture: {}", e));
        } else {
            log::info!("Audio capture stopped");
        }
        result
    }

    fn fail_start(&mut self, error: CaptureError) -> Result<(), CaptureError> {
        log::error!("Failed to start audio capture: {}", error);
        self.shared.transition(CaptureState::Starting, CaptureState::Idle);
        self.shared
            .report_error(&format!("Failed to start audio capture: {}", error));
        Err(error)
    }

    /// Release a stream left behind by a fault. Only called while idle, from
    /// the caller thread, so joining the OS thread cannot self-deadlock.
    fn release_parked_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.stop() {
                log::warn!("Releasing faulted stream failed: {}", e);
            }
        }
    }
}

impl<B: CaptureBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        let _ = self.stop();
        self.release_parked_stream();
    }
}
