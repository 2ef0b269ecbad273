//! Callback registry: the safe half of the C ABI.
//!
//! Holds one capture session plus three C function-pointer slots and turns
//! the session's object interface into fire-and-forget calls. All session
//! work runs on a dedicated control thread that drains commands in order,
//! so `start`/`stop`/`destroy` never block their caller on OS teardown.

mod slots;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;
use crate::models::state::CaptureState;
use crate::session::capture::CaptureSession;
use crate::traits::capture_backend::CaptureBackend;

pub use slots::{ErrorCallback, PcmCallback, StateCallback};
use slots::{CallbackSlots, SlotSink};

/// Builds the backend for each `create()`.
pub type BackendFactory<B> = Box<dyn Fn() -> Result<B, CaptureError> + Send + Sync>;

enum Command {
    Start,
    Stop,
    Shutdown,
}

struct Worker {
    commands: Sender<Command>,
    handle: thread::JoinHandle<()>,
}

pub struct CallbackRegistry<B: CaptureBackend + 'static> {
    factory: BackendFactory<B>,
    config: CaptureConfiguration,
    slots: Arc<CallbackSlots>,
    worker: Mutex<Option<Worker>>,
    // Workers of destroyed sessions, joined by the next create().
    retired: Mutex<Vec<thread::JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl<B: CaptureBackend + 'static> CallbackRegistry<B> {
    pub fn new(factory: impl Fn() -> Result<B, CaptureError> + Send + Sync + 'static) -> Self {
        Self::with_configuration(factory, CaptureConfiguration::default())
    }

    pub fn with_configuration(
        factory: impl Fn() -> Result<B, CaptureError> + Send + Sync + 'static,
        config: CaptureConfiguration,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            config,
            slots: Arc::new(CallbackSlots::new()),
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Allocate the session and its control thread.
    ///
    /// An existing session is torn down first; installed callbacks are kept.
    /// Never blocks on the old session: the new control thread joins the
    /// retired ones before it runs any command, so at most one stream exists.
    pub fn create(&self) -> bool {
        let previous = self.worker.lock().take();
        if let Some(previous) = previous {
            log::warn!("Replacing existing capture session");
            self.retire(previous);
        }

        let backend = match (self.factory)() {
            Ok(backend) => backend,
            Err(e) => {
                log::error!("Failed to create capture backend: {}", e);
                return false;
            }
        };

        let mut session = CaptureSession::new(backend);
        if let Err(e) = session.configure(self.config.clone()) {
            log::error!("Invalid capture configuration: {}", e);
            return false;
        }
        session.set_sink(Some(Arc::new(SlotSink::new(Arc::clone(&self.slots)))));

        let predecessors: Vec<_> = self.retired.lock().drain(..).collect();
        let (commands, inbox) = crossbeam_channel::unbounded();
        let spawned = thread::Builder::new()
            .name("capture-control".into())
            .spawn(move || control_loop(session, inbox, predecessors));

        match spawned {
            Ok(handle) => {
                // A concurrent create() may have installed its own worker meanwhile.
                let displaced = self.worker.lock().replace(Worker { commands, handle });
                if let Some(displaced) = displaced {
                    self.retire(displaced);
                }
                self.destroyed.store(false, Ordering::SeqCst);
                log::debug!("Capture session created");
                true
            }
            Err(e) => {
                // The closure and its predecessor handles are gone; those
                // threads still exit on their own after Shutdown.
                log::error!("Failed to spawn capture control thread: {}", e);
                false
            }
        }
    }

    pub fn set_pcm_callback(&self, callback: Option<PcmCallback>) {
        if self.accepts_calls("set_pcm_callback") {
            self.slots.set_pcm(callback);
        }
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        if self.accepts_calls("set_error_callback") {
            self.slots.set_error(callback);
        }
    }

    pub fn set_state_callback(&self, callback: Option<StateCallback>) {
        if self.accepts_calls("set_state_callback") {
            self.slots.set_state(callback);
        }
    }

    /// Request capture start. Failures arrive through the error callback;
    /// success is signalled by the `Capturing` state callback and by delivery.
    pub fn start(&self) {
        self.send(Command::Start, "start");
    }

    /// Request capture stop. Safe when not capturing.
    pub fn stop(&self) {
        self.send(Command::Stop, "stop");
    }

    /// Stop (asynchronously) and release the session, then clear all callbacks.
    ///
    /// Once this returns no callback is running or will run again, unless
    /// called from inside a callback.
    pub fn destroy(&self) {
        let previous = self.worker.lock().take();
        if let Some(previous) = previous {
            self.retire(previous);
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.slots.clear();
        self.slots.drain();
        log::debug!("Capture session destroyed");
    }

    pub fn is_created(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Last state reported by the session.
    pub fn state(&self) -> CaptureState {
        self.slots.last_state()
    }

    fn accepts_calls(&self, operation: &str) -> bool {
        let accepted = !self.destroyed.load(Ordering::SeqCst);
        if !accepted {
            log::debug!("{} ignored: capture session destroyed", operation);
        }
        accepted
    }

    fn send(&self, command: Command, operation: &str) {
        let commands = self.worker.lock().as_ref().map(|worker| worker.commands.clone());
        match commands {
            Some(commands) => {
                if commands.send(command).is_err() {
                    log::warn!("{} dropped: capture control thread has exited", operation);
                }
            }
            None => log::debug!("{} ignored: no capture session", operation),
        }
    }

    fn retire(&self, worker: Worker) {
        let _ = worker.commands.send(Command::Shutdown);
        self.retired.lock().push(worker.handle);
    }

    fn join_retired(&self) {
        // Joining from a callback would wait on the thread we are running on.
        if slots::in_callback() {
            return;
        }
        let handles: Vec<_> = self.retired.lock().drain(..).collect();
        join_all(handles);
    }
}

fn join_all(handles: Vec<thread::JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            log::error!("Capture control thread panicked");
        }
    }
}

impl<B: CaptureBackend + 'static> Drop for CallbackRegistry<B> {
    fn drop(&mut self) {
        self.destroy();
        self.join_retired();
    }
}

fn control_loop<B: CaptureBackend>(
    mut session: CaptureSession<B>,
    inbox: Receiver<Command>,
    predecessors: Vec<thread::JoinHandle<()>>,
) {
    // The previous session's stream must be gone before this one can open.
    join_all(predecessors);

    for command in inbox.iter() {
        match command {
            Command::Start => {
                // The session has already reported the failure to the sink.
                if let Err(e) = session.start() {
                    log::warn!("Capture start failed: {}", e);
                }
            }
            Command::Stop => {
                let _ = session.stop();
            }
            Command::Shutdown => break,
        }
    }
    drop(session);
    log::debug!("Capture control thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_char;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;
    use std::time::Duration;

    use crate::testing::{wait_until, MockBackend, MockControl};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn registry() -> (CallbackRegistry<MockBackend>, Arc<MockControl>) {
        let (backend, control) = MockBackend::new();
        (CallbackRegistry::new(move || Ok(backend.clone())), control)
    }

    /// Registry in a static, so plain C callbacks can reach it.
    fn shared(
        cell: &'static OnceLock<CallbackRegistry<MockBackend>>,
    ) -> (&'static CallbackRegistry<MockBackend>, Arc<MockControl>) {
        let (backend, control) = MockBackend::new();
        let registry = cell.get_or_init(move || CallbackRegistry::new(move || Ok(backend.clone())));
        (registry, control)
    }

    #[test]
    fn delivers_frames_between_start_and_stop() {
        static FRAMES: AtomicUsize = AtomicUsize::new(0);
        static BYTES: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn on_pcm(_: *const u8, len: usize, _: f64, _: i32, _: i32) {
            FRAMES.fetch_add(1, Ordering::SeqCst);
            BYTES.fetch_add(len, Ordering::SeqCst);
        }

        let (registry, control) = registry();
        assert!(registry.create());
        registry.set_pcm_callback(Some(on_pcm));

        registry.start();
        assert!(wait_until(TIMEOUT, || registry.state().is_capturing()));

        for _ in 0..3 {
            assert!(control.deliver(&[0u8; 4096]));
        }
        assert_eq!(FRAMES.load(Ordering::SeqCst), 3);
        assert_eq!(BYTES.load(Ordering::SeqCst), 3 * 4096);

        registry.stop();
        assert!(wait_until(TIMEOUT, || registry.state().is_idle()));
        assert_eq!(control.active_streams(), 0);
        assert!(!control.deliver(&[0u8; 4096]));
        assert_eq!(FRAMES.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn start_failure_reports_exactly_one_error() {
        static ERRORS: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn on_error(_: *const c_char) {
            ERRORS.fetch_add(1, Ordering::SeqCst);
        }

        let (registry, control) = registry();
        control.fail_next_open(CaptureError::StreamStartFailed("no display".into()));
        assert!(registry.create());
        registry.set_error_callback(Some(on_error));

        registry.start();
        assert!(wait_until(TIMEOUT, || ERRORS.load(Ordering::SeqCst) == 1));
        // Queue a stop behind the failed start; once it ran, the start is fully done.
        registry.stop();
        registry.destroy();
        assert_eq!(ERRORS.load(Ordering::SeqCst), 1);
        assert_eq!(control.opened_streams(), 0);
    }

    #[test]
    fn state_callback_acknowledges_start() {
        static LAST: AtomicUsize = AtomicUsize::new(usize::MAX);
        unsafe extern "C" fn on_state(state: i32) {
            LAST.store(state as usize, Ordering::SeqCst);
        }

        let (registry, _control) = registry();
        assert!(registry.create());
        registry.set_state_callback(Some(on_state));
        registry.start();

        let capturing = CaptureState::Capturing.as_code() as usize;
        assert!(wait_until(TIMEOUT, || LAST.load(Ordering::SeqCst) == capturing));
        registry.destroy();
    }

    #[test]
    fn no_callback_after_destroy() {
        static FRAMES: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn on_pcm(_: *const u8, _: usize, _: f64, _: i32, _: i32) {
            FRAMES.fetch_add(1, Ordering::SeqCst);
        }

        let (registry, control) = registry();
        assert!(registry.create());
        registry.set_pcm_callback(Some(on_pcm));
        registry.start();
        assert!(wait_until(TIMEOUT, || registry.state().is_capturing()));

        registry.destroy();
        assert!(!registry.is_created());

        // The stream may still be tearing down on the control thread.
        control.deliver(&[1, 2, 3, 4]);
        assert_eq!(FRAMES.load(Ordering::SeqCst), 0);
        assert!(wait_until(TIMEOUT, || control.active_streams() == 0));

        // Destroyed: setters are ignored until the next create().
        registry.set_pcm_callback(Some(on_pcm));
        registry.start();
        assert_eq!(control.opened_streams(), 1);
    }

    #[test]
    fn calls_without_session_are_noops() {
        let (registry, control) = registry();
        registry.start();
        registry.stop();
        registry.destroy();
        registry.destroy();
        assert_eq!(control.opened_streams(), 0);
        assert!(!registry.is_created());
    }

    #[test]
    fn recreate_replaces_session_and_keeps_single_stream() {
        let (registry, control) = registry();
        assert!(registry.create());
        registry.start();
        assert!(wait_until(TIMEOUT, || control.active_streams() == 1));

        assert!(registry.create());
        assert!(wait_until(TIMEOUT, || control.active_streams() == 0));

        registry.start();
        assert!(wait_until(TIMEOUT, || control.active_streams() == 1));
        assert_eq!(control.opened_streams(), 2);
        assert_eq!(control.peak_active_streams(), 1);
        registry.destroy();
    }

    #[test]
    fn create_does_not_block_on_callback_reentering_registry() {
        static REGISTRY: OnceLock<CallbackRegistry<MockBackend>> = OnceLock::new();
        static REENTERED: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn on_state(state: i32) {
            if state == CaptureState::Stopping.as_code() {
                if let Some(registry) = REGISTRY.get() {
                    registry.stop();
                    let _ = registry.is_created();
                    REENTERED.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let (registry, control) = shared(&REGISTRY);
        assert!(registry.create());
        registry.set_state_callback(Some(on_state));
        registry.start();
        assert!(wait_until(TIMEOUT, || control.active_streams() == 1));

        // Replacing the session stops the old one, which fires the callback above.
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(REGISTRY.get().map(|registry| registry.create()));
        });
        assert_eq!(done_rx.recv_timeout(TIMEOUT), Ok(Some(true)));

        assert!(wait_until(TIMEOUT, || REENTERED.load(Ordering::SeqCst) == 1));
        assert!(wait_until(TIMEOUT, || control.active_streams() == 0));
        registry.destroy();
    }

    #[test]
    fn create_from_pcm_callback_keeps_single_stream() {
        static REGISTRY: OnceLock<CallbackRegistry<MockBackend>> = OnceLock::new();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn on_pcm(_: *const u8, _: usize, _: f64, _: i32, _: i32) {
            if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(registry) = REGISTRY.get() {
                    registry.create();
                    registry.start();
                }
            }
        }

        let (registry, control) = shared(&REGISTRY);
        assert!(registry.create());
        registry.set_pcm_callback(Some(on_pcm));
        registry.start();
        assert!(wait_until(TIMEOUT, || registry.state().is_capturing()));

        // This thread plays the OS capture thread: the old stream is still
        // delivering while the callback replaces the session.
        assert!(control.deliver(&[0u8; 64]));

        assert!(wait_until(TIMEOUT, || {
            control.opened_streams() == 2 && control.active_streams() == 1
        }));
        assert_eq!(control.peak_active_streams(), 1);
        registry.destroy();
    }

    #[test]
    fn destroy_waits_for_in_flight_callback() {
        static ENTERED: AtomicBool = AtomicBool::new(false);
        static RELEASE: AtomicBool = AtomicBool::new(false);
        unsafe extern "C" fn on_pcm(_: *const u8, _: usize, _: f64, _: i32, _: i32) {
            ENTERED.store(true, Ordering::SeqCst);
            while !RELEASE.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let (registry, control) = registry();
        assert!(registry.create());
        registry.set_pcm_callback(Some(on_pcm));
        registry.start();
        assert!(wait_until(TIMEOUT, || registry.state().is_capturing()));

        let destroyed = AtomicBool::new(false);
        thread::scope(|scope| {
            let delivery = scope.spawn(|| control.deliver(&[0u8; 64]));
            let entered = wait_until(TIMEOUT, || ENTERED.load(Ordering::SeqCst));

            scope.spawn(|| {
                registry.destroy();
                destroyed.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(100));
            let blocked = !destroyed.load(Ordering::SeqCst);
            RELEASE.store(true, Ordering::SeqCst);

            assert!(entered);
            assert!(blocked);
            assert!(wait_until(TIMEOUT, || destroyed.load(Ordering::SeqCst)));
            assert!(delivery.join().unwrap());
        });
        assert!(!registry.is_created());
    }

    #[test]
    fn destroy_from_inside_callback_returns() {
        static REGISTRY: OnceLock<CallbackRegistry<MockBackend>> = OnceLock::new();
        static DESTROYED: AtomicBool = AtomicBool::new(false);
        unsafe extern "C" fn on_pcm(_: *const u8, _: usize, _: f64, _: i32, _: i32) {
            if let Some(registry) = REGISTRY.get() {
                registry.destroy();
                DESTROYED.store(true, Ordering::SeqCst);
            }
        }

        let (registry, control) = shared(&REGISTRY);
        assert!(registry.create());
        registry.set_pcm_callback(Some(on_pcm));
        registry.start();
        assert!(wait_until(TIMEOUT, || registry.state().is_capturing()));

        assert!(control.deliver(&[0u8; 64]));
        assert!(DESTROYED.load(Ordering::SeqCst));
        assert!(!registry.is_created());
        assert!(wait_until(TIMEOUT, || control.active_streams() == 0));
    }

    #[test]
    fn failed_factory_reports_false() {
        let registry: CallbackRegistry<MockBackend> =
            CallbackRegistry::new(|| Err(CaptureError::Unavailable("test".into())));
        assert!(!registry.create());
        assert!(!registry.is_created());
    }
}
