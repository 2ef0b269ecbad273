//! Process lifecycle: session, permission, start, wait for signal, stop.

use std::io;
use std::sync::Arc;

use loopback_capture_core::{CaptureBackend, CaptureConfiguration, CaptureSession, DeliverySink};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Block until SIGINT or SIGTERM arrives.
///
/// The handlers stay registered afterwards, so a second signal during
/// teardown is swallowed instead of killing the process.
#[cfg(unix)]
pub fn wait_for_signal() -> io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(signal) = signals.forever().next() {
        log::info!("Received signal {}", signal);
    }
    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
#[cfg(not(unix))]
pub fn wait_for_signal() -> io::Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};

    use signal_hook::consts::{SIGINT, SIGTERM};

    let received = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        let received = Arc::clone(&received);
        let waiter = std::thread::current();
        // SAFETY: the CRT runs console signal handlers on their own thread,
        // not in an interrupted context, so unparking is allowed.
        unsafe {
            signal_hook::low_level::register(signal, move || {
                received.store(true, Ordering::SeqCst);
                waiter.unpark();
            })?;
        }
    }
    while !received.load(Ordering::SeqCst) {
        std::thread::park();
    }
    log::info!("Received termination signal");
    Ok(())
}

/// Run one capture session until `wait_for_shutdown` returns. Returns the
/// exit status.
///
/// `wait_for_shutdown` is called only once capture has started.
pub fn run<B, F>(
    backend: B,
    config: CaptureConfiguration,
    sink: Arc<dyn DeliverySink>,
    wait_for_shutdown: F,
) -> i32
where
    B: CaptureBackend,
    F: FnOnce() -> io::Result<()>,
{
    log::info!("loopback-capturer - System Audio PCM Capture");
    log::info!("============================================");
    log::info!("Process ID: {}", std::process::id());

    let mut session = CaptureSession::new(backend);
    if let Err(e) = session.configure(config) {
        eprintln!("Audio capture error: {}", e);
        return EXIT_FAILURE;
    }

    log::info!("Requesting system audio capture permission...");
    match session.request_permission() {
        Ok(true) => log::info!("System audio capture permission granted"),
        Ok(false) => {
            eprintln!("System audio capture permission is required!");
            eprintln!("Grant this application access to system audio / screen recording");
            eprintln!("in the operating system's privacy settings, then restart it.");
            return EXIT_FAILURE;
        }
        Err(e) => {
            eprintln!("Audio capture error: {}", e);
            return EXIT_FAILURE;
        }
    }
    session.set_sink(Some(sink));

    log::info!("Starting audio capture...");
    if session.start().is_err() {
        // Already reported through the sink.
        return EXIT_FAILURE;
    }
    log::info!("Audio capture started successfully");
    log::info!("Press Ctrl+C to stop...");

    if let Err(e) = wait_for_shutdown() {
        eprintln!("Audio capture error: failed to wait for termination signal: {}", e);
        let _ = session.stop();
        return EXIT_FAILURE;
    }

    log::info!("Stopping audio capture...");
    let _ = session.stop();
    EXIT_OK
}
