//! System audio capture executable.
//!
//! Prints one `Received PCM data: ...` line per captured buffer on stdout,
//! free-text log lines on stdout and errors on stderr. SIGINT/SIGTERM stop
//! capture and exit 0; permission denial or start failure exit 1.

mod driver;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use loopback_capture_core::CaptureConfiguration;

use sink::LineProtocolSink;

const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let backend = match loopback_capture_platform::default_backend() {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Audio capture error: {}", e);
            std::process::exit(driver::EXIT_FAILURE);
        }
    };

    let sink = match LineProtocolSink::stdio() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            eprintln!("Audio capture error: failed to start output writer: {}", e);
            std::process::exit(driver::EXIT_FAILURE);
        }
    };

    let code = driver::run(
        backend,
        CaptureConfiguration::default(),
        sink.clone(),
        driver::wait_for_signal,
    );

    if !sink.flush(OUTPUT_FLUSH_TIMEOUT) {
        log::warn!("Output writer did not drain before exit");
    }
    if sink.dropped_lines() > 0 {
        log::warn!("{} output lines dropped while stdout was blocked", sink.dropped_lines());
    }
    std::process::exit(code);
}
