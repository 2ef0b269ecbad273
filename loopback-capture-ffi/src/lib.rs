//! # loopback-capture-ffi
//!
//! Flat C ABI over one process-wide `CallbackRegistry` driving the
//! platform default backend. See `include/loopback_capture.h`.
//!
//! Every entry point except `audio_capturer_create` is fire-and-forget:
//! outcomes come back through the registered callbacks. Pointers passed to
//! callbacks are valid only for the duration of that call.

use std::panic::{self, AssertUnwindSafe};

use once_cell::sync::Lazy;

use loopback_capture_core::{CallbackRegistry, ErrorCallback, PcmCallback, StateCallback};
use loopback_capture_platform::{default_backend, DefaultBackend};

static REGISTRY: Lazy<CallbackRegistry<DefaultBackend>> =
    Lazy::new(|| CallbackRegistry::new(default_backend));

/// Run `f`, turning a panic into `fallback` so it never unwinds into C.
fn guarded<T>(operation: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            log::error!("panic in {}", operation);
            fallback
        }
    }
}

/// Allocate the capture session. Returns false only if allocation fails.
#[no_mangle]
pub extern "C" fn audio_capturer_create() -> bool {
    guarded("audio_capturer_create", false, || REGISTRY.create())
}

/// Install (or clear, with NULL) the PCM callback.
#[no_mangle]
pub extern "C" fn audio_capturer_set_pcm_callback(callback: Option<PcmCallback>) {
    guarded("audio_capturer_set_pcm_callback", (), || {
        REGISTRY.set_pcm_callback(callback)
    })
}

/// Install (or clear, with NULL) the error callback.
#[no_mangle]
pub extern "C" fn audio_capturer_set_error_callback(callback: Option<ErrorCallback>) {
    guarded("audio_capturer_set_error_callback", (), || {
        REGISTRY.set_error_callback(callback)
    })
}

/// Install (or clear, with NULL) the state callback. State `2` (capturing)
/// acknowledges a successful start even when nothing is audible.
#[no_mangle]
pub extern "C" fn audio_capturer_set_state_callback(callback: Option<StateCallback>) {
    guarded("audio_capturer_set_state_callback", (), || {
        REGISTRY.set_state_callback(callback)
    })
}

#[no_mangle]
pub extern "C" fn audio_capturer_start() {
    guarded("audio_capturer_start", (), || REGISTRY.start())
}

#[no_mangle]
pub extern "C" fn audio_capturer_stop() {
    guarded("audio_capturer_stop", (), || REGISTRY.stop())
}

/// Stop, release the session and clear every callback slot.
#[no_mangle]
pub extern "C" fn audio_capturer_destroy() {
    guarded("audio_capturer_destroy", (), || REGISTRY.destroy())
}

#[no_mangle]
pub extern "C" fn audio_capturer_is_created() -> bool {
    guarded("audio_capturer_is_created", false, || REGISTRY.is_created())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_swallows_panics() {
        let value = guarded("test", 7, || -> i32 { panic!("boom") });
        assert_eq!(value, 7);
    }

    // The registry is process-wide, so the whole surface is exercised in one test.
    #[cfg(not(target_os = "windows"))]
    #[test]
    fn unsupported_platform_reports_start_failure_through_callback() {
        use std::ffi::{c_char, CStr};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::{Duration, Instant};

        static ERRORS: AtomicUsize = AtomicUsize::new(0);
        static MENTIONS_UNAVAILABLE: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn on_error(message: *const c_char) {
            let text = CStr::from_ptr(message).to_string_lossy();
            if text.starts_with("Failed to start audio capture") && text.contains("unavailable") {
                MENTIONS_UNAVAILABLE.fetch_add(1, Ordering::SeqCst);
            }
            ERRORS.fetch_add(1, Ordering::SeqCst);
        }

        audio_capturer_start();
        assert!(!audio_capturer_is_created());

        assert!(audio_capturer_create());
        audio_capturer_set_error_callback(Some(on_error));
        audio_capturer_start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ERRORS.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ERRORS.load(Ordering::SeqCst), 1);
        assert_eq!(MENTIONS_UNAVAILABLE.load(Ordering::SeqCst), 1);

        audio_capturer_stop();
        audio_capturer_destroy();
        assert!(!audio_capturer_is_created());

        // Slots are cleared: a new session reports nowhere until callbacks are set again.
        assert!(audio_capturer_create());
        audio_capturer_start();
        audio_capturer_destroy();
        assert_eq!(ERRORS.load(Ordering::SeqCst), 1);
    }
}
