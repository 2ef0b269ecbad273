//! # loopback-capture-platform
//!
//! OS backends for loopback-capture.
//!
//! Provides:
//! - `WasapiLoopbackBackend`: system audio via WASAPI loopback on the default render endpoint (Windows)
//! - `UnsupportedBackend`: refuses to capture, on every other platform
//! - `permissions`: render-endpoint access check (Windows)
//! - `DefaultBackend` / `default_backend()`: whichever of the above fits the build target
//!
//! ## Usage
//! ```ignore
//! use loopback_capture_core::CaptureSession;
//! use loopback_capture_platform::default_backend;
//!
//! let mut session = CaptureSession::new(default_backend()?);
//! session.start()?;
//! ```

#[cfg(target_os = "windows")]
pub mod permissions;
#[cfg(target_os = "windows")]
pub mod wasapi_loopback;

pub mod unsupported;

#[cfg(target_os = "windows")]
pub use wasapi_loopback::{WasapiLoopbackBackend, WasapiLoopbackStream};

pub use unsupported::UnsupportedBackend;

use loopback_capture_core::CaptureError;

/// Backend used by the C ABI and the capture executable on this target.
#[cfg(target_os = "windows")]
pub type DefaultBackend = WasapiLoopbackBackend;

/// Backend used by the C ABI and the capture executable on this target.
#[cfg(not(target_os = "windows"))]
pub type DefaultBackend = UnsupportedBackend;

/// Construct the backend for the current platform.
pub fn default_backend() -> Result<DefaultBackend, CaptureError> {
    #[cfg(target_os = "windows")]
    {
        WasapiLoopbackBackend::default_device()
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(UnsupportedBackend::new())
    }
}
