//! # loopback-capture-core
//!
//! Platform-agnostic core for system (loopback) audio capture.
//!
//! Provides the capture session state machine, buffer conversion, the
//! delivery sink seam and the callback registry behind the C ABI.
//! Platform backends (WASAPI loopback on Windows) implement the
//! `CaptureBackend` trait and plug into the generic `CaptureSession`.
//!
//! ## Architecture
//!
//! ```text
//! loopback-capture-core (this crate)
//! ├── traits/       ← CaptureBackend, CaptureStream, StreamListener, SampleBuffer, DeliverySink
//! ├── models/       ← CaptureError, CaptureState, CaptureConfiguration, PcmFormat, PcmFrame
//! ├── processing/   ← buffer converter
//! ├── session/      ← CaptureSession (state machine)
//! └── registry/     ← CallbackRegistry (function-pointer slots + control thread)
//! ```
//!
//! Data flows one way: OS stream → converter → sink. Control flows the other:
//! caller → registry → session → OS stream.

pub mod models;
pub mod processing;
pub mod registry;
pub mod session;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export key types at crate root for convenience.
pub use models::audio_models::{PcmFormat, PcmFrame, SessionDiagnostics};
pub use models::config::CaptureConfiguration;
pub use models::error::CaptureError;
pub use models::state::CaptureState;
pub use registry::{CallbackRegistry, ErrorCallback, PcmCallback, StateCallback};
pub use session::capture::CaptureSession;
pub use traits::capture_backend::{CaptureBackend, CaptureStream, SampleBuffer, StreamListener};
pub use traits::delivery_sink::DeliverySink;
