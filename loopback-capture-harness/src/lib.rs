//! Out-of-process transport for `loopback-capturer`.
//!
//! Runs the capture executable as a child process and turns its text output
//! into [`TransportEvent`]s:
//!
//! ```text
//! stdout "Received PCM data: ..."  → TransportEvent::Pcm
//! stdout (anything else)           → TransportEvent::Log
//! stderr                           → TransportEvent::Error
//! process exit                     → TransportEvent::Closed
//! ```
//!
//! Best effort only: lines that do not match the protocol exactly are never
//! reported as PCM.

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::ProcessTransportConfig;
pub use error::TransportError;
pub use protocol::{parse_pcm_line, PcmInfo, TransportEvent};
pub use transport::{EventCallback, ProcessTransport};
