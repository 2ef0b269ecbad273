//! The capturer's stdout line protocol and the events derived from it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PCM_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Received PCM data: (\d+) bytes, ([\d.]+)Hz, (\d+) channels, (\d+) bits$")
        .expect("PCM line pattern is valid")
});

/// Metadata of one delivered PCM buffer as reported by the capturer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmInfo {
    pub bytes: u64,
    pub sample_rate: f64,
    pub channels: u32,
    pub bits_per_sample: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TransportEvent {
    /// The child process was spawned.
    #[serde(rename = "started")]
    Started { pid: u32 },
    #[serde(rename = "pcmData")]
    Pcm(PcmInfo),
    /// A stdout line that is not a PCM report.
    #[serde(rename = "log")]
    Log(String),
    #[serde(rename = "error")]
    Error(String),
    /// The child exited. Always the last event of a run.
    #[serde(rename = "close")]
    Closed { code: Option<i32>, signal: Option<i32> },
}

impl TransportEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Parse one stdout line. The whole line must match; a trailing newline or
/// carriage return is ignored.
pub fn parse_pcm_line(line: &str) -> Option<PcmInfo> {
    let line = line.trim_end_matches(['\r', '\n']);
    let captures = PCM_LINE.captures(line)?;
    Some(PcmInfo {
        bytes: captures[1].parse().ok()?,
        sample_rate: captures[2].parse().ok()?,
        channels: captures[3].parse().ok()?,
        bits_per_sample: captures[4].parse().ok()?,
    })
}
