use serde::{Deserialize, Serialize};

/// Format metadata for delivered PCM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: f64,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// 48 kHz, stereo, 16-bit interleaved.
    pub const REFERENCE: PcmFormat = PcmFormat {
        sample_rate: 48000.0,
        channels: 2,
        bits_per_sample: 16,
    };

    /// Size of one interleaved frame (one sample per channel) in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Number of whole frames in `len` bytes.
    pub fn frames_in(&self, len: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            n => len / n,
        }
    }
}

/// One delivered chunk of interleaved PCM.
///
/// Produced once per OS buffer-arrival event. Sinks receive it by reference
/// and must copy `bytes` if they keep them past the delivery call.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub bytes: Vec<u8>,
    pub format: PcmFormat,
}

impl PcmFrame {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.format.frames_in(self.bytes.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Counters for debugging capture sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDiagnostics {
    pub streams_opened: u64,
    pub frames_delivered: u64,
    pub bytes_delivered: u64,
    pub frames_dropped: u64,
    pub conversion_failures: u64,
    pub stream_faults: u64,
}
