use super::audio_models::PcmFormat;

/// Configuration for a capture session.
///
/// The reference configuration captures 48 kHz, 2-channel, 16-bit PCM
/// and leaves the capturing process's own audio out of the mix.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfiguration {
    /// Sample rate in Hz (default: 48000).
    pub sample_rate: f64,

    /// Bit depth for PCM output (default: 16). Valid values: 16, 24, 32.
    pub bit_depth: u16,

    /// Number of interleaved channels (default: 2).
    pub channels: u16,

    /// Exclude audio produced by this process (default: true).
    pub exclude_current_process_audio: bool,
}

impl CaptureConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate <= 0.0 {
            return Err("sample rate must be positive".into());
        }
        if ![16, 24, 32].contains(&self.bit_depth) {
            return Err(format!("unsupported bit depth: {}", self.bit_depth));
        }
        if ![1, 2].contains(&self.channels) {
            return Err(format!("unsupported channel count: {}", self.channels));
        }
        Ok(())
    }

    /// Format metadata attached to every delivered frame.
    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bit_depth,
        }
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            bit_depth: 16,
            channels: 2,
            exclude_current_process_audio: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_reference_format() {
        let config = CaptureConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.format(), PcmFormat::REFERENCE);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = CaptureConfiguration::default();
        config.bit_depth = 12;
        assert_eq!(config.validate(), Err("unsupported bit depth: 12".into()));

        let mut config = CaptureConfiguration::default();
        config.channels = 6;
        assert!(config.validate().is_err());

        let mut config = CaptureConfiguration::default();
        config.sample_rate = 0.0;
        assert!(config.validate().is_err());
    }
}
