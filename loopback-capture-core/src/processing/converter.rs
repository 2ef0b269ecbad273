//! Buffer conversion: one platform sample container → one `PcmFrame`.

use crate::models::audio_models::{PcmFormat, PcmFrame};
use crate::models::error::CaptureError;
use crate::traits::capture_backend::SampleBuffer;

/// Copy the first audio buffer of `sample` into an owned frame.
///
/// Never resamples and never merges buffers: additional buffers in the
/// container are ignored.
pub fn convert(sample: &dyn SampleBuffer, format: &PcmFormat) -> Result<PcmFrame, CaptureError> {
    if sample.buffer_count() == 0 {
        return Err(CaptureError::ConversionFailed("Failed to get audio buffer list".into()));
    }

    let bytes = sample
        .buffer(0)
        .ok_or_else(|| CaptureError::ConversionFailed("Failed to get audio buffer list".into()))?;

    if bytes.is_empty() {
        return Err(CaptureError::ConversionFailed("Audio buffer is empty".into()));
    }

    let frame_size = format.bytes_per_frame();
    if frame_size > 0 && bytes.len() % frame_size != 0 {
        log::debug!(
            "Audio buffer of {} bytes is not a whole number of {}-byte frames",
            bytes.len(),
            frame_size
        );
    }

    Ok(PcmFrame {
        bytes: bytes.to_vec(),
        format: *format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MultiBuffer {
        buffers: Vec<Option<Vec<u8>>>,
    }

    impl SampleBuffer for MultiBuffer {
        fn buffer_count(&self) -> usize {
            self.buffers.len()
        }

        fn buffer(&self, index: usize) -> Option<&[u8]> {
            self.buffers.get(index)?.as_deref()
        }
    }

    #[test]
    fn copies_first_buffer_with_format() {
        let raw: Vec<u8> = (0..=255).collect();
        let frame = convert(&raw, &PcmFormat::REFERENCE).unwrap();

        assert_eq!(frame.bytes, raw);
        assert_eq!(frame.format, PcmFormat::REFERENCE);
    }

    #[test]
    fn ignores_additional_buffers() {
        let sample = MultiBuffer {
            buffers: vec![Some(vec![1, 2, 3, 4]), Some(vec![9; 64])],
        };
        let frame = convert(&sample, &PcmFormat::REFERENCE).unwrap();
        assert_eq!(frame.bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn empty_buffer_fails() {
        let raw: Vec<u8> = Vec::new();
        let err = convert(&raw, &PcmFormat::REFERENCE).unwrap_err();
        assert!(matches!(err, CaptureError::ConversionFailed(_)));
    }

    #[test]
    fn inaccessible_buffer_fails() {
        let sample = MultiBuffer {
            buffers: vec![None],
        };
        let err = convert(&sample, &PcmFormat::REFERENCE).unwrap_err();
        assert_eq!(
            err,
            CaptureError::ConversionFailed("Failed to get audio buffer list".into())
        );

        let none = MultiBuffer { buffers: vec![] };
        assert!(convert(&none, &PcmFormat::REFERENCE).is_err());
    }

    #[test]
    fn partial_frames_are_delivered_unchanged() {
        let raw = vec![7u8; 6];
        let frame = convert(&raw, &PcmFormat::REFERENCE).unwrap();
        assert_eq!(frame.len(), 6);
        assert_eq!(frame.frame_count(), 1);
    }
}
