use crate::models::audio_models::PcmFrame;
use crate::models::state::CaptureState;

/// Consumer of capture output.
///
/// `on_pcm_data` runs synchronously on the OS capture thread. Implementations
/// must copy what they need and return quickly: no unbounded queuing and no
/// blocking I/O on that thread.
pub trait DeliverySink: Send + Sync {
    /// Called once per OS buffer arrival while the session is capturing.
    fn on_pcm_data(&self, frame: &PcmFrame);

    /// Called for start failures, stream faults and conversion failures.
    /// Errors are advisory.
    fn on_error(&self, message: &str);

    /// Called after every state transition. `Capturing` is the explicit
    /// "capture started" acknowledgement.
    fn on_state_changed(&self, _state: CaptureState) {}
}
