//! Windows capture permission check for system audio.
//!
//! WASAPI loopback is not gated by the privacy settings that govern the
//! microphone: any desktop process may read the render mix. The only thing
//! that can make loopback "unauthorized" is the absence of a usable render
//! endpoint, or an activation refused with `E_ACCESSDENIED`.

use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

use loopback_capture_core::CaptureError;

const E_ACCESSDENIED: i32 = -2147024891;

/// Check whether system audio can be captured from the default render device.
///
/// Returns `Ok(false)` when there is no render endpoint or activation is
/// denied; other COM failures are reported as errors.
pub fn check_system_audio_permission() -> Result<bool, CaptureError> {
    unsafe {
        CoInitializeEx(None, COINIT_MULTITHREADED)
            .ok()
            .map_err(|e| CaptureError::Unknown(format!("CoInitializeEx failed: {}", e)))?;

        let result = check_render_access_inner();

        CoUninitialize();
        result
    }
}

unsafe fn check_render_access_inner() -> Result<bool, CaptureError> {
    let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
        .map_err(|e| CaptureError::Unknown(format!("failed to create enumerator: {}", e)))?;

    let device = match enumerator.GetDefaultAudioEndpoint(eRender, eConsole) {
        Ok(d) => d,
        Err(_) => {
            log::warn!("No default render endpoint; nothing to capture");
            return Ok(false);
        }
    };

    let result: windows::core::Result<IAudioClient> = device.Activate(CLSCTX_ALL, None);
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.code().0 == E_ACCESSDENIED => Ok(false),
        Err(e) => {
            // Anything else is an OS fault, not a refusal.
            log::warn!("Unexpected error checking loopback access: {}", e);
            Err(CaptureError::DeviceNotAvailable)
        }
    }
}
