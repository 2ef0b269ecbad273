//! WASAPI loopback backend for system audio.
//!
//! Captures the audio mix going to the default render endpoint using
//! `AUDCLNT_STREAMFLAGS_LOOPBACK`, with the engine converting to the
//! requested integer PCM format (`AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM`).
//!
//! ## Notes
//! - No entitlements, code signing, or consent prompt required
//! - Endpoint loopback always contains this process's own output
//! - DRM-protected audio is silenced in loopback

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use windows::core::PCWSTR;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::Win32::System::Threading::*;

use loopback_capture_core::{
    CaptureBackend, CaptureConfiguration, CaptureError, CaptureStream, SampleBuffer,
    StreamListener,
};

use crate::permissions;

/// One packet from `IAudioCaptureClient::GetBuffer`.
struct WasapiPacket<'a> {
    bytes: &'a [u8],
}

impl SampleBuffer for WasapiPacket<'_> {
    fn buffer_count(&self) -> usize {
        1
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        (index == 0).then_some(self.bytes)
    }
}

/// WASAPI loopback capture on the default render device.
pub struct WasapiLoopbackBackend {
    device_name: String,
}

impl WasapiLoopbackBackend {
    pub fn default_device() -> Result<Self, CaptureError> {
        Ok(Self {
            device_name: "System Audio (Loopback)".into(),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl CaptureBackend for WasapiLoopbackBackend {
    type Stream = WasapiLoopbackStream;

    fn name(&self) -> &'static str {
        "WASAPI loopback"
    }

    fn request_permission(&self) -> Result<bool, CaptureError> {
        permissions::check_system_audio_permission()
    }

    fn open_stream(
        &self,
        config: &CaptureConfiguration,
        listener: Arc<dyn StreamListener>,
    ) -> Result<WasapiLoopbackStream, CaptureError> {
        if config.exclude_current_process_audio {
            log::debug!("Endpoint loopback cannot exclude this process's own audio");
        }

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let config = config.clone();

        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("wasapi-loopback-capture".into())
            .spawn(move || {
                let mut ready = Some(ready_tx);
                let result = loopback_capture_loop(&thread_running, &config, listener.as_ref(), &mut ready);
                if let Err(e) = result {
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(e));
                        }
                        None if thread_running.load(Ordering::SeqCst) => {
                            log::error!("Loopback capture error: {}", e);
                            listener.on_stream_error(&e.to_string());
                        }
                        None => log::debug!("Loopback error during teardown: {}", e),
                    }
                }
                thread_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| CaptureError::Unknown(format!("failed to spawn loopback thread: {}", e)))?;

        let mut stream = WasapiLoopbackStream {
            running,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => {
                let _ = stream.stop();
                Err(e)
            }
            Err(_) => {
                let _ = stream.stop();
                Err(CaptureError::StreamStartFailed(
                    "loopback thread exited during startup".into(),
                ))
            }
        }
    }
}

/// Handle to a running loopback capture thread.
pub struct WasapiLoopbackStream {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureStream for WasapiLoopbackStream {
    fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CaptureError::StreamStopFailed("loopback thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for WasapiLoopbackStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Requested engine format: integer PCM at the configured rate and layout.
fn pcm_format(config: &CaptureConfiguration) -> WAVEFORMATEX {
    let block_align = config.channels * config.bit_depth / 8;
    let sample_rate = config.sample_rate as u32;
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_PCM as u16,
        nChannels: config.channels,
        nSamplesPerSec: sample_rate,
        nAvgBytesPerSec: sample_rate * block_align as u32,
        nBlockAlign: block_align,
        wBitsPerSample: config.bit_depth,
        cbSize: 0,
    }
}

/// Main loopback capture loop running on a dedicated thread.
///
/// Sequence:
/// 1. CoInitializeEx (MTA)
/// 2. Get default render endpoint
/// 3. Activate IAudioClient
/// 4. Initialize with LOOPBACK | AUTOCONVERTPCM in shared mode
/// 5. Get IAudioCaptureClient
/// 6. Register with MMCSS
/// 7. Start, report ready, poll for packets
fn loopback_capture_loop(
    running: &AtomicBool,
    config: &CaptureConfiguration,
    listener: &dyn StreamListener,
    ready: &mut Option<Sender<Result<(), CaptureError>>>,
) -> Result<(), CaptureError> {
    unsafe {
        CoInitializeEx(None, COINIT_MULTITHREADED)
            .ok()
            .map_err(|e| CaptureError::StreamStartFailed(format!("CoInitializeEx failed: {}", e)))?;

        let _com_guard = CoUninitializeGuard;

        let enumerator: IMMDeviceEnumerator =
            CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL).map_err(|_| CaptureError::DeviceNotAvailable)?;

        // Loopback reads from the RENDER endpoint
        let device = enumerator
            .GetDefaultAudioEndpoint(eRender, eConsole)
            .map_err(|_| CaptureError::DeviceNotAvailable)?;

        let audio_client: IAudioClient = device
            .Activate(CLSCTX_ALL, None)
            .map_err(|e| CaptureError::StreamStartFailed(format!("Activate failed: {}", e)))?;

        let format = pcm_format(config);
        let block_align = format.nBlockAlign as usize;
        let buffer_duration = 1_000_000; // 100ms in 100ns units

        audio_client
            .Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_LOOPBACK
                    | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM
                    | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY
                    | AUDCLNT_STREAMFLAGS_NOPERSIST,
                buffer_duration,
                0,
                &format,
                None,
            )
            .map_err(|e| {
                CaptureError::StreamStartFailed(format!("IAudioClient::Initialize (loopback) failed: {}", e))
            })?;

        let capture_client: IAudioCaptureClient = audio_client
            .GetService()
            .map_err(|e| CaptureError::StreamStartFailed(format!("GetService failed: {}", e)))?;

        let mut task_index: u32 = 0;
        let task_name: Vec<u16> = "Pro Audio\0".encode_utf16().collect();
        let _mmcss_handle = AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index);

        audio_client
            .Start()
            .map_err(|e| CaptureError::StreamStartFailed(format!("IAudioClient::Start failed: {}", e)))?;

        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }
        log::debug!(
            "WASAPI loopback started: {} Hz, {} ch, {}-bit",
            format.nSamplesPerSec,
            format.nChannels,
            format.wBitsPerSample
        );

        let result = drain_packets(running, &capture_client, block_align, listener);

        let _ = audio_client.Stop();
        result
    }
}

/// Poll every 10ms and hand each packet to the listener until `running` clears.
unsafe fn drain_packets(
    running: &AtomicBool,
    capture_client: &IAudioCaptureClient,
    block_align: usize,
    listener: &dyn StreamListener,
) -> Result<(), CaptureError> {
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(10));

        let mut packet_length = capture_client
            .GetNextPacketSize()
            .map_err(|e| CaptureError::StreamFault(format!("GetNextPacketSize failed: {}", e)))?;

        while packet_length > 0 {
            let mut buffer_ptr: *mut u8 = std::ptr::null_mut();
            let mut num_frames: u32 = 0;
            let mut flags: u32 = 0;

            capture_client
                .GetBuffer(&mut buffer_ptr, &mut num_frames, &mut flags, None, None)
                .map_err(|e| CaptureError::StreamFault(format!("GetBuffer failed: {}", e)))?;

            let len = num_frames as usize * block_align;
            if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 {
                let silence = vec![0u8; len];
                listener.on_sample_buffer(&WasapiPacket { bytes: &silence });
            } else if buffer_ptr.is_null() {
                listener.on_sample_buffer(&WasapiPacket { bytes: &[] });
            } else {
                let bytes = std::slice::from_raw_parts(buffer_ptr as *const u8, len);
                listener.on_sample_buffer(&WasapiPacket { bytes });
            }

            capture_client
                .ReleaseBuffer(num_frames)
                .map_err(|e| CaptureError::StreamFault(format!("ReleaseBuffer failed: {}", e)))?;

            packet_length = capture_client
                .GetNextPacketSize()
                .map_err(|e| CaptureError::StreamFault(format!("GetNextPacketSize failed: {}", e)))?;
        }
    }
    Ok(())
}

struct CoUninitializeGuard;

impl Drop for CoUninitializeGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}
