//! Windows WASAPI shared-mode loopback capture
//!
//! Opens the default render endpoint with the loopback flag and polls it for
//! packets on a dedicated thread. All COM objects are created, used and
//! released on that thread.

use super::{
    to_stereo, CaptureError, CaptureSource, CaptureThread, DeliverFn, ReadySender,
    SampleEncoding, StreamFormat,
};
use crate::diagnostics::DiagnosticLog;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use windows::core::GUID;
use windows::Win32::Media::Audio::{
    eConsole, eRender, IAudioCaptureClient, IAudioClient, IMMDevice, IMMDeviceEnumerator,
    MMDeviceEnumerator, AUDCLNT_BUFFERFLAGS_SILENT, AUDCLNT_SHAREMODE_SHARED,
    AUDCLNT_STREAMFLAGS_LOOPBACK, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED,
};

const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const SUBTYPE_IEEE_FLOAT: GUID = GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

/// Loopback capture of the default output device through WASAPI
pub struct WasapiLoopback {
    poll_interval: Duration,
    thread: Option<CaptureThread>,
}

impl WasapiLoopback {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            thread: None,
        }
    }
}

impl CaptureSource for WasapiLoopback {
    fn name(&self) -> &'static str {
        "WASAPI loopback"
    }

    fn initialize(
        &mut self,
        deliver: DeliverFn,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Result<StreamFormat, CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::Thread("capture already running".to_string()));
        }

        let poll_interval = self.poll_interval;
        let (thread, format) = CaptureThread::spawn(move |running, ready| {
            run_capture_thread(running, ready, deliver, diagnostics, poll_interval)
        })?;

        self.thread = Some(thread);
        Ok(format)
    }

    fn shutdown(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
        }
    }
}

impl Drop for WasapiLoopback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Balances a successful `CoInitializeEx` on drop
struct ComGuard;

impl ComGuard {
    fn init() -> Result<Self, CaptureError> {
        // SAFETY: called once on the capture thread, paired with CoUninitialize in Drop.
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
            .ok()
            .map_err(|e| CaptureError::Com(format!("CoInitializeEx failed: {}", e)))?;
        Ok(Self)
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        // SAFETY: only constructed after CoInitializeEx succeeded on this thread.
        unsafe { CoUninitialize() };
    }
}

/// A started loopback stream
///
/// Fields drop in declaration order, which releases the interfaces in reverse
/// order of acquisition.
struct LoopbackSession {
    capture_client: IAudioCaptureClient,
    audio_client: IAudioClient,
    _device: IMMDevice,
    _enumerator: IMMDeviceEnumerator,
    encoding: SampleEncoding,
    format: StreamFormat,
}

impl LoopbackSession {
    /// Acquire the default render endpoint and start it in loopback mode.
    ///
    /// # Safety
    ///
    /// COM must be initialized on the calling thread.
    unsafe fn open() -> Result<Self, CaptureError> {
        let enumerator: IMMDeviceEnumerator =
            CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(|e| CaptureError::Com(format!("CoCreateInstance failed: {}", e)))?;

        let device = enumerator
            .GetDefaultAudioEndpoint(eRender, eConsole)
            .map_err(|e| CaptureError::Com(format!("GetDefaultAudioEndpoint failed: {}", e)))?;

        let audio_client: IAudioClient = device
            .Activate(CLSCTX_ALL, None)
            .map_err(|e| CaptureError::Com(format!("Device Activate failed: {}", e)))?;

        let format_ptr = audio_client
            .GetMixFormat()
            .map_err(|e| CaptureError::Com(format!("GetMixFormat failed: {}", e)))?;

        // The mix format is read, then handed to Initialize, then freed on every path.
        let described = describe_format(format_ptr);
        let initialized = match &described {
            Ok(_) => audio_client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_LOOPBACK,
                    0,
                    0,
                    format_ptr,
                    None,
                )
                .map_err(|e| CaptureError::Com(format!("AudioClient Initialize failed: {}", e))),
            Err(_) => Ok(()),
        };
        CoTaskMemFree(Some(format_ptr as *const _));
        let (encoding, format) = described?;
        initialized?;

        let capture_client: IAudioCaptureClient = audio_client
            .GetService()
            .map_err(|e| CaptureError::Com(format!("GetService failed: {}", e)))?;

        audio_client
            .Start()
            .map_err(|e| CaptureError::Com(format!("AudioClient Start failed: {}", e)))?;

        Ok(Self {
            capture_client,
            audio_client,
            _device: device,
            _enumerator: enumerator,
            encoding,
            format,
        })
    }

    /// Poll for packets until the run flag clears or the API fails
    fn pump(
        &self,
        running: &AtomicBool,
        deliver: &mut DeliverFn,
        diagnostics: &DiagnosticLog,
        poll_interval: Duration,
    ) {
        let channels = self.format.channels as usize;
        let frame_bytes = channels * self.encoding.bytes_per_sample();
        let mut decoded = Vec::with_capacity(4096);
        let mut stereo = Vec::with_capacity(4096);

        'capture: while running.load(Ordering::SeqCst) {
            // SAFETY: the capture client stays valid for the lifetime of self.
            let mut packet_length = match unsafe { self.capture_client.GetNextPacketSize() } {
                Ok(len) => len,
                Err(e) => {
                    diagnostics.error(&format!("GetNextPacketSize failed in capture loop: {}", e));
                    break;
                }
            };

            while packet_length != 0 {
                let mut data: *mut u8 = std::ptr::null_mut();
                let mut frames: u32 = 0;
                let mut flags: u32 = 0;

                // SAFETY: out-pointers reference live locals.
                let fetched = unsafe {
                    self.capture_client
                        .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                };
                if let Err(e) = fetched {
                    diagnostics.error(&format!("GetBuffer failed in capture loop: {}", e));
                    break 'capture;
                }

                let silent = (flags & AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0;
                if !silent && frames > 0 && !data.is_null() {
                    // SAFETY: WASAPI guarantees `frames` whole frames of the mix
                    // format at `data` until ReleaseBuffer.
                    let bytes =
                        unsafe { std::slice::from_raw_parts(data, frames as usize * frame_bytes) };
                    self.encoding.decode(bytes, &mut decoded);
                    to_stereo(&decoded, channels, &mut stereo);
                    deliver(&stereo);
                }

                // SAFETY: releases exactly the frames obtained above.
                if let Err(e) = unsafe { self.capture_client.ReleaseBuffer(frames) } {
                    diagnostics.error(&format!("ReleaseBuffer failed in capture loop: {}", e));
                    break 'capture;
                }

                // SAFETY: as above.
                packet_length = match unsafe { self.capture_client.GetNextPacketSize() } {
                    Ok(len) => len,
                    Err(e) => {
                        diagnostics.error(&format!(
                            "GetNextPacketSize after ReleaseBuffer failed in capture loop: {}",
                            e
                        ));
                        break 'capture;
                    }
                };
            }

            thread::sleep(poll_interval);
        }
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        // SAFETY: the client was started in open().
        if let Err(e) = unsafe { self.audio_client.Stop() } {
            log::warn!("AudioClient Stop failed: {}", e);
        }
    }
}

/// Read encoding, rate and channel count from a mix format
///
/// # Safety
///
/// `format_ptr` must point to a valid WAVEFORMATEX (or WAVEFORMATEXTENSIBLE
/// when its tag says so), as returned by GetMixFormat.
unsafe fn describe_format(
    format_ptr: *const WAVEFORMATEX,
) -> Result<(SampleEncoding, StreamFormat), CaptureError> {
    let format = std::ptr::read_unaligned(format_ptr);
    let tag = format.wFormatTag;

    let is_float = tag == WAVE_FORMAT_IEEE_FLOAT
        || (tag == WAVE_FORMAT_EXTENSIBLE && {
            let ext_ptr = format_ptr as *const WAVEFORMATEXTENSIBLE;
            let sub_format = std::ptr::read_unaligned(std::ptr::addr_of!((*ext_ptr).SubFormat));
            sub_format == SUBTYPE_IEEE_FLOAT
        });

    let encoding = SampleEncoding::from_format(is_float, format.wBitsPerSample)?;
    if format.nChannels == 0 {
        return Err(CaptureError::UnsupportedFormat("zero channels".to_string()));
    }

    Ok((
        encoding,
        StreamFormat {
            sample_rate: format.nSamplesPerSec,
            channels: format.nChannels,
        },
    ))
}

/// Body of the capture thread
fn run_capture_thread(
    running: Arc<AtomicBool>,
    ready: ReadySender,
    mut deliver: DeliverFn,
    diagnostics: Arc<DiagnosticLog>,
    poll_interval: Duration,
) {
    let _com = match ComGuard::init() {
        Ok(guard) => guard,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // SAFETY: COM is initialized on this thread for the guard's lifetime.
    let session = match unsafe { LoopbackSession::open() } {
        Ok(session) => session,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    diagnostics.info(&format!(
        "WASAPI loopback started: {} Hz, {} channels, {:?}",
        session.format.sample_rate, session.format.channels, session.encoding
    ));
    let _ = ready.send(Ok(session.format));

    session.pump(&running, &mut deliver, &diagnostics, poll_interval);

    drop(session);
    diagnostics.info("WASAPI capture loop exited");
}
