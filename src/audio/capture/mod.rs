//! Loopback capture sources running on a dedicated thread

mod device;
#[cfg(target_os = "windows")]
mod wasapi;

pub use device::DeviceLoopback;
#[cfg(target_os = "windows")]
pub use wasapi::WasapiLoopback;

use crate::diagnostics::DiagnosticLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No loopback device found")]
    NoDevice,

    #[error("Audio API call failed: {0}")]
    Com(String),

    #[error("Unsupported mix format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to get device config: {0}")]
    Config(String),

    #[error("Failed to build audio stream: {0}")]
    Stream(String),

    #[error("Failed to start stream: {0}")]
    Play(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("Capture unavailable: {0}")]
    Unavailable(String),
}

/// Native format reported by a started capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Frames per second
    pub sample_rate: u32,

    /// Channels in the device's native layout (deliveries are always stereo)
    pub channels: u16,
}

/// Delivery function handed to a capture source.
///
/// Receives interleaved stereo f32 frames. Runs on the capture thread and must
/// stay short.
pub type DeliverFn = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A producer of loopback audio
pub trait CaptureSource: Send {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Acquire the OS endpoint, start the stream and spawn the capture thread.
    ///
    /// On success `deliver` is invoked from the capture thread for every
    /// non-silent packet until [`shutdown`](Self::shutdown).
    fn initialize(
        &mut self,
        deliver: DeliverFn,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Result<StreamFormat, CaptureError>;

    /// Stop the thread and release every OS handle. Idempotent.
    fn shutdown(&mut self);
}

/// Capture source for the current platform with the given poll interval
pub fn default_source(poll_interval: Duration) -> Box<dyn CaptureSource> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WasapiLoopback::new(poll_interval))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(DeviceLoopback::new(poll_interval))
    }
}

/// Integer or float sample layout of a native mix format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    F32,
    I16,
    I24,
    I32,
}

impl SampleEncoding {
    /// Pick the encoding for a float flag and container width
    pub fn from_format(is_float: bool, bits_per_sample: u16) -> Result<Self, CaptureError> {
        match (is_float, bits_per_sample) {
            (true, 32) => Ok(Self::F32),
            (false, 16) => Ok(Self::I16),
            (false, 24) => Ok(Self::I24),
            (false, 32) => Ok(Self::I32),
            (float, bits) => Err(CaptureError::UnsupportedFormat(format!(
                "{} {}-bit",
                if float { "float" } else { "PCM" },
                bits
            ))),
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::I16 => 2,
            Self::I24 => 3,
        }
    }

    /// Decode little-endian samples into `out` as f32 in [-1, 1]
    pub fn decode(self, bytes: &[u8], out: &mut Vec<f32>) {
        let width = self.bytes_per_sample();
        out.clear();
        out.extend(bytes.chunks_exact(width).map(|b| match self {
            Self::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Self::I16 => i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0,
            // Shift into the top of an i32 to sign-extend
            Self::I24 => {
                (i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8) as f32 / 8_388_608.0
            }
            Self::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0,
        }));
    }
}

/// Remap interleaved frames of `channels` channels to interleaved stereo.
///
/// Mono is duplicated; layouts wider than stereo keep the front pair.
pub fn to_stereo(samples: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    match channels {
        0 => {}
        1 => out.extend(samples.iter().flat_map(|&s| [s, s])),
        2 => out.extend_from_slice(samples),
        n => out.extend(samples.chunks_exact(n).flat_map(|frame| [frame[0], frame[1]])),
    }
}

/// Setup outcome a capture thread reports before entering its loop
type ReadySender = mpsc::Sender<Result<StreamFormat, CaptureError>>;

/// Dedicated capture thread with a cooperative run flag
pub(crate) struct CaptureThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    /// Spawn `body` and wait for it to report whether setup succeeded.
    ///
    /// `body` owns every OS handle it acquires so they are created, used and
    /// released on the same thread. It must send exactly one setup result and
    /// return once the run flag clears.
    pub(crate) fn spawn<F>(body: F) -> Result<(Self, StreamFormat), CaptureError>
    where
        F: FnOnce(Arc<AtomicBool>, ReadySender) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name("loopback-capture".to_string())
            .spawn(move || body(flag, ready_tx))
            .map_err(|e| CaptureError::Thread(e.to_string()))?;

        let mut worker = Self {
            running,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(format)) => Ok((worker, format)),
            Ok(Err(e)) => {
                worker.stop();
                Err(e)
            }
            Err(_) => {
                worker.stop();
                Err(CaptureError::Thread(
                    "capture thread exited during setup".to_string(),
                ))
            }
        }
    }

    /// Clear the run flag and join the thread
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}
