//! Audio capture and feature extraction pipeline

mod analysis;
mod buffer;
pub mod capture;
mod engine;
mod simulation;

pub use analysis::{band_frequency, FeatureExtractor};
pub use buffer::{BlockLevel, RingBuffer};
pub use capture::{default_source, CaptureError, CaptureSource, DeliverFn, StreamFormat};
pub use engine::{AudioEngine, EngineError, FeatureSnapshot, LifecycleState, Mode};
pub use simulation::SimulationSource;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Analysis window length in samples
pub const WINDOW_SIZE: usize = 2048;

/// Ring buffer capacity (twice the analysis window)
pub const RING_CAPACITY: usize = WINDOW_SIZE * 2;

/// Number of log-spaced spectrum bands
pub const NUM_BANDS: usize = 64;

/// Gain applied to the folded mono signal before clamping
pub const INPUT_GAIN: f32 = 3.0;

/// EMA coefficient for the envelope level
pub const ENVELOPE_ALPHA: f32 = 0.9;

/// Spectra whose maximum is at or below this are left un-normalized
pub const NORMALIZE_THRESHOLD: f32 = 1e-3;

/// Default diagnostic log file, relative to the working directory
pub const DEFAULT_LOG_FILE: &str = "audio_debug.txt";

/// Audio processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate in Hz used when the capture source reports none, and in simulation
    pub sample_rate: u32,

    /// Diagnostic log file; `None` keeps diagnostics on the console only
    pub log_path: Option<PathBuf>,

    /// Sleep between capture polls
    pub poll_interval: Duration,

    /// Minimum interval between full analyses
    pub update_interval: Duration,

    /// Period of the diagnostic state dump
    pub dump_interval: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            log_path: Some(PathBuf::from(DEFAULT_LOG_FILE)),
            poll_interval: Duration::from_millis(10),
            update_interval: Duration::from_millis(16),
            dump_interval: Duration::from_secs(2),
        }
    }
}
