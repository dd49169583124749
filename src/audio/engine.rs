//! Audio engine lifecycle and feature snapshot API
//!
//! The engine owns the capture source, the ring buffer shared with the
//! capture thread, the feature extractor and the diagnostic log. The renderer
//! drives it from a single thread: `initialize()`, then `update()` once per
//! display tick, then `cleanup()`. Accessors return copies and never hold the
//! ring mutex longer than a copy.

use super::{
    default_source, AudioConfig, CaptureSource, DeliverFn, FeatureExtractor, RingBuffer,
    SimulationSource, ENVELOPE_ALPHA, NUM_BANDS, WINDOW_SIZE,
};
use crate::diagnostics::DiagnosticLog;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Envelope level reported while the simulation source is active
const SIMULATED_ENVELOPE: f32 = 0.5;

/// Callbacks logged individually after start
const EARLY_CALLBACK_LOGS: u64 = 5;

/// Period, in callbacks, of the capture progress log
const CALLBACK_LOG_INTERVAL: u64 = 100;

/// Bands included in the periodic state dump
const DUMP_BANDS: usize = 8;

/// Engine lifecycle errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("Audio engine is already initialized")]
    AlreadyInitialized,

    #[error("Audio engine has been shut down")]
    ShutDown,
}

/// Which source is feeding the ring buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Simulation,
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Live,
    Simulation,
    ShuttingDown,
    Destroyed,
}

/// Copy of all renderer-facing features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// 64 log-spaced bands in [0, 1]
    pub spectrum: Vec<f32>,

    /// Smoothed mean absolute sample level in [0, 1]
    pub envelope_level: f32,

    /// Low-band energy in [0, 1]
    pub beat: f32,

    /// Envelope level scaled for display, in [0, 1]
    pub amplitude: f32,

    /// `None` until the engine has been initialized
    pub mode: Option<Mode>,
}

/// f32 stored as bits for lock-free reads
struct AtomicLevel(AtomicU32);

impl AtomicLevel {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// State guarded by the single ring mutex
struct Core {
    ring: RingBuffer,
    spectrum: Vec<f32>,
}

/// State shared between the engine and the capture thread
struct Shared {
    core: Mutex<Core>,
    envelope: AtomicLevel,
    beat: AtomicLevel,
    callbacks: AtomicU64,

    // Deliveries are accepted only while live capture is the active source
    accepting: AtomicBool,
    refusal_logged: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                ring: RingBuffer::new(),
                spectrum: vec![0.0; NUM_BANDS],
            }),
            envelope: AtomicLevel::new(0.0),
            beat: AtomicLevel::new(0.0),
            callbacks: AtomicU64::new(0),
            accepting: AtomicBool::new(false),
            refusal_logged: AtomicBool::new(false),
        }
    }

    /// Delivery function handed to the capture source
    fn deliver_fn(shared: Arc<Self>, diagnostics: Arc<DiagnosticLog>) -> DeliverFn {
        Box::new(move |frames: &[f32]| shared.deliver(frames, &diagnostics))
    }

    /// Append one captured block and fold its level into the envelope
    fn deliver(&self, frames: &[f32], diagnostics: &DiagnosticLog) {
        if !self.accepting.load(Ordering::Acquire) {
            if !self.refusal_logged.swap(true, Ordering::AcqRel) {
                diagnostics.warn("Dropping capture delivery: live capture is not the active source");
            }
            return;
        }

        let (level, envelope) = {
            let mut core = self.core.lock();
            let level = core.ring.append(frames);
            let mut envelope = self.envelope.load();
            if let Some(mean) = level.mean() {
                envelope = ENVELOPE_ALPHA * envelope + (1.0 - ENVELOPE_ALPHA) * mean;
                self.envelope.store(envelope);
            }
            (level, envelope)
        };

        let count = self.callbacks.fetch_add(1, Ordering::AcqRel) + 1;
        if count <= EARLY_CALLBACK_LOGS {
            diagnostics.info(&format!("Capture callback #{}: {} frames", count, level.count));
        } else if count % CALLBACK_LOG_INTERVAL == 0 {
            diagnostics.info(&format!(
                "Capture callback #{}: envelope {:.4}, raw peak {:.4}",
                count, envelope, level.raw_peak
            ));
        }
    }

    /// Zero every renderer-visible output and the ring
    fn reset(&self) {
        let mut core = self.core.lock();
        core.ring.clear();
        core.spectrum.fill(0.0);
        self.envelope.store(0.0);
        self.beat.store(0.0);
    }
}

/// Loopback audio analysis engine
pub struct AudioEngine {
    config: AudioConfig,
    source: Box<dyn CaptureSource>,
    shared: Arc<Shared>,
    extractor: FeatureExtractor,
    simulation: Option<SimulationSource>,

    state: LifecycleState,
    mode: Option<Mode>,

    // Injected sink taken at initialize(); otherwise opened from config
    pending_log: Option<DiagnosticLog>,
    diagnostics: Option<Arc<DiagnosticLog>>,

    // Analysis scratch, reused every tick
    window: Vec<f32>,

    last_update: Option<Instant>,
    last_dump: Option<Instant>,
    update_count: u64,
    simulation_announced: bool,
    repeat_cleanup_logged: bool,
}

impl AudioEngine {
    /// Engine capturing from the platform's default loopback source
    pub fn new(config: AudioConfig) -> Self {
        let source = default_source(config.poll_interval);
        Self::with_source(config, source)
    }

    /// Engine capturing from `source`
    pub fn with_source(config: AudioConfig, source: Box<dyn CaptureSource>) -> Self {
        let extractor = FeatureExtractor::new(config.sample_rate);
        Self {
            config,
            source,
            shared: Arc::new(Shared::new()),
            extractor,
            simulation: None,
            state: LifecycleState::Uninitialized,
            mode: None,
            pending_log: None,
            diagnostics: None,
            window: vec![0.0; WINDOW_SIZE],
            last_update: None,
            last_dump: None,
            update_count: 0,
            simulation_announced: false,
            repeat_cleanup_logged: false,
        }
    }

    /// Use `log` instead of opening `config.log_path` at initialize()
    pub fn with_log(mut self, log: DiagnosticLog) -> Self {
        self.pending_log = Some(log);
        self
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Open diagnostics, start capture, and fall back to simulation if
    /// capture cannot be started.
    ///
    /// Capture failures are never returned; the result is the selected mode.
    pub fn initialize(&mut self) -> Result<Mode, EngineError> {
        match self.state {
            LifecycleState::Uninitialized => {}
            LifecycleState::Initializing | LifecycleState::Live | LifecycleState::Simulation => {
                return Err(EngineError::AlreadyInitialized)
            }
            LifecycleState::ShuttingDown | LifecycleState::Destroyed => {
                return Err(EngineError::ShutDown)
            }
        }
        self.state = LifecycleState::Initializing;

        let diagnostics = Arc::new(match self.pending_log.take() {
            Some(log) => log,
            None => DiagnosticLog::create_or_console(self.config.log_path.as_deref()),
        });
        diagnostics.info("Audio engine initializing");
        diagnostics.info(&format!("Starting capture source: {}", self.source.name()));

        self.shared.accepting.store(true, Ordering::Release);
        let deliver = Shared::deliver_fn(self.shared.clone(), diagnostics.clone());

        let mode = match self.source.initialize(deliver, diagnostics.clone()) {
            Ok(format) => {
                let sample_rate = if format.sample_rate > 0 {
                    format.sample_rate
                } else {
                    self.config.sample_rate
                };
                self.extractor = FeatureExtractor::new(sample_rate);
                diagnostics.info(&format!(
                    "Live capture started: {} Hz, {} channels",
                    sample_rate, format.channels
                ));
                Mode::Live
            }
            Err(e) => {
                self.shared.accepting.store(false, Ordering::Release);
                self.source.shutdown();
                diagnostics.error(&format!(
                    "Capture initialization failed: {}; falling back to simulation",
                    e
                ));
                self.simulation = Some(SimulationSource::new(self.config.sample_rate));
                self.shared.envelope.store(SIMULATED_ENVELOPE);
                Mode::Simulation
            }
        };

        self.mode = Some(mode);
        self.state = match mode {
            Mode::Live => LifecycleState::Live,
            Mode::Simulation => LifecycleState::Simulation,
        };
        diagnostics.info(&format!("Audio engine initialized in {:?} mode", mode));
        self.diagnostics = Some(diagnostics);

        Ok(mode)
    }

    /// Advance features one display tick
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// Advance features as of `now`.
    ///
    /// Calls closer than `update_interval` to the last full analysis, and
    /// calls outside the Live/Simulation states, are no-ops.
    pub fn update_at(&mut self, now: Instant) {
        if !matches!(
            self.state,
            LifecycleState::Live | LifecycleState::Simulation
        ) {
            return;
        }

        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.config.update_interval {
                return;
            }
        }
        self.last_update = Some(now);
        self.update_count += 1;

        {
            let mut core = self.shared.core.lock();
            if let Some(simulation) = self.simulation.as_mut() {
                simulation.fill(&mut core.ring);
                self.shared.envelope.store(SIMULATED_ENVELOPE);
            }
            core.ring.snapshot_into(&mut self.window);
        }

        if self.simulation.is_some() && !self.simulation_announced {
            self.simulation_announced = true;
            self.log_info("Running in simulation mode");
        }

        let spectrum = self.extractor.analyze(&self.window);
        self.shared.core.lock().spectrum.copy_from_slice(spectrum);
        self.shared.beat.store(self.extractor.beat());

        match self.last_dump {
            None => self.last_dump = Some(now),
            Some(last) if now.saturating_duration_since(last) >= self.config.dump_interval => {
                self.last_dump = Some(now);
                self.dump_state();
            }
            Some(_) => {}
        }
    }

    /// Copy of the current spectrum
    pub fn spectrum(&self) -> Vec<f32> {
        self.shared.core.lock().spectrum.clone()
    }

    pub fn envelope_level(&self) -> f32 {
        self.shared.envelope.load()
    }

    pub fn beat(&self) -> f32 {
        self.shared.beat.load()
    }

    /// Envelope level doubled and capped at 1
    pub fn amplitude(&self) -> f32 {
        (self.envelope_level() * 2.0).min(1.0)
    }

    /// Mode chosen at initialization; kept after cleanup
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Number of capture blocks accepted so far
    pub fn callback_count(&self) -> u64 {
        self.shared.callbacks.load(Ordering::Acquire)
    }

    /// All renderer-facing features in one copy
    pub fn snapshot(&self) -> FeatureSnapshot {
        let envelope_level = self.envelope_level();
        FeatureSnapshot {
            spectrum: self.spectrum(),
            envelope_level,
            beat: self.beat(),
            amplitude: (envelope_level * 2.0).min(1.0),
            mode: self.mode,
        }
    }

    /// Stop capture, zero the outputs and close the diagnostic log.
    ///
    /// Idempotent; a repeated call is logged once.
    pub fn cleanup(&mut self) {
        if matches!(
            self.state,
            LifecycleState::ShuttingDown | LifecycleState::Destroyed
        ) {
            if !self.repeat_cleanup_logged {
                self.repeat_cleanup_logged = true;
                log::warn!("Audio engine cleanup called again; already shut down");
            }
            return;
        }

        self.state = LifecycleState::ShuttingDown;
        self.log_info("Audio engine shutting down");

        self.shared.accepting.store(false, Ordering::Release);
        self.source.shutdown();
        self.simulation = None;

        self.shared.reset();
        self.extractor.reset();

        if let Some(diagnostics) = self.diagnostics.take() {
            diagnostics.info(&format!(
                "Audio engine destroyed after {} updates, {} capture callbacks",
                self.update_count,
                self.callback_count()
            ));
            diagnostics.close();
        }
        self.state = LifecycleState::Destroyed;
    }

    fn log_info(&self, message: &str) {
        match &self.diagnostics {
            Some(diagnostics) => diagnostics.info(message),
            None => log::info!("{}", message),
        }
    }

    fn dump_state(&self) {
        let (energy, head) = {
            let core = self.shared.core.lock();
            let energy: f32 = core.spectrum.iter().sum();
            let head: Vec<String> = core
                .spectrum
                .iter()
                .take(DUMP_BANDS)
                .map(|v| format!("{:.3}", v))
                .collect();
            (energy, head)
        };

        self.log_info(&format!(
            "State dump: updates={}, envelope={:.4}, energy={:.4}, callbacks={}, mode={:?}, bands=[{}]",
            self.update_count,
            self.envelope_level(),
            energy,
            self.callback_count(),
            self.mode,
            head.join(", ")
        ));
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if !matches!(
            self.state,
            LifecycleState::ShuttingDown | LifecycleState::Destroyed
        ) {
            self.cleanup();
        }
    }
}
