//! Loopviz audio analysis core
//!
//! Captures the system playback mix through a loopback endpoint, keeps the
//! most recent samples in a ring buffer, and turns them into a 64-band
//! log-spaced spectrum, an envelope level and a beat signal for a renderer.
//! When no loopback device can be opened the engine runs a deterministic
//! three-tone simulation instead.

pub mod audio;
pub mod diagnostics;

pub use audio::{AudioConfig, AudioEngine, EngineError, FeatureSnapshot, LifecycleState, Mode};
pub use diagnostics::DiagnosticLog;
