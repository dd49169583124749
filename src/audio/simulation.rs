//! Deterministic test signal used when no loopback device can be opened

use super::RingBuffer;
use std::f64::consts::TAU;

/// Seconds the simulated clock advances per display tick
const TICK_SECONDS: f64 = 0.016;

/// Overall scale applied to the tone mix
const OUTPUT_SCALE: f64 = 0.5;

/// (frequency Hz, amplitude) of each simulated tone
const TONES: [(f64, f64); 3] = [(60.0, 0.6), (440.0, 0.4), (2000.0, 0.2)];

/// Three-tone composite written straight into the ring each tick
#[derive(Debug, Clone)]
pub struct SimulationSource {
    time: f64,
    sample_rate: u32,
}

impl SimulationSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            time: 0.0,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Simulated clock in seconds
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Advance one tick and overwrite the whole ring with the composite.
    ///
    /// Samples bypass the input gain; the mix peaks at 0.6 so it never clips.
    pub fn fill(&mut self, ring: &mut RingBuffer) {
        self.time += TICK_SECONDS;
        let start = self.time;
        let dt = 1.0 / self.sample_rate as f64;

        ring.overwrite_with(|i| composite(start + i as f64 * dt) as f32);
    }
}

fn composite(t: f64) -> f64 {
    let mix: f64 = TONES
        .iter()
        .map(|&(freq, amp)| amp * (TAU * freq * t).sin())
        .sum();
    OUTPUT_SCALE * mix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(a: f32, b: f32, eps: f32) {
        assert!((a - b).abs() <= eps, "{} != {} (eps {})", a, b, eps);
    }

    #[test]
    fn composite_is_bounded() {
        let mut source = SimulationSource::new(44100);
        let mut ring = RingBuffer::new();
        source.fill(&mut ring);

        let samples = ring.latest(ring.capacity());
        assert!(samples.iter().all(|s| s.abs() <= 0.6 + 1e-6));
        assert!(samples.iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn fill_advances_clock_per_tick() {
        let mut source = SimulationSource::new(44100);
        let mut ring = RingBuffer::new();

        source.fill(&mut ring);
        source.fill(&mut ring);
        source.fill(&mut ring);

        assert!((source.time() - 3.0 * TICK_SECONDS).abs() < 1e-12);
    }

    #[test]
    fn oldest_sample_starts_at_tick_time() {
        let mut source = SimulationSource::new(44100);
        let mut ring = RingBuffer::new();
        source.fill(&mut ring);

        let samples = ring.latest(ring.capacity());
        assert_approx(samples[0], composite(TICK_SECONDS) as f32, 1e-6);
        assert_approx(
            samples[100],
            composite(TICK_SECONDS + 100.0 / 44100.0) as f32,
            1e-6,
        );
    }

    #[test]
    fn fill_keeps_write_index() {
        let mut source = SimulationSource::new(48000);
        let mut ring = RingBuffer::new();
        ring.append(&[0.1; 20]);
        let before = ring.write_pos();

        source.fill(&mut ring);

        assert_eq!(ring.write_pos(), before);
    }

    #[test]
    fn same_ticks_give_same_ring() {
        let mut a = SimulationSource::new(44100);
        let mut b = SimulationSource::new(44100);
        let mut ring_a = RingBuffer::new();
        let mut ring_b = RingBuffer::new();

        for _ in 0..5 {
            a.fill(&mut ring_a);
            b.fill(&mut ring_b);
        }

        assert_eq!(ring_a.latest(4096), ring_b.latest(4096));
    }
}
