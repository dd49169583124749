//! Log-spaced spectrum and beat extraction
//!
//! Each band is measured by projecting the Hann-windowed block directly onto
//! the band's center frequency at a coarse stride, instead of running a full
//! FFT and binning it. The renderer only needs a perceptually spaced 64-band
//! spectrum, and 64 strided projections are far cheaper.

use super::{NORMALIZE_THRESHOLD, NUM_BANDS, WINDOW_SIZE};
use std::f32::consts::PI;

/// Lowest band center in Hz
const BASE_FREQUENCY: f32 = 20.0;

/// Bands per octave
const BANDS_PER_OCTAVE: f32 = 8.0;

/// Number of projected samples per band; the stride is `WINDOW_SIZE / this`
const PROJECTION_POINTS: usize = 512;

/// Bands summed into the beat signal
const BEAT_BANDS: usize = 4;

/// Center frequency of band `k` in Hz
pub fn band_frequency(k: usize) -> f32 {
    BASE_FREQUENCY * 2f32.powf(k as f32 / BANDS_PER_OCTAVE)
}

/// Per-band smoothing coefficient; higher bands move more slowly
fn smoothing_factor(k: usize) -> f32 {
    0.2 + 0.6 * k as f32 / NUM_BANDS as f32
}

/// Log compression applied to raw band magnitudes
fn compress(magnitude: f32) -> f32 {
    0.1 * (1.0 + 10000.0 * magnitude).ln()
}

/// Beat signal for a normalized spectrum
pub(crate) fn beat_from_spectrum(spectrum: &[f32]) -> f32 {
    let bass: f32 = spectrum.iter().take(BEAT_BANDS).sum();
    (bass * 2.0).min(1.0)
}

/// Spectral feature extractor
pub struct FeatureExtractor {
    sample_rate: u32,
    step: usize,
    window: Vec<f32>,
    band_freqs: Vec<f32>,

    // Last emitted values per band, before normalization
    smoothed: Vec<f32>,

    // Normalized output
    spectrum: Vec<f32>,
    beat: f32,
}

impl FeatureExtractor {
    /// Create an extractor projecting at `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        // Hann window; computed in f64 so every value is within f32 rounding
        let window: Vec<f32> = (0..WINDOW_SIZE)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * i as f64 / (WINDOW_SIZE - 1) as f64;
                (0.5 * (1.0 - phase.cos())) as f32
            })
            .collect();

        let band_freqs = (0..NUM_BANDS).map(band_frequency).collect();

        Self {
            sample_rate: sample_rate.max(1),
            step: (WINDOW_SIZE / PROJECTION_POINTS).max(1),
            window,
            band_freqs,
            smoothed: vec![0.0; NUM_BANDS],
            spectrum: vec![0.0; NUM_BANDS],
            beat: 0.0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Analysis window length
    pub fn window_size(&self) -> usize {
        WINDOW_SIZE
    }

    pub fn window(&self) -> &[f32] {
        &self.window
    }

    pub fn band_frequencies(&self) -> &[f32] {
        &self.band_freqs
    }

    /// Latest normalized spectrum
    pub fn spectrum(&self) -> &[f32] {
        &self.spectrum
    }

    /// Latest beat signal
    pub fn beat(&self) -> f32 {
        self.beat
    }

    /// Analyze one window of chronological mono samples (oldest first).
    ///
    /// Blocks shorter than the window are ignored and leave the previous
    /// output in place.
    pub fn analyze(&mut self, samples: &[f32]) -> &[f32] {
        if samples.len() < WINDOW_SIZE {
            log::debug!(
                "Skipping analysis of short block ({} < {})",
                samples.len(),
                WINDOW_SIZE
            );
            return &self.spectrum;
        }

        let levels = self.log_magnitudes(&samples[samples.len() - WINDOW_SIZE..]);

        for (k, &level) in levels.iter().enumerate() {
            let alpha = smoothing_factor(k);
            self.smoothed[k] = alpha * self.smoothed[k] + (1.0 - alpha) * level;
        }
        self.spectrum.copy_from_slice(&self.smoothed);

        let max = self.spectrum.iter().copied().fold(0.0f32, f32::max);
        if max > NORMALIZE_THRESHOLD {
            for value in &mut self.spectrum {
                *value = (*value / max).min(1.0);
            }
        }

        self.beat = beat_from_spectrum(&self.spectrum);
        &self.spectrum
    }

    /// Log-compressed band magnitudes of one window, before smoothing
    pub(crate) fn log_magnitudes(&self, samples: &[f32]) -> Vec<f32> {
        let scale = self.step as f32 / WINDOW_SIZE as f32;
        let sample_rate = self.sample_rate as f32;

        self.band_freqs
            .iter()
            .map(|&freq| {
                let omega = -2.0 * PI * freq / sample_rate;
                let mut real = 0.0f32;
                let mut imag = 0.0f32;

                for i in (0..WINDOW_SIZE).step_by(self.step) {
                    let sample = samples[i] * self.window[i];
                    let (sin, cos) = (omega * i as f32).sin_cos();
                    real += sample * cos;
                    imag += sample * sin;
                }

                compress((real * real + imag * imag).sqrt() * scale)
            })
            .collect()
    }

    /// Clear smoothing state and output
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
        self.spectrum.fill(0.0);
        self.beat = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 44100;

    fn assert_approx(actual: f32, expected: f32, tolerance: f32) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected} +/- {tolerance}, got {actual}"
        );
    }

    fn sine(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..WINDOW_SIZE)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0
    }

    fn nearest_band(freq: f32) -> usize {
        (0..NUM_BANDS)
            .min_by(|&a, &b| {
                let da = (band_frequency(a) - freq).abs();
                let db = (band_frequency(b) - freq).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap()
    }

    #[test]
    fn hann_window_matches_closed_form() {
        let extractor = FeatureExtractor::new(SAMPLE_RATE);
        let n = extractor.window_size();

        for (i, &w) in extractor.window().iter().enumerate() {
            let expected =
                0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos());
            assert!(
                (w as f64 - expected).abs() < 1e-6,
                "window[{i}] = {w}, expected {expected}"
            );
        }
        assert_eq!(extractor.window()[0], 0.0);
    }

    #[test]
    fn band_frequencies_are_eight_per_octave_from_20_hz() {
        let extractor = FeatureExtractor::new(SAMPLE_RATE);
        let freqs = extractor.band_frequencies();

        assert_eq!(freqs.len(), NUM_BANDS);
        assert_approx(freqs[0], 20.0, 1e-4);
        assert_approx(freqs[8], 40.0, 1e-3);
        assert_approx(freqs[16], 80.0, 1e-3);
        assert_approx(freqs[63], 20.0 * 2f32.powf(63.0 / 8.0), 1e-2);
    }

    #[test]
    fn analyze_ignores_short_blocks() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let spectrum = extractor.analyze(&vec![0.5; WINDOW_SIZE - 1]).to_vec();

        assert_eq!(spectrum, vec![0.0; NUM_BANDS]);
        assert_eq!(extractor.beat(), 0.0);
    }

    #[test]
    fn silence_produces_zero_spectrum_and_no_beat() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let spectrum = extractor.analyze(&vec![0.0; WINDOW_SIZE]).to_vec();

        assert!(spectrum.iter().all(|&v| v == 0.0));
        assert_eq!(extractor.beat(), 0.0);
    }

    #[test]
    fn pure_tone_peaks_at_nearest_band() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let spectrum = extractor.analyze(&sine(440.0, 1.0)).to_vec();

        let peak = argmax(&spectrum);
        assert_eq!(peak, nearest_band(440.0));
        assert_eq!(spectrum[peak], 1.0);
        assert!(spectrum.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn constant_signal_peaks_at_lowest_band_with_full_beat() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let spectrum = extractor.analyze(&vec![1.0; WINDOW_SIZE]).to_vec();

        assert_eq!(argmax(&spectrum), 0);
        assert_eq!(spectrum[0], 1.0);
        assert_eq!(extractor.beat(), 1.0);
    }

    #[test]
    fn saturated_input_stays_finite_and_normalized() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let clipped: Vec<f32> = sine(440.0, 2.7).iter().map(|s| s.clamp(-1.0, 1.0)).collect();

        for _ in 0..10 {
            extractor.analyze(&clipped);
        }

        let spectrum = extractor.spectrum();
        assert!(spectrum.iter().all(|v| v.is_finite()));
        assert!(spectrum.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(spectrum.iter().copied().fold(0.0f32, f32::max), 1.0);
    }

    #[test]
    fn quiet_signal_is_left_unnormalized() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let spectrum = extractor.analyze(&sine(440.0, 1e-7)).to_vec();

        let max = spectrum.iter().copied().fold(0.0f32, f32::max);
        assert!(max > 0.0);
        assert!(max <= NORMALIZE_THRESHOLD);
    }

    #[test]
    fn first_update_weights_bands_by_smoothing_factor() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let samples = sine(1000.0, 0.5);
        let levels = extractor.log_magnitudes(&samples);

        let spectrum = extractor.analyze(&samples).to_vec();

        let smoothed: Vec<f32> = levels
            .iter()
            .enumerate()
            .map(|(k, &l)| (1.0 - smoothing_factor(k)) * l)
            .collect();
        let max = smoothed.iter().copied().fold(0.0f32, f32::max);
        for (k, (&got, &raw)) in spectrum.iter().zip(&smoothed).enumerate() {
            assert!(
                (got - raw / max).abs() < 1e-5,
                "band {k}: expected {}, got {got}",
                raw / max
            );
        }
    }

    #[test]
    fn smoothing_converges_to_steady_input() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        let samples = sine(440.0, 0.5);
        let levels = extractor.log_magnitudes(&samples);
        let max = levels.iter().copied().fold(0.0f32, f32::max);

        for _ in 0..200 {
            extractor.analyze(&samples);
        }

        for (k, (&got, &level)) in extractor.spectrum().iter().zip(&levels).enumerate() {
            assert!((got - level / max).abs() < 1e-4, "band {k} did not converge");
        }
    }

    #[test]
    fn higher_bands_respond_more_slowly() {
        assert!(smoothing_factor(0) < smoothing_factor(NUM_BANDS - 1));
        assert_approx(smoothing_factor(0), 0.2, 1e-6);
        assert_approx(smoothing_factor(32), 0.5, 1e-6);
    }

    #[test]
    fn beat_sums_four_lowest_bands() {
        let mut spectrum = vec![0.0; NUM_BANDS];
        spectrum[..5].copy_from_slice(&[0.1, 0.05, 0.1, 0.05, 0.9]);
        assert_approx(beat_from_spectrum(&spectrum), 0.6, 1e-6);

        spectrum[0] = 1.0;
        assert_eq!(beat_from_spectrum(&spectrum), 1.0);
    }

    #[test]
    fn reset_clears_output() {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE);
        extractor.analyze(&vec![1.0; WINDOW_SIZE]);

        extractor.reset();

        assert!(extractor.spectrum().iter().all(|&v| v == 0.0));
        assert_eq!(extractor.beat(), 0.0);
    }
}
