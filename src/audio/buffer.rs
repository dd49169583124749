//! Fixed-size mono sample ring fed by the active audio source

use super::{INPUT_GAIN, RING_CAPACITY};

/// Level statistics for one appended block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockLevel {
    /// Sum of |sample| over the block, after gain and clamping
    pub abs_sum: f32,

    /// Number of mono samples written
    pub count: usize,

    /// Largest |sample| of the folded block before gain
    pub raw_peak: f32,
}

impl BlockLevel {
    /// Mean absolute sample of the block, `None` for an empty block
    pub fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| self.abs_sum / self.count as f32)
    }
}

/// Circular mono buffer
///
/// Not synchronized on its own; the engine keeps it behind its single mutex.
pub struct RingBuffer {
    samples: Vec<f32>,
    write_pos: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Index of the slot the next sample will be written to
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Fold interleaved stereo pairs to mono, apply gain and clamp, and append.
    ///
    /// A trailing unpaired sample is ignored.
    pub fn append(&mut self, interleaved: &[f32]) -> BlockLevel {
        let mut level = BlockLevel::default();
        let capacity = self.samples.len();

        for frame in interleaved.chunks_exact(2) {
            let mono = (frame[0] + frame[1]) * 0.5;
            level.raw_peak = level.raw_peak.max(mono.abs());

            let sample = fold_gain(mono);
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % capacity;

            level.abs_sum += sample.abs();
            level.count += 1;
        }

        level
    }

    /// Overwrite the whole ring in chronological order starting at the write
    /// index, leaving the index where it is.
    ///
    /// `sample_at(0)` becomes the oldest sample and `sample_at(capacity - 1)`
    /// the newest.
    pub fn overwrite_with(&mut self, mut sample_at: impl FnMut(usize) -> f32) {
        let capacity = self.samples.len();
        for i in 0..capacity {
            let idx = (self.write_pos + i) % capacity;
            self.samples[idx] = sample_at(i);
        }
    }

    /// Copy the most recent `out.len()` samples into `out`, oldest first.
    ///
    /// Returns the write index the snapshot ends at. Requests longer than the
    /// ring are filled from the oldest available sample and zero-padded at the
    /// front.
    pub fn snapshot_into(&self, out: &mut [f32]) -> usize {
        let capacity = self.samples.len();
        let count = out.len().min(capacity);
        let pad = out.len() - count;
        out[..pad].fill(0.0);

        let start = (self.write_pos + capacity - count) % capacity;
        for (i, slot) in out[pad..].iter_mut().enumerate() {
            *slot = self.samples[(start + i) % capacity];
        }

        self.write_pos
    }

    /// Convenience wrapper around [`snapshot_into`](Self::snapshot_into)
    pub fn latest(&self, count: usize) -> Vec<f32> {
        let mut out = vec![0.0; count];
        self.snapshot_into(&mut out);
        out
    }

    /// Zero every slot and rewind the write index
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.write_pos = 0;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Gain and hard clamp applied to every folded mono sample.
///
/// NaN reads as full scale so it never reaches the ring or the level sums.
fn fold_gain(mono: f32) -> f32 {
    if mono.is_nan() {
        return 1.0;
    }
    (mono * INPUT_GAIN).clamp(-1.0, 1.0)
}
