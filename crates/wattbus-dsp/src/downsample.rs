//! Polyphase FIR decimation
//!
//! A [`Downsampler`] is allocated for a specific `(fs_in, fs_out)` pair whose
//! ratio factors into 2s and 5s; each factor becomes one FIR stage. Samples
//! move through the chain as Q30 fixed point in `i64`. The tap tables are
//! Q23, symmetric, and constructed so that each stage has exact unity gain
//! at DC and an exact null at the stage Nyquist; stage output is the tap sum
//! arithmetic-shifted right by 23.
//!
//! A missing sample (`i64::MIN`, or NaN at the float boundary) poisons the
//! output of every stage whose window touches it.

use tracing::debug;
use wattbus_core::error::{Error, Result};

/// Missing-sample sentinel in the fixed-point domain
pub const SAMPLE_MISSING: i64 = i64::MIN;

/// Q30 scaling for float samples
const Q30: f64 = (1i64 << 30) as f64;
/// Tap scale shift
const TAP_SHIFT: u32 = 23;

/// Per-stage ring size; power of two for mask indexing
const RING_SIZE: usize = 128;
const RING_MASK: usize = RING_SIZE - 1;

/// Half tap tables: `[center, t1, t2, ...]`; the full impulse response is
/// symmetric. Each table sums (center + 2·rest) to exactly 1 << 23 and its
/// alternating sum to exactly 0.
const TAPS_BY2: [i64; 3] = [3_145_728, 2_097_152, 524_288];
const TAPS_BY5: [i64; 3] = [2_097_152, 2_097_152, 1_048_576];

/// Decimation strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DownsampleMode {
    /// Block mean; cheap, aliases
    Average,
    /// Chained anti-alias FIR stages
    #[default]
    FlatPassband,
}

struct Stage {
    taps: &'static [i64; 3],
    decimate: u32,
    counter: u32,
    ring: [i64; RING_SIZE],
    head: usize,
}

impl Stage {
    fn new(decimate: u32) -> Self {
        let taps = if decimate == 2 { &TAPS_BY2 } else { &TAPS_BY5 };
        Self {
            taps,
            decimate,
            counter: decimate,
            ring: [0; RING_SIZE],
            head: 0,
        }
    }

    /// Prime the ring so the first windows see a constant signal rather
    /// than zeros.
    fn prime(&mut self, x: i64) {
        self.ring = [x; RING_SIZE];
        self.head = 0;
        self.counter = self.decimate;
    }

    fn add(&mut self, x: i64) -> Option<i64> {
        self.head = (self.head + 1) & RING_MASK;
        self.ring[self.head] = x;
        self.counter -= 1;
        if self.counter > 0 {
            return None;
        }
        self.counter = self.decimate;
        Some(self.fir())
    }

    fn fir(&self) -> i64 {
        let center_idx = self.taps.len() - 1;
        let center = (self.head + RING_SIZE - center_idx) & RING_MASK;
        let c = self.ring[center];
        if c == SAMPLE_MISSING {
            return SAMPLE_MISSING;
        }
        let mut acc = self.taps[0] * c;
        for k in 1..self.taps.len() {
            let right = self.ring[(center + k) & RING_MASK];
            let left = self.ring[(center + RING_SIZE - k) & RING_MASK];
            if right == SAMPLE_MISSING || left == SAMPLE_MISSING {
                return SAMPLE_MISSING;
            }
            acc += self.taps[k] * (right + left);
        }
        acc >> TAP_SHIFT
    }
}

/// FIR decimation chain
pub struct Downsampler {
    fs_in: u32,
    fs_out: u32,
    factor: u32,
    mode: DownsampleMode,
    stages: Vec<Stage>,
    // average-mode state
    avg_acc: i64,
    avg_count: u32,
    avg_poisoned: bool,
    started: bool,
}

impl Downsampler {
    /// Allocate a chain for `fs_in -> fs_out`. Fails unless `fs_out` divides
    /// `fs_in` and the ratio factors into 2s and 5s.
    pub fn new(fs_in: u32, fs_out: u32, mode: DownsampleMode) -> Result<Self> {
        if fs_in == 0 || fs_out == 0 || fs_in % fs_out != 0 {
            return Err(Error::ParameterInvalid(format!(
                "sampling rates {fs_in}/{fs_out}"
            )));
        }
        let factor = fs_in / fs_out;
        let mut stages = Vec::new();
        let mut rem = factor;
        while rem % 2 == 0 {
            stages.push(Stage::new(2));
            rem /= 2;
        }
        while rem % 5 == 0 {
            stages.push(Stage::new(5));
            rem /= 5;
        }
        if rem != 1 {
            return Err(Error::ParameterInvalid(format!(
                "decimation factor {factor} does not factor into 2s and 5s"
            )));
        }
        debug!("downsampler {fs_in} -> {fs_out} Hz, {} stages", stages.len());
        Ok(Self {
            fs_in,
            fs_out,
            factor,
            mode,
            stages,
            avg_acc: 0,
            avg_count: 0,
            avg_poisoned: false,
            started: false,
        })
    }

    /// The integer decimation factor `fs_in / fs_out`.
    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Input rate in Hz.
    pub fn fs_in(&self) -> u32 {
        self.fs_in
    }

    /// Output rate in Hz.
    pub fn fs_out(&self) -> u32 {
        self.fs_out
    }

    /// Reset all chain state; the next accepted sample re-aligns the grid.
    pub fn clear(&mut self) {
        self.started = false;
        self.avg_acc = 0;
        self.avg_count = 0;
        self.avg_poisoned = false;
        for stage in &mut self.stages {
            stage.prime(0);
        }
    }

    /// Add one float sample. NaN marks a missing sample. Produces at most
    /// one output per `factor` inputs; the output is NaN whenever any FIR
    /// window that fed it contained a missing sample.
    pub fn add(&mut self, sample_id: u64, x: f32) -> Option<f32> {
        let q = if x.is_nan() {
            SAMPLE_MISSING
        } else {
            (f64::from(x) * Q30) as i64
        };
        self.add_q30(sample_id, q).map(|out| {
            if out == SAMPLE_MISSING {
                f32::NAN
            } else {
                (out as f64 / Q30) as f32
            }
        })
    }

    /// Add one u8 sample (shift-left-30 into the fixed-point domain).
    pub fn add_u8(&mut self, sample_id: u64, x: u8) -> Option<f32> {
        self.add_q30(sample_id, i64::from(x) << 30).map(|out| {
            if out == SAMPLE_MISSING {
                f32::NAN
            } else {
                (out as f64 / Q30) as f32
            }
        })
    }

    /// Fixed-point entry point used by the float wrappers.
    pub fn add_q30(&mut self, sample_id: u64, q: i64) -> Option<i64> {
        if self.factor == 1 {
            return Some(q);
        }
        if !self.started {
            // First sample must align with the decimation grid.
            if sample_id % u64::from(self.factor) != 0 {
                return None;
            }
            self.started = true;
            for stage in &mut self.stages {
                stage.prime(q);
            }
        }
        match self.mode {
            DownsampleMode::Average => self.add_average(q),
            DownsampleMode::FlatPassband => {
                let mut v = q;
                for stage in &mut self.stages {
                    v = stage.add(v)?;
                }
                Some(v)
            }
        }
    }

    fn add_average(&mut self, q: i64) -> Option<i64> {
        if q == SAMPLE_MISSING {
            self.avg_poisoned = true;
        } else {
            self.avg_acc += q;
        }
        self.avg_count += 1;
        if self.avg_count < self.factor {
            return None;
        }
        let out = if self.avg_poisoned {
            SAMPLE_MISSING
        } else {
            self.avg_acc / i64::from(self.factor)
        };
        self.avg_acc = 0;
        self.avg_count = 0;
        self.avg_poisoned = false;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factoring() {
        assert_eq!(
            Downsampler::new(1_000_000, 200_000, DownsampleMode::FlatPassband)
                .unwrap()
                .factor(),
            5
        );
        assert_eq!(
            Downsampler::new(2_000_000, 100_000, DownsampleMode::FlatPassband)
                .unwrap()
                .factor(),
            20
        );
        assert!(Downsampler::new(1_000_000, 300_000, DownsampleMode::FlatPassband).is_err());
        assert!(Downsampler::new(1_000_000, 0, DownsampleMode::FlatPassband).is_err());
        // 1M / 142857... not a divisor
        assert!(Downsampler::new(1_000_000, 7, DownsampleMode::FlatPassband).is_err());
    }

    #[test]
    fn test_alternating_by5_settles_to_midpoint() {
        // 1 Msps -> 200 ksps, factor 5; 500 alternating samples from an
        // aligned sample id produce exactly 100 outputs of 1.5.
        let mut ds = Downsampler::new(1_000_000, 200_000, DownsampleMode::FlatPassband).unwrap();
        let mut outputs = Vec::new();
        for n in 0..500u64 {
            let x = if n % 2 == 0 { 1.0 } else { 2.0 };
            if let Some(y) = ds.add(1000 + n, x) {
                outputs.push(y);
            }
        }
        assert_eq!(outputs.len(), 100);
        for y in outputs {
            assert!((y - 1.5).abs() < 1e-5, "output {y} not at midpoint");
        }
    }

    #[test]
    fn test_unaligned_leading_samples_discarded() {
        let mut ds = Downsampler::new(1_000_000, 200_000, DownsampleMode::FlatPassband).unwrap();
        // ids 1002..1004 are off-grid; the chain starts at 1005.
        let mut outputs = 0;
        for n in 0..503u64 {
            if ds.add(1002 + n, 1.0).is_some() {
                outputs += 1;
            }
        }
        assert_eq!(outputs, 100);
    }

    #[test]
    fn test_constant_signal_identity() {
        let mut ds = Downsampler::new(1_000_000, 100_000, DownsampleMode::FlatPassband).unwrap();
        assert_eq!(ds.factor(), 10);
        let mut last = None;
        for n in 0..1000u64 {
            if let Some(y) = ds.add(n, 3.25) {
                last = Some(y);
            }
        }
        let y = last.expect("no output");
        assert!((y - 3.25).abs() < 1e-6);
    }

    #[test]
    fn test_at_most_one_output_per_factor() {
        let mut ds = Downsampler::new(1_000_000, 50_000, DownsampleMode::FlatPassband).unwrap();
        let factor = ds.factor() as usize;
        let mut outputs = 0;
        let total = 10 * factor;
        for n in 0..total as u64 {
            if ds.add(n, 0.5).is_some() {
                outputs += 1;
            }
        }
        assert_eq!(outputs, 10);
    }

    #[test]
    fn test_nan_poisons_window() {
        let mut ds = Downsampler::new(1_000_000, 500_000, DownsampleMode::FlatPassband).unwrap();
        let mut outputs = Vec::new();
        for n in 0..40u64 {
            let x = if n == 20 { f32::NAN } else { 1.0 };
            if let Some(y) = ds.add(n, x) {
                outputs.push(y);
            }
        }
        assert_eq!(outputs.len(), 20);
        let poisoned = outputs.iter().filter(|y| y.is_nan()).count();
        // The 5-tap half-band window touches the missing sample from more
        // than one emission point.
        assert!(poisoned >= 1 && poisoned <= 3, "poisoned {poisoned}");
        assert!(outputs.last().unwrap().is_finite());
    }

    #[test]
    fn test_average_mode_block_mean() {
        let mut ds = Downsampler::new(1_000_000, 200_000, DownsampleMode::Average).unwrap();
        let mut outputs = Vec::new();
        for n in 0..20u64 {
            if let Some(y) = ds.add(n, n as f32) {
                outputs.push(y);
            }
        }
        assert_eq!(outputs.len(), 4);
        assert!((outputs[0] - 2.0).abs() < 1e-6); // mean of 0..=4
        assert!((outputs[1] - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_factor_one_passthrough() {
        let mut ds = Downsampler::new(1_000_000, 1_000_000, DownsampleMode::FlatPassband).unwrap();
        assert_eq!(ds.add(3, 2.5), Some(2.5));
    }

    #[test]
    fn test_clear_realigns_grid() {
        let mut ds = Downsampler::new(1_000_000, 500_000, DownsampleMode::FlatPassband).unwrap();
        for n in 0..10u64 {
            ds.add(n, 1.0);
        }
        ds.clear();
        // Off-grid after clear: discarded until an even id arrives.
        assert!(ds.add(3, 1.0).is_none());
        assert!(ds.add(4, 1.0).is_none()); // accepted, mid-block
        let mut emitted = false;
        if ds.add(5, 1.0).is_some() {
            emitted = true;
        }
        assert!(emitted);
    }
}
