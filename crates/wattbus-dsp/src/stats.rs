//! Block statistics with wide-integer accumulators
//!
//! Samples accumulate in Q31 fixed point: sum-of-x in `i64`, sum-of-x^2 in
//! `i128` via a 64x64 -> 128 multiply, so a full block at 2 Msps loses no
//! precision. Charge and energy continue across blocks as `i128` running
//! sums of the per-block current and power sums.

/// One calibrated input triple
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CalInput {
    pub i: f32,
    pub v: f32,
    pub p: f32,
}

/// Q31 scaling for sample accumulation
const Q31: f64 = (1i64 << 31) as f64;
/// Q62 scaling of the squared-sample domain
const Q62: f64 = Q31 * Q31;

/// Per-field accumulator
#[derive(Clone, Copy, Debug)]
struct FieldAccum {
    x1: i64,
    x2: i128,
    min: f32,
    max: f32,
}

impl FieldAccum {
    fn new() -> Self {
        Self {
            x1: 0,
            x2: 0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    fn add(&mut self, x: f32) {
        let q = (f64::from(x) * Q31) as i64;
        self.x1 += q;
        self.x2 += i128::from(q) * i128::from(q);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    /// Population statistics over `valid` samples.
    fn finish(&self, valid: u32) -> FieldStats {
        if valid == 0 {
            return FieldStats {
                avg: f64::NAN,
                std: f64::NAN,
                min: f32::NAN,
                max: f32::NAN,
            };
        }
        let n = f64::from(valid);
        let x1 = self.x1 as f64;
        let x2 = self.x2 as f64;
        let var = ((x2 - x1 * x1 / n) / n / Q62).max(0.0);
        FieldStats {
            avg: x1 / Q31 / n,
            std: var.sqrt(),
            min: self.min,
            max: self.max,
        }
    }
}

/// Statistics for one field over one block
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldStats {
    pub avg: f64,
    /// Population standard deviation (divide by n, matching the instrument)
    pub std: f64,
    pub min: f32,
    pub max: f32,
}

/// One emitted statistics block
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatisticsBlock {
    pub block_sample_count: u32,
    /// Samples in the block that were not missing
    pub valid_count: u32,
    pub current: FieldStats,
    pub voltage: FieldStats,
    pub power: FieldStats,
    /// Accumulated charge in coulombs since the engine started
    pub charge: f64,
    /// Accumulated energy in joules since the engine started
    pub energy: f64,
    /// Sample id of the first sample in this block
    pub block_sample_id: u64,
    /// Total samples accumulated since the engine started
    pub accum_sample_id: u64,
}

/// Encoded size of a [`StatisticsBlock`]
pub const STATISTICS_BLOCK_SIZE: usize = 112;

impl StatisticsBlock {
    /// Encode to the little-endian broker payload layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATISTICS_BLOCK_SIZE);
        out.extend_from_slice(&self.block_sample_count.to_le_bytes());
        out.extend_from_slice(&self.valid_count.to_le_bytes());
        for f in [&self.current, &self.voltage, &self.power] {
            out.extend_from_slice(&f.avg.to_le_bytes());
            out.extend_from_slice(&f.std.to_le_bytes());
            out.extend_from_slice(&f.min.to_le_bytes());
            out.extend_from_slice(&f.max.to_le_bytes());
        }
        out.extend_from_slice(&self.charge.to_le_bytes());
        out.extend_from_slice(&self.energy.to_le_bytes());
        out.extend_from_slice(&self.block_sample_id.to_le_bytes());
        out.extend_from_slice(&self.accum_sample_id.to_le_bytes());
        out
    }

    /// Decode the broker payload layout.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < STATISTICS_BLOCK_SIZE {
            return None;
        }
        let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(raw[o..o + 8].try_into().unwrap());
        let f32_at = |o: usize| f32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
        let f64_at = |o: usize| f64::from_le_bytes(raw[o..o + 8].try_into().unwrap());
        let field_at = |o: usize| FieldStats {
            avg: f64_at(o),
            std: f64_at(o + 8),
            min: f32_at(o + 16),
            max: f32_at(o + 20),
        };
        Some(Self {
            block_sample_count: u32_at(0),
            valid_count: u32_at(4),
            current: field_at(8),
            voltage: field_at(32),
            power: field_at(56),
            charge: f64_at(80),
            energy: f64_at(88),
            block_sample_id: u64_at(96),
            accum_sample_id: u64_at(104),
        })
    }
}

/// Block statistics engine over the current/voltage/power vector
pub struct StatsEngine {
    block_size: u32,
    sampling_freq: f64,
    current: FieldAccum,
    voltage: FieldAccum,
    power: FieldAccum,
    total: u32,
    valid: u32,
    charge_q31: i128,
    energy_q31: i128,
    block_sample_id: u64,
    accum_sample_id: u64,
}

impl StatsEngine {
    /// Create an engine emitting one block per `block_size` samples at
    /// `sampling_freq` Hz.
    pub fn new(block_size: u32, sampling_freq: f64) -> Self {
        Self {
            block_size: block_size.max(1),
            sampling_freq,
            current: FieldAccum::new(),
            voltage: FieldAccum::new(),
            power: FieldAccum::new(),
            total: 0,
            valid: 0,
            charge_q31: 0,
            energy_q31: 0,
            block_sample_id: 0,
            accum_sample_id: 0,
        }
    }

    /// Restart accumulation at `sample_id` (device reopen or rate change).
    pub fn restart(&mut self, sample_id: u64) {
        self.current = FieldAccum::new();
        self.voltage = FieldAccum::new();
        self.power = FieldAccum::new();
        self.total = 0;
        self.valid = 0;
        self.charge_q31 = 0;
        self.energy_q31 = 0;
        self.block_sample_id = sample_id;
        self.accum_sample_id = 0;
    }

    /// Samples per block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Accept one sample; returns a block when it completes one.
    pub fn add(&mut self, sample: &CalInput) -> Option<StatisticsBlock> {
        self.total += 1;
        if !sample.i.is_nan() && !sample.v.is_nan() && !sample.p.is_nan() {
            self.valid += 1;
            self.current.add(sample.i);
            self.voltage.add(sample.v);
            self.power.add(sample.p);
        }
        if self.total < self.block_size {
            return None;
        }

        self.charge_q31 += i128::from(self.current.x1);
        self.energy_q31 += i128::from(self.power.x1);
        self.accum_sample_id += u64::from(self.total);

        let block = StatisticsBlock {
            block_sample_count: self.block_size,
            valid_count: self.valid,
            current: self.current.finish(self.valid),
            voltage: self.voltage.finish(self.valid),
            power: self.power.finish(self.valid),
            charge: self.charge_q31 as f64 / Q31 / self.sampling_freq,
            energy: self.energy_q31 as f64 / Q31 / self.sampling_freq,
            block_sample_id: self.block_sample_id,
            accum_sample_id: self.accum_sample_id,
        };

        self.block_sample_id += u64::from(self.block_size);
        self.current = FieldAccum::new();
        self.voltage = FieldAccum::new();
        self.power = FieldAccum::new();
        self.total = 0;
        self.valid = 0;
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: f32, v: f32) -> CalInput {
        CalInput { i, v, p: i * v }
    }

    #[test]
    fn test_block_avg_std_min_max() {
        let mut engine = StatsEngine::new(4, 4.0);
        let mut block = None;
        for x in [1.0f32, 2.0, 3.0, 4.0] {
            block = engine.add(&sample(x, 1.0));
        }
        let block = block.expect("block not emitted");
        assert_eq!(block.valid_count, 4);
        assert!((block.current.avg - 2.5).abs() < 1e-6);
        // Population variance: ((1+4+9+16)/4 - 2.5^2) = 1.25.
        assert!((block.current.std - 1.25f64.sqrt()).abs() < 1e-6);
        assert_eq!(block.current.min, 1.0);
        assert_eq!(block.current.max, 4.0);
        assert!((block.voltage.avg - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_population_not_sample_variance() {
        let mut engine = StatsEngine::new(4, 1.0);
        let mut block = None;
        for x in [1.0f32, 2.0, 3.0, 4.0] {
            block = engine.add(&sample(x, 0.0));
        }
        let std = block.unwrap().current.std;
        // Sample variance (n-1) would be 5/3.
        assert!((std * std - 1.25).abs() < 1e-6);
        assert!((std * std - 5.0 / 3.0).abs() > 0.1);
    }

    #[test]
    fn test_charge_energy_accumulate_across_blocks() {
        // fs = 2 Hz, 2-sample blocks: each block spans 1 second.
        let mut engine = StatsEngine::new(2, 2.0);
        let mut blocks = Vec::new();
        for _ in 0..4 {
            if let Some(b) = engine.add(&sample(0.5, 2.0)) {
                blocks.push(b);
            }
        }
        assert_eq!(blocks.len(), 2);
        // 0.5 A sustained: 0.5 C after 1 s, 1.0 C after 2 s.
        assert!((blocks[0].charge - 0.5).abs() < 1e-6);
        assert!((blocks[1].charge - 1.0).abs() < 1e-6);
        // 1 W sustained.
        assert!((blocks[0].energy - 0.5).abs() < 1e-6);
        assert!((blocks[1].energy - 1.0).abs() < 1e-6);
        assert_eq!(blocks[0].block_sample_id, 0);
        assert_eq!(blocks[1].block_sample_id, 2);
        assert_eq!(blocks[1].accum_sample_id, 4);
    }

    #[test]
    fn test_nan_samples_excluded_from_valid() {
        let mut engine = StatsEngine::new(4, 1.0);
        engine.add(&sample(1.0, 1.0));
        engine.add(&CalInput {
            i: f32::NAN,
            v: f32::NAN,
            p: f32::NAN,
        });
        engine.add(&sample(3.0, 1.0));
        let block = engine.add(&sample(2.0, 1.0)).unwrap();
        assert_eq!(block.block_sample_count, 4);
        assert_eq!(block.valid_count, 3);
        assert!((block.current.avg - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_all_missing_block_is_nan() {
        let mut engine = StatsEngine::new(2, 1.0);
        let missing = CalInput {
            i: f32::NAN,
            v: f32::NAN,
            p: f32::NAN,
        };
        engine.add(&missing);
        let block = engine.add(&missing).unwrap();
        assert_eq!(block.valid_count, 0);
        assert!(block.current.avg.is_nan());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut engine = StatsEngine::new(4, 1000.0);
        let mut block = None;
        for x in 0..4 {
            block = engine.add(&sample(x as f32 * 0.25, 5.0));
        }
        let block = block.unwrap();
        let raw = block.encode();
        assert_eq!(raw.len(), STATISTICS_BLOCK_SIZE);
        assert_eq!(StatisticsBlock::decode(&raw).unwrap(), block);
        assert!(StatisticsBlock::decode(&raw[..50]).is_none());
    }
}
