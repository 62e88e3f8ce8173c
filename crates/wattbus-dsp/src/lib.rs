//! Sample-processing chain for wattbus instruments
//!
//! Raw ADC words pass through per-range calibration and range-change artifact
//! suppression ([`SampleProcessor`]), polyphase decimation ([`Downsampler`]),
//! and block statistics with wide accumulators ([`StatsEngine`]).

pub mod downsample;
pub mod sample;
pub mod stats;

pub use downsample::{DownsampleMode, Downsampler};
pub use sample::{pack_raw, CalSample, Calibration, SampleProcessor, SuppressMatrix, SuppressMode};
pub use stats::{CalInput, FieldStats, StatisticsBlock, StatsEngine};
