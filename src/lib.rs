#![doc = include_str!("../readme.md")]

pub mod arfcn;
pub mod benchmark;
pub mod calibration;
pub mod dsp;
pub mod error;
pub mod exit;
pub mod offset;
pub mod ring;
pub mod scan;
pub mod source;

pub use error::{Error, Result};

/// GSM symbol rate in Hz: 1625000/6 = 270833.333...
pub const GSM_RATE: f64 = 1_625_000.0 / 6.0;

/// Largest FCCH offset accepted as a plausible clock error (Hz).
pub const FCCH_OFFSET_MAX: f32 = 40e3;
