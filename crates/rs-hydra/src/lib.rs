//! Pure-Rust driver for the HydraSDR RFOne Software Defined Radio.
//!
//! # Overview
//!
//! `rs-hydra` provides a zero-C dependency Rust interface to the HydraSDR
//! RFOne. It supports device discovery, configuration, SPI-flash access,
//! and high-throughput streaming with a per-transfer callback.
//!
//! The RFOne streams real 12-bit ADC samples; when the sample type is
//! [`SampleType::Float32Iq`] the driver converts them host-side to complex
//! baseband I/Q at half the ADC rate, so a device configured for the
//! 2.5 MSPS native rate delivers 2.5 M complex samples per second.
//!
//! # Example
//!
//! ```no_run
//! use rs_hydra::HydraSdr;
//!
//! let device = HydraSdr::open_first()?;
//! let version = device.version()?;
//! println!("Firmware: {}", version);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use num_complex::Complex;

pub mod error;
pub mod iqconverter;
pub mod transport;

pub use error::{Error, Result};
pub use iqconverter::IqConverter;
pub use transport::HydraSdr;

// HydraSDR RFOne device identifiers (USB VID/PID)
pub const HYDRASDR_VID: u16 = 0x1d50;
pub const HYDRASDR_PID: u16 = 0x60a1;

/// Highest linearity gain preset index accepted by [`HydraSdr::set_linearity_gain`].
pub const LINEARITY_GAIN_MAX: u8 = 21;

/// Sample delivery format selected with [`HydraSdr::set_sample_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleType {
    /// Complex float32 I/Q pairs at half the ADC rate (host-side conversion).
    #[default]
    Float32Iq,
    /// Raw real float32 samples at the full ADC rate.
    Float32Real,
}

/// One batch of samples delivered to the RX callback.
///
/// `samples` is valid only for the duration of the callback invocation.
pub struct Transfer<'a> {
    /// Converted samples for this USB transfer.
    pub samples: &'a [Complex<f32>],
    /// Samples the stream lost since the previous delivered transfer.
    pub dropped_samples: u64,
    /// Format of `samples`.
    pub sample_type: SampleType,
}

/// RX callback. Return 0 to keep streaming; any other value stops the
/// streaming thread after the current transfer.
pub type SampleCallback = Box<dyn FnMut(&Transfer<'_>) -> i32 + Send>;
