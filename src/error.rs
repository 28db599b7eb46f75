//! Error handling for the kalibrate library.
//!
//! One error type covers the whole tool: device and driver failures,
//! buffer allocation, band/argument validation, and the user-visible
//! "no FCCH found" outcome.

use thiserror::Error;

/// A specialized Result type for kalibrate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for kalibrate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Device open or configuration error from the driver.
    #[error("Device error: {0}")]
    Device(#[from] rs_hydra::Error),

    /// Tuning the RF front end failed.
    #[error("Tune failed: {0}")]
    Tune(String),

    /// The sample stream stopped while waiting for data.
    #[error("Fill failed: {0}")]
    Fill(String),

    /// Ring buffer allocation failed.
    #[error("Buffer allocation failed: {0}")]
    BufferAllocation(String),

    /// Invalid command-line arguments.
    #[error("Bad arguments: {0}")]
    BadArguments(String),

    /// Band not usable with this hardware.
    #[error("Unsupported band: {0}")]
    UnsupportedBand(String),

    /// No FCCH burst could be found on the requested channel.
    #[error("No FCCH bursts found")]
    NoFcchFound,

    /// The user requested shutdown (SIGINT).
    #[error("Interrupted")]
    Interrupted,
}
