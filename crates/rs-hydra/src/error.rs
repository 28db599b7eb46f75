//! Error types for rs-hydra operations.

use thiserror::Error;

/// Result type for rs-hydra operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during HydraSDR operations.
#[derive(Debug, Error)]
pub enum Error {
    /// USB operation failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No HydraSDR device found.
    #[error("No HydraSDR device found")]
    DeviceNotFound,

    /// Device configuration failed.
    #[error("Configuration failed: {0}")]
    ConfigFailed(String),

    /// Control transfer failed.
    #[error("Control transfer failed: {0}")]
    ControlTransferFailed(String),

    /// Invalid response from device.
    #[error("Invalid device response: {0}")]
    InvalidResponse(String),

    /// Streaming/bulk transfer error.
    #[error("Streaming error: {0}")]
    StreamingError(String),

    /// SPI flash operation failed.
    #[error("Flash operation failed: {0}")]
    FlashFailed(String),
}
