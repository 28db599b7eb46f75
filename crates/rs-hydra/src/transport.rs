//! USB transport layer for HydraSDR RFOne devices.

use crate::error::{Error, Result};
use crate::iqconverter::IqConverter;
use crate::{SampleCallback, SampleType, Transfer, HYDRASDR_PID, HYDRASDR_VID};
use num_complex::Complex;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default timeout for USB control transfers (milliseconds).
const USB_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for one bulk read on the sample endpoint.
const BULK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bulk IN endpoint carrying ADC samples.
const SAMPLE_ENDPOINT: u8 = 0x81;

/// Bytes per bulk transfer: 128K real samples.
const TRANSFER_BYTES: usize = 262144;

// HydraSDR vendor command codes
const HYDRASDR_RECEIVER_MODE: u8 = 1;
const HYDRASDR_SPIFLASH_WRITE: u8 = 7;
const HYDRASDR_SPIFLASH_READ: u8 = 8;
const HYDRASDR_BOARD_ID_READ: u8 = 9;
const HYDRASDR_VERSION_STRING_READ: u8 = 10;
const HYDRASDR_SET_SAMPLERATE: u8 = 12;
const HYDRASDR_SET_FREQ: u8 = 13;
const HYDRASDR_SET_LNA_GAIN: u8 = 14;
const HYDRASDR_SET_MIXER_GAIN: u8 = 15;
const HYDRASDR_SET_VGA_GAIN: u8 = 16;
const HYDRASDR_SET_LNA_AGC: u8 = 17;
const HYDRASDR_SET_MIXER_AGC: u8 = 18;
const HYDRASDR_GET_SAMPLERATES: u8 = 25;
const HYDRASDR_SPIFLASH_ERASE_SECTOR: u8 = 27;
const HYDRASDR_RESET: u8 = 28;

/// SPI flash transfers are chunked to the device's page granularity.
const SPIFLASH_CHUNK: usize = 256;

// Linearity gain presets, indexed by 21 - gain. Each preset programs the
// VGA, mixer, and LNA stages together so the front end stays in its
// linear region as overall gain rises.
const LINEARITY_VGA: [u8; 22] = [
    13, 12, 11, 11, 11, 11, 11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 9, 8, 7, 6, 5, 4,
];
const LINEARITY_MIXER: [u8; 22] = [
    12, 12, 11, 9, 8, 7, 6, 6, 5, 0, 0, 1, 0, 0, 2, 2, 1, 1, 1, 1, 0, 0,
];
const LINEARITY_LNA: [u8; 22] = [
    14, 14, 14, 13, 12, 10, 9, 9, 8, 9, 8, 6, 5, 3, 1, 0, 0, 0, 0, 0, 0, 0,
];

/// HydraSDR RFOne device handle.
pub struct HydraSdr {
    handle: Arc<DeviceHandle<Context>>,
    sample_type: Mutex<SampleType>,
    streaming: Arc<AtomicBool>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl HydraSdr {
    /// Open the first available HydraSDR device.
    pub fn open_first() -> Result<Self> {
        let context = Context::new()?;
        let devices = context.devices()?;

        for device in devices.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() == HYDRASDR_VID && desc.product_id() == HYDRASDR_PID {
                return Self::open_device(&device);
            }
        }

        Err(Error::DeviceNotFound)
    }

    /// Open a specific HydraSDR device by enumeration index.
    pub fn open_by_index(index: usize) -> Result<Self> {
        let context = Context::new()?;
        let devices = context.devices()?;

        let mut count = 0;
        for device in devices.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() == HYDRASDR_VID && desc.product_id() == HYDRASDR_PID {
                if count == index {
                    return Self::open_device(&device);
                }
                count += 1;
            }
        }

        Err(Error::DeviceNotFound)
    }

    /// Open a device handle.
    ///
    /// Follows the same initialization sequence as the vendor library:
    /// open, detach kernel driver (Linux), set configuration 1, claim
    /// interface 0.
    fn open_device(device: &Device<Context>) -> Result<Self> {
        let handle = device.open()?;

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                tracing::debug!("Detaching kernel driver from interface 0");
                if let Err(e) = handle.detach_kernel_driver(0) {
                    tracing::warn!("Failed to detach kernel driver: {}", e);
                }
            }
        }

        if let Err(e) = handle.set_active_configuration(1) {
            tracing::debug!("Failed to set configuration (may already be set): {}", e);
        }

        handle.claim_interface(0)?;

        Ok(HydraSdr {
            handle: Arc::new(handle),
            sample_type: Mutex::new(SampleType::default()),
            streaming: Arc::new(AtomicBool::new(false)),
            rx_thread: Mutex::new(None),
        })
    }

    /// Get the firmware version string.
    pub fn version(&self) -> Result<String> {
        let mut buffer = vec![0u8; 128];
        let n = self.control_in(HYDRASDR_VERSION_STRING_READ, 0, 0, &mut buffer)?;
        if n == 0 {
            return Err(Error::InvalidResponse("Version response empty".to_string()));
        }
        Ok(String::from_utf8_lossy(&buffer[..n])
            .trim_end_matches('\0')
            .to_string())
    }

    /// Get the numeric board identifier.
    pub fn board_id(&self) -> Result<u32> {
        let mut buffer = [0u8; 4];
        let n = self.control_in(HYDRASDR_BOARD_ID_READ, 0, 0, &mut buffer)?;
        if n < 1 {
            return Err(Error::InvalidResponse("Board ID response empty".to_string()));
        }
        Ok(buffer[0] as u32)
    }

    /// Select the delivery format for streamed samples.
    ///
    /// This is a host-side setting: it chooses how the RX thread converts
    /// the raw ADC stream before invoking the callback.
    pub fn set_sample_type(&self, sample_type: SampleType) -> Result<()> {
        if self.streaming.load(Ordering::Acquire) {
            return Err(Error::ConfigFailed(
                "cannot change sample type while streaming".to_string(),
            ));
        }
        *self.sample_type.lock().unwrap() = sample_type;
        Ok(())
    }

    /// Query the ADC rates the device advertises, in Hz.
    pub fn supported_sample_rates(&self) -> Result<Vec<u32>> {
        // First call returns the count, second call (wIndex = count) the list.
        let mut count_buf = [0u8; 4];
        let n = self.control_in(HYDRASDR_GET_SAMPLERATES, 0, 0, &mut count_buf)?;
        if n < 4 {
            return Err(Error::InvalidResponse(
                "Sample rate count response short".to_string(),
            ));
        }
        let count = u32::from_le_bytes(count_buf) as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > 16 {
            return Err(Error::InvalidResponse(format!(
                "Sample rate count too large: {}",
                count
            )));
        }

        let mut rates_buf = vec![0u8; count * 4];
        let n = self.control_in(HYDRASDR_GET_SAMPLERATES, 0, count as u16, &mut rates_buf)?;
        if n < rates_buf.len() {
            return Err(Error::InvalidResponse(format!(
                "Sample rate list short: {} of {} bytes",
                n,
                rates_buf.len()
            )));
        }

        Ok(rates_buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Configure the device for the given output rate in Hz.
    ///
    /// The rate must be one of the advertised rates; it is translated to
    /// the device's rate-table index.
    pub fn set_samplerate(&self, rate_hz: u32) -> Result<()> {
        let rates = self.supported_sample_rates()?;
        let index = rates
            .iter()
            .position(|&r| r == rate_hz)
            .ok_or_else(|| {
                Error::ConfigFailed(format!(
                    "unsupported sample rate {} Hz (device offers {:?})",
                    rate_hz, rates
                ))
            })?;

        let mut ack = [0u8; 1];
        self.control_in(HYDRASDR_SET_SAMPLERATE, 0, index as u16, &mut ack)?;
        Ok(())
    }

    /// Tune the RF front end, frequency in Hz.
    pub fn set_freq(&self, freq_hz: u64) -> Result<()> {
        let payload = freq_hz.to_le_bytes();
        self.control_out(HYDRASDR_SET_FREQ, 0, 0, &payload)?;
        Ok(())
    }

    /// Apply a linearity gain preset, index 0 (lowest) to 21 (highest).
    ///
    /// Values above 21 are clamped. Presets program the VGA, mixer, and
    /// LNA stages and disable both AGC loops.
    pub fn set_linearity_gain(&self, value: u8) -> Result<()> {
        let value = value.min(crate::LINEARITY_GAIN_MAX);
        let idx = (crate::LINEARITY_GAIN_MAX - value) as usize;

        self.control_out(HYDRASDR_SET_LNA_AGC, 0, 0, &[0])?;
        self.control_out(HYDRASDR_SET_MIXER_AGC, 0, 0, &[0])?;
        self.control_out(HYDRASDR_SET_VGA_GAIN, 0, LINEARITY_VGA[idx] as u16, &[0])?;
        self.control_out(HYDRASDR_SET_MIXER_GAIN, 0, LINEARITY_MIXER[idx] as u16, &[0])?;
        self.control_out(HYDRASDR_SET_LNA_GAIN, 0, LINEARITY_LNA[idx] as u16, &[0])?;
        Ok(())
    }

    /// Issue a device reset. The device re-enumerates afterwards.
    pub fn reset(&self) -> Result<()> {
        self.control_out(HYDRASDR_RESET, 0, 0, &[])?;
        Ok(())
    }

    /// Erase one 64 KiB sector of the SPI flash.
    pub fn spiflash_erase_sector(&self, sector: u16) -> Result<()> {
        let mut ack = [0u8; 1];
        self.control_in(HYDRASDR_SPIFLASH_ERASE_SECTOR, 0, sector, &mut ack)
            .map_err(|e| Error::FlashFailed(format!("erase sector {}: {}", sector, e)))?;
        Ok(())
    }

    /// Read `len` bytes from the SPI flash starting at `addr`.
    pub fn spiflash_read(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        for (i, chunk) in out.chunks_mut(SPIFLASH_CHUNK).enumerate() {
            let offset = addr + (i * SPIFLASH_CHUNK) as u32;
            let n = self
                .control_in(
                    HYDRASDR_SPIFLASH_READ,
                    (offset >> 16) as u16,
                    (offset & 0xFFFF) as u16,
                    chunk,
                )
                .map_err(|e| Error::FlashFailed(format!("read @0x{:06x}: {}", offset, e)))?;
            if n < chunk.len() {
                return Err(Error::FlashFailed(format!(
                    "short read @0x{:06x}: {} of {} bytes",
                    offset,
                    n,
                    chunk.len()
                )));
            }
        }
        Ok(out)
    }

    /// Write bytes to the SPI flash starting at `addr`. The target area
    /// must have been erased first.
    pub fn spiflash_write(&self, addr: u32, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(SPIFLASH_CHUNK).enumerate() {
            let offset = addr + (i * SPIFLASH_CHUNK) as u32;
            self.control_out(
                HYDRASDR_SPIFLASH_WRITE,
                (offset >> 16) as u16,
                (offset & 0xFFFF) as u16,
                chunk,
            )
            .map_err(|e| Error::FlashFailed(format!("write @0x{:06x}: {}", offset, e)))?;
        }
        Ok(())
    }

    /// Start streaming. The callback runs on a dedicated RX thread for
    /// every bulk transfer until it returns non-zero or [`stop_rx`] is
    /// called.
    ///
    /// [`stop_rx`]: HydraSdr::stop_rx
    pub fn start_rx(&self, mut callback: SampleCallback) -> Result<()> {
        if self.streaming.swap(true, Ordering::AcqRel) {
            return Err(Error::StreamingError("already streaming".to_string()));
        }

        let mut ack = [0u8; 1];
        if let Err(e) = self.control_in(HYDRASDR_RECEIVER_MODE, 1, 0, &mut ack) {
            self.streaming.store(false, Ordering::Release);
            return Err(e);
        }

        let handle = Arc::clone(&self.handle);
        let streaming = Arc::clone(&self.streaming);
        let sample_type = *self.sample_type.lock().unwrap();

        let thread = std::thread::spawn(move || {
            let mut raw = vec![0u8; TRANSFER_BYTES];
            let mut floats = vec![0.0f32; TRANSFER_BYTES / 2];
            let mut converter = IqConverter::new();
            let mut pending_dropped: u64 = 0;

            while streaming.load(Ordering::Acquire) {
                match handle.read_bulk(SAMPLE_ENDPOINT, &mut raw, BULK_TIMEOUT) {
                    Ok(bytes) => {
                        if bytes == 0 {
                            continue;
                        }
                        let count = bytes / 2;
                        for (i, chunk) in raw[..count * 2].chunks_exact(2).enumerate() {
                            let v = u16::from_le_bytes([chunk[0], chunk[1]]);
                            floats[i] = (v as f32 - 2048.0) / 2048.0;
                        }

                        let samples: Vec<Complex<f32>> = match sample_type {
                            SampleType::Float32Iq => {
                                converter.process_to_complex(&mut floats[..count])
                            }
                            SampleType::Float32Real => floats[..count]
                                .iter()
                                .map(|&re| Complex::new(re, 0.0))
                                .collect(),
                        };

                        let transfer = Transfer {
                            samples: &samples,
                            dropped_samples: pending_dropped,
                            sample_type,
                        };
                        pending_dropped = 0;

                        if callback(&transfer) != 0 {
                            break;
                        }
                    }
                    Err(rusb::Error::Timeout) => continue,
                    Err(rusb::Error::Overflow) => {
                        // The pipe lost a transfer's worth of samples;
                        // charge them to the next delivered transfer.
                        pending_dropped += (TRANSFER_BYTES / 2) as u64;
                    }
                    Err(e) => {
                        tracing::error!("Bulk read failed, stopping RX: {}", e);
                        break;
                    }
                }
            }
        });

        *self.rx_thread.lock().unwrap() = Some(thread);
        Ok(())
    }

    /// Stop streaming and join the RX thread.
    pub fn stop_rx(&self) -> Result<()> {
        self.streaming.store(false, Ordering::Release);
        if let Some(thread) = self.rx_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        let mut ack = [0u8; 1];
        self.control_in(HYDRASDR_RECEIVER_MODE, 0, 0, &mut ack)?;
        Ok(())
    }

    /// Perform a vendor control IN transfer (0xC0).
    fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        self.handle
            .read_control(0xC0, request, value, index, buf, USB_TIMEOUT)
            .map_err(|e| {
                tracing::debug!(
                    "Control IN failed: req={}, val={}, idx={}, error={}",
                    request,
                    value,
                    index,
                    e
                );
                Error::ControlTransferFailed(e.to_string())
            })
    }

    /// Perform a vendor control OUT transfer (0x40).
    fn control_out(&self, request: u8, value: u16, index: u16, buf: &[u8]) -> Result<usize> {
        self.handle
            .write_control(0x40, request, value, index, buf, USB_TIMEOUT)
            .map_err(|e| {
                tracing::debug!(
                    "Control OUT failed: req={}, val={}, idx={}, error={}",
                    request,
                    value,
                    index,
                    e
                );
                Error::ControlTransferFailed(e.to_string())
            })
    }
}

impl Drop for HydraSdr {
    fn drop(&mut self) {
        // Stop the RX thread before the handle goes away, then release
        // the interface so the next open starts clean.
        self.streaming.store(false, Ordering::Release);
        if let Some(thread) = self.rx_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        if let Err(e) = self.handle.release_interface(0) {
            tracing::debug!("Failed to release USB interface: {}", e);
        }
    }
}
