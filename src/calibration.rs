//! Calibration records stored in the device's SPI flash.
//!
//! The record lives at flash offset 0x20000 (sector 2): 12 bytes of
//! little-endian `{ header, unix timestamp, correction in ppb }`. A
//! header mismatch means no calibration has been written.

use rs_hydra::HydraSdr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

const CALIB_FLASH_OFFSET: u32 = 0x20000;
const CALIB_FLASH_SECTOR: u16 = 2;
const CALIB_HEADER: u32 = 0xCA1B_0001;

/// On-flash calibration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationRecord {
    pub header: u32,
    pub timestamp: u32,
    pub correction_ppb: i32,
}

impl CalibrationRecord {
    pub const SIZE: usize = 12;

    pub fn new(correction_ppb: i32) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            header: CALIB_HEADER,
            timestamp,
            correction_ppb,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.header == CALIB_HEADER
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.header.to_le_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.correction_ppb.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            header: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            timestamp: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            correction_ppb: i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// `-R`: read the calibration record from flash and print it.
pub fn read_calibration() -> Result<()> {
    let dev = HydraSdr::open_first()?;

    println!("[-] Reading calibration from flash (0x{:06x})...", CALIB_FLASH_OFFSET);
    let bytes = dev.spiflash_read(CALIB_FLASH_OFFSET, CalibrationRecord::SIZE)?;
    match CalibrationRecord::from_bytes(&bytes) {
        Some(record) if record.is_valid() => {
            println!("Stored Calibration Data:");
            println!("  Correction: {} ppb", record.correction_ppb);
            println!("  Date:       {} (unix)", record.timestamp);
        }
        Some(record) => {
            println!("No valid calibration found (Header mismatch).");
            println!(
                "Raw Header: 0x{:08X} (Expected 0x{:08X})",
                record.header, CALIB_HEADER
            );
        }
        None => {
            println!("No valid calibration found (short read).");
        }
    }

    Ok(())
}

/// `-W`: erase the calibration sector, write a fresh record, and reset
/// the device so it takes effect.
pub fn write_calibration(correction_ppb: i32) -> Result<()> {
    let dev = HydraSdr::open_first()?;

    println!("[-] Erasing flash sector {} (Calibration area)...", CALIB_FLASH_SECTOR);
    dev.spiflash_erase_sector(CALIB_FLASH_SECTOR)?;

    let record = CalibrationRecord::new(correction_ppb);
    println!(
        "[-] Writing Calibration: {} ppb (Timestamp: {})...",
        correction_ppb, record.timestamp
    );
    dev.spiflash_write(CALIB_FLASH_OFFSET, &record.to_bytes())?;
    println!("[+] Calibration written successfully.");

    println!("[!] Resetting HydraSDR to apply changes...");
    match dev.reset() {
        Ok(()) => println!("[+] Device reset command sent."),
        Err(e) => eprintln!("Warning: Reset command failed: {}. Please replug device.", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_little_endian() {
        let record = CalibrationRecord {
            header: CALIB_HEADER,
            timestamp: 0x0102_0304,
            correction_ppb: -267,
        };
        let bytes = record.to_bytes();

        assert_eq!(&bytes[0..4], &[0x01, 0x00, 0x1B, 0xCA]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &(-267i32).to_le_bytes());
    }

    #[test]
    fn test_record_round_trip() {
        let record = CalibrationRecord::new(1234);
        let parsed = CalibrationRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(record, parsed);
        assert!(parsed.is_valid());
    }

    #[test]
    fn test_header_mismatch_is_invalid() {
        let mut bytes = CalibrationRecord::new(0).to_bytes();
        bytes[3] = 0xFF;
        let parsed = CalibrationRecord::from_bytes(&bytes).unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn test_short_read_rejected() {
        assert_eq!(CalibrationRecord::from_bytes(&[0u8; 8]), None);
    }
}
