//! GSM band definitions and ARFCN to downlink-frequency mapping.
//!
//! Channel spacing is 200 kHz in every band; only the base frequency and
//! the ARFCN numbering differ. All frequencies here are downlink (the
//! BCCH, and therefore FCCH, lives on the downlink).

use std::fmt;
use std::str::FromStr;

const CHAN_SPACING: f64 = 200e3;

/// GSM frequency band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Gsm850,
    GsmR,
    Gsm900,
    Egsm,
    Dcs,
    Pcs,
}

impl FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GSM850" => Ok(Band::Gsm850),
            "GSM-R" | "GSMR" => Ok(Band::GsmR),
            "GSM900" => Ok(Band::Gsm900),
            "EGSM" => Ok(Band::Egsm),
            "DCS" | "DCS1800" | "DCS-1800" => Ok(Band::Dcs),
            "PCS" | "PCS1900" | "PCS-1900" => Ok(Band::Pcs),
            _ => Err(format!("bad band indicator: ``{}''", s)),
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Band::Gsm850 => "GSM-850",
            Band::GsmR => "GSM-R",
            Band::Gsm900 => "GSM-900",
            Band::Egsm => "E-GSM-900",
            Band::Dcs => "DCS-1800",
            Band::Pcs => "PCS-1900",
        };
        f.write_str(name)
    }
}

impl Band {
    /// ARFCN ranges belonging to this band, in scan order.
    fn ranges(self) -> &'static [(u16, u16)] {
        match self {
            Band::Gsm850 => &[(128, 251)],
            Band::GsmR => &[(955, 1023)],
            Band::Gsm900 => &[(1, 124)],
            Band::Egsm => &[(0, 124), (975, 1023)],
            Band::Dcs => &[(512, 885)],
            Band::Pcs => &[(512, 810)],
        }
    }

    /// Iterate this band's ARFCNs in ascending scan order.
    pub fn channels(self) -> impl Iterator<Item = u16> {
        self.ranges()
            .iter()
            .flat_map(|&(first, last)| first..=last)
    }

    /// True if `chan` belongs to this band.
    pub fn contains(self, chan: u16) -> bool {
        self.ranges()
            .iter()
            .any(|&(first, last)| (first..=last).contains(&chan))
    }
}

/// Downlink carrier frequency of `chan` in `band`, in Hz.
pub fn arfcn_to_freq(band: Band, chan: u16) -> Option<f64> {
    if !band.contains(chan) {
        return None;
    }
    let n = chan as f64;
    let freq = match band {
        Band::Gsm850 => 869.2e6 + (n - 128.0) * CHAN_SPACING,
        Band::GsmR => 935e6 + (n - 1024.0) * CHAN_SPACING,
        Band::Gsm900 => 935e6 + n * CHAN_SPACING,
        Band::Egsm => {
            if chan <= 124 {
                935e6 + n * CHAN_SPACING
            } else {
                935e6 + (n - 1024.0) * CHAN_SPACING
            }
        }
        Band::Dcs => 1805.2e6 + (n - 512.0) * CHAN_SPACING,
        Band::Pcs => 1930.2e6 + (n - 512.0) * CHAN_SPACING,
    };
    Some(freq)
}

/// ARFCN whose downlink carrier is closest to `freq` within half a
/// channel spacing, searched inside `band`.
pub fn freq_to_arfcn(band: Band, freq: f64) -> Option<u16> {
    band.channels().find(|&chan| {
        let f = arfcn_to_freq(band, chan).unwrap_or(f64::MAX);
        (f - freq).abs() < CHAN_SPACING / 2.0
    })
}

/// Infer the band a downlink frequency belongs to. Where downlink
/// ranges overlap (GSM900 sits inside EGSM), the narrower common band
/// wins.
pub fn band_for_freq(freq: f64) -> Option<Band> {
    [
        Band::Gsm900,
        Band::Egsm,
        Band::GsmR,
        Band::Gsm850,
        Band::Dcs,
        Band::Pcs,
    ]
    .into_iter()
    .find(|&band| freq_to_arfcn(band, freq).is_some())
}

/// Infer the band of a bare channel number. Ranges overlap between DCS
/// and PCS and between GSM-R/EGSM extensions; the common European
/// interpretation wins.
pub fn band_for_chan(chan: u16) -> Option<Band> {
    if Band::Gsm900.contains(chan) {
        Some(Band::Gsm900)
    } else if Band::Gsm850.contains(chan) {
        Some(Band::Gsm850)
    } else if Band::Dcs.contains(chan) {
        Some(Band::Dcs)
    } else if Band::Egsm.contains(chan) {
        Some(Band::Egsm)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_known_downlink_frequencies() {
        assert_relative_eq!(arfcn_to_freq(Band::Gsm900, 1).unwrap(), 935.2e6);
        assert_relative_eq!(arfcn_to_freq(Band::Gsm900, 124).unwrap(), 959.8e6);
        assert_relative_eq!(arfcn_to_freq(Band::Gsm850, 128).unwrap(), 869.2e6);
        assert_relative_eq!(arfcn_to_freq(Band::Dcs, 512).unwrap(), 1805.2e6);
        assert_relative_eq!(arfcn_to_freq(Band::Pcs, 512).unwrap(), 1930.2e6);
        // EGSM extension wraps below the GSM900 base.
        assert_relative_eq!(arfcn_to_freq(Band::Egsm, 975).unwrap(), 925.2e6);
        assert_relative_eq!(arfcn_to_freq(Band::Egsm, 0).unwrap(), 935.0e6);
        assert_relative_eq!(arfcn_to_freq(Band::GsmR, 955).unwrap(), 921.2e6);
    }

    #[test]
    fn test_out_of_band_channel_rejected() {
        assert_eq!(arfcn_to_freq(Band::Gsm900, 125), None);
        assert_eq!(arfcn_to_freq(Band::Gsm850, 0), None);
        assert_eq!(arfcn_to_freq(Band::Dcs, 886), None);
    }

    #[test]
    fn test_channel_iteration() {
        assert_eq!(Band::Gsm900.channels().count(), 124);
        assert_eq!(Band::Gsm850.channels().count(), 124);
        assert_eq!(Band::Egsm.channels().count(), 125 + 49);
        assert_eq!(Band::Dcs.channels().count(), 374);

        // EGSM scans the base range before the extension.
        let chans: Vec<u16> = Band::Egsm.channels().collect();
        assert_eq!(chans[0], 0);
        assert_eq!(chans[125], 975);
    }

    #[test]
    fn test_freq_to_arfcn_round_trip() {
        for band in [Band::Gsm900, Band::Gsm850, Band::Egsm, Band::Dcs] {
            for chan in band.channels().step_by(17) {
                let freq = arfcn_to_freq(band, chan).unwrap();
                assert_eq!(freq_to_arfcn(band, freq), Some(chan), "{} {}", band, chan);
            }
        }
    }

    #[test]
    fn test_band_inference() {
        assert_eq!(band_for_chan(17), Some(Band::Gsm900));
        assert_eq!(band_for_chan(200), Some(Band::Gsm850));
        assert_eq!(band_for_chan(700), Some(Band::Dcs));
        assert_eq!(band_for_chan(1000), Some(Band::Egsm));
        assert_eq!(band_for_chan(300), None);
    }

    #[test]
    fn test_band_for_freq() {
        assert_eq!(band_for_freq(935.2e6), Some(Band::Gsm900));
        assert_eq!(band_for_freq(925.2e6), Some(Band::Egsm));
        assert_eq!(band_for_freq(869.2e6), Some(Band::Gsm850));
        assert_eq!(band_for_freq(1805.2e6), Some(Band::Dcs));
        assert_eq!(band_for_freq(100e6), None);
    }

    #[test]
    fn test_band_parsing() {
        assert_eq!("GSM900".parse::<Band>().unwrap(), Band::Gsm900);
        assert_eq!("gsm-r".parse::<Band>().unwrap(), Band::GsmR);
        assert_eq!("EGSM".parse::<Band>().unwrap(), Band::Egsm);
        assert!("UMTS".parse::<Band>().is_err());
    }
}
