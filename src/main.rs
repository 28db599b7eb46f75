//! kal: GSM base station scanner and clock-offset calibration tool for
//! the HydraSDR RFOne.
//!
//! # Usage examples
//!
//! ```bash
//! # Scan the GSM900 band for base stations
//! kal -s GSM900
//!
//! # Clock offset against channel 17, showing the spectrum
//! kal -c 17 -b GSM900 -A
//!
//! # Clock offset against an explicit frequency, gain preset 12
//! kal -f 935.2e6 -g 12
//!
//! # Device maintenance: read / write the calibration record
//! kal -R
//! kal -W -267
//!
//! # DSP benchmark, no hardware needed
//! kal -B
//! ```

use clap::{ArgAction, Parser};
use std::process::ExitCode;

use kalibrate::arfcn::{arfcn_to_freq, band_for_chan, band_for_freq, freq_to_arfcn, Band};
use kalibrate::benchmark::run_dsp_benchmark;
use kalibrate::calibration::{read_calibration, write_calibration};
use kalibrate::error::{Error, Result};
use kalibrate::offset::offset_detect;
use kalibrate::scan::c0_detect;
use kalibrate::source::HydraSdrSource;
use kalibrate::{exit, GSM_RATE};

#[derive(Parser, Debug)]
#[command(
    name = "kal",
    version,
    about = "GSM base station scan and clock offset calibration for the HydraSDR RFOne",
    after_help = "Modes are mutually exclusive: scan (-s), offset (-f or -c), \
calibration (-R / -W), benchmark (-B)."
)]
struct Args {
    /// Band to scan (GSM850, GSM-R, GSM900, EGSM, DCS)
    #[arg(short = 's', value_name = "BAND")]
    scan_band: Option<Band>,

    /// Frequency of nearby GSM base station, in Hz
    #[arg(short = 'f', value_name = "HZ")]
    freq: Option<f64>,

    /// Channel of nearby GSM base station
    #[arg(short = 'c', value_name = "CHAN")]
    chan: Option<u16>,

    /// Band indicator, used with -c / -f
    #[arg(short = 'b', value_name = "BAND")]
    band: Option<Band>,

    /// Linearity gain index (0-21)
    #[arg(short = 'g', value_name = "GAIN", default_value_t = 10.0)]
    gain: f32,

    /// Read calibration data from device flash
    #[arg(short = 'R')]
    read_cal: bool,

    /// Write calibration data (int32 PPB) to flash and reset the device
    #[arg(short = 'W', value_name = "PPB", allow_hyphen_values = true)]
    write_cal: Option<i32>,

    /// Show ASCII FFT of accepted channels
    #[arg(short = 'A')]
    show_fft: bool,

    /// Run the DSP benchmark and exit
    #[arg(short = 'B')]
    benchmark: bool,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Enable debug messages
    #[arg(short = 'D')]
    debug: bool,
}

/// The RFOne front end tops out around 1.8 GHz: PCS-1900 is out of
/// reach and DCS-1800 sits right at the edge.
fn check_band_limit(band: Band) -> Result<()> {
    match band {
        Band::Pcs => {
            eprintln!("Error: PCS-1900 band (~1.9 GHz) is not supported by HydraSDR RFOne.");
            eprintln!("       Hardware frequency limit is approx 1800 MHz.");
            Err(Error::UnsupportedBand("PCS-1900".to_string()))
        }
        Band::Dcs => {
            eprintln!("Warning: DCS-1800 band (~1.8 GHz) is at the edge of HydraSDR RFOne capabilities.");
            eprintln!("         Reception may degrade or fail above 1800 MHz.");
            Ok(())
        }
        _ => Ok(()),
    }
}

fn run(args: Args) -> Result<()> {
    if args.benchmark {
        return run_dsp_benchmark();
    }

    if args.read_cal && args.write_cal.is_some() {
        return Err(Error::BadArguments(
            "cannot read (-R) and write (-W) at the same time".to_string(),
        ));
    }
    if args.read_cal {
        return read_calibration();
    }
    if let Some(ppb) = args.write_cal {
        return write_calibration(ppb);
    }

    if let Some(band) = args.scan_band {
        check_band_limit(band)?;

        let mut source = HydraSdrSource::new(args.gain);
        source.open()?;

        eprintln!("kal: Scanning for {} base stations.", band);
        return c0_detect(&mut source, band, args.show_fft);
    }

    // Offset mode: resolve frequency, channel, and band from whichever
    // of -f / -c / -b were given.
    let (freq, chan, band) = match (args.freq, args.chan) {
        (Some(freq), chan) => {
            let band = args.band.or_else(|| band_for_freq(freq));
            let chan = chan.or_else(|| band.and_then(|b| freq_to_arfcn(b, freq)));
            (freq, chan, band)
        }
        (None, Some(chan)) => {
            let band = args
                .band
                .or_else(|| band_for_chan(chan))
                .ok_or_else(|| {
                    Error::BadArguments(format!("cannot infer band of channel {}", chan))
                })?;
            let freq = arfcn_to_freq(band, chan).ok_or_else(|| {
                Error::BadArguments(format!("channel {} not in band {}", chan, band))
            })?;
            (freq, Some(chan), Some(band))
        }
        (None, None) => {
            return Err(Error::BadArguments(
                "must enter scan band -s, channel -c, frequency -f, or -R/-W for calibration"
                    .to_string(),
            ));
        }
    };

    if let Some(band) = band {
        check_band_limit(band)?;
    }

    tracing::debug!("gain: {}", args.gain);
    tracing::debug!("GSM rate: {:.4} Hz", GSM_RATE);

    let mut source = HydraSdrSource::new(args.gain);
    source.open()?;
    source.tune(freq)?;

    eprintln!("kal: Calculating clock frequency offset.");
    eprintln!(
        "Using {} channel {} ({:.1}MHz)",
        band.map(|b| b.to_string()).unwrap_or_else(|| "unknown band".to_string()),
        chan.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string()),
        freq / 1e6
    );

    let tuner_error = 0.0f32;
    offset_detect(&mut source, 0.0, tuner_error, args.show_fft)
}

fn main() -> ExitCode {
    let args = Args::parse();

    // 0 = WARN (quiet), 1 = INFO, 2 = DEBUG, 3+ = TRACE; -D forces DEBUG.
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        match args.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    exit::install_handler();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Interrupted) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
