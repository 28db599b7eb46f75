//! Two-pass band scan: a fast power sweep over every ARFCN, then FCCH
//! verification of the channels that stand out.
//!
//! Pass 1 captures a single frame per channel and records its L2 norm.
//! The detection threshold is the mean of the weakest 60% of channels,
//! which excludes the strong carriers from their own baseline. Pass 2
//! revisits only the channels above threshold with a 12-frame capture
//! and the full FCCH detector.

use std::slice;

use crate::arfcn::{arfcn_to_freq, Band};
use crate::dsp::fcch::FcchDetector;
use crate::dsp::spectrum::SpectrumRenderer;
use crate::dsp::{avg, dbfs, display_freq, sort_floats, vector_norm2};
use crate::error::{Error, Result};
use crate::exit;
use crate::source::HydraSdrSource;
use crate::{FCCH_OFFSET_MAX, GSM_RATE};

/// Consecutive detector misses on one channel before moving on.
const NOTFOUND_MAX: u32 = 10;

/// One past the highest ARFCN in any supported band.
const MAX_ARFCN: usize = 1024;

/// Fill the requested capture, restarting whenever overruns corrupted
/// it. Distinguishes interruption from stream failure for the caller.
fn fill_clean(u: &HydraSdrSource, num_samples: usize) -> Result<()> {
    loop {
        u.flush();
        let overruns = u.fill(num_samples)?;
        if overruns == 0 {
            return Ok(());
        }
        tracing::debug!("{} overruns, refilling", overruns);
    }
}

/// Scan `band` for base stations (C0 carriers). Prints one line per
/// channel with a verified FCCH. Returns cleanly when interrupted.
pub fn c0_detect(u: &mut HydraSdrSource, band: Band, show_fft: bool) -> Result<()> {
    let sps = u.sample_rate() / GSM_RATE;

    // 12 frames (~55 ms) for FCCH detection; a single frame (~4.6 ms)
    // is enough for the power estimate and makes pass 1 twelve times
    // faster.
    let frames_len = ((12.0 * 8.0 * 156.25 + 156.25) * sps).ceil() as usize;
    let power_scan_len = (((8.0 * 156.25) * sps).ceil() as usize).max(1024);

    let mut detector = FcchDetector::new(u.sample_rate() as f32)?;
    let mut renderer = SpectrumRenderer::new();
    let mut power = vec![0.0f64; MAX_ARFCN];

    tracing::debug!("calculate power in each channel");
    u.start()?;
    u.flush();

    // Pass 1: power scan.
    for chan in band.channels() {
        if exit::requested() {
            break;
        }
        let freq = match arfcn_to_freq(band, chan) {
            Some(f) => f,
            None => continue,
        };
        u.tune(freq)?;

        match fill_clean(u, power_scan_len) {
            Ok(()) => {}
            Err(Error::Interrupted) => break,
            Err(e) => return Err(e),
        }

        let (ptr, b_len) = u.buffer()?.peek();
        let b = unsafe { slice::from_raw_parts(ptr, b_len) };
        let n = vector_norm2::<f64>(&b[..power_scan_len.min(b_len)]).sqrt();
        power[chan as usize] = n;
        tracing::debug!(
            "chan {} ({:.1}MHz): power {:6.1} dBFS",
            chan,
            freq / 1e6,
            dbfs(n, power_scan_len)
        );
    }

    if exit::requested() {
        return Ok(());
    }

    // Threshold: mean of the weakest 60% of channels, so the strong
    // carriers do not lift their own baseline.
    let mut spower: Vec<f32> = band.channels().map(|c| power[c as usize] as f32).collect();
    sort_floats(&mut spower);
    let count = spower.len();
    let threshold = if count > 0 {
        let keep = count - 4 * count / 10;
        avg(&spower[..keep]).0
    } else {
        0.0
    };
    tracing::info!(
        "channel detect threshold: {:6.1} dBFS",
        dbfs(threshold, power_scan_len)
    );

    // Pass 2: FCCH verification on the candidates.
    println!("{}:", band);
    let chans: Vec<u16> = band.channels().collect();
    let interactive = unsafe { libc::isatty(1) } == 1;

    let mut idx = 0;
    let mut notfound_count = 0u32;
    while idx < chans.len() {
        if exit::requested() {
            break;
        }
        let chan = chans[idx];
        if power[chan as usize] <= threshold {
            idx += 1;
            continue;
        }

        let freq = match arfcn_to_freq(band, chan) {
            Some(f) => f,
            None => {
                idx += 1;
                continue;
            }
        };
        if interactive {
            print!("...chan {} ({:.1}MHz)\r", chan, freq / 1e6);
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }

        u.tune(freq)?;
        detector.reset();

        match fill_clean(u, frames_len) {
            Ok(()) => {}
            Err(Error::Interrupted) => break,
            Err(e) => return Err(e),
        }

        let (ptr, b_len) = u.buffer()?.peek();
        let b = unsafe { slice::from_raw_parts(ptr, b_len) };
        let (found, _) = detector.scan(b);

        let accepted = found
            .map(|offset| offset - (GSM_RATE / 4.0) as f32)
            .filter(|eff| eff.abs() < FCCH_OFFSET_MAX);

        if let Some(effective_offset) = accepted {
            // Power of the very capture the detector accepted, so the
            // report matches any FFT drawn below.
            let norm = vector_norm2::<f64>(b).sqrt();
            println!(
                " chan: {:4} ({:.1}MHz {}) power: {:6.1} dBFS",
                chan,
                freq / 1e6,
                display_freq(effective_offset),
                dbfs(norm, b_len)
            );

            if show_fft {
                renderer.draw(&b[..b_len.min(2048)], 70, 0.0);
            }

            notfound_count = 0;
            idx += 1;
        } else {
            notfound_count += 1;
            if notfound_count >= NOTFOUND_MAX {
                notfound_count = 0;
                idx += 1;
            }
        }
    }

    Ok(())
}
