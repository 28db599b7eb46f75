//! Clock-offset measurement against a single channel.
//!
//! Collects many FCCH detections, trims the outliers, and reports the
//! average offset as a PPM clock error. One capture is slightly longer
//! than 12 frames so at least one of the five FCCH positions in the
//! 51-multiframe falls inside it.

use std::io::Write;
use std::slice;

use crate::dsp::fcch::FcchDetector;
use crate::dsp::spectrum::SpectrumRenderer;
use crate::dsp::{avg, display_freq, sort_floats};
use crate::error::{Error, Result};
use crate::exit;
use crate::source::HydraSdrSource;
use crate::{FCCH_OFFSET_MAX, GSM_RATE};

/// Number of accepted offsets that ends the run.
const TARGET_COUNT: usize = 100;
/// Give up after this many captures regardless of yield.
const MAX_ITERATIONS: usize = 500;

struct OffsetSummary {
    mean: f64,
    stddev: f64,
    min: f32,
    max: f32,
}

/// Sort the collected offsets and, given enough of them, drop the top
/// and bottom 10% before computing the population statistics.
fn summarize(offsets: &mut [f32]) -> OffsetSummary {
    sort_floats(offsets);
    let count = offsets.len();
    let trim = if count >= 10 { count / 10 } else { 0 };
    let kept = &offsets[trim..count - trim];
    let (mean, stddev) = avg(kept);
    OffsetSummary {
        mean,
        stddev,
        min: offsets[trim],
        max: offsets[count - trim - 1],
    }
}

/// Clock error in parts per million for a mean offset at `center_freq`.
fn ppm(mean_offset_hz: f64, center_freq_hz: f64) -> f64 {
    mean_offset_hz / center_freq_hz * 1e6
}

/// Measure the clock offset of the already-tuned channel.
///
/// `hz_adjust` shifts the reported average (for known intentional
/// offsets); `tuner_error` is subtracted from every detection.
pub fn offset_detect(
    u: &mut HydraSdrSource,
    hz_adjust: f64,
    tuner_error: f32,
    show_fft: bool,
) -> Result<()> {
    let mut detector = FcchDetector::new(u.sample_rate() as f32)?;
    let mut renderer = SpectrumRenderer::new();

    // Slightly more than 12 frames so captures overlap.
    let sps = u.sample_rate() / GSM_RATE;
    let s_len = ((12.0 * 8.0 * 156.25 + 156.25) * sps).ceil() as usize;

    u.start()?;
    u.flush();

    let verbose = tracing::enabled!(tracing::Level::INFO);
    if !verbose {
        println!("Scanning for FCCH bursts ('.' = searching, '+' = found)");
    }

    let mut offsets: Vec<f32> = Vec::with_capacity(TARGET_COUNT);
    let mut overruns = 0u64;
    let mut notfound = 0u32;
    let mut iterations = 0usize;

    'run: while offsets.len() < TARGET_COUNT && iterations < MAX_ITERATIONS {
        if exit::requested() {
            break;
        }
        iterations += 1;

        // Restart the capture whenever overruns punched holes in it.
        loop {
            match u.fill(s_len) {
                Ok(0) => break,
                Ok(new_overruns) => {
                    overruns += new_overruns;
                    u.flush();
                }
                Err(Error::Interrupted) => break 'run,
                Err(e) => {
                    eprintln!("Error: source fill failed.");
                    return Err(e);
                }
            }
        }

        let (ptr, b_len) = u.buffer()?.peek();
        let cbuf = unsafe { slice::from_raw_parts(ptr, b_len) };

        if show_fft && iterations % 5 == 0 {
            println!("\nFrame {}:", iterations);
            renderer.draw(&cbuf[..b_len.min(2048)], 80, 0.0);
        }

        let (found, consumed) = detector.scan(cbuf);
        match found {
            Some(raw) => {
                // FCCH is a sine at GSM_RATE/4 above the carrier.
                let offset = raw - (GSM_RATE / 4.0) as f32 - tuner_error;

                if offset.abs() < FCCH_OFFSET_MAX {
                    offsets.push(offset);
                    if verbose {
                        tracing::info!(
                            "[{:3}/{}] offset: {:+.2} Hz",
                            offsets.len(),
                            TARGET_COUNT,
                            offset
                        );
                    } else {
                        eprint!("+");
                        let _ = std::io::stderr().flush();
                    }
                } else {
                    tracing::info!("ignored offset {:.2} Hz out of range", offset);
                }
            }
            None => {
                notfound += 1;
                if verbose {
                    tracing::info!("no FCCH found in frame {}", iterations);
                } else {
                    eprint!(".");
                    let _ = std::io::stderr().flush();
                }
            }
        }

        // Advance one capture in time. The detector consumes everything
        // it was fed, so success and failure purge the same amount; a
        // burst clipped at the boundary recurs within 10 frames and is
        // caught by a later capture.
        let purge_len = if consumed == 0 { s_len } else { consumed };
        u.buffer()?.purge(purge_len);
    }

    if !verbose {
        eprintln!();
    }
    u.stop();

    if exit::requested() {
        return Ok(());
    }

    let count = offsets.len();
    if count == 0 {
        println!("\nError: No valid FCCH bursts found after {} attempts.", iterations);
        println!("Tips:");
        println!(" - Use '-s' scan to find a stronger channel.");
        println!(" - Use '-g' to increase gain.");
        return Err(Error::NoFcchFound);
    }

    let summary = summarize(&mut offsets);

    println!("\n--------------------------------------------------");
    println!("Results ({} valid bursts out of {} attempts)", count, iterations);
    println!("--------------------------------------------------");
    println!("average\t\t[min, max]\t(range, stddev)");
    println!(
        "{}\t\t[{}, {}]\t({}, {:.6})",
        display_freq(summary.mean as f32),
        summary.min.round() as i64,
        summary.max.round() as i64,
        (summary.max - summary.min).round() as i64,
        summary.stddev
    );
    println!("overruns: {}", overruns);
    println!("not found: {}", notfound);

    let total_ppm = ppm(summary.mean + hz_adjust, u.center_freq);
    println!("\nAverage Error: {:.3} ppm ({:.3} ppb)", total_ppm, total_ppm * 1000.0);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_summary_trims_outliers() {
        // 100 offsets near +250 Hz plus wild outliers at both ends; the
        // 10% trim removes them from every reported statistic.
        let mut offsets: Vec<f32> = (0..96).map(|i| 250.0 + (i % 7) as f32 - 3.0).collect();
        offsets.extend_from_slice(&[-39_000.0, -25_000.0, 31_000.0, 38_000.0]);

        let summary = summarize(&mut offsets);
        assert!(summary.min > 200.0 && summary.max < 300.0);
        assert_relative_eq!(summary.mean, 250.0, epsilon = 2.0);
        assert!(summary.stddev < 5.0);
    }

    #[test]
    fn test_summary_small_sample_untrimmed() {
        let mut offsets = vec![100.0f32, 300.0, 200.0];
        let summary = summarize(&mut offsets);
        assert_relative_eq!(summary.mean, 200.0, epsilon = 1e-6);
        assert_eq!(summary.min, 100.0);
        assert_eq!(summary.max, 300.0);
    }

    #[test]
    fn test_ppm_of_known_offset() {
        // +250 Hz on a 935.2 MHz carrier is about +0.267 ppm.
        assert_relative_eq!(ppm(250.0, 935.2e6), 0.2673, epsilon = 1e-3);
    }
}
