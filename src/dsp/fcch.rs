//! Frequency Correction Channel (FCCH) detector.
//!
//! The FCCH is a pure sinusoid at GSM_RATE/4 (~67.7 kHz) transmitted by
//! GSM base stations on slot 0 of the BCCH carrier. Detection runs in
//! three steps:
//!
//! 1. A normalized-LMS predictor runs over the capture; for a pure tone
//!    it converges and its prediction error collapses, while modulated
//!    bursts and noise keep the error near the input power. The
//!    normalized error series is the presence statistic.
//! 2. An edge detector walks the error series and reports the length of
//!    each region below 0.7x the mean error. The first region at least
//!    one FCCH burst long (minus guard) is the candidate.
//! 3. A 1024-point FFT of the candidate, with sinc-interpolated peak
//!    refinement, measures the tone frequency. The finding is accepted
//!    only if the peak-to-mean power ratio clears a threshold.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::slice;
use std::sync::Arc;

use crate::dsp::vector_norm2;
use crate::error::Result;
use crate::ring::CircularBuffer;
use crate::GSM_RATE;

/// FFT size for frequency measurement.
pub const FFT_SIZE: usize = 1024;

/// Minimum peak-to-mean power ratio for a valid FCCH finding.
const MIN_PM: f32 = 50.0;

/// Error samples are staged in batches to cut ring-mutex traffic.
const E_BATCH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Low,
    High,
}

/// Detects GSM FCCH bursts and measures their tone frequency.
pub struct FcchDetector {
    /// Prediction delay in samples.
    d: usize,
    /// Error averaging coefficient.
    p: f32,
    /// Adaptive gain, normalized to the input energy each step.
    g: f32,
    /// Running error power.
    e_avg: f32,
    sample_rate: f32,
    /// Expected FCCH burst length in samples (148 symbols).
    fcch_burst_len: usize,
    /// Complex tap vector, length 2 * filter_delay + 1.
    w: Vec<Complex<f32>>,

    /// Input samples pending prediction.
    x_cb: CircularBuffer<Complex<f32>>,
    /// Normalized error series for the whole capture.
    e_cb: CircularBuffer<f32>,

    fft: Arc<dyn Fft<f32>>,
    fft_buf: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,

    /// Edge-detector state. Per-instance so concurrent detectors stay
    /// independent.
    lth_count: usize,
    lth_state: EdgeState,
}

impl FcchDetector {
    /// Detector with default adaptive-filter parameters (D = 4, p = 1/4).
    pub fn new(sample_rate: f32) -> Result<Self> {
        Self::with_params(sample_rate, 4, 0.25, 1.0)
    }

    pub fn with_params(sample_rate: f32, d: usize, p: f32, g: f32) -> Result<Self> {
        let filter_delay = 8;
        let w_len = 2 * filter_delay + 1;

        let fft = FftPlanner::new().plan_fft_forward(FFT_SIZE);
        let scratch_len = fft.get_inplace_scratch_len();

        Ok(Self {
            d,
            p,
            g,
            e_avg: 0.0,
            sample_rate,
            fcch_burst_len: (148.0 * (sample_rate / GSM_RATE as f32)) as usize,
            w: vec![Complex::new(0.0, 0.0); w_len],
            x_cb: CircularBuffer::new(8192, false)?,
            e_cb: CircularBuffer::new(1_015_808, false)?,
            fft,
            fft_buf: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            lth_count: 0,
            lth_state: EdgeState::High,
        })
    }

    /// Length of the adaptive filter.
    pub fn filter_len(&self) -> usize {
        self.w.len()
    }

    /// Samples of history the predictor needs before its first output.
    pub fn delay(&self) -> usize {
        self.w.len() - 1 + self.d
    }

    /// Clear the adaptive-filter state. Called after retuning so taps
    /// trained on the previous carrier do not bias the next capture.
    pub fn reset(&mut self) {
        self.w.fill(Complex::new(0.0, 0.0));
        self.e_avg = 0.0;
        self.low_to_high_init();
    }

    /// Scan a capture for an FCCH burst.
    ///
    /// Returns the detected tone frequency in Hz (absolute, near
    /// GSM_RATE/4 for a real FCCH) and the number of input samples
    /// consumed, which equals `s.len()`. All internal rings are flushed
    /// before returning.
    pub fn scan(&mut self, s: &[Complex<f32>]) -> (Option<f32>, usize) {
        let sps = self.sample_rate / GSM_RATE as f32;
        let min_fb_len = (100.0 * sps) as usize;

        // Run the predictor over the whole capture, staging errors in
        // batches.
        let mut len = 0usize;
        let mut sum = 0.0f64;
        let mut batch = [0.0f32; E_BATCH];
        let mut e_idx = 0usize;

        while len < s.len() {
            let t = self.x_cb.write(&s[len..]);
            len += t;

            while let Some(e) = self.next_norm_error() {
                batch[e_idx] = e;
                e_idx += 1;
                sum += e as f64;
                if e_idx == E_BATCH {
                    self.e_cb.write(&batch);
                    e_idx = 0;
                }
            }
        }
        if e_idx > 0 {
            self.e_cb.write(&batch[..e_idx]);
        }
        let consumed = len;

        let (e_ptr, e_count) = self.e_cb.peek();
        if e_count == 0 {
            return (None, consumed);
        }

        let avg = sum / e_count as f64;
        let limit = (0.7 * avg) as f32;
        tracing::debug!("error limit: {:.3}", limit);

        // Indices into the error series and into `s` coincide because
        // the predictor consumed exactly `s.len()` samples above.
        let errors = unsafe { slice::from_raw_parts(e_ptr, e_count) };

        self.low_to_high_init();
        let mut found = None;
        for i in 0..errors.len() {
            let l_count = self.low_to_high(errors[i], limit);
            if l_count >= min_fb_len {
                let y_offset = i - l_count;
                let y_len = l_count.min(self.fcch_burst_len);
                let (freq, pm) = self.freq_detect(&s[y_offset..y_offset + y_len]);
                tracing::debug!(
                    "low region: {:.0} symbols, pm {:.1}, freq {:.1} Hz",
                    l_count as f32 / sps,
                    pm,
                    freq
                );
                if pm > MIN_PM {
                    found = Some(freq);
                    break;
                }
            }
        }

        // Empty buffers for the next call.
        self.e_cb.flush();
        self.x_cb.flush();

        (found, consumed)
    }

    /// One step of the normalized-LMS predictor.
    ///
    /// Predicts the sample `d` ahead of the tap window from the `w_len`
    /// samples in it, updates the taps against the prediction error, and
    /// returns the error power normalized by the per-tap input energy.
    /// Returns `None` until enough samples are buffered.
    fn next_norm_error(&mut self) -> Option<f32> {
        let (ptr, max) = self.x_cb.peek();
        let n = self.w.len() - 1;
        if n + self.d >= max {
            return None;
        }
        let x = unsafe { slice::from_raw_parts(ptr, max) };

        // Normalized LMS: G = 1/E for input-scale-independent
        // convergence, gated for numerical stability.
        let energy: f32 = vector_norm2(&x[..self.w.len()]);
        if energy > 1e-10 {
            self.g = 1.0 / energy;
        }

        let mut y = Complex::new(0.0f32, 0.0);
        for (i, &tap) in self.w.iter().enumerate() {
            y += tap.conj() * x[n - i];
        }

        let e = x[n + self.d] - y;

        for (i, tap) in self.w.iter_mut().enumerate() {
            *tap += self.g * e.conj() * x[n - i];
        }

        let tap_energy = energy / self.w.len() as f32;
        self.e_avg = (1.0 - self.p) * self.e_avg + self.p * e.norm_sqr();

        let result = if tap_energy > 1e-20 {
            self.e_avg / tap_energy
        } else {
            0.0
        };

        self.x_cb.purge(1);
        Some(result)
    }

    /// Measure the dominant tone of `s` by FFT peak search.
    ///
    /// Returns the refined peak frequency in Hz and the peak-to-mean
    /// power ratio. Inputs shorter than the FFT are zero padded.
    pub fn freq_detect(&mut self, s: &[Complex<f32>]) -> (f32, f32) {
        let len = s.len().min(FFT_SIZE);
        self.fft_buf[..len].copy_from_slice(&s[..len]);
        self.fft_buf[len..].fill(Complex::new(0.0, 0.0));

        self.fft
            .process_with_scratch(&mut self.fft_buf, &mut self.fft_scratch);

        let (max_i, peak, avg_power) = peak_detect(&self.fft_buf);
        let pm = if avg_power > 0.0 {
            peak.norm_sqr() / avg_power
        } else {
            0.0
        };

        (max_i * (self.sample_rate / FFT_SIZE as f32), pm)
    }

    fn low_to_high_init(&mut self) {
        self.lth_count = 0;
        self.lth_state = EdgeState::High;
    }

    /// Edge detector over the error series. Returns the length of the
    /// preceding low run when `e` crosses from below the threshold to
    /// above it, 0 otherwise.
    fn low_to_high(&mut self, e: f32, a: f32) -> usize {
        let mut r = 0;
        if e > a {
            if self.lth_state == EdgeState::Low {
                r = self.lth_count;
                self.lth_state = EdgeState::High;
                self.lth_count = 0;
            }
            self.lth_count += 1;
        } else {
            if self.lth_state == EdgeState::High {
                self.lth_state = EdgeState::Low;
                self.lth_count = 0;
            }
            self.lth_count += 1;
        }
        r
    }
}

fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-4 {
        return 1.0;
    }
    x.sin() / x
}

/// Band-limited interpolation of the spectrum at fractional bin `s_i`,
/// using a 21-point sinc kernel clamped to the bin range.
fn interpolate_point(s: &[Complex<f32>], s_i: f32) -> Complex<f32> {
    const FILTER_LEN: isize = 21;
    let d = (FILTER_LEN - 1) / 2;

    let mut start = s_i.floor() as isize - d;
    let mut end = s_i.floor() as isize + d + 1;
    if start < 0 {
        start = 0;
    }
    if end > s.len() as isize - 1 {
        end = s.len() as isize - 1;
    }

    let mut point = Complex::new(0.0f32, 0.0);
    for i in start..=end {
        let arg = PI * (i as f32 - s_i);
        point += s[i as usize] * sinc(arg);
    }
    point
}

/// Locate the magnitude peak of a spectrum and refine it to 1/1024 of a
/// bin with an interpolated binary search. Returns the fractional bin,
/// the interpolated peak value, and the average power of the remaining
/// bins.
fn peak_detect(s: &[Complex<f32>]) -> (f32, Complex<f32>, f32) {
    let mut max = -1.0f32;
    let mut max_i = -1.0f32;
    let mut sum_power = 0.0f32;

    for (i, v) in s.iter().enumerate() {
        let sample_power = v.norm_sqr();
        sum_power += sample_power;
        if sample_power > max {
            max = sample_power;
            max_i = i as f32;
        }
    }

    let mut early_i = if max_i >= 1.0 { max_i - 1.0 } else { 0.0 };
    let mut late_i = if max_i + 1.0 < s.len() as f32 {
        max_i + 1.0
    } else {
        s.len() as f32 - 1.0
    };

    // Half-step binary search on the interpolated spectrum, walking the
    // two probes toward the true peak.
    let mut incr = 0.5f32;
    while incr > 1.0 / 1024.0 {
        let early_p = interpolate_point(s, early_i);
        let late_p = interpolate_point(s, late_i);
        if early_p.norm_sqr() < late_p.norm_sqr() {
            early_i += incr;
        } else if early_p.norm_sqr() > late_p.norm_sqr() {
            early_i -= incr;
        } else {
            break;
        }
        incr /= 2.0;
        late_i = early_i + 2.0;
    }

    max_i = early_i + 1.0;
    let cmax = interpolate_point(s, max_i);

    let avg_power = if s.len() > 1 {
        (sum_power - cmax.norm_sqr()) / (s.len() - 1) as f32
    } else {
        sum_power
    };

    (max_i, cmax, avg_power)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI as PI64;

    const RATE: f64 = 1_625_000.0 / 6.0;

    /// Deterministic uniform noise in [-1, 1] (xorshift).
    struct Noise(u64);
    impl Noise {
        fn next(&mut self) -> f32 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            (self.0 >> 11) as f32 / (1u64 << 52) as f32 - 1.0
        }
        fn sample(&mut self) -> Complex<f32> {
            Complex::new(self.next(), self.next())
        }
    }

    fn tone_at(freq: f64, start: usize, len: usize) -> Vec<Complex<f32>> {
        (0..len)
            .map(|i| {
                let phase = 2.0 * PI64 * freq * (start + i) as f64 / RATE;
                Complex::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn test_edge_detector_reports_low_run() {
        let mut det = FcchDetector::new(RATE as f32).unwrap();
        let series = [1.0f32, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let runs: Vec<usize> = series.iter().map(|&e| det.low_to_high(e, 0.5)).collect();
        assert_eq!(runs, vec![0, 0, 0, 0, 0, 3, 0]);
    }

    #[test]
    fn test_edge_detectors_are_independent() {
        let mut a = FcchDetector::new(RATE as f32).unwrap();
        let mut b = FcchDetector::new(RATE as f32).unwrap();

        // Drive only `a` into a long low run; `b` must not see it.
        for _ in 0..10 {
            a.low_to_high(0.0, 0.5);
        }
        b.low_to_high(0.0, 0.5);
        assert_eq!(a.low_to_high(1.0, 0.5), 10);
        assert_eq!(b.low_to_high(1.0, 0.5), 1);
    }

    #[test]
    fn test_predictor_converges_on_tone() {
        let mut det = FcchDetector::new(RATE as f32).unwrap();
        let s = tone_at(RATE / 4.0, 0, 2048);
        det.x_cb.write(&s);

        let mut errors = Vec::new();
        while let Some(e) = det.next_norm_error() {
            errors.push(e);
        }

        let tail: f32 =
            errors[1000..1500].iter().sum::<f32>() / 500.0;
        assert!(tail < 0.05, "predictor did not converge: tail error {}", tail);
    }

    #[test]
    fn test_freq_detect_pure_tone() {
        let mut det = FcchDetector::new(RATE as f32).unwrap();
        let s = tone_at(67_708.333, 0, FFT_SIZE);
        let (freq, pm) = det.freq_detect(&s);
        assert!(pm > MIN_PM, "pm {} too low for pure tone", pm);
        assert!(
            (freq - 67_708.3).abs() < 50.0,
            "freq {} off expected 67708.3",
            freq
        );
    }

    #[test]
    fn test_scan_finds_burst_in_noise() {
        // One tone burst embedded in noise, the way FCCH shows up in a
        // real capture: noise keeps the error statistic high on both
        // sides of the burst.
        let expected = RATE / 4.0 + 5_000.0;
        let mut noise = Noise(0x9E3779B97F4A7C15);

        let mut s: Vec<Complex<f32>> = Vec::new();
        for _ in 0..3000 {
            s.push(noise.sample() * 0.1);
        }
        for t in tone_at(expected, 0, 400) {
            s.push(t + noise.sample() * 0.1);
        }
        for _ in 0..3000 {
            s.push(noise.sample() * 0.1);
        }

        let mut det = FcchDetector::new(RATE as f32).unwrap();
        let (offset, consumed) = det.scan(&s);
        assert_eq!(consumed, s.len());

        let offset = offset.expect("burst not detected");
        assert!(
            (offset - expected as f32).abs() < 100.0,
            "offset {} expected {}",
            offset,
            expected
        );
    }

    #[test]
    fn test_scan_rejects_noise() {
        let mut false_positives = 0;
        for seed in 1..=20u64 {
            let mut noise = Noise(seed.wrapping_mul(0x2545F4914F6CDD1D));
            let s: Vec<Complex<f32>> =
                (0..4000).map(|_| noise.sample() * 0.3).collect();

            let mut det = FcchDetector::new(RATE as f32).unwrap();
            let (offset, _) = det.scan(&s);
            if offset.is_some() {
                false_positives += 1;
            }
        }
        assert!(
            false_positives <= 1,
            "{} false positives in 20 noise trials",
            false_positives
        );
    }

    #[test]
    fn test_scan_flushes_state_between_calls() {
        let mut det = FcchDetector::new(RATE as f32).unwrap();
        let mut noise = Noise(42);
        let s: Vec<Complex<f32>> = (0..2000).map(|_| noise.sample() * 0.2).collect();

        let (_, consumed) = det.scan(&s);
        assert_eq!(consumed, s.len());
        assert_eq!(det.x_cb.data_available(), 0);
        assert_eq!(det.e_cb.data_available(), 0);
    }
}
