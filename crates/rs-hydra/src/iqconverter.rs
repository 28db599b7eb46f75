//! Real-to-I/Q converter for HydraSDR ADC samples.
//!
//! The RFOne's single ADC produces real samples centered on Fs/4. This
//! module shifts that spectrum to baseband and decimates by two, yielding
//! complex I/Q at half the ADC rate:
//!
//! 1. DC removal (one-pole high-pass on the running average)
//! 2. Fs/4 translation via the rotation sequence `[-1, -c, +1, +c]`
//! 3. Half-band FIR on the even (I) samples
//! 4. Matching group-delay line on the odd (Q) samples
//!
//! The half-band kernel is designed at construction: a Blackman-windowed
//! sinc with cutoff at a quarter of the ADC rate, which forces every other
//! tap to zero and the center tap to one half.

use num_complex::Complex;

use std::f64::consts::PI;

/// Half-band kernel length. Odd, with (TAPS-1)/2 odd so the kernel
/// midpoint lands on the 0.5 center tap.
const HB_TAPS: usize = 47;

/// DC removal high-pass coefficient.
const DC_SCALE: f32 = 0.01;

/// Size factor for the FIR history buffer (amortizes wrap-around copies).
const SIZE_FACTOR: usize = 32;

/// Streaming real-to-I/Q converter state.
pub struct IqConverter {
    /// Running DC average.
    avg: f32,
    /// Center tap of the half-band kernel (0.5).
    hbc: f32,
    /// Number of non-zero taps (even indices of the full kernel).
    len: usize,
    /// Write index into the FIR history.
    fir_index: usize,
    /// Write index into the Q delay line.
    delay_index: usize,
    /// Non-zero half-band taps.
    fir_kernel: Vec<f32>,
    /// FIR history, `len * SIZE_FACTOR` entries.
    fir_queue: Vec<f32>,
    /// Q-channel delay line, `len / 2` entries.
    delay_line: Vec<f32>,
}

/// Blackman-windowed sinc half-band low-pass, unity DC gain.
fn design_halfband(taps: usize) -> Vec<f32> {
    let mid = (taps / 2) as isize;
    let mut h = Vec::with_capacity(taps);
    for n in 0..taps {
        let x = n as isize - mid;
        // Cutoff at fs/4: sin(pi x / 2) / (pi x), center 0.5.
        let sinc = if x == 0 {
            0.5
        } else {
            (PI * x as f64 / 2.0).sin() / (PI * x as f64)
        };
        let ratio = n as f64 / (taps - 1) as f64;
        let window = 0.42 - 0.5 * (2.0 * PI * ratio).cos() + 0.08 * (4.0 * PI * ratio).cos();
        h.push((sinc * window) as f32);
    }
    // Exact half-band zeros (the window leaves them within float noise).
    for n in 0..taps {
        let x = n as isize - mid;
        if x != 0 && x % 2 == 0 {
            h[n] = 0.0;
        }
    }
    let sum: f32 = h.iter().sum();
    for v in h.iter_mut() {
        *v /= sum;
    }
    h
}

impl IqConverter {
    pub fn new() -> Self {
        let hb = design_halfband(HB_TAPS);
        let len = HB_TAPS / 2 + 1;
        let hbc = hb[HB_TAPS / 2];

        // Keep only the non-zero taps (even indices of the full kernel).
        let fir_kernel: Vec<f32> = (0..len).map(|i| hb[i * 2]).collect();

        Self {
            avg: 0.0,
            hbc,
            len,
            fir_index: 0,
            delay_index: 0,
            fir_kernel,
            fir_queue: vec![0.0; len * SIZE_FACTOR],
            delay_line: vec![0.0; len / 2],
        }
    }

    /// Clear all internal state.
    pub fn reset(&mut self) {
        self.avg = 0.0;
        self.fir_index = 0;
        self.delay_index = 0;
        self.fir_queue.fill(0.0);
        self.delay_line.fill(0.0);
    }

    /// Convert a buffer of real samples to interleaved I/Q in place.
    ///
    /// Even indices become I, odd indices become Q; the buffer then holds
    /// `samples.len() / 2` complex pairs.
    pub fn process(&mut self, samples: &mut [f32]) {
        self.remove_dc(samples);
        self.translate_fs4(samples);
    }

    /// Convert real samples and collect `Complex<f32>` pairs.
    ///
    /// Output length is half the input length.
    pub fn process_to_complex(&mut self, samples: &mut [f32]) -> Vec<Complex<f32>> {
        self.process(samples);
        samples
            .chunks_exact(2)
            .map(|iq| Complex::new(iq[0], iq[1]))
            .collect()
    }

    fn remove_dc(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            *sample -= self.avg;
            self.avg += DC_SCALE * *sample;
        }
    }

    fn translate_fs4(&mut self, samples: &mut [f32]) {
        let hbc = self.hbc;

        // Multiply by exp(-j 2 pi (fs/4) t): the sequence [-1, -c, +1, +c]
        // folds the center-tap scaling of the odd samples into the shift.
        for chunk in samples.chunks_exact_mut(4) {
            chunk[0] = -chunk[0];
            chunk[1] = -chunk[1] * hbc;
            chunk[3] *= hbc;
        }

        self.fir_interleaved(samples);
        self.delay_interleaved(samples);
    }

    /// Half-band FIR over the even (I) samples.
    fn fir_interleaved(&mut self, samples: &mut [f32]) {
        let len = self.len;
        for i in (0..samples.len()).step_by(2) {
            let q = self.fir_index;
            self.fir_queue[q] = samples[i];

            // Symmetric kernel: pair tap j with tap len-1-j.
            let mut acc = 0.0f32;
            for j in 0..len / 2 {
                acc += self.fir_kernel[j] * (self.fir_queue[q + j] + self.fir_queue[q + len - 1 - j]);
            }
            samples[i] = acc;

            if self.fir_index == 0 {
                self.fir_index = len * (SIZE_FACTOR - 1);
                for k in 0..len - 1 {
                    self.fir_queue[self.fir_index + 1 + k] = self.fir_queue[k];
                }
            } else {
                self.fir_index -= 1;
            }
        }
    }

    /// Group-delay line over the odd (Q) samples.
    fn delay_interleaved(&mut self, samples: &mut [f32]) {
        let half_len = self.len / 2;
        for i in (1..samples.len()).step_by(2) {
            std::mem::swap(&mut self.delay_line[self.delay_index], &mut samples[i]);
            self.delay_index += 1;
            if self.delay_index >= half_len {
                self.delay_index = 0;
            }
        }
    }
}

impl Default for IqConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halfband_design() {
        let h = design_halfband(HB_TAPS);
        assert_eq!(h.len(), HB_TAPS);

        // Center tap is half the DC gain.
        let sum: f32 = h.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!((h[HB_TAPS / 2] - 0.5).abs() < 1e-3);

        // Every other tap away from the center is zero.
        for (n, &v) in h.iter().enumerate() {
            let x = n as isize - (HB_TAPS / 2) as isize;
            if x != 0 && x % 2 == 0 {
                assert_eq!(v, 0.0, "tap {} should be a half-band zero", n);
            }
        }
    }

    #[test]
    fn test_converter_creation() {
        let converter = IqConverter::new();
        assert_eq!(converter.len, 24);
        assert_eq!(converter.fir_queue.len(), 24 * SIZE_FACTOR);
        assert_eq!(converter.delay_line.len(), 12);
        assert!((converter.hbc - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_dc_removal() {
        let mut converter = IqConverter::new();
        let mut samples = vec![0.5f32; 1000];
        converter.remove_dc(&mut samples);

        let tail_avg: f32 = samples[900..].iter().sum::<f32>() / 100.0;
        assert!(tail_avg.abs() < 0.1, "DC not removed: {}", tail_avg);
    }

    #[test]
    fn test_process_to_complex_length() {
        let mut converter = IqConverter::new();
        let mut samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = converter.process_to_complex(&mut samples);
        assert_eq!(out.len(), 500);
    }

    #[test]
    fn test_reset_restores_initial_output() {
        let mut converter = IqConverter::new();
        let make_input = || -> Vec<f32> {
            (0..512)
                .map(|i| (2.0 * std::f32::consts::PI * 0.02 * i as f32).sin())
                .collect()
        };

        let mut a = make_input();
        let first = converter.process_to_complex(&mut a);

        converter.reset();
        let mut b = make_input();
        let second = converter.process_to_complex(&mut b);

        assert_eq!(first, second);
    }

    #[test]
    fn test_tone_survives_conversion() {
        // A tone near fs/4 maps close to baseband and must carry energy
        // through the half-band filter.
        let mut converter = IqConverter::new();
        let n = 8192;
        let freq = 0.26; // cycles per sample, just above fs/4
        let mut samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64).sin() as f32)
            .collect();

        let out = converter.process_to_complex(&mut samples);
        let energy: f32 = out[256..].iter().map(|c| c.norm_sqr()).sum::<f32>() / (out.len() - 256) as f32;
        assert!(energy > 0.01, "converted tone lost: energy {}", energy);
    }
}
