//! ASCII spectrum renderer for the terminal.
//!
//! Draws a Blackman-Harris windowed, dBFS-calibrated power spectrum as a
//! single line of Unicode block characters, with the strongest local
//! peaks listed below. Used by the scan passes (`-A`) to show what the
//! receiver is actually looking at.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

// Blackman-Harris 4-term coefficients.
const A0: f64 = 0.35875;
const A1: f64 = 0.48829;
const A2: f64 = 0.14128;
const A3: f64 = 0.01168;

const FLOOR_DB: f32 = -115.0;
const CEIL_DB: f32 = -45.0;

/// Renders spectra for one scan run. Caches the FFT plan and work
/// buffer per input length.
pub struct SpectrumRenderer {
    planner: FftPlanner<f32>,
    plan: Option<(usize, Arc<dyn Fft<f32>>)>,
    buf: Vec<Complex<f32>>,
    /// dB reference for a full-scale windowed tone at the cached length.
    db_offset: f32,
}

impl SpectrumRenderer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            plan: None,
            buf: Vec::new(),
            db_offset: 0.0,
        }
    }

    fn plan_for(&mut self, len: usize) -> Arc<dyn Fft<f32>> {
        match &self.plan {
            Some((cached_len, fft)) if *cached_len == len => Arc::clone(fft),
            _ => {
                let fft = self.planner.plan_fft_forward(len);
                self.plan = Some((len, Arc::clone(&fft)));
                self.buf.resize(len, Complex::new(0.0, 0.0));
                // Full-scale reference: amplitude 1.0 times the window's
                // coherent gain.
                self.db_offset = (20.0 * (len as f64 * A0).log10()) as f32;
                fft
            }
        }
    }

    /// Draw the spectrum of `data` at terminal `width` columns. When
    /// `sample_rate` is positive, the strongest peaks are listed with
    /// absolute frequencies relative to the center.
    pub fn draw(&mut self, data: &[Complex<f32>], width: usize, sample_rate: f32) {
        let len = data.len();
        if len < 2 {
            return;
        }
        let fft = self.plan_for(len);

        // Blackman-Harris window, f64 phase for long inputs.
        for (i, &x) in data.iter().enumerate() {
            let ratio = i as f64 / (len - 1) as f64;
            let window = A0 - A1 * (2.0 * PI * ratio).cos() + A2 * (4.0 * PI * ratio).cos()
                - A3 * (6.0 * PI * ratio).cos();
            self.buf[i] = x * window as f32;
        }

        fft.process(&mut self.buf);

        // Power spectrum in dBFS, FFT-shifted so DC sits mid-line.
        let mut mag_db = vec![0.0f32; len];
        let mut max_db = -1000.0f32;
        for (i, slot) in mag_db.iter_mut().enumerate() {
            let idx = (i + len / 2) % len;
            let pwr = self.buf[idx].norm_sqr();
            let db = 10.0 * (pwr + 1e-12).log10() - self.db_offset;
            *slot = db;
            if db > max_db {
                max_db = db;
            }
        }

        // Max-hold downsample to the plot width.
        let plot_width = width.saturating_sub(20).max(10);
        let mut bins = vec![FLOOR_DB; plot_width];
        for (w, bin) in bins.iter_mut().enumerate() {
            let start = w * len / plot_width;
            let end = ((w + 1) * len / plot_width).min(len);
            let mut local_max = -1000.0f32;
            for &db in &mag_db[start..end] {
                if db > local_max {
                    local_max = db;
                }
            }
            *bin = local_max;
        }

        let blocks = [" ", " ", "▂", "▃", "▄", "▅", "▆", "▇", "█"];
        print!("\x1b[36m[-BW/2] \x1b[0m");
        for &val in &bins {
            let norm = ((val - FLOOR_DB) / (CEIL_DB - FLOOR_DB)).clamp(0.0, 1.0);
            let idx = (norm * (blocks.len() - 1) as f32) as usize;

            let color = if norm < 0.20 {
                "\x1b[90m" // gray: noise
            } else if norm < 0.40 {
                "\x1b[34m"
            } else if norm < 0.60 {
                "\x1b[36m"
            } else if norm < 0.80 {
                "\x1b[32m"
            } else {
                "\x1b[91m" // red: peak
            };
            print!("{}{}", color, blocks[idx]);
        }
        println!("\x1b[0m \x1b[36m[+BW/2]\x1b[0m Max: {:.1}dBFS", max_db);

        if sample_rate > 0.0 {
            let mut peaks: Vec<(f32, f32)> = Vec::new();
            for i in 1..len - 1 {
                if mag_db[i] > mag_db[i - 1]
                    && mag_db[i] > mag_db[i + 1]
                    && mag_db[i] > max_db - 40.0
                    && mag_db[i] > -120.0
                {
                    let freq = (i as f32 - len as f32 / 2.0) * (sample_rate / len as f32);
                    peaks.push((freq, mag_db[i]));
                }
            }
            peaks.sort_by(|a, b| b.1.total_cmp(&a.1));

            println!("   Peak Detection (Top 6):");
            for (rank, (freq, db)) in peaks.iter().take(6).enumerate() {
                println!("    #{}: {:9.1} Hz  ({:6.1} dBFS)", rank + 1, freq, db);
            }
        }
    }
}

impl Default for SpectrumRenderer {
    fn default() -> Self {
        Self::new()
    }
}
