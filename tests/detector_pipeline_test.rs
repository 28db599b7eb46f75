//! End-to-end pipeline tests: synthetic GSM-like captures at the 2.5 MSPS
//! native rate, pushed through the transfer callback and the resampler,
//! then scanned for FCCH bursts out of the ring buffer.

use num_complex::Complex;
use rs_hydra::{SampleType, Transfer};
use std::f64::consts::PI;
use std::slice;

use kalibrate::dsp::fcch::FcchDetector;
use kalibrate::source::HydraSdrSource;
use kalibrate::GSM_RATE;

const NATIVE_RATE: f64 = 2_500_000.0;

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

/// A 12-frame capture at the native rate: noise everywhere except one
/// FCCH-like tone burst at GSM_RATE/4 + delta starting on slot 0 of
/// `burst_frame`. The burst runs a bit past the nominal 148 symbols so
/// the resampler's edge transients do not eat into the detection gate.
fn gsm_capture(delta_hz: f64, burst_frame: usize, seed: u64) -> Vec<Complex<f32>> {
    let frame_len = (8.0 * 156.25 * NATIVE_RATE / GSM_RATE) as usize;
    let burst_len = (220.0 * NATIVE_RATE / GSM_RATE) as usize;
    let total = 12 * frame_len + frame_len / 8;

    let tone_freq = GSM_RATE / 4.0 + delta_hz;
    let step = 2.0 * PI * tone_freq / NATIVE_RATE;
    let burst_start = burst_frame * frame_len;

    let mut noise = Noise(seed);
    (0..total)
        .map(|i| {
            let mut s = noise.sample() * 0.1;
            if i >= burst_start && i < burst_start + burst_len {
                let phase = (i - burst_start) as f64 * step;
                s += Complex::new(phase.cos() as f32, phase.sin() as f32);
            }
            s
        })
        .collect()
}

/// Push a native-rate capture through the real transfer path in uneven
/// chunks and return the resampled stream read back from the ring.
fn resample_through_source(input: &[Complex<f32>]) -> Vec<Complex<f32>> {
    let mut src = HydraSdrSource::new(10.0);
    src.start_benchmark().unwrap();

    for chunk in input.chunks(60_000) {
        let transfer = Transfer {
            samples: chunk,
            dropped_samples: 0,
            sample_type: SampleType::Float32Iq,
        };
        assert_eq!(src.process_transfer(&transfer), 0);
    }

    let buffer = src.buffer().unwrap();
    let (ptr, len) = buffer.peek();
    unsafe { slice::from_raw_parts(ptr, len) }.to_vec()
}

#[test]
fn fcch_offset_recovered_through_full_pipeline() {
    for (delta, tolerance) in [(250.0f64, 50.0f32), (-15_000.0, 100.0)] {
        let capture = gsm_capture(delta, 2, 0x0123_4567_89AB_CDEF);
        let resampled = resample_through_source(&capture);

        // 12 frames and change survive the rate conversion.
        assert!(
            resampled.len() > 14_000,
            "short resampled capture: {}",
            resampled.len()
        );

        let mut detector = FcchDetector::new(GSM_RATE as f32).unwrap();
        let (found, consumed) = detector.scan(&resampled);
        assert_eq!(consumed, resampled.len());

        let raw = found.unwrap_or_else(|| panic!("no FCCH found for delta {}", delta));
        let offset = raw - (GSM_RATE / 4.0) as f32;
        assert!(
            (offset - delta as f32).abs() < tolerance,
            "delta {}: measured {}, expected within {}",
            delta,
            offset,
            tolerance
        );
    }
}

#[test]
fn capture_without_burst_yields_nothing() {
    let frame_len = (8.0 * 156.25 * NATIVE_RATE / GSM_RATE) as usize;
    let mut noise = Noise(0xDEAD_BEEF_CAFE_F00D);
    let capture: Vec<Complex<f32>> = (0..12 * frame_len).map(|_| noise.sample() * 0.1).collect();

    let resampled = resample_through_source(&capture);
    let mut detector = FcchDetector::new(GSM_RATE as f32).unwrap();
    let (found, _) = detector.scan(&resampled);
    assert!(found.is_none(), "detector hallucinated {:?}", found);
}

#[test]
fn burst_position_does_not_matter() {
    for frame in [1usize, 5, 10] {
        let capture = gsm_capture(1_000.0, frame, 0x5555_AAAA_5555_AAAA ^ frame as u64);
        let resampled = resample_through_source(&capture);

        let mut detector = FcchDetector::new(GSM_RATE as f32).unwrap();
        let (found, _) = detector.scan(&resampled);
        assert!(found.is_some(), "burst in frame {} missed", frame);
    }
}

#[test]
fn dropped_samples_are_reported_exactly_once() {
    let mut src = HydraSdrSource::new(10.0);
    src.start_benchmark().unwrap();

    let capture = gsm_capture(0.0, 2, 7);
    let mid = capture.len() / 2;

    src.process_transfer(&Transfer {
        samples: &capture[..mid],
        dropped_samples: 0,
        sample_type: SampleType::Float32Iq,
    });
    src.process_transfer(&Transfer {
        samples: &capture[mid..],
        dropped_samples: 1000,
        sample_type: SampleType::Float32Iq,
    });

    assert_eq!(src.fill(1024).unwrap(), 1000);
    assert_eq!(src.fill(1024).unwrap(), 0);
}
