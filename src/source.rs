//! HydraSDR RFOne source with the integrated resampling pipeline.
//!
//! Encapsulates the hardware interaction and signal conditioning needed
//! to hand GSM-rate samples to the detectors:
//!
//! ```text
//!  ┌───────────┐   ┌──────────────┐   ┌────────────────┐   ┌──────────┐
//!  │ HydraSDR  │──▶│  USB thread  │──▶│   Resampler    │──▶│   Ring   │
//!  │ hardware  │   │  (callback)  │   │ 270.833 kSPS   │   │  buffer  │
//!  └───────────┘   └──────────────┘   └────────────────┘   └────┬─────┘
//!                                                               ▼
//!                                                        consumer thread
//!                                                        (fill/peek/purge)
//! ```
//!
//! The USB thread is owned by the driver and runs on its own schedule;
//! nothing here may block it. The handoff to the consumer therefore uses
//! a try-lock: when the consumer holds the coordination mutex, the
//! produced batch is dropped and counted as overflow instead of stalling
//! the driver.

use num_complex::Complex;
use rs_hydra::{HydraSdr, SampleType, Transfer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::dsp::resampler::{Resampler, NATIVE_RATE};
use crate::error::{Error, Result};
use crate::exit;
use crate::ring::CircularBuffer;
use crate::GSM_RATE;

/// Output ring capacity: 256K samples, ~0.9 s of buffering at GSM rate.
const RING_CAPACITY: usize = 256 * 1024;

/// Intermediate batch for one transfer's resampler output. The largest
/// USB transfer is 128K input samples, which produces fewer than 14K
/// output samples; 32K leaves a 2x margin.
const BATCH_SIZE: usize = 32768;

/// How long one fill wait may sleep before re-checking the exit flag.
const FILL_TIMEOUT: Duration = Duration::from_millis(100);

/// Resampler plus its output staging buffer. One mutex covers both so a
/// retune reset cannot interleave with a callback mid-transfer.
struct Pipeline {
    resampler: Resampler,
    batch: Vec<Complex<f32>>,
}

/// State shared between the consumer and the driver's RX thread.
struct Shared {
    ring: CircularBuffer<Complex<f32>>,
    pipeline: Mutex<Pipeline>,
    /// Coordinates ring appends with the fill wait; the producer only
    /// ever try-locks it.
    data_lock: Mutex<()>,
    data_ready: Condvar,
    streaming: AtomicBool,
    overflow_count: AtomicU64,
}

impl Shared {
    fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            ring: CircularBuffer::new(RING_CAPACITY, false)?,
            pipeline: Mutex::new(Pipeline {
                resampler: Resampler::new(),
                batch: vec![Complex::new(0.0, 0.0); BATCH_SIZE],
            }),
            data_lock: Mutex::new(()),
            data_ready: Condvar::new(),
            streaming: AtomicBool::new(false),
            overflow_count: AtomicU64::new(0),
        }))
    }

    /// Per-transfer entry point, called on the driver's RX thread.
    fn handle_transfer(&self, transfer: &Transfer<'_>) -> i32 {
        // A transfer racing start/stop is discarded.
        if !self.streaming.load(Ordering::Acquire) {
            return 0;
        }

        // Hardware-reported drops: the full count, not one per transfer.
        if transfer.dropped_samples > 0 {
            self.overflow_count
                .fetch_add(transfer.dropped_samples, Ordering::Relaxed);
        }

        let mut pipeline = self.pipeline.lock().unwrap();
        let Pipeline { resampler, batch } = &mut *pipeline;
        let produced = resampler.process(transfer.samples, batch);

        if produced > 0 {
            // Never block the USB thread: drop and account on contention.
            match self.data_lock.try_lock() {
                Ok(_guard) => {
                    let written = self.ring.write(&pipeline.batch[..produced]);
                    if written < produced {
                        self.overflow_count
                            .fetch_add((produced - written) as u64, Ordering::Relaxed);
                    }
                    drop(_guard);
                    self.data_ready.notify_one();
                }
                Err(_) => {
                    self.overflow_count
                        .fetch_add(produced as u64, Ordering::Relaxed);
                }
            }
        }

        0
    }
}

/// High-level SDR source: device lifecycle, RF configuration, and the
/// producer/consumer sample path.
///
/// # Example
///
/// ```no_run
/// use kalibrate::source::HydraSdrSource;
///
/// let mut src = HydraSdrSource::new(10.0);
/// src.open()?;
/// src.tune(935.2e6)?;
/// src.start()?;
///
/// let overruns = src.fill(1024)?;
/// let (samples, len) = src.buffer()?.peek();
/// // process samples...
/// src.buffer()?.purge(1024);
/// # let _ = (overruns, samples, len);
/// # Ok::<(), kalibrate::Error>(())
/// ```
pub struct HydraSdrSource {
    dev: Option<HydraSdr>,
    shared: Option<Arc<Shared>>,
    gain: f32,
    sample_rate: f64,
    /// Current center frequency in Hz.
    pub center_freq: f64,
}

impl HydraSdrSource {
    /// Create a source with an initial linearity gain (0-21). The
    /// hardware is not touched until [`open`](Self::open).
    pub fn new(gain: f32) -> Self {
        Self {
            dev: None,
            shared: None,
            gain,
            // Output rate after resampling: 13 MHz / 48.
            sample_rate: GSM_RATE,
            center_freq: 0.0,
        }
    }

    /// Output sample rate after resampling (270833.333... Hz).
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Open the first HydraSDR device, configure float I/Q delivery at
    /// the 2.5 MSPS native rate, apply the initial gain, and allocate
    /// the processing chain.
    pub fn open(&mut self) -> Result<()> {
        let dev = HydraSdr::open_first()?;

        dev.set_sample_type(SampleType::Float32Iq)?;
        dev.set_samplerate(NATIVE_RATE as u32)?;
        dev.set_linearity_gain(self.gain.round().clamp(0.0, 21.0) as u8)?;

        self.shared = Some(Shared::new()?);
        self.dev = Some(dev);
        Ok(())
    }

    /// Stop streaming and release the device and buffers.
    pub fn close(&mut self) {
        self.stop();
        self.dev = None;
        self.shared = None;
    }

    /// Tune the RF front end and reset the resampler so transients from
    /// the previous frequency do not leak into the new tuned region.
    pub fn tune(&mut self, freq: f64) -> Result<()> {
        let dev = self
            .dev
            .as_ref()
            .ok_or_else(|| Error::Tune("device not open".to_string()))?;

        dev.set_freq(freq as u64)
            .map_err(|e| Error::Tune(format!("{} Hz: {}", freq, e)))?;
        self.center_freq = freq;

        if let Some(shared) = &self.shared {
            shared.pipeline.lock().unwrap().resampler.reset();
        }
        Ok(())
    }

    /// Set the linearity gain index, clamped to 0-21.
    pub fn set_gain(&mut self, gain: f32) -> Result<()> {
        let dev = self
            .dev
            .as_ref()
            .ok_or_else(|| Error::Fill("device not open".to_string()))?;
        self.gain = gain;
        dev.set_linearity_gain(gain.round().clamp(0.0, 21.0) as u8)?;
        Ok(())
    }

    /// Start streaming: reset the DSP state and overflow counter,
    /// register the per-transfer callback, and raise the streaming flag.
    pub fn start(&mut self) -> Result<()> {
        let dev = self
            .dev
            .as_ref()
            .ok_or_else(|| Error::Fill("device not open".to_string()))?;
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| Error::Fill("source not open".to_string()))?;

        shared.pipeline.lock().unwrap().resampler.reset();
        shared.overflow_count.store(0, Ordering::Relaxed);

        let cb_shared = Arc::clone(shared);
        dev.start_rx(Box::new(move |transfer| cb_shared.handle_transfer(transfer)))?;

        shared.streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop streaming and wake all fill waiters.
    pub fn stop(&mut self) {
        if let Some(shared) = &self.shared {
            if shared.streaming.load(Ordering::Acquire) {
                if let Some(dev) = &self.dev {
                    if let Err(e) = dev.stop_rx() {
                        tracing::warn!("stop_rx failed: {}", e);
                    }
                }
                shared.streaming.store(false, Ordering::Release);
                shared.data_ready.notify_all();
            }
        }
    }

    /// Open the processing chain without hardware. Samples are then
    /// injected through [`process_transfer`](Self::process_transfer), as
    /// the DSP benchmark does.
    pub fn start_benchmark(&mut self) -> Result<()> {
        if self.shared.is_none() {
            self.shared = Some(Shared::new()?);
        }
        let shared = self.shared.as_ref().unwrap();
        shared.pipeline.lock().unwrap().resampler.reset();
        shared.overflow_count.store(0, Ordering::Relaxed);
        shared.streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// The per-transfer callback body. The driver's RX thread lands here
    /// through the closure registered in [`start`](Self::start);
    /// benchmark and test code calls it directly.
    pub fn process_transfer(&self, transfer: &Transfer<'_>) -> i32 {
        match &self.shared {
            Some(shared) => shared.handle_transfer(transfer),
            None => 0,
        }
    }

    /// The output ring holding resampled samples.
    pub fn buffer(&self) -> Result<&CircularBuffer<Complex<f32>>> {
        self.shared
            .as_ref()
            .map(|s| &s.ring)
            .ok_or_else(|| Error::Fill("source not open".to_string()))
    }

    /// Block until at least `num_samples` are buffered.
    ///
    /// Wakes on producer notification, on a 100 ms timeout (to observe
    /// the exit flag), or on [`stop`](Self::stop). On success returns
    /// the number of samples dropped since the previous fill, atomically
    /// zeroing the counter.
    pub fn fill(&self, num_samples: usize) -> Result<u64> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| Error::Fill("source not open".to_string()))?;

        let mut guard = shared.data_lock.lock().unwrap();
        loop {
            if exit::requested() {
                return Err(Error::Interrupted);
            }
            if shared.ring.data_available() >= num_samples
                || !shared.streaming.load(Ordering::Acquire)
            {
                break;
            }
            let (g, _timeout) = shared
                .data_ready
                .wait_timeout(guard, FILL_TIMEOUT)
                .unwrap();
            guard = g;
        }
        drop(guard);

        if !shared.streaming.load(Ordering::Acquire) {
            return Err(Error::Fill("streaming stopped".to_string()));
        }

        Ok(shared.overflow_count.swap(0, Ordering::Acquire))
    }

    /// Discard all buffered samples and clear the overflow counter.
    pub fn flush(&self) {
        if let Some(shared) = &self.shared {
            shared.ring.flush();
            shared.overflow_count.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for HydraSdrSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn tone(freq: f64, len: usize) -> Vec<Complex<f32>> {
        let step = 2.0 * PI * freq / NATIVE_RATE;
        (0..len)
            .map(|i| {
                let phase = i as f64 * step;
                Complex::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    fn transfer(samples: &[Complex<f32>], dropped: u64) -> Transfer<'_> {
        Transfer {
            samples,
            dropped_samples: dropped,
            sample_type: SampleType::Float32Iq,
        }
    }

    #[test]
    fn test_benchmark_mode_produces_resampled_stream() {
        let mut src = HydraSdrSource::new(10.0);
        src.start_benchmark().unwrap();

        let input = tone(50_000.0, 120_000);
        assert_eq!(src.process_transfer(&transfer(&input, 0)), 0);

        // 120000 inputs resample to 13000 outputs.
        assert_eq!(src.buffer().unwrap().data_available(), 13_000);
    }

    #[test]
    fn test_dropped_samples_reported_once() {
        let mut src = HydraSdrSource::new(10.0);
        src.start_benchmark().unwrap();

        let input = tone(10_000.0, 12_000);
        src.process_transfer(&transfer(&input, 1000));
        src.process_transfer(&transfer(&input, 0));

        // The next fill reports exactly the injected count, and the one
        // after that reports zero.
        let overruns = src.fill(100).unwrap();
        assert_eq!(overruns, 1000);
        let overruns = src.fill(100).unwrap();
        assert_eq!(overruns, 0);
    }

    #[test]
    fn test_transfers_ignored_when_not_streaming() {
        let mut src = HydraSdrSource::new(10.0);
        src.start_benchmark().unwrap();
        src.stop();

        let input = tone(10_000.0, 12_000);
        src.process_transfer(&transfer(&input, 0));
        assert_eq!(src.buffer().unwrap().data_available(), 0);
    }

    #[test]
    fn test_flush_clears_data_and_overruns() {
        let mut src = HydraSdrSource::new(10.0);
        src.start_benchmark().unwrap();

        let input = tone(10_000.0, 12_000);
        src.process_transfer(&transfer(&input, 77));
        src.flush();

        assert_eq!(src.buffer().unwrap().data_available(), 0);
        let overruns = src.fill(0).unwrap();
        assert_eq!(overruns, 0);
    }

    #[test]
    fn test_ring_overflow_counted() {
        let mut src = HydraSdrSource::new(10.0);
        src.start_benchmark().unwrap();

        // Push enough through to overfill the 256K ring; the excess is
        // counted, not silently lost.
        let input = tone(10_000.0, 120_000);
        let per_transfer = 13_000u64;
        let capacity = src.buffer().unwrap().capacity() as u64;

        let transfers = 25u64;
        for _ in 0..transfers {
            src.process_transfer(&transfer(&input, 0));
        }

        let produced = per_transfer * transfers;
        let expected_dropped = produced.saturating_sub(capacity);
        assert_eq!(src.buffer().unwrap().data_available() as u64, capacity);
        assert_eq!(src.fill(0).unwrap(), expected_dropped);
    }
}
