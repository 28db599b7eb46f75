/// Digital Signal Processing (DSP) module.
///
/// Core building blocks for the calibration pipeline plus the small
/// vector-math helpers the scan drivers lean on.
///
/// # Modules
/// - `resampler`: two-stage 2.5 MSPS → 270.833 kSPS rational resampler.
/// - `fcch`: adaptive-filter FCCH burst detector.
/// - `spectrum`: ASCII spectrum renderer for the terminal.
use num_complex::Complex;
use num_traits::Float;

pub mod fcch;
pub mod resampler;
pub mod spectrum;

/// Sum of squared magnitudes of a complex vector, accumulated in `T`.
///
/// The power scan accumulates in f64 so millions of small squared
/// magnitudes do not lose precision in an f32 accumulator.
pub fn vector_norm2<T: Float + From<f32>>(v: &[Complex<f32>]) -> T {
    v.iter().fold(T::zero(), |acc, c| {
        acc + <T as From<f32>>::from(c.norm_sqr())
    })
}

/// Sort floats ascending. NaNs are not expected in any series we sort;
/// `total_cmp` keeps the order total regardless.
pub fn sort_floats(data: &mut [f32]) {
    data.sort_by(f32::total_cmp);
}

/// Population mean and population standard deviation.
pub fn avg(data: &[f32]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &x in data {
        sum += x as f64;
        sum_sq += x as f64 * x as f64;
    }
    let mean = sum / data.len() as f64;
    let var = (sum_sq / data.len() as f64 - mean * mean).max(0.0);
    (mean, var.sqrt())
}

/// L2 norm to dBFS, full scale 1.0 for float samples in [-1, +1].
/// Values below 1e-9 floor at -120 dBFS.
pub fn dbfs(l2_norm: f64, len: usize) -> f64 {
    if l2_norm < 1e-9 || len == 0 {
        return -120.0;
    }
    let rms = l2_norm / (len as f64).sqrt();
    20.0 * rms.log10()
}

/// Format a frequency with a signed lead and MHz/kHz/Hz unit.
pub fn display_freq(f: f32) -> String {
    if f.abs() >= 1_000_000.0 {
        format!("{:+.0}MHz", f / 1_000_000.0)
    } else if f.abs() >= 1_000.0 {
        format!("{:+.0}kHz", f / 1_000.0)
    } else {
        format!("{:+.0}Hz", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_vector_norm2() {
        let v = vec![Complex::new(3.0f32, 4.0), Complex::new(0.0, 1.0)];
        let n: f64 = vector_norm2(&v);
        assert_relative_eq!(n, 26.0, epsilon = 1e-9);
        let n32: f32 = vector_norm2(&v);
        assert_relative_eq!(n32, 26.0, epsilon = 1e-5);
    }

    #[test]
    fn test_sort_floats() {
        let mut v = vec![3.0f32, -1.0, 2.5, 0.0, -7.25];
        sort_floats(&mut v);
        assert_eq!(v, vec![-7.25, -1.0, 0.0, 2.5, 3.0]);
    }

    #[test]
    fn test_avg_and_stddev() {
        let data = vec![2.0f32, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let (mean, stddev) = avg(&data);
        assert_relative_eq!(mean, 5.0, epsilon = 1e-9);
        assert_relative_eq!(stddev, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_avg_empty() {
        let (mean, stddev) = avg(&[]);
        assert_eq!(mean, 0.0);
        assert_eq!(stddev, 0.0);
    }

    #[test]
    fn test_dbfs_full_scale() {
        // A constant full-scale signal: L2 = sqrt(n), rms = 1.0 -> 0 dBFS.
        let n = 1024;
        assert_relative_eq!(dbfs((n as f64).sqrt(), n), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_dbfs_floor() {
        assert_eq!(dbfs(0.0, 1024), -120.0);
        assert_eq!(dbfs(1e-10, 1024), -120.0);
    }

    #[test]
    fn test_display_freq_units() {
        assert_eq!(display_freq(935_200_000.0), "+935MHz");
        assert_eq!(display_freq(-67_700.0), "-68kHz");
        assert_eq!(display_freq(250.0), "+250Hz");
        assert_eq!(display_freq(-3.0), "-3Hz");
    }
}
