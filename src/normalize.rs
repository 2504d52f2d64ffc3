//! Z-scores, robust statistics and epoch baseline correction.
//!
//! `zscore` uses the population standard deviation (`ddof = 0`) like
//! `scipy.stats.zscore`. `robust_zscore` replaces mean/std by median and
//! `1.4826 · MAD`, the scale that matches the standard deviation for
//! Gaussian data.
use ndarray::{s, Array3};

/// Median of `x` (sorted in place). NaNs sort last. Empty input gives NaN.
pub fn median(x: &mut [f64]) -> f64 {
    percentile(x, 50.0)
}

/// Linear-interpolation percentile (`numpy.percentile` default), `q` in
/// `[0, 100]`. Sorts `x` in place.
pub fn percentile(x: &mut [f64], q: f64) -> f64 {
    let n = x.len();
    if n == 0 {
        return f64::NAN;
    }
    x.sort_by(|a, b| a.total_cmp(b));
    let pos = q / 100.0 * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    x[lo] + (x[hi] - x[lo]) * (pos - lo as f64)
}

/// Interquartile range.
pub fn iqr(x: &[f64]) -> f64 {
    let mut v = x.to_vec();
    percentile(&mut v, 75.0) - percentile(&mut v, 25.0)
}

pub fn mean_std(x: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// `(x - mean) / std`; a constant input maps to zeros.
pub fn zscore(x: &[f64]) -> Vec<f64> {
    let (mean, std) = mean_std(x);
    if std > 0.0 {
        x.iter().map(|&v| (v - mean) / std).collect()
    } else {
        vec![0.0; x.len()]
    }
}

/// `(x - median) / (1.4826 · MAD)`. When the MAD is zero the IQR-based
/// scale is tried, then the plain standard deviation; constant input maps to
/// zeros.
pub fn robust_zscore(x: &[f64]) -> Vec<f64> {
    let mut v = x.to_vec();
    let med = median(&mut v);
    let mut dev: Vec<f64> = x.iter().map(|&a| (a - med).abs()).collect();
    let mut scale = 1.4826 * median(&mut dev);
    if !(scale > 0.0) {
        scale = iqr(x) / 1.349;
    }
    if !(scale > 0.0) {
        scale = mean_std(x).1;
    }
    if !(scale > 0.0) {
        return vec![0.0; x.len()];
    }
    x.iter().map(|&a| (a - med) / scale).collect()
}

/// Per-channel, per-epoch baseline correction over the sample range
/// `[start, stop)`: `epoch[e, c, :] -= mean(epoch[e, c, start..stop])`.
pub fn baseline_correct_inplace(epochs: &mut Array3<f64>, start: usize, stop: usize) {
    let (n_e, n_c, n_t) = epochs.dim();
    let stop = stop.min(n_t);
    if start >= stop {
        return;
    }
    for e in 0..n_e {
        for c in 0..n_c {
            let m = epochs.slice(s![e, c, start..stop]).mean().unwrap_or(0.0);
            epochs.slice_mut(s![e, c, ..]).mapv_inplace(|v| v - m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn zscore_mean_zero_std_one() {
        let x: Vec<f64> = (0..512).map(|t| (t as f64 * 0.1).sin() * 50.0 + 3.0).collect();
        let z = zscore(&x);
        let (m, s) = mean_std(&z);
        approx::assert_abs_diff_eq!(m, 0.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(s, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn zscore_constant_signal_no_panic() {
        assert_eq!(zscore(&[7.0; 16]), vec![0.0; 16]);
        assert_eq!(robust_zscore(&[7.0; 16]), vec![0.0; 16]);
    }

    #[test]
    fn percentile_matches_numpy() {
        let mut x = vec![4.0, 1.0, 3.0, 2.0];
        approx::assert_abs_diff_eq!(percentile(&mut x, 25.0), 1.75);
        approx::assert_abs_diff_eq!(median(&mut x), 2.5);
        approx::assert_abs_diff_eq!(iqr(&[1.0, 2.0, 3.0, 4.0]), 1.5);
    }

    #[test]
    fn robust_zscore_flags_outlier_only() {
        let mut x: Vec<f64> = (0..31).map(|i| 1.0 + 0.01 * (i % 7) as f64).collect();
        x[5] = 10.0;
        let z = robust_zscore(&x);
        assert!(z[5] > 100.0);
        assert!(z.iter().enumerate().filter(|(i, _)| *i != 5).all(|(_, v)| v.abs() < 3.0));
    }

    #[test]
    fn baseline_removes_window_mean() {
        let mut epochs = Array3::from_shape_fn((3, 4, 100), |(e, c, t)| {
            e as f64 * 10.0 + c as f64 * 5.0 + if t < 20 { 1.0 } else { 2.0 }
        });
        baseline_correct_inplace(&mut epochs, 0, 20);
        for e in 0..3 {
            for c in 0..4 {
                approx::assert_abs_diff_eq!(epochs[[e, c, 0]], 0.0, epsilon = 1e-12);
                approx::assert_abs_diff_eq!(epochs[[e, c, 50]], 1.0, epsilon = 1e-12);
            }
        }
    }
}
