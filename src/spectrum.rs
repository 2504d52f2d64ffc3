//! Spectral estimation: Welch PSD, analytic-signal envelope and DPSS tapers.
use std::f64::consts::PI;

use anyhow::{bail, Result};
use ndarray::{Array1, Array2};
use rustfft::{num_complex::Complex, FftPlanner};

use crate::linalg::eigh;

/// Periodic Hann window (`scipy.signal.get_window('hann', n)`).
pub fn hann(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos()).collect()
}

/// One-sided Welch power spectral density of every row of `data`.
///
/// Segments of `n_per_seg` samples (clamped to the signal length), 50 %
/// overlap, Hann window, per-segment mean removed, density scaling.
/// Returns `(freqs, psd[C, F])` with `F = n_per_seg / 2 + 1`.
pub fn welch(data: &Array2<f64>, sfreq: f64, n_per_seg: usize) -> Result<(Vec<f64>, Array2<f64>)> {
    let n_t = data.ncols();
    if n_t < 2 {
        bail!("welch: need at least 2 samples, got {n_t}");
    }
    let n_seg = n_per_seg.clamp(2, n_t);
    let step = (n_seg / 2).max(1);
    let win = hann(n_seg);
    let win_pow: f64 = win.iter().map(|w| w * w).sum();
    let n_freq = n_seg / 2 + 1;
    let freqs: Vec<f64> = (0..n_freq).map(|k| k as f64 * sfreq / n_seg as f64).collect();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n_seg);
    let mut psd = Array2::<f64>::zeros((data.nrows(), n_freq));
    let starts: Vec<usize> = (0..=n_t - n_seg).step_by(step).collect();
    let mut buf = vec![Complex::default(); n_seg];

    for (c, row) in data.rows().into_iter().enumerate() {
        for &s in &starts {
            let seg = row.slice(ndarray::s![s..s + n_seg]);
            let mean = seg.sum() / n_seg as f64;
            for ((b, &x), &w) in buf.iter_mut().zip(seg.iter()).zip(&win) {
                *b = Complex { re: (x - mean) * w, im: 0.0 };
            }
            fft.process(&mut buf);
            for k in 0..n_freq {
                let mut p = buf[k].norm_sqr() / (sfreq * win_pow);
                let nyquist_bin = n_seg % 2 == 0 && k == n_seg / 2;
                if k != 0 && !nyquist_bin {
                    p *= 2.0;
                }
                psd[[c, k]] += p;
            }
        }
    }
    psd.mapv_inplace(|v| v / starts.len() as f64);
    Ok((freqs, psd))
}

/// Sum of PSD bins with `lo < f <= hi` for each row.
pub fn band_power(freqs: &[f64], psd: &Array2<f64>, lo: f64, hi: f64) -> Array1<f64> {
    let bins: Vec<usize> = (0..freqs.len()).filter(|&k| freqs[k] > lo && freqs[k] <= hi).collect();
    Array1::from_iter(psd.rows().into_iter().map(|r| bins.iter().map(|&k| r[k]).sum::<f64>()))
}

/// Amplitude envelope `|x + i·H(x)|` of a real signal.
pub fn hilbert_envelope(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::<f64>::new();
    let mut buf: Vec<Complex<f64>> = x.iter().map(|&v| Complex { re: v, im: 0.0 }).collect();
    planner.plan_fft_forward(n).process(&mut buf);
    // h = [1, 2, …, 2, (1 at Nyquist for even n), 0, …]
    for (k, b) in buf.iter_mut().enumerate() {
        let h = if k == 0 || (n % 2 == 0 && k == n / 2) {
            1.0
        } else if k < n.div_ceil(2) {
            2.0
        } else {
            0.0
        };
        *b *= h;
    }
    planner.plan_fft_inverse(n).process(&mut buf);
    buf.iter().map(|c| c.norm() / n as f64).collect()
}

/// Discrete prolate spheroidal sequences: `k` tapers of length `n` with
/// half-bandwidth `half_nbw` (= time-bandwidth / 2).
///
/// Eigenvectors of the tridiagonal commuting matrix, unit energy, signs
/// fixed like `scipy.signal.windows.dpss` (symmetric tapers have positive
/// sum, antisymmetric tapers start positive). Returns `[k, n]`.
pub fn dpss(n: usize, half_nbw: f64, k: usize) -> Result<Array2<f64>> {
    if k == 0 || k > n {
        bail!("dpss: cannot build {k} tapers of length {n}");
    }
    let w = half_nbw / n as f64;
    let mut m = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        let d = (n as f64 - 1.0 - 2.0 * i as f64) / 2.0;
        m[[i, i]] = d * d * (2.0 * PI * w).cos();
        if i + 1 < n {
            let off = (i + 1) as f64 * (n - i - 1) as f64 / 2.0;
            m[[i, i + 1]] = off;
            m[[i + 1, i]] = off;
        }
    }
    let (_, vecs) = eigh(&m)?;
    let mut tapers = Array2::<f64>::zeros((k, n));
    for j in 0..k {
        let mut v = vecs.column(j).to_owned();
        let norm = v.dot(&v).sqrt();
        v.mapv_inplace(|x| x / norm);
        let flip = if j % 2 == 0 {
            v.sum() < 0.0
        } else {
            v.iter().find(|x| x.abs() > 1e-10 * norm).is_some_and(|&x| x < 0.0)
        };
        if flip {
            v.mapv_inplace(|x| -x);
        }
        tapers.row_mut(j).assign(&v);
    }
    Ok(tapers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(freq: f64, amp: f64, sfreq: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| amp * (2.0 * PI * freq * i as f64 / sfreq).sin()).collect()
    }

    #[test]
    fn welch_peak_and_parseval() {
        let sfreq = 256.0;
        let x = sine(32.0, 2.0, sfreq, 4096);
        let data = Array2::from_shape_vec((1, 4096), x).unwrap();
        let (freqs, psd) = welch(&data, sfreq, 256).unwrap();
        let peak = (0..freqs.len()).max_by(|&a, &b| psd[[0, a]].total_cmp(&psd[[0, b]])).unwrap();
        assert_abs_diff_eq!(freqs[peak], 32.0);
        // Integrated power equals the signal variance (amp² / 2).
        let df = freqs[1] - freqs[0];
        let total: f64 = psd.row(0).sum() * df;
        assert_abs_diff_eq!(total, 2.0, epsilon = 0.05);
    }

    #[test]
    fn band_power_selects_half_open_band() {
        let freqs = vec![0.0, 25.0, 50.0, 75.0, 100.0];
        let psd = Array2::from_shape_vec((1, 5), vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(band_power(&freqs, &psd, 0.0, 50.0)[0], 5.0);
        assert_eq!(band_power(&freqs, &psd, 50.0, 100.0)[0], 9.0);
    }

    #[test]
    fn envelope_of_sine_is_amplitude() {
        let x = sine(10.0, 3.0, 1000.0, 1000);
        let env = hilbert_envelope(&x);
        for &e in &env[100..900] {
            assert_abs_diff_eq!(e, 3.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn dpss_orthonormal_and_signed() {
        let t = dpss(128, 2.0, 3).unwrap();
        let g = t.dot(&t.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(g[[i, j]], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-8);
            }
        }
        assert!(t.row(0).sum() > 0.0);
        // First taper is symmetric and peaks in the middle.
        assert_abs_diff_eq!(t[[0, 10]], t[[0, 117]], epsilon = 1e-8);
        assert!(t[[0, 64]] > t[[0, 5]]);
    }
}
