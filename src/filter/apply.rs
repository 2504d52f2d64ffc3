//! Zero-phase FIR filtering of channel rows by FFT overlap-add.
//!
//! The linear convolution is computed block-wise and read back with a delay
//! of `(N-1)/2` samples, so odd-length linear-phase kernels introduce no
//! phase shift. Both ends of the signal are padded by `N-1` samples with an
//! odd reflection around the end value before filtering; that keeps offsets
//! and slow drifts from ringing at the edges.
use std::sync::Arc;

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// A kernel prepared for signals of one length: the FFT block size, the
/// kernel spectrum and both FFT plans are computed once and shared by every
/// channel filtered with it.
pub struct OverlapAdd {
    n_h: usize,
    n_fft: usize,
    spectrum: Vec<Complex<f64>>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl OverlapAdd {
    /// Prepare `h` (odd length) for signals of `n_times` samples.
    pub fn new(h: &[f64], n_times: usize) -> Result<Self> {
        ensure!(h.len() % 2 == 1, "FIR kernel must have odd length, got {}", h.len());
        let n_h = h.len();
        let n_fft = block_len(n_h, n_times + 2 * (n_h - 1));

        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(n_fft);
        let inverse = planner.plan_fft_inverse(n_fft);

        let mut spectrum = vec![Complex::default(); n_fft];
        for (s, &v) in spectrum.iter_mut().zip(h) {
            s.re = v;
        }
        forward.process(&mut spectrum);
        // fold the inverse-FFT normalisation into the kernel
        let scale = 1.0 / n_fft as f64;
        spectrum.iter_mut().for_each(|s| *s *= scale);

        Ok(Self { n_h, n_fft, spectrum, forward, inverse })
    }

    /// Filter one signal; the output has the length of `x`.
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        match x.len() {
            0 => return Vec::new(),
            1 => return vec![x[0] * self.dc_gain()],
            _ => {}
        }
        let edge = self.n_h - 1;
        let padded = odd_reflect_pad(x, edge);

        // full linear convolution of the padded signal
        let step = self.n_fft - self.n_h + 1;
        let mut conv = vec![0.0; padded.len() + self.n_h - 1];
        let mut buf = vec![Complex::default(); self.n_fft];
        for start in (0..padded.len()).step_by(step) {
            let block = &padded[start..(start + step).min(padded.len())];
            buf.iter_mut().for_each(|b| *b = Complex::default());
            for (b, &v) in buf.iter_mut().zip(block) {
                b.re = v;
            }
            self.forward.process(&mut buf);
            for (b, s) in buf.iter_mut().zip(&self.spectrum) {
                *b *= s;
            }
            self.inverse.process(&mut buf);
            let end = (start + self.n_fft).min(conv.len());
            for (c, b) in conv[start..end].iter_mut().zip(&buf) {
                *c += b.re;
            }
        }

        let delay = (self.n_h - 1) / 2;
        conv[edge + delay..edge + delay + x.len()].to_vec()
    }

    fn dc_gain(&self) -> f64 {
        // spectrum[0] is the scaled kernel sum
        self.spectrum[0].re * self.n_fft as f64
    }
}

/// Filter every row of `data` ([C, T]) in place.
pub fn apply_fir_zero_phase(data: &mut Array2<f64>, h: &[f64]) -> Result<()> {
    let rows: Vec<usize> = (0..data.nrows()).collect();
    apply_fir_rows(data, &rows, h)
}

/// Filter the listed rows of `data` in place; other rows are untouched.
pub fn apply_fir_rows(data: &mut Array2<f64>, rows: &[usize], h: &[f64]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let ola = OverlapAdd::new(h, data.ncols())?;
    for &ch in rows {
        let filtered = ola.apply(&data.row(ch).to_vec());
        data.row_mut(ch).assign(&ArrayView1::from(&filtered));
    }
    Ok(())
}

/// Filter a single signal.
pub fn filter_1d(x: &[f64], h: &[f64]) -> Result<Vec<f64>> {
    Ok(OverlapAdd::new(h, x.len())?.apply(x))
}

/// Pad `n` samples on each side, reflecting oddly around the end values:
/// `2·x[0] - x[i]` on the left, `2·x[last] - x[last-i]` on the right.
/// Positions further out than the signal is long are zero.
fn odd_reflect_pad(x: &[f64], n: usize) -> Vec<f64> {
    let len = x.len();
    let (first, last) = (x[0], x[len - 1]);
    let left = (1..=n).rev().map(|i| if i < len { 2.0 * first - x[i] } else { 0.0 });
    let right = (1..=n).map(|i| if i < len { 2.0 * last - x[len - 1 - i] } else { 0.0 });
    left.chain(x.iter().copied()).chain(right).collect()
}

/// Power-of-two FFT size for an `n_h` kernel over `n_x` samples, minimising
/// `blocks · N · (log2 N + 1) + 4e-5 · N · n_x`.
fn block_len(n_h: usize, n_x: usize) -> usize {
    let min_len = 2 * n_h - 1;
    let lo = min_len.next_power_of_two().trailing_zeros();
    let hi = n_x.next_power_of_two().trailing_zeros().max(lo) + 1;
    let cost = |pow: u32| {
        let n = (1usize << pow) as f64;
        let blocks = (n_x as f64 / (n - n_h as f64 + 1.0)).ceil();
        blocks * n * (pow as f64 + 1.0) + 4e-5 * n * n_x as f64
    };
    let best = (lo..=hi).min_by(|&a, &b| cost(a).total_cmp(&cost(b))).unwrap_or(hi);
    1 << best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::design::{design_highpass, design_lowpass};
    use std::f64::consts::PI;

    #[test]
    fn matches_direct_convolution() {
        let h = [0.25, 0.5, 0.25];
        let x = [1.0, 4.0, 2.0, 8.0, 5.0, 7.0];
        let y = filter_1d(&x, &h).unwrap();
        // interior samples only see real data
        for i in 1..x.len() - 1 {
            let want = 0.25 * x[i - 1] + 0.5 * x[i] + 0.25 * x[i + 1];
            approx::assert_abs_diff_eq!(y[i], want, epsilon = 1e-12);
        }
    }

    #[test]
    fn even_kernel_is_rejected() {
        assert!(filter_1d(&[1.0, 2.0, 3.0], &[0.5, 0.5]).is_err());
    }

    #[test]
    fn constant_survives_lowpass_up_to_the_edges() {
        let x = vec![3.0; 2000];
        let h = design_lowpass(40.0, 500.0).unwrap();
        let y = filter_1d(&x, &h).unwrap();
        assert!(y.iter().all(|v| (v - 3.0).abs() < 1e-3));
    }

    #[test]
    fn highpass_removes_offset() {
        let x = vec![1.0; 4096];
        let h = design_highpass(0.5, 256.0).unwrap();
        let y = filter_1d(&x, &h).unwrap();
        let peak = y.iter().map(|v| v.abs()).fold(0.0, f64::max);
        assert!(peak < 1e-3, "offset left: {peak}");
    }

    #[test]
    fn only_listed_rows_change() {
        let sfreq = 250.0;
        let mut data = Array2::from_shape_fn((2, 1000), |(_, t)| (2.0 * PI * 60.0 * t as f64 / sfreq).sin());
        let before = data.clone();
        let h = design_lowpass(20.0, sfreq).unwrap();
        apply_fir_rows(&mut data, &[1], &h).unwrap();
        assert_eq!(data.row(0), before.row(0));
        let peak = data.row(1).slice(ndarray::s![200..800]).iter().map(|v| v.abs()).fold(0.0, f64::max);
        assert!(peak < 0.01, "60 Hz passed the 20 Hz low-pass: {peak}");
    }

    #[test]
    fn pad_reflects_around_end_values() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let p = odd_reflect_pad(&x, 3);
        assert_eq!(&p[..3], &[-2.0, -1.0, 0.0]);
        assert_eq!(&p[3..8], &x);
        assert_eq!(&p[8..], &[6.0, 7.0, 8.0]);
    }
}
