//! Band-limited resampling in the frequency domain.
//!
//! Each row is padded by odd reflection, transformed, its spectrum truncated
//! (downsampling) or zero-extended (upsampling) to the new padded length,
//! transformed back and stripped of the resampled padding. An even-length
//! Nyquist bin is doubled when truncating and halved when extending, the
//! convention of `mne.filter.resample(method='fft')`.
use std::sync::Arc;

use anyhow::{ensure, Result};
use log::debug;
use ndarray::{Array2, ArrayView1};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::recording::{ChannelKind, Recording};

/// Padding on each side: enough to reach the next power of two after adding
/// at least `2·min(n/8, 100)` samples.
pub fn auto_npad(n: usize) -> (usize, usize) {
    let min_add = (n / 8).min(100) * 2;
    let total = (n + min_add).next_power_of_two() - n;
    (total / 2, total - total / 2)
}

/// Plans and lengths for resampling signals of one length by one ratio.
struct FftResampler {
    ratio: f64,
    n_in: usize,
    pad: (usize, usize),
    old_len: usize,
    new_len: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl FftResampler {
    fn new(n_in: usize, ratio: f64, npad: (usize, usize)) -> Self {
        let pad = (npad.0.min(n_in - 1), npad.1.min(n_in - 1));
        let old_len = n_in + pad.0 + pad.1;
        let new_len = (ratio * old_len as f64).round() as usize;
        let mut planner = FftPlanner::<f64>::new();
        Self {
            ratio,
            n_in,
            pad,
            old_len,
            new_len,
            forward: planner.plan_fft_forward(old_len),
            inverse: planner.plan_fft_inverse(new_len),
        }
    }

    fn final_len(&self) -> usize {
        (self.ratio * self.n_in as f64).round() as usize
    }

    fn apply(&self, x: &[f64]) -> Vec<f64> {
        let (pad_l, pad_r) = self.pad;
        let n = x.len();
        let (first, last) = (x[0], x[n - 1]);
        let mut spec: Vec<Complex<f64>> = (1..=pad_l)
            .rev()
            .map(|i| 2.0 * first - x[i])
            .chain(x.iter().copied())
            .chain((1..=pad_r).map(|i| 2.0 * last - x[n - 1 - i]))
            .map(|v| Complex::new(v, 0.0))
            .collect();
        self.forward.process(&mut spec);

        // keep the shared half-spectrum, rebuild the other half
        let half = self.new_len / 2 + 1;
        let keep = (self.old_len / 2 + 1).min(half);
        let mut out = vec![Complex::default(); self.new_len];
        out[..keep].copy_from_slice(&spec[..keep]);
        let use_len = self.new_len.min(self.old_len);
        if use_len % 2 == 0 && use_len / 2 < keep {
            out[use_len / 2] *= if self.new_len < self.old_len { 2.0 } else { 0.5 };
        }
        for i in 1..half {
            let j = self.new_len - i;
            if j >= half {
                out[j] = out[i].conj();
            }
        }
        self.inverse.process(&mut out);

        // irfft normalisation and the new/old length scale combine to 1/old_len
        let norm = 1.0 / self.old_len as f64;
        let skip = (self.ratio * pad_l as f64).round() as usize;
        let mut y: Vec<f64> = out.iter().skip(skip).take(self.final_len()).map(|c| c.re * norm).collect();
        y.resize(self.final_len(), 0.0);
        y
    }
}

/// Resample `data` ([C, T]) from `src_sfreq` to `dst_sfreq`.
pub fn resample(data: &Array2<f64>, src_sfreq: f64, dst_sfreq: f64) -> Result<Array2<f64>> {
    ensure!(src_sfreq > 0.0 && dst_sfreq > 0.0, "sampling rates must be positive");
    if (src_sfreq - dst_sfreq).abs() < 1e-6 || data.ncols() == 0 {
        return Ok(data.clone());
    }
    let rs = FftResampler::new(data.ncols(), dst_sfreq / src_sfreq, auto_npad(data.ncols()));
    let mut out = Array2::zeros((data.nrows(), rs.final_len()));
    for (ch, row) in data.rows().into_iter().enumerate() {
        let y = rs.apply(&row.to_vec());
        out.row_mut(ch).assign(&ArrayView1::from(&y));
    }
    Ok(out)
}

/// Stim channels are step functions: pick the source sample nearest each
/// output sample instead of band-limiting.
fn resample_stim(x: &[f64], ratio: f64, final_len: usize) -> Vec<f64> {
    (0..final_len)
        .map(|i| {
            let src = ((i as f64 / ratio).floor() as usize).min(x.len().saturating_sub(1));
            x.get(src).copied().unwrap_or(0.0)
        })
        .collect()
}

impl Recording {
    /// Copy resampled to `sfreq`. Annotation onsets are in seconds and stay
    /// valid; `first_samp` is rescaled.
    pub fn resampled(&self, sfreq: f64) -> Result<Recording> {
        let src = self.sfreq();
        if (src - sfreq).abs() < 1e-6 {
            return Ok(self.clone());
        }
        let ratio = sfreq / src;
        let mut data = resample(&self.data, src, sfreq)?;
        let final_len = data.ncols();
        for idx in self.picks(&[ChannelKind::Stim], false) {
            let row: Vec<f64> = self.data.row(idx).to_vec();
            let stim = resample_stim(&row, ratio, final_len);
            data.row_mut(idx).assign(&ArrayView1::from(&stim));
        }
        let mut info = self.info.clone();
        info.sfreq = sfreq;
        info.first_samp = (self.info.first_samp as f64 * ratio).round() as i64;
        debug!("resampled {} -> {} Hz ({} samples)", src, sfreq, final_len);
        Recording::new(info, data)
    }
}

/// Resample one signal by `ratio` with explicit padding on each side.
pub fn resample_1d(x: &[f64], ratio: f64, npad_l: usize, npad_r: usize) -> Result<Vec<f64>> {
    ensure!(ratio > 0.0, "resampling ratio must be positive");
    if x.is_empty() {
        return Ok(Vec::new());
    }
    Ok(FftResampler::new(x.len(), ratio, (npad_l, npad_r)).apply(x))
}
