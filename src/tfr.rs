//! Time-frequency power of epoched data.
//!
//! Both methods convolve every epoch and channel with a family of complex
//! wavelets (one per frequency, `"same"` alignment) through the FFT and
//! average `|·|²` over tapers and epochs:
//!
//! - **multitaper**: for frequency `f`, a window of `n_cycles / f` seconds,
//!   a centred complex exponential tapered by each of the
//!   `floor(time_bandwidth − 1)` DPSS tapers;
//! - **morlet**: a Gaussian-windowed complex exponential with
//!   `σ_t = n_cycles / (2π f)`, truncated at ±5 σ_t.
//!
//! Wavelets are zero-mean and scaled to `‖w‖ = √2`.
use std::f64::consts::PI;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use ndarray::{s, Array2, Array3, Axis};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::config::TfrMethod;
use crate::epoch::Epochs;
use crate::io::{StReader, StWriter};
use crate::recording::{ChannelKind, RecordingInfo};
use crate::spectrum::dpss;

/// Averaged power, `[C, F, T]`.
#[derive(Debug, Clone)]
pub struct Tfr {
    pub info: RecordingInfo,
    pub data: Array3<f64>,
    pub freqs: Vec<f64>,
    pub times: Vec<f64>,
    pub nave: usize,
    pub method: TfrMethod,
    pub comment: String,
}

/// Parameters of [`tfr_power`].
#[derive(Debug, Clone)]
pub struct TfrParams {
    pub method: TfrMethod,
    pub freqs: Vec<f64>,
    pub n_cycles: Vec<f64>,
    pub time_bandwidth: f64,
    pub decim: usize,
    pub picks: ChannelKind,
}

fn normalise(mut w: Vec<Complex<f64>>) -> Vec<Complex<f64>> {
    let n = w.len() as f64;
    let mean = w.iter().sum::<Complex<f64>>() / n;
    w.iter_mut().for_each(|v| *v -= mean);
    let norm = w.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
    let scale = 1.0 / (0.5f64.sqrt() * norm);
    w.iter_mut().for_each(|v| *v *= scale);
    w
}

/// Morlet wavelet for one frequency.
pub fn morlet(sfreq: f64, freq: f64, n_cycles: f64) -> Vec<Complex<f64>> {
    let sigma_t = n_cycles / (2.0 * PI * freq);
    let half = (5.0 * sigma_t * sfreq).floor() as i64;
    let w = (-half..=half)
        .map(|i| {
            let t = i as f64 / sfreq;
            let gauss = (-t * t / (2.0 * sigma_t * sigma_t)).exp();
            Complex::from_polar(gauss, 2.0 * PI * freq * t)
        })
        .collect();
    normalise(w)
}

/// DPSS-tapered wavelets for one frequency, one per taper.
pub fn multitaper_wavelets(sfreq: f64, freq: f64, n_cycles: f64, time_bandwidth: f64) -> Result<Vec<Vec<Complex<f64>>>> {
    let n_taps = (time_bandwidth - 1.0).floor();
    if n_taps < 1.0 {
        bail!("time_bandwidth {time_bandwidth} leaves no taper (need at least 2)");
    }
    let t_win = n_cycles / freq;
    let n = (t_win * sfreq).ceil() as usize;
    let tapers = dpss(n, time_bandwidth / 2.0, n_taps as usize)?;
    Ok(tapers
        .rows()
        .into_iter()
        .map(|taper| {
            let w = (0..n)
                .map(|i| {
                    let t = i as f64 / sfreq - t_win / 2.0;
                    Complex::from_polar(taper[i], 2.0 * PI * freq * t)
                })
                .collect();
            normalise(w)
        })
        .collect())
}

/// Average power of `epochs` on the channels of `params.picks`.
pub fn tfr_power(epochs: &Epochs, params: &TfrParams, comment: &str) -> Result<Tfr> {
    if params.freqs.len() != params.n_cycles.len() {
        bail!("{} frequencies but {} n_cycles values", params.freqs.len(), params.n_cycles.len());
    }
    if epochs.is_empty() {
        bail!("no epochs to decompose ({comment})");
    }
    let picks = epochs.info.picks(&[params.picks], true);
    if picks.is_empty() {
        bail!("no {} channels in the epochs", params.picks);
    }
    let sfreq = epochs.sfreq();
    let n_t = epochs.n_times();

    // wavelets[f] = one wavelet per taper
    let mut wavelets = Vec::with_capacity(params.freqs.len());
    for (&f, &nc) in params.freqs.iter().zip(&params.n_cycles) {
        let ws = match params.method {
            TfrMethod::Multitaper => multitaper_wavelets(sfreq, f, nc, params.time_bandwidth)?,
            TfrMethod::Morlet => vec![morlet(sfreq, f, nc)],
        };
        if ws[0].len() > n_t {
            bail!("the {f} Hz wavelet ({} samples) is longer than the epochs ({n_t} samples)", ws[0].len());
        }
        wavelets.push(ws);
    }
    let max_len = wavelets.iter().map(|ws| ws[0].len()).max().unwrap_or(1);
    let nfft = (n_t + max_len - 1).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let fwd = planner.plan_fft_forward(nfft);
    let inv = planner.plan_fft_inverse(nfft);

    let spectra: Vec<Vec<(usize, Vec<Complex<f64>>)>> = wavelets
        .iter()
        .map(|ws| {
            ws.iter()
                .map(|w| {
                    let mut buf = vec![Complex::default(); nfft];
                    buf[..w.len()].copy_from_slice(w);
                    fwd.process(&mut buf);
                    (w.len(), buf)
                })
                .collect()
        })
        .collect();

    let decim = params.decim.max(1);
    let out_t: Vec<usize> = (0..n_t).step_by(decim).collect();
    let mut power = Array3::<f64>::zeros((picks.len(), params.freqs.len(), out_t.len()));
    let mut sig = vec![Complex::default(); nfft];
    let mut prod = vec![Complex::default(); nfft];
    let scale = 1.0 / nfft as f64;

    for e in 0..epochs.len() {
        for (ci, &c) in picks.iter().enumerate() {
            sig.iter_mut().for_each(|v| *v = Complex::default());
            for (t, v) in epochs.data.slice(s![e, c, ..]).iter().enumerate() {
                sig[t] = Complex::new(*v, 0.0);
            }
            fwd.process(&mut sig);
            for (fi, tapers) in spectra.iter().enumerate() {
                let n_taps = tapers.len() as f64;
                for (w_len, w_spec) in tapers {
                    for ((p, a), b) in prod.iter_mut().zip(&sig).zip(w_spec) {
                        *p = a * b;
                    }
                    inv.process(&mut prod);
                    let offset = (w_len - 1) / 2;
                    for (k, &t) in out_t.iter().enumerate() {
                        power[[ci, fi, k]] += (prod[t + offset] * scale).norm_sqr() / n_taps;
                    }
                }
            }
        }
    }
    power /= epochs.len() as f64;
    debug!("tfr {comment}: {:?}", power.dim());

    let info = epochs.info.pick(&picks);
    let times = out_t.iter().map(|&t| epochs.tmin + t as f64 / sfreq).collect();
    info!(
        "{comment}: {} power over {} epochs, {}–{} Hz",
        match params.method {
            TfrMethod::Multitaper => "multitaper",
            TfrMethod::Morlet => "morlet",
        },
        epochs.len(),
        params.freqs.first().copied().unwrap_or(0.0),
        params.freqs.last().copied().unwrap_or(0.0)
    );
    Ok(Tfr {
        info,
        data: power,
        freqs: params.freqs.clone(),
        times,
        nave: epochs.len(),
        method: params.method,
        comment: comment.to_string(),
    })
}

impl Tfr {
    /// Percent change relative to the mean power in `[b0, b1]` seconds, per
    /// channel and frequency.
    pub fn apply_baseline_percent(&mut self, b0: f64, b1: f64) -> Result<()> {
        let idx: Vec<usize> = (0..self.times.len()).filter(|&i| self.times[i] >= b0 && self.times[i] <= b1).collect();
        if idx.is_empty() {
            bail!("baseline [{b0}, {b1}] s contains no time points");
        }
        for mut row in self.data.lanes_mut(Axis(2)) {
            let mean = idx.iter().map(|&i| row[i]).sum::<f64>() / idx.len() as f64;
            if mean > 0.0 {
                row.mapv_inplace(|v| (v - mean) / mean);
            }
        }
        Ok(())
    }

    /// Channel average, `[F, T]`.
    pub fn channel_mean(&self) -> Array2<f64> {
        self.data.mean_axis(Axis(0)).unwrap_or_else(|| Array2::zeros((self.freqs.len(), self.times.len())))
    }
}

#[derive(Serialize, Deserialize)]
struct TfrMeta {
    info: RecordingInfo,
    freqs: Vec<f64>,
    times: Vec<f64>,
    nave: usize,
    method: TfrMethod,
    comment: String,
}

/// Write several TFRs (one per condition) into one file.
pub fn save_tfrs(path: &Path, tfrs: &[Tfr]) -> Result<()> {
    let mut w = StWriter::new();
    let mut meta = Vec::with_capacity(tfrs.len());
    for (i, t) in tfrs.iter().enumerate() {
        w.add_array(&format!("power_{i}"), &t.data);
        meta.push(TfrMeta {
            info: t.info.clone(),
            freqs: t.freqs.clone(),
            times: t.times.clone(),
            nave: t.nave,
            method: t.method,
            comment: t.comment.clone(),
        });
    }
    w.add_meta("tfrs", &meta)?;
    w.write(path).with_context(|| format!("writing TFR file {}", path.display()))
}

pub fn load_tfrs(path: &Path) -> Result<Vec<Tfr>> {
    let r = StReader::open(path).with_context(|| format!("reading TFR file {}", path.display()))?;
    let meta: Vec<TfrMeta> = r.meta("tfrs")?;
    meta.into_iter()
        .enumerate()
        .map(|(i, m)| {
            Ok(Tfr {
                data: r.array3(&format!("power_{i}"))?,
                info: m.info,
                freqs: m.freqs,
                times: m.times,
                nave: m.nave,
                method: m.method,
                comment: m.comment,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::ChannelInfo;
    use std::collections::BTreeMap;

    fn sine_epochs(freq: f64) -> Epochs {
        let sfreq = 200.0;
        let info = RecordingInfo::new(
            sfreq,
            vec![ChannelInfo::new("MEG0112", ChannelKind::Grad), ChannelInfo::new("MEG0111", ChannelKind::Mag)],
        );
        let n_t = 400;
        let data = Array3::from_shape_fn((3, 2, n_t), |(e, _, t)| {
            (2.0 * PI * freq * t as f64 / sfreq + e as f64).sin()
        });
        Epochs { info, data, events: Vec::new(), event_id: BTreeMap::new(), tmin: -1.0, drop_log: Vec::new(), metadata: None }
    }

    fn params(method: TfrMethod) -> TfrParams {
        let freqs: Vec<f64> = (4..=30).step_by(2).map(f64::from).collect();
        TfrParams {
            method,
            n_cycles: freqs.iter().map(|f| f / 2.0).collect(),
            freqs,
            time_bandwidth: 4.0,
            decim: 2,
            picks: ChannelKind::Grad,
        }
    }

    fn peak_freq(tfr: &Tfr) -> f64 {
        let mid = tfr.times.len() / 2;
        let col = tfr.data.slice(s![0, .., mid]);
        let best = (0..col.len()).max_by(|&a, &b| col[a].total_cmp(&col[b])).unwrap();
        tfr.freqs[best]
    }

    #[test]
    fn wavelets_are_normalised() {
        let w = morlet(200.0, 10.0, 5.0);
        let energy: f64 = w.iter().map(|v| v.norm_sqr()).sum();
        approx::assert_abs_diff_eq!(energy, 2.0, epsilon = 1e-9);
        let tapers = multitaper_wavelets(200.0, 10.0, 5.0, 4.0).unwrap();
        assert_eq!(tapers.len(), 3);
        assert_eq!(tapers[0].len(), 100);
    }

    #[test]
    fn power_peaks_at_signal_frequency() {
        for method in [TfrMethod::Multitaper, TfrMethod::Morlet] {
            let mut p = params(method);
            // a single taper keeps the spectral window peaked at its centre
            p.time_bandwidth = 2.0;
            let tfr = tfr_power(&sine_epochs(12.0), &p, "sine").unwrap();
            assert_eq!(tfr.data.dim(), (1, 14, 200));
            assert_eq!(tfr.nave, 3);
            assert_eq!(peak_freq(&tfr), 12.0);
        }
    }

    #[test]
    fn percent_baseline_is_zero_on_stationary_power() {
        let mut tfr = tfr_power(&sine_epochs(12.0), &params(TfrMethod::Morlet), "sine").unwrap();
        tfr.apply_baseline_percent(-0.3, -0.1).unwrap();
        let fi = tfr.freqs.iter().position(|&f| f == 12.0).unwrap();
        let mid = tfr.times.len() / 2;
        approx::assert_abs_diff_eq!(tfr.data[[0, fi, mid]], 0.0, epsilon = 0.05);
    }

    #[test]
    fn wavelet_longer_than_epoch_is_an_error() {
        let mut p = params(TfrMethod::Morlet);
        p.freqs = vec![1.0];
        p.n_cycles = vec![10.0];
        assert!(tfr_power(&sine_epochs(12.0), &p, "x").is_err());
    }
}
