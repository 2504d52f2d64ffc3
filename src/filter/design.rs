//! FIR filter design matching MNE / `scipy.signal.firwin`.
//!
//! Every filter is a Hamming-windowed sinc with odd length:
//!   • low transition bandwidth  = min(max(0.25 * l_freq, 2.0), l_freq)
//!   • high transition bandwidth = min(max(0.25 * h_freq, 2.0), nyquist - h_freq)
//!   • filter length N           = ceil(3.3 / min(trans_bw) * sfreq), rounded to odd
//!   • cutoffs sit in the middle of each transition band
//!
//! Band-pass and band-stop responses are built by combining lowpass
//! prototypes of the same length.
use std::f64::consts::PI;

use anyhow::Result;

use crate::error::PipelineError;

/// MNE transition bandwidth for a highpass edge at `l_freq`.
pub fn auto_trans_bandwidth(l_freq: f64) -> f64 {
    (0.25 * l_freq).max(2.0).min(l_freq)
}

/// MNE transition bandwidth for a lowpass edge at `h_freq`.
pub fn auto_trans_bandwidth_high(h_freq: f64, sfreq: f64) -> f64 {
    (0.25 * h_freq).max(2.0).min(sfreq / 2.0 - h_freq)
}

/// Number of FIR taps for a given transition bandwidth.
/// Returns an odd integer (required for zero-phase linear-phase FIR).
///
/// Formula: `ceil(3.3 / trans_bw * sfreq)` rounded up to odd.
pub fn auto_filter_length(trans_bw: f64, sfreq: f64) -> usize {
    let n_raw = (3.3 / trans_bw * sfreq).ceil() as usize;
    if n_raw % 2 == 0 { n_raw + 1 } else { n_raw }
}

fn check_edge(freq: f64, sfreq: f64) -> Result<()> {
    let nyquist = sfreq / 2.0;
    if freq <= 0.0 || freq >= nyquist {
        return Err(PipelineError::AboveNyquist { freq, nyquist }.into());
    }
    Ok(())
}

/// Zero-phase highpass FIR at `l_freq`.
///
/// Matches `mne.filter.create_filter(None, sfreq, l_freq=l_freq, h_freq=None,
///   filter_length='auto', fir_window='hamming', fir_design='firwin', phase='zero')`.
pub fn design_highpass(l_freq: f64, sfreq: f64) -> Result<Vec<f64>> {
    check_edge(l_freq, sfreq)?;
    let trans_bw = auto_trans_bandwidth(l_freq);
    let n = auto_filter_length(trans_bw, sfreq);
    Ok(firwin(n, l_freq - trans_bw / 2.0, sfreq, false))
}

/// Zero-phase lowpass FIR at `h_freq`.
pub fn design_lowpass(h_freq: f64, sfreq: f64) -> Result<Vec<f64>> {
    check_edge(h_freq, sfreq)?;
    let trans_bw = auto_trans_bandwidth_high(h_freq, sfreq);
    let n = auto_filter_length(trans_bw, sfreq);
    Ok(firwin(n, h_freq + trans_bw / 2.0, sfreq, true))
}

/// Zero-phase band-pass FIR passing `[l_freq, h_freq]`.
pub fn design_bandpass(l_freq: f64, h_freq: f64, sfreq: f64) -> Result<Vec<f64>> {
    check_edge(l_freq, sfreq)?;
    check_edge(h_freq, sfreq)?;
    let l_tb = auto_trans_bandwidth(l_freq);
    let h_tb = auto_trans_bandwidth_high(h_freq, sfreq);
    let n = auto_filter_length(l_tb.min(h_tb), sfreq);
    let hi = firwin(n, h_freq + h_tb / 2.0, sfreq, true);
    let lo = firwin(n, l_freq - l_tb / 2.0, sfreq, true);
    Ok(hi.iter().zip(&lo).map(|(a, b)| a - b).collect())
}

/// Zero-phase notch filter removing every frequency in `freqs`.
///
/// Each notch spans `f ± f/400` with a 0.5 Hz transition on each side, the
/// defaults of `mne.filter.notch_filter(method='fir')`. All notches share
/// one impulse response.
pub fn design_notch(freqs: &[f64], sfreq: f64) -> Result<Vec<f64>> {
    const TRANS_BW: f64 = 1.0;
    let half_tb = TRANS_BW / 2.0;
    let n = auto_filter_length(half_tb, sfreq);
    let mut h = vec![0.0; n];
    h[n / 2] = 1.0;
    for &f in freqs {
        let width = f / 200.0;
        let (lo, hi) = (f - width / 2.0, f + width / 2.0);
        check_edge(lo, sfreq)?;
        check_edge(hi + half_tb, sfreq)?;
        let upper = firwin(n, hi + half_tb / 2.0, sfreq, true);
        let lower = firwin(n, lo - half_tb / 2.0, sfreq, true);
        for ((v, a), b) in h.iter_mut().zip(&upper).zip(&lower) {
            *v -= a - b;
        }
    }
    Ok(h)
}

/// Dispatch like `mne.filter.filter_data`: highpass, lowpass or band-pass
/// depending on which edges are given. `None` when both are absent.
pub fn design(l_freq: Option<f64>, h_freq: Option<f64>, sfreq: f64) -> Result<Option<Vec<f64>>> {
    Ok(match (l_freq, h_freq) {
        (Some(l), Some(h)) => Some(design_bandpass(l, h, sfreq)?),
        (Some(l), None) => Some(design_highpass(l, sfreq)?),
        (None, Some(h)) => Some(design_lowpass(h, sfreq)?),
        (None, None) => None,
    })
}

/// Lowpass windowed-sinc prototype (or its spectral inverse).
///
/// `pass_zero=true` means the DC component passes (lowpass).
/// `cutoff_hz` is the -6 dB point.
pub fn firwin(n: usize, cutoff_hz: f64, sfreq: f64, pass_zero: bool) -> Vec<f64> {
    debug_assert!(n % 2 == 1, "firwin requires odd N for linear-phase filter");
    let alpha = (n - 1) as f64 / 2.0;
    let fc = cutoff_hz / (sfreq / 2.0);

    let win = hamming(n);

    let mut h: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - alpha;
            // f(x) = sin(π·fc·x) / (π·x);  lim_{x→0} f(x) = fc
            let sinc = if x == 0.0 { fc } else { (PI * fc * x).sin() / (PI * x) };
            sinc * win[i]
        })
        .collect();

    // Unit DC gain.
    let s: f64 = h.iter().sum();
    h.iter_mut().for_each(|v| *v /= s);

    if !pass_zero {
        h.iter_mut().for_each(|v| *v = -*v);
        h[n / 2] += 1.0;
    }

    h
}

/// Hamming window of length `n`.
pub fn hamming(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Magnitude of the frequency response of `h` at `freq`.
pub fn gain_at(h: &[f64], freq: f64, sfreq: f64) -> f64 {
    let w = 2.0 * PI * freq / sfreq;
    let (re, im) = h.iter().enumerate().fold((0.0, 0.0), |(re, im), (k, &v)| {
        (re + v * (w * k as f64).cos(), im - v * (w * k as f64).sin())
    });
    (re * re + im * im).sqrt()
}
