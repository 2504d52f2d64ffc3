//! Bad EEG channel detection.
//!
//! [`find_bad_channels_eeg`] applies three threshold tests to an EEG-only
//! recording (deviation, correlation, noisiness; a simplified PREP
//! procedure). [`find_bad_eeg`] wraps it in the two-phase reference
//! estimation loop of stage 02:
//!
//! 1. Start from the per-sample channel median as reference. Detect bad
//!    channels on `original − reference`, interpolate the channels detected
//!    in this iteration, take the mean of the interpolated data as the new
//!    reference and repeat until an iteration finds nothing outside the
//!    accumulated set (or the cap is reached).
//! 2. Subtract the final reference from the original EEG, detect the true
//!    bad channels, interpolate them and apply an average reference.
use anyhow::Result;
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::config::BadEegConfig;
use crate::filter::{apply_fir_zero_phase, design_lowpass};
use crate::linalg::corrcoef;
use crate::normalize::{iqr, robust_zscore};
use crate::recording::{ChannelKind, Recording};
use crate::reference::{mean_reference, median_reference, subtract_reference};
use crate::spectrum::{band_power, welch};

/// Robust amplitude: IQR scaled to a Gaussian standard deviation.
const IQR_TO_SD: f64 = 0.7413;

/// Result of one detection pass. Names are in channel order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EegBadChannels {
    pub bads: Vec<String>,
    pub by_deviation: Vec<String>,
    pub by_correlation: Vec<String>,
    pub by_noise: Vec<String>,
    pub deviation_z: Vec<f64>,
    pub max_correlation: Vec<f64>,
    pub noise_z: Vec<f64>,
}

/// Detect bad channels in an EEG-only recording. `info.bads` is ignored:
/// every channel is scored.
pub fn find_bad_channels_eeg(eeg: &Recording, cfg: &BadEegConfig) -> Result<EegBadChannels> {
    let names = eeg.ch_names();
    let sfreq = eeg.sfreq();
    let data = &eeg.data;

    // deviation
    let amplitude: Vec<f64> = data.rows().into_iter().map(|r| IQR_TO_SD * iqr(&r.to_vec())).collect();
    let deviation_z = robust_zscore(&amplitude);

    // correlation, on low-passed data
    let mut lowpassed = data.clone();
    if cfg.split_freq < sfreq / 2.0 {
        let h = design_lowpass(cfg.split_freq, sfreq)?;
        apply_fir_zero_phase(&mut lowpassed, &h)?;
    }
    let corr = corrcoef(&lowpassed);
    let max_correlation: Vec<f64> = (0..names.len())
        .map(|i| {
            (0..names.len())
                .filter(|&j| j != i)
                .map(|j| corr[[i, j]].abs())
                .filter(|v| v.is_finite())
                .fold(0.0, f64::max)
        })
        .collect();

    // noisiness: high / low frequency power
    let n_per_seg = (sfreq.round() as usize).min(data.ncols());
    let (freqs, psd) = welch(data, sfreq, n_per_seg)?;
    let low = band_power(&freqs, &psd, 0.0, cfg.split_freq);
    let high = band_power(&freqs, &psd, cfg.split_freq, cfg.noise_max_freq);
    let ratio: Vec<f64> = low
        .iter()
        .zip(high.iter())
        .map(|(&l, &h)| if l > 0.0 { h / l } else { f64::INFINITY })
        .collect();
    let finite: Vec<f64> = ratio.iter().map(|&r| if r.is_finite() { r } else { 0.0 }).collect();
    let mut noise_z = robust_zscore(&finite);
    for (z, r) in noise_z.iter_mut().zip(&ratio) {
        if !r.is_finite() {
            *z = f64::INFINITY;
        }
    }

    let pick = |flags: &dyn Fn(usize) -> bool| -> Vec<String> {
        (0..names.len()).filter(|&i| flags(i)).map(|i| names[i].clone()).collect()
    };
    let by_deviation = pick(&|i| deviation_z[i].abs() > cfg.deviation_threshold);
    let by_correlation = pick(&|i| max_correlation[i] < cfg.correlation_threshold);
    let by_noise = pick(&|i| noise_z[i].abs() > cfg.noise_threshold);
    let bads = pick(&|i| {
        by_deviation.contains(&names[i])
            || by_correlation.contains(&names[i])
            || by_noise.contains(&names[i])
    });
    debug!(
        "deviation {:?}, correlation {:?}, noise {:?}",
        by_deviation, by_correlation, by_noise
    );
    Ok(EegBadChannels {
        bads,
        by_deviation,
        by_correlation,
        by_noise,
        deviation_z,
        max_correlation,
        noise_z,
    })
}

/// Outcome of the two-phase loop for one run.
#[derive(Debug, Clone)]
pub struct BadEegOutcome {
    /// Accumulated bad set of the reference loop.
    pub loop_bads: Vec<String>,
    /// Bad channels relative to the final reference; these were interpolated.
    pub true_bads: Vec<String>,
    /// Accumulated bad set after each iteration that found something new.
    pub history: Vec<Vec<String>>,
    pub iterations: usize,
    pub converged: bool,
    /// Reference removed from the EEG before phase 2, shape `[T]`.
    pub reference: Array1<f64>,
    pub detection: EegBadChannels,
}

fn referenced(original: &Array2<f64>, reference: &Array1<f64>) -> Array2<f64> {
    let mut d = original.clone();
    subtract_reference(&mut d, reference);
    d
}

/// Phase 1: estimate the reference by iterating detection and interpolation.
///
/// Returns `(reference, accumulated bads, history, iterations, converged)`.
fn estimate_reference(
    eeg: &Recording,
    cfg: &BadEegConfig,
) -> Result<(Array1<f64>, Vec<String>, Vec<Vec<String>>, usize, bool)> {
    let original = eeg.data.clone();
    let mut temp = eeg.clone();
    temp.data = referenced(&original, &median_reference(&original));

    let mut bads: Vec<String> = Vec::new();
    let mut history = Vec::new();
    let mut converged = false;
    let mut iterations = 0;
    for it in 0..cfg.max_iter {
        iterations = it + 1;
        let found = find_bad_channels_eeg(&temp, cfg)?.bads;
        let new: Vec<String> = found.iter().filter(|b| !bads.contains(b)).cloned().collect();
        if new.is_empty() {
            converged = true;
            break;
        }
        debug!("iteration {iterations}: new bad channels {new:?}");
        bads.extend(new);
        history.push(bads.clone());

        // only this iteration's detections are interpolated; earlier ones
        // come back from `original` unless detected again
        let mut interp = temp.clone();
        interp.info.bads = found;
        interp.interpolate_bads(true)?;
        temp.data = referenced(&original, &mean_reference(&interp.data));
    }
    if !converged {
        warn!(
            "bad-channel loop did not converge within {} iterations ({} channels flagged)",
            cfg.max_iter,
            bads.len()
        );
    }

    let mut marked = eeg.clone();
    marked.info.bads = bads.clone();
    marked.interpolate_bads(false)?;
    Ok((mean_reference(&marked.data), bads, history, iterations, converged))
}

/// Run both phases on `rec` in place: on return the true bad channels are
/// interpolated, the EEG is average-referenced and the bad list is empty.
pub fn find_bad_eeg(rec: &mut Recording, cfg: &BadEegConfig) -> Result<BadEegOutcome> {
    let mut eeg = rec.pick_kinds(&[ChannelKind::Eeg])?;
    eeg.info.bads.clear();

    let (reference, loop_bads, history, iterations, converged) = estimate_reference(&eeg, cfg)?;
    info!("reference loop: {} iterations, bad channels {:?}", iterations, loop_bads);

    // Phase 2
    let eeg_idx = rec.picks(&[ChannelKind::Eeg], false);
    for &i in &eeg_idx {
        let mut row = rec.data.row_mut(i);
        row -= &reference;
    }
    let detection = find_bad_channels_eeg(&rec.pick_kinds(&[ChannelKind::Eeg])?, cfg)?;
    let true_bads = detection.bads.clone();
    info!("true bad EEG channels: {:?}", true_bads);
    rec.mark_bad(&true_bads);
    rec.interpolate_bads(false)?;
    rec.set_eeg_reference_average()?;
    rec.info.bads.clear();

    Ok(BadEegOutcome { loop_bads, true_bads, history, iterations, converged, reference, detection })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{ChannelInfo, RecordingInfo};

    #[test]
    fn flat_channel_is_uncorrelated_and_deviant() {
        let n = 8;
        let channels: Vec<ChannelInfo> =
            (0..n).map(|i| ChannelInfo::new(format!("EEG{:03}", i + 1), ChannelKind::Eeg)).collect();
        let data = Array2::from_shape_fn((n, 2000), |(c, t)| {
            if c == 3 {
                0.0
            } else {
                let t = t as f64 / 250.0;
                (2.0 * std::f64::consts::PI * 7.0 * t).sin() * (1.0 + 0.01 * c as f64)
                    + 0.1 * (2.0 * std::f64::consts::PI * (60.0 + c as f64) * t).sin()
            }
        });
        let rec = Recording::new(RecordingInfo::new(250.0, channels), data).unwrap();
        let found = find_bad_channels_eeg(&rec, &BadEegConfig::default()).unwrap();
        assert!(found.by_correlation.contains(&"EEG004".to_string()));
        assert!(found.by_deviation.contains(&"EEG004".to_string()));
        assert_eq!(found.bads, vec!["EEG004"]);
    }
}
