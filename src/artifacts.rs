//! Ocular and muscle artifact detection.
//!
//! - Blinks: `find_eog_events`-style peak picking on a 1–10 Hz band-passed
//!   EOG trace.
//! - Muscle: `annotate_muscle_zscore`-style envelope z-scores of
//!   high-frequency magnetometer activity.
use anyhow::Result;
use log::{debug, info};
use ndarray::Axis;

use crate::annotations::Annotations;
use crate::config::ArtifactConfig;
use crate::error::PipelineError;
use crate::events::Event;
use crate::filter::{apply_fir_rows, design_bandpass, filter_1d, design_lowpass};
use crate::normalize::{median, zscore};
use crate::recording::{ChannelKind, Recording};
use crate::spectrum::hilbert_envelope;

/// Event code written for detected blinks (MNE's default).
pub const BLINK_EVENT_ID: i32 = 998;

/// Promote the bio channel to an EOG channel when fewer than two EOG
/// channels exist. Returns whether a channel was promoted.
pub fn ensure_two_eog(rec: &mut Recording, cfg: &ArtifactConfig) -> Result<bool> {
    if rec.info.count(ChannelKind::Eog) >= 2 {
        return Ok(false);
    }
    if rec.info.index_of(&cfg.bio_channel).is_none() {
        debug!("fewer than two EOG channels and no `{}` to promote", cfg.bio_channel);
        return Ok(false);
    }
    rec.set_channel_kind(&cfg.bio_channel, ChannelKind::Eog)?;
    rec.rename_channel(&cfg.bio_channel, &cfg.eog_rename)?;
    info!("{} used as EOG channel {}", cfg.bio_channel, cfg.eog_rename);
    Ok(true)
}

/// Index of the run maxima of `x` above `threshold`.
fn run_maxima(x: &[f64], threshold: f64) -> Vec<usize> {
    let mut peaks = Vec::new();
    let mut best: Option<usize> = None;
    for (i, &v) in x.iter().enumerate() {
        if v > threshold {
            best = match best {
                Some(b) if x[b] >= v => Some(b),
                _ => Some(i),
            };
        } else if let Some(b) = best.take() {
            peaks.push(b);
        }
    }
    peaks.extend(best);
    peaks
}

/// Detected blinks plus the trace they were found on.
#[derive(Debug, Clone)]
pub struct BlinkDetection {
    /// Absolute samples (including `first_samp`), code [`BLINK_EVENT_ID`].
    pub events: Vec<Event>,
    pub channel: String,
    pub threshold: f64,
}

/// Find blink peaks on the EOG channels of `rec`.
pub fn find_eog_events(rec: &Recording, cfg: &ArtifactConfig) -> Result<BlinkDetection> {
    let eog_idx = rec.picks(&[ChannelKind::Eog], false);
    if eog_idx.is_empty() {
        return Err(PipelineError::NoChannels("eog").into());
    }
    let h = design_bandpass(cfg.eog_band[0], cfg.eog_band[1], rec.sfreq())?;
    let mut filtered = rec.data.select(Axis(0), &eog_idx);
    let rows: Vec<usize> = (0..filtered.nrows()).collect();
    apply_fir_rows(&mut filtered, &rows, &h)?;

    let energy: Vec<f64> = filtered.rows().into_iter().map(|r| r.dot(&r)).collect();
    let best = (0..energy.len())
        .max_by(|&a, &b| energy[a].total_cmp(&energy[b]))
        .unwrap_or(0);
    let mut trace = filtered.row(best).to_vec();

    let max = trace.iter().copied().fold(f64::MIN, f64::max);
    let min = trace.iter().copied().fold(f64::MAX, f64::min);
    if min.abs() > max.abs() {
        trace.iter_mut().for_each(|v| *v = -*v);
    }
    let threshold = (max - min) / 4.0;
    let base = median(&mut trace.clone());
    let peaks = run_maxima(&trace, base + threshold);
    let events = peaks
        .iter()
        .map(|&p| Event { sample: p as i64 + rec.info.first_samp, prev: 0, code: BLINK_EVENT_ID })
        .collect::<Vec<_>>();
    let channel = rec.info.channels[eog_idx[best]].name.clone();
    info!("{} blinks found on {}", events.len(), channel);
    Ok(BlinkDetection { events, channel, threshold })
}

/// `Blink` annotations centred on each blink event.
pub fn blink_annotations(rec: &Recording, blinks: &[Event], duration: f64) -> Annotations {
    let mut out = Annotations::new();
    for ev in blinks {
        let t = (ev.sample - rec.info.first_samp) as f64 / rec.sfreq();
        out.push(t - duration / 2.0, duration, "Blink");
    }
    out
}

/// Muscle scores (one per sample) and the annotations they produce.
#[derive(Debug, Clone)]
pub struct MuscleDetection {
    pub annotations: Annotations,
    pub scores: Vec<f64>,
    pub threshold: f64,
}

/// Annotate muscle activity from magnetometer high-frequency envelopes.
///
/// The caller's recording is not modified; line noise is notched on a copy.
pub fn annotate_muscle_zscore(rec: &Recording, cfg: &ArtifactConfig) -> Result<MuscleDetection> {
    let mut mags = rec.pick_kinds(&[ChannelKind::Mag])?;
    mags.notch_filter(&cfg.notch_freqs, &[ChannelKind::Mag])?;
    let sfreq = mags.sfreq();
    let h = design_bandpass(cfg.muscle_band[0], cfg.muscle_band[1], sfreq)?;
    let rows: Vec<usize> = (0..mags.n_channels()).collect();
    apply_fir_rows(&mut mags.data, &rows, &h)?;

    let n_t = mags.n_times();
    let n_ch = mags.n_channels() as f64;
    let mut scores = vec![0.0; n_t];
    for row in mags.data.rows() {
        let env = hilbert_envelope(&row.to_vec());
        for (s, z) in scores.iter_mut().zip(zscore(&env)) {
            *s += z;
        }
    }
    scores.iter_mut().for_each(|s| *s /= n_ch.sqrt());
    let lp = design_lowpass(cfg.muscle_smoothing, sfreq)?;
    let scores = filter_1d(&scores, &lp)?;

    let mask: Vec<bool> = scores.iter().map(|&s| s > cfg.muscle_threshold).collect();
    let annotations = Annotations::from_mask(&mask, sfreq, cfg.min_length_good, "BAD_muscle");
    info!("{} muscle segments annotated", annotations.len());
    Ok(MuscleDetection { annotations, scores, threshold: cfg.muscle_threshold })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_maxima_one_peak_per_run() {
        let x = [0.0, 2.0, 3.0, 2.5, 0.0, 0.0, 4.0, 0.0, 5.0];
        assert_eq!(run_maxima(&x, 1.0), vec![2, 6, 8]);
        assert!(run_maxima(&x, 10.0).is_empty());
    }
}
