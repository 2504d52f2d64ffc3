//! Stage 03: blink and muscle annotations.
use anyhow::Result;
use log::info;

use super::{plot_traces, Stage};
use crate::annotations::Annotations;
use crate::artifacts::{annotate_muscle_zscore, blink_annotations, ensure_two_eog, find_eog_events};
use crate::config::StudyConfig;
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Report, Series};

/// Plot at most this many points per trace.
const MAX_POINTS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub run: usize,
    pub eog_promoted: bool,
    pub blinks: usize,
    pub muscle_segments: usize,
}

/// Run stage 03. Subjects without EEG skip stage 02, so their input is the
/// Maxwell-filtered file and no blinks are annotated.
pub fn run(cfg: &StudyConfig) -> Result<Vec<ArtifactSummary>> {
    let out = cfg.ensure_out_dir()?;
    let suffix = if cfg.has_eeg() {
        "_intpl.safetensors".to_string()
    } else {
        format!("_{}.safetensors", cfg.maxwell.method.as_str())
    };
    let acfg = &cfg.artifacts;

    let mut report = Report::new(format!("03 Artifact annotation: {}", cfg.subject_tag()));
    let mut summaries = Vec::new();
    for (k, run_name) in cfg.run_names().iter().enumerate() {
        let run = k + 1;
        let path = cfg.run_file(run_name, &suffix);
        info!("  file: {}", path.display());
        let mut raw = Recording::load(&path)?;
        report.heading(run_name.clone());

        let eog_promoted = ensure_two_eog(&mut raw, acfg)?;
        let mut annotations = Annotations::new();
        let mut blinks = 0;
        if cfg.has_eeg() {
            let found = find_eog_events(&raw, acfg)?;
            blinks = found.events.len();
            annotations.extend(&blink_annotations(&raw, &found.events, acfg.blink_duration));
            report.text(format!("{blinks} blinks detected on {}.", found.channel));

            let mut shown = vec![found.channel.clone()];
            for ch in raw.info.channels.iter().filter(|c| c.kind == ChannelKind::Eog) {
                if !shown.contains(&ch.name) {
                    shown.push(ch.name.clone());
                }
            }
            shown.extend(super::sample_channels(&raw, &[ChannelKind::Eeg], 4));
            let start = found
                .events
                .first()
                .map_or(0.0, |e| ((e.sample - raw.info.first_samp) as f64 / raw.sfreq() - 2.0).max(0.0));
            let fig = out.join(format!("03_r{run}_artifact_blink.svg"));
            plot_traces(&fig, "Blinks", &raw, &shown, start, 10.0)?;
            report.figure(&fig, "EOG and EEG around the first detected blink");
        }

        let muscle = annotate_muscle_zscore(&raw, acfg)?;
        let muscle_segments = muscle.annotations.len();
        annotations.extend(&muscle.annotations);
        let step = (muscle.scores.len() / MAX_POINTS).max(1);
        let points: Vec<(f64, f64)> = muscle
            .scores
            .iter()
            .enumerate()
            .step_by(step)
            .map(|(i, &z)| (i as f64 / raw.sfreq(), z))
            .collect();
        let fig = out.join(format!("03_r{run}_artifact_muscle.svg"));
        let series = [Series { name: "muscle z-score", points }];
        report::line_plot(&fig, "Muscle activity", "Time (s)", "z-score", &series, &[muscle.threshold])?;
        report.figure(&fig, format!("{muscle_segments} segments above z = {}", muscle.threshold));

        raw.info.annotations = annotations;
        raw.save(&cfg.run_file(run_name, "_artif.safetensors"))?;
        summaries.push(ArtifactSummary { run, eog_promoted, blinks, muscle_segments });
    }

    report.write(&out, Stage::Annotate.report_name())?;
    Ok(summaries)
}
