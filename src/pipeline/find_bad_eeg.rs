//! Stage 02: iterative bad-EEG-channel detection, interpolation and average
//! reference.
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::{mean_psd_db, plot_traces, py_list, sample_channels, write_csv_rows, Stage};
use crate::bad_channels::{find_bad_eeg, BadEegOutcome};
use crate::config::StudyConfig;
use crate::error::PipelineError;
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Report, Series};

pub const EEG_BAD_LIST: &str = "02_rAll_eeg_badch_list.csv";

/// One row of `02_rAll_eeg_badch_list.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EegBadRow {
    pub run: usize,
    #[serde(with = "super::py_list_cell")]
    pub bad: Vec<String>,
}

/// Run stage 02; fails with [`PipelineError::NoEeg`] for subjects without EEG.
pub fn run(cfg: &StudyConfig) -> Result<Vec<BadEegOutcome>> {
    if !cfg.has_eeg() {
        return Err(PipelineError::NoEeg(cfg.subject_tag()).into());
    }
    let out = cfg.ensure_out_dir()?;
    let method = cfg.maxwell.method.as_str();

    let mut report = Report::new(format!("02 Bad EEG channels: {}", cfg.subject_tag()));
    let mut rows = Vec::new();
    let mut outcomes = Vec::new();
    for (k, run_name) in cfg.run_names().iter().enumerate() {
        let run = k + 1;
        let path = cfg.run_file(run_name, &format!("_{method}.safetensors"));
        info!("  file: {}", path.display());
        let mut raw = Recording::load(&path)?;
        if !raw.has_kind(ChannelKind::Eeg) {
            return Err(PipelineError::NoEeg(cfg.subject_tag()).into());
        }
        raw.info.bads.clear();
        report.heading(run_name.clone());

        let shown = sample_channels(&raw, &[ChannelKind::Eeg], 8);
        let start = (raw.duration() / 2.0 - 2.5).max(0.0);
        let before = raw.clone();
        let fig = out.join(format!("02_r{run}_bad_eeg_0raw.svg"));
        plot_traces(&fig, "EEG as recorded", &raw, &shown, start, 5.0)?;
        report.figure(&fig, "EEG before re-referencing");

        let outcome = find_bad_eeg(&mut raw, &cfg.bad_eeg)?;
        if !outcome.converged {
            warn!("run {run}: reference loop stopped at the iteration cap");
            report.text(format!(
                "The reference loop did not converge within {} iterations.",
                cfg.bad_eeg.max_iter
            ));
        }
        report.text(format!(
            "Reference loop: {} iterations, bad set {}. True bad channels (interpolated): {}.",
            outcome.iterations,
            py_list(&outcome.loop_bads),
            py_list(&outcome.true_bads)
        ));

        let growth: Vec<(f64, f64)> =
            outcome.history.iter().enumerate().map(|(i, b)| ((i + 1) as f64, b.len() as f64)).collect();
        if !growth.is_empty() {
            let fig = out.join(format!("02_r{run}_bad_eeg_loop.svg"));
            let series = [Series { name: "bad channels", points: growth }];
            report::line_plot(&fig, "Accumulated bad channels", "Iteration", "Channels", &series, &[])?;
            report.figure(&fig, "Size of the accumulated bad set per iteration");
        }

        let mut scores: Vec<(String, f64)> = outcome
            .detection
            .deviation_z
            .iter()
            .zip(raw.info.picks(&[ChannelKind::Eeg], false))
            .map(|(z, i)| (raw.info.channels[i].name.clone(), z.abs()))
            .collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));
        let fig = out.join(format!("02_r{run}_bad_eeg_deviation.svg"));
        report::bar_plot(&fig, "Amplitude deviation", "|robust z|", &scores)?;
        report.figure(&fig, "Deviation score per channel after removing the estimated reference");

        let fig = out.join(format!("02_r{run}_bad_eeg_3refer.svg"));
        plot_traces(&fig, "EEG interpolated, average reference", &raw, &shown, start, 5.0)?;
        report.figure(&fig, "EEG after interpolation and average reference");

        let series = [
            Series { name: "before", points: mean_psd_db(&before, ChannelKind::Eeg, 100.0)? },
            Series { name: "after", points: mean_psd_db(&raw, ChannelKind::Eeg, 100.0)? },
        ];
        let fig = out.join(format!("02_r{run}_bad_eeg_Ipow.svg"));
        report::line_plot(&fig, "EEG power spectrum", "Frequency (Hz)", "dB", &series, &[])?;
        report.figure(&fig, "Mean EEG power spectrum");

        raw.save(&cfg.run_file(run_name, "_intpl.safetensors"))?;
        rows.push(EegBadRow { run, bad: outcome.true_bads.clone() });
        outcomes.push(outcome);
    }

    write_csv_rows(&out.join(EEG_BAD_LIST), &rows)?;
    report.heading("Bad channels");
    report.table(
        vec!["run".into(), "bad".into()],
        rows.iter().map(|r| vec![r.run.to_string(), py_list(&r.bad)]).collect(),
    );
    report.write(&out, Stage::BadEeg.report_name())?;
    Ok(outcomes)
}
