//! Stage 01: automatic noisy/flat MEG channels, then SSS or tSSS.
use std::path::Path;

use anyhow::Result;
use log::{debug, info, warn};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

use super::{mean_psd_db, plot_traces, py_list, sample_channels, write_csv_rows, Stage};
use crate::config::StudyConfig;
use crate::maxwell::{find_bad_channels_meg, maxwell_filter, BadMegScores, FineCalibration};
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Report, Series};

pub const MEG_BAD_LIST: &str = "01_rAll_meg_badch_list.csv";

/// One row of `01_rAll_meg_badch_list.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegBadRow {
    pub run: usize,
    #[serde(with = "super::py_list_cell")]
    pub noisy: Vec<String>,
    #[serde(with = "super::py_list_cell")]
    pub flat: Vec<String>,
}

fn plot_scores(dir: &Path, run: usize, scores: &BadMegScores, kind: ChannelKind, report: &mut Report) -> Result<()> {
    let rows: Vec<usize> = (0..scores.ch_kinds.len()).filter(|&c| scores.ch_kinds[c] == kind).collect();
    if rows.is_empty() {
        return Ok(());
    }
    let x: Vec<f64> = scores.bins.iter().map(|b| b.0).collect();
    let y: Vec<f64> = (0..rows.len()).map(|i| i as f64).collect();

    let noisy = scores.scores_noisy.select(Axis(0), &rows);
    let path = dir.join(format!("01_r{run}_badchannels_{kind}score_noisy.svg"));
    let lim = scores.limit_noisy;
    report::heatmap(&path, &format!("Noisy scores: {kind}"), ("Time (s)", "Channel"), &x, &y, &noisy, (-lim, lim))?;
    report.figure(&path, format!("Robust z-score of peak-to-peak amplitude ({kind}); red above {lim}"));

    let flat = scores.scores_flat.select(Axis(0), &rows);
    let path = dir.join(format!("01_r{run}_badchannels_{kind}score_flat.svg"));
    report::heatmap(&path, &format!("Flat scores: {kind}"), ("Time (s)", "Channel"), &x, &y, &flat, (0.0, 2.0))?;
    report.figure(&path, format!("Amplitude relative to the {kind} median; flat below {}", scores.limit_flat));
    Ok(())
}

fn plot_psd(path: &Path, before: &Recording, after: &Recording, method: &str, kind: ChannelKind) -> Result<()> {
    let raw = mean_psd_db(before, kind, 100.0)?;
    let filtered = mean_psd_db(after, kind, 100.0)?;
    let series = [Series { name: "raw", points: raw }, Series { name: method, points: filtered }];
    report::line_plot(path, &format!("Power spectrum ({kind})"), "Frequency (Hz)", "dB", &series, &[])
}

/// Run stage 01 over every run of the subject.
pub fn run(cfg: &StudyConfig) -> Result<Vec<MegBadRow>> {
    let out = cfg.ensure_out_dir()?;
    let method = cfg.maxwell.method.as_str();

    let fine_cal = match cfg.fine_cal_file() {
        Some(p) if p.exists() => Some(FineCalibration::read(&p)?),
        Some(p) => {
            warn!("fine calibration {} not found, using nominal sensor geometry", p.display());
            None
        }
        None => None,
    };
    if let Some(ct) = cfg.crosstalk_file() {
        info!("cross-talk file {} is not read; no cross-talk compensation", ct.display());
    }

    let mut report = Report::new(format!("01 Maxwell filtering ({method}): {}", cfg.subject_tag()));
    let mut rows = Vec::new();
    for (k, run_name) in cfg.run_names().iter().enumerate() {
        let run = k + 1;
        let path = cfg.raw_file(run_name);
        info!("  file: {}", path.display());
        let mut raw = Recording::load(&path)?;
        raw.info.bads.clear();
        if let Some(cal) = &fine_cal {
            let n = cal.apply(&mut raw);
            debug!("fine calibration applied to {n} channels");
        }

        let found = find_bad_channels_meg(&raw, &cfg.maxwell)?;
        info!("noisy MEG channels: {:?}; flat: {:?}", found.noisy, found.flat);
        raw.mark_bad(&found.noisy);
        raw.mark_bad(&found.flat);

        report.heading(run_name.clone());
        report.text(format!("Noisy: {}. Flat: {}.", py_list(&found.noisy), py_list(&found.flat)));
        for kind in ChannelKind::MEG {
            plot_scores(&out, run, &found.scores, kind, &mut report)?;
        }

        let mut sss = raw.clone();
        let summary = maxwell_filter(&mut sss, &cfg.maxwell)?;
        report.text(format!(
            "{} internal and {} external components fitted on {} channels; reconstructed {}.",
            summary.n_in,
            summary.n_out,
            summary.n_fit_channels,
            py_list(&summary.reconstructed)
        ));
        if !summary.tsss_removed.is_empty() {
            report.text(format!("tSSS components removed per window: {:?}", summary.tsss_removed));
        }

        let shown = sample_channels(&sss, &ChannelKind::MEG, 4);
        let start = (sss.duration() / 2.0 - 2.5).max(0.0);
        let fig = out.join(format!("01_r{run}_plotraw.svg"));
        plot_traces(&fig, "MEG before Maxwell filtering", &raw, &shown, start, 5.0)?;
        report.figure(&fig, "Raw MEG");
        let fig = out.join(format!("01_r{run}_plotraw{method}.svg"));
        plot_traces(&fig, &format!("MEG after {method}"), &sss, &shown, start, 5.0)?;
        report.figure(&fig, format!("MEG after {method}"));
        for kind in ChannelKind::MEG {
            let fig = out.join(format!("01_r{run}_plot_psd_{kind}.svg"));
            plot_psd(&fig, &raw, &sss, method, kind)?;
            report.figure(&fig, format!("Power spectrum of {kind} before and after {method}"));
        }

        sss.save(&cfg.run_file(run_name, &format!("_{method}.safetensors")))?;
        rows.push(MegBadRow { run, noisy: found.noisy, flat: found.flat });
    }

    write_csv_rows(&out.join(MEG_BAD_LIST), &rows)?;
    report.heading("Bad channels");
    report.table(
        vec!["run".into(), "noisy".into(), "flat".into()],
        rows.iter().map(|r| vec![r.run.to_string(), py_list(&r.noisy), py_list(&r.flat)]).collect(),
    );
    report.write(&out, Stage::Maxwell.report_name())?;
    Ok(rows)
}
