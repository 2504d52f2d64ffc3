//! Stage 05: fit ICA on resampled, band-passed copies of all runs.
use std::path::Path;

use anyhow::Result;
use log::{info, warn};
use ndarray::{s, Array2};

use super::Stage;
use crate::config::StudyConfig;
use crate::ica::Ica;
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Report, Series};

/// Data kinds filtered before fitting (MNE's `data` channels).
const DATA_KINDS: [ChannelKind; 5] =
    [ChannelKind::Grad, ChannelKind::Mag, ChannelKind::Eeg, ChannelKind::Eog, ChannelKind::Ecg];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcaSummary {
    pub meg_components: usize,
    pub eeg_components: Option<usize>,
}

/// All `_artif` runs resampled to `filter.sfreq`, band-passed and joined.
pub fn prepared_runs(cfg: &StudyConfig) -> Result<Recording> {
    let mut runs = Vec::new();
    for run_name in cfg.run_names() {
        let path = cfg.run_file(&run_name, "_artif.safetensors");
        info!("  file: {}", path.display());
        let raw = Recording::load(&path)?;
        let mut copy = raw.resampled(cfg.filter.sfreq)?;
        copy.filter(Some(cfg.filter.l_freq), Some(cfg.filter.h_freq), &DATA_KINDS)?;
        runs.push(copy);
    }
    Ok(Recording::concatenate(&runs)?.0)
}

fn plot_sources(path: &Path, title: &str, sources: &Array2<f64>, sfreq: f64) -> Result<()> {
    let n_show = sources.nrows().min(10);
    let n_t = sources.ncols().min((10.0 * sfreq) as usize);
    let series: Vec<(String, Vec<(f64, f64)>)> = (0..n_show)
        .map(|k| {
            let row = sources.slice(s![k, ..n_t]);
            let peak = row.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);
            let pts = row.iter().enumerate().map(|(i, v)| (i as f64 / sfreq, v / peak - 2.5 * k as f64)).collect();
            (format!("ICA{k:03}"), pts)
        })
        .collect();
    let series: Vec<Series<'_>> = series.iter().map(|(n, p)| Series { name: n, points: p.clone() }).collect();
    report::line_plot(path, title, "Time (s)", "Component (normalised)", &series, &[])
}

fn fit_one(
    cfg: &StudyConfig,
    data: &Recording,
    name: &str,
    kinds: &[ChannelKind],
    report: &mut Report,
) -> Result<usize> {
    let out = cfg.out_dir();
    let ica = Ica::fit(data, kinds, &cfg.ica)?;
    if !ica.converged {
        warn!("{name} ICA did not converge in {} iterations", cfg.ica.max_iter);
    }
    info!("{name} ICA: {} components, {} iterations", ica.n_components, ica.n_iter);

    let label = name.to_uppercase();
    report.heading(format!("ICA on {label}"));
    report.text(format!(
        "{} components from {} channels; {} FastICA iterations (converged: {}).",
        ica.n_components,
        ica.ch_names.len(),
        ica.n_iter,
        ica.converged
    ));
    let fig = out.join(format!("05_rAll_ica_{name}_src.svg"));
    plot_sources(&fig, &format!("ICA_{label}"), &ica.sources(data)?, data.sfreq())?;
    report.figure(&fig, "First ten seconds of the leading components");
    let bars: Vec<(String, f64)> = ica
        .explained_variance_ratio()
        .iter()
        .enumerate()
        .map(|(k, v)| (format!("{k}"), 100.0 * v))
        .collect();
    let fig = out.join(format!("05_rAll_ica_{name}_var.svg"));
    report::bar_plot(&fig, &format!("ICA_{label}: explained variance"), "%", &bars)?;
    report.figure(&fig, "Variance of each retained principal axis");

    ica.save(&cfg.study_file(&format!("_ALL-ica_{name}.safetensors")))?;
    Ok(ica.n_components)
}

/// Run stage 05: one solution for MEG and, for subjects with EEG, one for EEG.
pub fn run(cfg: &StudyConfig) -> Result<IcaSummary> {
    let out = cfg.ensure_out_dir()?;
    let data = prepared_runs(cfg)?;
    let mut report = Report::new(format!("05 ICA: {}", cfg.subject_tag()));
    let meg_components = fit_one(cfg, &data, "meg", &ChannelKind::MEG, &mut report)?;
    let eeg_components = if cfg.has_eeg() {
        Some(fit_one(cfg, &data, "eeg", &[ChannelKind::Eeg], &mut report)?)
    } else {
        None
    };
    report.write(&out, Stage::IcaFit.report_name())?;
    Ok(IcaSummary { meg_components, eeg_components })
}
