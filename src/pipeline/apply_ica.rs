//! Stage 06: remove the curated EOG/ECG components from every run.
use anyhow::Result;
use log::info;

use super::{mean_psd_db, plot_traces, sample_channels, Stage};
use crate::config::StudyConfig;
use crate::ica::Ica;
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Report, Series};

fn load_solution(cfg: &StudyConfig, label: &str) -> Result<Ica> {
    let path = cfg.study_file(&format!("_ALL-ica_{label}.safetensors"));
    info!("  solution: {}", path.display());
    Ica::load(&path)
}

/// Run stage 06 with the `exclude` lists of the configuration.
pub fn run(cfg: &StudyConfig) -> Result<()> {
    let out = cfg.ensure_out_dir()?;
    let exclude = &cfg.ica.exclude;

    // (label, solution, excluded components, kinds it covers)
    let mut solutions = vec![("MEG", load_solution(cfg, "meg")?, exclude.meg(), ChannelKind::MEG.to_vec())];
    if cfg.has_eeg() {
        solutions.push(("EEG", load_solution(cfg, "eeg")?, exclude.eeg(), vec![ChannelKind::Eeg]));
    }

    let mut report = Report::new(format!("06 Apply ICA: {}", cfg.subject_tag()));
    for (label, ica, excl, _) in &solutions {
        info!("{label}: excluding components {excl:?} of {}", ica.n_components);
        report.text(format!("{label}: excluded components {excl:?} of {}.", ica.n_components));
    }

    for (k, run_name) in cfg.run_names().iter().enumerate() {
        let run = k + 1;
        let path = cfg.run_file(run_name, "_artif.safetensors");
        info!("  file: {}", path.display());
        let mut raw = Recording::load(&path)?;
        let before = raw.clone();
        for (_, ica, excl, _) in &solutions {
            ica.apply(&mut raw, excl)?;
        }

        report.heading(run_name.clone());
        let kinds: Vec<ChannelKind> = solutions.iter().flat_map(|s| s.3.iter().copied()).collect();
        let shown = sample_channels(&raw, &kinds, 3);
        let start = (raw.duration() / 2.0 - 5.0).max(0.0);
        let fig = out.join(format!("06_r{run}_ica_raw.svg"));
        plot_traces(&fig, "Before ICA", &before, &shown, start, 10.0)?;
        report.figure(&fig, "Sensor traces before component removal");
        let fig = out.join(format!("06_r{run}_ica_rawICA.svg"));
        plot_traces(&fig, "After ICA", &raw, &shown, start, 10.0)?;
        report.figure(&fig, "Sensor traces after component removal");

        for &kind in &kinds {
            let series = [
                Series { name: "before", points: mean_psd_db(&before, kind, 100.0)? },
                Series { name: "after", points: mean_psd_db(&raw, kind, 100.0)? },
            ];
            let fig = out.join(format!("06_r{run}_ica_psd_{kind}.svg"));
            report::line_plot(&fig, &format!("Power spectrum ({kind})"), "Frequency (Hz)", "dB", &series, &[])?;
            report.figure(&fig, format!("Mean {kind} spectrum before and after ICA"));
        }

        raw.save(&cfg.run_file(run_name, "_ica.safetensors"))?;
    }

    report.write(&out, Stage::IcaApply.report_name())?;
    Ok(())
}
