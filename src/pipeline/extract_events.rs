//! Stage 04: trigger events and the trial metadata decoded from them.
use anyhow::{Context, Result};
use log::info;

use super::Stage;
use crate::config::StudyConfig;
use crate::events::{extract_events, write_events};
use crate::recording::Recording;
use crate::report::{self, Report, Series};
use crate::trials::decode_trials;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub run: usize,
    pub n_events: usize,
    pub n_trials: usize,
}

/// Run stage 04 on the raw recordings.
pub fn run(cfg: &StudyConfig) -> Result<Vec<EventSummary>> {
    let out = cfg.ensure_out_dir()?;
    let mut report = Report::new(format!("04 Events: {}", cfg.subject_tag()));
    let mut summaries = Vec::new();
    for (k, run_name) in cfg.run_names().iter().enumerate() {
        let run = k + 1;
        let path = cfg.raw_file(run_name);
        info!("  file: {}", path.display());
        let raw = Recording::load(&path)?;
        let events = extract_events(&raw, &cfg.events)?;
        write_events(&cfg.run_file(run_name, "-eve.txt"), &events)?;

        let metadata = decode_trials(cfg.experiment, &events, raw.sfreq())
            .with_context(|| format!("decoding triggers of {}", path.display()))?;
        metadata.write_csv(&cfg.run_file(run_name, "-meta.csv"))?;
        info!("{} events, {} trials", events.len(), metadata.len());

        let points: Vec<(f64, f64)> =
            events.iter().map(|e| (e.sample as f64 / raw.sfreq(), e.code as f64)).collect();
        let fig = out.join(format!("04_r{run}_events.svg"));
        report::scatter_plot(&fig, "Events", "Time (s)", "Code", &[Series { name: "events", points }])?;
        report.heading(run_name.clone());
        report.text(format!("{} events, {} trials.", events.len(), metadata.len()));
        report.figure(&fig, "Trigger codes over time");

        summaries.push(EventSummary { run, n_events: events.len(), n_trials: metadata.len() });
    }
    report.write(&out, Stage::Events.report_name())?;
    Ok(summaries)
}
