//! Stage 07: concatenate the cleaned runs and cut event-locked epochs.
use anyhow::{Context, Result};
use log::{info, warn};

use super::Stage;
use crate::config::StudyConfig;
use crate::epoch::{EpochParams, Epochs};
use crate::events::{read_events, shift_events};
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Report};
use crate::trials::MetadataTable;

/// Kinds kept in the epochs.
fn epoch_picks(with_eeg: bool) -> Vec<ChannelKind> {
    let mut picks = ChannelKind::MEG.to_vec();
    if with_eeg {
        picks.extend([ChannelKind::Eeg, ChannelKind::Eog, ChannelKind::Ecg]);
    }
    picks.push(ChannelKind::Stim);
    picks
}

/// Run stage 07 and return the epochs that were written.
pub fn run(cfg: &StudyConfig) -> Result<Epochs> {
    let out = cfg.ensure_out_dir()?;
    let mut runs = Vec::new();
    let mut run_events = Vec::new();
    let mut tables = Vec::new();
    for run_name in cfg.run_names() {
        let path = cfg.run_file(&run_name, "_ica.safetensors");
        info!("  file: {}", path.display());
        runs.push(Recording::load(&path)?);
        run_events.push(read_events(&cfg.run_file(&run_name, "-eve.txt"))?);
        tables.push(MetadataTable::read_csv(&cfg.run_file(&run_name, "-meta.csv"))?);
    }

    let (raw, offsets) = Recording::concatenate(&runs)?;
    drop(runs);
    let events: Vec<_> = run_events.iter().zip(&offsets).flat_map(|(ev, &off)| shift_events(ev, off)).collect();
    let metadata = MetadataTable::concat(&tables)?;
    metadata.write_csv(&cfg.study_file("_ALL-meta.csv"))?;

    let ecfg = &cfg.epochs;
    let params = EpochParams {
        tmin: ecfg.tmin,
        tmax: ecfg.tmax,
        reject: ecfg.reject.thresholds(cfg.has_eeg()),
        reject_by_annotation: ecfg.reject_by_annotation,
        picks: epoch_picks(cfg.has_eeg()),
    };
    let mut epochs = Epochs::new(&raw, &events, &cfg.events_id(), &params, Some(metadata))
        .context("epoching the concatenated runs")?;
    if let Some([b0, b1]) = ecfg.baseline {
        epochs.apply_baseline(b0, b1);
    }

    let dropped = epochs.drop_percentage();
    info!("{} epochs kept, {dropped:.1}% dropped", epochs.len());
    if epochs.is_empty() {
        warn!("every epoch was rejected");
    }

    let mut report = Report::new(format!("07 Epochs: {}", cfg.subject_tag()));
    report.text(format!(
        "{} of {} candidate epochs kept ({dropped:.1}% dropped), window [{}, {}] s.",
        epochs.len(),
        epochs.drop_log.len(),
        ecfg.tmin,
        ecfg.tmax
    ));
    let reasons: Vec<(String, f64)> =
        epochs.drop_reasons().into_iter().take(30).map(|(r, n)| (r, n as f64)).collect();
    if !reasons.is_empty() {
        let fig = out.join("07_rAll_epoch_drop.svg");
        report::bar_plot(&fig, &format!("Drop log ({dropped:.1}%)"), "Epochs", &reasons)?;
        report.figure(&fig, "Reasons for dropping epochs");
    }
    let counts: Vec<(String, usize)> = epochs.counts().into_iter().filter(|(_, n)| *n > 0).collect();
    report.table(
        vec!["event".into(), "epochs".into()],
        counts.iter().map(|(name, n)| vec![name.clone(), n.to_string()]).collect(),
    );

    epochs.write_counts(&cfg.study_file("_ALL_epo.csv"))?;
    epochs.save(&cfg.study_file("_ALL_epo.safetensors"))?;
    report.write(&out, Stage::Epochs.report_name())?;
    Ok(epochs)
}
