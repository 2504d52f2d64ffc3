//! Stage B01: induced power per condition in the low and/or high band.
use std::path::PathBuf;

use anyhow::Result;
use log::{info, warn};

use super::Stage;
use crate::config::{FreqBand, StudyConfig, TfrBand};
use crate::epoch::Epochs;
use crate::report::{self, Report};
use crate::tfr::{save_tfrs, tfr_power, TfrParams};

/// `(file tag, band)` pairs selected by `freq_band`.
fn bands(cfg: &StudyConfig) -> Vec<(&'static str, &TfrBand)> {
    let t = &cfg.tfr;
    match t.freq_band {
        FreqBand::Low => vec![("lofr", &t.low)],
        FreqBand::High => vec![("hifr", &t.high)],
        FreqBand::Both => vec![("lofr", &t.low), ("hifr", &t.high)],
    }
}

/// Run stage B01 and return the written power files.
pub fn run(cfg: &StudyConfig) -> Result<Vec<PathBuf>> {
    let out = cfg.ensure_out_dir()?;
    let epochs = Epochs::load(&cfg.study_file("_ALL_epo.safetensors"))?;
    let factor = cfg.factor();
    let tag = cfg.subject_tag();
    let [b0, b1] = cfg.tfr.baseline;

    let mut report = Report::new(format!("B01 Time-frequency ({factor}): {tag}"));
    let mut written = Vec::new();
    for (band_tag, band) in bands(cfg) {
        let params = TfrParams {
            method: cfg.tfr.method,
            freqs: band.freqs(),
            n_cycles: band.n_cycles(),
            time_bandwidth: band.time_bandwidth,
            decim: cfg.tfr.decim,
            picks: cfg.tfr.picks,
        };
        report.heading(format!("{band_tag}: {}-{} Hz", band.fmin, band.fmax));

        let mut tfrs = Vec::new();
        for cond in cfg.conditions() {
            let subset = epochs.select_condition(&factor, &cond)?;
            if subset.is_empty() {
                warn!("no epochs with {factor} = {cond}");
                continue;
            }
            info!("{band_tag} {factor} = {cond}: {} epochs", subset.len());
            let tfr = tfr_power(&subset, &params, &cond)?;

            let mut shown = tfr.clone();
            shown.apply_baseline_percent(b0, b1)?;
            let fig = out.join(format!("{tag}_tfr_{band_tag}_{cond}.svg"));
            report::heatmap(
                &fig,
                &format!("{} power, {factor} = {cond}", cfg.tfr.picks),
                ("Time (s)", "Frequency (Hz)"),
                &shown.times,
                &shown.freqs,
                &shown.channel_mean(),
                (-1.0, 1.0),
            )?;
            report.figure(&fig, format!("Relative change from baseline [{b0}, {b1}] s, {} epochs", tfr.nave));
            tfrs.push(tfr);
        }

        let path = out.join(format!("{tag}_tfr_{band_tag}_{factor}.safetensors"));
        save_tfrs(&path, &tfrs)?;
        written.push(path);
    }

    report.write(&out, Stage::Tfr.report_name())?;
    Ok(written)
}
