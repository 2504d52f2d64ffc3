//! Stage A01: one evoked response per condition of the analysis factor.
use anyhow::Result;
use log::{info, warn};

use super::Stage;
use crate::config::StudyConfig;
use crate::epoch::Epochs;
use crate::evoked::{save_evokeds, Evoked};
use crate::recording::ChannelKind;
use crate::report::{self, Report, Series};

/// Run stage A01; conditions without epochs are skipped with a warning.
pub fn run(cfg: &StudyConfig) -> Result<Vec<Evoked>> {
    let out = cfg.ensure_out_dir()?;
    let epochs = Epochs::load(&cfg.study_file("_ALL_epo.safetensors"))?;
    let factor = cfg.factor();

    let mut evokeds = Vec::new();
    for cond in cfg.conditions() {
        let subset = epochs.select_condition(&factor, &cond)?;
        if subset.is_empty() {
            warn!("no epochs with {factor} = {cond}");
            continue;
        }
        info!("{factor} = {cond}: {} epochs", subset.len());
        evokeds.push(subset.average(&cond)?);
    }

    let mut report = Report::new(format!("A01 Evoked ({factor}): {}", cfg.subject_tag()));
    report.table(
        vec!["condition".into(), "epochs".into()],
        evokeds.iter().map(|e| vec![e.comment.clone(), e.nave.to_string()]).collect(),
    );
    for kind in [ChannelKind::Grad, ChannelKind::Mag, ChannelKind::Eeg] {
        let series: Vec<Series<'_>> = evokeds
            .iter()
            .filter_map(|e| {
                let gfp = e.gfp(kind)?;
                Some(Series { name: &e.comment, points: e.times().into_iter().zip(gfp).collect() })
            })
            .collect();
        if series.is_empty() {
            continue;
        }
        let fig = out.join(format!("A01_evk-{factor}_compare-{kind}.svg"));
        report::line_plot(&fig, &format!("GFP ({kind})"), "Time (s)", "GFP", &series, &[])?;
        report.figure(&fig, format!("Global field power of {kind} per condition"));
    }

    save_evokeds(&cfg.study_file(&format!("_ALL_evk-{factor}.safetensors")), &evokeds)?;
    report.write(&out, Stage::Evoked.report_name())?;
    Ok(evokeds)
}
