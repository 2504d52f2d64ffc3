//! The nine pipeline stages.
//!
//! Every stage reads what the previous one wrote (see the file-naming
//! helpers on [`StudyConfig`]), writes a fresh artifact into the output
//! directory and finishes with `<stage>-report.html`.
//!
//! ```text
//! 01 maxwell    <data>/<run>             → <run>_<method>, 01_rAll_meg_badch_list.csv
//! 02 bad-eeg    <run>_<method>           → <run>_intpl, 02_rAll_eeg_badch_list.csv
//! 03 annotate   <run>_intpl              → <run>_artif
//! 04 events     <data>/<run>             → <run>-eve.txt, <run>-meta.csv
//! 05 ica-fit    <run>_artif (all runs)   → <stem>_ALL-ica_{meg,eeg}
//! 06 ica-apply  <run>_artif + ICA        → <run>_ica
//! 07 epochs     <run>_ica + events       → <stem>_ALL_epo, <stem>_ALL-meta.csv, <stem>_ALL_epo.csv
//! A01 evoked    epochs                   → <stem>_ALL_evk-<factor>
//! B01 tfr       epochs                   → <site><subject>_tfr_{lofr,hifr}_<factor>
//! ```
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use log::info;
use ndarray::{s, Axis};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StudyConfig;
use crate::recording::{ChannelKind, Recording};
use crate::report::{self, Series};
use crate::spectrum::welch;

pub mod apply_ica;
pub mod artifact_annotation;
pub mod extract_events;
pub mod find_bad_eeg;
pub mod make_epochs;
pub mod make_evoked;
pub mod maxwell_filtering;
pub mod run_ica;
pub mod time_frequency;

// ── Stage selection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Maxwell,
    BadEeg,
    Annotate,
    Events,
    IcaFit,
    IcaApply,
    Epochs,
    Evoked,
    Tfr,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Maxwell,
        Stage::BadEeg,
        Stage::Annotate,
        Stage::Events,
        Stage::IcaFit,
        Stage::IcaApply,
        Stage::Epochs,
        Stage::Evoked,
        Stage::Tfr,
    ];

    /// Command-line name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Maxwell => "maxwell",
            Stage::BadEeg => "bad-eeg",
            Stage::Annotate => "annotate",
            Stage::Events => "events",
            Stage::IcaFit => "ica-fit",
            Stage::IcaApply => "ica-apply",
            Stage::Epochs => "epochs",
            Stage::Evoked => "evoked",
            Stage::Tfr => "tfr",
        }
    }

    /// Report name, `<stage name>-report.html`.
    pub fn report_name(self) -> &'static str {
        match self {
            Stage::Maxwell => "01-maxwell_filtering",
            Stage::BadEeg => "02-find_bad_eeg",
            Stage::Annotate => "03-artifact_annotation",
            Stage::Events => "04-extract_events",
            Stage::IcaFit => "05-run_ica",
            Stage::IcaApply => "06-apply_ica",
            Stage::Epochs => "07-make_epochs",
            Stage::Evoked => "A01-make_evoked",
            Stage::Tfr => "B01-time_frequency",
        }
    }

    pub fn run(self, cfg: &StudyConfig) -> Result<()> {
        info!("── {} ── subject {}", self.report_name(), cfg.subject_tag());
        match self {
            Stage::Maxwell => maxwell_filtering::run(cfg).map(drop),
            Stage::BadEeg => find_bad_eeg::run(cfg).map(drop),
            Stage::Annotate => artifact_annotation::run(cfg).map(drop),
            Stage::Events => extract_events::run(cfg).map(drop),
            Stage::IcaFit => run_ica::run(cfg).map(drop),
            Stage::IcaApply => apply_ica::run(cfg),
            Stage::Epochs => make_epochs::run(cfg).map(drop),
            Stage::Evoked => make_evoked::run(cfg).map(drop),
            Stage::Tfr => time_frequency::run(cfg).map(drop),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Stage::ALL.iter().find(|st| st.as_str() == s) {
            Some(&st) => Ok(st),
            None => bail!("unknown stage `{s}`"),
        }
    }
}

/// Run every stage in order. The bad-EEG stage is skipped for subjects
/// recorded without EEG.
pub fn run_all(cfg: &StudyConfig) -> Result<()> {
    for stage in Stage::ALL {
        if stage == Stage::BadEeg && !cfg.has_eeg() {
            info!("{}: no EEG for {}, skipped", stage.report_name(), cfg.subject_tag());
            continue;
        }
        stage.run(cfg)?;
    }
    Ok(())
}

// ── Shared helpers ───────────────────────────────────────────────────────────

/// Python-style list literal, e.g. `['MEG0111', 'MEG0121']`; the bad-channel
/// CSV files are read by pandas-based tooling.
pub fn py_list<S: AsRef<str>>(items: &[S]) -> String {
    let inner: Vec<String> = items.iter().map(|s| format!("'{}'", s.as_ref())).collect();
    format!("[{}]", inner.join(", "))
}

/// Inverse of [`py_list`].
pub fn parse_py_list(s: &str) -> Vec<String> {
    s.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|t| t.trim().trim_matches('\'').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Serde adapter storing a `Vec<String>` as one [`py_list`] cell.
pub mod py_list_cell {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[String], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::py_list(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let s = String::deserialize(d)?;
        Ok(super::parse_py_list(&s))
    }
}

/// Write one CSV row per item, header from the field names.
pub fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut w = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        w.serialize(row)?;
    }
    w.flush().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn read_csv_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut r = csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    r.deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("parsing {}", path.display()))
}

/// Mean Welch PSD (dB) of the good channels of `kind`, up to `fmax`.
pub fn mean_psd_db(rec: &Recording, kind: ChannelKind, fmax: f64) -> Result<Vec<(f64, f64)>> {
    let picks = rec.picks(&[kind], true);
    if picks.is_empty() {
        return Ok(Vec::new());
    }
    let data = rec.data.select(Axis(0), &picks);
    let n_per_seg = ((2.0 * rec.sfreq()) as usize).min(rec.n_times()).max(8);
    let (freqs, psd) = welch(&data, rec.sfreq(), n_per_seg)?;
    let mean = psd.mean_axis(Axis(0)).unwrap_or_default();
    Ok(freqs
        .iter()
        .zip(mean.iter())
        .filter(|(f, p)| **f >= 1.0 && **f <= fmax && **p > 0.0)
        .map(|(&f, &p)| (f, 10.0 * p.log10()))
        .collect())
}

/// Plot `duration` seconds from `start` of the named channels that exist.
pub fn plot_traces<S: AsRef<str>>(
    path: &Path,
    title: &str,
    rec: &Recording,
    names: &[S],
    start: f64,
    duration: f64,
) -> Result<()> {
    let sfreq = rec.sfreq();
    let a = ((start * sfreq) as usize).min(rec.n_times().saturating_sub(1));
    let b = (((start + duration) * sfreq) as usize).min(rec.n_times());
    let mut series = Vec::new();
    for name in names {
        let name = name.as_ref();
        let Some(idx) = rec.info.index_of(name) else { continue };
        let row = rec.data.slice(s![idx, a..b]);
        // unit peak, stacked
        let peak = row.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);
        let offset = -2.5 * series.len() as f64;
        let points = row.iter().enumerate().map(|(i, v)| ((a + i) as f64 / sfreq, offset + v / peak)).collect();
        series.push(Series { name, points });
    }
    report::line_plot(path, title, "Time (s)", "Normalised amplitude", &series, &[])
}

/// A few channel names of each kind, for trace plots.
pub fn sample_channels(rec: &Recording, kinds: &[ChannelKind], per_kind: usize) -> Vec<String> {
    kinds
        .iter()
        .flat_map(|&k| rec.picks(&[k], false).into_iter().take(per_kind))
        .map(|i| rec.info.channels[i].name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn py_list_round_trip() {
        assert_eq!(py_list::<String>(&[]), "[]");
        let names = vec!["MEG0111".to_string(), "MEG2443".to_string()];
        let s = py_list(&names);
        assert_eq!(s, "['MEG0111', 'MEG2443']");
        assert_eq!(parse_py_list(&s), names);
        assert!(parse_py_list("[]").is_empty());
    }

    #[test]
    fn stage_names_parse() {
        for st in Stage::ALL {
            assert_eq!(st.as_str().parse::<Stage>().unwrap(), st);
        }
        assert!("preproc".parse::<Stage>().is_err());
    }
}
