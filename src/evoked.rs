//! Trial averages.
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::epoch::Epochs;
use crate::io::{StReader, StWriter};
use crate::recording::{ChannelKind, RecordingInfo};

#[derive(Debug, Clone)]
pub struct Evoked {
    pub info: RecordingInfo,
    /// `[C, T]`
    pub data: Array2<f64>,
    pub tmin: f64,
    /// Number of averaged epochs.
    pub nave: usize,
    pub comment: String,
}

#[derive(Serialize, Deserialize)]
struct EvokedMeta {
    info: RecordingInfo,
    tmin: f64,
    nave: usize,
    comment: String,
}

impl Epochs {
    /// Mean over all epochs.
    pub fn average(&self, comment: &str) -> Result<Evoked> {
        let Some(data) = self.data.mean_axis(Axis(0)) else {
            bail!("cannot average zero epochs ({comment})");
        };
        Ok(Evoked { info: self.info.clone(), data, tmin: self.tmin, nave: self.len(), comment: comment.to_string() })
    }
}

impl Evoked {
    pub fn times(&self) -> Vec<f64> {
        (0..self.data.ncols()).map(|i| self.tmin + i as f64 / self.info.sfreq).collect()
    }

    /// Global field power of one channel kind: standard deviation across
    /// channels for EEG (average reference), root mean square for MEG.
    /// `None` when the kind is absent.
    pub fn gfp(&self, kind: ChannelKind) -> Option<Vec<f64>> {
        let rows = self.info.picks(&[kind], true);
        if rows.is_empty() {
            return None;
        }
        let block = self.data.select(Axis(0), &rows);
        let n = rows.len() as f64;
        let gfp = block
            .columns()
            .into_iter()
            .map(|col| {
                let mean = if kind == ChannelKind::Eeg { col.sum() / n } else { 0.0 };
                (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            })
            .collect();
        Some(gfp)
    }
}

/// Write several evoked responses into one file.
pub fn save_evokeds(path: &Path, evokeds: &[Evoked]) -> Result<()> {
    let mut w = StWriter::new();
    let mut meta = Vec::with_capacity(evokeds.len());
    for (i, ev) in evokeds.iter().enumerate() {
        w.add_array(&format!("evoked_{i}"), &ev.data);
        meta.push(EvokedMeta { info: ev.info.clone(), tmin: ev.tmin, nave: ev.nave, comment: ev.comment.clone() });
    }
    w.add_meta("evokeds", &meta)?;
    w.write(path).with_context(|| format!("writing evoked file {}", path.display()))
}

pub fn load_evokeds(path: &Path) -> Result<Vec<Evoked>> {
    let r = StReader::open(path).with_context(|| format!("reading evoked file {}", path.display()))?;
    let meta: Vec<EvokedMeta> = r.meta("evokeds")?;
    meta.into_iter()
        .enumerate()
        .map(|(i, m)| {
            Ok(Evoked { data: r.array2(&format!("evoked_{i}"))?, info: m.info, tmin: m.tmin, nave: m.nave, comment: m.comment })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::recording::ChannelInfo;
    use ndarray::{array, Array3};
    use std::collections::BTreeMap;

    fn epochs() -> Epochs {
        let info = RecordingInfo::new(
            10.0,
            vec![ChannelInfo::new("EEG001", ChannelKind::Eeg), ChannelInfo::new("EEG002", ChannelKind::Eeg)],
        );
        let data = Array3::from_shape_fn((4, 2, 3), |(e, c, t)| (e + c * 10 + t) as f64);
        Epochs {
            info,
            data,
            events: (0..4).map(|e| Event { sample: 10 * e, prev: 0, code: 1 }).collect(),
            event_id: BTreeMap::from([("all".to_string(), 1)]),
            tmin: -0.1,
            drop_log: Vec::new(),
            metadata: None,
        }
    }

    #[test]
    fn average_and_gfp() {
        let evk = epochs().average("all").unwrap();
        assert_eq!(evk.nave, 4);
        assert_eq!(evk.data, array![[1.5, 2.5, 3.5], [11.5, 12.5, 13.5]]);
        let gfp = evk.gfp(ChannelKind::Eeg).unwrap();
        approx::assert_abs_diff_eq!(gfp[0], 5.0, epsilon = 1e-12);
        assert!(evk.gfp(ChannelKind::Mag).is_none());
    }

    #[test]
    fn empty_average_fails() {
        let ep = epochs().select(&[]).unwrap();
        assert!(ep.average("none").is_err());
    }

    #[test]
    fn evokeds_file_keeps_order() {
        let ep = epochs();
        let a = ep.select(&[0, 1]).unwrap().average("first").unwrap();
        let b = ep.select(&[2, 3]).unwrap().average("second").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evk.safetensors");
        save_evokeds(&path, &[a.clone(), b]).unwrap();
        let back = load_evokeds(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].comment, "first");
        assert_eq!(back[1].nave, 2);
        assert_eq!(back[0].data, a.data);
    }
}
