//! Continuous multi-channel recordings and their measurement info.
//!
//! A [`Recording`] is the unit every stage reads and writes: a `[C, T]` array
//! of calibrated samples (T, T/m, V) plus the [`RecordingInfo`] describing
//! each channel. Channel locations follow the FIFF convention
//! `[r0(3), ex(3), ey(3), ez(3)]` in metres, device frame.
use std::collections::BTreeSet;
use std::fmt;

use anyhow::{bail, Result};
use ndarray::{s, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::annotations::Annotations;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Planar gradiometer (T/m).
    Grad,
    /// Magnetometer (T).
    Mag,
    Eeg,
    Eog,
    Ecg,
    Stim,
    /// Unassigned bio-signal input; stage 03 may promote one to EOG.
    Bio,
    Misc,
}

impl ChannelKind {
    pub fn is_meg(self) -> bool {
        matches!(self, ChannelKind::Grad | ChannelKind::Mag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Grad => "grad",
            ChannelKind::Mag => "mag",
            ChannelKind::Eeg => "eeg",
            ChannelKind::Eog => "eog",
            ChannelKind::Ecg => "ecg",
            ChannelKind::Stim => "stim",
            ChannelKind::Bio => "bio",
            ChannelKind::Misc => "misc",
        }
    }

    pub const MEG: [ChannelKind; 2] = [ChannelKind::Grad, ChannelKind::Mag];
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub loc: [f64; 12],
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self { name: name.into(), kind, loc: [0.0; 12] }
    }

    pub fn with_loc(mut self, loc: [f64; 12]) -> Self {
        self.loc = loc;
        self
    }

    /// Sensor position in metres.
    pub fn pos(&self) -> [f64; 3] {
        [self.loc[0], self.loc[1], self.loc[2]]
    }

    /// Coil x axis (gradiometer baseline direction).
    pub fn ex(&self) -> [f64; 3] {
        [self.loc[3], self.loc[4], self.loc[5]]
    }

    /// Coil normal.
    pub fn ez(&self) -> [f64; 3] {
        [self.loc[9], self.loc[10], self.loc[11]]
    }
}

/// Everything about a recording except the samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub sfreq: f64,
    /// Acquisition-time index of the first sample.
    #[serde(default)]
    pub first_samp: i64,
    pub channels: Vec<ChannelInfo>,
    #[serde(default)]
    pub bads: Vec<String>,
    #[serde(default)]
    pub annotations: Annotations,
}

impl RecordingInfo {
    pub fn new(sfreq: f64, channels: Vec<ChannelInfo>) -> Self {
        Self { sfreq, first_samp: 0, channels, bads: Vec::new(), annotations: Annotations::new() }
    }

    pub fn ch_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    pub fn is_bad(&self, name: &str) -> bool {
        self.bads.iter().any(|b| b == name)
    }

    /// Indices of channels whose kind is in `kinds`, in channel order.
    pub fn picks(&self, kinds: &[ChannelKind], exclude_bads: bool) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| kinds.contains(&c.kind))
            .filter(|(_, c)| !exclude_bads || !self.is_bad(&c.name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Info restricted to the channels at `idx`.
    pub fn pick(&self, idx: &[usize]) -> RecordingInfo {
        let channels: Vec<ChannelInfo> = idx.iter().map(|&i| self.channels[i].clone()).collect();
        let bads = self.bads.iter().filter(|b| channels.iter().any(|c| &c.name == *b)).cloned().collect();
        RecordingInfo {
            sfreq: self.sfreq,
            first_samp: self.first_samp,
            channels,
            bads,
            annotations: self.annotations.clone(),
        }
    }

    pub fn count(&self, kind: ChannelKind) -> usize {
        self.channels.iter().filter(|c| c.kind == kind).count()
    }
}

/// A continuous recording: `data` is `[C, T]`.
#[derive(Debug, Clone)]
pub struct Recording {
    pub info: RecordingInfo,
    pub data: Array2<f64>,
}

impl Recording {
    pub fn new(info: RecordingInfo, data: Array2<f64>) -> Result<Self> {
        if data.nrows() != info.channels.len() {
            return Err(PipelineError::ShapeMismatch {
                what: "data rows vs. channels",
                expected: info.channels.len(),
                got: data.nrows(),
            }
            .into());
        }
        Ok(Self { info, data })
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    pub fn sfreq(&self) -> f64 {
        self.info.sfreq
    }

    pub fn duration(&self) -> f64 {
        self.n_times() as f64 / self.info.sfreq
    }

    /// Sample times in seconds relative to the first sample.
    pub fn times(&self) -> Vec<f64> {
        (0..self.n_times()).map(|i| i as f64 / self.info.sfreq).collect()
    }

    pub fn ch_names(&self) -> Vec<String> {
        self.info.ch_names()
    }

    pub fn has_kind(&self, kind: ChannelKind) -> bool {
        self.info.channels.iter().any(|c| c.kind == kind)
    }

    pub fn picks(&self, kinds: &[ChannelKind], exclude_bads: bool) -> Vec<usize> {
        self.info.picks(kinds, exclude_bads)
    }

    pub fn channel(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        let idx = self
            .info
            .index_of(name)
            .ok_or_else(|| PipelineError::MissingChannel(name.to_string()))?;
        Ok(self.data.row(idx))
    }

    /// Copy restricted to the channels at `idx` (bads outside the selection
    /// are dropped from the bad list).
    pub fn pick(&self, idx: &[usize]) -> Recording {
        Recording { info: self.info.pick(idx), data: self.data.select(Axis(0), idx) }
    }

    /// Copy holding only channels of the given kinds (bads included).
    pub fn pick_kinds(&self, kinds: &[ChannelKind]) -> Result<Recording> {
        let idx = self.picks(kinds, false);
        if idx.is_empty() {
            let name = kinds.first().map(|k| k.as_str()).unwrap_or("any");
            return Err(PipelineError::NoChannels(name).into());
        }
        Ok(self.pick(&idx))
    }

    /// Add channels to the bad list, skipping duplicates.
    pub fn mark_bad<S: AsRef<str>>(&mut self, names: &[S]) {
        for n in names {
            let n = n.as_ref();
            if !self.info.is_bad(n) {
                self.info.bads.push(n.to_string());
            }
        }
    }

    pub fn set_channel_kind(&mut self, name: &str, kind: ChannelKind) -> Result<()> {
        let idx = self
            .info
            .index_of(name)
            .ok_or_else(|| PipelineError::MissingChannel(name.to_string()))?;
        self.info.channels[idx].kind = kind;
        Ok(())
    }

    pub fn rename_channel(&mut self, old: &str, new: &str) -> Result<()> {
        if self.info.index_of(new).is_some() {
            bail!("cannot rename `{old}`: channel `{new}` already exists");
        }
        let idx = self
            .info
            .index_of(old)
            .ok_or_else(|| PipelineError::MissingChannel(old.to_string()))?;
        self.info.channels[idx].name = new.to_string();
        for b in self.info.bads.iter_mut().filter(|b| b.as_str() == old) {
            *b = new.to_string();
        }
        Ok(())
    }

    /// Overwrite the rows at `idx` with the rows of `rows`.
    pub fn assign_rows(&mut self, idx: &[usize], rows: &Array2<f64>) -> Result<()> {
        if rows.nrows() != idx.len() || rows.ncols() != self.n_times() {
            bail!(
                "row block is {:?}, expected [{}, {}]",
                rows.dim(),
                idx.len(),
                self.n_times()
            );
        }
        for (k, &i) in idx.iter().enumerate() {
            self.data.row_mut(i).assign(&rows.row(k));
        }
        Ok(())
    }

    /// Concatenate runs as if they were recorded back to back.
    ///
    /// Returns the joined recording and, for every run, the offset to add to
    /// that run's absolute event samples so they index the joined data.
    pub fn concatenate(runs: &[Recording]) -> Result<(Recording, Vec<i64>)> {
        let first = match runs.first() {
            Some(r) => r,
            None => bail!("nothing to concatenate"),
        };
        let names = first.ch_names();
        let sfreq = first.info.sfreq;
        for r in &runs[1..] {
            if r.ch_names() != names {
                bail!("runs have different channel lists");
            }
            if (r.info.sfreq - sfreq).abs() > 1e-9 {
                bail!("runs have different sampling rates ({} vs {sfreq})", r.info.sfreq);
            }
        }

        let n_total: usize = runs.iter().map(|r| r.n_times()).sum();
        let mut data = Array2::<f64>::zeros((names.len(), n_total));
        let mut info = first.info.clone();
        info.annotations = Annotations::new();
        let bads: BTreeSet<String> =
            runs.iter().flat_map(|r| r.info.bads.iter().cloned()).collect();
        info.bads = first
            .info
            .channels
            .iter()
            .filter(|c| bads.contains(&c.name))
            .map(|c| c.name.clone())
            .collect();

        let mut offsets = Vec::with_capacity(runs.len());
        let mut cursor = 0usize;
        for (k, r) in runs.iter().enumerate() {
            let n = r.n_times();
            data.slice_mut(s![.., cursor..cursor + n]).assign(&r.data);
            let t0 = cursor as f64 / sfreq;
            if k > 0 {
                info.annotations.push(t0, 0.0, "BAD boundary");
                info.annotations.push(t0, 0.0, "EDGE boundary");
            }
            info.annotations.extend(&r.info.annotations.shifted(t0));
            offsets.push(cursor as i64 + first.info.first_samp - r.info.first_samp);
            cursor += n;
        }
        Ok((Recording { info, data }, offsets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Recording {
        let channels = vec![
            ChannelInfo::new("MEG0111", ChannelKind::Mag),
            ChannelInfo::new("EEG001", ChannelKind::Eeg),
            ChannelInfo::new("EEG002", ChannelKind::Eeg),
            ChannelInfo::new("STI101", ChannelKind::Stim),
        ];
        let data = Array2::from_shape_fn((4, 10), |(c, t)| (c * 100 + t) as f64);
        Recording::new(RecordingInfo::new(100.0, channels), data).unwrap()
    }

    #[test]
    fn pick_kinds_keeps_order_and_bads() {
        let mut rec = toy();
        rec.mark_bad(&["EEG002", "MEG0111"]);
        let eeg = rec.pick_kinds(&[ChannelKind::Eeg]).unwrap();
        assert_eq!(eeg.ch_names(), vec!["EEG001", "EEG002"]);
        assert_eq!(eeg.info.bads, vec!["EEG002"]);
        assert_eq!(eeg.data[[1, 3]], 203.0);
    }

    #[test]
    fn pick_missing_kind_is_an_error() {
        assert!(toy().pick_kinds(&[ChannelKind::Eog]).is_err());
    }

    #[test]
    fn rename_updates_bads() {
        let mut rec = toy();
        rec.mark_bad(&["EEG001"]);
        rec.rename_channel("EEG001", "EEG101").unwrap();
        assert_eq!(rec.info.bads, vec!["EEG101"]);
        assert!(rec.rename_channel("EEG101", "EEG002").is_err());
    }

    #[test]
    fn concatenate_offsets_events() {
        let a = toy();
        let mut b = toy();
        b.info.first_samp = 5000;
        let (joined, offsets) = Recording::concatenate(&[a, b]).unwrap();
        assert_eq!(joined.n_times(), 20);
        // An event at b's first sample lands right after a's last sample.
        assert_eq!(5000 + offsets[1], 10);
        assert_eq!(offsets[0], 0);
        assert_eq!(joined.info.annotations.count("BAD boundary"), 1);
        assert_eq!(joined.data[[0, 12]], 2.0);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let info = RecordingInfo::new(100.0, vec![ChannelInfo::new("A", ChannelKind::Eeg)]);
        assert!(Recording::new(info, Array2::zeros((2, 5))).is_err());
    }
}
