//! Event-locked epoching.
//!
//! [`Epochs::new`] cuts `[tmin, tmax]` windows (both ends inclusive) around
//! every event whose code belongs to `event_id`, then drops:
//!
//! - windows running past either end of the data (`NO_DATA`);
//! - optionally, windows touching a `BAD…` annotation (its description);
//! - windows where any channel's peak-to-peak amplitude exceeds the
//!   rejection threshold of its kind (the offending channel names).
//!
//! `drop_log` has one entry per candidate event, empty for kept epochs.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::events::Event;
use crate::io::{StReader, StWriter};
use crate::normalize::baseline_correct_inplace;
use crate::recording::{ChannelKind, Recording, RecordingInfo};
use crate::trials::MetadataTable;

pub const NO_DATA: &str = "NO_DATA";

/// Windowing and rejection settings for [`Epochs::new`].
#[derive(Debug, Clone)]
pub struct EpochParams {
    pub tmin: f64,
    pub tmax: f64,
    /// Peak-to-peak limits per channel kind.
    pub reject: Vec<(ChannelKind, f64)>,
    pub reject_by_annotation: bool,
    /// Channel kinds to keep (bad channels excluded).
    pub picks: Vec<ChannelKind>,
}

#[derive(Debug, Clone)]
pub struct Epochs {
    /// Channel list of the epoched data; annotations are not carried over.
    pub info: RecordingInfo,
    /// `[E, C, T]`
    pub data: Array3<f64>,
    /// Events of the kept epochs, samples relative to the source recording.
    pub events: Vec<Event>,
    pub event_id: BTreeMap<String, i32>,
    pub tmin: f64,
    pub drop_log: Vec<Vec<String>>,
    /// Metadata rows of the kept epochs.
    pub metadata: Option<MetadataTable>,
}

#[derive(Serialize, Deserialize)]
struct EpochsMeta {
    info: RecordingInfo,
    event_id: BTreeMap<String, i32>,
    tmin: f64,
    drop_log: Vec<Vec<String>>,
    metadata: Option<MetadataTable>,
}

/// Peak-to-peak amplitude of a row.
fn ptp(row: ndarray::ArrayView1<'_, f64>) -> f64 {
    let (lo, hi) = row.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    hi - lo
}

impl Epochs {
    /// Epoch `rec` around `events` (absolute samples).
    ///
    /// `metadata`, when given, must hold one row per event selected by
    /// `event_id`, before any rejection.
    pub fn new(
        rec: &Recording,
        events: &[Event],
        event_id: &BTreeMap<String, i32>,
        params: &EpochParams,
        metadata: Option<MetadataTable>,
    ) -> Result<Epochs> {
        if params.tmin > params.tmax {
            bail!("epoch window [{}, {}] is empty", params.tmin, params.tmax);
        }
        let codes: Vec<i32> = event_id.values().copied().collect();
        let candidates: Vec<Event> = events.iter().filter(|e| codes.contains(&e.code)).copied().collect();
        if let Some(m) = &metadata {
            if m.len() != candidates.len() {
                return Err(PipelineError::ShapeMismatch {
                    what: "metadata rows per selected event",
                    expected: candidates.len(),
                    got: m.len(),
                }
                .into());
            }
        }

        let picks = rec.picks(&params.picks, true);
        if picks.is_empty() {
            return Err(PipelineError::NoChannels("epoch picks").into());
        }
        let picked = rec.pick(&picks);
        let sfreq = rec.sfreq();
        let start_off = (params.tmin * sfreq).round() as i64;
        let stop_off = (params.tmax * sfreq).round() as i64;
        let n_t = (stop_off - start_off + 1) as usize;

        let reject_rows: Vec<(usize, f64)> = params
            .reject
            .iter()
            .flat_map(|&(kind, thr)| {
                picked.info.channels.iter().enumerate().filter(move |(_, c)| c.kind == kind).map(move |(i, _)| (i, thr))
            })
            .collect();

        let mut windows: Vec<Array2<f64>> = Vec::new();
        let mut kept_events = Vec::new();
        let mut kept_rows = Vec::new();
        let mut drop_log = Vec::with_capacity(candidates.len());
        for (k, ev) in candidates.iter().enumerate() {
            let start = ev.sample - rec.info.first_samp + start_off;
            if start < 0 || start as usize + n_t > rec.n_times() {
                drop_log.push(vec![NO_DATA.to_string()]);
                continue;
            }
            let start = start as usize;
            if params.reject_by_annotation {
                let t0 = start as f64 / sfreq;
                let t1 = (start + n_t - 1) as f64 / sfreq;
                if let Some(desc) = rec.info.annotations.first_bad_overlap(t0, t1) {
                    drop_log.push(vec![desc.to_string()]);
                    continue;
                }
            }
            let window = picked.data.slice(s![.., start..start + n_t]);
            let offending: Vec<String> = reject_rows
                .iter()
                .filter(|&&(i, thr)| ptp(window.row(i)) > thr)
                .map(|&(i, _)| picked.info.channels[i].name.clone())
                .collect();
            if !offending.is_empty() {
                drop_log.push(offending);
                continue;
            }
            drop_log.push(Vec::new());
            windows.push(window.to_owned());
            kept_events.push(*ev);
            kept_rows.push(k);
        }

        let mut data = Array3::<f64>::zeros((windows.len(), picks.len(), n_t));
        for (e, w) in windows.iter().enumerate() {
            data.index_axis_mut(Axis(0), e).assign(w);
        }
        let mut info = picked.info.clone();
        info.annotations = Default::default();
        info!("{} of {} epochs kept", windows.len(), candidates.len());
        debug!("drop reasons: {:?}", drop_log.iter().filter(|d| !d.is_empty()).collect::<Vec<_>>());

        Ok(Epochs {
            info,
            data,
            events: kept_events,
            event_id: event_id.clone(),
            tmin: start_off as f64 / sfreq,
            drop_log,
            metadata: metadata.map(|m| m.select(&kept_rows)),
        })
    }

    pub fn len(&self) -> usize {
        self.data.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_times(&self) -> usize {
        self.data.dim().2
    }

    pub fn sfreq(&self) -> f64 {
        self.info.sfreq
    }

    pub fn times(&self) -> Vec<f64> {
        (0..self.n_times()).map(|i| self.tmin + i as f64 / self.sfreq()).collect()
    }

    pub fn ch_names(&self) -> Vec<String> {
        self.info.ch_names()
    }

    /// Subtract the per-epoch, per-channel mean of `[b0, b1]` seconds.
    pub fn apply_baseline(&mut self, b0: f64, b1: f64) {
        let sfreq = self.sfreq();
        let idx = |t: f64| ((t - self.tmin) * sfreq).round().max(0.0) as usize;
        let (start, stop) = (idx(b0), idx(b1) + 1);
        baseline_correct_inplace(&mut self.data, start, stop);
    }

    /// Copy restricted to the epochs at `idx`.
    ///
    /// Fails when an index is out of range or when `events` / `metadata` do
    /// not hold one entry per epoch.
    pub fn select(&self, idx: &[usize]) -> Result<Epochs> {
        let n = self.len();
        if self.events.len() != n {
            bail!("{} events for {n} epochs", self.events.len());
        }
        if let Some(m) = &self.metadata {
            if m.len() != n {
                bail!("{} metadata rows for {n} epochs", m.len());
            }
        }
        if let Some(&i) = idx.iter().find(|&&i| i >= n) {
            bail!("epoch index {i} out of range for {n} epochs");
        }
        Ok(Epochs {
            info: self.info.clone(),
            data: self.data.select(Axis(0), idx),
            events: idx.iter().map(|&i| self.events[i]).collect(),
            event_id: self.event_id.clone(),
            tmin: self.tmin,
            drop_log: self.drop_log.clone(),
            metadata: self.metadata.as_ref().map(|m| m.select(idx)),
        })
    }

    /// Epochs whose metadata column `factor` equals `condition`.
    pub fn select_condition(&self, factor: &str, condition: &str) -> Result<Epochs> {
        let meta = self.metadata.as_ref().context("epochs carry no metadata")?;
        self.select(&meta.matching(factor, condition)?)
    }

    /// Number of kept epochs per event name, in `event_id` order.
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.event_id
            .iter()
            .map(|(name, &code)| (name.clone(), self.events.iter().filter(|e| e.code == code).count()))
            .collect()
    }

    /// Percentage of candidate epochs that were dropped.
    pub fn drop_percentage(&self) -> f64 {
        if self.drop_log.is_empty() {
            return 0.0;
        }
        let dropped = self.drop_log.iter().filter(|d| !d.is_empty()).count();
        100.0 * dropped as f64 / self.drop_log.len() as f64
    }

    /// How often each reason (channel name or annotation) caused a drop,
    /// most frequent first.
    pub fn drop_reasons(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for reason in self.drop_log.iter().flatten() {
            *counts.entry(reason.as_str()).or_default() += 1;
        }
        let mut out: Vec<(String, usize)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Write the per-event-name counts as a one-row CSV.
    pub fn write_counts(&self, path: &Path) -> Result<()> {
        let counts = self.counts();
        let mut w = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        w.write_record(counts.iter().map(|(n, _)| n.as_str()))?;
        w.write_record(counts.iter().map(|(_, c)| c.to_string()))?;
        w.flush()?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = StWriter::new();
        w.add_array("data", &self.data);
        let events: Vec<i64> =
            self.events.iter().flat_map(|e| [e.sample, e.prev as i64, e.code as i64]).collect();
        w.add_i64("events", &events, &[self.events.len(), 3]);
        w.add_meta(
            "epochs",
            &EpochsMeta {
                info: self.info.clone(),
                event_id: self.event_id.clone(),
                tmin: self.tmin,
                drop_log: self.drop_log.clone(),
                metadata: self.metadata.clone(),
            },
        )?;
        w.write(path).with_context(|| format!("writing epochs {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Epochs> {
        let r = StReader::open(path).with_context(|| format!("reading epochs {}", path.display()))?;
        let meta: EpochsMeta = r.meta("epochs")?;
        let data = r.array3("data")?;
        let (raw_events, _) = r.i64_tensor("events")?;
        let events: Vec<Event> = raw_events
            .chunks_exact(3)
            .map(|c| Event { sample: c[0], prev: c[1] as i32, code: c[2] as i32 })
            .collect();
        if events.len() != data.dim().0 {
            return Err(PipelineError::ShapeMismatch { what: "events per epoch", expected: data.dim().0, got: events.len() }
                .into());
        }
        Ok(Epochs {
            info: meta.info,
            data,
            events,
            event_id: meta.event_id,
            tmin: meta.tmin,
            drop_log: meta.drop_log,
            metadata: meta.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::ChannelInfo;
    use ndarray::Array2;

    fn recording() -> Recording {
        let channels = vec![
            ChannelInfo::new("MEG0111", ChannelKind::Mag),
            ChannelInfo::new("EEG001", ChannelKind::Eeg),
            ChannelInfo::new("STI101", ChannelKind::Stim),
        ];
        let data = Array2::from_shape_fn((3, 1000), |(c, t)| if c == 0 { 1e-13 * t as f64 } else { 0.0 });
        let mut rec = Recording::new(RecordingInfo::new(100.0, channels), data).unwrap();
        rec.info.first_samp = 500;
        rec
    }

    fn params() -> EpochParams {
        EpochParams {
            tmin: -0.1,
            tmax: 0.2,
            reject: vec![(ChannelKind::Mag, 1e-11)],
            reject_by_annotation: false,
            picks: vec![ChannelKind::Mag, ChannelKind::Eeg],
        }
    }

    fn ids() -> BTreeMap<String, i32> {
        BTreeMap::from([("a".to_string(), 1), ("b".to_string(), 2)])
    }

    #[test]
    fn window_includes_both_ends() {
        let events = [Event { sample: 600, prev: 0, code: 1 }];
        let ep = Epochs::new(&recording(), &events, &ids(), &params(), None).unwrap();
        assert_eq!(ep.data.dim(), (1, 2, 31));
        approx::assert_abs_diff_eq!(ep.times()[0], -0.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(ep.times()[30], 0.2, epsilon = 1e-12);
        // sample 600 is index 100 of the data; the window starts 10 earlier
        approx::assert_abs_diff_eq!(ep.data[[0, 0, 0]], 90e-13, epsilon = 1e-20);
    }

    #[test]
    fn out_of_range_and_peak_to_peak_drops() {
        let mut rec = recording();
        rec.data[[0, 400]] = 1e-10;
        let events = [
            Event { sample: 505, prev: 0, code: 1 },
            Event { sample: 900, prev: 0, code: 2 },
            Event { sample: 700, prev: 0, code: 3 },
            Event { sample: 1200, prev: 0, code: 2 },
        ];
        let ep = Epochs::new(&rec, &events, &ids(), &params(), None).unwrap();
        assert_eq!(ep.len(), 1);
        assert_eq!(ep.drop_log.len(), 3);
        assert_eq!(ep.drop_log[0], vec![NO_DATA]);
        assert_eq!(ep.drop_log[1], vec!["MEG0111"]);
        assert!(ep.drop_log[2].is_empty());
        assert_eq!(ep.counts(), vec![("a".to_string(), 0), ("b".to_string(), 1)]);
        approx::assert_abs_diff_eq!(ep.drop_percentage(), 200.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn metadata_must_match_selected_events() {
        let events = [Event { sample: 600, prev: 0, code: 1 }, Event { sample: 700, prev: 0, code: 2 }];
        let meta = MetadataTable { columns: vec!["Category".into()], rows: vec![vec!["face".into()]] };
        let err = Epochs::new(&recording(), &events, &ids(), &params(), Some(meta)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ShapeMismatch { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn condition_selection_follows_metadata() {
        let events = [Event { sample: 600, prev: 0, code: 1 }, Event { sample: 700, prev: 0, code: 2 }];
        let meta = MetadataTable {
            columns: vec!["Category".into()],
            rows: vec![vec!["face".into()], vec!["object".into()]],
        };
        let ep = Epochs::new(&recording(), &events, &ids(), &params(), Some(meta)).unwrap();
        let faces = ep.select_condition("Category", "face").unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces.events[0].sample, 600);
        assert!(ep.select_condition("Missing", "x").is_err());
    }

    #[test]
    fn select_checks_indices_and_events() {
        let events = [Event { sample: 600, prev: 0, code: 1 }, Event { sample: 700, prev: 0, code: 2 }];
        let mut ep = Epochs::new(&recording(), &events, &ids(), &params(), None).unwrap();
        assert_eq!(ep.select(&[1]).unwrap().events[0].sample, 700);
        assert!(ep.select(&[2]).is_err());
        ep.events.clear();
        assert!(ep.select(&[0]).is_err());
    }

    #[test]
    fn baseline_removes_pre_stimulus_mean() {
        let events = [Event { sample: 600, prev: 0, code: 1 }];
        let mut ep = Epochs::new(&recording(), &events, &ids(), &params(), None).unwrap();
        ep.apply_baseline(-0.1, 0.0);
        let pre: f64 = ep.data.slice(s![0, 0, 0..11]).sum();
        approx::assert_abs_diff_eq!(pre, 0.0, epsilon = 1e-20);
    }

    #[test]
    fn annotation_rejection_is_optional() {
        let mut rec = recording();
        rec.info.annotations.push(0.95, 0.1, "BAD_muscle");
        let events = [Event { sample: 600, prev: 0, code: 1 }];
        let mut p = params();
        assert_eq!(Epochs::new(&rec, &events, &ids(), &p, None).unwrap().len(), 1);
        p.reject_by_annotation = true;
        let ep = Epochs::new(&rec, &events, &ids(), &p, None).unwrap();
        assert!(ep.is_empty());
        assert_eq!(ep.drop_log[0], vec!["BAD_muscle"]);
    }

    #[test]
    fn save_and_load_keep_events_and_metadata() {
        let events = [Event { sample: 600, prev: 0, code: 1 }, Event { sample: 700, prev: 0, code: 2 }];
        let meta = MetadataTable {
            columns: vec!["Category".into()],
            rows: vec![vec!["face".into()], vec!["object".into()]],
        };
        let ep = Epochs::new(&recording(), &events, &ids(), &params(), Some(meta)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_epo.safetensors");
        ep.save(&path).unwrap();
        let back = Epochs::load(&path).unwrap();
        assert_eq!(back.events, ep.events);
        assert_eq!(back.metadata, ep.metadata);
        assert_eq!(back.data, ep.data);
        assert_eq!(back.ch_names(), vec!["MEG0111", "EEG001"]);
    }
}
