//! Trigger events from the stim channel.
//!
//! An [`Event`] is the MNE triple `(sample, previous value, code)`; samples
//! are absolute, i.e. they include the recording's `first_samp`.
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{EventConfig, MaskType};
use crate::recording::Recording;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sample: i64,
    pub prev: i32,
    pub code: i32,
}

/// Options of [`find_events`], mirroring `mne.find_events`.
#[derive(Debug, Clone)]
pub struct FindEvents<'a> {
    pub stim_channel: &'a str,
    /// Report every change to a nonzero value, not only steps up from zero.
    pub consecutive: bool,
    /// Events lasting less than this many seconds are dropped.
    pub min_duration: f64,
    pub mask: Option<i64>,
    pub mask_type: MaskType,
}

impl<'a> FindEvents<'a> {
    pub fn new(stim_channel: &'a str) -> Self {
        Self { stim_channel, consecutive: false, min_duration: 0.0, mask: None, mask_type: MaskType::And }
    }
}

fn apply_mask(v: i64, mask: Option<i64>, mask_type: MaskType) -> i64 {
    match (mask, mask_type) {
        (None, _) => v,
        (Some(m), MaskType::And) => v & m,
        (Some(m), MaskType::NotAnd) => v & !m,
    }
}

/// Find trigger onsets on a stim channel.
pub fn find_events(rec: &Recording, opts: &FindEvents<'_>) -> Result<Vec<Event>> {
    let stim: Vec<i64> = rec
        .channel(opts.stim_channel)?
        .iter()
        .map(|&v| apply_mask(v.round() as i64, opts.mask, opts.mask_type))
        .collect();
    let Some(&first) = stim.first() else {
        return Ok(Vec::new());
    };

    // (index, prev, new) of every value change
    let mut steps: Vec<(usize, i64, i64)> = Vec::new();
    if first != 0 {
        steps.push((0, 0, first));
    }
    for i in 1..stim.len() {
        if stim[i] != stim[i - 1] {
            steps.push((i, stim[i - 1], stim[i]));
        }
    }

    let min_samples = opts.min_duration * rec.sfreq();
    let mut events = Vec::new();
    for (k, &(idx, prev, new)) in steps.iter().enumerate() {
        if new == 0 || (!opts.consecutive && prev != 0) {
            continue;
        }
        let end = steps.get(k + 1).map_or(stim.len(), |s| s.0);
        if ((end - idx) as f64) < min_samples {
            continue;
        }
        events.push(Event {
            sample: idx as i64 + rec.info.first_samp,
            prev: prev as i32,
            code: new as i32,
        });
    }
    debug!("{} events on {}", events.len(), opts.stim_channel);
    Ok(events)
}

/// Stage 04 event extraction: responses found on steps up from zero, every
/// other code found with `consecutive = true` and `min_duration`, merged and
/// sorted by sample.
pub fn extract_events(rec: &Recording, cfg: &EventConfig) -> Result<Vec<Event>> {
    let mut opts = FindEvents::new(&cfg.stim_channel);
    opts.mask = Some(cfg.mask);
    opts.mask_type = cfg.mask_type;
    let responses: Vec<Event> =
        find_events(rec, &opts)?.into_iter().filter(|e| e.code == cfg.response_code).collect();

    opts.consecutive = true;
    opts.min_duration = cfg.min_duration;
    let mut events: Vec<Event> =
        find_events(rec, &opts)?.into_iter().filter(|e| e.code != cfg.response_code).collect();

    events.extend(responses);
    events.sort_by_key(|e| e.sample);
    Ok(events)
}

/// Add `offset` samples to every event.
pub fn shift_events(events: &[Event], offset: i64) -> Vec<Event> {
    events.iter().map(|e| Event { sample: e.sample + offset, ..*e }).collect()
}

/// Write events in the MNE text layout, one `sample prev code` per line.
pub fn write_events(path: &Path, events: &[Event]) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for e in events {
        writeln!(w, "{:>8} {:>6} {:>6}", e.sample, e.prev, e.code)?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut events = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            bail!("{}:{}: expected 3 columns, found {}", path.display(), lineno + 1, fields.len());
        }
        let parse = |s: &str| -> Result<i64> {
            s.parse::<i64>().with_context(|| format!("{}:{}: bad integer `{s}`", path.display(), lineno + 1))
        };
        events.push(Event {
            sample: parse(fields[0])?,
            prev: parse(fields[1])? as i32,
            code: parse(fields[2])? as i32,
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{ChannelInfo, ChannelKind, RecordingInfo};
    use ndarray::Array2;

    fn stim_recording(values: &[f64]) -> Recording {
        let info = RecordingInfo::new(1000.0, vec![ChannelInfo::new("STI101", ChannelKind::Stim)]);
        let data = Array2::from_shape_vec((1, values.len()), values.to_vec()).unwrap();
        let mut rec = Recording::new(info, data).unwrap();
        rec.info.first_samp = 100;
        rec
    }

    #[test]
    fn consecutive_controls_step_changes() {
        let rec = stim_recording(&[0.0, 0.0, 5.0, 5.0, 7.0, 7.0, 0.0, 3.0, 3.0]);
        let mut opts = FindEvents::new("STI101");
        let ev = find_events(&rec, &opts).unwrap();
        assert_eq!(ev.iter().map(|e| (e.sample, e.code)).collect::<Vec<_>>(), vec![(102, 5), (107, 3)]);

        opts.consecutive = true;
        let ev = find_events(&rec, &opts).unwrap();
        assert_eq!(ev.iter().map(|e| e.code).collect::<Vec<_>>(), vec![5, 7, 3]);
        assert_eq!(ev[1].prev, 5);
    }

    #[test]
    fn min_duration_drops_glitches() {
        let rec = stim_recording(&[0.0, 4.0, 9.0, 9.0, 9.0, 0.0]);
        let mut opts = FindEvents::new("STI101");
        opts.consecutive = true;
        opts.min_duration = 0.001001;
        let ev = find_events(&rec, &opts).unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].code, 9);
    }

    #[test]
    fn not_and_mask_keeps_low_byte() {
        // 255 on the response byte plus 1 on the stimulus byte
        let rec = stim_recording(&[0.0, 256.0 * 3.0 + 12.0, 256.0 * 3.0 + 12.0, 0.0]);
        let mut opts = FindEvents::new("STI101");
        opts.mask = Some(65280);
        opts.mask_type = MaskType::NotAnd;
        assert_eq!(find_events(&rec, &opts).unwrap()[0].code, 12);
        opts.mask_type = MaskType::And;
        assert_eq!(find_events(&rec, &opts).unwrap()[0].code, 768);
    }

    #[test]
    fn events_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-eve.txt");
        let events = vec![
            Event { sample: 1200, prev: 0, code: 1 },
            Event { sample: 1250, prev: 1, code: 101 },
        ];
        write_events(&path, &events).unwrap();
        assert_eq!(read_events(&path).unwrap(), events);
        assert_eq!(shift_events(&events, -200)[0].sample, 1000);
    }
}
