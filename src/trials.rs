//! Trial metadata decoded from trigger sequences.
//!
//! Each experiment encodes one trial as a short burst of trigger codes. The
//! decoders below turn the time-ordered [`Event`] list of a run into typed
//! rows; [`MetadataTable`] is the untyped CSV view used once the rows are
//! attached to epochs.
//!
//! ## Experiment 1
//!
//! | codes    | meaning                                       |
//! |----------|-----------------------------------------------|
//! | 1–80     | stimulus onset, category = `(code − 1) / 20`  |
//! | 101–103  | orientation                                   |
//! | 111–148  | trial id                                      |
//! | 151–153  | duration                                      |
//! | 201–203  | task relevance                                |
//! | 255      | response                                      |
//! | 97       | end of trial                                  |
//!
//! ## Experiment 2
//!
//! Stimulus codes below 51 (50 is a blank) are followed by a code whose
//! last digit is the trial type and whose tens give the location; probe
//! trials carry the visibility answer (98 seen, 99 unseen) four events later.
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Experiment;
use crate::error::DecodeError;
use crate::events::Event;

/// Maximum number of events (trial start included) searched for the
/// end-of-trial code.
pub const TRIAL_WINDOW: usize = 9;
pub const END_OF_TRIAL: i32 = 97;
pub const RESPONSE_CODE: i32 = 255;

pub const EXP1_COLUMNS: [&str; 8] = [
    "Stim_trigger",
    "Category",
    "Orientation",
    "Duration",
    "Task_relevance",
    "Trial_ID",
    "Response",
    "Response_time(s)",
];

pub const EXP2_COLUMNS: [&str; 6] = [
    "Trial_type",
    "Stim_trigger",
    "Stimuli_type",
    "Location",
    "Response",
    "Response_time(s)",
];

/// `True` / `False` cells.
mod py_bool {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *v { "True" } else { "False" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let s = String::deserialize(d)?;
        match s.trim() {
            "True" | "true" | "1" => Ok(true),
            "False" | "false" | "0" => Ok(false),
            other => Err(D::Error::custom(format!("`{other}` is not a boolean"))),
        }
    }
}

// ── Experiment 1 ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Face,
    Object,
    Letter,
    #[serde(rename = "false")]
    FalseFont,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Center,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Duration {
    #[serde(rename = "500ms")]
    Ms500,
    #[serde(rename = "1000ms")]
    Ms1000,
    #[serde(rename = "1500ms")]
    Ms1500,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskRelevance {
    #[serde(rename = "Relevant target")]
    RelevantTarget,
    #[serde(rename = "Relevant non-target")]
    RelevantNonTarget,
    Irrelevant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exp1Trial {
    #[serde(rename = "Stim_trigger")]
    pub stim_trigger: i32,
    #[serde(rename = "Category")]
    pub category: Category,
    #[serde(rename = "Orientation")]
    pub orientation: Orientation,
    #[serde(rename = "Duration")]
    pub duration: Duration,
    #[serde(rename = "Task_relevance")]
    pub task_relevance: TaskRelevance,
    #[serde(rename = "Trial_ID")]
    pub trial_id: i32,
    #[serde(rename = "Response", with = "py_bool")]
    pub response: bool,
    /// Seconds from stimulus onset to the first response.
    #[serde(rename = "Response_time(s)")]
    pub response_time: Option<f64>,
}

/// First code of `trial` in `lo..=hi`, as an offset from `lo`.
fn first_in(trial: &[Event], lo: i32, hi: i32) -> Option<usize> {
    trial.iter().find(|e| (lo..=hi).contains(&e.code)).map(|e| (e.code - lo) as usize)
}

/// Decode experiment 1 trials: one row per event with code below 81.
pub fn decode_exp1(events: &[Event], sfreq: f64) -> Result<Vec<Exp1Trial>, DecodeError> {
    const CATEGORIES: [Category; 4] =
        [Category::Face, Category::Object, Category::Letter, Category::FalseFont];
    const ORIENTATIONS: [Orientation; 3] = [Orientation::Center, Orientation::Left, Orientation::Right];
    const DURATIONS: [Duration; 3] = [Duration::Ms500, Duration::Ms1000, Duration::Ms1500];
    const RELEVANCE: [TaskRelevance; 3] = [
        TaskRelevance::RelevantTarget,
        TaskRelevance::RelevantNonTarget,
        TaskRelevance::Irrelevant,
    ];

    let mut trials = Vec::new();
    for (i, start) in events.iter().enumerate() {
        if start.code >= 81 {
            continue;
        }
        let (sample, code) = (start.sample, start.code);
        let missing = |field| DecodeError::MissingField { sample, code, field };

        let window = &events[i..(i + TRIAL_WINDOW).min(events.len())];
        let end = window.iter().position(|e| e.code == END_OF_TRIAL).ok_or(
            DecodeError::MissingTerminator { sample, code, terminator: END_OF_TRIAL, window: TRIAL_WINDOW },
        )?;
        let trial = &window[..end];

        let category = usize::try_from(code - 1)
            .ok()
            .and_then(|c| CATEGORIES.get(c / 20).copied())
            .ok_or(DecodeError::UnknownCode { sample, code, field: "category" })?;
        let orientation = ORIENTATIONS[first_in(trial, 101, 103).ok_or_else(|| missing("orientation"))?];
        let duration = DURATIONS[first_in(trial, 151, 153).ok_or_else(|| missing("duration"))?];
        let task_relevance = RELEVANCE[first_in(trial, 201, 203).ok_or_else(|| missing("task relevance"))?];
        let trial_id = trial
            .iter()
            .map(|e| e.code)
            .find(|c| (111..=148).contains(c))
            .ok_or_else(|| missing("trial id"))?;
        let response_at = trial.iter().find(|e| e.code == RESPONSE_CODE).map(|e| e.sample);

        trials.push(Exp1Trial {
            stim_trigger: code,
            category,
            orientation,
            duration,
            task_relevance,
            trial_id,
            response: response_at.is_some(),
            response_time: response_at.map(|r| (r - sample) as f64 / sfreq),
        });
    }
    Ok(trials)
}

// ── Experiment 2 ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialType {
    Filler,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimuliType {
    Face,
    Object,
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    #[serde(rename = "Upper Left")]
    UpperLeft,
    #[serde(rename = "Upper Right")]
    UpperRight,
    #[serde(rename = "Lower Right")]
    LowerRight,
    #[serde(rename = "Lower Left")]
    LowerLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Seen,
    Unseen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exp2Trial {
    #[serde(rename = "Trial_type")]
    pub trial_type: TrialType,
    #[serde(rename = "Stim_trigger")]
    pub stim_trigger: i32,
    #[serde(rename = "Stimuli_type")]
    pub stimuli_type: StimuliType,
    /// `None` for blank trials.
    #[serde(rename = "Location")]
    pub location: Option<Location>,
    /// Probe trials only.
    #[serde(rename = "Response")]
    pub response: Option<Visibility>,
    #[serde(rename = "Response_time(s)")]
    pub response_time: Option<f64>,
}

/// Blank-screen stimulus code.
pub const BLANK_CODE: i32 = 50;

/// Decode experiment 2 trials: one row per event with code below 51.
pub fn decode_exp2(events: &[Event], sfreq: f64) -> Result<Vec<Exp2Trial>, DecodeError> {
    const TYPES: [TrialType; 2] = [TrialType::Filler, TrialType::Probe];
    const STIMULI: [StimuliType; 3] = [StimuliType::Face, StimuliType::Object, StimuliType::Blank];
    const LOCATIONS: [Location; 4] =
        [Location::UpperLeft, Location::UpperRight, Location::LowerRight, Location::LowerLeft];
    const VISIBILITY: [Visibility; 2] = [Visibility::Seen, Visibility::Unseen];

    let mut trials = Vec::new();
    for (i, start) in events.iter().enumerate() {
        if start.code >= 51 {
            continue;
        }
        let (sample, code) = (start.sample, start.code);
        let at = |offset: usize| events.get(i + offset).ok_or(DecodeError::Truncated { sample, code, offset });
        let lookup = |table_len: usize, value: i32, ev: &Event, field| {
            usize::try_from(value)
                .ok()
                .filter(|&v| v < table_len)
                .ok_or(DecodeError::UnknownCode { sample: ev.sample, code: ev.code, field })
        };

        let next = at(1)?;
        let trial_type = TYPES[lookup(TYPES.len(), next.code % 10, next, "trial type")?];
        let (stimuli_type, location) = if code == BLANK_CODE {
            (StimuliType::Blank, None)
        } else {
            let stim = STIMULI[lookup(STIMULI.len(), code / 20, start, "stimulus type")?];
            let loc = LOCATIONS[lookup(LOCATIONS.len(), next.code / 10 - 6, next, "location")?];
            (stim, Some(loc))
        };
        let (response, response_time) = if trial_type == TrialType::Probe {
            let (prompt, answer) = (at(3)?, at(4)?);
            let seen = VISIBILITY[lookup(VISIBILITY.len(), answer.code - 98, answer, "response")?];
            (Some(seen), Some((answer.sample - prompt.sample) as f64 / sfreq))
        } else {
            (None, None)
        };

        trials.push(Exp2Trial { trial_type, stim_trigger: code, stimuli_type, location, response, response_time });
    }
    Ok(trials)
}

// ── Metadata table ────────────────────────────────────────────────────────

/// String-valued metadata rows with named columns, as read from or written
/// to a `-meta.csv` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MetadataTable {
    /// Serialise typed rows under the given header.
    pub fn from_rows<T: Serialize>(columns: &[&str], rows: &[T]) -> Result<Self> {
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        for row in rows {
            w.serialize(row)?;
        }
        let bytes = w.into_inner().context("flushing metadata rows")?;
        let mut r = csv::ReaderBuilder::new().has_headers(false).from_reader(bytes.as_slice());
        let rows = r
            .records()
            .map(|rec| rec.map(|rec| rec.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { columns: columns.iter().map(|c| c.to_string()).collect(), rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column, row by row.
    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let j = self
            .column_index(name)
            .with_context(|| format!("metadata has no column `{name}` (columns: {:?})", self.columns))?;
        Ok(self.rows.iter().map(|r| r.get(j).map_or("", String::as_str)).collect())
    }

    /// Row indices whose `column` equals `value`.
    pub fn matching(&self, column: &str, value: &str) -> Result<Vec<usize>> {
        Ok(self
            .column(column)?
            .into_iter()
            .enumerate()
            .filter(|(_, v)| *v == value)
            .map(|(i, _)| i)
            .collect())
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        Self { columns: self.columns.clone(), rows: rows.iter().map(|&i| self.rows[i].clone()).collect() }
    }

    /// Stack tables with identical columns.
    pub fn concat(tables: &[MetadataTable]) -> Result<Self> {
        let mut out = MetadataTable::default();
        for t in tables {
            if out.columns.is_empty() {
                out.columns = t.columns.clone();
            } else if !t.columns.is_empty() && t.columns != out.columns {
                anyhow::bail!("metadata columns differ: {:?} vs {:?}", out.columns, t.columns);
            }
            out.rows.extend(t.rows.iter().cloned());
        }
        Ok(out)
    }

    /// Deserialise every row into a typed record.
    pub fn to_rows<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record(&self.columns)?;
        for row in &self.rows {
            w.write_record(row)?;
        }
        let bytes = w.into_inner().context("flushing metadata rows")?;
        let mut r = csv::Reader::from_reader(bytes.as_slice());
        Ok(r.deserialize().collect::<std::result::Result<Vec<T>, _>>()?)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut w = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        w.write_record(&self.columns)?;
        for row in &self.rows {
            w.write_record(row)?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut r = csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
        let columns = r.headers()?.iter().map(str::to_string).collect();
        let rows = r
            .records()
            .map(|rec| rec.map(|rec| rec.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self { columns, rows })
    }
}

/// Decode the events of one run into the experiment's metadata table.
pub fn decode_trials(experiment: Experiment, events: &[Event], sfreq: f64) -> Result<MetadataTable> {
    match experiment {
        Experiment::Exp1 => MetadataTable::from_rows(&EXP1_COLUMNS, &decode_exp1(events, sfreq)?),
        Experiment::Exp2 => MetadataTable::from_rows(&EXP2_COLUMNS, &decode_exp2(events, sfreq)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(list: &[(i64, i32)]) -> Vec<Event> {
        list.iter().map(|&(sample, code)| Event { sample, prev: 0, code }).collect()
    }

    #[test]
    fn exp1_literal_trial() {
        let events = ev(&[(0, 1), (10, 101), (20, 151), (30, 201), (40, 120), (50, 97)]);
        let rows = decode_exp1(&events, 1000.0).unwrap();
        assert_eq!(
            rows,
            vec![Exp1Trial {
                stim_trigger: 1,
                category: Category::Face,
                orientation: Orientation::Center,
                duration: Duration::Ms500,
                task_relevance: TaskRelevance::RelevantTarget,
                trial_id: 120,
                response: false,
                response_time: None,
            }]
        );
    }

    #[test]
    fn exp1_response_time_in_seconds() {
        let events = ev(&[(0, 61), (5, 103), (10, 153), (20, 203), (30, 148), (800, 255), (900, 97)]);
        let row = &decode_exp1(&events, 1000.0).unwrap()[0];
        assert_eq!(row.category, Category::FalseFont);
        assert_eq!(row.orientation, Orientation::Right);
        assert!(row.response);
        approx::assert_abs_diff_eq!(row.response_time.unwrap(), 0.8);
    }

    #[test]
    fn exp1_missing_terminator() {
        let events = ev(&[(0, 1), (10, 101), (20, 151), (30, 201), (40, 120)]);
        assert_eq!(
            decode_exp1(&events, 1000.0).unwrap_err(),
            DecodeError::MissingTerminator { sample: 0, code: 1, terminator: 97, window: TRIAL_WINDOW }
        );
    }

    #[test]
    fn exp1_missing_field() {
        let events = ev(&[(0, 21), (10, 101), (20, 201), (40, 120), (50, 97)]);
        assert_eq!(
            decode_exp1(&events, 1000.0).unwrap_err(),
            DecodeError::MissingField { sample: 0, code: 21, field: "duration" }
        );
    }

    #[test]
    fn exp2_probe_and_blank() {
        let events = ev(&[
            (0, 3),
            (10, 71),
            (20, 150),
            (30, 160),
            (530, 99),
            (1000, 50),
            (1010, 60),
        ]);
        let rows = decode_exp2(&events, 1000.0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].trial_type, TrialType::Probe);
        assert_eq!(rows[0].stimuli_type, StimuliType::Face);
        assert_eq!(rows[0].location, Some(Location::UpperRight));
        assert_eq!(rows[0].response, Some(Visibility::Unseen));
        approx::assert_abs_diff_eq!(rows[0].response_time.unwrap(), 0.5);
        assert_eq!(rows[1].stimuli_type, StimuliType::Blank);
        assert_eq!(rows[1].location, None);
        assert_eq!(rows[1].response, None);
    }

    #[test]
    fn exp2_truncated_probe() {
        let events = ev(&[(0, 22), (10, 81), (20, 150)]);
        assert_eq!(
            decode_exp2(&events, 1000.0).unwrap_err(),
            DecodeError::Truncated { sample: 0, code: 22, offset: 3 }
        );
    }

    #[test]
    fn table_cells_use_python_booleans_and_blanks() {
        let events = ev(&[(0, 1), (10, 101), (20, 151), (30, 201), (40, 120), (50, 97)]);
        let table = decode_trials(Experiment::Exp1, &events, 1000.0).unwrap();
        assert_eq!(table.columns, EXP1_COLUMNS);
        assert_eq!(table.rows[0], ["1", "face", "Center", "500ms", "Relevant target", "120", "False", ""]);
        assert_eq!(table.matching("Category", "face").unwrap(), vec![0]);
    }
}
