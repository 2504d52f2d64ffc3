//! Study configuration.
//!
//! [`StudyConfig`] holds every tunable parameter of the pipeline. It is read
//! from a JSON file, every section has defaults matching the study protocol,
//! and [`StudyConfig::validate`] rejects inconsistent settings before any
//! stage touches the data.
//!
//! Only the identity fields are required:
//!
//! ```
//! use meegprep::StudyConfig;
//!
//! let cfg = StudyConfig::from_json_str(r#"{
//!     "experiment": 1,
//!     "subject_id": "035",
//!     "site_id": "SB",
//!     "data_path": "/data/SB035"
//! }"#).unwrap();
//! assert_eq!(cfg.run_names()[0], "SB035_MEEG_V1_DurR1");
//! assert_eq!(cfg.factor(), "Duration");
//! ```
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::recording::ChannelKind;

// ── Experiment ────────────────────────────────────────────────────────────────

/// Which of the two experiment protocols the subject ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Experiment {
    /// Experiment 1: stimulus duration runs (`DurR1`–`DurR5`).
    Exp1,
    /// Experiment 2: video-game runs (`VGR1`–`VGR4`).
    Exp2,
}

impl TryFrom<u8> for Experiment {
    type Error = ConfigError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Experiment::Exp1),
            2 => Ok(Experiment::Exp2),
            other => Err(ConfigError::UnknownExperiment(other)),
        }
    }
}

impl From<Experiment> for u8 {
    fn from(e: Experiment) -> u8 {
        match e {
            Experiment::Exp1 => 1,
            Experiment::Exp2 => 2,
        }
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxwellMethod {
    Sss,
    Tsss,
}

impl MaxwellMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MaxwellMethod::Sss => "sss",
            MaxwellMethod::Tsss => "tsss",
        }
    }
}

/// Stage 01 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxwellConfig {
    /// `sss` or `tsss`. The method name is also the output file suffix.
    pub method: MaxwellMethod,
    /// tSSS buffer length in seconds. Ignored for SSS; defaults to 10 s for tSSS.
    pub st_duration: Option<f64>,
    /// Subspace correlation above which a temporal component is removed.
    pub st_correlation: f64,
    /// Internal multipole expansion order.
    pub int_order: usize,
    /// External multipole expansion order.
    pub ext_order: usize,
    /// Expansion origin in metres (device frame).
    pub origin: [f64; 3],
    /// Magnetometer weight relative to gradiometers in the fit.
    pub mag_scale: f64,
    /// Window length (s) for automatic noisy/flat detection.
    pub bad_window: f64,
    /// Robust z-score above which a window counts as noisy.
    pub bad_limit: f64,
    /// A window is flat when its amplitude is below this fraction of the
    /// channel-type median.
    pub flat_fraction: f64,
    /// Number of offending windows that makes a channel bad.
    pub min_count: usize,
    /// Low-pass applied before bad-channel scoring (Hz).
    pub bad_lowpass: f64,
}

impl Default for MaxwellConfig {
    fn default() -> Self {
        Self {
            method: MaxwellMethod::Sss,
            st_duration: None,
            st_correlation: 0.98,
            int_order: 8,
            ext_order: 3,
            origin: [0.0, 0.0, 0.04],
            mag_scale: 100.0,
            bad_window: 5.0,
            bad_limit: 7.0,
            flat_fraction: 0.01,
            min_count: 5,
            bad_lowpass: 40.0,
        }
    }
}

impl MaxwellConfig {
    /// Effective tSSS buffer length, `None` for plain SSS.
    pub fn st_duration(&self) -> Option<f64> {
        match self.method {
            MaxwellMethod::Sss => None,
            MaxwellMethod::Tsss => Some(self.st_duration.unwrap_or(10.0)),
        }
    }
}

/// Resampling and band-pass applied to the copies ICA is fitted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub l_freq: f64,
    pub h_freq: f64,
    pub sfreq: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { l_freq: 1.0, h_freq: 40.0, sfreq: 200.0 }
    }
}

/// Peak-to-peak rejection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectConfig {
    /// T/m.
    pub grad: f64,
    /// T.
    pub mag: f64,
    /// V. Only applied to subjects with EEG.
    pub eeg: f64,
}

impl Default for RejectConfig {
    fn default() -> Self {
        Self { grad: 4000e-13, mag: 4e-12, eeg: 200e-6 }
    }
}

impl RejectConfig {
    pub fn thresholds(&self, with_eeg: bool) -> Vec<(ChannelKind, f64)> {
        let mut t = vec![(ChannelKind::Grad, self.grad), (ChannelKind::Mag, self.mag)];
        if with_eeg {
            t.push((ChannelKind::Eeg, self.eeg));
        }
        t
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochConfig {
    pub tmin: f64,
    pub tmax: f64,
    pub reject: RejectConfig,
    /// Baseline window in seconds; `None` leaves epochs uncorrected.
    pub baseline: Option<[f64; 2]>,
    /// Drop epochs touching a `BAD…` annotation.
    pub reject_by_annotation: bool,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            tmin: -0.75,
            tmax: 2.25,
            reject: RejectConfig::default(),
            baseline: None,
            reject_by_annotation: false,
        }
    }
}

/// Number of ICA components: a variance fraction in `(0, 1]` or a count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NComponents {
    Count(usize),
    Variance(f64),
}

/// Manually curated artifact components, by index into each solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaExclude {
    pub meg_eog: Vec<usize>,
    pub meg_ecg: Vec<usize>,
    pub eeg_eog: Vec<usize>,
    pub eeg_ecg: Vec<usize>,
}

impl Default for IcaExclude {
    fn default() -> Self {
        Self { meg_eog: vec![0], meg_ecg: vec![18], eeg_eog: vec![0], eeg_ecg: vec![6] }
    }
}

impl IcaExclude {
    pub fn meg(&self) -> Vec<usize> {
        self.meg_eog.iter().chain(&self.meg_ecg).copied().collect()
    }

    pub fn eeg(&self) -> Vec<usize> {
        self.eeg_eog.iter().chain(&self.eeg_ecg).copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcaConfig {
    pub method: String,
    pub n_components: NComponents,
    pub max_iter: usize,
    pub random_state: u64,
    pub tol: f64,
    pub exclude: IcaExclude,
}

impl Default for IcaConfig {
    fn default() -> Self {
        Self {
            method: "fastica".into(),
            n_components: NComponents::Variance(0.99),
            max_iter: 800,
            random_state: 1688,
            tol: 1e-4,
            exclude: IcaExclude::default(),
        }
    }
}

/// Stage 02 thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BadEegConfig {
    pub max_iter: usize,
    pub deviation_threshold: f64,
    pub correlation_threshold: f64,
    pub noise_threshold: f64,
    /// Split between "low" and "high" frequency power (Hz); also the
    /// low-pass applied before the correlation test.
    pub split_freq: f64,
    /// Upper edge of the "high" band (Hz).
    pub noise_max_freq: f64,
}

impl Default for BadEegConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            deviation_threshold: 5.0,
            correlation_threshold: 0.4,
            noise_threshold: 5.0,
            split_freq: 50.0,
            noise_max_freq: 100.0,
        }
    }
}

/// Stage 03 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub muscle_threshold: f64,
    pub min_length_good: f64,
    pub muscle_band: [f64; 2],
    pub notch_freqs: Vec<f64>,
    pub muscle_smoothing: f64,
    pub eog_band: [f64; 2],
    pub blink_duration: f64,
    /// Bio channel promoted to EOG when fewer than two EOG channels exist.
    pub bio_channel: String,
    pub eog_rename: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            muscle_threshold: 5.0,
            min_length_good: 0.2,
            muscle_band: [110.0, 140.0],
            notch_freqs: vec![50.0, 100.0],
            muscle_smoothing: 4.0,
            eog_band: [1.0, 10.0],
            blink_duration: 0.5,
            bio_channel: "BIO002".into(),
            eog_rename: "EOG002".into(),
        }
    }
}

/// How `EventConfig::mask` is combined with stim values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskType {
    /// `value & mask`
    And,
    /// `value & !mask`
    NotAnd,
}

/// Stage 04 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub stim_channel: String,
    pub mask: i64,
    pub mask_type: MaskType,
    pub min_duration: f64,
    pub response_code: i32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            stim_channel: "STI101".into(),
            mask: 65280,
            mask_type: MaskType::NotAnd,
            min_duration: 0.001001,
            response_code: 255,
        }
    }
}

/// Factor (metadata column) and its levels used for averaging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub factor: Option<String>,
    pub conditions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreqBand {
    Low,
    High,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TfrMethod {
    Multitaper,
    Morlet,
}

/// One frequency band of the TFR: `freqs = fmin, fmin + step, … < fmax`,
/// `n_cycles = f / cycles_divisor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfrBand {
    pub fmin: f64,
    pub fmax: f64,
    pub step: f64,
    pub cycles_divisor: f64,
    pub time_bandwidth: f64,
}

impl TfrBand {
    pub fn freqs(&self) -> Vec<f64> {
        let n = ((self.fmax - self.fmin) / self.step).ceil().max(0.0) as usize;
        (0..n).map(|i| self.fmin + i as f64 * self.step).collect()
    }

    pub fn n_cycles(&self) -> Vec<f64> {
        self.freqs().iter().map(|f| f / self.cycles_divisor).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TfrConfig {
    pub freq_band: FreqBand,
    pub method: TfrMethod,
    /// Plot-only baseline window (s).
    pub baseline: [f64; 2],
    pub decim: usize,
    pub picks: ChannelKind,
    pub low: TfrBand,
    pub high: TfrBand,
}

impl Default for TfrConfig {
    fn default() -> Self {
        Self {
            freq_band: FreqBand::Both,
            method: TfrMethod::Multitaper,
            baseline: [-0.5, -0.25],
            decim: 2,
            picks: ChannelKind::Grad,
            low: TfrBand { fmin: 2.0, fmax: 30.0, step: 1.0, cycles_divisor: 2.0, time_bandwidth: 2.0 },
            high: TfrBand { fmin: 30.0, fmax: 100.0, step: 2.0, cycles_divisor: 4.0, time_bandwidth: 4.0 },
        }
    }
}

// ── StudyConfig ───────────────────────────────────────────────────────────────

/// Configuration for one subject of the study.
///
/// All sections are optional in the JSON file and fall back to the protocol
/// defaults; experiment-dependent values (run names, event ids, factor and
/// conditions, subjects without EEG) are derived from [`Experiment`] unless
/// given explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    pub experiment: Experiment,
    /// Subject number within the site, e.g. `"035"`.
    pub subject_id: String,
    /// Two-letter site code, e.g. `"SB"`.
    pub site_id: String,
    /// Directory holding the raw run recordings.
    pub data_path: PathBuf,
    /// Directory holding `sss_cal_<site>.dat` / `ct_sparse_<site>.fif`.
    #[serde(default)]
    pub cal_path: Option<PathBuf>,
    /// Output directory. Default: `<data_path>/out_path`.
    #[serde(default)]
    pub out_path: Option<PathBuf>,
    /// Run file stems. Default: derived from the experiment.
    #[serde(default)]
    pub runs: Option<Vec<String>>,
    /// Subjects recorded without EEG. Default: derived from site + experiment.
    #[serde(default)]
    pub no_eeg_subjects: Option<Vec<String>>,
    #[serde(default)]
    pub maxwell: MaxwellConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub epochs: EpochConfig,
    #[serde(default)]
    pub ica: IcaConfig,
    #[serde(default)]
    pub bad_eeg: BadEegConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub tfr: TfrConfig,
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value, reason: "must be positive" })
    }
}

impl StudyConfig {
    /// Minimal config with every section at its default.
    pub fn new(
        experiment: Experiment,
        subject_id: impl Into<String>,
        site_id: impl Into<String>,
        data_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            experiment,
            subject_id: subject_id.into(),
            site_id: site_id.into(),
            data_path: data_path.into(),
            cal_path: None,
            out_path: None,
            runs: None,
            no_eeg_subjects: None,
            maxwell: MaxwellConfig::default(),
            filter: FilterConfig::default(),
            epochs: EpochConfig::default(),
            ica: IcaConfig::default(),
            bad_eeg: BadEegConfig::default(),
            artifacts: ArtifactConfig::default(),
            events: EventConfig::default(),
            analysis: AnalysisConfig::default(),
            tfr: TfrConfig::default(),
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: StudyConfig =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing config {}", path.display()))
    }

    /// Check every cross-field invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject_id.trim().is_empty() {
            return Err(ConfigError::Empty("subject_id"));
        }
        if self.site_id.trim().is_empty() {
            return Err(ConfigError::Empty("site_id"));
        }
        if self.data_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty("data_path"));
        }
        if matches!(&self.runs, Some(r) if r.is_empty()) {
            return Err(ConfigError::Empty("runs"));
        }

        let m = &self.maxwell;
        if m.int_order == 0 {
            return Err(ConfigError::OutOfRange {
                field: "maxwell.int_order",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        if !(m.st_correlation > 0.0 && m.st_correlation <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "maxwell.st_correlation",
                value: m.st_correlation,
                reason: "must be in (0, 1]",
            });
        }
        if let Some(d) = m.st_duration() {
            if !(d > 0.0) {
                return Err(ConfigError::MissingStDuration);
            }
        }
        positive("maxwell.mag_scale", m.mag_scale)?;
        positive("maxwell.bad_window", m.bad_window)?;
        positive("maxwell.bad_limit", m.bad_limit)?;
        positive("maxwell.bad_lowpass", m.bad_lowpass)?;

        let f = &self.filter;
        positive("filter.l_freq", f.l_freq)?;
        positive("filter.sfreq", f.sfreq)?;
        if f.h_freq <= f.l_freq {
            return Err(ConfigError::OutOfRange {
                field: "filter.h_freq",
                value: f.h_freq,
                reason: "must be above filter.l_freq",
            });
        }
        if f.h_freq >= f.sfreq / 2.0 {
            return Err(ConfigError::OutOfRange {
                field: "filter.h_freq",
                value: f.h_freq,
                reason: "must be below the Nyquist frequency of filter.sfreq",
            });
        }

        let e = &self.epochs;
        if e.tmin >= e.tmax {
            return Err(ConfigError::EmptyEpochWindow { tmin: e.tmin, tmax: e.tmax });
        }
        positive("epochs.reject.grad", e.reject.grad)?;
        positive("epochs.reject.mag", e.reject.mag)?;
        positive("epochs.reject.eeg", e.reject.eeg)?;
        if let Some([b0, b1]) = e.baseline {
            if b0 > b1 || b0 < e.tmin || b1 > e.tmax {
                return Err(ConfigError::OutOfRange {
                    field: "epochs.baseline",
                    value: b0,
                    reason: "must be an ordered window inside [tmin, tmax]",
                });
            }
        }

        let ica = &self.ica;
        if ica.method != "fastica" {
            return Err(ConfigError::Unsupported { field: "ica.method", value: ica.method.clone() });
        }
        match ica.n_components {
            NComponents::Count(0) => {
                return Err(ConfigError::OutOfRange {
                    field: "ica.n_components",
                    value: 0.0,
                    reason: "must be at least 1",
                })
            }
            NComponents::Variance(v) if !(v > 0.0 && v <= 1.0) => {
                return Err(ConfigError::OutOfRange {
                    field: "ica.n_components",
                    value: v,
                    reason: "a variance fraction must be in (0, 1]",
                })
            }
            _ => {}
        }
        if ica.max_iter == 0 {
            return Err(ConfigError::OutOfRange {
                field: "ica.max_iter",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        positive("ica.tol", ica.tol)?;

        let b = &self.bad_eeg;
        if b.max_iter == 0 {
            return Err(ConfigError::OutOfRange {
                field: "bad_eeg.max_iter",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        positive("bad_eeg.deviation_threshold", b.deviation_threshold)?;
        positive("bad_eeg.noise_threshold", b.noise_threshold)?;
        if !(b.correlation_threshold > 0.0 && b.correlation_threshold < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "bad_eeg.correlation_threshold",
                value: b.correlation_threshold,
                reason: "must be in (0, 1)",
            });
        }
        if b.noise_max_freq <= b.split_freq {
            return Err(ConfigError::OutOfRange {
                field: "bad_eeg.noise_max_freq",
                value: b.noise_max_freq,
                reason: "must be above bad_eeg.split_freq",
            });
        }

        let a = &self.artifacts;
        positive("artifacts.muscle_threshold", a.muscle_threshold)?;
        if a.muscle_band[0] >= a.muscle_band[1] {
            return Err(ConfigError::OutOfRange {
                field: "artifacts.muscle_band",
                value: a.muscle_band[1],
                reason: "upper edge must be above the lower edge",
            });
        }
        if a.eog_band[0] >= a.eog_band[1] {
            return Err(ConfigError::OutOfRange {
                field: "artifacts.eog_band",
                value: a.eog_band[1],
                reason: "upper edge must be above the lower edge",
            });
        }

        if self.events.stim_channel.is_empty() {
            return Err(ConfigError::Empty("events.stim_channel"));
        }
        if self.factor().is_empty() {
            return Err(ConfigError::Empty("analysis.factor"));
        }
        if self.conditions().is_empty() {
            return Err(ConfigError::Empty("analysis.conditions"));
        }

        let t = &self.tfr;
        if t.decim == 0 {
            return Err(ConfigError::OutOfRange {
                field: "tfr.decim",
                value: 0.0,
                reason: "must be at least 1",
            });
        }
        if t.baseline[0] >= t.baseline[1] {
            return Err(ConfigError::OutOfRange {
                field: "tfr.baseline",
                value: t.baseline[1],
                reason: "end must be after start",
            });
        }
        for (name, band) in [("tfr.low", &t.low), ("tfr.high", &t.high)] {
            positive(name, band.step)?;
            positive(name, band.cycles_divisor)?;
            if band.fmin <= 0.0 || band.fmin >= band.fmax {
                return Err(ConfigError::OutOfRange {
                    field: name,
                    value: band.fmin,
                    reason: "need 0 < fmin < fmax",
                });
            }
            if t.method == TfrMethod::Multitaper && band.time_bandwidth < 2.0 {
                return Err(ConfigError::OutOfRange {
                    field: name,
                    value: band.time_bandwidth,
                    reason: "time_bandwidth must be at least 2 for one taper",
                });
            }
        }
        Ok(())
    }

    // ── Derived values ───────────────────────────────────────────────────────

    /// Site + subject, e.g. `SB035`.
    pub fn subject_tag(&self) -> String {
        format!("{}{}", self.site_id, self.subject_id)
    }

    /// Prefix shared by all run files, e.g. `SB035_MEEG_V1`.
    pub fn study_stem(&self) -> String {
        format!("{}_MEEG_V{}", self.subject_tag(), u8::from(self.experiment))
    }

    pub fn run_names(&self) -> Vec<String> {
        if let Some(r) = &self.runs {
            return r.clone();
        }
        let stem = self.study_stem();
        match self.experiment {
            Experiment::Exp1 => (1..=5).map(|i| format!("{stem}_DurR{i}")).collect(),
            Experiment::Exp2 => (1..=4).map(|i| format!("{stem}_VGR{i}")).collect(),
        }
    }

    pub fn no_eeg_subjects(&self) -> Vec<String> {
        if let Some(s) = &self.no_eeg_subjects {
            return s.clone();
        }
        let ids: &[&str] = match (self.site_id.as_str(), self.experiment) {
            ("SA", Experiment::Exp1) => &["101", "102", "103", "104"],
            ("SA", Experiment::Exp2) => &["104", "106"],
            _ => &[],
        };
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Whether EEG was recorded for this subject.
    pub fn has_eeg(&self) -> bool {
        !self.no_eeg_subjects().contains(&self.subject_id)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.out_path.clone().unwrap_or_else(|| self.data_path.join("out_path"))
    }

    /// Create the output directory if needed and return it.
    pub fn ensure_out_dir(&self) -> Result<PathBuf> {
        let dir = self.out_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Raw recording of a run, as delivered by acquisition.
    pub fn raw_file(&self, run: &str) -> PathBuf {
        self.data_path.join(format!("{run}.safetensors"))
    }

    /// Output file `<out>/<run><suffix>`.
    pub fn run_file(&self, run: &str, suffix: &str) -> PathBuf {
        self.out_dir().join(format!("{run}{suffix}"))
    }

    /// Output file `<out>/<stem><suffix>` for artifacts pooled over runs.
    pub fn study_file(&self, suffix: &str) -> PathBuf {
        self.out_dir().join(format!("{}{suffix}", self.study_stem()))
    }

    /// Trigger code of every epoching condition, e.g. `face1 → 1`.
    pub fn events_id(&self) -> BTreeMap<String, i32> {
        let mut ids = BTreeMap::new();
        match self.experiment {
            Experiment::Exp1 => {
                for (j, t) in ["face", "object", "letter", "false"].iter().enumerate() {
                    for i in 1..=20 {
                        ids.insert(format!("{t}{i}"), i + j as i32 * 20);
                    }
                }
            }
            Experiment::Exp2 => {
                ids.insert("blank".into(), 50);
                for (j, t) in ["face", "object"].iter().enumerate() {
                    for i in 1..=10 {
                        ids.insert(format!("{t}{i}"), i + j as i32 * 20);
                    }
                }
            }
        }
        ids
    }

    pub fn factor(&self) -> String {
        match (&self.analysis.factor, self.experiment) {
            (Some(f), _) => f.clone(),
            (None, Experiment::Exp1) => "Duration".into(),
            (None, Experiment::Exp2) => "Stimuli_type".into(),
        }
    }

    pub fn conditions(&self) -> Vec<String> {
        match (&self.analysis.conditions, self.experiment) {
            (Some(c), _) => c.clone(),
            (None, Experiment::Exp1) => vec!["500ms".into(), "1000ms".into(), "1500ms".into()],
            (None, Experiment::Exp2) => vec!["Face".into(), "Object".into()],
        }
    }

    /// Fine-calibration file for this site, if a calibration directory is set.
    pub fn fine_cal_file(&self) -> Option<PathBuf> {
        self.cal_path.as_ref().map(|p| p.join(format!("sss_cal_{}.dat", self.site_id)))
    }

    pub fn crosstalk_file(&self) -> Option<PathBuf> {
        self.cal_path.as_ref().map(|p| p.join(format!("ct_sparse_{}.fif", self.site_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> StudyConfig {
        StudyConfig::new(Experiment::Exp1, "035", "SB", "/data")
    }

    #[test]
    fn defaults_validate() {
        minimal().validate().unwrap();
    }

    #[test]
    fn run_names_follow_experiment() {
        let mut cfg = minimal();
        assert_eq!(cfg.run_names().len(), 5);
        assert_eq!(cfg.run_names()[4], "SB035_MEEG_V1_DurR5");
        cfg.experiment = Experiment::Exp2;
        assert_eq!(cfg.run_names(), vec![
            "SB035_MEEG_V2_VGR1",
            "SB035_MEEG_V2_VGR2",
            "SB035_MEEG_V2_VGR3",
            "SB035_MEEG_V2_VGR4",
        ]);
    }

    #[test]
    fn events_id_tables() {
        let cfg = minimal();
        let ids = cfg.events_id();
        assert_eq!(ids.len(), 80);
        assert_eq!(ids["face1"], 1);
        assert_eq!(ids["object1"], 21);
        assert_eq!(ids["false20"], 80);

        let mut cfg2 = minimal();
        cfg2.experiment = Experiment::Exp2;
        let ids2 = cfg2.events_id();
        assert_eq!(ids2.len(), 21);
        assert_eq!(ids2["blank"], 50);
        assert_eq!(ids2["object10"], 30);
    }

    #[test]
    fn no_eeg_subjects_by_site() {
        let mut cfg = StudyConfig::new(Experiment::Exp1, "102", "SA", "/data");
        assert!(!cfg.has_eeg());
        cfg.experiment = Experiment::Exp2;
        assert!(cfg.has_eeg());
        assert!(minimal().has_eeg());
    }

    #[test]
    fn validation_catches_bad_windows() {
        let mut cfg = minimal();
        cfg.epochs.tmin = 1.0;
        cfg.epochs.tmax = 0.5;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::EmptyEpochWindow { tmin: 1.0, tmax: 0.5 })
        );

        let mut cfg = minimal();
        cfg.filter.h_freq = 150.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { field: "filter.h_freq", .. })));

        let mut cfg = minimal();
        cfg.subject_id = " ".into();
        assert_eq!(cfg.validate(), Err(ConfigError::Empty("subject_id")));
    }

    #[test]
    fn tsss_duration_rules() {
        let mut cfg = minimal();
        cfg.maxwell.method = MaxwellMethod::Tsss;
        assert_eq!(cfg.maxwell.st_duration(), Some(10.0));
        cfg.maxwell.st_duration = Some(0.0);
        assert_eq!(cfg.validate(), Err(ConfigError::MissingStDuration));
    }

    #[test]
    fn json_round_trip_and_n_components() {
        let cfg = StudyConfig::from_json_str(
            r#"{"experiment": 2, "subject_id": "104", "site_id": "SA", "data_path": "/d",
                "ica": {"n_components": 20, "exclude": {"meg_eog": [1]}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.ica.n_components, NComponents::Count(20));
        assert_eq!(cfg.ica.exclude.meg(), vec![1, 18]);
        assert!(!cfg.has_eeg());

        let text = serde_json::to_string(&cfg).unwrap();
        let back = StudyConfig::from_json_str(&text).unwrap();
        assert_eq!(back.experiment, Experiment::Exp2);
        assert_eq!(back.ica.n_components, NComponents::Count(20));
    }

    #[test]
    fn unknown_experiment_rejected() {
        let err = StudyConfig::from_json_str(
            r#"{"experiment": 3, "subject_id": "1", "site_id": "SA", "data_path": "/d"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn tfr_band_frequencies() {
        let cfg = TfrConfig::default();
        let low = cfg.low.freqs();
        assert_eq!(low.len(), 28);
        assert_eq!(low[0], 2.0);
        assert_eq!(*low.last().unwrap(), 29.0);
        let high = cfg.high.freqs();
        assert_eq!(high.len(), 35);
        assert_eq!(*high.last().unwrap(), 98.0);
        approx::assert_abs_diff_eq!(cfg.high.n_cycles()[0], 7.5);
    }
}
