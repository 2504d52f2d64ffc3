//! # meegprep — M/EEG preprocessing in pure Rust
//!
//! `meegprep` runs the preprocessing of one subject of a combined MEG/EEG
//! study: Maxwell filtering, bad-channel detection, artifact annotation,
//! trigger decoding, ICA, epoching, evoked averaging and time-frequency
//! power. Every stage reads the artifact of the previous one from the output
//! directory and writes its own, plus an HTML report with SVG figures.
//!
//! _No Python, no BLAS, no C libraries: ndarray + nalgebra + [RustFFT](https://crates.io/crates/rustfft)._
//!
//! ## Pipeline overview
//!
//! ```text
//! <run>.safetensors (raw MEG + EEG + EOG + ECG + STI)
//!   │
//!   ├─ 01 maxwell     noisy/flat MEG channels, SSS or tSSS      → <run>_sss
//!   ├─ 02 bad-eeg     iterative robust reference, interpolation → <run>_intpl
//!   ├─ 03 annotate    blinks (EOG) and muscle (110–140 Hz)       → <run>_artif
//!   ├─ 04 events      STI101 triggers → trial metadata           → <run>-eve.txt, <run>-meta.csv
//!   ├─ 05 ica-fit     FastICA on all runs (MEG, EEG)             → _ALL-ica_{meg,eeg}
//!   ├─ 06 ica-apply   remove excluded components                 → <run>_ica
//!   ├─ 07 epochs      concatenate, cut, reject                   → _ALL_epo
//!   ├─ A01 evoked     average per condition                      → _ALL_evk-<factor>
//!   └─ B01 tfr        multitaper / Morlet power per condition    → _tfr_{lofr,hifr}_<factor>
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use meegprep::pipeline::{run_all, Stage};
//! use meegprep::StudyConfig;
//!
//! let cfg = StudyConfig::load("study.json".as_ref()).unwrap();
//!
//! // one stage …
//! Stage::Maxwell.run(&cfg).unwrap();
//! // … or all of them (stage 02 is skipped for subjects without EEG)
//! run_all(&cfg).unwrap();
//! ```
//!
//! ## Using the building blocks
//!
//! ```no_run
//! use meegprep::{BadEegConfig, Recording, find_bad_eeg};
//!
//! let mut raw = Recording::load("SB035_MEEG_V1_DurR1_sss.safetensors".as_ref()).unwrap();
//! let outcome = find_bad_eeg(&mut raw, &BadEegConfig::default()).unwrap();
//! println!("interpolated {:?} after {} iterations", outcome.true_bads, outcome.iterations);
//! ```

pub mod annotations;
pub mod artifacts;
pub mod bad_channels;
pub mod config;
pub mod epoch;
pub mod error;
pub mod events;
pub mod evoked;
pub mod filter;
pub mod ica;
pub mod interpolate;
pub mod io;
pub mod linalg;
pub mod maxwell;
pub mod normalize;
pub mod pipeline;
pub mod recording;
pub mod reference;
pub mod report;
pub mod resample;
pub mod simulate;
pub mod spectrum;
pub mod tfr;
pub mod trials;

// ── Crate-root re-exports ─────────────────────────────────────────────────
//
// Everything a downstream user is likely to need is available directly as
// `meegprep::Foo` without having to know the internal module layout.

// configuration and errors
pub use config::{
    ArtifactConfig, BadEegConfig, EpochConfig, EventConfig, Experiment, IcaConfig, MaxwellConfig,
    StudyConfig, TfrConfig,
};
pub use error::{ConfigError, DecodeError, PipelineError};

// data containers
pub use annotations::{Annotation, Annotations};
pub use epoch::{EpochParams, Epochs};
pub use events::Event;
pub use evoked::Evoked;
pub use recording::{ChannelInfo, ChannelKind, Recording, RecordingInfo};
pub use tfr::Tfr;
pub use trials::MetadataTable;

// algorithms
pub use artifacts::{annotate_muscle_zscore, ensure_two_eog, find_eog_events};
pub use bad_channels::{find_bad_eeg, BadEegOutcome};
pub use events::extract_events;
pub use ica::Ica;
pub use maxwell::{find_bad_channels_meg, maxwell_filter};
pub use tfr::tfr_power;
pub use trials::decode_trials;

// stages
pub use pipeline::{run_all, Stage};
