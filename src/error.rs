//! Typed errors for the parts of the pipeline that callers may want to match on.
//!
//! Everything else propagates as [`anyhow::Error`] with file context attached.
use thiserror::Error;

/// A `StudyConfig` that failed validation.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("`{0}` must not be empty")]
    Empty(&'static str),

    #[error("unknown experiment id {0} (expected 1 or 2)")]
    UnknownExperiment(u8),

    #[error("`{field}` = {value} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("epoch window is empty: tmin = {tmin} s, tmax = {tmax} s")]
    EmptyEpochWindow { tmin: f64, tmax: f64 },

    #[error("tSSS requires a positive `st_duration`")]
    MissingStDuration,

    #[error("`{field}` = {value:?} is not supported")]
    Unsupported { field: &'static str, value: String },

    #[error("invalid config file: {0}")]
    Parse(String),
}

/// Failure to turn a trigger sequence into trial metadata.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("trial starting at sample {sample} (code {code}) has no terminator {terminator} within {window} events")]
    MissingTerminator {
        sample: i64,
        code: i32,
        terminator: i32,
        window: usize,
    },

    #[error("trial starting at sample {sample} (code {code}) has no {field} code")]
    MissingField {
        sample: i64,
        code: i32,
        field: &'static str,
    },

    #[error("trial starting at sample {sample} (code {code}) is truncated: event {offset} past the start is missing")]
    Truncated { sample: i64, code: i32, offset: usize },

    #[error("code {code} at sample {sample} does not map to any {field}")]
    UnknownCode {
        sample: i64,
        code: i32,
        field: &'static str,
    },
}

/// Structural problems detected by the pipeline stages themselves.
#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("there is no EEG recording for this participant ({0})")]
    NoEeg(String),

    #[error("channel `{0}` not found")]
    MissingChannel(String),

    #[error("no channels of kind {0} to process")]
    NoChannels(&'static str),

    #[error("{what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("ICA component {index} does not exist (solution has {n_components})")]
    ComponentOutOfRange { index: usize, n_components: usize },

    #[error("{freq} Hz is above the Nyquist frequency ({nyquist} Hz)")]
    AboveNyquist { freq: f64, nyquist: f64 },
}
