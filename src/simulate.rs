//! Synthetic studies.
//!
//! [`simulate_study`] writes a complete experiment-1 data set and a matching
//! `study.json`:
//!
//! - MEG: one magnetometer and two orthogonal planar gradiometers per
//!   location on a hemispherical helmet, driven by low-order internal
//!   multipoles (alpha, evoked response, heartbeat, blinks, muscle, noise)
//!   and external interference (line noise, drift);
//! - EEG on a spherical cap with smooth spatial patterns plus blinks over
//!   frontal electrodes;
//! - `EOG001`, `BIO002` (a second EOG trace on a bio input), `ECG001`;
//! - `STI101` carrying the experiment-1 trigger protocol.
//!
//! Faults can be injected (noisy EEG electrodes, flat MEG sensors, a muscle
//! burst) so every stage has something to find.
use std::f64::consts::PI;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{Experiment, IcaExclude, NComponents, StudyConfig};
use crate::linalg::randn;
use crate::maxwell::multipole_basis;
use crate::recording::{ChannelInfo, ChannelKind, Recording, RecordingInfo};

const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653;
const HELMET_RADIUS: f64 = 0.12;
const HEAD_RADIUS: f64 = 0.09;
const HEAD_CENTER: [f64; 3] = [0.0, 0.0, 0.04];

pub const SITE_ID: &str = "SX";
pub const SUBJECT_ID: &str = "001";

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub sfreq: f64,
    /// Seconds per run.
    pub run_duration: f64,
    pub n_runs: usize,
    pub n_meg_locations: usize,
    pub n_eeg: usize,
    pub with_eeg: bool,
    pub seed: u64,
    /// Seconds between trial onsets.
    pub trial_interval: f64,
    /// EEG electrodes recorded with a 20× gain fault.
    pub noisy_eeg: Vec<String>,
    /// MEG sensors that output zeros.
    pub flat_meg: Vec<String>,
    /// `(start, duration)` in seconds of a muscle burst in the first run.
    pub muscle_burst: Option<(f64, f64)>,
    /// ICA components written to the generated config.
    pub ica_components: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sfreq: 500.0,
            run_duration: 30.0,
            n_runs: 2,
            n_meg_locations: 48,
            n_eeg: 32,
            with_eeg: true,
            seed: 42,
            trial_interval: 3.5,
            noisy_eeg: vec!["EEG007".into()],
            flat_meg: vec!["MEG0121".into()],
            muscle_burst: Some((12.0, 1.0)),
            ica_components: 15,
        }
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// `n` unit vectors spread over the cap `z >= z_min` (Fibonacci lattice).
fn cap_points(n: usize, z_min: f64) -> Vec<[f64; 3]> {
    (0..n)
        .map(|i| {
            let z = 1.0 - (i as f64 + 0.5) / n as f64 * (1.0 - z_min);
            let r = (1.0 - z * z).max(0.0).sqrt();
            let phi = i as f64 * GOLDEN_ANGLE;
            [r * phi.cos(), r * phi.sin(), z]
        })
        .collect()
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

/// Orthonormal tangents `(ex, ey)` of the sphere at `u`.
fn tangents(u: [f64; 3]) -> ([f64; 3], [f64; 3]) {
    let n = (u[0] * u[0] + u[1] * u[1]).sqrt();
    let ex = if n < 1e-9 { [1.0, 0.0, 0.0] } else { [-u[1] / n, u[0] / n, 0.0] };
    (ex, cross(u, ex))
}

fn coil_loc(pos: [f64; 3], ex: [f64; 3], ey: [f64; 3], ez: [f64; 3]) -> [f64; 12] {
    let mut loc = [0.0; 12];
    for k in 0..3 {
        loc[k] = pos[k];
        loc[3 + k] = ex[k];
        loc[6 + k] = ey[k];
        loc[9 + k] = ez[k];
    }
    loc
}

/// Helmet of `n_locations` triplets `MEGxxx1` (mag), `MEGxxx2`, `MEGxxx3`
/// (gradiometers along the two tangents).
pub fn meg_channels(n_locations: usize, origin: [f64; 3]) -> Vec<ChannelInfo> {
    let mut chs = Vec::with_capacity(3 * n_locations);
    for (i, u) in cap_points(n_locations, 0.0).into_iter().enumerate() {
        let pos = [
            origin[0] + HELMET_RADIUS * u[0],
            origin[1] + HELMET_RADIUS * u[1],
            origin[2] + HELMET_RADIUS * u[2],
        ];
        let (ex, ey) = tangents(u);
        let neg_ex = [-ex[0], -ex[1], -ex[2]];
        chs.push(ChannelInfo::new(format!("MEG{:03}1", i + 1), ChannelKind::Mag).with_loc(coil_loc(pos, ex, ey, u)));
        chs.push(ChannelInfo::new(format!("MEG{:03}2", i + 1), ChannelKind::Grad).with_loc(coil_loc(pos, ex, ey, u)));
        chs.push(
            ChannelInfo::new(format!("MEG{:03}3", i + 1), ChannelKind::Grad).with_loc(coil_loc(pos, ey, neg_ex, u)),
        );
    }
    chs
}

/// `EEG001…` on a cap slightly below the equator, plus their unit directions.
pub fn eeg_channels(n: usize) -> (Vec<ChannelInfo>, Vec<[f64; 3]>) {
    let dirs = cap_points(n, -0.2);
    let chs = dirs
        .iter()
        .enumerate()
        .map(|(i, u)| {
            let mut loc = [0.0; 12];
            for k in 0..3 {
                loc[k] = HEAD_CENTER[k] + HEAD_RADIUS * u[k];
            }
            ChannelInfo::new(format!("EEG{:03}", i + 1), ChannelKind::Eeg).with_loc(loc)
        })
        .collect();
    (chs, dirs)
}

// ── Time courses ──────────────────────────────────────────────────────────────

/// Sum of Gaussian bumps of width `sigma` at `onsets + latency`.
fn bumps(n: usize, sfreq: f64, onsets: &[f64], latency: f64, sigma: f64) -> Vec<f64> {
    let mut out = vec![0.0; n];
    let half = (5.0 * sigma * sfreq).ceil() as i64;
    for &t0 in onsets {
        let c = (t0 + latency) * sfreq;
        let (lo, hi) = ((c as i64 - half).max(0), (c as i64 + half).min(n as i64 - 1));
        for i in lo..=hi {
            let d = (i as f64 - c) / (sigma * sfreq);
            out[i as usize] += (-0.5 * d * d).exp();
        }
    }
    out
}

/// Unit-variance AR(1) noise.
fn ar1<R: Rng + ?Sized>(rng: &mut R, n: usize, a: f64) -> Vec<f64> {
    let gain = (1.0 - a * a).sqrt();
    let mut x = 0.0;
    (0..n)
        .map(|_| {
            x = a * x + gain * randn(rng);
            x
        })
        .collect()
}

fn sine(n: usize, sfreq: f64, freq: f64, phase: f64) -> Vec<f64> {
    (0..n).map(|i| (2.0 * PI * freq * i as f64 / sfreq + phase).sin()).collect()
}

/// Trigger pulses of one experiment-1 trial, `(offset s, code)`.
fn trial_codes<R: Rng + ?Sized>(rng: &mut R, trial: usize) -> Vec<(f64, i32)> {
    let stim = rng.gen_range(0..4) * 20 + rng.gen_range(1..=20);
    let orientation = 101 + rng.gen_range(0..3);
    let duration = 151 + (trial % 3) as i32;
    let relevance = 201 + rng.gen_range(0..3);
    let trial_id = rng.gen_range(111..=148);
    let mut codes = vec![(0.0, stim), (0.02, orientation), (0.04, duration), (0.06, relevance), (0.08, trial_id)];
    if relevance == 201 {
        codes.push((0.6, 255));
    }
    codes.push((2.0, 97));
    codes
}

/// One run of the synthetic study. `run` selects `first_samp` and whether the
/// muscle burst is present.
pub fn simulate_run<R: Rng + ?Sized>(sim: &SimulationConfig, run: usize, rng: &mut R) -> Result<Recording> {
    let sfreq = sim.sfreq;
    let n = (sim.run_duration * sfreq).round() as usize;

    let mut onsets = Vec::new();
    let mut t = 1.0;
    while t + 2.5 < sim.run_duration {
        onsets.push(t);
        t += sim.trial_interval;
    }
    let mut stim = vec![0.0; n];
    let pulse = ((0.01 * sfreq).round() as usize).max(1);
    for (k, &t0) in onsets.iter().enumerate() {
        for (dt, code) in trial_codes(rng, k) {
            let start = ((t0 + dt) * sfreq).round() as usize;
            for v in stim.iter_mut().skip(start).take(pulse) {
                *v = code as f64;
            }
        }
    }

    let mut blink_times = Vec::new();
    let mut t = 1.5 + rng.gen_range(0.0..1.0);
    while t < sim.run_duration - 0.5 {
        blink_times.push(t);
        t += 2.5 + rng.gen_range(0.0..3.0);
    }
    let blink = bumps(n, sfreq, &blink_times, 0.0, 0.06);
    let beats: Vec<f64> = (0..).map(|k| 0.3 + k as f64 / 1.1).take_while(|&t| t < sim.run_duration).collect();
    let heart = bumps(n, sfreq, &beats, 0.0, 0.012);
    let early = bumps(n, sfreq, &onsets, 0.1, 0.03);
    let late = bumps(n, sfreq, &onsets, 0.2, 0.05);
    let evoked: Vec<f64> = early.iter().zip(&late).map(|(a, b)| a - 0.6 * b).collect();
    let envelope = sine(n, sfreq, 0.1, rng.gen_range(0.0..2.0 * PI));
    let alpha: Vec<f64> = sine(n, sfreq, 10.0, 0.0).iter().zip(&envelope).map(|(a, e)| a * (1.0 + 0.5 * e)).collect();
    let mut muscle = vec![0.0; n];
    if let (0, Some((start, dur))) = (run, sim.muscle_burst) {
        let carrier = sine(n, sfreq, 120.0, 0.0);
        let b = (((start + dur) * sfreq) as usize).min(n);
        let a = ((start * sfreq) as usize).min(b);
        muscle[a..b].copy_from_slice(&carrier[a..b]);
    }

    let mut channels = meg_channels(sim.n_meg_locations, HEAD_CENTER);
    let n_meg = channels.len();

    // ── MEG ──
    let mut basis = multipole_basis(&channels, &HEAD_CENTER, 2, 1);
    let mag_rows: Vec<usize> = (0..n_meg).filter(|&c| channels[c].kind == ChannelKind::Mag).collect();
    for mut col in basis.columns_mut() {
        let peak = mag_rows.iter().map(|&r| col[r].abs()).fold(0.0, f64::max);
        if peak > 0.0 {
            col.mapv_inplace(|v| v / peak);
        }
    }
    let internal: Vec<(f64, Vec<f64>)> = vec![
        (0.4, alpha.clone()),
        (0.8, evoked.clone()),
        (0.3, heart.clone()),
        (0.3, blink.clone()),
        (1.5, muscle),
        (0.2, ar1(rng, n, 0.95)),
        (0.2, ar1(rng, n, 0.9)),
        (0.2, ar1(rng, n, 0.8)),
    ];
    let external: Vec<(f64, Vec<f64>)> = vec![
        (2.0, sine(n, sfreq, 50.0, 0.3)),
        (3.0, sine(n, sfreq, 0.1, 1.0)),
        (1.0, ar1(rng, n, 0.99)),
    ];
    let mut sources = Array2::<f64>::zeros((basis.ncols(), n));
    for (k, (amp, tc)) in internal.iter().chain(&external).enumerate() {
        for (dst, v) in sources.row_mut(k).iter_mut().zip(tc) {
            *dst = amp * 1e-12 * v;
        }
    }
    let meg = basis.dot(&sources);

    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n_meg + sim.n_eeg + 4);
    for (c, row) in meg.axis_iter(Axis(0)).enumerate() {
        if sim.flat_meg.contains(&channels[c].name) {
            rows.push(vec![0.0; n]);
            continue;
        }
        let rms = (row.dot(&row) / n as f64).sqrt();
        rows.push(row.iter().map(|&v| v + 0.05 * rms * randn(rng)).collect());
    }

    // ── EEG ──
    if sim.with_eeg {
        let (eeg, dirs) = eeg_channels(sim.n_eeg);
        let slow = ar1(rng, n, 0.97);
        let fast = ar1(rng, n, 0.7);
        for (ch, u) in eeg.iter().zip(&dirs) {
            let gain = if sim.noisy_eeg.contains(&ch.name) { 20.0 } else { 1.0 };
            let frontal = u[1].max(0.0);
            let row = (0..n)
                .map(|i| {
                    let v = 10e-6 * u[0] * alpha[i]
                        + 6e-6 * u[2] * evoked[i]
                        + 4e-6 * u[1] * slow[i]
                        + 4e-6 * u[0] * u[1] * fast[i]
                        + 80e-6 * frontal * blink[i]
                        + 0.5e-6 * randn(rng);
                    gain * v
                })
                .collect();
            rows.push(row);
        }
        channels.extend(eeg);
    }

    // ── Auxiliary channels ──
    rows.push(blink.iter().map(|b| 150e-6 * b + 5e-6 * randn(rng)).collect());
    channels.push(ChannelInfo::new("EOG001", ChannelKind::Eog));
    rows.push(blink.iter().map(|b| 120e-6 * b + 5e-6 * randn(rng)).collect());
    channels.push(ChannelInfo::new("BIO002", ChannelKind::Bio));
    rows.push(heart.iter().map(|h| 1e-3 * h + 20e-6 * randn(rng)).collect());
    channels.push(ChannelInfo::new("ECG001", ChannelKind::Ecg));
    rows.push(stim);
    channels.push(ChannelInfo::new("STI101", ChannelKind::Stim));

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let data = Array2::from_shape_vec((channels.len(), n), flat)?;
    let mut info = RecordingInfo::new(sfreq, channels);
    info.first_samp = 1000 * (run as i64 + 1);
    Recording::new(info, data)
}

/// Write `sim.n_runs` raw runs and `study.json` into `dir`; returns the
/// config, with outputs directed to `dir/out`.
pub fn simulate_study(sim: &SimulationConfig, dir: &Path) -> Result<StudyConfig> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut cfg = StudyConfig::new(Experiment::Exp1, SUBJECT_ID, SITE_ID, dir);
    let stem = cfg.study_stem();
    let runs: Vec<String> = (1..=sim.n_runs).map(|i| format!("{stem}_DurR{i}")).collect();
    cfg.runs = Some(runs.clone());
    cfg.out_path = Some(dir.join("out"));
    cfg.no_eeg_subjects = Some(if sim.with_eeg { Vec::new() } else { vec![SUBJECT_ID.to_string()] });
    cfg.ica.n_components = NComponents::Count(sim.ica_components);
    cfg.ica.exclude = IcaExclude { meg_eog: vec![0], meg_ecg: Vec::new(), eeg_eog: vec![0], eeg_ecg: Vec::new() };
    cfg.validate()?;

    let mut rng = StdRng::seed_from_u64(sim.seed);
    for (i, run) in runs.iter().enumerate() {
        let rec = simulate_run(sim, i, &mut rng)?;
        let path = cfg.raw_file(run);
        rec.save(&path)?;
        info!("simulated {} ({} channels, {:.1} s)", path.display(), rec.n_channels(), rec.duration());
    }
    cfg.save(&dir.join("study.json"))?;
    Ok(cfg)
}
