//! Maxwell filtering: automatic noisy/flat MEG channel detection, signal
//! space separation (SSS) and its temporal extension (tSSS).
//!
//! The multipole basis is built from real spherical harmonics about
//! `origin`. For each degree `l` and order `m` the internal potential is
//! `r^-(l+1) · Y_lm` and the external one `r^l · Y_lm`; the field is the
//! negative gradient, evaluated numerically. Magnetometers read `B · ez` at
//! the coil centre, planar gradiometers the difference of `B · ez` across a
//! 16.8 mm baseline along `ex`, divided by the baseline.
use std::f64::consts::PI;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use ndarray::{s, Array2, Axis};

use crate::config::MaxwellConfig;
use crate::filter::{apply_fir_zero_phase, design_lowpass};
use crate::linalg::{orthonormal_rows, pinv, svd};
use crate::normalize::{median, robust_zscore};
use crate::recording::{ChannelInfo, ChannelKind, Recording};

/// Planar gradiometer baseline (m).
pub const GRAD_BASELINE: f64 = 0.0168;
const FD_STEP: f64 = 1e-6;

// ── Fine calibration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FineCalEntry {
    pub name: String,
    pub loc: [f64; 12],
    /// One value for magnetometers, three for gradiometers.
    pub imbalance: Vec<f64>,
}

/// A fine-calibration table (`sss_cal_<site>.dat`).
///
/// One line per channel: name, 12 location values (`r0 ex ey ez`), then one
/// (magnetometer) or three (gradiometer) calibration values. Lines starting
/// with `#` are comments.
#[derive(Debug, Clone, Default)]
pub struct FineCalibration {
    pub entries: Vec<FineCalEntry>,
}

impl FineCalibration {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let name = fields.next().unwrap_or_default().to_string();
            let values = fields
                .map(str::parse::<f64>)
                .collect::<Result<Vec<f64>, _>>()
                .with_context(|| format!("line {}: bad number", lineno + 1))?;
            if values.len() != 13 && values.len() != 15 {
                bail!("line {}: expected 13 or 15 values, found {}", lineno + 1, values.len());
            }
            let mut loc = [0.0; 12];
            loc.copy_from_slice(&values[..12]);
            entries.push(FineCalEntry { name, loc, imbalance: values[12..].to_vec() });
        }
        Ok(Self { entries })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fine calibration {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Update sensor geometry and scale magnetometer data by their
    /// calibration value. Names may omit the `MEG` prefix.
    pub fn apply(&self, rec: &mut Recording) -> usize {
        let mut applied = 0;
        for e in &self.entries {
            let idx = rec
                .info
                .index_of(&e.name)
                .or_else(|| rec.info.index_of(&format!("MEG{}", e.name)));
            let Some(idx) = idx else { continue };
            let ch = &mut rec.info.channels[idx];
            if !ch.kind.is_meg() {
                continue;
            }
            ch.loc = e.loc;
            if ch.kind == ChannelKind::Mag {
                if let Some(&cal) = e.imbalance.first() {
                    rec.data.row_mut(idx).mapv_inplace(|v| v * cal);
                }
            }
            applied += 1;
        }
        applied
    }
}

// ── Multipole basis ───────────────────────────────────────────────────────────

/// Associated Legendre function `P_l^m(x)` (Condon–Shortley phase).
fn assoc_legendre(l: usize, m: usize, x: f64) -> f64 {
    let mut pmm = 1.0;
    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
        let mut fact = 1.0;
        for _ in 0..m {
            pmm *= -fact * somx2;
            fact += 2.0;
        }
    }
    if l == m {
        return pmm;
    }
    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmmp1;
    }
    let mut pll = 0.0;
    for ll in m + 2..=l {
        pll = (x * (2 * ll - 1) as f64 * pmmp1 - (ll + m - 1) as f64 * pmm) / (ll - m) as f64;
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

/// Real spherical harmonic `Y_lm(θ, φ)`, orthonormal on the sphere.
fn real_sph_harm(l: usize, m: i64, cos_theta: f64, phi: f64) -> f64 {
    let am = m.unsigned_abs() as usize;
    let mut ratio = 1.0;
    for k in (l - am + 1)..=(l + am) {
        ratio /= k as f64;
    }
    let norm = ((2 * l + 1) as f64 / (4.0 * PI) * ratio).sqrt();
    let p = assoc_legendre(l, am, cos_theta);
    match m {
        0 => norm * p,
        m if m > 0 => std::f64::consts::SQRT_2 * norm * p * (m as f64 * phi).cos(),
        _ => std::f64::consts::SQRT_2 * norm * p * (am as f64 * phi).sin(),
    }
}

fn potential(l: usize, m: i64, p: [f64; 3], internal: bool) -> f64 {
    let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
    let y = real_sph_harm(l, m, p[2] / r, p[1].atan2(p[0]));
    if internal {
        y * r.powi(-(l as i32 + 1))
    } else {
        y * r.powi(l as i32)
    }
}

/// `B · n` at `p` (relative to the origin) for one multipole term.
fn field_normal(l: usize, m: i64, p: [f64; 3], n: [f64; 3], internal: bool) -> f64 {
    let mut b = 0.0;
    for k in 0..3 {
        if n[k] == 0.0 {
            continue;
        }
        let mut hi = p;
        let mut lo = p;
        hi[k] += FD_STEP;
        lo[k] -= FD_STEP;
        let grad = (potential(l, m, hi, internal) - potential(l, m, lo, internal)) / (2.0 * FD_STEP);
        b -= grad * n[k];
    }
    b
}

fn sensor_response(ch: &ChannelInfo, origin: &[f64; 3], l: usize, m: i64, internal: bool) -> f64 {
    let r0 = ch.pos();
    let p = [r0[0] - origin[0], r0[1] - origin[1], r0[2] - origin[2]];
    let ez = ch.ez();
    match ch.kind {
        ChannelKind::Grad => {
            let ex = ch.ex();
            let h = GRAD_BASELINE / 2.0;
            let plus = [p[0] + h * ex[0], p[1] + h * ex[1], p[2] + h * ex[2]];
            let minus = [p[0] - h * ex[0], p[1] - h * ex[1], p[2] - h * ex[2]];
            (field_normal(l, m, plus, ez, internal) - field_normal(l, m, minus, ez, internal))
                / GRAD_BASELINE
        }
        _ => field_normal(l, m, p, ez, internal),
    }
}

/// Number of internal (or external) components for expansion order `order`.
pub fn n_components(order: usize) -> usize {
    (order + 1) * (order + 1) - 1
}

/// Unnormalised multipole basis `[C, n_in + n_out]` for `channels`
/// (internal columns first, ordered by degree then order).
pub fn multipole_basis(
    channels: &[ChannelInfo],
    origin: &[f64; 3],
    int_order: usize,
    ext_order: usize,
) -> Array2<f64> {
    let mut terms: Vec<(usize, i64, bool)> = Vec::new();
    for (order, internal) in [(int_order, true), (ext_order, false)] {
        for l in 1..=order {
            for m in -(l as i64)..=(l as i64) {
                terms.push((l, m, internal));
            }
        }
    }
    Array2::from_shape_fn((channels.len(), terms.len()), |(c, k)| {
        let (l, m, internal) = terms[k];
        sensor_response(&channels[c], origin, l, m, internal)
    })
}

/// Multipole basis with magnetometer rows scaled by `mag_scale` and every
/// column normalised to unit norm; also returns the per-row scale.
fn scaled_basis(channels: &[ChannelInfo], cfg: &MaxwellConfig) -> (Array2<f64>, Vec<f64>) {
    let mut basis = multipole_basis(channels, &cfg.origin, cfg.int_order, cfg.ext_order);
    let scale: Vec<f64> = channels
        .iter()
        .map(|c| if c.kind == ChannelKind::Mag { cfg.mag_scale } else { 1.0 })
        .collect();
    for (mut row, &sc) in basis.rows_mut().into_iter().zip(&scale) {
        row.mapv_inplace(|v| v * sc);
    }
    for mut col in basis.columns_mut() {
        let n = col.dot(&col).sqrt();
        if n > 0.0 {
            col.mapv_inplace(|v| v / n);
        }
    }
    (basis, scale)
}

// ── Bad channel detection ─────────────────────────────────────────────────────

/// Per-window scores of the automatic noisy/flat detection.
#[derive(Debug, Clone)]
pub struct BadMegScores {
    pub ch_names: Vec<String>,
    pub ch_kinds: Vec<ChannelKind>,
    /// `(start, stop)` of each window in seconds.
    pub bins: Vec<(f64, f64)>,
    /// Robust z-score of peak-to-peak amplitude, `[C, W]`.
    pub scores_noisy: Array2<f64>,
    pub limit_noisy: f64,
    /// Peak-to-peak amplitude relative to the channel-type median, `[C, W]`.
    pub scores_flat: Array2<f64>,
    pub limit_flat: f64,
}

#[derive(Debug, Clone)]
pub struct BadMegChannels {
    pub noisy: Vec<String>,
    pub flat: Vec<String>,
    pub scores: BadMegScores,
}

/// Window-based noisy/flat detection on the MEG channels of `rec`.
pub fn find_bad_channels_meg(rec: &Recording, cfg: &MaxwellConfig) -> Result<BadMegChannels> {
    let meg = rec.pick_kinds(&ChannelKind::MEG)?;
    let sfreq = meg.sfreq();
    let mut data = meg.data.clone();
    if cfg.bad_lowpass < sfreq / 2.0 {
        let h = design_lowpass(cfg.bad_lowpass, sfreq)?;
        apply_fir_zero_phase(&mut data, &h)?;
    }

    let n_t = data.ncols();
    let win = ((cfg.bad_window * sfreq).round() as usize).clamp(1, n_t.max(1));
    let n_win = (n_t / win).max(1);
    let bins: Vec<(f64, f64)> = (0..n_win)
        .map(|w| {
            let stop = if w + 1 == n_win { n_t } else { (w + 1) * win };
            ((w * win) as f64 / sfreq, stop as f64 / sfreq)
        })
        .collect();

    let n_ch = data.nrows();
    let mut scores_noisy = Array2::<f64>::zeros((n_ch, n_win));
    let mut scores_flat = Array2::<f64>::zeros((n_ch, n_win));
    for (w, &(start, stop)) in bins.iter().enumerate() {
        let (a, b) = ((start * sfreq).round() as usize, ((stop * sfreq).round() as usize).min(n_t));
        let ptp: Vec<f64> = data
            .slice(s![.., a..b])
            .rows()
            .into_iter()
            .map(|r| r.fold(f64::MIN, |m, &v| m.max(v)) - r.fold(f64::MAX, |m, &v| m.min(v)))
            .collect();
        for kind in ChannelKind::MEG {
            let idx: Vec<usize> = (0..n_ch).filter(|&c| meg.info.channels[c].kind == kind).collect();
            if idx.is_empty() {
                continue;
            }
            let vals: Vec<f64> = idx.iter().map(|&c| ptp[c]).collect();
            let z = robust_zscore(&vals);
            let med = median(&mut vals.clone());
            for (k, &c) in idx.iter().enumerate() {
                scores_noisy[[c, w]] = z[k];
                scores_flat[[c, w]] = if med > 0.0 { vals[k] / med } else { 0.0 };
            }
        }
    }

    let needed = cfg.min_count.min(n_win).max(1);
    let names = meg.ch_names();
    let count = |scores: &Array2<f64>, hit: &dyn Fn(f64) -> bool| -> Vec<String> {
        (0..n_ch)
            .filter(|&c| scores.row(c).iter().filter(|&&v| hit(v)).count() >= needed)
            .map(|c| names[c].clone())
            .collect()
    };
    let flat = count(&scores_flat, &|v| v < cfg.flat_fraction);
    let noisy: Vec<String> = count(&scores_noisy, &|v| v > cfg.bad_limit)
        .into_iter()
        .filter(|n| !flat.contains(n))
        .collect();

    Ok(BadMegChannels {
        noisy,
        flat,
        scores: BadMegScores {
            ch_kinds: meg.info.channels.iter().map(|c| c.kind).collect(),
            ch_names: names.clone(),
            bins,
            scores_noisy,
            limit_noisy: cfg.bad_limit,
            scores_flat,
            limit_flat: cfg.flat_fraction,
        },
    })
}

// ── SSS / tSSS ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MaxwellReport {
    pub n_in: usize,
    pub n_out: usize,
    /// Good MEG channels the moments were fitted on.
    pub n_fit_channels: usize,
    /// Temporal components projected out in each tSSS window.
    pub tsss_removed: Vec<usize>,
    /// MEG channels that were bad and have been reconstructed.
    pub reconstructed: Vec<String>,
}

/// Apply SSS (and tSSS when `cfg.st_duration()` is set) to the MEG
/// channels of `rec` in place.
pub fn maxwell_filter(rec: &mut Recording, cfg: &MaxwellConfig) -> Result<MaxwellReport> {
    let meg_idx = rec.picks(&ChannelKind::MEG, false);
    if meg_idx.is_empty() {
        bail!("no MEG channels to Maxwell filter");
    }
    let good_idx = rec.picks(&ChannelKind::MEG, true);
    let channels: Vec<ChannelInfo> = meg_idx.iter().map(|&i| rec.info.channels[i].clone()).collect();
    let (basis, scale) = scaled_basis(&channels, cfg);
    let n_in = n_components(cfg.int_order);
    let n_out = basis.ncols() - n_in;
    if good_idx.len() <= basis.ncols() {
        warn!(
            "{} good MEG channels for {} multipole components; the fit is underdetermined",
            good_idx.len(),
            basis.ncols()
        );
    }

    // rows of `basis` that correspond to good channels
    let good_rows: Vec<usize> = meg_idx
        .iter()
        .enumerate()
        .filter(|(_, i)| good_idx.contains(*i))
        .map(|(k, _)| k)
        .collect();
    let basis_good = basis.select(Axis(0), &good_rows);
    let pinv_good = pinv(&basis_good, 1e-10)?;

    let mut data_good = rec.data.select(Axis(0), &good_idx);
    for (mut row, &k) in data_good.rows_mut().into_iter().zip(&good_rows) {
        row.mapv_inplace(|v| v * scale[k]);
    }
    let moments = pinv_good.dot(&data_good);
    let basis_in = basis.slice(s![.., ..n_in]).to_owned();
    let moments_in = moments.slice(s![..n_in, ..]).to_owned();
    let mut clean = basis_in.dot(&moments_in);

    let mut report = MaxwellReport {
        n_in,
        n_out,
        n_fit_channels: good_idx.len(),
        ..Default::default()
    };

    if let Some(st) = cfg.st_duration() {
        let recon_good = basis_good.dot(&moments);
        let in_good = basis_good.slice(s![.., ..n_in]).dot(&moments_in);
        let resid = &data_good - &recon_good;
        let n_st = ((st * rec.sfreq()).round() as usize).max(1);
        let n_t = rec.n_times();
        let mut start = 0;
        while start < n_t {
            // a trailing piece shorter than half a window joins the last window
            let mut stop = (start + n_st).min(n_t);
            if n_t - stop < n_st / 2 {
                stop = n_t;
            }
            let removed = project_out_intersection(
                &mut clean,
                &in_good,
                &resid,
                start,
                stop,
                cfg.st_correlation,
            )?;
            report.tsss_removed.push(removed);
            start = stop;
        }
        info!(
            "tSSS: {} windows, {} temporal components removed",
            report.tsss_removed.len(),
            report.tsss_removed.iter().sum::<usize>()
        );
    }

    for (k, &i) in meg_idx.iter().enumerate() {
        let sc = scale[k];
        let row = clean.row(k).mapv(|v| v / sc);
        rec.data.row_mut(i).assign(&row);
    }
    report.reconstructed = rec
        .info
        .bads
        .iter()
        .filter(|b| channels.iter().any(|c| &c.name == *b))
        .cloned()
        .collect();
    rec.info.bads.retain(|b| !report.reconstructed.contains(b));
    debug!(
        "SSS: {} internal + {} external components fitted on {} channels",
        n_in, n_out, report.n_fit_channels
    );
    Ok(report)
}

/// Remove from `clean[.., start..stop]` the temporal components shared by
/// the internal reconstruction and the residual.
fn project_out_intersection(
    clean: &mut Array2<f64>,
    inside: &Array2<f64>,
    resid: &Array2<f64>,
    start: usize,
    stop: usize,
    st_correlation: f64,
) -> Result<usize> {
    let q_in = orthonormal_rows(&inside.slice(s![.., start..stop]).to_owned(), 1e-10)?;
    let q_res = orthonormal_rows(&resid.slice(s![.., start..stop]).to_owned(), 1e-10)?;
    if q_in.nrows() == 0 || q_res.nrows() == 0 {
        return Ok(0);
    }
    let (u, sv, _) = svd(&q_in.dot(&q_res.t()))?;
    let keep: Vec<usize> = (0..sv.len()).filter(|&k| sv[k] >= st_correlation).collect();
    if keep.is_empty() {
        return Ok(0);
    }
    // temporal vectors of the intersection, orthonormal rows
    let intersect = u.select(Axis(1), &keep).t().dot(&q_in);
    let mut block = clean.slice_mut(s![.., start..stop]);
    let coef = block.dot(&intersect.t());
    block -= &coef.dot(&intersect);
    Ok(keep.len())
}
