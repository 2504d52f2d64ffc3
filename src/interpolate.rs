//! Spherical-spline interpolation of bad EEG channels.
//!
//! Perrin et al. (1989) splines as used by `mne.channels.interpolation`:
//! sensor positions are projected on the unit sphere around a fitted head
//! origin, `g(cos θ) = Σ (2n+1) / (n^m (n+1)^m 4π) · P_n(cos θ)` with
//! `m = 4` and seven Legendre terms, and the system is regularised by
//! `α = 1e-5` on the diagonal.
use std::f64::consts::PI;

use anyhow::Result;
use log::{debug, warn};
use ndarray::{s, Array2, Axis};

use crate::error::PipelineError;
use crate::linalg::{fit_sphere, pinv};
use crate::recording::{ChannelKind, Recording};

const N_LEGENDRE_TERMS: usize = 7;
const STIFFNESS: i32 = 4;
const ALPHA: f64 = 1e-5;

fn legendre_g(cosang: f64) -> f64 {
    let x = cosang.clamp(-1.0, 1.0);
    let (mut p_prev, mut p) = (1.0, x);
    let mut g = 0.0;
    for n in 1..N_LEGENDRE_TERMS {
        let nf = n as f64;
        g += (2.0 * nf + 1.0) / (nf.powi(STIFFNESS) * (nf + 1.0).powi(STIFFNESS) * 4.0 * PI) * p;
        let p_next = ((2.0 * nf + 1.0) * x * p - nf * p_prev) / (nf + 1.0);
        p_prev = p;
        p = p_next;
    }
    g
}

fn unit(p: &[f64; 3], origin: &[f64; 3]) -> [f64; 3] {
    let v = [p[0] - origin[0], p[1] - origin[1], p[2] - origin[2]];
    let n = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if n > 0.0 { [v[0] / n, v[1] / n, v[2] / n] } else { v }
}

fn dot3(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Matrix `[n_to, n_from]` mapping good-channel values to the values at
/// `pos_to`.
pub fn make_interpolation_matrix(
    pos_from: &[[f64; 3]],
    pos_to: &[[f64; 3]],
    origin: &[f64; 3],
) -> Result<Array2<f64>> {
    let from: Vec<[f64; 3]> = pos_from.iter().map(|p| unit(p, origin)).collect();
    let to: Vec<[f64; 3]> = pos_to.iter().map(|p| unit(p, origin)).collect();
    let n = from.len();

    let mut c = Array2::<f64>::zeros((n + 1, n + 1));
    for i in 0..n {
        for j in 0..n {
            c[[i, j]] = legendre_g(dot3(&from[i], &from[j]));
        }
        c[[i, i]] += ALPHA;
        c[[i, n]] = 1.0;
        c[[n, i]] = 1.0;
    }
    let c_inv = pinv(&c, 1e-15)?;

    let mut g_to = Array2::<f64>::ones((to.len(), n + 1));
    for (i, t) in to.iter().enumerate() {
        for (j, f) in from.iter().enumerate() {
            g_to[[i, j]] = legendre_g(dot3(t, f));
        }
    }
    Ok(g_to.dot(&c_inv.slice(s![.., ..n])))
}

impl Recording {
    /// Head origin for EEG interpolation: centre of the sphere fitted to
    /// all EEG positions.
    pub fn eeg_origin(&self) -> [f64; 3] {
        let pos: Vec<[f64; 3]> = self
            .picks(&[ChannelKind::Eeg], false)
            .iter()
            .map(|&i| self.info.channels[i].pos())
            .collect();
        match fit_sphere(&pos) {
            Ok((center, _)) => center,
            Err(e) => {
                warn!("sphere fit failed ({e}); interpolating around the device origin");
                [0.0; 3]
            }
        }
    }

    /// Replace bad EEG channels by spherical-spline interpolation from the
    /// good EEG channels. With `reset_bads` the interpolated channels are
    /// removed from the bad list.
    pub fn interpolate_bads(&mut self, reset_bads: bool) -> Result<()> {
        let bad = self
            .picks(&[ChannelKind::Eeg], false)
            .into_iter()
            .filter(|&i| self.info.is_bad(&self.info.channels[i].name))
            .collect::<Vec<_>>();
        if bad.is_empty() {
            return Ok(());
        }
        let good = self.picks(&[ChannelKind::Eeg], true);
        if good.is_empty() {
            return Err(PipelineError::NoChannels("eeg").into());
        }
        let origin = self.eeg_origin();
        let pos = |idx: &[usize]| -> Vec<[f64; 3]> {
            idx.iter().map(|&i| self.info.channels[i].pos()).collect()
        };
        let interp = make_interpolation_matrix(&pos(&good), &pos(&bad), &origin)?;
        debug!("interpolating {} bad EEG channels from {} good ones", bad.len(), good.len());
        let rows = interp.dot(&self.data.select(Axis(0), &good));
        self.assign_rows(&bad, &rows)?;
        if reset_bads {
            let names: Vec<String> = bad.iter().map(|&i| self.info.channels[i].name.clone()).collect();
            self.info.bads.retain(|b| !names.contains(b));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_positions() -> Vec<[f64; 3]> {
        let mut pos = Vec::new();
        for (k, elev) in [20f64, 45.0, 70.0].iter().enumerate() {
            let el = elev.to_radians();
            for a in 0..10 {
                let az = (a as f64 * 36.0 + k as f64 * 12.0).to_radians();
                pos.push([0.09 * el.cos() * az.cos(), 0.09 * el.cos() * az.sin(), 0.04 + 0.09 * el.sin()]);
            }
        }
        pos
    }

    #[test]
    fn g_decreases_with_angle() {
        assert!(legendre_g(1.0) > legendre_g(0.5));
        assert!(legendre_g(0.5) > legendre_g(-0.5));
    }

    #[test]
    fn constant_field_is_reproduced() {
        let pos = ring_positions();
        let m = make_interpolation_matrix(&pos[1..], &pos[..1], &[0.0, 0.0, 0.04]).unwrap();
        let v: f64 = m.row(0).sum();
        approx::assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
    }
}
