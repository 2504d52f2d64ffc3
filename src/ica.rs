//! Independent component analysis for artifact removal.
//!
//! The decomposition follows `mne.preprocessing.ICA` with the `fastica`
//! method:
//!
//! 1. every channel is divided by the standard deviation of its channel
//!    kind (pre-whitening, so gradiometers and magnetometers can share one
//!    decomposition);
//! 2. PCA on the centred data; `n_components` PCs are kept (a fraction
//!    selects the smallest count reaching that explained variance) and
//!    scaled to unit variance;
//! 3. symmetric FastICA with the `logcosh` contrast on the whitened PCs.
//!
//! Samples covered by `BAD…` annotations are left out of the fit.
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{IcaConfig, NComponents};
use crate::error::PipelineError;
use crate::io::{StReader, StWriter};
use crate::linalg::{eigh, pinv, randn_matrix};
use crate::recording::{ChannelKind, Recording};

/// A fitted ICA decomposition.
#[derive(Debug, Clone)]
pub struct Ica {
    pub ch_names: Vec<String>,
    pub ch_kinds: Vec<ChannelKind>,
    /// Per-channel scale applied before PCA, `[C]`.
    pub pre_whitener: Array1<f64>,
    pub pca_mean: Array1<f64>,
    /// All principal axes as rows, `[C, C]`, by decreasing variance.
    pub pca_components: Array2<f64>,
    pub explained_variance: Array1<f64>,
    pub n_components: usize,
    /// Whitened PCs → sources, `[K, K]`.
    pub unmixing: Array2<f64>,
    /// Sources → whitened PCs, `[K, K]`.
    pub mixing: Array2<f64>,
    pub n_iter: usize,
    pub converged: bool,
    pub exclude: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct IcaMeta {
    ch_names: Vec<String>,
    ch_kinds: Vec<ChannelKind>,
    n_components: usize,
    n_iter: usize,
    converged: bool,
    exclude: Vec<usize>,
}

/// Number of PCs to keep for the given eigenvalues (descending).
pub fn select_n_components(explained_variance: &[f64], n: &NComponents) -> usize {
    let total: f64 = explained_variance.iter().sum();
    let k = match *n {
        NComponents::Count(k) => k,
        NComponents::Variance(frac) => {
            let mut cum = 0.0;
            let mut k = explained_variance.len();
            for (i, v) in explained_variance.iter().enumerate() {
                cum += v;
                if total > 0.0 && cum / total >= frac {
                    k = i + 1;
                    break;
                }
            }
            k
        }
    };
    k.clamp(1, explained_variance.len().max(1))
}

/// `w ← (w wᵀ)^{-1/2} w`
fn sym_decorrelation(w: &Array2<f64>) -> Result<Array2<f64>> {
    let (vals, vecs) = eigh(&w.dot(&w.t()))?;
    let inv_sqrt = Array2::from_diag(&vals.mapv(|v| 1.0 / v.max(f64::MIN_POSITIVE).sqrt()));
    Ok(vecs.dot(&inv_sqrt).dot(&vecs.t()).dot(w))
}

/// Symmetric FastICA with the logcosh contrast on whitened `[K, T]` data.
///
/// Returns `(W, iterations, converged)`.
pub fn fastica(z: &Array2<f64>, max_iter: usize, tol: f64, seed: u64) -> Result<(Array2<f64>, usize, bool)> {
    let k = z.nrows();
    let t = z.ncols() as f64;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = sym_decorrelation(&randn_matrix(&mut rng, k, k))?;

    for it in 1..=max_iter {
        let g = w.dot(z).mapv(f64::tanh);
        let g_prime = g.map_axis(Axis(1), |r| r.iter().map(|v| 1.0 - v * v).sum::<f64>() / t);
        let mut w1 = g.dot(&z.t()) / t;
        for i in 0..k {
            let scaled = &w.row(i) * g_prime[i];
            let mut row = w1.row_mut(i);
            row -= &scaled;
        }
        let w1 = sym_decorrelation(&w1)?;
        let lim = (0..k)
            .map(|i| (w1.row(i).dot(&w.row(i)).abs() - 1.0).abs())
            .fold(0.0, f64::max);
        w = w1;
        if lim < tol {
            debug!("FastICA converged after {it} iterations");
            return Ok((w, it, true));
        }
    }
    warn!("FastICA did not converge after {max_iter} iterations; consider raising max_iter");
    Ok((w, max_iter, false))
}

impl Ica {
    /// Fit on the good channels of the given kinds.
    pub fn fit(rec: &Recording, kinds: &[ChannelKind], cfg: &IcaConfig) -> Result<Ica> {
        if cfg.method != "fastica" {
            bail!("ICA method `{}` is not implemented (use `fastica`)", cfg.method);
        }
        let picks = rec.picks(kinds, true);
        if picks.is_empty() {
            let name = kinds.first().map_or("any", |k| k.as_str());
            return Err(PipelineError::NoChannels(name).into());
        }
        let ch_names: Vec<String> = picks.iter().map(|&i| rec.info.channels[i].name.clone()).collect();
        let ch_kinds: Vec<ChannelKind> = picks.iter().map(|&i| rec.info.channels[i].kind).collect();

        let mask = rec.info.annotations.bad_mask(rec.n_times(), rec.sfreq());
        let good_t: Vec<usize> = (0..rec.n_times()).filter(|&t| !mask[t]).collect();
        if good_t.len() < 2 {
            bail!("no unannotated samples left to fit ICA on");
        }
        let x = rec.data.select(Axis(0), &picks).select(Axis(1), &good_t);

        // pre-whitening: one scale per channel kind
        let mut pre_whitener = Array1::<f64>::ones(picks.len());
        let mut present: Vec<ChannelKind> = ch_kinds.clone();
        present.sort();
        present.dedup();
        for kind in present {
            let rows: Vec<usize> = (0..ch_kinds.len()).filter(|&i| ch_kinds[i] == kind).collect();
            let block = x.select(Axis(0), &rows);
            let std = block.std(0.0);
            for &r in &rows {
                pre_whitener[r] = if std > 0.0 { std } else { 1.0 };
            }
        }
        let mut xw = &x / &pre_whitener.view().insert_axis(Axis(1));
        let pca_mean = xw.mean_axis(Axis(1)).context("empty data")?;
        xw -= &pca_mean.view().insert_axis(Axis(1));

        let n_t = xw.ncols() as f64;
        let cov = xw.dot(&xw.t()) / (n_t - 1.0);
        let (vals, vecs) = eigh(&cov)?;
        let pca_components = vecs.t().to_owned();

        let mut k = select_n_components(vals.as_slice().unwrap_or(&[]), &cfg.n_components);
        let vmax = vals[0].max(0.0);
        let rank = vals.iter().filter(|&&v| v > 1e-12 * vmax).count();
        if k > rank {
            warn!("{k} components requested but the data has rank {rank}; keeping {rank}");
            k = rank;
        }
        if k == 0 {
            bail!("data to decompose has zero variance");
        }
        info!(
            "fitting ICA: {} channels, {} samples, {} components ({:.1}% variance)",
            picks.len(),
            good_t.len(),
            k,
            100.0 * vals.slice(s![..k]).sum() / vals.sum()
        );

        let scale = vals.slice(s![..k]).mapv(|v| 1.0 / v.sqrt());
        let whitener = &pca_components.slice(s![..k, ..]) * &scale.view().insert_axis(Axis(1));
        let z = whitener.dot(&xw);
        let (w, n_iter, converged) = fastica(&z, cfg.max_iter, cfg.tol, cfg.random_state)?;
        let unmixing = &w * &scale.view().insert_axis(Axis(0));
        let mixing = pinv(&unmixing, 1e-15)?;

        Ok(Ica {
            ch_names,
            ch_kinds,
            pre_whitener,
            pca_mean,
            pca_components,
            explained_variance: vals,
            n_components: k,
            unmixing,
            mixing,
            n_iter,
            converged,
            exclude: Vec::new(),
        })
    }

    /// Fraction of the PCA variance captured by each kept component axis.
    pub fn explained_variance_ratio(&self) -> Vec<f64> {
        let total = self.explained_variance.sum();
        self.explained_variance.iter().take(self.n_components).map(|v| v / total).collect()
    }

    fn channel_rows(&self, rec: &Recording) -> Result<Vec<usize>> {
        self.ch_names
            .iter()
            .map(|n| rec.info.index_of(n).ok_or_else(|| PipelineError::MissingChannel(n.clone()).into()))
            .collect()
    }

    /// Pre-whitened, centred data of the fitted channels.
    fn whitened(&self, rec: &Recording) -> Result<(Vec<usize>, Array2<f64>)> {
        let rows = self.channel_rows(rec)?;
        let mut xw = &rec.data.select(Axis(0), &rows) / &self.pre_whitener.view().insert_axis(Axis(1));
        xw -= &self.pca_mean.view().insert_axis(Axis(1));
        Ok((rows, xw))
    }

    /// Component time courses, `[K, T]`.
    pub fn sources(&self, rec: &Recording) -> Result<Array2<f64>> {
        let (_, xw) = self.whitened(rec)?;
        let pcs = self.pca_components.slice(s![..self.n_components, ..]).dot(&xw);
        Ok(self.unmixing.dot(&pcs))
    }

    /// Remove the back-projection of the `exclude` components from `rec`.
    ///
    /// An empty list leaves the data unchanged.
    pub fn apply(&self, rec: &mut Recording, exclude: &[usize]) -> Result<()> {
        if let Some(&index) = exclude.iter().find(|&&i| i >= self.n_components) {
            return Err(PipelineError::ComponentOutOfRange { index, n_components: self.n_components }.into());
        }
        if exclude.is_empty() {
            return Ok(());
        }
        let sources = self.sources(rec)?;
        let rows = self.channel_rows(rec)?;
        let removed_pcs = self.mixing.select(Axis(1), exclude).dot(&sources.select(Axis(0), exclude));
        let removed = self.pca_components.slice(s![..self.n_components, ..]).t().dot(&removed_pcs)
            * &self.pre_whitener.view().insert_axis(Axis(1));
        let cleaned = rec.data.select(Axis(0), &rows) - &removed;
        rec.assign_rows(&rows, &cleaned)?;
        debug!("removed ICA components {exclude:?} from {} channels", rows.len());
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = StWriter::new();
        w.add_array("pre_whitener", &self.pre_whitener);
        w.add_array("pca_mean", &self.pca_mean);
        w.add_array("pca_components", &self.pca_components);
        w.add_array("explained_variance", &self.explained_variance);
        w.add_array("unmixing", &self.unmixing);
        w.add_array("mixing", &self.mixing);
        w.add_meta(
            "ica",
            &IcaMeta {
                ch_names: self.ch_names.clone(),
                ch_kinds: self.ch_kinds.clone(),
                n_components: self.n_components,
                n_iter: self.n_iter,
                converged: self.converged,
                exclude: self.exclude.clone(),
            },
        )?;
        w.write(path).with_context(|| format!("writing ICA solution {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Ica> {
        let r = StReader::open(path).with_context(|| format!("reading ICA solution {}", path.display()))?;
        let meta: IcaMeta = r.meta("ica")?;
        let vector = |name: &str| -> Result<Array1<f64>> { Ok(Array1::from(r.f64_tensor(name)?.0)) };
        let ica = Ica {
            pre_whitener: vector("pre_whitener")?,
            pca_mean: vector("pca_mean")?,
            pca_components: r.array2("pca_components")?,
            explained_variance: vector("explained_variance")?,
            unmixing: r.array2("unmixing")?,
            mixing: r.array2("mixing")?,
            ch_names: meta.ch_names,
            ch_kinds: meta.ch_kinds,
            n_components: meta.n_components,
            n_iter: meta.n_iter,
            converged: meta.converged,
            exclude: meta.exclude,
        };
        if ica.unmixing.dim() != (ica.n_components, ica.n_components) {
            return Err(PipelineError::ShapeMismatch {
                what: "ICA unmixing rows",
                expected: ica.n_components,
                got: ica.unmixing.nrows(),
            }
            .into());
        }
        Ok(ica)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::corrcoef;
    use crate::recording::{ChannelInfo, RecordingInfo};
    use ndarray::{array, stack};
    use std::f64::consts::PI;

    fn true_sources(n: usize) -> Array2<f64> {
        let t: Vec<f64> = (0..n).map(|i| i as f64 / 500.0).collect();
        let sine = Array1::from_iter(t.iter().map(|t| (2.0 * PI * 3.0 * t).sin()));
        let square = Array1::from_iter(t.iter().map(|t| (2.0 * PI * 1.3 * t).sin().signum()));
        let saw = Array1::from_iter(t.iter().map(|t| (t * 0.7).fract() - 0.5));
        stack(Axis(0), &[sine.view(), square.view(), saw.view()]).unwrap()
    }

    fn mixed_recording() -> (Recording, Array2<f64>) {
        let src = true_sources(5000);
        let a = array![[1.0, 0.5, 0.3], [0.4, 1.0, 0.6], [0.2, 0.7, 1.0]];
        let data = a.dot(&src) * 1e-6;
        let channels = (0..3).map(|i| ChannelInfo::new(format!("EEG{:03}", i + 1), ChannelKind::Eeg)).collect();
        (Recording::new(RecordingInfo::new(500.0, channels), data).unwrap(), src)
    }

    fn max_abs_corr(a: &Array2<f64>, b: &Array2<f64>, row: usize) -> (usize, f64) {
        let joined = ndarray::concatenate(Axis(0), &[a.view(), b.view()]).unwrap();
        let c = corrcoef(&joined);
        (0..b.nrows())
            .map(|j| (j, c[[row, a.nrows() + j]].abs()))
            .fold((0, 0.0), |acc, x| if x.1 > acc.1 { x } else { acc })
    }

    fn cfg(n: usize) -> IcaConfig {
        IcaConfig { n_components: NComponents::Count(n), ..IcaConfig::default() }
    }

    #[test]
    fn variance_fraction_selects_smallest_count() {
        let vals = [5.0, 3.0, 1.5, 0.5];
        assert_eq!(select_n_components(&vals, &NComponents::Variance(0.5)), 1);
        assert_eq!(select_n_components(&vals, &NComponents::Variance(0.8)), 2);
        assert_eq!(select_n_components(&vals, &NComponents::Variance(0.99)), 4);
        assert_eq!(select_n_components(&vals, &NComponents::Count(9)), 4);
    }

    #[test]
    fn recovers_independent_sources() {
        let (rec, src) = mixed_recording();
        let ica = Ica::fit(&rec, &[ChannelKind::Eeg], &cfg(3)).unwrap();
        assert!(ica.converged);
        let est = ica.sources(&rec).unwrap();
        for k in 0..3 {
            let (_, r) = max_abs_corr(&src, &est, k);
            assert!(r > 0.98, "source {k} recovered with |r| = {r}");
        }
    }

    #[test]
    fn excluding_a_component_removes_it() {
        let (mut rec, src) = mixed_recording();
        let ica = Ica::fit(&rec, &[ChannelKind::Eeg], &cfg(3)).unwrap();
        let est = ica.sources(&rec).unwrap();
        let (square_idx, _) = max_abs_corr(&src, &est, 1);

        let before = rec.data.clone();
        ica.apply(&mut rec, &[]).unwrap();
        assert_eq!(rec.data, before);

        ica.apply(&mut rec, &[square_idx]).unwrap();
        let square = src.slice(s![1..2, ..]).to_owned();
        for ch in 0..3 {
            let row = rec.data.slice(s![ch..ch + 1, ..]).to_owned();
            let (_, r) = max_abs_corr(&row, &square, 0);
            assert!(r < 0.1, "channel {ch} still correlates with the square wave (|r| = {r})");
        }
    }

    #[test]
    fn out_of_range_component_is_rejected() {
        let (mut rec, _) = mixed_recording();
        let ica = Ica::fit(&rec, &[ChannelKind::Eeg], &cfg(2)).unwrap();
        let err = ica.apply(&mut rec, &[2]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::ComponentOutOfRange { index: 2, n_components: 2 })
        );
    }

    #[test]
    fn solution_survives_save_and_load() {
        let (rec, _) = mixed_recording();
        let mut ica = Ica::fit(&rec, &[ChannelKind::Eeg], &cfg(3)).unwrap();
        ica.exclude = vec![1];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-ica.safetensors");
        ica.save(&path).unwrap();
        let back = Ica::load(&path).unwrap();
        assert_eq!(back.exclude, vec![1]);
        assert_eq!(back.ch_names, ica.ch_names);
        let diff = back.sources(&rec).unwrap() - ica.sources(&rec).unwrap();
        assert!(diff.iter().all(|v| v.abs() < 1e-9));
    }
}
