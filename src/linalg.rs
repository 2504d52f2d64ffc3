//! Dense linear algebra on `ndarray` arrays, backed by `nalgebra`.
//!
//! The pipeline keeps data in `ndarray`; the few decompositions it needs
//! (symmetric eigen, SVD, pseudo-inverse) go through `DMatrix` copies. All
//! matrices involved are at most a few hundred rows, so the copies are
//! negligible next to the `[C, T]` products.
use anyhow::{bail, Result};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2};
use rand::Rng;

pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Eigen-decomposition of a symmetric matrix, eigenvalues in descending
/// order. Eigenvectors are the columns of the returned matrix.
pub fn eigh(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    if a.nrows() != a.ncols() {
        bail!("eigh: matrix is {:?}, not square", a.dim());
    }
    let eig = SymmetricEigen::new(to_dmatrix(a));
    let mut order: Vec<usize> = (0..a.nrows()).collect();
    order.sort_by(|&i, &j| eig.eigenvalues[j].total_cmp(&eig.eigenvalues[i]));
    let values = Array1::from_iter(order.iter().map(|&i| eig.eigenvalues[i]));
    let vectors = Array2::from_shape_fn(a.dim(), |(r, c)| eig.eigenvectors[(r, order[c])]);
    Ok((values, vectors))
}

/// Thin SVD `a = u · diag(s) · vt`, singular values in descending order.
pub fn svd(a: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>)> {
    let dec = to_dmatrix(a).svd(true, true);
    let (Some(u), Some(vt)) = (dec.u, dec.v_t) else {
        bail!("svd: decomposition failed for a {:?} matrix", a.dim());
    };
    let k = dec.singular_values.len();
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&i, &j| dec.singular_values[j].total_cmp(&dec.singular_values[i]));
    let s = Array1::from_iter(order.iter().map(|&i| dec.singular_values[i]));
    let u = Array2::from_shape_fn((u.nrows(), k), |(r, c)| u[(r, order[c])]);
    let vt = Array2::from_shape_fn((k, vt.ncols()), |(r, c)| vt[(order[r], c)]);
    Ok((u, s, vt))
}

/// Moore–Penrose pseudo-inverse; singular values below `rcond · s_max` are
/// treated as zero.
pub fn pinv(a: &Array2<f64>, rcond: f64) -> Result<Array2<f64>> {
    let (u, s, vt) = svd(a)?;
    let cutoff = rcond * s.iter().copied().fold(0.0, f64::max);
    let mut out = Array2::<f64>::zeros((a.ncols(), a.nrows()));
    for (k, &sk) in s.iter().enumerate() {
        if sk <= cutoff || sk == 0.0 {
            continue;
        }
        let vk = vt.row(k);
        let uk = u.column(k);
        for i in 0..a.ncols() {
            let vi = vk[i] / sk;
            if vi == 0.0 {
                continue;
            }
            for j in 0..a.nrows() {
                out[[i, j]] += vi * uk[j];
            }
        }
    }
    Ok(out)
}

/// Orthonormal basis of the row space of `a` (`[k, T]` → `[r, T]`, `r ≤ k`).
///
/// Works on the small Gram matrix `a · aᵀ`, so `T` may be large.
/// Directions with eigenvalue below `tol · λ_max` are discarded.
pub fn orthonormal_rows(a: &Array2<f64>, tol: f64) -> Result<Array2<f64>> {
    let gram = a.dot(&a.t());
    let (vals, vecs) = eigh(&gram)?;
    let lmax = vals.iter().copied().fold(0.0, f64::max);
    let keep: Vec<usize> = (0..vals.len()).filter(|&i| lmax > 0.0 && vals[i] > tol * lmax).collect();
    let mut basis = Array2::<f64>::zeros((keep.len(), a.ncols()));
    for (r, &i) in keep.iter().enumerate() {
        let w = vecs.column(i).mapv(|v| v / vals[i].sqrt());
        basis.row_mut(r).assign(&w.dot(a));
    }
    Ok(basis)
}

/// Least-squares sphere through `points`: returns `(center, radius)`.
///
/// Solves `|p|² = 2 c·p + (r² − |c|²)` for `c` and the constant.
pub fn fit_sphere(points: &[[f64; 3]]) -> Result<([f64; 3], f64)> {
    if points.len() < 4 {
        bail!("need at least 4 points to fit a sphere, got {}", points.len());
    }
    let n = points.len();
    let a = Array2::from_shape_fn((n, 4), |(i, j)| if j < 3 { 2.0 * points[i][j] } else { 1.0 });
    let b = Array1::from_iter(points.iter().map(|p| p[0] * p[0] + p[1] * p[1] + p[2] * p[2]));
    let x = pinv(&a, 1e-12)?.dot(&b);
    let center = [x[0], x[1], x[2]];
    let r2 = x[3] + center.iter().map(|c| c * c).sum::<f64>();
    if !(r2 > 0.0) {
        bail!("degenerate sphere fit");
    }
    Ok((center, r2.sqrt()))
}

/// One standard normal draw (Box–Muller).
pub fn randn<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Matrix of independent standard normal draws.
pub fn randn_matrix<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_simple_fn((rows, cols), || randn(rng))
}

/// Row-wise Pearson correlation matrix of `[C, T]` data. Constant rows get
/// NaN correlations.
pub fn corrcoef(data: &Array2<f64>) -> Array2<f64> {
    let n_t = data.ncols() as f64;
    let mut centered = data.clone();
    for mut row in centered.rows_mut() {
        let m = row.sum() / n_t;
        row.mapv_inplace(|v| v - m);
    }
    let cov = centered.dot(&centered.t());
    let d: Vec<f64> = (0..cov.nrows()).map(|i| cov[[i, i]].sqrt()).collect();
    Array2::from_shape_fn(cov.dim(), |(i, j)| {
        if d[i] > 0.0 && d[j] > 0.0 {
            cov[[i, j]] / (d[i] * d[j])
        } else {
            f64::NAN
        }
    })
}
