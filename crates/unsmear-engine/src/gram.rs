//! Eigendecomposition of the Gram matrix `G = M * M'` of the response.
//!
//! The iterative solver expresses its regularized inverse through the
//! eigenpairs of `G`; eigenvalues below [`EPS_LAMBDA`] are treated as null
//! directions and never inverted.

use nalgebra::{DMatrix, SymmetricEigen};
use unsmear_core::{Error, Result};

/// Eigenvalues below this are considered zero.
pub const EPS_LAMBDA: f64 = 1e-10;

/// Sorted eigenpairs of `G = M * M'` plus the derived step size `tau`.
#[derive(Debug, Clone)]
pub struct GramSpectrum {
    eigenvalues: Vec<f64>,
    eigenvectors: DMatrix<f64>,
    tau: f64,
    rank: usize,
}

impl GramSpectrum {
    /// Decompose the Gram matrix of `response` (`Na x Nb`).
    ///
    /// Fails with [`Error::Computation`] when the response carries no
    /// significant singular value at all.
    pub fn new(response: &DMatrix<f64>) -> Result<Self> {
        let g = response * response.transpose();
        let eig = SymmetricEigen::new(g);

        let n = eig.eigenvalues.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&i, &j| eig.eigenvalues[j].total_cmp(&eig.eigenvalues[i]));

        let eigenvalues: Vec<f64> = order.iter().map(|&l| eig.eigenvalues[l]).collect();
        let mut eigenvectors = DMatrix::zeros(n, n);
        for (dst, &src) in order.iter().enumerate() {
            eigenvectors.set_column(dst, &eig.eigenvectors.column(src));
        }

        let lambda_max = eigenvalues[0];
        if lambda_max < EPS_LAMBDA {
            return Err(Error::Computation(
                "Gram matrix of the response is numerically zero".into(),
            ));
        }

        let rank = eigenvalues.iter().filter(|&&l| l >= EPS_LAMBDA).count();
        Ok(Self { eigenvalues, eigenvectors, tau: 1.0 / lambda_max, rank })
    }

    /// Eigenvalues in descending order.
    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Step size `tau = 1/lambda_max`.
    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Number of eigenvalues at or above [`EPS_LAMBDA`].
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Eigenvalues at or above [`EPS_LAMBDA`], largest first.
    pub fn significant(&self) -> impl Iterator<Item = f64> + '_ {
        self.eigenvalues.iter().copied().filter(|&l| l >= EPS_LAMBDA)
    }

    /// Assemble `sum_l weight(lambda_l)/lambda_l * v_l v_l'` over the
    /// significant eigenpairs. `weight = 1` yields the pseudo-inverse of `G`.
    pub fn weighted_inverse<F: Fn(f64) -> f64>(&self, weight: F) -> DMatrix<f64> {
        let n = self.eigenvectors.nrows();
        let mut out = DMatrix::zeros(n, n);
        for (l, &lam) in self.eigenvalues.iter().enumerate() {
            if lam < EPS_LAMBDA {
                continue;
            }
            let v = self.eigenvectors.column(l).clone_owned();
            out += (&v * v.transpose()) * (weight(lam) / lam);
        }
        out
    }
}
