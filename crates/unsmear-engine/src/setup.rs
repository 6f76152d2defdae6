//! Problem ingest: measured spectrum, covariance and response matrix.
//!
//! Everything downstream borrows the validated, normalized state assembled
//! here; the covariance inverse and the setup diagnostics are computed once.

use nalgebra::{DMatrix, DVector};
use unsmear_core::{Error, ResponseMatrixArtifact, Result};

use crate::math;

/// How the scan origin `w0` is chosen for the max-entropy solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialWeight {
    /// Derive from the data: `1/sqrt(a' * Cov_a^-1 * a)`.
    Auto,
    /// Use the given value.
    Fixed(f64),
}

impl Default for InitialWeight {
    fn default() -> Self {
        Self::Fixed(1.0)
    }
}

/// One unfolding problem: measured vector `a` (length `Na`), its covariance
/// (`Na x Na`) and the response matrix (`Na x Nb`) with per-cell variances.
///
/// The response columns are normalized to sum 1 at ingest; a column with no
/// content stays zero, marking an unreachable true bin. Immutable afterwards
/// except for the smoothed-response installation.
#[derive(Debug, Clone)]
pub struct UnfoldingProblem {
    measured: DVector<f64>,
    covariance: DMatrix<f64>,
    covariance_inv: DMatrix<f64>,
    raw_response: DMatrix<f64>,
    raw_response_err2: DMatrix<f64>,
    smooth_response: Option<(DMatrix<f64>, DMatrix<f64>)>,
    covariance_trace: f64,
    significant_bins: usize,
}

fn matrix_from_rows(rows: &[Vec<f64>], what: &str) -> Result<DMatrix<f64>> {
    let nrows = rows.len();
    if nrows == 0 {
        return Err(Error::Validation(format!("{what} has no rows")));
    }
    let ncols = rows[0].len();
    if ncols == 0 {
        return Err(Error::Validation(format!("{what} has no columns")));
    }
    for (i, row) in rows.iter().enumerate() {
        if row.len() != ncols {
            return Err(Error::Validation(format!(
                "{what} row {} length {} != {}",
                i,
                row.len(),
                ncols
            )));
        }
    }
    Ok(DMatrix::from_fn(nrows, ncols, |i, j| rows[i][j]))
}

fn ensure_finite(values: impl Iterator<Item = f64>, what: &str) -> Result<()> {
    for (k, v) in values.enumerate() {
        if !v.is_finite() {
            return Err(Error::Validation(format!("{what} entry {k} is not finite: {v}")));
        }
    }
    Ok(())
}

impl UnfoldingProblem {
    /// Ingest and validate a problem.
    ///
    /// `covariance` must be symmetric positive-definite (`Na x Na`);
    /// `response` and `response_err2` are `Na x Nb` in row-major rows, with
    /// non-negative entries.
    pub fn new(
        measured: &[f64],
        covariance: &[Vec<f64>],
        response: &[Vec<f64>],
        response_err2: &[Vec<f64>],
    ) -> Result<Self> {
        let na = measured.len();
        if na == 0 {
            return Err(Error::Validation("measured spectrum is empty".into()));
        }
        ensure_finite(measured.iter().copied(), "measured spectrum")?;

        let cov = matrix_from_rows(covariance, "covariance")?;
        if cov.nrows() != na || cov.ncols() != na {
            return Err(Error::Validation(format!(
                "covariance is {}x{}, expected {na}x{na}",
                cov.nrows(),
                cov.ncols()
            )));
        }
        ensure_finite(cov.iter().copied(), "covariance")?;

        let scale = cov.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(1.0);
        for i in 0..na {
            for j in (i + 1)..na {
                if (cov[(i, j)] - cov[(j, i)]).abs() > 1e-9 * scale {
                    return Err(Error::Validation(format!(
                        "covariance is not symmetric at ({i}, {j})"
                    )));
                }
            }
        }

        let mut resp = matrix_from_rows(response, "response matrix")?;
        if resp.nrows() != na {
            return Err(Error::Validation(format!(
                "response matrix has {} rows, expected {na}",
                resp.nrows()
            )));
        }
        let nb = resp.ncols();
        if nb < 2 {
            return Err(Error::Validation(format!(
                "response matrix needs at least 2 true bins, got {nb}"
            )));
        }

        let mut err2 = matrix_from_rows(response_err2, "response variance matrix")?;
        if err2.shape() != resp.shape() {
            return Err(Error::Validation(format!(
                "response variance matrix is {}x{}, expected {na}x{nb}",
                err2.nrows(),
                err2.ncols()
            )));
        }
        ensure_finite(resp.iter().copied(), "response matrix")?;
        ensure_finite(err2.iter().copied(), "response variance matrix")?;
        if resp.iter().any(|&v| v < 0.0) || err2.iter().any(|&v| v < 0.0) {
            return Err(Error::Validation("response matrix entries must be non-negative".into()));
        }

        // Column normalization: each true bin's probability mass sums to 1.
        // A column without content stays zero (unreachable true bin).
        for j in 0..nb {
            let sum: f64 = resp.column(j).iter().sum();
            if sum > 0.0 {
                for i in 0..na {
                    resp[(i, j)] /= sum;
                    err2[(i, j)] /= sum * sum;
                }
            }
        }

        let covariance_inv = math::invert_posdef(&cov).ok_or_else(|| {
            Error::Validation("measured covariance is not positive-definite".into())
        })?;

        let covariance_trace = cov.trace();
        let measured = DVector::from_column_slice(measured);
        let significant_bins = (0..na)
            .filter(|&i| measured[i] > 0.0 && cov[(i, i)] < measured[i] * measured[i])
            .count();

        Ok(Self {
            measured,
            covariance: cov,
            covariance_inv,
            raw_response: resp,
            raw_response_err2: err2,
            smooth_response: None,
            covariance_trace,
            significant_bins,
        })
    }

    /// Number of measured bins.
    pub fn na(&self) -> usize {
        self.measured.len()
    }

    /// Number of true bins.
    pub fn nb(&self) -> usize {
        self.raw_response.ncols()
    }

    /// The measured vector `a`.
    pub fn measured(&self) -> &DVector<f64> {
        &self.measured
    }

    /// The measured covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// The cached covariance inverse.
    pub fn covariance_inv(&self) -> &DMatrix<f64> {
        &self.covariance_inv
    }

    /// The response matrix in use: the smoothed surrogate once installed,
    /// the normalized raw matrix otherwise.
    pub fn response(&self) -> &DMatrix<f64> {
        match &self.smooth_response {
            Some((m, _)) => m,
            None => &self.raw_response,
        }
    }

    /// Per-cell variances matching [`Self::response`].
    pub fn response_err2(&self) -> &DMatrix<f64> {
        match &self.smooth_response {
            Some((_, e)) => e,
            None => &self.raw_response_err2,
        }
    }

    /// The normalized raw response, regardless of smoothing.
    pub fn raw_response(&self) -> &DMatrix<f64> {
        &self.raw_response
    }

    /// Per-cell variances of the normalized raw response.
    pub fn raw_response_err2(&self) -> &DMatrix<f64> {
        &self.raw_response_err2
    }

    /// Whether a smoothed response has been installed.
    pub fn is_smoothed(&self) -> bool {
        self.smooth_response.is_some()
    }

    pub(crate) fn install_smoothed(&mut self, matrix: DMatrix<f64>, err2: DMatrix<f64>) {
        self.smooth_response = Some((matrix, err2));
    }

    /// `trace(Cov_a)`, the reference for the covariance-trace selection.
    pub fn covariance_trace(&self) -> f64 {
        self.covariance_trace
    }

    /// Count of measured bins with `a_i > 0` and relative variance below 1.
    pub fn significant_bins(&self) -> usize {
        self.significant_bins
    }

    /// Resolve the scan origin `w0`.
    pub fn initial_weight(&self, mode: InitialWeight) -> f64 {
        match mode {
            InitialWeight::Fixed(w) => w,
            InitialWeight::Auto => {
                let q = (self.measured.transpose() * &self.covariance_inv * &self.measured)[(0, 0)];
                1.0 / q.sqrt()
            }
        }
    }

    /// Export the response matrix in use, for traceability.
    pub fn response_artifact(&self) -> Result<ResponseMatrixArtifact> {
        let m = self.response();
        let rows: Vec<Vec<f64>> =
            (0..self.na()).map(|i| (0..self.nb()).map(|j| m[(i, j)]).collect()).collect();
        ResponseMatrixArtifact::new(rows, self.is_smoothed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn identity_rows(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect()
    }

    fn zeros_rows(nrows: usize, ncols: usize) -> Vec<Vec<f64>> {
        vec![vec![0.0; ncols]; nrows]
    }

    #[test]
    fn columns_normalize_to_one_or_zero() {
        // 3x3 with an empty middle column.
        let response = vec![
            vec![2.0, 0.0, 1.0],
            vec![6.0, 0.0, 1.0],
            vec![0.0, 0.0, 2.0],
        ];
        let problem = UnfoldingProblem::new(
            &[5.0, 5.0, 5.0],
            &identity_rows(3),
            &response,
            &zeros_rows(3, 3),
        )
        .unwrap();

        let m = problem.response();
        for j in [0usize, 2] {
            let sum: f64 = m.column(j).iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
        }
        let empty: f64 = m.column(1).iter().sum();
        assert_eq!(empty, 0.0);
        assert_relative_eq!(m[(1, 0)], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn err2_scales_with_squared_column_sum() {
        let response = vec![vec![1.0, 0.5], vec![3.0, 0.5]];
        let err2 = vec![vec![0.8, 0.0], vec![1.6, 0.0]];
        let problem = UnfoldingProblem::new(
            &[1.0, 1.0],
            &identity_rows(2),
            &response,
            &err2,
        )
        .unwrap();
        // Column 0 sum is 4, so variances divide by 16.
        assert_relative_eq!(problem.response_err2()[(0, 0)], 0.05, epsilon = 1e-12);
        assert_relative_eq!(problem.response_err2()[(1, 0)], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let err = UnfoldingProblem::new(
            &[1.0, 2.0, 3.0],
            &identity_rows(2),
            &identity_rows(3),
            &zeros_rows(3, 3),
        );
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn indefinite_covariance_is_fatal() {
        // Eigenvalues 3 and -1.
        let cov = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        let err = UnfoldingProblem::new(
            &[1.0, 2.0],
            &cov,
            &identity_rows(2),
            &zeros_rows(2, 2),
        );
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn asymmetric_covariance_is_fatal() {
        let cov = vec![vec![1.0, 0.5], vec![0.0, 1.0]];
        let err = UnfoldingProblem::new(
            &[1.0, 2.0],
            &cov,
            &identity_rows(2),
            &zeros_rows(2, 2),
        );
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn setup_diagnostics() {
        // Bin 0: a=4, var=1 -> significant. Bin 1: a=1, var=4 -> not.
        let cov = vec![vec![1.0, 0.0], vec![0.0, 4.0]];
        let problem = UnfoldingProblem::new(
            &[4.0, 1.0],
            &cov,
            &identity_rows(2),
            &zeros_rows(2, 2),
        )
        .unwrap();
        assert_eq!(problem.significant_bins(), 1);
        assert_relative_eq!(problem.covariance_trace(), 5.0);
    }

    #[test]
    fn initial_weight_modes() {
        let problem = UnfoldingProblem::new(
            &[3.0, 4.0],
            &identity_rows(2),
            &identity_rows(2),
            &zeros_rows(2, 2),
        )
        .unwrap();
        assert_relative_eq!(problem.initial_weight(InitialWeight::Fixed(2.5)), 2.5);
        // a'a = 25 with unit covariance.
        assert_relative_eq!(problem.initial_weight(InitialWeight::Auto), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn artifact_reflects_current_response() {
        let mut problem = UnfoldingProblem::new(
            &[1.0, 1.0],
            &identity_rows(2),
            &identity_rows(2),
            &zeros_rows(2, 2),
        )
        .unwrap();
        assert!(!problem.response_artifact().unwrap().smoothed);

        problem.install_smoothed(DMatrix::identity(2, 2), DMatrix::zeros(2, 2));
        let artifact = problem.response_artifact().unwrap();
        assert!(artifact.smoothed);
        assert_eq!(artifact.n_true, 2);
    }
}
