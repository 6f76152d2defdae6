//! Common data types for the unsmear workspace

use serde::{Deserialize, Serialize};

use crate::Result;

// ---------------------------------------------------------------------------
// Scan table
// ---------------------------------------------------------------------------

/// One row of a regularization sweep.
///
/// A scan evaluates the solver at the grid strengths in order; every grid
/// point produces a `ScanPoint`, converged or not. Unconverged points carry
/// `converged = false` and zeroed diagnostics, and are skipped by selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Grid index (0-based).
    pub index: usize,
    /// Regularization strength at this grid point.
    pub strength: f64,
    /// Whether the solver converged here.
    pub converged: bool,
    /// Total chi-square of the folded solution against the measured vector.
    pub chi_square: f64,
    /// Effective rank (trace of the resolution operator).
    pub effective_rank: f64,
    /// Trace of the propagated output covariance.
    pub covariance_trace: f64,
    /// Sum of squared scale-invariant discrete second derivatives.
    pub second_derivative_penalty: f64,
    /// Sum of squared solution entries.
    pub zero_derivative_penalty: f64,
    /// Shannon-like entropy of the normalized solution.
    pub entropy: f64,
    /// Frobenius-norm bias diagnostic of the resolution operator.
    pub resolution_asymmetry: f64,
    /// Squared Euclidean distance to the reference spectrum, if one was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_reference: Option<f64>,
}

impl ScanPoint {
    /// Placeholder for a grid point where the solver failed.
    pub fn unconverged(index: usize, strength: f64) -> Self {
        Self {
            index,
            strength,
            converged: false,
            chi_square: 0.0,
            effective_rank: 0.0,
            covariance_trace: 0.0,
            second_derivative_penalty: 0.0,
            zero_derivative_penalty: 0.0,
            entropy: 0.0,
            resolution_asymmetry: 0.0,
            distance_to_reference: None,
        }
    }
}

/// The full ordered regularization sweep plus the selected grid point.
///
/// Retained in every solver outcome so callers can audit or plot the scan
/// (chi-square, covariance trace, penalties and entropy versus strength).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTable {
    /// All grid points, in grid order.
    pub points: Vec<ScanPoint>,
    /// Index of the selected grid point.
    pub selected: usize,
    /// Trace of the measured covariance, the normalizer for
    /// `covariance_trace` in the selection criterion.
    pub reference_trace: f64,
}

impl ScanTable {
    /// The selected scan point.
    pub fn selected_point(&self) -> &ScanPoint {
        &self.points[self.selected]
    }

    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Unfolded spectrum
// ---------------------------------------------------------------------------

/// Result of one unfolding run at the selected regularization strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnfoldedSpectrum {
    /// Unfolded values per true bin.
    pub values: Vec<f64>,

    /// Per-bin errors (sqrt of covariance diagonal).
    pub errors: Vec<f64>,

    /// Covariance matrix (row-major, `Nb×Nb`). Always filled by the engine;
    /// optional so externally produced artifacts without it still load.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covariance: Option<Vec<f64>>,

    /// Chi-square contribution of each measured bin.
    pub bin_chi_squares: Vec<f64>,

    /// Total chi-square of the folded solution.
    pub chi_square: f64,

    /// Effective degrees of freedom for the probability.
    pub ndf: f64,

    /// Upper-tail chi-square probability at `ndf`.
    pub probability: f64,

    /// Selected regularization strength.
    pub strength: f64,

    /// Grid index of the selected strength.
    pub strength_index: usize,
}

impl UnfoldedSpectrum {
    /// Sum of the unfolded values.
    pub fn integral(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Correlation matrix element `(i, j)`. `None` if the covariance is
    /// unavailable or a diagonal entry is not positive.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.values.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.errors[i];
        let sigma_j = self.errors[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }
}

/// Everything one solver run produces: the final spectrum and the scan that
/// led to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverOutcome {
    /// Final unfolded spectrum at the selected strength.
    pub spectrum: UnfoldedSpectrum,
    /// The regularization sweep behind it.
    pub scan: ScanTable,
}

impl SolverOutcome {
    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Smoothing report
// ---------------------------------------------------------------------------

/// Outcome of the parametric response-matrix smoothing fit.
///
/// Non-convergence is reported here rather than as an error; the caller
/// decides whether to proceed with the raw matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothingReport {
    /// Fitted model parameters `[a0, a1, a2, b0, b1, b2]`.
    pub parameters: Vec<f64>,
    /// Parameter uncertainties (sqrt of covariance diagonal); zeros if the
    /// covariance step failed.
    pub uncertainties: Vec<f64>,
    /// Chi-square of the fit over the included cells.
    pub chi_square: f64,
    /// Degrees of freedom: included cells minus six parameters.
    pub ndf: i64,
    /// Upper-tail chi-square probability (zero when `ndf <= 0`).
    pub probability: f64,
    /// Number of matrix cells included in the fit.
    pub n_fit_points: usize,
    /// Whether the fit converged and the smoothed matrix was installed.
    pub converged: bool,
    /// Per-cell chi-square contributions, `[measured][true]`, zero for cells
    /// excluded from the fit. Empty when the fit failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cell_chi_squares: Vec<Vec<f64>>,
}

impl SmoothingReport {
    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Response matrix artifact
// ---------------------------------------------------------------------------

/// Export-friendly view of the response (migration) matrix actually in use.
///
/// `matrix[i][j]` is the probability that true bin `j` is observed in
/// measured bin `i`; columns sum to 1 (or 0 for unreachable true bins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMatrixArtifact {
    /// Number of measured bins (rows).
    pub n_measured: usize,
    /// Number of true bins (columns).
    pub n_true: usize,
    /// Matrix in row-major order: `matrix[measured][true]`.
    pub matrix: Vec<Vec<f64>>,
    /// Whether this is the smoothed surrogate rather than the raw matrix.
    pub smoothed: bool,
    /// Purity per measured bin: fraction coming from the diagonal true bin.
    pub purity: Vec<f64>,
    /// Stability per true bin: fraction staying in the diagonal measured bin.
    pub stability: Vec<f64>,
}

impl ResponseMatrixArtifact {
    /// Build the artifact from a column-normalized matrix.
    pub fn new(matrix: Vec<Vec<f64>>, smoothed: bool) -> Result<Self> {
        let n_measured = matrix.len();
        if n_measured == 0 {
            return Err(crate::Error::Validation("response matrix has no rows".into()));
        }
        let n_true = matrix[0].len();
        for (i, row) in matrix.iter().enumerate() {
            if row.len() != n_true {
                return Err(crate::Error::Validation(format!(
                    "response matrix row {} length {} != {}",
                    i,
                    row.len(),
                    n_true
                )));
            }
        }

        let mut col_sums = vec![0.0_f64; n_true];
        for row in &matrix {
            for (j, &v) in row.iter().enumerate() {
                col_sums[j] += v;
            }
        }

        let purity: Vec<f64> = (0..n_measured)
            .map(|i| {
                let row_sum: f64 = matrix[i].iter().sum();
                if row_sum > 0.0 && i < n_true { matrix[i][i] / row_sum } else { 0.0 }
            })
            .collect();

        let stability: Vec<f64> = (0..n_true)
            .map(|j| if col_sums[j] > 0.0 && j < n_measured { matrix[j][j] / col_sums[j] } else { 0.0 })
            .collect();

        Ok(Self { n_measured, n_true, matrix, smoothed, purity, stability })
    }

    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
