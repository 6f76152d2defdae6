//! Small numerical helpers shared across the solvers.

use nalgebra::DMatrix;

/// Upper tail of the chi-squared distribution, `P(X > x)` with `df` degrees
/// of freedom. Real-valued `df` is allowed because regularized fits report an
/// effective (non-integer) rank.
pub fn chi2_sf(x: f64, df: f64) -> f64 {
    if x <= 0.0 || df <= 0.0 {
        return 1.0;
    }
    // P(X > x) = 1 - gamma_lr(df/2, x/2), regularized lower incomplete gamma.
    1.0 - statrs::function::gamma::gamma_lr(df / 2.0, x / 2.0)
}

/// Chi-square probability with the degrees of freedom rounded to the nearest
/// integer, zero when that rounds to nothing.
pub fn chi2_probability(chi_square: f64, ndf: f64) -> f64 {
    let rounded = ndf.round();
    if rounded > 0.0 { chi2_sf(chi_square, rounded) } else { 0.0 }
}

/// Standard normal CDF `P(Z <= z)`.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-z / std::f64::consts::SQRT_2)
}

/// Inverse of a symmetric positive-definite matrix via Cholesky.
///
/// Returns `None` if the factorization fails (matrix not positive-definite).
pub fn invert_posdef(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = m.nrows();
    nalgebra::linalg::Cholesky::new(m.clone()).map(|chol| chol.solve(&DMatrix::identity(n, n)))
}

/// General matrix inverse via LU. `None` if the matrix is singular.
pub fn invert_general(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    m.clone().lu().try_inverse()
}

/// Squared Frobenius norm of `a - b`.
pub fn frobenius_diff2(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    (a - b).iter().map(|v| v * v).sum()
}

/// Row-major copy of a matrix, for the serialized covariance artifact.
pub fn to_row_major(m: &DMatrix<f64>) -> Vec<f64> {
    let (nrows, ncols) = m.shape();
    let mut out = Vec::with_capacity(nrows * ncols);
    for i in 0..nrows {
        for j in 0..ncols {
            out.push(m[(i, j)]);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Shape diagnostics shared by all solvers
// ---------------------------------------------------------------------------

/// Sum of squared scale-invariant discrete second derivatives,
/// `sum_j [2(b_{j+1}-b_j)/(b_{j+1}+b_j) - 2(b_j-b_{j-1})/(b_j+b_{j-1})]^2`.
pub fn second_derivative_penalty(b: &[f64]) -> f64 {
    let n = b.len();
    let mut sum = 0.0;
    for j in 1..n.saturating_sub(1) {
        let term = 2.0 * (b[j + 1] - b[j]) / (b[j + 1] + b[j])
            - 2.0 * (b[j] - b[j - 1]) / (b[j] + b[j - 1]);
        sum += term * term;
    }
    sum
}

/// Sum of squared entries, the zero-derivative penalty.
pub fn zero_derivative_penalty(b: &[f64]) -> f64 {
    b.iter().map(|v| v * v).sum()
}

/// Entropy `sum_j p_j ln p_j` of the normalized positive part of `b`.
pub fn shape_entropy(b: &[f64]) -> f64 {
    let sum: f64 = b.iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    b.iter()
        .map(|&v| v / sum)
        .filter(|&p| p > 0.0)
        .map(|p| p * p.ln())
        .sum()
}
