//! Parametric smoothing of the response matrix.
//!
//! Each true bin's column is modeled as a Gaussian in the measured variable
//! whose mean and width are quadratic polynomials of the true-bin center:
//!
//! ```text
//! mean(y) = a0 + a1*y + a2*y^2 + y        y = j + 0.5
//! rms(y)  = b0 + b1*y + b2*y^2
//! ```
//!
//! The six coefficients are fitted to the statistically significant cells of
//! the raw response; on success the analytic matrix replaces the raw one and
//! its cell variances drop to zero.

use nalgebra::DMatrix;
use unsmear_core::{Result, SmoothingReport};

use crate::math;
use crate::optimize::{
    covariance_from_hessian, numerical_hessian, BoundedMinimizer, MinimizerConfig,
    ObjectiveFunction,
};
use crate::setup::UnfoldingProblem;

const NPAR: usize = 6;

/// Cells with a relative variance above this are excluded from the fit.
const MAX_RELATIVE_VAR: f64 = 0.09;

/// Model cells below this are zeroed before column normalization.
const MIN_CELL: f64 = 1e-10;

/// Penalty value returned when the width polynomial turns non-positive.
const BAD_WIDTH_PENALTY: f64 = 1e20;

/// The smoothed matrix evaluated at one parameter point.
struct SmoothModel {
    matrix: DMatrix<f64>,
    cells: DMatrix<f64>,
    chi_square: f64,
    n_points: usize,
}

struct SmoothObjective<'a> {
    response: &'a DMatrix<f64>,
    err2: &'a DMatrix<f64>,
}

impl SmoothObjective<'_> {
    /// Build the model matrix and the chi-square against the raw cells.
    ///
    /// Returns `None` when `rms(y) <= 0` for some column.
    fn evaluate_model(&self, par: &[f64]) -> Option<SmoothModel> {
        let (na, nb) = self.response.shape();
        let mut matrix = DMatrix::zeros(na, nb);
        let mut cells = DMatrix::zeros(na, nb);
        let mut chi_square = 0.0;
        let mut n_points = 0;

        for j in 0..nb {
            let y = j as f64 + 0.5;
            let mean = par[0] + par[1] * y + par[2] * y * y + y;
            let rms = par[3] + par[4] * y + par[5] * y * y;
            if rms <= 0.0 {
                return None;
            }

            let mut column = vec![0.0; na];
            let mut sum = 0.0;
            for (i, cell) in column.iter_mut().enumerate() {
                let xl = (i as f64 - mean) / rms;
                let xu = (i as f64 + 1.0 - mean) / rms;
                let mut value = math::normal_cdf(xu) - math::normal_cdf(xl);
                if value < MIN_CELL {
                    value = 0.0;
                }
                *cell = value;
                sum += value;
            }

            for (i, &cell) in column.iter().enumerate() {
                let value = if sum != 0.0 { cell / sum } else { cell };
                matrix[(i, j)] = value;

                let raw = self.response[(i, j)];
                let var = self.err2[(i, j)];
                if raw != 0.0 && var != 0.0 && value != 0.0 && var / (raw * raw) <= MAX_RELATIVE_VAR
                {
                    let contribution = (raw - value) * (raw - value) / var;
                    cells[(i, j)] = contribution;
                    chi_square += contribution;
                    n_points += 1;
                }
            }
        }

        Some(SmoothModel { matrix, cells, chi_square, n_points })
    }
}

impl ObjectiveFunction for SmoothObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(match self.evaluate_model(params) {
            Some(model) => model.chi_square,
            None => BAD_WIDTH_PENALTY,
        })
    }
}

/// Weighted linear regressions of the per-column mean and width against the
/// true-bin center, used as starting values for `a0, a1` and `b0, b1`.
fn starting_values(response: &DMatrix<f64>) -> [f64; NPAR] {
    let (na, nb) = response.shape();

    let mut total = 0.0;
    let mut xbar = 0.0;
    let mut xxbar = 0.0;
    let mut ybar_mean = 0.0;
    let mut xybar_mean = 0.0;
    let mut ybar_rms = 0.0;
    let mut xybar_rms = 0.0;

    for j in 0..nb {
        let x = j as f64 + 0.5;
        let mut mean = 0.0;
        let mut second = 0.0;
        let mut sum = 0.0;
        for i in 0..na {
            let y = i as f64 + 0.5;
            mean += y * response[(i, j)];
            second += y * y * response[(i, j)];
            sum += response[(i, j)];
        }
        if sum > 0.0 {
            mean /= sum;
            let rms = (second / sum - mean * mean).max(0.0).sqrt();

            total += sum;
            xbar += x * sum;
            xxbar += x * x * sum;
            ybar_mean += mean * sum;
            xybar_mean += x * mean * sum;
            ybar_rms += rms * sum;
            xybar_rms += x * rms * sum;
        }
    }

    if total > 0.0 {
        xbar /= total;
        xxbar /= total;
        ybar_mean /= total;
        xybar_mean /= total;
        ybar_rms /= total;
        xybar_rms /= total;
    }

    let denom = xxbar - xbar * xbar;
    let (a0, a1) = if denom.abs() > 0.0 {
        let slope = (xybar_mean - xbar * ybar_mean) / denom;
        (ybar_mean - slope * xbar, slope - 1.0)
    } else {
        (ybar_mean, -1.0)
    };
    let (b0, b1) = if denom.abs() > 0.0 {
        let slope = (xybar_rms - xbar * ybar_rms) / denom;
        (ybar_rms - slope * xbar, slope)
    } else {
        (ybar_rms, 0.0)
    };

    [a0, a1, 0.0, b0, b1, 0.0]
}

/// Fit the smooth parametrization to the raw response of `problem`.
///
/// On a converged fit the analytic matrix is installed and used by all
/// subsequent unfolding runs. A failed fit leaves the raw matrix in place
/// and is reported through [`SmoothingReport::converged`], not as an error.
pub fn smooth_response(problem: &mut UnfoldingProblem) -> Result<SmoothingReport> {
    let objective =
        SmoothObjective { response: problem.raw_response(), err2: problem.raw_response_err2() };
    let init = starting_values(problem.raw_response());

    let mut bounds = [(f64::NEG_INFINITY, f64::INFINITY); NPAR];
    bounds[3] = (1e-20, 10.0);

    let minimizer = BoundedMinimizer::new(MinimizerConfig::default());
    let fit = match minimizer.minimize(&objective, &init, &bounds) {
        Ok(fit) => fit,
        Err(e) => {
            log::warn!("response smoothing failed: {e}");
            return Ok(failed_report(&init));
        }
    };

    let covariance = numerical_hessian(&objective, &fit.parameters)
        .ok()
        .and_then(|h| covariance_from_hessian(&h, 1.0));
    let (model, covariance) = match (objective.evaluate_model(&fit.parameters), covariance) {
        // An under-determined fit (fewer usable cells than parameters) has a
        // meaningless curvature; treat it like a failed minimization.
        (Some(model), Some(cov)) if fit.converged && model.n_points > NPAR => (model, cov),
        _ => {
            log::warn!("response smoothing did not converge: {}", fit.message);
            return Ok(failed_report(&fit.parameters));
        }
    };

    let ndf = model.n_points as i64 - NPAR as i64;
    let report = SmoothingReport {
        parameters: fit.parameters.clone(),
        uncertainties: (0..NPAR).map(|k| covariance[(k, k)].max(0.0).sqrt()).collect(),
        chi_square: model.chi_square,
        ndf,
        probability: math::chi2_probability(model.chi_square, ndf as f64),
        n_fit_points: model.n_points,
        converged: true,
        cell_chi_squares: (0..model.cells.nrows())
            .map(|i| model.cells.row(i).iter().copied().collect())
            .collect(),
    };
    log::debug!(
        "response smoothing: chi2 = {:.4}, ndf = {}, points = {}",
        report.chi_square,
        report.ndf,
        report.n_fit_points
    );

    let err2 = DMatrix::zeros(model.matrix.nrows(), model.matrix.ncols());
    problem.install_smoothed(model.matrix, err2);
    Ok(report)
}

fn failed_report(parameters: &[f64]) -> SmoothingReport {
    SmoothingReport {
        parameters: parameters.to_vec(),
        uncertainties: vec![0.0; NPAR],
        chi_square: 0.0,
        ndf: 0,
        probability: 0.0,
        n_fit_points: 0,
        converged: false,
        cell_chi_squares: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Build a response directly from the parametrization.
    fn synthetic_response(na: usize, nb: usize, par: &[f64; NPAR]) -> Vec<Vec<f64>> {
        let mut rows = vec![vec![0.0; nb]; na];
        for j in 0..nb {
            let y = j as f64 + 0.5;
            let mean = par[0] + par[1] * y + par[2] * y * y + y;
            let rms = par[3] + par[4] * y + par[5] * y * y;
            let mut column = vec![0.0; na];
            let mut sum = 0.0;
            for (i, cell) in column.iter_mut().enumerate() {
                let xl = (i as f64 - mean) / rms;
                let xu = (i as f64 + 1.0 - mean) / rms;
                let mut value = math::normal_cdf(xu) - math::normal_cdf(xl);
                if value < MIN_CELL {
                    value = 0.0;
                }
                *cell = value;
                sum += value;
            }
            for i in 0..na {
                rows[i][j] = column[i] / sum;
            }
        }
        rows
    }

    fn identity_rows(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect()
    }

    #[test]
    fn bad_width_hits_penalty() {
        let response = DMatrix::identity(4, 4);
        let err2 = DMatrix::from_element(4, 4, 1e-4);
        let objective = SmoothObjective { response: &response, err2: &err2 };
        let f = objective.eval(&[0.0, 0.0, 0.0, -1.0, 0.0, 0.0]).unwrap();
        assert_eq!(f, BAD_WIDTH_PENALTY);
    }

    #[test]
    fn starting_values_track_a_diagonal_response() {
        let truth = [0.0, 0.0, 0.0, 0.9, 0.0, 0.0];
        let rows = synthetic_response(10, 10, &truth);
        let response = DMatrix::from_fn(10, 10, |i, j| rows[i][j]);
        let start = starting_values(&response);
        // A diagonal response: mean tracks y (a1 near zero) and the width is
        // roughly constant.
        assert!(start[1].abs() < 0.3, "a1 start = {}", start[1]);
        assert!(start[3] > 0.0, "b0 start = {}", start[3]);
        assert!((start[3] - 0.9).abs() < 0.5, "b0 start = {}", start[3]);
    }

    #[test]
    fn recovers_generating_parameters() {
        let truth = [0.3, -0.05, 0.0, 1.1, 0.02, 0.0];
        let na = 12;
        let nb = 10;
        let rows = synthetic_response(na, nb, &truth);
        let err2 = vec![vec![1e-4; nb]; na];
        let measured = vec![1.0; na];
        let cov: Vec<Vec<f64>> =
            (0..na).map(|i| (0..na).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect();

        let mut problem = UnfoldingProblem::new(&measured, &cov, &rows, &err2).unwrap();
        let report = smooth_response(&mut problem).unwrap();

        assert!(report.converged);
        assert!(problem.is_smoothed());
        assert!(report.n_fit_points > NPAR);
        // The data were generated by the model, so the fit lands on it.
        assert_relative_eq!(report.parameters[0], truth[0], epsilon = 0.05);
        assert_relative_eq!(report.parameters[3], truth[3], epsilon = 0.05);
        assert!(report.chi_square / (report.ndf.max(1) as f64) < 0.5);

        // The residual map covers the full matrix and adds up to the total.
        assert_eq!(report.cell_chi_squares.len(), na);
        assert_eq!(report.cell_chi_squares[0].len(), nb);
        let map_total: f64 = report.cell_chi_squares.iter().flatten().sum();
        assert_relative_eq!(map_total, report.chi_square, max_relative = 1e-12);
        let populated = report.cell_chi_squares.iter().flatten().filter(|&&v| v > 0.0).count();
        assert!(populated <= report.n_fit_points);

        // The installed matrix is column-normalized with zero variances.
        let m = problem.response();
        for j in 0..nb {
            let sum: f64 = m.column(j).iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
        }
        assert!(problem.response_err2().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn failure_leaves_raw_response_in_place() {
        // An identity response with no usable variance information: every
        // cell is excluded from the fit, the chi-square is flat at zero and
        // the curvature test cannot certify a minimum.
        let mut problem = UnfoldingProblem::new(
            &[1.0, 1.0, 1.0],
            &identity_rows(3),
            &identity_rows(3),
            &vec![vec![0.0; 3]; 3],
        )
        .unwrap();
        let report = smooth_response(&mut problem).unwrap();
        assert!(!report.converged);
        assert!(!problem.is_smoothed());
        assert!(report.cell_chi_squares.is_empty());
    }
}
