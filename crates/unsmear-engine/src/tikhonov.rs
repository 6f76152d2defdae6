//! Regularized least squares on the normalized spectrum shape.
//!
//! The free parameters are the first `Nb - 1` entries of the shape `p`; the
//! last entry is fixed by `sum(p) = 1` and the overall normalization is
//! profiled analytically against the measurement. Each grid point minimizes
//!
//! ```text
//! F(p) = chi2(p)/2 * w + r(b)
//! ```
//!
//! where `r` is the squared relative second derivative of `b = p * norm`.
//! A large weight `w` lets the data dominate, a small one enforces
//! smoothness.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use unsmear_core::{Error, Result, ScanPoint, ScanTable, SolverOutcome};

use crate::math;
use crate::optimize::{
    covariance_from_hessian, numerical_hessian, BoundedMinimizer, MinimizerConfig,
    ObjectiveFunction,
};
use crate::prior::PriorDistribution;
use crate::scan::{self, PointSolution};
use crate::setup::UnfoldingProblem;

/// Objective value returned when a shape entry is non-positive.
const BARRIER: f64 = 1e20;

/// The profiled solution at one parameter point.
struct ShapeFit {
    b: DVector<f64>,
    norm: f64,
    residual: DVector<f64>,
    weighted_residual: DVector<f64>,
    chi_square: f64,
}

struct TikhonovObjective<'a> {
    problem: &'a UnfoldingProblem,
    weight: f64,
}

impl TikhonovObjective<'_> {
    /// Reconstruct the full shape, profile the normalization and evaluate
    /// the fit. `None` when some shape entry is non-positive.
    fn shape(&self, params: &[f64]) -> Option<ShapeFit> {
        let nb = self.problem.nb();
        let mut p = DVector::zeros(nb);
        let mut sum = 0.0;
        for (i, &v) in params.iter().enumerate() {
            p[i] = v;
            sum += v;
        }
        p[nb - 1] = 1.0 - sum;
        if p.iter().any(|&v| v <= 0.0) {
            return None;
        }

        let m = self.problem.response();
        let cov_inv = self.problem.covariance_inv();
        let a = self.problem.measured();

        let alpha = m * &p;
        let c_alpha = cov_inv * &alpha;
        let norm = alpha.dot(&(cov_inv * a)) / alpha.dot(&c_alpha);

        let b = &p * norm;
        let residual = a - m * &b;
        let weighted_residual = cov_inv * &residual;
        let chi_square = residual.dot(&weighted_residual);

        Some(ShapeFit { b, norm, residual, weighted_residual, chi_square })
    }
}

impl ObjectiveFunction for TikhonovObjective<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(match self.shape(params) {
            Some(s) => {
                s.chi_square / 2.0 * self.weight
                    + math::second_derivative_penalty(s.b.as_slice())
            }
            None => BARRIER,
        })
    }
}

/// Second-derivative-regularized unfolding over the strength grid.
pub struct TikhonovUnfolder<'a> {
    problem: &'a UnfoldingProblem,
    prior: &'a PriorDistribution,
    reference: Option<Vec<f64>>,
    config: MinimizerConfig,
}

impl<'a> TikhonovUnfolder<'a> {
    /// New solver; the prior supplies the starting shape for every fit.
    pub fn new(problem: &'a UnfoldingProblem, prior: &'a PriorDistribution) -> Self {
        Self { problem, prior, reference: None, config: MinimizerConfig::default() }
    }

    /// Track the squared distance to a known spectrum at every grid point.
    pub fn with_reference(mut self, reference: &[f64]) -> Self {
        self.reference = Some(reference.to_vec());
        self
    }

    /// Override the minimizer configuration.
    pub fn with_config(mut self, config: MinimizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Scan the strength grid, select the working point and assemble the
    /// unfolded spectrum there.
    pub fn run(&self) -> Result<SolverOutcome> {
        let nb = self.problem.nb();
        if self.prior.len() != nb {
            return Err(Error::Validation(format!(
                "prior has {} bins, expected {nb}",
                self.prior.len()
            )));
        }
        if let Some(r) = &self.reference {
            if r.len() != nb {
                return Err(Error::Validation(format!(
                    "reference spectrum has {} bins, expected {nb}",
                    r.len()
                )));
            }
        }

        let grid = scan::strength_grid(1.0);
        let mut solutions: Vec<Option<PointSolution>> =
            grid.par_iter().map(|&w| self.solve_at(w)).collect();

        let points: Vec<ScanPoint> = solutions
            .iter()
            .enumerate()
            .map(|(ix, sol)| match sol {
                Some(s) => s.scan_point(ix, grid[ix], self.reference.as_deref()),
                None => ScanPoint::unconverged(ix, grid[ix]),
            })
            .collect();

        let reference_trace = self.problem.covariance_trace();
        let best = scan::select_best(&points, reference_trace, self.problem.significant_bins())?;
        let solution = solutions[best]
            .take()
            .ok_or_else(|| Error::Convergence("selected scan point has no solution".into()))?;

        log::debug!(
            "shape-fit scan: selected ix {best} (w = {:.3e}, chi2 = {:.4})",
            grid[best],
            solution.chi_square
        );

        let spectrum = solution.into_spectrum(best, grid[best], self.problem.na() as f64);
        Ok(SolverOutcome { spectrum, scan: ScanTable { points, selected: best, reference_trace } })
    }

    /// One grid point: fit, curvature, covariance extension.
    fn solve_at(&self, weight: f64) -> Option<PointSolution> {
        let nb = self.problem.nb();
        let npar = nb - 1;
        let objective = TikhonovObjective { problem: self.problem, weight };

        let init = &self.prior.as_slice()[..npar];
        let bounds = vec![(-1.0, 1.0); npar];
        let minimizer = BoundedMinimizer::new(self.config.clone());

        let fit = match minimizer.minimize(&objective, init, &bounds) {
            Ok(fit) if fit.converged => fit,
            Ok(fit) => {
                log::debug!("weight {weight:.3e}: stopped without converging: {}", fit.message);
                return None;
            }
            Err(e) => {
                log::debug!("weight {weight:.3e}: {e}");
                return None;
            }
        };

        let shape = objective.shape(&fit.parameters)?;
        let hessian = numerical_hessian(&objective, &fit.parameters).ok()?;
        let small = covariance_from_hessian(&hessian, 1.0)?;

        // Extend the free-parameter covariance with the constrained last
        // bin, whose deviation is minus the sum of the others'.
        let mut cov = DMatrix::zeros(nb, nb);
        let mut corner = 0.0;
        for i in 0..npar {
            for k in 0..npar {
                cov[(i, k)] = small[(i, k)];
            }
            let row: f64 = (0..npar).map(|k| small[(i, k)]).sum();
            cov[(i, nb - 1)] = -row;
            cov[(nb - 1, i)] = -row;
            corner += row;
        }
        cov[(nb - 1, nb - 1)] = corner;
        cov *= shape.norm * shape.norm;

        let values: Vec<f64> = shape.b.iter().copied().collect();
        let bin_chi_squares: Vec<f64> = shape
            .weighted_residual
            .iter()
            .zip(shape.residual.iter())
            .map(|(w, r)| w * r)
            .collect();

        Some(PointSolution {
            covariance_trace: cov.trace(),
            covariance: cov,
            bin_chi_squares,
            chi_square: shape.chi_square,
            effective_rank: 0.0,
            second_derivative_penalty: math::second_derivative_penalty(&values),
            zero_derivative_penalty: math::zero_derivative_penalty(&values),
            entropy: math::shape_entropy(&values),
            resolution_asymmetry: 0.0,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn identity_rows(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect()).collect()
    }

    fn flat_identity_problem(n: usize, content: f64) -> UnfoldingProblem {
        UnfoldingProblem::new(
            &vec![content; n],
            &identity_rows(n),
            &identity_rows(n),
            &vec![vec![0.0; n]; n],
        )
        .unwrap()
    }

    #[test]
    fn identity_problem_is_reproduced() {
        let problem = flat_identity_problem(4, 10.0);
        let prior = PriorDistribution::uniform(4).unwrap();
        let outcome = TikhonovUnfolder::new(&problem, &prior).run().unwrap();

        // A flat shape zeroes both the chi-square and the penalty, so every
        // converged grid point lands on the exact solution.
        for v in &outcome.spectrum.values {
            assert_relative_eq!(*v, 10.0, epsilon = 1e-3);
        }
        assert!(outcome.spectrum.chi_square < 1e-6);
        assert_relative_eq!(outcome.spectrum.ndf, 4.0);
        assert!(outcome.spectrum.probability > 0.999);
        assert_eq!(outcome.scan.points.len(), scan::GRID_POINTS);
        assert_eq!(outcome.scan.selected, outcome.spectrum.strength_index);

        let best = outcome.scan.selected_point();
        assert!(best.converged);
        assert_relative_eq!(best.entropy, -(4.0_f64.ln()), epsilon = 1e-6);
        assert_eq!(outcome.spectrum.covariance.as_ref().unwrap().len(), 16);
    }

    #[test]
    fn reference_distance_is_tracked() {
        let problem = flat_identity_problem(4, 10.0);
        let prior = PriorDistribution::uniform(4).unwrap();
        let truth = vec![10.0; 4];
        let outcome =
            TikhonovUnfolder::new(&problem, &prior).with_reference(&truth).run().unwrap();

        let best = outcome.scan.selected_point();
        let d2 = best.distance_to_reference.unwrap();
        assert!(d2 < 1e-4, "distance to truth = {d2}");
    }

    #[test]
    fn prior_length_mismatch_is_rejected() {
        let problem = flat_identity_problem(4, 10.0);
        let prior = PriorDistribution::uniform(3).unwrap();
        let err = TikhonovUnfolder::new(&problem, &prior).run();
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn barrier_rejects_non_positive_shapes() {
        let problem = flat_identity_problem(3, 5.0);
        let objective = TikhonovObjective { problem: &problem, weight: 1.0 };
        // Last shape entry is 1 - 0.8 - 0.4 < 0.
        assert_eq!(objective.eval(&[0.8, 0.4]).unwrap(), BARRIER);
        assert!(objective.eval(&[0.3, 0.3]).unwrap() < BARRIER);
    }
}
