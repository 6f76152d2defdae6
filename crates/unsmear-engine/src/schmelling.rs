//! Maximum-entropy unfolding in the dual space of the measured bins.
//!
//! The unfolded shape is an exponential tilt of the prior,
//! `p_j ~ prior_j * exp(w * (M' gamma)_j)`, driven by one dual variable
//! `gamma_i` per measured bin. For each weight `w` on the grid the dual
//! vector is found by Newton iteration on the stationarity condition
//!
//! ```text
//! Z(gamma) = norm * alpha - a + Cov_a * gamma = 0
//! ```
//!
//! with `alpha = M p` and the normalization profiled against the data.
//! The scan is sequential: each grid point warm-starts from the previous
//! converged `gamma` and falls back to a cold start once if that fails.

use nalgebra::{DMatrix, DVector};
use unsmear_core::{Error, Result, ScanPoint, ScanTable, SolverOutcome};

use crate::math;
use crate::prior::PriorDistribution;
use crate::scan::{self, PointSolution};
use crate::setup::{InitialWeight, UnfoldingProblem};

/// Convergence threshold on the squared Newton step.
const EPS_G: f64 = 1e-12;

/// Iteration budget per Newton attempt.
const MAX_GAUSS_NEWTON: usize = 1000;

/// One Newton evaluation at fixed `gamma`.
struct CoreState {
    p: DVector<f64>,
    alpha: DVector<f64>,
    norm: f64,
    h_inv: DMatrix<f64>,
    dgamma: DVector<f64>,
    dga2: f64,
}

/// Maximum-entropy unfolding over the strength grid.
pub struct SchmellingUnfolder<'a> {
    problem: &'a UnfoldingProblem,
    prior: &'a PriorDistribution,
    reference: Option<Vec<f64>>,
    initial_weight: InitialWeight,
}

impl<'a> SchmellingUnfolder<'a> {
    /// New solver; the prior is the zero-information shape.
    pub fn new(problem: &'a UnfoldingProblem, prior: &'a PriorDistribution) -> Self {
        Self { problem, prior, reference: None, initial_weight: InitialWeight::default() }
    }

    /// Track the squared distance to a known spectrum at every grid point.
    pub fn with_reference(mut self, reference: &[f64]) -> Self {
        self.reference = Some(reference.to_vec());
        self
    }

    /// Choose how the scan origin `w0` is derived.
    pub fn with_initial_weight(mut self, mode: InitialWeight) -> Self {
        self.initial_weight = mode;
        self
    }

    /// Scan the weight grid, select the working point and assemble the
    /// unfolded spectrum there.
    pub fn run(&self) -> Result<SolverOutcome> {
        let nb = self.problem.nb();
        let na = self.problem.na();
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

        let w0 = self.problem.initial_weight(self.initial_weight);
        let grid = scan::strength_grid(w0);

        let mut gamma = DVector::zeros(na);
        let mut warm = false;
        let mut solutions: Vec<Option<PointSolution>> = Vec::with_capacity(grid.len());

        for &w in &grid {
            match self.converge(w, &gamma, warm) {
                Some(g) => {
                    gamma = g;
                    warm = true;
                    solutions.push(self.full_solution(w, &gamma));
                }
                None => {
                    log::debug!("weight {w:.3e}: dual iteration did not converge");
                    warm = false;
                    solutions.push(None);
                }
            }
        }

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
            "max-entropy scan: selected ix {best} (w = {:.3e}, chi2 = {:.4}, rank = {:.2})",
            grid[best],
            solution.chi_square,
            solution.effective_rank
        );

        let ndf = solution.effective_rank;
        let spectrum = solution.into_spectrum(best, grid[best], ndf);
        Ok(SolverOutcome { spectrum, scan: ScanTable { points, selected: best, reference_trace } })
    }

    /// Converge `gamma` at weight `w`: warm attempt from `start` when
    /// allowed, then a single cold retry from zero.
    fn converge(&self, w: f64, start: &DVector<f64>, warm: bool) -> Option<DVector<f64>> {
        if warm {
            if let Some(g) = self.gauss_newton(w, start.clone()) {
                return Some(g);
            }
        }
        self.gauss_newton(w, DVector::zeros(start.len()))
    }

    /// Newton iteration until the squared step drops below [`EPS_G`].
    ///
    /// `None` when the budget runs out, the step size stalls, or the dual
    /// Hessian turns singular.
    fn gauss_newton(&self, w: f64, mut gamma: DVector<f64>) -> Option<DVector<f64>> {
        let mut dga2 = f64::MAX;
        for _ in 0..MAX_GAUSS_NEWTON {
            let dga2_old = dga2;

            let step = self.core(w, &gamma)?;
            gamma += &step.dgamma;
            dga2 = step.dga2;

            if dga2 < EPS_G {
                return Some(gamma);
            }
            if (dga2 - dga2_old).abs() < EPS_G / 100.0 {
                return None;
            }
        }
        None
    }

    /// Tilted shape, profiled normalization, dual slope and Hessian at
    /// `gamma`. `None` when the Hessian is singular.
    fn core(&self, w: f64, gamma: &DVector<f64>) -> Option<CoreState> {
        let m = self.problem.response();
        let cov = self.problem.covariance();
        let cov_inv = self.problem.covariance_inv();
        let a = self.problem.measured();
        let nb = self.problem.nb();
        let prior = self.prior.values();

        // Exponential tilt of the prior, stabilized by the largest exponent.
        let d = m.transpose() * gamma;
        let dmax = d.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut p = DVector::zeros(nb);
        let mut psum = 0.0;
        for j in 0..nb {
            p[j] = prior[j] * (w * (d[j] - dmax)).exp();
            psum += p[j];
        }
        p /= psum;

        let alpha = m * &p;
        let v2 = cov_inv * &alpha;
        let norm = v2.dot(a) / v2.dot(&alpha);

        let zp = &alpha * norm - a + cov * gamma;

        // Q = M diag(p) M' - alpha alpha', the shape covariance under p.
        let mut m_scaled = m.clone();
        for k in 0..nb {
            let mut col = m_scaled.column_mut(k);
            col *= p[k];
        }
        let q = &m_scaled * m.transpose() - &alpha * alpha.transpose();

        let h = q * (w * norm) + cov;
        let h_inv = math::invert_general(&h)?;

        let dgamma = -(&h_inv * &zp);
        let dga2 = dgamma.norm_squared();

        Some(CoreState { p, alpha, norm, h_inv, dgamma, dga2 })
    }

    /// Everything the scan records about a converged grid point.
    fn full_solution(&self, w: f64, gamma: &DVector<f64>) -> Option<PointSolution> {
        let state = self.core(w, gamma)?;
        let CoreState { p, alpha, norm, h_inv, .. } = state;

        let m = self.problem.response();
        let cov = self.problem.covariance();
        let na = self.problem.na();
        let nb = self.problem.nb();

        // In the dual variables the residual is Cov_a * gamma, so the
        // chi-square reduces to gamma' Cov_a gamma.
        let cg = cov * gamma;
        let bin_chi_squares: Vec<f64> = (0..na).map(|i| gamma[i] * cg[i]).collect();
        let chi_square: f64 = bin_chi_squares.iter().sum();

        let smoothing = cov * &h_inv;
        let effective_rank = na as f64 - smoothing.trace();
        let resolution_asymmetry: f64 = smoothing.iter().map(|v| v * v).sum();

        let b = &p * norm;

        // Error propagation through the tilt: T = d b / d a up to norm.
        let mut shifted = m.clone();
        for i in 0..na {
            for j in 0..nb {
                shifted[(i, j)] -= alpha[i];
            }
        }
        let mut t = shifted.transpose() * &h_inv;
        for i in 0..nb {
            let mut row = t.row_mut(i);
            row *= w * p[i];
        }
        let covariance = (&t * cov * t.transpose()) * (norm * norm);

        let entropy: f64 = p.iter().filter(|&&v| v > 0.0).map(|&v| v * v.ln()).sum();

        let values: Vec<f64> = b.iter().copied().collect();
        Some(PointSolution {
            covariance_trace: covariance.trace(),
            covariance,
            bin_chi_squares,
            chi_square,
            effective_rank,
            second_derivative_penalty: math::second_derivative_penalty(&values),
            zero_derivative_penalty: math::zero_derivative_penalty(&values),
            entropy,
            resolution_asymmetry,
            values,
        })
    }
}
