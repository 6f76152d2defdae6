//! Regularization-strength scan: the common grid, the per-point record
//! assembly and the selection of the working point.

use nalgebra::DMatrix;
use unsmear_core::{Error, Result, ScanPoint, UnfoldedSpectrum};

use crate::math;

/// Number of points on the logarithmic strength grid.
pub const GRID_POINTS: usize = 30;

const LOG10_MIN: f64 = -5.0;
const LOG10_MAX: f64 = 5.0;

/// The logarithmic strength grid `w0 * 10^(-5 + ix/3)` for `ix in 0..30`.
///
/// The upper decade is never reached; the last point sits at `w0 * 10^4.67`.
pub fn strength_grid(w0: f64) -> Vec<f64> {
    let dlogx = (LOG10_MAX - LOG10_MIN) / GRID_POINTS as f64;
    (0..GRID_POINTS).map(|ix| w0 * 10f64.powf(LOG10_MIN + ix as f64 * dlogx)).collect()
}

/// Pick the working point from a finished scan.
///
/// Only converged points participate. A chi-square window keeps points with
/// `chi2 < 2*chi0`, where `chi0` is the smallest chi-square on the scan or,
/// if that undershoots the number of statistically significant measured
/// bins, half that bin count. Inside the window the point whose unfolded
/// covariance trace is closest to `trace(Cov_a)` wins; ties go to the
/// smaller index.
pub fn select_best(
    points: &[ScanPoint],
    reference_trace: f64,
    significant_bins: usize,
) -> Result<usize> {
    let chisq_min = points
        .iter()
        .filter(|p| p.converged)
        .map(|p| p.chi_square)
        .fold(f64::INFINITY, f64::min);
    if !chisq_min.is_finite() {
        return Err(Error::Convergence("no scan point converged".into()));
    }

    let vapoints = significant_bins as f64;
    let chisq0 = if chisq_min > vapoints { chisq_min } else { vapoints / 2.0 };

    let mut best: Option<(usize, f64)> = None;
    for p in points.iter().filter(|p| p.converged && p.chi_square < 2.0 * chisq0) {
        let figure = (p.covariance_trace / reference_trace - 1.0).abs();
        if best.map_or(true, |(_, f)| figure < f) {
            best = Some((p.index, figure));
        }
    }

    best.map(|(ix, _)| ix).ok_or_else(|| {
        Error::Convergence("no scan point inside the chi-square acceptance window".into())
    })
}

/// Everything a solver knows about one converged grid point.
#[derive(Debug, Clone)]
pub(crate) struct PointSolution {
    pub values: Vec<f64>,
    pub covariance: DMatrix<f64>,
    pub bin_chi_squares: Vec<f64>,
    pub chi_square: f64,
    pub effective_rank: f64,
    pub covariance_trace: f64,
    pub second_derivative_penalty: f64,
    pub zero_derivative_penalty: f64,
    pub entropy: f64,
    pub resolution_asymmetry: f64,
}

impl PointSolution {
    pub fn scan_point(&self, index: usize, strength: f64, reference: Option<&[f64]>) -> ScanPoint {
        ScanPoint {
            index,
            strength,
            converged: true,
            chi_square: self.chi_square,
            effective_rank: self.effective_rank,
            covariance_trace: self.covariance_trace,
            second_derivative_penalty: self.second_derivative_penalty,
            zero_derivative_penalty: self.zero_derivative_penalty,
            entropy: self.entropy,
            resolution_asymmetry: self.resolution_asymmetry,
            distance_to_reference: reference
                .map(|r| self.values.iter().zip(r).map(|(b, t)| (b - t) * (b - t)).sum()),
        }
    }

    pub fn into_spectrum(self, index: usize, strength: f64, ndf: f64) -> UnfoldedSpectrum {
        let errors = (0..self.values.len())
            .map(|i| self.covariance[(i, i)].max(0.0).sqrt())
            .collect();
        UnfoldedSpectrum {
            values: self.values,
            errors,
            covariance: Some(math::to_row_major(&self.covariance)),
            bin_chi_squares: self.bin_chi_squares,
            chi_square: self.chi_square,
            ndf,
            probability: math::chi2_probability(self.chi_square, ndf),
            strength,
            strength_index: index,
        }
    }
}
