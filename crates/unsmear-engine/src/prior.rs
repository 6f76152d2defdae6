//! Prior distributions over the true bins.
//!
//! The prior is the reference / starting point of the Tikhonov and
//! maximum-entropy solvers. It is always normalized to sum 1.

use nalgebra::DVector;
use unsmear_core::{Error, Result};

/// A normalized prior over the `Nb` true bins.
#[derive(Debug, Clone)]
pub struct PriorDistribution {
    values: DVector<f64>,
}

impl PriorDistribution {
    /// Uniform prior `1/Nb` per bin, the default.
    pub fn uniform(nb: usize) -> Result<Self> {
        if nb == 0 {
            return Err(Error::Validation("prior needs at least one bin".into()));
        }
        Ok(Self { values: DVector::from_element(nb, 1.0 / nb as f64) })
    }

    /// Prior from a caller-supplied spectrum, normalized to sum 1.
    pub fn from_spectrum(values: &[f64]) -> Result<Self> {
        let sum: f64 = values.iter().sum();
        if values.is_empty() || sum <= 0.0 {
            return Err(Error::Validation(format!(
                "invalid prior distribution: {} bins, sum {}",
                values.len(),
                sum
            )));
        }
        Ok(Self { values: DVector::from_iterator(values.len(), values.iter().map(|v| v / sum)) })
    }

    /// Prior from a spectrum on a different binning, redistributed onto the
    /// target binning by linear bin-edge overlap and normalized.
    ///
    /// `source_edges` has `source_values.len() + 1` entries; `target_edges`
    /// defines the output bins. The source range must overlap the target
    /// range.
    pub fn rebinned(
        source_edges: &[f64],
        source_values: &[f64],
        target_edges: &[f64],
    ) -> Result<Self> {
        if source_edges.len() != source_values.len() + 1 || source_values.is_empty() {
            return Err(Error::Validation(format!(
                "rebin source: {} edges for {} values",
                source_edges.len(),
                source_values.len()
            )));
        }
        if target_edges.len() < 2 {
            return Err(Error::Validation("rebin target needs at least one bin".into()));
        }
        for edges in [source_edges, target_edges] {
            if edges.windows(2).any(|w| w[1] <= w[0]) {
                return Err(Error::Validation("bin edges must be strictly increasing".into()));
            }
        }

        let source_lo = source_edges[0];
        let source_hi = *source_edges.last().unwrap_or(&source_lo);
        let target_lo = target_edges[0];
        let target_hi = *target_edges.last().unwrap_or(&target_lo);
        if source_lo > target_hi || source_hi < target_lo {
            return Err(Error::Validation(
                "rebin impossible: source and target ranges do not overlap".into(),
            ));
        }

        let nb = target_edges.len() - 1;
        let mut contents = vec![0.0_f64; nb];
        for (j, content) in contents.iter_mut().enumerate() {
            let (yl, yh) = (target_edges[j], target_edges[j + 1]);
            for (i, &value) in source_values.iter().enumerate() {
                let (xl, xh) = (source_edges[i], source_edges[i + 1]);
                let overlap = (xh.min(yh) - xl.max(yl)).max(0.0);
                *content += value * overlap / (xh - xl);
            }
        }

        Self::from_spectrum(&contents)
    }

    /// Power-law prior `dN/dE = E^-gamma` over `nb` equal bins in
    /// `y = log10(E)` spanning `y_range`; each bin carries the exact integral
    /// `int 10^(y*(1-gamma)) dy`, and the result is normalized.
    pub fn power_law(nb: usize, gamma: f64, y_range: (f64, f64)) -> Result<Self> {
        let (y_lo, y_hi) = y_range;
        if nb == 0 || y_hi <= y_lo {
            return Err(Error::Validation(format!(
                "invalid power-law prior: {} bins over [{}, {}]",
                nb, y_lo, y_hi
            )));
        }

        let width = (y_hi - y_lo) / nb as f64;
        let exponent = 1.0 - gamma;
        let ln10 = std::f64::consts::LN_10;
        let contents: Vec<f64> = (0..nb)
            .map(|j| {
                let a = y_lo + j as f64 * width;
                let b = a + width;
                if exponent.abs() < 1e-12 {
                    // gamma = 1: the integrand is flat in y.
                    b - a
                } else {
                    (10.0_f64.powf(b * exponent) - 10.0_f64.powf(a * exponent)) / (exponent * ln10)
                }
            })
            .collect();

        Self::from_spectrum(&contents)
    }

    /// Number of true bins.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the prior is empty (never true for a constructed prior).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The normalized values.
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// The normalized values as a slice.
    pub fn as_slice(&self) -> &[f64] {
        self.values.as_slice()
    }
}
