//! # unsmear-engine
//!
//! Spectral unfolding of detector-smeared distributions.
//!
//! This crate provides:
//! - Problem setup: validation, response normalization, covariance caching
//! - Response smoothing with a Gaussian column parametrization
//! - Three regularized solvers: shape-fit least squares, spectral
//!   filtering, maximum entropy
//! - A common strength scan with automatic working-point selection
//!
//! ## Architecture
//!
//! The solvers share the scan grid, the per-point diagnostics record and
//! the selection rule from `scan`; everything numeric flows through the
//! `nalgebra` dense types held by [`UnfoldingProblem`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Iterative (Landweber-type) unfolding via spectral filtering.
pub mod bertero;
/// Eigendecomposition of the response Gram matrix.
pub mod gram;
/// Small numerical helpers: inverses, penalties, tail probabilities.
pub mod math;
/// Bound-constrained L-BFGS minimization with extended (covariance) output.
pub mod optimize;
/// Prior shapes: uniform, from a spectrum, rebinned, power law.
pub mod prior;
/// Regularization-strength scan and working-point selection.
pub mod scan;
/// Maximum-entropy unfolding in the dual space of the measured bins.
pub mod schmelling;
/// Problem ingest: measured spectrum, covariance, response matrix.
pub mod setup;
/// Parametric smoothing of the response matrix.
pub mod smooth;
/// Second-derivative-regularized least squares on the spectrum shape.
pub mod tikhonov;

pub use bertero::BerteroUnfolder;
pub use gram::GramSpectrum;
pub use optimize::{BoundedMinimizer, MinimizationResult, MinimizerConfig, ObjectiveFunction};
pub use prior::PriorDistribution;
pub use scan::{select_best, strength_grid};
pub use schmelling::SchmellingUnfolder;
pub use setup::{InitialWeight, UnfoldingProblem};
pub use smooth::smooth_response;
pub use tikhonov::TikhonovUnfolder;
