//! # unsmear-core
//!
//! Shared types for the unsmear workspace: the error taxonomy and the
//! serde-friendly artifacts every solver produces (scan tables, unfolded
//! spectra, smoothing reports, response-matrix exports).
//!
//! This crate is intentionally dependency-light; all numerics live in
//! `unsmear-engine`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types and Result alias.
pub mod error;
/// Output artifacts: scan tables, spectra, reports.
pub mod types;

pub use error::{Error, Result};
pub use types::{
    ResponseMatrixArtifact, ScanPoint, ScanTable, SmoothingReport, SolverOutcome, UnfoldedSpectrum,
};
