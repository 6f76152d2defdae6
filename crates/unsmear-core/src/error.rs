//! Error types for the unsmear workspace

use thiserror::Error;

/// Unfolding error type
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input: dimension mismatch, non-positive-definite covariance,
    /// degenerate prior. Fatal for the whole run.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure that invalidates the run (a Gram matrix with no
    /// usable eigenvalue, a minimizer executor fault).
    #[error("Computation error: {0}")]
    Computation(String),

    /// No regularization strength produced a usable solution.
    #[error("Convergence error: {0}")]
    Convergence(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
