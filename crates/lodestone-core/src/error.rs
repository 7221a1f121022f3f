//! Reconstruction error taxonomy.

use thiserror::Error;

use crate::solver::SolverError;
use crate::source::SourceError;
use crate::store::StoreError;

/// Errors that abort a reconstruction.
///
/// Every variant is terminal: no partial image is returned and nothing is
/// retried.
#[derive(Debug, Error)]
pub enum RecoError {
    /// Missing inputs or inconsistent grid, patch or mapping settings.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The frequency filters left no usable channel.
    #[error("Frequency selection is empty after filtering ({0})")]
    EmptySelection(String),

    /// Matrix, measurement or patch dimensions disagree.
    #[error("Shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Solver failed: {0}")]
    Solver(#[from] SolverError),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Dataset store error: {0}")]
    Store(#[from] StoreError),
}
