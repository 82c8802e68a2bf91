//! Error types for the sba-linear library
//!
//! All errors use the `thiserror` crate for automatic trait implementations.
//! Dimension and key errors signal graph-construction bugs and should abort
//! the solve early; degenerate geometry is not an error at all (see
//! [`crate::factors::ProjectionOutcome`]).

use thiserror::Error;

use crate::values::Key;

/// Main result type used throughout the sba-linear library
pub type SbaResult<T> = Result<T, SbaError>;

/// Main error type for the sba-linear library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SbaError {
    /// Invalid input parameters (malformed blocks, bad offsets, empty factors)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation disallowed for the current noise-model configuration,
    /// e.g. information-matrix rank updates with a constrained model
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A block, vector, or model did not have the declared dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A factor referenced a variable unknown to the slot assignment,
    /// layout table, or value store
    #[error("Unknown variable key {0}")]
    UnknownKey(Key),

    /// Sparse conversion or other linear algebra failure
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),
}
