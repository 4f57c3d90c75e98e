//! Error types for chain-training computations.

use thiserror::Error;

/// Errors raised at the configuration and construction boundaries.
///
/// The hot path (forward/backward recursions) never returns these:
/// numerical trouble there is reported through `ok` flags and handled by
/// the driver's failure substitution instead.
#[derive(Debug, Error)]
pub enum CadenaError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid denominator graph: {0}")]
    Graph(String),

    #[error("invalid supervision: {0}")]
    Supervision(String),
}

/// Result type for chain-training operations
pub type Result<T> = std::result::Result<T, CadenaError>;
