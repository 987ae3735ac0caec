//! error.rs — pipeline error taxonomy
//!
//! Component-local failures are reported through `Result` and status; only
//! contract violations (null input where non-null is required) are distinguished
//! from data-dependent failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad configuration value or unknown component/solver kind
    #[error("configuration: {0}")]
    Configuration(String),

    /// Input violated a precondition (empty signal, out-of-range slice, ...)
    #[error("precondition: {0}")]
    Precondition(String),

    /// Queue or pool full under a non-blocking backpressure policy
    #[error("capacity: {0}")]
    Capacity(String),

    /// Receiver geometry too degenerate even for the SVD fallback
    #[error("geometry: {0}")]
    Geometry(String),

    /// Iterative solver hit its iteration cap
    #[error("convergence: {0}")]
    Convergence(String),

    /// Time base lost its reference or drifted over threshold
    #[error("synchronization: {0}")]
    Synchronization(String),

    /// Measurement rejected by statistical validation
    #[error("validation: {0}")]
    Validation(String),

    /// Transport send/receive failure
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
