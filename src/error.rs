// Error types for readings, estimators and the numerical stages

use thiserror::Error;

/// Result type for estimator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numerical failures raised by the linear solver or the nonlinear refiner.
///
/// These are recoverable: retrying with other initial values, more readings
/// or a different solver configuration may succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericalError {
    /// Too few readings for the number of unknowns
    #[error("need at least {need} readings, got {have}")]
    InsufficientReadings { need: usize, have: usize },

    /// Linear system is rank deficient (degenerate receiver geometry)
    #[error("linear system is rank deficient")]
    RankDeficient,

    /// Normal equations could not be factored even with maximal damping
    #[error("jacobian is singular")]
    SingularJacobian,

    /// Iteration budget exhausted before the cost settled
    #[error("did not converge after {iterations} iterations (cost={cost:.6e})")]
    DidNotConverge { iterations: usize, cost: f64 },

    /// Residuals or derivatives became NaN or infinite
    #[error("non-finite residuals or derivatives")]
    NonFinite,
}

/// Errors returned by estimators and reading constructors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// `estimate()` called without enough valid readings
    #[error("estimator is not ready: readings missing or too few")]
    NotReady,

    /// Mutator or `estimate()` called while an estimation is running
    #[error("estimator is locked while an estimation is in progress")]
    Locked,

    /// Malformed argument, rejected at the call site
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Linear or nonlinear stage failed
    #[error("estimation failed: {0}")]
    EstimationFailed(#[from] NumericalError),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
