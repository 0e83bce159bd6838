//! # Errors
//!
//! Structured failure values returned by the pipeline. Numerical and model failures never
//! reach this level: they are absorbed by sanitization and the forecasting ladder.

use thiserror::Error;

use crate::portfolio::SolverError;

/// Error returned by [`crate::Pipeline::optimize`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
  /// Missing or unusable universe specification.
  #[error("invalid universe: {0}")]
  InvalidUniverse(String),

  /// Nothing usable came back from the market-data collaborator.
  #[error("no usable market data: {0}")]
  NoData(String),

  /// The constraint set cannot be satisfied (e.g. unreachable target return).
  #[error("infeasible optimization: {0}")]
  Infeasible(String),

  /// Any other solver failure.
  #[error("optimization failed: {0}")]
  Optimization(String),

  /// Durable store read/write failure.
  #[error("persistence error: {0}")]
  Persistence(String),

  /// Anything not covered above, caught at the orchestration boundary.
  #[error("unexpected error: {0}")]
  Unexpected(String),
}

impl PipelineError {
  /// Stable machine-readable tag for user-facing payloads.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::InvalidUniverse(_) => "invalid_universe",
      Self::NoData(_) => "no_data",
      Self::Infeasible(_) => "infeasible",
      Self::Optimization(_) => "optimization_failed",
      Self::Persistence(_) => "persistence",
      Self::Unexpected(_) => "unexpected",
    }
  }

  /// `true` for conditions the caller can fix by changing the request.
  pub fn is_user_facing(&self) -> bool {
    matches!(
      self,
      Self::InvalidUniverse(_) | Self::NoData(_) | Self::Infeasible(_)
    )
  }
}

impl From<SolverError> for PipelineError {
  fn from(err: SolverError) -> Self {
    match err {
      SolverError::Infeasible(msg) => Self::Infeasible(msg),
      SolverError::Numerical(msg) => Self::Optimization(msg),
    }
  }
}
