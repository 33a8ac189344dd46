//! # Errors
//!
//! Typed failures surfaced by every stage of the optimization pipeline.
//! Each variant names the [`Component`] that raised it.

use thiserror::Error;

use crate::portfolio::solver::SolverError;
use crate::portfolio::types::Component;

/// Failure of a single `optimize` call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
  /// Malformed bounds, non-positive risk aversion, bad view, ...
  #[error("{component}: invalid configuration: {reason}")]
  InvalidConfig {
    component: Component,
    reason: String,
    /// Offending asset index, when the problem is tied to one asset.
    asset: Option<usize>,
  },

  /// Ragged, empty or non-finite input data, or a vector of the wrong length.
  #[error("{component}: invalid input: {reason}")]
  InvalidInput { component: Component, reason: String },

  /// Fewer observations than the estimator needs.
  #[error("{component}: insufficient data: {observations} observations, at least {required} required")]
  InsufficientData {
    component: Component,
    observations: usize,
    required: usize,
  },

  /// A covariance or correlation matrix could not be inverted or clustered.
  #[error("{component}: singular covariance: {reason}")]
  SingularCovariance {
    component: Component,
    reason: String,
    asset: Option<usize>,
  },

  /// The solver did not reach its tolerance, or the constraint set is empty.
  #[error("{component}: optimization diverged: {reason}")]
  OptimizationDiverged { component: Component, reason: String },

  /// Unrecognised strategy tag or covariance method.
  #[error("{component}: unknown strategy or method `{tag}`")]
  UnknownStrategy { component: Component, tag: String },
}

impl OptimizationError {
  pub(crate) fn invalid_config(component: Component, reason: impl Into<String>) -> Self {
    Self::InvalidConfig {
      component,
      reason: reason.into(),
      asset: None,
    }
  }

  pub(crate) fn invalid_asset(component: Component, asset: usize, reason: impl Into<String>) -> Self {
    Self::InvalidConfig {
      component,
      reason: reason.into(),
      asset: Some(asset),
    }
  }

  pub(crate) fn invalid_input(component: Component, reason: impl Into<String>) -> Self {
    Self::InvalidInput {
      component,
      reason: reason.into(),
    }
  }

  pub(crate) fn singular(component: Component, reason: impl Into<String>) -> Self {
    Self::SingularCovariance {
      component,
      reason: reason.into(),
      asset: None,
    }
  }

  pub(crate) fn diverged(component: Component, reason: impl Into<String>) -> Self {
    Self::OptimizationDiverged {
      component,
      reason: reason.into(),
    }
  }

  /// Tag a backend failure with the allocator that drove the solver.
  pub(crate) fn from_solver(component: Component, err: SolverError) -> Self {
    match err {
      SolverError::Singular(reason) => Self::singular(component, reason),
      SolverError::Malformed(reason) => Self::invalid_input(component, reason),
      other => Self::diverged(component, other.to_string()),
    }
  }

  /// Component that raised the error.
  pub fn component(&self) -> Component {
    match self {
      Self::InvalidConfig { component, .. }
      | Self::InvalidInput { component, .. }
      | Self::InsufficientData { component, .. }
      | Self::SingularCovariance { component, .. }
      | Self::OptimizationDiverged { component, .. }
      | Self::UnknownStrategy { component, .. } => *component,
    }
  }

  /// Offending asset index, if the failure is tied to one.
  pub fn asset(&self) -> Option<usize> {
    match self {
      Self::InvalidConfig { asset, .. } | Self::SingularCovariance { asset, .. } => *asset,
      _ => None,
    }
  }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, OptimizationError>;
