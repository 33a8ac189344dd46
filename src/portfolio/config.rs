//! # Optimization Config
//!
//! Immutable per-call configuration and the solver iteration ceiling.

use serde::Deserialize;
use serde::Serialize;

use super::types::Component;
use super::types::CovarianceMethod;
use crate::error::OptimizationError;
use crate::error::Result;

/// Per-call optimization configuration.
///
/// Field names are the flat key-value names used by serialized fixtures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
  /// Covariance estimator used for every strategy.
  pub covariance_method: CovarianceMethod,
  /// Risk-free rate used by the Sharpe ratio.
  pub risk_free_rate: f64,
  /// Proportional cost per unit of turnover.
  pub transaction_costs: f64,
  /// Lower bound of every weight.
  pub min_weight: f64,
  /// Upper bound of every weight.
  pub max_weight: f64,
  /// Risk aversion `λ` of the mean-variance objective.
  pub risk_aversion: f64,
  /// Minimum portfolio return required by the quadratic allocator.
  pub target_return: Option<f64>,
  /// Maximum L1 distance from the current weights.
  pub max_turnover: Option<f64>,
  /// Decay of the exponential covariance estimator.
  pub decay_factor: f64,
  /// Black-Litterman prior scaling.
  pub bl_tau: f64,
}

impl Default for OptimizationConfig {
  fn default() -> Self {
    Self {
      covariance_method: CovarianceMethod::Shrinkage,
      risk_free_rate: 0.0,
      transaction_costs: 0.001,
      min_weight: 0.0,
      max_weight: 1.0,
      risk_aversion: 1.0,
      target_return: None,
      max_turnover: None,
      decay_factor: 0.94,
      bl_tau: 0.05,
    }
  }
}

impl OptimizationConfig {
  /// Check bounds ordering and parameter ranges.
  pub fn validate(&self) -> Result<()> {
    let invalid = |reason: String| {
      Err(OptimizationError::invalid_config(
        Component::StrategyDispatcher,
        reason,
      ))
    };

    if !(self.min_weight.is_finite() && self.max_weight.is_finite()) {
      return invalid("weight bounds must be finite".to_string());
    }
    if self.min_weight < 0.0 || self.max_weight > 1.0 || self.min_weight > self.max_weight {
      return invalid(format!(
        "weight bounds must satisfy 0 <= min_weight <= max_weight <= 1, got min_weight={} max_weight={}",
        self.min_weight, self.max_weight
      ));
    }
    if !(self.risk_aversion.is_finite() && self.risk_aversion > 0.0) {
      return invalid(format!(
        "risk_aversion must be positive, got {}",
        self.risk_aversion
      ));
    }
    if let Some(turnover) = self.max_turnover {
      if !(turnover > 0.0 && turnover <= 2.0) {
        return invalid(format!("max_turnover must lie in (0, 2], got {turnover}"));
      }
    }
    if let Some(target) = self.target_return {
      if !target.is_finite() {
        return invalid(format!("target_return must be finite, got {target}"));
      }
    }
    if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
      return invalid(format!(
        "decay_factor must lie in (0, 1), got {}",
        self.decay_factor
      ));
    }
    if !(self.bl_tau.is_finite() && self.bl_tau > 0.0) {
      return invalid(format!("bl_tau must be positive, got {}", self.bl_tau));
    }
    if !self.risk_free_rate.is_finite() {
      return invalid(format!(
        "risk_free_rate must be finite, got {}",
        self.risk_free_rate
      ));
    }
    if !(self.transaction_costs.is_finite() && self.transaction_costs >= 0.0) {
      return invalid(format!(
        "transaction_costs must be non-negative, got {}",
        self.transaction_costs
      ));
    }

    Ok(())
  }

  /// Whether the box pins every weight to one value.
  pub(crate) fn pinned_weight(&self) -> Option<f64> {
    (self.max_weight - self.min_weight <= f64::EPSILON).then_some(self.min_weight)
  }
}

/// Iteration and tolerance ceilings of the numerical backends.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
  /// Interior-point iteration budget per quadratic program.
  pub max_iterations: usize,
  /// Residual and duality-gap tolerance of the quadratic solver.
  pub tolerance: f64,
  /// Outer iteration budget of the sequential quadratic programming driver.
  pub nlp_max_iterations: usize,
  /// Function-value change below which the nonlinear solve has converged.
  pub nlp_ftol: f64,
  /// Step length below which the nonlinear solve has converged.
  pub nlp_xtol: f64,
}

impl Default for SolverSettings {
  fn default() -> Self {
    Self {
      max_iterations: 100,
      tolerance: 1e-9,
      nlp_max_iterations: 200,
      nlp_ftol: 1e-12,
      nlp_xtol: 1e-10,
    }
  }
}
