//! # Portfolio Optimizers
//!
//! $$
//! \sum_i w_i = 1,\qquad w_{\min} \le w_i \le w_{\max}
//! $$
//!
//! Allocators behind the strategy dispatcher and the budget/box handling they
//! share.

pub mod black_litterman;
pub mod hrp;
pub mod mean_variance;
pub mod risk_parity;

use nalgebra::DVector;

use super::types::Component;
use crate::error::OptimizationError;
use crate::error::Result;

/// Tolerance on `|Σ w - 1|` accepted from a solver.
pub const BUDGET_TOLERANCE: f64 = 1e-6;

/// Check that `Σ w = 1` is reachable inside the box.
///
/// Returns the only feasible point when the box pins every weight.
pub(crate) fn budget_presolve(
  n: usize,
  min_weight: f64,
  max_weight: f64,
  component: Component,
) -> Result<Option<DVector<f64>>> {
  if n == 0 {
    return Err(OptimizationError::invalid_input(component, "empty asset universe"));
  }

  let nf = n as f64;
  if nf * min_weight > 1.0 + 1e-12 || nf * max_weight < 1.0 - 1e-12 {
    return Err(OptimizationError::diverged(
      component,
      format!(
        "budget constraint sum(w) = 1 is infeasible for {n} assets with bounds [{min_weight}, {max_weight}]"
      ),
    ));
  }

  if max_weight - min_weight <= f64::EPSILON {
    return Ok(Some(DVector::from_element(n, 1.0 / nf)));
  }

  Ok(None)
}

/// Clip solver round-off back into the box and verify the budget.
pub(crate) fn finalize_weights(
  x: DVector<f64>,
  min_weight: f64,
  max_weight: f64,
  component: Component,
) -> Result<DVector<f64>> {
  if let Some(i) = x.iter().position(|v| !v.is_finite()) {
    return Err(OptimizationError::diverged(
      component,
      format!("solver returned a non-finite weight for asset {i}"),
    ));
  }

  let w = x.map(|v| v.clamp(min_weight, max_weight));
  let total = w.sum();
  if (total - 1.0).abs() > BUDGET_TOLERANCE {
    return Err(OptimizationError::diverged(
      component,
      format!("weights sum to {total}, outside the budget tolerance"),
    ));
  }

  Ok(w)
}

pub(crate) fn check_length(
  what: &str,
  len: usize,
  n: usize,
  component: Component,
) -> Result<()> {
  if len != n {
    return Err(OptimizationError::invalid_input(
      component,
      format!("{what} has {len} entries, expected {n}"),
    ));
  }
  Ok(())
}
