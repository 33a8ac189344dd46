//! # Mean-Variance
//!
//! $$
//! \min_{\mathbf{w}}\ \mathbf{w}^\top\Sigma\mathbf{w}-\tfrac{1}{\lambda}\mathbf{w}^\top\mu
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w=1,\ w_{\min}\le w_i\le w_{\max},\
//! \|\mathbf w-\mathbf w_0\|_1\le\tau
//! $$
//!
//! Markowitz allocation as a dense convex QP. The L1 turnover limit is
//! linearized with one auxiliary variable per asset, `t_i >= |w_i - w0_i|`.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::budget_presolve;
use super::check_length;
use super::finalize_weights;
use crate::error::OptimizationError;
use crate::error::Result;
use crate::portfolio::config::OptimizationConfig;
use crate::portfolio::covariance::CovarianceMatrix;
use crate::portfolio::solver::QuadraticProgram;
use crate::portfolio::solver::Solver;
use crate::portfolio::solver::SolverError;
use crate::portfolio::types::Component;

/// Risk aversion that switches the return term off.
pub const MIN_VARIANCE_RISK_AVERSION: f64 = 1e6;

/// Risk aversion used by `MAX_SHARPE`.
///
/// This reproduces the historical behaviour: a mean-variance solve at unit
/// risk aversion, not a tangency-portfolio solve.
pub const MAX_SHARPE_RISK_AVERSION: f64 = 1.0;

/// L1 limit around a reference allocation.
#[derive(Clone, Copy, Debug)]
pub struct TurnoverLimit<'a> {
  pub current_weights: &'a DVector<f64>,
  pub max_turnover: f64,
}

/// Parameters of one mean-variance solve.
#[derive(Clone, Copy, Debug)]
pub struct MeanVarianceParams<'a> {
  pub risk_aversion: f64,
  pub min_weight: f64,
  pub max_weight: f64,
  /// Require `μᵀw >= target_return`.
  pub target_return: Option<f64>,
  pub turnover: Option<TurnoverLimit<'a>>,
}

impl<'a> MeanVarianceParams<'a> {
  /// Bounds and target from `config`, with an explicit risk aversion.
  ///
  /// The turnover limit is only active when both `max_turnover` and
  /// `current_weights` are present.
  pub fn from_config(
    config: &OptimizationConfig,
    risk_aversion: f64,
    current_weights: Option<&'a DVector<f64>>,
  ) -> Self {
    let turnover = match (config.max_turnover, current_weights) {
      (Some(max_turnover), Some(current_weights)) => Some(TurnoverLimit {
        current_weights,
        max_turnover,
      }),
      _ => None,
    };

    Self {
      risk_aversion,
      min_weight: config.min_weight,
      max_weight: config.max_weight,
      target_return: config.target_return,
      turnover,
    }
  }
}

/// Solve the mean-variance QP for expected returns `mu` and covariance `cov`.
pub fn mean_variance<S: Solver>(
  solver: &S,
  mu: &DVector<f64>,
  cov: &CovarianceMatrix,
  params: &MeanVarianceParams<'_>,
) -> Result<DVector<f64>> {
  let component = Component::QuadraticAllocator;
  let n = cov.dim();
  check_length("expected returns", mu.len(), n, component)?;
  if !(params.risk_aversion.is_finite() && params.risk_aversion > 0.0) {
    return Err(OptimizationError::invalid_config(
      component,
      format!("risk_aversion must be positive, got {}", params.risk_aversion),
    ));
  }
  if let Some(limit) = &params.turnover {
    check_length("current weights", limit.current_weights.len(), n, component)?;
  }

  if let Some(pinned) = budget_presolve(n, params.min_weight, params.max_weight, component)? {
    return check_pinned(pinned, mu, params);
  }

  presolve_limits(mu, params)?;

  let qp = build_program(mu, cov, params);
  let x = solver.solve_qp(&qp).map_err(|e| match e {
    SolverError::Singular(_) | SolverError::Malformed(_) => {
      OptimizationError::from_solver(component, e)
    }
    other => OptimizationError::diverged(
      component,
      format!("no weights satisfy {}: {other}", active_constraints(params)),
    ),
  })?;
  let w = finalize_weights(
    x.rows(0, n).into_owned(),
    params.min_weight,
    params.max_weight,
    component,
  )?;

  if let Some(limit) = &params.turnover {
    let turnover = (&w - limit.current_weights).abs().sum();
    if turnover > limit.max_turnover + 1e-6 {
      return Err(OptimizationError::diverged(
        component,
        format!(
          "turnover {turnover} exceeds max_turnover {}",
          limit.max_turnover
        ),
      ));
    }
  }

  debug!(
    risk_aversion = params.risk_aversion,
    expected_return = w.dot(mu),
    variance = cov.portfolio_variance(&w),
    "mean-variance solved"
  );

  Ok(w)
}

/// Reject a target return or turnover limit that no budget-feasible
/// allocation inside the box can meet.
fn presolve_limits(mu: &DVector<f64>, params: &MeanVarianceParams<'_>) -> Result<()> {
  let component = Component::QuadraticAllocator;

  if let Some(target) = params.target_return {
    let best = max_attainable_return(mu, params.min_weight, params.max_weight);
    if best < target - 1e-12 {
      return Err(OptimizationError::diverged(
        component,
        format!("target_return {target} exceeds the highest attainable return {best}"),
      ));
    }
  }

  if let Some(limit) = &params.turnover {
    let least = min_turnover(limit.current_weights, params.min_weight, params.max_weight);
    if least > limit.max_turnover + 1e-12 {
      return Err(OptimizationError::diverged(
        component,
        format!(
          "max_turnover {} is below {least}, the smallest turnover that meets the budget and box bounds",
          limit.max_turnover
        ),
      ));
    }
  }

  Ok(())
}

/// Highest `μᵀw` on the budget inside `[min_weight, max_weight]`: every asset
/// starts at the floor and the rest of the budget goes to the best returns.
fn max_attainable_return(mu: &DVector<f64>, min_weight: f64, max_weight: f64) -> f64 {
  let mut order: Vec<usize> = (0..mu.len()).collect();
  order.sort_by(|&a, &b| mu[b].total_cmp(&mu[a]));

  let mut remaining = 1.0 - mu.len() as f64 * min_weight;
  let mut best = min_weight * mu.sum();
  for i in order {
    if remaining <= 0.0 {
      break;
    }
    let add = remaining.min(max_weight - min_weight);
    best += add * mu[i];
    remaining -= add;
  }
  best
}

/// Smallest `‖w - w0‖₁` on the budget inside `[min_weight, max_weight]`.
///
/// Clipping `w0` into the box costs its clipped mass; the budget gap left
/// after clipping is closed one-for-one.
fn min_turnover(current: &DVector<f64>, min_weight: f64, max_weight: f64) -> f64 {
  let clipped = current.map(|c| c.clamp(min_weight, max_weight));
  (current - &clipped).abs().sum() + (1.0 - clipped.sum()).abs()
}

fn active_constraints(params: &MeanVarianceParams<'_>) -> String {
  let mut names = vec!["budget", "box bounds"];
  if params.target_return.is_some() {
    names.push("target_return");
  }
  if params.turnover.is_some() {
    names.push("max_turnover");
  }
  names.join(" + ")
}

fn build_program(
  mu: &DVector<f64>,
  cov: &CovarianceMatrix,
  params: &MeanVarianceParams<'_>,
) -> QuadraticProgram {
  let n = mu.len();
  let dim = if params.turnover.is_some() { 2 * n } else { n };

  let mut hessian = DMatrix::zeros(dim, dim);
  hessian
    .view_mut((0, 0), (n, n))
    .copy_from(&(cov.matrix() * 2.0));

  let mut linear = DVector::zeros(dim);
  linear
    .rows_mut(0, n)
    .copy_from(&(mu * (-1.0 / params.risk_aversion)));

  let mut eq_matrix = DMatrix::zeros(1, dim);
  eq_matrix.view_mut((0, 0), (1, n)).fill(1.0);
  let eq_rhs = DVector::from_element(1, 1.0);

  let mut rows: Vec<(DVector<f64>, f64)> = Vec::with_capacity(4 * n + 2);
  for i in 0..n {
    let mut upper = DVector::zeros(dim);
    upper[i] = 1.0;
    rows.push((upper, params.max_weight));

    let mut lower = DVector::zeros(dim);
    lower[i] = -1.0;
    rows.push((lower, -params.min_weight));
  }

  if let Some(target) = params.target_return {
    let mut row = DVector::zeros(dim);
    row.rows_mut(0, n).copy_from(&(-mu));
    rows.push((row, -target));
  }

  if let Some(limit) = &params.turnover {
    for i in 0..n {
      let w0 = limit.current_weights[i];

      let mut above = DVector::zeros(dim);
      above[i] = 1.0;
      above[n + i] = -1.0;
      rows.push((above, w0));

      let mut below = DVector::zeros(dim);
      below[i] = -1.0;
      below[n + i] = -1.0;
      rows.push((below, -w0));
    }

    let mut total = DVector::zeros(dim);
    total.rows_mut(n, n).fill(1.0);
    rows.push((total, limit.max_turnover));
  }

  let ineq_matrix = DMatrix::from_fn(rows.len(), dim, |r, c| rows[r].0[c]);
  let ineq_rhs = DVector::from_iterator(rows.len(), rows.iter().map(|(_, h)| *h));

  QuadraticProgram::new(hessian, linear, eq_matrix, eq_rhs, ineq_matrix, ineq_rhs)
}

fn check_pinned(
  pinned: DVector<f64>,
  mu: &DVector<f64>,
  params: &MeanVarianceParams<'_>,
) -> Result<DVector<f64>> {
  let component = Component::QuadraticAllocator;

  if let Some(target) = params.target_return {
    if pinned.dot(mu) < target - 1e-12 {
      return Err(OptimizationError::diverged(
        component,
        format!("target_return {target} is unreachable with pinned weights"),
      ));
    }
  }
  if let Some(limit) = &params.turnover {
    let turnover = (&pinned - limit.current_weights).abs().sum();
    if turnover > limit.max_turnover + 1e-6 {
      return Err(OptimizationError::diverged(
        component,
        format!(
          "turnover {turnover} of the pinned weights exceeds max_turnover {}",
          limit.max_turnover
        ),
      ));
    }
  }

  Ok(pinned)
}
