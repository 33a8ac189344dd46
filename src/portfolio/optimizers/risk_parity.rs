//! # Risk Parity
//!
//! $$
//! \min_{\mathbf w}\ \sum_i\sum_j (RC_i - RC_j)^2,\qquad
//! RC_i = \frac{w_i(\Sigma\mathbf w)_i}{\sqrt{\mathbf w^\top\Sigma\mathbf w}}
//! $$
//!
//! Equal risk contribution weights, solved by SQP with a Gauss-Newton
//! Hessian from equal weights `1/N`.

use argmin::core::CostFunction;
use argmin::core::Gradient;
use argmin::core::Hessian;
use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::budget_presolve;
use super::finalize_weights;
use crate::error::OptimizationError;
use crate::error::Result;
use crate::portfolio::covariance::CovarianceMatrix;
use crate::portfolio::solver::LinearConstraints;
use crate::portfolio::solver::Solver;
use crate::portfolio::types::Component;

const MIN_VARIANCE: f64 = 1e-30;

/// Risk contribution of every asset, `w_i (Σw)_i / σ_p`.
///
/// Contributions sum to the portfolio volatility. A zero-variance portfolio
/// has zero contributions.
pub fn risk_contributions(weights: &DVector<f64>, cov: &CovarianceMatrix) -> DVector<f64> {
  let sigma_w = cov.matrix() * weights;
  let variance = weights.dot(&sigma_w);
  if variance < MIN_VARIANCE {
    return DVector::zeros(weights.len());
  }
  weights.component_mul(&sigma_w) / variance.sqrt()
}

/// Sum of squared pairwise risk-contribution gaps, `2N ‖RC - mean(RC)‖²`.
pub struct RiskParityProblem<'a> {
  cov: &'a DMatrix<f64>,
}

impl<'a> RiskParityProblem<'a> {
  pub fn new(cov: &'a CovarianceMatrix) -> Self {
    Self { cov: cov.matrix() }
  }

  /// Centered contributions and the centered Jacobian `C ∂RC/∂w`.
  fn centered_jacobian(&self, w: &DVector<f64>) -> Option<(DVector<f64>, DMatrix<f64>)> {
    let n = w.len();
    let sigma_w = self.cov * w;
    let variance = w.dot(&sigma_w);
    if variance < MIN_VARIANCE {
      return None;
    }
    let vol = variance.sqrt();
    let rc = w.component_mul(&sigma_w) / vol;

    let mut jac = DMatrix::from_fn(n, n, |i, k| {
      let own = if i == k { sigma_w[i] } else { 0.0 };
      (own + w[i] * self.cov[(i, k)]) / vol - rc[i] * sigma_w[k] / variance
    });
    for mut col in jac.column_iter_mut() {
      let mean = col.mean();
      col.add_scalar_mut(-mean);
    }

    let mean = rc.mean();
    Some((rc.add_scalar(-mean), jac))
  }
}

impl CostFunction for RiskParityProblem<'_> {
  type Param = DVector<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let sigma_w = self.cov * w;
    let variance = w.dot(&sigma_w);
    if variance < MIN_VARIANCE {
      return Ok(1e10);
    }

    let rc = w.component_mul(&sigma_w) / variance.sqrt();
    let mean = rc.mean();
    Ok(2.0 * w.len() as f64 * rc.add_scalar(-mean).norm_squared())
  }
}

impl Gradient for RiskParityProblem<'_> {
  type Param = DVector<f64>;
  type Gradient = DVector<f64>;

  fn gradient(&self, w: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
    Ok(match self.centered_jacobian(w) {
      Some((dev, jac)) => jac.transpose() * dev * (4.0 * w.len() as f64),
      None => DVector::zeros(w.len()),
    })
  }
}

impl Hessian for RiskParityProblem<'_> {
  type Param = DVector<f64>;
  type Hessian = DMatrix<f64>;

  /// Gauss-Newton approximation `4N Jᵀ C J`.
  fn hessian(&self, w: &Self::Param) -> std::result::Result<Self::Hessian, argmin::core::Error> {
    let n = w.len();
    Ok(match self.centered_jacobian(w) {
      Some((_, jac)) => jac.transpose() * &jac * (4.0 * n as f64),
      None => DMatrix::identity(n, n),
    })
  }
}

/// Equal risk contribution weights within `[min_weight, max_weight]`.
pub fn risk_parity<S: Solver>(
  solver: &S,
  cov: &CovarianceMatrix,
  min_weight: f64,
  max_weight: f64,
) -> Result<DVector<f64>> {
  let component = Component::RiskParitySolver;
  let n = cov.dim();
  if let Some(pinned) = budget_presolve(n, min_weight, max_weight, component)? {
    return Ok(pinned);
  }

  let problem = RiskParityProblem::new(cov);
  let solution = solver
    .solve_nlp(
      &problem,
      DVector::from_element(n, 1.0 / n as f64),
      &LinearConstraints::budget(n, min_weight, max_weight),
    )
    .map_err(|e| OptimizationError::from_solver(component, e))?;

  debug!(
    iterations = solution.iterations,
    cost = solution.cost,
    "risk parity solved"
  );

  finalize_weights(solution.x, min_weight, max_weight, component)
}
