//! # Black-Litterman
//!
//! $$
//! \Sigma_{post} = \left[(\tau\Sigma)^{-1} + P^\top\Omega^{-1}P\right]^{-1},\qquad
//! \mu_{post} = \Sigma_{post}\left[(\tau\Sigma)^{-1}\pi + P^\top\Omega^{-1}Q\right]
//! $$
//!
//! Market-equilibrium prior `π = λ Σ w_mkt` blended with relative views, then
//! allocated by the mean-variance QP around the market portfolio.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::check_length;
use super::mean_variance::mean_variance;
use super::mean_variance::MeanVarianceParams;
use crate::error::OptimizationError;
use crate::error::Result;
use crate::portfolio::config::OptimizationConfig;
use crate::portfolio::covariance::CovarianceMatrix;
use crate::portfolio::solver::Solver;
use crate::portfolio::types::Component;
use crate::portfolio::types::View;

/// Prior and posterior return estimates.
#[derive(Clone, Debug, PartialEq)]
pub struct BlackLittermanPosterior {
  /// Implied equilibrium returns `π`.
  pub prior: DVector<f64>,
  /// Posterior mean `μ_post`.
  pub mean: DVector<f64>,
  /// Posterior covariance `Σ_post`.
  pub covariance: CovarianceMatrix,
  /// Market-capitalization weights `w_mkt`.
  pub market_weights: DVector<f64>,
}

/// Blend the equilibrium prior with `views`.
pub fn black_litterman_posterior(
  cov: &CovarianceMatrix,
  market_caps: &[f64],
  views: &[View],
  risk_aversion: f64,
  tau: f64,
) -> Result<BlackLittermanPosterior> {
  let component = Component::BlackLittermanBlender;
  let n = cov.dim();

  validate_inputs(n, market_caps, views)?;
  if !(tau.is_finite() && tau > 0.0) {
    return Err(OptimizationError::invalid_config(
      component,
      format!("bl_tau must be positive, got {tau}"),
    ));
  }
  if !(risk_aversion.is_finite() && risk_aversion > 0.0) {
    return Err(OptimizationError::invalid_config(
      component,
      format!("risk_aversion must be positive, got {risk_aversion}"),
    ));
  }

  let caps = DVector::from_column_slice(market_caps);
  let market_weights = &caps / caps.sum();
  let prior = cov.matrix() * &market_weights * risk_aversion;

  let tau_cov = cov.matrix() * tau;
  let tau_chol = tau_cov.cholesky().ok_or_else(|| {
    OptimizationError::singular(component, "scaled prior covariance τΣ is not positive definite")
  })?;

  let k = views.len();
  let mut p = DMatrix::zeros(k, n);
  let mut q = DVector::zeros(k);
  let mut omega_inv = DVector::zeros(k);
  for (row, view) in views.iter().enumerate() {
    p[(row, view.asset_i)] = 1.0;
    p[(row, view.asset_j)] = -1.0;
    q[row] = view.relative_return;
    omega_inv[row] = view.confidence;
  }

  let p_omega = p.transpose() * DMatrix::from_diagonal(&omega_inv);
  let precision = tau_chol.inverse() + &p_omega * &p;
  let rhs = tau_chol.solve(&prior) + &p_omega * &q;

  let precision_chol = precision.cholesky().ok_or_else(|| {
    OptimizationError::singular(component, "posterior precision is not positive definite")
  })?;
  let mean = precision_chol.solve(&rhs);
  let post = precision_chol.inverse();
  let covariance = CovarianceMatrix::new((&post + post.transpose()) * 0.5).map_err(|e| {
    OptimizationError::singular(component, format!("posterior covariance: {e}"))
  })?;

  debug!(views = k, tau, "black-litterman posterior");

  Ok(BlackLittermanPosterior {
    prior,
    mean,
    covariance,
    market_weights,
  })
}

/// Mean-variance weights on the Black-Litterman posterior.
///
/// The market portfolio is the reference for the turnover limit.
pub fn black_litterman<S: Solver>(
  solver: &S,
  cov: &CovarianceMatrix,
  market_caps: &[f64],
  views: &[View],
  config: &OptimizationConfig,
) -> Result<DVector<f64>> {
  let posterior =
    black_litterman_posterior(cov, market_caps, views, config.risk_aversion, config.bl_tau)?;
  let params = MeanVarianceParams::from_config(
    config,
    config.risk_aversion,
    Some(&posterior.market_weights),
  );

  mean_variance(solver, &posterior.mean, &posterior.covariance, &params)
}

/// Unwrap the optional market caps and views of a request and check them
/// against an `n`-asset universe.
pub(crate) fn require_inputs<'a>(
  n: usize,
  market_caps: Option<&'a [f64]>,
  views: Option<&'a [View]>,
) -> Result<(&'a [f64], &'a [View])> {
  let component = Component::BlackLittermanBlender;
  let market_caps = market_caps
    .ok_or_else(|| OptimizationError::invalid_config(component, "market_caps are required"))?;
  let views =
    views.ok_or_else(|| OptimizationError::invalid_config(component, "views are required"))?;

  validate_inputs(n, market_caps, views)?;
  Ok((market_caps, views))
}

/// Check market caps and views against an `n`-asset universe.
pub fn validate_inputs(n: usize, market_caps: &[f64], views: &[View]) -> Result<()> {
  let component = Component::BlackLittermanBlender;

  check_length("market_caps", market_caps.len(), n, component)?;
  if let Some(i) = market_caps.iter().position(|c| !(c.is_finite() && *c > 0.0)) {
    return Err(OptimizationError::invalid_asset(
      component,
      i,
      format!("market cap {} must be positive", market_caps[i]),
    ));
  }
  for view in views {
    validate_view(view, n)?;
  }
  Ok(())
}

fn validate_view(view: &View, n: usize) -> Result<()> {
  let component = Component::BlackLittermanBlender;

  for asset in [view.asset_i, view.asset_j] {
    if asset >= n {
      return Err(OptimizationError::invalid_asset(
        component,
        asset,
        format!("view references asset {asset} but only {n} assets exist"),
      ));
    }
  }
  if view.asset_i == view.asset_j {
    return Err(OptimizationError::invalid_asset(
      component,
      view.asset_i,
      "view compares an asset with itself",
    ));
  }
  if !(view.confidence.is_finite() && view.confidence > 0.0) {
    return Err(OptimizationError::invalid_asset(
      component,
      view.asset_i,
      format!("view confidence must be positive, got {}", view.confidence),
    ));
  }
  if !view.relative_return.is_finite() {
    return Err(OptimizationError::invalid_asset(
      component,
      view.asset_i,
      "view relative return is not finite",
    ));
  }
  Ok(())
}
