//! # Portfolio Metrics
//!
//! $$
//! \mathrm{VaR}_{95} = -Q_{0.05}(r_p),\qquad
//! \mathrm{ES}_{95} = -\mathbb E\left[r_p \mid r_p \le -\mathrm{VaR}_{95}\right]
//! $$
//!
//! Risk and performance summary of a weight vector.

use nalgebra::DVector;

use super::covariance::CovarianceMatrix;
use super::data::ReturnPanel;
use super::types::Component;
use super::types::PortfolioMetrics;
use crate::error::OptimizationError;
use crate::error::Result;

/// Compute the metrics bundle for `weights`.
///
/// `cov` should be the covariance the weights were estimated against;
/// `turnover` is zero when `current_weights` is absent.
pub fn portfolio_metrics(
  weights: &DVector<f64>,
  panel: &ReturnPanel,
  cov: &CovarianceMatrix,
  risk_free_rate: f64,
  current_weights: Option<&DVector<f64>>,
) -> Result<PortfolioMetrics> {
  let component = Component::MetricsCalculator;
  let n = panel.n_assets();
  for (what, len) in [("weights", weights.len()), ("covariance", cov.dim())]
    .into_iter()
    .chain(current_weights.map(|c| ("current weights", c.len())))
  {
    if len != n {
      return Err(OptimizationError::invalid_input(
        component,
        format!("{what} has dimension {len}, panel has {n} assets"),
      ));
    }
  }

  let expected_return = weights.dot(&panel.mean_returns());
  let volatility = cov.portfolio_variance(weights).max(0.0).sqrt();
  let sharpe_ratio = if volatility > 1e-15 {
    (expected_return - risk_free_rate) / volatility
  } else {
    0.0
  };

  let port_returns = panel.portfolio_returns(weights.as_slice());
  let var_95 = -percentile(&port_returns, 5.0);
  let tail: Vec<f64> = port_returns
    .iter()
    .copied()
    .filter(|&r| r <= -var_95)
    .collect();
  let expected_shortfall_95 = if tail.is_empty() {
    var_95
  } else {
    -tail.iter().sum::<f64>() / tail.len() as f64
  };

  let weighted_vol = weights.dot(&cov.volatilities());
  let diversification_ratio = if weighted_vol.abs() > 1e-15 {
    volatility / weighted_vol
  } else {
    0.0
  };

  Ok(PortfolioMetrics {
    weights: weights.iter().copied().collect(),
    expected_return,
    volatility,
    sharpe_ratio,
    var_95,
    expected_shortfall_95,
    diversification_ratio,
    concentration: weights.norm_squared(),
    turnover: current_weights.map_or(0.0, |c| (weights - c).abs().sum()),
  })
}

/// Percentile `q ∈ [0, 100]` with linear interpolation between order
/// statistics. Empty input yields `0`.
pub fn percentile(values: &[f64], q: f64) -> f64 {
  if values.is_empty() {
    return 0.0;
  }

  let mut sorted = values.to_vec();
  sorted.sort_by(|a, b| a.total_cmp(b));

  let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
  let lo = pos.floor() as usize;
  let hi = pos.ceil() as usize;
  sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
