//! # Portfolio Engine
//!
//! $$
//! \mathbf{w}^\* = \operatorname{Optimize}(R, \text{strategy}, \theta)
//! $$
//!
//! Strategy dispatcher: validates the configuration, estimates the
//! covariance once, routes to the selected allocator and always summarizes
//! the result with [`portfolio_metrics`].

use impl_new_derive::ImplNew;
use nalgebra::DVector;
use rayon::prelude::*;
use tracing::debug;
use tracing::instrument;

use super::config::OptimizationConfig;
use super::config::SolverSettings;
use super::covariance::estimate_covariance;
use super::covariance::CovarianceMatrix;
use super::data::ReturnPanel;
use super::metrics::portfolio_metrics;
use super::optimizers::black_litterman::black_litterman;
use super::optimizers::black_litterman::require_inputs;
use super::optimizers::hrp::hrp_from_panel;
use super::optimizers::mean_variance::mean_variance;
use super::optimizers::mean_variance::MeanVarianceParams;
use super::optimizers::mean_variance::MAX_SHARPE_RISK_AVERSION;
use super::optimizers::mean_variance::MIN_VARIANCE_RISK_AVERSION;
use super::optimizers::risk_parity::risk_parity;
use super::solver::InteriorPointSolver;
use super::solver::Solver;
use super::types::Component;
use super::types::PortfolioMetrics;
use super::types::StrategyTag;
use super::types::View;
use crate::error::OptimizationError;
use crate::error::Result;

/// Owned inputs of one `optimize` call, for batch execution.
#[derive(ImplNew, Clone, Debug)]
pub struct OptimizationRequest {
  pub returns: ReturnPanel,
  pub strategy: StrategyTag,
  pub config: OptimizationConfig,
  pub current_weights: Option<Vec<f64>>,
  pub market_caps: Option<Vec<f64>>,
  pub views: Option<Vec<View>>,
}

/// Stateless optimization engine. It only holds its numerical backend, so one
/// instance can be shared across threads.
#[derive(Clone, Debug)]
pub struct PortfolioEngine<S = InteriorPointSolver> {
  solver: S,
}

impl PortfolioEngine<InteriorPointSolver> {
  /// Engine on the default interior-point backend.
  pub fn new(settings: SolverSettings) -> Self {
    Self {
      solver: InteriorPointSolver::new(settings),
    }
  }
}

impl Default for PortfolioEngine<InteriorPointSolver> {
  fn default() -> Self {
    Self::new(SolverSettings::default())
  }
}

impl<S: Solver> PortfolioEngine<S> {
  /// Engine on a custom backend.
  pub fn with_solver(solver: S) -> Self {
    Self { solver }
  }

  /// Compute weights for `strategy` and their metrics.
  ///
  /// `market_caps` and `views` are required by
  /// [`StrategyTag::BlackLitterman`] and ignored otherwise.
  #[instrument(
    skip_all,
    fields(
      strategy = %strategy,
      assets = returns.n_assets(),
      observations = returns.n_observations()
    )
  )]
  pub fn optimize(
    &self,
    returns: &ReturnPanel,
    strategy: StrategyTag,
    config: &OptimizationConfig,
    current_weights: Option<&[f64]>,
    market_caps: Option<&[f64]>,
    views: Option<&[View]>,
  ) -> Result<PortfolioMetrics> {
    config.validate()?;

    let n = returns.n_assets();
    let current = current_weights
      .map(|w| {
        if w.len() != n {
          return Err(OptimizationError::invalid_input(
            Component::StrategyDispatcher,
            format!("current_weights has {} entries, expected {n}", w.len()),
          ));
        }
        Ok(DVector::from_column_slice(w))
      })
      .transpose()?;
    let black_litterman_inputs = match strategy {
      StrategyTag::BlackLitterman => Some(require_inputs(n, market_caps, views)?),
      _ => None,
    };

    let cov = estimate_covariance(returns, config.covariance_method, config.decay_factor)?;

    let weights = if n == 1 {
      DVector::from_element(1, 1.0)
    } else if let Some(equal) = pinned_equal_weights(config, n) {
      debug!("bounds pin every weight, returning equal weights");
      equal
    } else {
      debug!("routing to allocator");
      match strategy {
        StrategyTag::MeanVariance => {
          self.quadratic(returns, &cov, config, config.risk_aversion, current.as_ref())?
        }
        StrategyTag::MinVariance => {
          self.quadratic(returns, &cov, config, MIN_VARIANCE_RISK_AVERSION, current.as_ref())?
        }
        StrategyTag::MaxSharpe => {
          self.quadratic(returns, &cov, config, MAX_SHARPE_RISK_AVERSION, current.as_ref())?
        }
        StrategyTag::RiskParity => {
          risk_parity(&self.solver, &cov, config.min_weight, config.max_weight)?
        }
        StrategyTag::HierarchicalRiskParity => hrp_from_panel(returns, &cov)?.weights,
        StrategyTag::BlackLitterman => {
          let (market_caps, views) = black_litterman_inputs.ok_or_else(|| {
            OptimizationError::invalid_config(
              Component::BlackLittermanBlender,
              "market_caps and views are required",
            )
          })?;
          black_litterman(&self.solver, &cov, market_caps, views, config)?
        }
      }
    };

    let metrics = portfolio_metrics(
      &weights,
      returns,
      &cov,
      config.risk_free_rate,
      current.as_ref(),
    )?;

    debug!(
      expected_return = metrics.expected_return,
      volatility = metrics.volatility,
      sharpe_ratio = metrics.sharpe_ratio,
      "optimization finished"
    );

    Ok(metrics)
  }

  /// [`PortfolioEngine::optimize`] on an owned request.
  pub fn optimize_request(&self, request: &OptimizationRequest) -> Result<PortfolioMetrics> {
    self.optimize(
      &request.returns,
      request.strategy,
      &request.config,
      request.current_weights.as_deref(),
      request.market_caps.as_deref(),
      request.views.as_deref(),
    )
  }

  /// Run independent requests in parallel; results keep the input order.
  pub fn optimize_batch(&self, requests: &[OptimizationRequest]) -> Vec<Result<PortfolioMetrics>>
  where
    S: Sync,
  {
    requests
      .par_iter()
      .map(|request| self.optimize_request(request))
      .collect()
  }

  fn quadratic(
    &self,
    returns: &ReturnPanel,
    cov: &CovarianceMatrix,
    config: &OptimizationConfig,
    risk_aversion: f64,
    current: Option<&DVector<f64>>,
  ) -> Result<DVector<f64>> {
    let params = MeanVarianceParams::from_config(config, risk_aversion, current);
    mean_variance(&self.solver, &returns.mean_returns(), cov, &params)
  }
}

/// Equal weights when `min_weight == max_weight == 1/N`.
fn pinned_equal_weights(config: &OptimizationConfig, n: usize) -> Option<DVector<f64>> {
  config
    .pinned_weight()
    .filter(|w| (w * n as f64 - 1.0).abs() <= 1e-9)
    .map(|_| DVector::from_element(n, 1.0 / n as f64))
}

/// One-shot optimization on a default engine.
pub fn optimize(
  returns: &ReturnPanel,
  strategy: StrategyTag,
  config: &OptimizationConfig,
  current_weights: Option<&[f64]>,
  market_caps: Option<&[f64]>,
  views: Option<&[View]>,
) -> Result<PortfolioMetrics> {
  PortfolioEngine::new(SolverSettings::default()).optimize(
    returns,
    strategy,
    config,
    current_weights,
    market_caps,
    views,
  )
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::Array2;
  use ndarray_rand::RandomExt;
  use rand::rngs::StdRng;
  use rand::SeedableRng;
  use rand_distr::Normal;
  use tracing_test::traced_test;

  use super::*;
  use crate::portfolio::types::CovarianceMethod;

  fn random_panel(t: usize, n: usize, seed: u64) -> ReturnPanel {
    let mut rng = StdRng::seed_from_u64(seed);
    let returns = Array2::random_using((t, n), Normal::new(0.0005, 0.01).unwrap(), &mut rng);
    ReturnPanel::new(returns).unwrap()
  }

  #[test]
  #[traced_test]
  fn optimize_logs_routing_and_summary() {
    let engine: PortfolioEngine = PortfolioEngine::default();
    let panel = random_panel(120, 4, 7);

    engine
      .optimize(
        &panel,
        StrategyTag::MinVariance,
        &OptimizationConfig::default(),
        None,
        None,
        None,
      )
      .unwrap();

    assert!(logs_contain("routing to allocator"));
    assert!(logs_contain("optimization finished"));
  }

  #[test]
  fn invalid_bounds_fail_before_estimation() {
    // A single observation would otherwise be reported as insufficient data.
    let panel = ReturnPanel::from_rows(&[vec![0.01, 0.02]]).unwrap();
    let config = OptimizationConfig {
      min_weight: 0.6,
      max_weight: 0.4,
      ..Default::default()
    };

    let err = optimize(&panel, StrategyTag::MeanVariance, &config, None, None, None).unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidConfig { .. }));
    assert_eq!(err.component(), Component::StrategyDispatcher);
  }

  #[test]
  fn black_litterman_requires_market_caps() {
    let panel = random_panel(60, 3, 11);
    let err = optimize(
      &panel,
      StrategyTag::BlackLitterman,
      &OptimizationConfig::default(),
      None,
      None,
      Some(&[]),
    )
    .unwrap_err();

    assert!(matches!(err, OptimizationError::InvalidConfig { .. }));
    assert_eq!(err.component(), Component::BlackLittermanBlender);
  }

  #[test]
  fn black_litterman_inputs_are_checked_before_shortcuts() {
    let bad_view = [View::new(0, 7, 0.01, 1.0)];
    let pinned = OptimizationConfig {
      min_weight: 0.25,
      max_weight: 0.25,
      ..Default::default()
    };
    let panel = random_panel(60, 4, 19);
    let caps = [4.0, 3.0, 2.0, 1.0];

    for config in [OptimizationConfig::default(), pinned.clone()] {
      let err = optimize(
        &panel,
        StrategyTag::BlackLitterman,
        &config,
        None,
        Some(&caps),
        Some(&bad_view),
      )
      .unwrap_err();
      assert!(matches!(err, OptimizationError::InvalidConfig { .. }));
      assert_eq!(err.asset(), Some(7));
    }

    let err = optimize(&panel, StrategyTag::BlackLitterman, &pinned, None, None, None).unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidConfig { .. }));
    assert_eq!(err.component(), Component::BlackLittermanBlender);

    let single = random_panel(60, 1, 23);
    let err = optimize(
      &single,
      StrategyTag::BlackLitterman,
      &OptimizationConfig::default(),
      None,
      Some(&[1.0, 2.0, 3.0]),
      Some(&bad_view),
    )
    .unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidInput { .. }));

    let ok = optimize(
      &single,
      StrategyTag::BlackLitterman,
      &OptimizationConfig::default(),
      None,
      Some(&[1.0]),
      Some(&[]),
    )
    .unwrap();
    assert_eq!(ok.weights, vec![1.0]);
  }

  #[test]
  fn wrong_length_current_weights_are_rejected() {
    let panel = random_panel(60, 3, 13);
    let err = optimize(
      &panel,
      StrategyTag::MeanVariance,
      &OptimizationConfig::default(),
      Some(&[0.5, 0.5]),
      None,
      None,
    )
    .unwrap_err();

    assert!(matches!(err, OptimizationError::InvalidInput { .. }));
  }

  #[test]
  fn infeasible_budget_is_reported_by_bounded_allocators() {
    let panel = random_panel(60, 3, 17);
    let config = OptimizationConfig {
      max_weight: 0.2,
      ..Default::default()
    };

    let err = optimize(&panel, StrategyTag::RiskParity, &config, None, None, None).unwrap_err();
    assert!(matches!(err, OptimizationError::OptimizationDiverged { .. }));
    assert_eq!(err.component(), Component::RiskParitySolver);

    let hrp = optimize(
      &panel,
      StrategyTag::HierarchicalRiskParity,
      &config,
      None,
      None,
      None,
    )
    .unwrap();
    assert_abs_diff_eq!(hrp.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
  }

  #[test]
  fn batch_matches_sequential_results() {
    let engine: PortfolioEngine = PortfolioEngine::default();
    let requests: Vec<OptimizationRequest> = StrategyTag::ALL
      .iter()
      .filter(|&&s| s != StrategyTag::BlackLitterman)
      .enumerate()
      .map(|(i, &strategy)| {
        OptimizationRequest::new(
          random_panel(90, 4, 100 + i as u64),
          strategy,
          OptimizationConfig {
            covariance_method: CovarianceMethod::Sample,
            ..Default::default()
          },
          None,
          None,
          None,
        )
      })
      .collect();

    let batch = engine.optimize_batch(&requests);
    assert_eq!(batch.len(), requests.len());
    for (request, result) in requests.iter().zip(batch) {
      assert_eq!(result.unwrap(), engine.optimize_request(request).unwrap());
    }
  }
}
