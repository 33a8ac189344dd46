//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\min_{\mathbf{w}} \ \mathbf{w}^\top \Sigma \mathbf{w}-\tfrac{1}{\lambda}\mathbf{w}^\top\mu
//! $$
//!
//! Shared enums and result containers for portfolio optimization.

use std::fmt::Display;
use std::str::FromStr;

use impl_new_derive::ImplNew;
use serde::Deserialize;
use serde::Serialize;

use crate::error::OptimizationError;

/// Pipeline stage, reported by every error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
  CovarianceEstimator,
  QuadraticAllocator,
  RiskParitySolver,
  HrpAllocator,
  BlackLittermanBlender,
  MetricsCalculator,
  StrategyDispatcher,
}

impl Display for Component {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Component::CovarianceEstimator => write!(f, "covariance estimator"),
      Component::QuadraticAllocator => write!(f, "quadratic allocator"),
      Component::RiskParitySolver => write!(f, "risk parity solver"),
      Component::HrpAllocator => write!(f, "hrp allocator"),
      Component::BlackLittermanBlender => write!(f, "black-litterman blender"),
      Component::MetricsCalculator => write!(f, "metrics calculator"),
      Component::StrategyDispatcher => write!(f, "strategy dispatcher"),
    }
  }
}

/// Selectable allocation strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyTag {
  /// Mean-variance QP with the configured risk aversion.
  MeanVariance,
  /// Mean-variance QP with the return term switched off.
  MinVariance,
  /// Mean-variance QP with `risk_aversion = 1`.
  ///
  /// This is not a tangency-portfolio solve; it only re-runs the
  /// mean-variance problem at unit risk aversion.
  MaxSharpe,
  /// Equalized risk contributions.
  RiskParity,
  /// Hierarchical Risk Parity (Lopez de Prado).
  HierarchicalRiskParity,
  /// Black-Litterman posterior fed to the mean-variance QP.
  BlackLitterman,
}

impl StrategyTag {
  /// Every strategy, in declaration order.
  pub const ALL: [StrategyTag; 6] = [
    StrategyTag::MeanVariance,
    StrategyTag::MinVariance,
    StrategyTag::MaxSharpe,
    StrategyTag::RiskParity,
    StrategyTag::HierarchicalRiskParity,
    StrategyTag::BlackLitterman,
  ];

  /// Whether the strategy enforces the `[min_weight, max_weight]` box.
  pub fn is_bounded(self) -> bool {
    !matches!(self, StrategyTag::HierarchicalRiskParity)
  }

  fn as_str(self) -> &'static str {
    match self {
      StrategyTag::MeanVariance => "MEAN_VARIANCE",
      StrategyTag::MinVariance => "MIN_VARIANCE",
      StrategyTag::MaxSharpe => "MAX_SHARPE",
      StrategyTag::RiskParity => "RISK_PARITY",
      StrategyTag::HierarchicalRiskParity => "HIERARCHICAL_RISK_PARITY",
      StrategyTag::BlackLitterman => "BLACK_LITTERMAN",
    }
  }
}

impl Display for StrategyTag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StrategyTag {
  type Err = OptimizationError;

  /// Accepts the canonical tags case-insensitively, with `-` or `_`, and the
  /// short forms `mv`, `minvar`, `hrp`, `bl`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "mean_variance" | "mv" => Ok(Self::MeanVariance),
      "min_variance" | "minvar" => Ok(Self::MinVariance),
      "max_sharpe" => Ok(Self::MaxSharpe),
      "risk_parity" => Ok(Self::RiskParity),
      "hierarchical_risk_parity" | "hrp" => Ok(Self::HierarchicalRiskParity),
      "black_litterman" | "bl" => Ok(Self::BlackLitterman),
      _ => Err(OptimizationError::UnknownStrategy {
        component: Component::StrategyDispatcher,
        tag: s.to_string(),
      }),
    }
  }
}

/// Covariance estimation methods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceMethod {
  /// Unbiased sample covariance.
  Sample,
  /// Ledoit-Wolf shrinkage toward a scaled identity.
  #[default]
  #[serde(alias = "ledoit_wolf")]
  Shrinkage,
  /// Exponentially decayed, recency-weighted covariance.
  Exponential,
}

impl Display for CovarianceMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CovarianceMethod::Sample => write!(f, "sample"),
      CovarianceMethod::Shrinkage => write!(f, "shrinkage"),
      CovarianceMethod::Exponential => write!(f, "exponential"),
    }
  }
}

impl FromStr for CovarianceMethod {
  type Err = OptimizationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "sample" => Ok(Self::Sample),
      "shrinkage" | "ledoit_wolf" | "ledoitwolf" => Ok(Self::Shrinkage),
      "exponential" | "ewma" => Ok(Self::Exponential),
      _ => Err(OptimizationError::UnknownStrategy {
        component: Component::CovarianceEstimator,
        tag: s.to_string(),
      }),
    }
  }
}

/// Relative Black-Litterman view: `asset_i` outperforms `asset_j` by
/// `relative_return`.
#[derive(ImplNew, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct View {
  pub asset_i: usize,
  pub asset_j: usize,
  pub relative_return: f64,
  /// Inverse variance of the view; higher is more trusted.
  pub confidence: f64,
}

/// Output of a single `optimize` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
  /// Final portfolio weights.
  pub weights: Vec<f64>,
  /// `wᵀ mean(returns)`.
  pub expected_return: f64,
  /// `sqrt(wᵀ Σ w)`.
  pub volatility: f64,
  /// `(expected_return - risk_free_rate) / volatility`.
  pub sharpe_ratio: f64,
  /// Historical 95% Value-at-Risk of the portfolio return series.
  pub var_95: f64,
  /// Mean loss beyond `var_95`.
  pub expected_shortfall_95: f64,
  /// `volatility / (wᵀ σ)`.
  pub diversification_ratio: f64,
  /// Herfindahl index, `Σ w_i²`.
  pub concentration: f64,
  /// `Σ |w_i - current_i|`, zero without current weights.
  pub turnover: f64,
}

impl PortfolioMetrics {
  /// Expected return after paying `transaction_costs` on the turnover.
  pub fn net_expected_return(&self, transaction_costs: f64) -> f64 {
    self.expected_return - transaction_costs * self.turnover
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strategy_tags_parse_in_several_spellings() {
    assert_eq!(
      "MEAN_VARIANCE".parse::<StrategyTag>().unwrap(),
      StrategyTag::MeanVariance
    );
    assert_eq!(
      "hierarchical-risk-parity".parse::<StrategyTag>().unwrap(),
      StrategyTag::HierarchicalRiskParity
    );
    assert_eq!("bl".parse::<StrategyTag>().unwrap(), StrategyTag::BlackLitterman);

    for tag in StrategyTag::ALL {
      assert_eq!(tag.to_string().parse::<StrategyTag>().unwrap(), tag);
    }
  }

  #[test]
  fn unknown_strategy_is_rejected() {
    let err = "momentum".parse::<StrategyTag>().unwrap_err();
    assert!(matches!(
      err,
      OptimizationError::UnknownStrategy { ref tag, .. } if tag == "momentum"
    ));
  }

  #[test]
  fn covariance_method_accepts_ledoit_wolf_alias() {
    assert_eq!(
      "ledoit_wolf".parse::<CovarianceMethod>().unwrap(),
      CovarianceMethod::Shrinkage
    );
    let err = "garch".parse::<CovarianceMethod>().unwrap_err();
    assert_eq!(err.component(), Component::CovarianceEstimator);
  }

  #[test]
  fn net_expected_return_charges_turnover() {
    let metrics = PortfolioMetrics {
      expected_return: 0.01,
      turnover: 0.5,
      ..Default::default()
    };
    assert!((metrics.net_expected_return(0.002) - 0.009).abs() < 1e-15);
  }
}
