//! # Portfolio Data
//!
//! $$
//! R \in \mathbb{R}^{T \times N},\quad r_{p,t} = \sum_i w_i R_{t,i}
//! $$
//!
//! The immutable return panel every strategy consumes.

use nalgebra::DVector;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::Axis;

use super::types::Component;
use crate::error::OptimizationError;
use crate::error::Result;

/// `T x N` panel of asset returns, rows ascending in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnPanel {
  returns: Array2<f64>,
}

impl ReturnPanel {
  /// Wrap a `T x N` array. Rejects empty universes and non-finite values.
  pub fn new(returns: Array2<f64>) -> Result<Self> {
    if returns.ncols() == 0 {
      return Err(OptimizationError::invalid_input(
        Component::StrategyDispatcher,
        "return panel has no assets",
      ));
    }

    if let Some(((t, i), v)) = returns.indexed_iter().find(|(_, v)| !v.is_finite()) {
      return Err(OptimizationError::invalid_input(
        Component::StrategyDispatcher,
        format!("return panel holds non-finite value {v} at observation {t}, asset {i}"),
      ));
    }

    Ok(Self { returns })
  }

  /// Build from row-major observations (one `Vec` per time step).
  pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
    let n_assets = rows.first().map(|r| r.len()).unwrap_or(0);
    if let Some(t) = rows.iter().position(|r| r.len() != n_assets) {
      return Err(OptimizationError::invalid_input(
        Component::StrategyDispatcher,
        format!(
          "observation {t} has {} returns, expected {n_assets}",
          rows[t].len()
        ),
      ));
    }

    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let returns = Array2::from_shape_vec((rows.len(), n_assets), flat).map_err(|e| {
      OptimizationError::invalid_input(Component::StrategyDispatcher, e.to_string())
    })?;

    Self::new(returns)
  }

  /// Number of observations `T`.
  pub fn n_observations(&self) -> usize {
    self.returns.nrows()
  }

  /// Number of assets `N`.
  pub fn n_assets(&self) -> usize {
    self.returns.ncols()
  }

  /// Borrow the raw `T x N` array.
  pub fn view(&self) -> ArrayView2<'_, f64> {
    self.returns.view()
  }

  /// Per-asset arithmetic mean return.
  pub fn mean_returns(&self) -> DVector<f64> {
    match self.returns.mean_axis(Axis(0)) {
      Some(mean) => DVector::from_vec(mean.to_vec()),
      None => DVector::zeros(self.n_assets()),
    }
  }

  /// Portfolio return series `R w`.
  pub fn portfolio_returns(&self, weights: &[f64]) -> Vec<f64> {
    self
      .returns
      .rows()
      .into_iter()
      .map(|row| row.iter().zip(weights.iter()).map(|(r, w)| r * w).sum())
      .collect()
  }
}
