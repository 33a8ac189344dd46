//! # Covariance Estimation
//!
//! $$
//! \hat\Sigma_{\text{LW}} = (1-\delta)\,S + \delta\,\bar\mu I,\qquad
//! \hat\Sigma_{\text{EW}} = \sum_t \omega_t (x_t-\bar x)(x_t-\bar x)^\top
//! $$
//!
//! Sample, Ledoit-Wolf shrinkage and exponentially weighted covariance
//! estimators, plus the Pearson correlation matrix used by HRP.

use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray_stats::CorrelationExt;
use tracing::debug;

use super::data::ReturnPanel;
use super::types::Component;
use super::types::CovarianceMethod;
use crate::error::OptimizationError;
use crate::error::Result;

/// Minimum number of observations every estimator needs.
pub const MIN_OBSERVATIONS: usize = 2;

/// Symmetric `N x N` covariance matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceMatrix {
  matrix: DMatrix<f64>,
}

impl CovarianceMatrix {
  /// Wrap a precomputed covariance matrix.
  ///
  /// The matrix must be square, finite and symmetric up to rounding; it is
  /// re-symmetrized on construction.
  pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
    let invalid = |reason: String| {
      Err(OptimizationError::invalid_input(
        Component::CovarianceEstimator,
        reason,
      ))
    };

    if !matrix.is_square() || matrix.nrows() == 0 {
      return invalid(format!(
        "covariance must be a non-empty square matrix, got {}x{}",
        matrix.nrows(),
        matrix.ncols()
      ));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
      return invalid("covariance holds non-finite entries".to_string());
    }

    let scale = matrix.amax().max(1.0);
    let asymmetry = (&matrix - matrix.transpose()).amax();
    if asymmetry > 1e-10 * scale {
      return invalid(format!("covariance is not symmetric (max |C - Cᵀ| = {asymmetry:e})"));
    }

    if let Some(i) = (0..matrix.nrows()).find(|&i| matrix[(i, i)] < 0.0) {
      return Err(OptimizationError::SingularCovariance {
        component: Component::CovarianceEstimator,
        reason: format!("negative variance {} on the diagonal", matrix[(i, i)]),
        asset: Some(i),
      });
    }

    let matrix = (&matrix + matrix.transpose()) * 0.5;
    Ok(Self { matrix })
  }

  /// Build from per-asset volatilities and a correlation matrix.
  pub fn from_correlation(sigmas: &[f64], corr: &DMatrix<f64>) -> Result<Self> {
    let n = sigmas.len();
    if corr.nrows() != n || corr.ncols() != n {
      return Err(OptimizationError::invalid_input(
        Component::CovarianceEstimator,
        format!(
          "correlation is {}x{} but {n} volatilities were given",
          corr.nrows(),
          corr.ncols()
        ),
      ));
    }

    Self::new(DMatrix::from_fn(n, n, |i, j| {
      sigmas[i] * sigmas[j] * corr[(i, j)]
    }))
  }

  /// Borrow the underlying matrix.
  pub fn matrix(&self) -> &DMatrix<f64> {
    &self.matrix
  }

  /// Number of assets.
  pub fn dim(&self) -> usize {
    self.matrix.nrows()
  }

  /// Per-asset volatility `sqrt(diag(Σ))`.
  pub fn volatilities(&self) -> DVector<f64> {
    self.matrix.diagonal().map(|v| v.max(0.0).sqrt())
  }

  /// Portfolio variance `wᵀ Σ w`.
  pub fn portfolio_variance(&self, weights: &DVector<f64>) -> f64 {
    weights.dot(&(&self.matrix * weights))
  }

  /// Correlation implied by the covariance; zero-variance assets get zero
  /// off-diagonal correlation.
  pub fn correlation(&self) -> DMatrix<f64> {
    let sigmas = self.volatilities();
    let n = self.dim();

    DMatrix::from_fn(n, n, |i, j| {
      let denom = sigmas[i] * sigmas[j];
      if i == j {
        1.0
      } else if denom > 1e-15 {
        (self.matrix[(i, j)] / denom).clamp(-1.0, 1.0)
      } else {
        0.0
      }
    })
  }
}

/// Estimate the covariance of `panel` with `method`.
///
/// `decay` is only read by [`CovarianceMethod::Exponential`].
pub fn estimate_covariance(
  panel: &ReturnPanel,
  method: CovarianceMethod,
  decay: f64,
) -> Result<CovarianceMatrix> {
  let cov = match method {
    CovarianceMethod::Sample => sample_covariance(panel)?,
    CovarianceMethod::Shrinkage => ledoit_wolf_covariance(panel)?.0,
    CovarianceMethod::Exponential => exponential_covariance(panel, decay)?,
  };

  debug!(
    method = %method,
    n_assets = cov.dim(),
    n_observations = panel.n_observations(),
    "estimated covariance"
  );

  Ok(cov)
}

/// Unbiased (`T - 1`) sample covariance.
pub fn sample_covariance(panel: &ReturnPanel) -> Result<CovarianceMatrix> {
  ensure_observations(panel)?;

  let cov = panel.view().t().cov(1.0).map_err(|e| {
    OptimizationError::invalid_input(Component::CovarianceEstimator, e.to_string())
  })?;
  let n = cov.nrows();

  CovarianceMatrix::new(DMatrix::from_fn(n, n, |i, j| cov[[i, j]]))
}

/// Ledoit-Wolf shrinkage toward `μ I`, `μ = tr(S) / N`, where `S` is the
/// maximum-likelihood covariance. Returns the matrix and the shrinkage
/// intensity in `[0, 1]`.
pub fn ledoit_wolf_covariance(panel: &ReturnPanel) -> Result<(CovarianceMatrix, f64)> {
  ensure_observations(panel)?;

  let x = centered(panel);
  let t = x.nrows() as f64;
  let n = x.ncols() as f64;

  let xtx = x.transpose() * &x;
  let emp_cov = &xtx / t;
  let trace = emp_cov.trace();
  let mu = trace / n;

  let x2 = x.component_mul(&x);
  let beta_sum = (x2.transpose() * &x2).sum();
  let delta_sum = xtx.component_mul(&xtx).sum() / (t * t);

  let beta = (beta_sum / t - delta_sum) / (n * t);
  let delta = (delta_sum - 2.0 * mu * trace + n * mu * mu) / n;
  let shrinkage = if delta <= 0.0 {
    0.0
  } else {
    (beta.min(delta) / delta).clamp(0.0, 1.0)
  };

  debug!(shrinkage, mu, "ledoit-wolf shrinkage intensity");

  let mut shrunk = emp_cov * (1.0 - shrinkage);
  for i in 0..shrunk.nrows() {
    shrunk[(i, i)] += shrinkage * mu;
  }

  Ok((CovarianceMatrix::new(shrunk)?, shrinkage))
}

/// Exponentially weighted covariance; observation `t` carries weight
/// `(1 - decay) decay^(T-1-t)`, normalized to one.
pub fn exponential_covariance(panel: &ReturnPanel, decay: f64) -> Result<CovarianceMatrix> {
  if !(decay > 0.0 && decay < 1.0) {
    return Err(OptimizationError::invalid_config(
      Component::CovarianceEstimator,
      format!("decay_factor must lie in (0, 1), got {decay}"),
    ));
  }
  ensure_observations(panel)?;

  let x = centered(panel);
  let n_obs = x.nrows();
  let raw: Vec<f64> = (0..n_obs)
    .map(|t| (1.0 - decay) * decay.powi((n_obs - 1 - t) as i32))
    .collect();
  let total: f64 = raw.iter().sum();

  let mut weighted = x.clone();
  for (t, mut row) in weighted.row_iter_mut().enumerate() {
    row *= raw[t] / total;
  }

  CovarianceMatrix::new(x.transpose() * weighted)
}

/// Pearson correlation matrix of the panel columns.
pub fn correlation_matrix(panel: &ReturnPanel) -> Result<DMatrix<f64>> {
  ensure_observations(panel)?;

  let view = panel.view();
  if let Some(i) = (0..panel.n_assets()).find(|&i| {
    let col = view.column(i);
    col.iter().all(|&v| v == col[0])
  }) {
    return Err(OptimizationError::SingularCovariance {
      component: Component::CovarianceEstimator,
      reason: "constant return series has undefined correlation".to_string(),
      asset: Some(i),
    });
  }

  let corr = view.t().pearson_correlation().map_err(|e| {
    OptimizationError::invalid_input(Component::CovarianceEstimator, e.to_string())
  })?;
  let n = corr.nrows();

  Ok(DMatrix::from_fn(n, n, |i, j| {
    if i == j {
      1.0
    } else {
      corr[[i, j]].clamp(-1.0, 1.0)
    }
  }))
}

fn ensure_observations(panel: &ReturnPanel) -> Result<()> {
  if panel.n_observations() < MIN_OBSERVATIONS {
    return Err(OptimizationError::InsufficientData {
      component: Component::CovarianceEstimator,
      observations: panel.n_observations(),
      required: MIN_OBSERVATIONS,
    });
  }
  Ok(())
}

fn centered(panel: &ReturnPanel) -> DMatrix<f64> {
  let view = panel.view();
  let mean = panel.mean_returns();
  DMatrix::from_fn(view.nrows(), view.ncols(), |t, i| view[[t, i]] - mean[i])
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::Array2;
  use ndarray_rand::RandomExt;
  use rand::rngs::StdRng;
  use rand::SeedableRng;
  use rand_distr::Normal;

  use super::*;

  fn random_panel(t: usize, n: usize, seed: u64) -> ReturnPanel {
    let mut rng = StdRng::seed_from_u64(seed);
    let returns = Array2::random_using((t, n), Normal::new(0.0, 0.01).unwrap(), &mut rng);
    ReturnPanel::new(returns).unwrap()
  }

  fn min_eigenvalue(cov: &CovarianceMatrix) -> f64 {
    cov
      .matrix()
      .clone()
      .symmetric_eigen()
      .eigenvalues
      .min()
  }

  #[test]
  fn sample_covariance_matches_hand_computation() {
    let panel =
      ReturnPanel::from_rows(&[vec![0.01, 0.02], vec![0.03, 0.00], vec![0.02, 0.04]]).unwrap();
    let cov = sample_covariance(&panel).unwrap();

    // means 0.02, 0.02; deviations (-0.01, 0), (0.01, -0.02), (0, 0.02)
    assert_abs_diff_eq!(cov.matrix()[(0, 0)], 0.0002 / 2.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cov.matrix()[(1, 1)], 0.0008 / 2.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cov.matrix()[(0, 1)], -0.0002 / 2.0, epsilon = 1e-15);
    assert_eq!(cov.matrix()[(0, 1)], cov.matrix()[(1, 0)]);
  }

  #[test]
  fn single_observation_is_insufficient() {
    let panel = ReturnPanel::from_rows(&[vec![0.01, 0.02]]).unwrap();

    for method in [
      CovarianceMethod::Sample,
      CovarianceMethod::Shrinkage,
      CovarianceMethod::Exponential,
    ] {
      let err = estimate_covariance(&panel, method, 0.94).unwrap_err();
      assert!(matches!(
        err,
        OptimizationError::InsufficientData {
          observations: 1,
          required: 2,
          ..
        }
      ));
    }
  }

  #[test]
  fn shrinkage_is_invertible_when_assets_outnumber_observations() {
    let panel = random_panel(5, 12, 7);

    let (cov, shrinkage) = ledoit_wolf_covariance(&panel).unwrap();
    assert!(shrinkage > 0.0 && shrinkage <= 1.0);
    assert!(min_eigenvalue(&cov) > 0.0);
    assert!(cov.matrix().clone().cholesky().is_some());

    let sample = sample_covariance(&panel).unwrap();
    assert!(sample.matrix().clone().cholesky().is_none() || min_eigenvalue(&sample) < 1e-12);
  }

  #[test]
  fn shrinkage_target_keeps_average_variance() {
    let panel = random_panel(60, 4, 11);
    let (cov, _) = ledoit_wolf_covariance(&panel).unwrap();

    let t = panel.n_observations() as f64;
    let sample = sample_covariance(&panel).unwrap();
    let mle_trace = sample.matrix().trace() * (t - 1.0) / t;
    assert_abs_diff_eq!(cov.matrix().trace(), mle_trace, epsilon = 1e-14);
  }

  #[test]
  fn exponential_weights_favour_recent_observations() {
    // The last observation is an outlier for asset 0; the decayed estimate
    // must react more strongly than the equally weighted one.
    let mut rows = vec![vec![0.001, 0.001]; 30];
    for (t, row) in rows.iter_mut().enumerate() {
      let sign = if t % 2 == 0 { 1.0 } else { -1.0 };
      row[0] = 0.001 * sign;
      row[1] = 0.002 * sign;
    }
    rows.push(vec![0.05, 0.0]);
    let panel = ReturnPanel::from_rows(&rows).unwrap();

    let ew = exponential_covariance(&panel, 0.9).unwrap();
    let sample = sample_covariance(&panel).unwrap();

    assert!(ew.matrix()[(0, 0)] > sample.matrix()[(0, 0)]);
    assert!(min_eigenvalue(&ew) >= -1e-15);
  }

  #[test]
  fn exponential_covariance_matches_hand_computation() {
    let panel =
      ReturnPanel::from_rows(&[vec![0.01, 0.02], vec![0.03, 0.00], vec![0.02, 0.04]]).unwrap();
    let cov = exponential_covariance(&panel, 0.5).unwrap();

    // raw weights 0.125, 0.25, 0.5 normalize to 1/7, 2/7, 4/7; deviations
    // from the simple means are (-0.01, 0), (0.01, -0.02), (0, 0.02).
    assert_abs_diff_eq!(cov.matrix()[(0, 0)], 3.0e-4 / 7.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cov.matrix()[(1, 1)], 24.0e-4 / 7.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cov.matrix()[(0, 1)], -4.0e-4 / 7.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cov.matrix()[(1, 0)], -4.0e-4 / 7.0, epsilon = 1e-15);
  }

  #[test]
  fn ledoit_wolf_matches_reference_values() {
    let panel = ReturnPanel::from_rows(&[
      vec![1.0, 2.0],
      vec![3.0, 5.0],
      vec![-2.0, -3.0],
      vec![0.0, 1.0],
      vec![4.0, 7.0],
      vec![-1.0, -2.0],
    ])
    .unwrap();
    let (cov, shrinkage) = ledoit_wolf_covariance(&panel).unwrap();

    // S = [[161/36, 67/9], [67/9, 113/9]], μ = 613/72.
    assert_abs_diff_eq!(shrinkage, 252968.0 / 1115931.0, epsilon = 1e-12);
    assert_abs_diff_eq!(cov.matrix()[(0, 0)], 24052415.0 / 4463724.0, epsilon = 1e-12);
    assert_abs_diff_eq!(cov.matrix()[(0, 1)], 57818521.0 / 10043379.0, epsilon = 1e-12);
    assert_abs_diff_eq!(cov.matrix()[(1, 1)], 38966164.0 / 3347793.0, epsilon = 1e-12);
  }

  #[test]
  fn exponential_rejects_out_of_range_decay() {
    let panel = random_panel(10, 2, 3);
    let err = exponential_covariance(&panel, 1.0).unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidConfig { .. }));
  }

  #[test]
  fn correlation_flags_constant_series() {
    let panel =
      ReturnPanel::from_rows(&[vec![0.01, 0.02], vec![0.01, -0.01], vec![0.01, 0.03]]).unwrap();

    let err = correlation_matrix(&panel).unwrap_err();
    assert!(matches!(err, OptimizationError::SingularCovariance { .. }));
    assert_eq!(err.asset(), Some(0));
  }

  #[test]
  fn correlation_of_random_panel_is_unit_diagonal_and_symmetric() {
    let panel = random_panel(50, 3, 5);
    let corr = correlation_matrix(&panel).unwrap();

    for i in 0..3 {
      assert_eq!(corr[(i, i)], 1.0);
      for j in 0..3 {
        assert_abs_diff_eq!(corr[(i, j)], corr[(j, i)], epsilon = 1e-15);
      }
    }

    let from_cov = sample_covariance(&panel).unwrap().correlation();
    assert_abs_diff_eq!(corr, from_cov, epsilon = 1e-12);
  }

  #[test]
  fn asymmetric_matrix_is_rejected() {
    let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.2, 1.0]);
    assert!(CovarianceMatrix::new(m).is_err());
  }
}
