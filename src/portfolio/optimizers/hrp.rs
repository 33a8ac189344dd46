//! # Hierarchical Risk Parity
//!
//! $$
//! d_{ij} = \sqrt{2(1-\rho_{ij})},\qquad
//! \alpha = 1 - \frac{V_L}{V_L + V_R}
//! $$
//!
//! Single-linkage clustering on correlation distance, quasi-diagonal
//! seriation of the merge tree and recursive bisection with inverse-variance
//! cluster variances. No box constraint is applied.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use crate::error::OptimizationError;
use crate::error::Result;
use crate::portfolio::covariance::correlation_matrix;
use crate::portfolio::covariance::CovarianceMatrix;
use crate::portfolio::data::ReturnPanel;
use crate::portfolio::types::Component;

/// Child of a merge node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRef {
  /// Asset index.
  Leaf(usize),
  /// Index into [`Dendrogram::nodes`].
  Merge(usize),
}

/// One agglomeration step.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeNode {
  pub left: NodeRef,
  pub right: NodeRef,
  /// Linkage distance at which the children were joined.
  pub distance: f64,
  /// Number of assets beneath this node.
  pub size: usize,
  /// Total HRP weight allocated beneath this node.
  pub weight: f64,
}

/// Binary merge tree over `n_leaves` assets, nodes stored in merge order.
///
/// A node only references leaves or earlier nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dendrogram {
  n_leaves: usize,
  nodes: Vec<MergeNode>,
}

impl Dendrogram {
  /// Single-linkage agglomerative clustering of a distance matrix.
  ///
  /// Ties are broken by the lowest `(i, j)` pair.
  pub fn single_linkage(dist: &DMatrix<f64>) -> Result<Self> {
    let n = dist.nrows();
    if !dist.is_square() {
      return Err(OptimizationError::invalid_input(
        Component::HrpAllocator,
        format!("distance matrix is {}x{}", dist.nrows(), dist.ncols()),
      ));
    }
    if let Some((i, _)) = dist
      .iter()
      .enumerate()
      .find(|(_, d)| !d.is_finite())
    {
      return Err(OptimizationError::SingularCovariance {
        component: Component::HrpAllocator,
        reason: "non-finite correlation distance".to_string(),
        asset: Some(i % n),
      });
    }

    let mut d = dist.clone();
    let mut active = vec![true; n];
    let mut slot: Vec<NodeRef> = (0..n).map(NodeRef::Leaf).collect();
    let mut size = vec![1usize; n];
    let mut nodes = Vec::with_capacity(n.saturating_sub(1));

    for step in 0..n.saturating_sub(1) {
      let mut best = (f64::INFINITY, 0, 0);
      for i in (0..n).filter(|&i| active[i]) {
        for j in ((i + 1)..n).filter(|&j| active[j]) {
          if d[(i, j)] < best.0 {
            best = (d[(i, j)], i, j);
          }
        }
      }

      let (distance, mi, mj) = best;
      if !distance.is_finite() {
        return Err(OptimizationError::singular(
          Component::HrpAllocator,
          "distance matrix is disconnected",
        ));
      }

      nodes.push(MergeNode {
        left: slot[mi],
        right: slot[mj],
        distance,
        size: size[mi] + size[mj],
        weight: 0.0,
      });
      slot[mi] = NodeRef::Merge(step);
      size[mi] += size[mj];
      active[mj] = false;

      for k in (0..n).filter(|&k| active[k] && k != mi) {
        let linked = d[(mi, k)].min(d[(mj, k)]);
        d[(mi, k)] = linked;
        d[(k, mi)] = linked;
      }
    }

    Ok(Self { n_leaves: n, nodes })
  }

  pub fn n_leaves(&self) -> usize {
    self.n_leaves
  }

  pub fn nodes(&self) -> &[MergeNode] {
    &self.nodes
  }

  pub fn root(&self) -> NodeRef {
    match self.nodes.len() {
      0 => NodeRef::Leaf(0),
      len => NodeRef::Merge(len - 1),
    }
  }

  /// Quasi-diagonal leaf order: left subtree before right, depth first.
  pub fn leaf_order(&self) -> Vec<usize> {
    if self.n_leaves == 0 {
      return Vec::new();
    }

    let mut order = Vec::with_capacity(self.n_leaves);
    let mut stack = vec![self.root()];
    while let Some(node) = stack.pop() {
      match node {
        NodeRef::Leaf(asset) => order.push(asset),
        NodeRef::Merge(idx) => {
          stack.push(self.nodes[idx].right);
          stack.push(self.nodes[idx].left);
        }
      }
    }
    order
  }

  fn accumulate_weights(&mut self, weights: &DVector<f64>) {
    for idx in 0..self.nodes.len() {
      let total = self.weight_of(self.nodes[idx].left, weights)
        + self.weight_of(self.nodes[idx].right, weights);
      self.nodes[idx].weight = total;
    }
  }

  fn weight_of(&self, node: NodeRef, weights: &DVector<f64>) -> f64 {
    match node {
      NodeRef::Leaf(asset) => weights[asset],
      NodeRef::Merge(idx) => self.nodes[idx].weight,
    }
  }
}

/// HRP weights together with the clustering that produced them.
#[derive(Clone, Debug, PartialEq)]
pub struct HrpAllocation {
  pub weights: DVector<f64>,
  /// Seriated asset order.
  pub order: Vec<usize>,
  pub dendrogram: Dendrogram,
}

/// Correlation distance `sqrt(2 (1 - ρ))`.
pub fn correlation_distance(corr: &DMatrix<f64>) -> DMatrix<f64> {
  corr.map(|rho| (2.0 * (1.0 - rho)).max(0.0).sqrt())
}

/// HRP on the correlation of `panel`.
pub fn hrp_from_panel(panel: &ReturnPanel, cov: &CovarianceMatrix) -> Result<HrpAllocation> {
  let corr = correlation_matrix(panel).map_err(|e| match e {
    OptimizationError::SingularCovariance { reason, asset, .. } => {
      OptimizationError::SingularCovariance {
        component: Component::HrpAllocator,
        reason,
        asset,
      }
    }
    other => other,
  })?;
  hierarchical_risk_parity(&corr, cov)
}

/// HRP on a precomputed correlation matrix.
pub fn hierarchical_risk_parity(
  corr: &DMatrix<f64>,
  cov: &CovarianceMatrix,
) -> Result<HrpAllocation> {
  let n = cov.dim();
  if corr.nrows() != n || corr.ncols() != n {
    return Err(OptimizationError::invalid_input(
      Component::HrpAllocator,
      format!(
        "correlation is {}x{} but covariance has {n} assets",
        corr.nrows(),
        corr.ncols()
      ),
    ));
  }

  if n < 2 {
    return Ok(HrpAllocation {
      weights: DVector::from_element(n, 1.0),
      order: (0..n).collect(),
      dendrogram: Dendrogram {
        n_leaves: n,
        nodes: Vec::new(),
      },
    });
  }

  let mut dendrogram = Dendrogram::single_linkage(&correlation_distance(corr))?;
  let order = dendrogram.leaf_order();
  let weights = recursive_bisection(&order, cov.matrix());
  dendrogram.accumulate_weights(&weights);

  debug!(
    assets = n,
    root_distance = dendrogram.nodes.last().map(|node| node.distance),
    "hrp allocated"
  );

  Ok(HrpAllocation {
    weights,
    order,
    dendrogram,
  })
}

fn recursive_bisection(order: &[usize], cov: &DMatrix<f64>) -> DVector<f64> {
  let mut weights = DVector::from_element(cov.nrows(), 1.0);
  let mut stack = vec![order];

  while let Some(cluster) = stack.pop() {
    if cluster.len() <= 1 {
      continue;
    }

    let (left, right) = cluster.split_at(cluster.len() / 2);
    let var_left = cluster_variance(left, cov);
    let var_right = cluster_variance(right, cov);

    let denom = var_left + var_right;
    let alpha = if denom > 1e-30 {
      1.0 - var_left / denom
    } else {
      0.5
    };

    for &i in left {
      weights[i] *= alpha;
    }
    for &i in right {
      weights[i] *= 1.0 - alpha;
    }

    stack.push(right);
    stack.push(left);
  }

  weights
}

/// Variance of the inverse-variance portfolio over `indices`.
fn cluster_variance(indices: &[usize], cov: &DMatrix<f64>) -> f64 {
  let inv_vars = DVector::from_iterator(
    indices.len(),
    indices.iter().map(|&i| {
      let v = cov[(i, i)];
      if v > 1e-15 { 1.0 / v } else { 0.0 }
    }),
  );

  let total = inv_vars.sum();
  if total < 1e-15 {
    return 1.0;
  }
  let w = inv_vars / total;

  let slice = cov.select_rows(indices).select_columns(indices);
  w.dot(&(slice * &w))
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::Array2;

  use super::*;

  fn cov_from(vols: &[f64], corr: &DMatrix<f64>) -> CovarianceMatrix {
    CovarianceMatrix::from_correlation(vols, corr).unwrap()
  }

  fn block_corr() -> DMatrix<f64> {
    // {0, 2} and {1, 3} are tightly correlated pairs.
    DMatrix::from_row_slice(
      4,
      4,
      &[
        1.0, 0.1, 0.9, 0.0, //
        0.1, 1.0, 0.2, 0.8, //
        0.9, 0.2, 1.0, 0.1, //
        0.0, 0.8, 0.1, 1.0,
      ],
    )
  }

  #[test]
  fn single_linkage_merges_closest_pairs_first() {
    let dist = correlation_distance(&block_corr());
    let tree = Dendrogram::single_linkage(&dist).unwrap();

    assert_eq!(tree.nodes().len(), 3);
    assert_eq!(tree.nodes()[0].left, NodeRef::Leaf(0));
    assert_eq!(tree.nodes()[0].right, NodeRef::Leaf(2));
    assert_abs_diff_eq!(tree.nodes()[0].distance, 0.2f64.sqrt(), epsilon = 1e-12);
    assert_eq!(tree.nodes()[1].left, NodeRef::Leaf(1));
    assert_eq!(tree.nodes()[1].right, NodeRef::Leaf(3));
    assert_eq!(tree.root(), NodeRef::Merge(2));
    assert_eq!(tree.nodes()[2].size, 4);

    // Single linkage joins the pairs at their closest members (corr 0.2).
    assert_abs_diff_eq!(tree.nodes()[2].distance, 1.6f64.sqrt(), epsilon = 1e-12);
  }

  #[test]
  fn seriation_keeps_clusters_adjacent() {
    let tree = Dendrogram::single_linkage(&correlation_distance(&block_corr())).unwrap();
    assert_eq!(tree.leaf_order(), vec![0, 2, 1, 3]);
  }

  #[test]
  fn two_uncorrelated_assets_get_inverse_variance_weights() {
    let cov = cov_from(&[0.1, 0.2], &DMatrix::identity(2, 2));
    let hrp = hierarchical_risk_parity(&DMatrix::identity(2, 2), &cov).unwrap();

    assert_abs_diff_eq!(hrp.weights[0], 0.8, epsilon = 1e-12);
    assert_abs_diff_eq!(hrp.weights[1], 0.2, epsilon = 1e-12);
  }

  #[test]
  fn weights_are_non_negative_and_tree_accumulates_them() {
    let corr = block_corr();
    let cov = cov_from(&[0.1, 0.3, 0.15, 0.25], &corr);
    let hrp = hierarchical_risk_parity(&corr, &cov).unwrap();

    assert!(hrp.weights.iter().all(|&w| w >= 0.0));
    assert_abs_diff_eq!(hrp.weights.sum(), 1.0, epsilon = 1e-12);

    let nodes = hrp.dendrogram.nodes();
    assert_abs_diff_eq!(nodes[2].weight, 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(
      nodes[0].weight,
      hrp.weights[0] + hrp.weights[2],
      epsilon = 1e-12
    );
  }

  #[test]
  fn single_asset_gets_full_weight() {
    let cov = cov_from(&[0.2], &DMatrix::identity(1, 1));
    let hrp = hierarchical_risk_parity(&DMatrix::identity(1, 1), &cov).unwrap();

    assert_eq!(hrp.weights, DVector::from_element(1, 1.0));
    assert_eq!(hrp.order, vec![0]);
    assert!(hrp.dendrogram.nodes().is_empty());
  }

  #[test]
  fn non_finite_correlation_is_singular() {
    let mut corr = DMatrix::identity(3, 3);
    corr[(1, 2)] = f64::NAN;
    corr[(2, 1)] = f64::NAN;
    let cov = cov_from(&[0.1, 0.1, 0.1], &DMatrix::identity(3, 3));

    let err = hierarchical_risk_parity(&corr, &cov).unwrap_err();
    assert!(matches!(err, OptimizationError::SingularCovariance { .. }));
    assert_eq!(err.component(), Component::HrpAllocator);
  }

  #[test]
  fn constant_series_is_reported_by_the_allocator() {
    let returns = Array2::from_shape_vec(
      (3, 2),
      vec![0.01, 0.02, 0.01, -0.01, 0.01, 0.03],
    )
    .unwrap();
    let panel = ReturnPanel::new(returns).unwrap();
    let cov = cov_from(&[0.1, 0.1], &DMatrix::identity(2, 2));

    let err = hrp_from_panel(&panel, &cov).unwrap_err();
    assert_eq!(err.component(), Component::HrpAllocator);
    assert_eq!(err.asset(), Some(0));
  }
}
