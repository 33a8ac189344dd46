//! # Interior-Point QP
//!
//! $$
//! \begin{bmatrix} H + G^\top S^{-1} Z G & A^\top \\ A & 0 \end{bmatrix}
//! \begin{bmatrix} \Delta x \\ \Delta y \end{bmatrix}
//! = \begin{bmatrix} -r_d - G^\top S^{-1}(r_c + Z r_g) \\ -r_p \end{bmatrix}
//! $$
//!
//! Dense Mehrotra predictor-corrector primal-dual interior-point method.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;
use tracing::trace;

use super::QuadraticProgram;
use super::Solver;
use super::SolverError;
use crate::portfolio::config::SolverSettings;

/// Default quadratic backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct InteriorPointSolver {
  settings: SolverSettings,
}

impl InteriorPointSolver {
  pub fn new(settings: SolverSettings) -> Self {
    Self { settings }
  }
}

struct Direction {
  dx: DVector<f64>,
  dy: DVector<f64>,
  dz: DVector<f64>,
  ds: DVector<f64>,
}

impl Solver for InteriorPointSolver {
  fn settings(&self) -> &SolverSettings {
    &self.settings
  }

  fn solve_qp(&self, qp: &QuadraticProgram) -> Result<DVector<f64>, SolverError> {
    qp.check_dimensions()?;

    let n = qp.dim();
    let p = qp.eq_rhs.len();
    let m = qp.ineq_rhs.len();
    let tol = self.settings.tolerance;

    // The minimizer is invariant to a positive rescaling of the objective.
    let magnitude = qp.hessian.amax().max(qp.linear.amax());
    let scale = if magnitude > 0.0 { 1.0 / magnitude } else { 1.0 };
    let h = &qp.hessian * scale;
    let c = &qp.linear * scale;
    let a = &qp.eq_matrix;
    let b = &qp.eq_rhs;
    let g = &qp.ineq_matrix;
    let hv = &qp.ineq_rhs;

    if m == 0 {
      return solve_equality_qp(&h, &c, a, b);
    }

    let mut x = DVector::zeros(n);
    let mut y = DVector::zeros(p);
    let mut z = DVector::from_element(m, 1.0);
    let mut s = (hv - g * &x).map(|v| v.max(1.0));

    let tol_d = tol * (1.0 + c.amax());
    let tol_p = tol * (1.0 + b.amax());
    let tol_g = tol * (1.0 + hv.amax());

    for iteration in 0..self.settings.max_iterations {
      let r_d = &h * &x + &c + a.transpose() * &y + g.transpose() * &z;
      let r_p = a * &x - b;
      let r_g = g * &x + &s - hv;
      let mu = s.dot(&z) / m as f64;

      if !(mu.is_finite() && r_d.iter().chain(r_p.iter()).chain(r_g.iter()).all(|v| v.is_finite()))
      {
        return Err(SolverError::Infeasible(format!(
          "residuals diverged at iteration {iteration}"
        )));
      }

      trace!(
        iteration,
        mu,
        dual = r_d.amax(),
        primal = r_p.amax(),
        slack = r_g.amax(),
        "interior-point iteration"
      );

      if r_d.amax() <= tol_d && r_p.amax() <= tol_p && r_g.amax() <= tol_g && mu <= tol {
        debug!(iteration, objective = qp.objective(&x), "interior-point converged");
        return Ok(x);
      }

      let w = z.component_div(&s);
      let mut kkt = DMatrix::zeros(n + p, n + p);
      let gtwg = g.transpose() * DMatrix::from_diagonal(&w) * g;
      kkt.view_mut((0, 0), (n, n)).copy_from(&(&h + gtwg));
      kkt.view_mut((0, n), (n, p)).copy_from(&a.transpose());
      kkt.view_mut((n, 0), (p, n)).copy_from(a);
      let lu = kkt.lu();

      let solve = |r_c: &DVector<f64>| -> Result<Direction, SolverError> {
        let t = (r_c + z.component_mul(&r_g)).component_div(&s);
        let mut rhs = DVector::zeros(n + p);
        rhs.rows_mut(0, n).copy_from(&(-&r_d - g.transpose() * &t));
        rhs.rows_mut(n, p).copy_from(&(-&r_p));

        // With inequalities present, rank loss means the iterates ran away
        // from an empty feasible set.
        let sol = lu.solve(&rhs).ok_or_else(|| {
          SolverError::Infeasible(format!(
            "KKT system lost rank at iteration {iteration} with μ = {mu:e}"
          ))
        })?;
        let dx = sol.rows(0, n).into_owned();
        let dy = sol.rows(n, p).into_owned();
        let g_dx = g * &dx;
        let dz = &t + w.component_mul(&g_dx);
        let ds = -&r_g - g_dx;

        Ok(Direction { dx, dy, dz, ds })
      };

      // Predictor.
      let affine = solve(&(-s.component_mul(&z)))?;
      let alpha_aff = max_step(&s, &affine.ds).min(max_step(&z, &affine.dz));
      let mu_aff = (&s + &affine.ds * alpha_aff).dot(&(&z + &affine.dz * alpha_aff)) / m as f64;
      let sigma = (mu_aff / mu).clamp(0.0, 1.0).powi(3);

      // Corrector.
      let r_c = -s.component_mul(&z) - affine.ds.component_mul(&affine.dz)
        + DVector::from_element(m, sigma * mu);
      let dir = solve(&r_c)?;

      let alpha = (0.99 * max_step(&s, &dir.ds).min(max_step(&z, &dir.dz))).min(1.0);
      x += &dir.dx * alpha;
      y += &dir.dy * alpha;
      z += &dir.dz * alpha;
      s += &dir.ds * alpha;
    }

    Err(SolverError::MaxIterations {
      iterations: self.settings.max_iterations,
    })
  }
}

/// Largest `α ∈ (0, ∞)` keeping `v + α dv ≥ 0`, capped at a large value.
fn max_step(v: &DVector<f64>, dv: &DVector<f64>) -> f64 {
  v.iter()
    .zip(dv.iter())
    .filter(|&(_, &d)| d < 0.0)
    .map(|(&vi, &d)| -vi / d)
    .fold(1e10, f64::min)
}

fn solve_equality_qp(
  h: &DMatrix<f64>,
  c: &DVector<f64>,
  a: &DMatrix<f64>,
  b: &DVector<f64>,
) -> Result<DVector<f64>, SolverError> {
  let n = c.len();
  let p = b.len();

  let mut kkt = DMatrix::zeros(n + p, n + p);
  kkt.view_mut((0, 0), (n, n)).copy_from(h);
  kkt.view_mut((0, n), (n, p)).copy_from(&a.transpose());
  kkt.view_mut((n, 0), (p, n)).copy_from(a);

  let mut rhs = DVector::zeros(n + p);
  rhs.rows_mut(0, n).copy_from(&(-c));
  rhs.rows_mut(n, p).copy_from(b);

  let sol = kkt
    .lu()
    .solve(&rhs)
    .ok_or_else(|| SolverError::Singular("equality-constrained KKT system".to_string()))?;
  Ok(sol.rows(0, n).into_owned())
}
