//! # Solvers
//!
//! $$
//! \min_x \tfrac12 x^\top H x + c^\top x \quad \text{s.t.}\quad Ax=b,\ Gx\le h
//! $$
//!
//! Backend-agnostic solver interface. Allocators only talk to [`Solver`]; the
//! quadratic backend is swappable and the nonlinear driver is built on top of
//! whatever quadratic backend is plugged in.

pub mod interior_point;

use argmin::core::CostFunction;
use argmin::core::Gradient;
use argmin::core::Hessian;
use impl_new_derive::ImplNew;
use nalgebra::DMatrix;
use nalgebra::DVector;
use thiserror::Error;
use tracing::debug;
use tracing::trace;

pub use interior_point::InteriorPointSolver;

use super::config::SolverSettings;

/// Backend-level failure, tagged with a component by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
  #[error("did not converge within {iterations} iterations")]
  MaxIterations { iterations: usize },
  #[error("singular system: {0}")]
  Singular(String),
  #[error("non-finite iterate: {0}")]
  NonFinite(String),
  #[error("infeasible constraints: {0}")]
  Infeasible(String),
  #[error("malformed problem: {0}")]
  Malformed(String),
  #[error("objective evaluation failed: {0}")]
  Objective(String),
}

/// Dense convex quadratic program
/// `min ½ xᵀHx + cᵀx  s.t.  Ax = b, Gx ≤ h`.
#[derive(ImplNew, Clone, Debug)]
pub struct QuadraticProgram {
  /// Positive semi-definite `H`.
  pub hessian: DMatrix<f64>,
  /// Linear term `c`.
  pub linear: DVector<f64>,
  pub eq_matrix: DMatrix<f64>,
  pub eq_rhs: DVector<f64>,
  pub ineq_matrix: DMatrix<f64>,
  pub ineq_rhs: DVector<f64>,
}

impl QuadraticProgram {
  /// Number of decision variables.
  pub fn dim(&self) -> usize {
    self.linear.len()
  }

  /// Objective value at `x`.
  pub fn objective(&self, x: &DVector<f64>) -> f64 {
    0.5 * x.dot(&(&self.hessian * x)) + self.linear.dot(x)
  }

  pub(crate) fn check_dimensions(&self) -> Result<(), SolverError> {
    let n = self.dim();
    let bad = |what: &str| Err(SolverError::Malformed(format!("{what} does not match {n} variables")));

    if self.hessian.nrows() != n || self.hessian.ncols() != n {
      return bad("hessian");
    }
    if self.eq_matrix.ncols() != n || self.eq_matrix.nrows() != self.eq_rhs.len() {
      return bad("equality block");
    }
    if self.ineq_matrix.ncols() != n || self.ineq_matrix.nrows() != self.ineq_rhs.len() {
      return bad("inequality block");
    }
    Ok(())
  }
}

/// Linear equalities plus a box, the feasible set of a nonlinear problem.
#[derive(ImplNew, Clone, Debug)]
pub struct LinearConstraints {
  pub eq_matrix: DMatrix<f64>,
  pub eq_rhs: DVector<f64>,
  pub lower: DVector<f64>,
  pub upper: DVector<f64>,
}

impl LinearConstraints {
  /// `Σ x_i = 1` with every coordinate in `[lower, upper]`.
  pub fn budget(n: usize, lower: f64, upper: f64) -> Self {
    Self {
      eq_matrix: DMatrix::from_element(1, n, 1.0),
      eq_rhs: DVector::from_element(1, 1.0),
      lower: DVector::from_element(n, lower),
      upper: DVector::from_element(n, upper),
    }
  }

  fn clamp(&self, x: DVector<f64>) -> DVector<f64> {
    DVector::from_fn(x.len(), |i, _| x[i].clamp(self.lower[i], self.upper[i]))
  }
}

/// Result of a nonlinear solve.
#[derive(Clone, Debug)]
pub struct NlpSolution {
  pub x: DVector<f64>,
  pub cost: f64,
  pub iterations: usize,
}

/// Smooth objective with gradient and a (possibly approximate) positive
/// semi-definite Hessian.
pub trait NonlinearProblem:
  CostFunction<Param = DVector<f64>, Output = f64>
  + Gradient<Param = DVector<f64>, Gradient = DVector<f64>>
  + Hessian<Param = DVector<f64>, Hessian = DMatrix<f64>>
{
}

impl<T> NonlinearProblem for T where
  T: CostFunction<Param = DVector<f64>, Output = f64>
    + Gradient<Param = DVector<f64>, Gradient = DVector<f64>>
    + Hessian<Param = DVector<f64>, Hessian = DMatrix<f64>>
{
}

/// Numerical backend used by the allocators.
pub trait Solver {
  /// Iteration and tolerance ceilings.
  fn settings(&self) -> &SolverSettings;

  /// Solve a convex quadratic program.
  fn solve_qp(&self, qp: &QuadraticProgram) -> Result<DVector<f64>, SolverError>;

  /// Minimize `problem` over `constraints`, starting from `x0`.
  ///
  /// The default is a sequential quadratic programming loop whose
  /// sub-problems go through [`Solver::solve_qp`].
  fn solve_nlp<P: NonlinearProblem>(
    &self,
    problem: &P,
    x0: DVector<f64>,
    constraints: &LinearConstraints,
  ) -> Result<NlpSolution, SolverError> {
    sequential_quadratic(self, problem, x0, constraints)
  }
}

fn sequential_quadratic<S, P>(
  solver: &S,
  problem: &P,
  x0: DVector<f64>,
  constraints: &LinearConstraints,
) -> Result<NlpSolution, SolverError>
where
  S: Solver + ?Sized,
  P: NonlinearProblem,
{
  let settings = *solver.settings();
  let n = x0.len();
  if constraints.lower.len() != n || constraints.upper.len() != n || constraints.eq_matrix.ncols() != n
  {
    return Err(SolverError::Malformed(format!(
      "constraints do not match {n} variables"
    )));
  }

  let ineq_matrix = {
    let mut g = DMatrix::zeros(2 * n, n);
    for i in 0..n {
      g[(i, i)] = 1.0;
      g[(n + i, i)] = -1.0;
    }
    g
  };

  let mut x = constraints.clamp(x0);
  let mut f = cost(problem, &x)?;

  for iteration in 1..=settings.nlp_max_iterations {
    let grad = problem
      .gradient(&x)
      .map_err(|e| SolverError::Objective(e.to_string()))?;
    let mut hess = problem
      .hessian(&x)
      .map_err(|e| SolverError::Objective(e.to_string()))?;
    hess = (&hess + hess.transpose()) * 0.5;
    let ridge = 1e-10 * hess.diagonal().amax().max(f64::MIN_POSITIVE);
    for i in 0..n {
      hess[(i, i)] += ridge;
    }

    let mut ineq_rhs = DVector::zeros(2 * n);
    for i in 0..n {
      ineq_rhs[i] = constraints.upper[i] - x[i];
      ineq_rhs[n + i] = x[i] - constraints.lower[i];
    }
    let eq_rhs = &constraints.eq_rhs - &constraints.eq_matrix * &x;

    let step = solver.solve_qp(&QuadraticProgram::new(
      hess,
      grad.clone(),
      constraints.eq_matrix.clone(),
      eq_rhs,
      ineq_matrix.clone(),
      ineq_rhs,
    ))?;

    let step_norm = step.amax();
    if step_norm <= settings.nlp_xtol {
      debug!(iteration, cost = f, "sqp converged on step length");
      return Ok(NlpSolution {
        x,
        cost: f,
        iterations: iteration,
      });
    }

    let slope = grad.dot(&step).min(0.0);
    let mut alpha = 1.0;
    let (x_next, f_next) = loop {
      let trial = constraints.clamp(&x + &step * alpha);
      let f_trial = cost(problem, &trial)?;
      if f_trial <= f + 1e-4 * alpha * slope {
        break (trial, f_trial);
      }

      alpha *= 0.5;
      if alpha < 1e-10 {
        if -slope <= settings.nlp_ftol {
          debug!(iteration, cost = f, "sqp converged on directional derivative");
          return Ok(NlpSolution {
            x,
            cost: f,
            iterations: iteration,
          });
        }
        return Err(SolverError::NonFinite(format!(
          "line search failed at iteration {iteration} (slope {slope:e})"
        )));
      }
    };

    let improvement = f - f_next;
    trace!(iteration, cost = f_next, alpha, step_norm, "sqp iteration");
    x = x_next;
    f = f_next;

    if improvement.abs() <= settings.nlp_ftol {
      debug!(iteration, cost = f, "sqp converged on function value");
      return Ok(NlpSolution {
        x,
        cost: f,
        iterations: iteration,
      });
    }
  }

  Err(SolverError::MaxIterations {
    iterations: settings.nlp_max_iterations,
  })
}

fn cost<P: NonlinearProblem>(problem: &P, x: &DVector<f64>) -> Result<f64, SolverError> {
  let value = problem
    .cost(x)
    .map_err(|e| SolverError::Objective(e.to_string()))?;
  if !value.is_finite() {
    return Err(SolverError::NonFinite(format!("objective evaluated to {value}")));
  }
  Ok(value)
}
