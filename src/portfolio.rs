//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Covariance estimation, allocators, metrics and the strategy dispatcher.

pub mod config;
pub mod covariance;
pub mod data;
pub mod engine;
pub mod metrics;
pub mod optimizers;
pub mod solver;
pub mod types;

pub use config::OptimizationConfig;
pub use config::SolverSettings;
pub use covariance::correlation_matrix;
pub use covariance::estimate_covariance;
pub use covariance::exponential_covariance;
pub use covariance::ledoit_wolf_covariance;
pub use covariance::sample_covariance;
pub use covariance::CovarianceMatrix;
pub use data::ReturnPanel;
pub use engine::optimize;
pub use engine::OptimizationRequest;
pub use engine::PortfolioEngine;
pub use metrics::percentile;
pub use metrics::portfolio_metrics;
pub use optimizers::black_litterman::black_litterman;
pub use optimizers::black_litterman::black_litterman_posterior;
pub use optimizers::black_litterman::BlackLittermanPosterior;
pub use optimizers::hrp::hierarchical_risk_parity;
pub use optimizers::hrp::hrp_from_panel;
pub use optimizers::hrp::Dendrogram;
pub use optimizers::hrp::HrpAllocation;
pub use optimizers::hrp::MergeNode;
pub use optimizers::hrp::NodeRef;
pub use optimizers::mean_variance::mean_variance;
pub use optimizers::mean_variance::MeanVarianceParams;
pub use optimizers::mean_variance::TurnoverLimit;
pub use optimizers::risk_parity::risk_contributions;
pub use optimizers::risk_parity::risk_parity;
pub use optimizers::risk_parity::RiskParityProblem;
pub use solver::InteriorPointSolver;
pub use solver::LinearConstraints;
pub use solver::QuadraticProgram;
pub use solver::Solver;
pub use solver::SolverError;
pub use types::Component;
pub use types::CovarianceMethod;
pub use types::PortfolioMetrics;
pub use types::StrategyTag;
pub use types::View;
