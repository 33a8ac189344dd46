//! # portfolio-rs
//!
//! $$
//! \mathbf w^\* = \arg\min_{\mathbf w \in \mathcal W}\ f(\mathbf w;\ \Sigma, \mu)
//! $$
//!
//! Stateless portfolio optimization: covariance estimation, mean-variance,
//! risk parity, hierarchical risk parity and Black-Litterman allocation, with
//! a risk and performance summary for every result.

pub mod error;
pub mod portfolio;

pub use error::OptimizationError;
pub use error::Result;
pub use portfolio::optimize;
pub use portfolio::OptimizationConfig;
pub use portfolio::PortfolioEngine;
pub use portfolio::PortfolioMetrics;
pub use portfolio::ReturnPanel;
pub use portfolio::StrategyTag;
pub use portfolio::View;
