//! # Portfolio
//!
//! $$
//! \max_{\mathbf w}\ \frac{\mu^\top\mathbf w - r_f}{\sqrt{\mathbf w^\top\Sigma\mathbf w}}
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w = 1,\ 0 \le w_i \le c
//! $$
//!
//! Shrinkage covariance, Black-Litterman blending and the capped efficient-frontier solver.

pub mod black_litterman;
pub mod data;
pub mod engine;
pub mod frontier;
pub mod types;

pub use data::CovarianceEstimate;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use frontier::EfficientFrontier;
pub use types::Constraints;
pub use types::Objective;
pub use types::PortfolioResult;
pub use types::PriorMethod;
pub use types::SolverError;
