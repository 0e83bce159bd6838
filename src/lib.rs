//! # portfolio-rs
//!
//! $$
//! \mathbf{w}^\* = \arg\max_{\mathbf{w}\in\mathcal{W}} \frac{\hat\mu^\top\mathbf{w}-r_f}{\sqrt{\mathbf{w}^\top\hat\Sigma\mathbf{w}}}
//! $$
//!
//! Forecast-and-optimize pipeline. A cleaned price matrix is fanned out per asset into a
//! ladder of forecasting models, the resulting expected-return vector is (optionally)
//! blended with a market-implied prior, and a long-only capped efficient-frontier solve
//! produces the final weights.
//!
//! Stages, leaves first:
//!
//! - [`market`]: chunked acquisition and sanitization of a [`market::PriceMatrix`].
//! - [`forecast`]: autoregressive / recurrent / boosted-tree ensemble, lightweight fallback
//!   and historical CAGR estimators.
//! - [`scheduler`]: batched worker pool with a memory governor.
//! - [`portfolio`]: shrinkage covariance, Black-Litterman blending and the frontier solver.
//! - [`pipeline`]: the orchestrator tying everything together behind [`pipeline::Pipeline`].

pub mod config;
pub mod error;
pub mod forecast;
pub mod market;
pub mod pipeline;
pub mod portfolio;
pub mod scheduler;
pub mod stats;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::OptimizationRequest;
pub use pipeline::OptimizationResult;
pub use pipeline::Pipeline;
