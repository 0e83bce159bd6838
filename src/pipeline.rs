//! # Pipeline
//!
//! $$
//! \text{request} \to \mathcal U \to P \to (\hat\mu,\hat u) \to (\mu,\Sigma) \to \mathbf w^\*
//! $$
//!
//! Request and result types, the memoizing cache, the portfolio store, progress staging and
//! the [`Pipeline`] orchestrator itself.

pub mod cache;
pub mod orchestrator;
pub mod progress;
pub mod request;
pub mod store;

pub use cache::CacheStats;
pub use cache::MemoryCache;
pub use cache::NoCache;
pub use cache::ResultCache;
pub use orchestrator::Pipeline;
pub use progress::ProgressCallback;
pub use request::OptimizationRequest;
pub use request::OptimizationResult;
pub use store::JsonFileStore;
pub use store::PortfolioMetadata;
pub use store::PortfolioStore;
pub use store::SavedPortfolio;
