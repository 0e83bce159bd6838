//! # Market Data
//!
//! $$
//! \mathcal U \xrightarrow{\ \text{fetch}\ } P \xrightarrow{\ \text{sanitize}\ } P^{\text{clean}}
//! $$
//!
//! Universe resolution, chunked acquisition and sanitization of a [`PriceMatrix`]. The set
//! of assets surviving [`sanitize`] is authoritative for every downstream structure.

pub mod acquisition;
pub mod matrix;
pub mod sanitize;
pub mod source;
pub mod universe;

pub use acquisition::Acquirer;
pub use matrix::PriceMatrix;
pub use sanitize::Sanitized;
pub use sanitize::sanitize;
pub use source::MarketCapSource;
pub use source::MarketDataSource;
pub use source::StaticCaps;
pub use source::StaticSource;
pub use universe::resolve;
pub use universe::sanitize_tickers;
