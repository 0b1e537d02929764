//! Market-making engine
//!
//! Consumes the book views published by the feed pipeline, maintains a
//! rolling volatility estimate, and keeps a bid/ask quote pair alive
//! against a pluggable execution adapter at a bounded cadence.

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod execution;
pub mod quoting;
pub mod volatility;

pub use config::MakerConfig;
pub use execution::{ExecutionClient, ExecutionError, SimExecutionClient};
pub use quoting::{FixedSize, Quote, QuoteConfig, QuotingEngine, SizingPolicy};
pub use volatility::{run_estimator, VolatilityConfig, VolatilityEstimator};
