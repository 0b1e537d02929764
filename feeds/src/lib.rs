//! Market-data feed: resilient transport and book synchronization
//!
//! - `transport`: one WebSocket session with the connection-lifecycle
//!   state machine and reconnect/backoff policy
//! - `binance`: exchange wire shapes and their normalization
//! - `snapshot`: the on-demand depth snapshot seam
//! - `sync`: reconciles snapshot + buffered updates into the book and
//!   publishes immutable views for readers

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod binance;
pub mod error;
pub mod snapshot;
pub mod sync;
pub mod transport;

pub use binance::{DepthSnapshot, DepthUpdate};
pub use error::FeedError;
pub use snapshot::{RestSnapshots, SnapshotSource};
pub use sync::{SyncConfig, Synchronizer};
pub use transport::{BackoffPolicy, FeedConfig, FeedEvent, FeedTransport};
