//! Feed error types

use thiserror::Error;

/// Errors from the market-data feed
///
/// `Transport` and `Protocol` are absorbed by the reconnect path;
/// `SnapshotStale` and `RetriesExhausted` mean a retry budget ran out
/// and propagate to the process boundary as fatal.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network-level failure (connect, read timeout, closed stream)
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected message from the feed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Depth snapshot request failed
    #[error("snapshot fetch failed: {0}")]
    Snapshot(String),

    /// Snapshot refetch budget exhausted within one sync round
    #[error("snapshot still unusable after {attempts} attempts")]
    SnapshotStale {
        /// Fetch attempts made in the failed sync round
        attempts: u32,
    },

    /// Reconnect budget exhausted
    #[error("reconnect budget exhausted after {attempts} consecutive failures")]
    RetriesExhausted {
        /// Consecutive failed sessions
        attempts: u32,
    },
}
