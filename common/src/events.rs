//! Structured observability events
//!
//! The core emits events; it does not own log storage. Subscribers
//! (logger task, metrics exporters) drain the bus at their own pace,
//! and a lagging subscriber drops events rather than stalling the
//! emitting path.

use crate::{ConnectionState, Px, Qty};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a quoting tick issued no quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// No book view has been published yet (or it was invalidated)
    NoBook,
    /// The book is missing one or both sides
    EmptySide,
    /// The latest book view is older than the staleness bound
    StaleBook,
    /// The volatility estimator has insufficient data
    NoVolatility,
}

/// Event emitted by the market-making core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MakerEvent {
    /// Connection lifecycle transition
    Connection(ConnectionState),
    /// A depth snapshot was applied to the book
    SnapshotApplied {
        /// Sequence ID the book is current as of
        last_update_id: u64,
    },
    /// An update arrived out of sequence; the book will be resynced
    SequenceGap {
        /// Next sequence ID the book expected
        expected: u64,
        /// First sequence ID the update carried
        got: u64,
    },
    /// The book crossed after an update; data-integrity event
    CrossedBook {
        /// Best bid at the time of the violation
        bid: Px,
        /// Best ask at the time of the violation
        ask: Px,
    },
    /// The synchronizer discarded book state and started a fresh round
    SyncRestarted {
        /// What triggered the restart
        reason: String,
    },
    /// A new quote generation was placed at the execution adapter
    QuoteIssued {
        /// Monotonically increasing quote generation
        generation: u64,
        /// Quoted bid price
        bid_px: Px,
        /// Quoted bid size
        bid_qty: Qty,
        /// Quoted ask price
        ask_px: Px,
        /// Quoted ask size
        ask_qty: Qty,
    },
    /// A superseded quote generation was cancelled
    QuoteCancelled {
        /// Generation that was cancelled
        generation: u64,
    },
    /// Quoting stopped after exhausting execution retries
    QuotingPaused {
        /// Consecutive ticks that failed before pausing
        consecutive_failures: u32,
    },
    /// Quoting resumed after a pause cooldown
    QuotingResumed,
    /// A quoting tick was skipped instead of quoting on bad data
    TickSkipped {
        /// Why the tick issued nothing
        reason: SkipReason,
    },
}

/// Broadcast bus for [`MakerEvent`]s
///
/// Thin wrapper so publishers never block and never fail the hot path:
/// publishing with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MakerEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: MakerEvent) {
        // Err here only means no subscribers are listening
        let _ = self.tx.send(event);
    }

    /// Subscribe to events from this point on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MakerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
