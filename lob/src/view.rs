//! Immutable book views for readers
//!
//! The synchronizer is the book's only writer. After each apply it
//! captures a [`BookView`] and publishes it behind an `Arc`; the
//! volatility and quoting paths only ever read these, so they see either
//! the pre-update or the fully-post-update book, never a torn state.

use crate::book::OrderBook;
use common::{Px, Qty, Symbol, Ts};
use std::time::Duration;

/// Point-in-time, read-only snapshot of the book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookView {
    /// Symbol the view belongs to
    pub symbol: Symbol,
    /// When the view was captured
    pub ts: Ts,
    /// Sequence ID the view is current as of
    pub last_update_id: u64,
    /// Best bid, if the side is non-empty
    pub bid: Option<(Px, Qty)>,
    /// Best ask, if the side is non-empty
    pub ask: Option<(Px, Qty)>,
    /// Top bid levels, best first
    pub bids: Vec<(Px, Qty)>,
    /// Top ask levels, best first
    pub asks: Vec<(Px, Qty)>,
}

impl BookView {
    /// Capture a view of the first `levels` price levels per side
    #[must_use]
    pub fn capture(book: &OrderBook, levels: usize, ts: Ts) -> Self {
        let (bids, asks) = book.depth(levels);
        Self {
            symbol: book.symbol,
            ts,
            last_update_id: book.last_update_id(),
            bid: book.best_bid(),
            ask: book.best_ask(),
            bids,
            asks,
        }
    }

    /// Whether both sides have at least one level
    #[must_use]
    pub const fn has_both_sides(&self) -> bool {
        self.bid.is_some() && self.ask.is_some()
    }

    /// Mid price as a float, if both sides are present
    #[must_use]
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some((bid, _)), Some((ask, _))) => Some((bid.as_f64() + ask.as_f64()) / 2.0),
            _ => None,
        }
    }

    /// Age of the view relative to `now`
    #[must_use]
    pub fn age(&self, now: Ts) -> Duration {
        self.ts.elapsed_since(now)
    }
}
