//! Core order book implementation

use common::{BookSnapshot, BookUpdate, Px, Qty, Symbol, Ts};
use std::collections::BTreeMap;

/// Error types for order book operations
///
/// `SequenceGap` and `CrossedBook` both mean the replica can no longer
/// be trusted; the caller must resynchronize from a fresh snapshot, not
/// retry the failed update.
#[derive(Debug, thiserror::Error)]
pub enum BookError {
    /// Update is ahead of the book; intermediate updates were missed
    #[error("sequence gap: expected next id {expected}, update starts at {got}")]
    SequenceGap {
        /// Next sequence ID the book expected
        expected: u64,
        /// First sequence ID the update carried
        got: u64,
    },

    /// Update is entirely behind the book; safe to skip
    #[error("stale update: final id {final_update_id} <= applied {last_update_id}")]
    StaleUpdate {
        /// Last sequence ID of the rejected update
        final_update_id: u64,
        /// Sequence ID the book is current as of
        last_update_id: u64,
    },

    /// Best bid crossed best ask after an update; feed corruption
    #[error("crossed book: bid {bid} >= ask {ask}")]
    CrossedBook {
        /// Best bid at the violation
        bid: Px,
        /// Best ask at the violation
        ask: Px,
    },

    /// A previous update crossed the book; a fresh snapshot is required
    #[error("book poisoned by an earlier crossed state; snapshot required")]
    Poisoned,
}

/// Full order book for a single symbol
///
/// Sides are price-keyed sorted maps, so "best" is the last bid key and
/// the first ask key, no duplicate prices can exist, and zero-quantity
/// levels are removed rather than stored.
#[derive(Debug, Clone)]
pub struct OrderBook {
    /// Symbol this book replicates
    pub symbol: Symbol,
    /// Timestamp of the last applied snapshot or update
    pub ts: Ts,
    bids: BTreeMap<Px, Qty>,
    asks: BTreeMap<Px, Qty>,
    last_update_id: u64,
    synced: bool,
    poisoned: bool,
}

impl OrderBook {
    /// Create a new empty order book
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            ts: Ts::from_nanos(0),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            synced: false,
            poisoned: false,
        }
    }

    /// Replace all state from a depth snapshot
    ///
    /// Clears any poison left by an earlier crossed state and
    /// establishes `last_update_id` from the snapshot. A snapshot that
    /// is itself crossed is rejected with `CrossedBook`: the book is
    /// left empty and unsynced so the caller can refetch.
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot, ts: Ts) -> Result<(), BookError> {
        self.bids.clear();
        self.asks.clear();
        for &(px, qty) in &snapshot.bids {
            if !qty.is_zero() {
                self.bids.insert(px, qty);
            }
        }
        for &(px, qty) in &snapshot.asks {
            if !qty.is_zero() {
                self.asks.insert(px, qty);
            }
        }
        if let (Some((bid, _)), Some((ask, _))) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                self.clear();
                return Err(BookError::CrossedBook { bid, ask });
            }
        }
        self.last_update_id = snapshot.last_update_id;
        self.ts = ts;
        self.synced = true;
        self.poisoned = false;
        Ok(())
    }

    /// Apply a sequenced incremental update
    ///
    /// Precondition: `first_update_id <= last_update_id + 1 <=
    /// final_update_id`. A stale update (entirely behind the book) and a
    /// gapped update (ahead of the book) both leave the book unchanged.
    /// A crossed book after a successful apply poisons the book until
    /// the next snapshot.
    pub fn apply_update(&mut self, update: &BookUpdate) -> Result<(), BookError> {
        if self.poisoned {
            return Err(BookError::Poisoned);
        }
        if update.final_update_id <= self.last_update_id {
            return Err(BookError::StaleUpdate {
                final_update_id: update.final_update_id,
                last_update_id: self.last_update_id,
            });
        }
        let expected = self.last_update_id + 1;
        if update.first_update_id > expected {
            return Err(BookError::SequenceGap {
                expected,
                got: update.first_update_id,
            });
        }

        for &(px, qty) in &update.bids {
            Self::set_level(&mut self.bids, px, qty);
        }
        for &(px, qty) in &update.asks {
            Self::set_level(&mut self.asks, px, qty);
        }
        self.last_update_id = update.final_update_id;
        self.ts = update.ts;

        if let (Some((bid, _)), Some((ask, _))) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                self.poisoned = true;
                return Err(BookError::CrossedBook { bid, ask });
            }
        }
        Ok(())
    }

    fn set_level(side: &mut BTreeMap<Px, Qty>, px: Px, qty: Qty) {
        if qty.is_zero() {
            side.remove(&px);
        } else {
            side.insert(px, qty);
        }
    }

    /// Best bid price and size
    #[must_use]
    pub fn best_bid(&self) -> Option<(Px, Qty)> {
        self.bids.iter().next_back().map(|(&p, &q)| (p, q))
    }

    /// Best ask price and size
    #[must_use]
    pub fn best_ask(&self) -> Option<(Px, Qty)> {
        self.asks.iter().next().map(|(&p, &q)| (p, q))
    }

    /// Mid price (average of best bid and ask)
    #[must_use]
    pub fn mid(&self) -> Option<Px> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => {
                Some(Px::from_i64((bid.as_i64() + ask.as_i64()) / 2))
            }
            _ => None,
        }
    }

    /// Microprice (size-weighted mid)
    #[must_use]
    pub fn microprice(&self) -> Option<Px> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid_px, bid_qty)), Some((ask_px, ask_qty))) => {
                let total = bid_qty.as_i64() + ask_qty.as_i64();
                if total > 0 {
                    let weighted =
                        bid_px.as_i64() * ask_qty.as_i64() + ask_px.as_i64() * bid_qty.as_i64();
                    Some(Px::from_i64(weighted / total))
                } else {
                    self.mid()
                }
            }
            _ => None,
        }
    }

    /// Spread in ticks
    #[must_use]
    pub fn spread_ticks(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask.as_i64() - bid.as_i64()),
            _ => None,
        }
    }

    /// Order book imbalance over the first `depth` levels per side
    ///
    /// Returns a value between -1.0 (all on ask) and 1.0 (all on bid).
    #[must_use]
    pub fn imbalance(&self, depth: usize) -> Option<f64> {
        let bid_qty: i64 = self
            .bids
            .values()
            .rev()
            .take(depth)
            .map(|q| q.as_i64())
            .sum();
        let ask_qty: i64 = self.asks.values().take(depth).map(|q| q.as_i64()).sum();
        let total = bid_qty + ask_qty;
        if total > 0 {
            Some((bid_qty - ask_qty) as f64 / total as f64)
        } else {
            None
        }
    }

    /// First `n` levels per side in book order (bids descending, asks
    /// ascending); read-only
    #[must_use]
    pub fn depth(&self, n: usize) -> (Vec<(Px, Qty)>, Vec<(Px, Qty)>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(&p, &q)| (p, q))
            .collect();
        let asks = self.asks.iter().take(n).map(|(&p, &q)| (p, q)).collect();
        (bids, asks)
    }

    /// Whether best bid >= best ask with both sides non-empty
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Sequence ID the book is current as of
    #[must_use]
    pub const fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Whether a snapshot has been applied since the last clear
    #[must_use]
    pub const fn is_synced(&self) -> bool {
        self.synced
    }

    /// Number of populated levels (bids, asks)
    #[must_use]
    pub fn level_counts(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Wipe the book back to its empty, unsynced state
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.ts = Ts::from_nanos(0);
        self.synced = false;
        self.poisoned = false;
    }
}
