//! Normalized market-data messages
//!
//! Exchange wire encodings are parsed at the feed boundary into these
//! shapes; everything past that boundary is encoding-agnostic.

use crate::{Px, Qty, Ts};
use serde::{Deserialize, Serialize};

/// Incremental depth update bounded by exchange sequence IDs
///
/// Each `(price, qty)` entry is an absolute replacement of that price
/// level; a zero quantity removes the level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpdate {
    /// Exchange event timestamp
    pub ts: Ts,
    /// First sequence ID covered by this update
    pub first_update_id: u64,
    /// Last sequence ID covered by this update
    pub final_update_id: u64,
    /// Bid-side level replacements
    pub bids: Vec<(Px, Qty)>,
    /// Ask-side level replacements
    pub asks: Vec<(Px, Qty)>,
}

/// Full point-in-time depth snapshot used to (re)initialize the book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Sequence ID the snapshot is current as of
    pub last_update_id: u64,
    /// Bid levels, best first
    pub bids: Vec<(Px, Qty)>,
    /// Ask levels, best first
    pub asks: Vec<(Px, Qty)>,
}
