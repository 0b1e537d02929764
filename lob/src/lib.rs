//! Limit order book replica
//!
//! Applies depth snapshots and sequenced incremental updates, detects
//! sequence gaps and crossed books, and exposes top-of-book and depth
//! queries. Reads never go through the mutable book directly: the
//! synchronizer captures an immutable [`BookView`] after each apply.

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod book;
pub mod view;

pub use book::{BookError, OrderBook};
pub use view::BookView;
