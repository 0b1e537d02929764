//! Shared domain types for the market-making core

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod market;
pub mod types;

pub use events::{EventBus, MakerEvent, SkipReason};
pub use market::{BookSnapshot, BookUpdate};
pub use types::{ConnectionState, OrderId, Px, Qty, Side, Symbol, Ts};
