//! Execution adapter seam
//!
//! The quoting engine talks to venues through [`ExecutionClient`]; the
//! in-process [`SimExecutionClient`] backs tests and dry runs.

use async_trait::async_trait;
use common::{OrderId, Px, Qty, Side};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Execution failures, split by whether a retry can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The venue refused the request; retrying the same request is
    /// pointless
    #[error("order rejected: {reason}")]
    Rejected {
        /// Venue-supplied rejection reason
        reason: String,
    },
    /// A transient fault (timeout, disconnect); the request may succeed
    /// on retry
    #[error("transient execution failure: {reason}")]
    Transient {
        /// What went wrong
        reason: String,
    },
}

/// Venue-facing order operations used by the quoting engine
#[async_trait]
pub trait ExecutionClient: Send + Sync + 'static {
    /// Place a resting limit order; returns the venue-assigned ID
    async fn place_order(&self, side: Side, px: Px, qty: Qty) -> Result<OrderId, ExecutionError>;

    /// Cancel a resting order
    async fn cancel_order(&self, id: OrderId) -> Result<(), ExecutionError>;

    /// Atomically replace a resting order's price and size
    async fn replace_order(&self, id: OrderId, px: Px, qty: Qty)
        -> Result<OrderId, ExecutionError>;
}

/// A resting order held by the simulated venue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOrder {
    /// Order side
    pub side: Side,
    /// Limit price
    pub px: Px,
    /// Order size
    pub qty: Qty,
}

/// In-process execution venue
///
/// Accepts well-formed orders immediately and tracks the open set, so
/// tests can assert on exactly what is resting after a sequence of
/// quoting decisions.
#[derive(Debug, Default)]
pub struct SimExecutionClient {
    next_id: AtomicU64,
    open: Mutex<HashMap<OrderId, SimOrder>>,
}

impl SimExecutionClient {
    /// Create an empty simulated venue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the currently resting orders
    #[must_use]
    pub fn open_orders(&self) -> Vec<(OrderId, SimOrder)> {
        match self.open.lock() {
            Ok(open) => {
                let mut orders: Vec<_> = open.iter().map(|(id, o)| (*id, *o)).collect();
                orders.sort_by_key(|(id, _)| id.as_u64());
                orders
            }
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ExecutionClient for SimExecutionClient {
    async fn place_order(&self, side: Side, px: Px, qty: Qty) -> Result<OrderId, ExecutionError> {
        if !px.is_positive() {
            return Err(ExecutionError::Rejected {
                reason: format!("non-positive price {px}"),
            });
        }
        if qty.is_zero() {
            return Err(ExecutionError::Rejected {
                reason: "zero quantity".to_string(),
            });
        }
        let id = OrderId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        if let Ok(mut open) = self.open.lock() {
            open.insert(id, SimOrder { side, px, qty });
        }
        debug!(%id, %side, %px, %qty, "sim order placed");
        Ok(id)
    }

    async fn cancel_order(&self, id: OrderId) -> Result<(), ExecutionError> {
        let removed = self
            .open
            .lock()
            .ok()
            .and_then(|mut open| open.remove(&id));
        match removed {
            Some(_) => {
                debug!(%id, "sim order cancelled");
                Ok(())
            }
            None => Err(ExecutionError::Rejected {
                reason: format!("unknown order {id}"),
            }),
        }
    }

    async fn replace_order(
        &self,
        id: OrderId,
        px: Px,
        qty: Qty,
    ) -> Result<OrderId, ExecutionError> {
        let side = {
            let removed = self
                .open
                .lock()
                .ok()
                .and_then(|mut open| open.remove(&id));
            match removed {
                Some(order) => order.side,
                None => {
                    return Err(ExecutionError::Rejected {
                        reason: format!("unknown order {id}"),
                    })
                }
            }
        };
        self.place_order(side, px, qty).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_place_and_cancel() {
        let venue = SimExecutionClient::new();
        let id = venue
            .place_order(Side::Bid, Px::new(100.0), Qty::new(1.0))
            .await
            .unwrap();
        assert_eq!(venue.open_orders().len(), 1);
        venue.cancel_order(id).await.unwrap();
        assert!(venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_rejected() {
        let venue = SimExecutionClient::new();
        let err = venue.cancel_order(OrderId::new(99)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_degenerate_orders_are_rejected() {
        let venue = SimExecutionClient::new();
        assert!(venue
            .place_order(Side::Bid, Px::ZERO, Qty::new(1.0))
            .await
            .is_err());
        assert!(venue
            .place_order(Side::Ask, Px::new(100.0), Qty::ZERO)
            .await
            .is_err());
        assert!(venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_replace_keeps_side_and_swaps_terms() {
        let venue = SimExecutionClient::new();
        let id = venue
            .place_order(Side::Ask, Px::new(101.0), Qty::new(1.0))
            .await
            .unwrap();
        let new_id = venue
            .replace_order(id, Px::new(102.0), Qty::new(2.0))
            .await
            .unwrap();
        assert_ne!(id, new_id);
        let orders = venue.open_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(
            orders[0].1,
            SimOrder {
                side: Side::Ask,
                px: Px::new(102.0),
                qty: Qty::new(2.0),
            }
        );
    }
}
