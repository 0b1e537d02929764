//! Binance wire shapes and normalization
//!
//! Parsing happens entirely at this boundary; everything downstream
//! works with the normalized `common` messages.

use crate::error::FeedError;
use common::{BookSnapshot, BookUpdate, Px, Qty, Ts};
use serde::Deserialize;

/// Binance depth update message (`depthUpdate` stream event)
#[derive(Debug, Deserialize)]
pub struct DepthUpdate {
    /// Event type, always `depthUpdate`
    #[serde(rename = "e")]
    pub event_type: String,
    /// Event time in milliseconds
    #[serde(rename = "E")]
    pub event_time: u64,
    /// Symbol name
    #[serde(rename = "s")]
    pub symbol: String,
    /// First update ID in this event
    #[serde(rename = "U")]
    pub first_update_id: u64,
    /// Final update ID in this event
    #[serde(rename = "u")]
    pub final_update_id: u64,
    /// Bid deltas as (price, qty) decimal strings
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    /// Ask deltas as (price, qty) decimal strings
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Binance depth snapshot (REST `/api/v3/depth`)
#[derive(Debug, Deserialize)]
pub struct DepthSnapshot {
    /// Sequence ID the snapshot is current as of
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    /// Bid levels as (price, qty) decimal strings
    pub bids: Vec<[String; 2]>,
    /// Ask levels as (price, qty) decimal strings
    pub asks: Vec<[String; 2]>,
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<(Px, Qty)>, FeedError> {
    raw.iter()
        .map(|[price, qty]| {
            let price: f64 = price
                .parse()
                .map_err(|e| FeedError::Protocol(format!("bad price {price:?}: {e}")))?;
            let qty: f64 = qty
                .parse()
                .map_err(|e| FeedError::Protocol(format!("bad qty {qty:?}: {e}")))?;
            Ok((Px::new(price), Qty::new(qty)))
        })
        .collect()
}

impl DepthUpdate {
    /// Convert to the normalized book update
    pub fn normalize(&self) -> Result<BookUpdate, FeedError> {
        Ok(BookUpdate {
            ts: Ts::from_millis(self.event_time),
            first_update_id: self.first_update_id,
            final_update_id: self.final_update_id,
            bids: parse_levels(&self.bids)?,
            asks: parse_levels(&self.asks)?,
        })
    }
}

impl DepthSnapshot {
    /// Convert to the normalized book snapshot
    pub fn normalize(&self) -> Result<BookSnapshot, FeedError> {
        Ok(BookSnapshot {
            last_update_id: self.last_update_id,
            bids: parse_levels(&self.bids)?,
            asks: parse_levels(&self.asks)?,
        })
    }
}

/// Parse one WebSocket text frame into a normalized update
///
/// Handles both the raw `/ws/<stream>` shape and the combined `/stream`
/// wrapper. Subscription acks yield `Ok(None)`; malformed JSON and
/// unknown event types are protocol errors (degraded-connection
/// trigger, never a panic).
pub fn parse_depth_frame(text: &str) -> Result<Option<BookUpdate>, FeedError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("invalid json: {e}")))?;
    let payload = match value.get("data") {
        Some(data) => data.clone(),
        None => value,
    };

    match payload.get("e").and_then(|e| e.as_str()) {
        Some("depthUpdate") => {
            let depth: DepthUpdate = serde_json::from_value(payload)
                .map_err(|e| FeedError::Protocol(format!("bad depthUpdate: {e}")))?;
            depth.normalize().map(Some)
        }
        Some(other) => Err(FeedError::Protocol(format!("unexpected event type {other:?}"))),
        // Subscription/command acks carry no event type
        None if payload.get("result").is_some() || payload.get("id").is_some() => Ok(None),
        None => Err(FeedError::Protocol("message without event type".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH_FRAME: &str = r#"{
        "e": "depthUpdate", "E": 1700000000123, "s": "BTCUSDT",
        "U": 11, "u": 12,
        "b": [["64000.10", "0.5"], ["63999.00", "0"]],
        "a": [["64001.00", "1.25"]]
    }"#;

    #[test]
    fn test_parse_depth_frame() {
        let update = parse_depth_frame(DEPTH_FRAME).unwrap().unwrap();
        assert_eq!(update.first_update_id, 11);
        assert_eq!(update.final_update_id, 12);
        assert_eq!(update.ts, Ts::from_millis(1700000000123));
        assert_eq!(update.bids[0], (Px::new(64000.10), Qty::new(0.5)));
        assert!(update.bids[1].1.is_zero());
        assert_eq!(update.asks.len(), 1);
    }

    #[test]
    fn test_parse_combined_stream_wrapper() {
        let framed = format!(r#"{{"stream":"btcusdt@depth","data":{DEPTH_FRAME}}}"#);
        let update = parse_depth_frame(&framed).unwrap().unwrap();
        assert_eq!(update.final_update_id, 12);
    }

    #[test]
    fn test_subscription_ack_is_ignored() {
        assert!(parse_depth_frame(r#"{"result":null,"id":1}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        assert!(matches!(
            parse_depth_frame("{not json"),
            Err(FeedError::Protocol(_))
        ));
    }

    #[test]
    fn test_unexpected_event_type_is_protocol_error() {
        assert!(matches!(
            parse_depth_frame(r#"{"e":"trade","E":1,"s":"BTCUSDT"}"#),
            Err(FeedError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_decimal_is_protocol_error() {
        let frame = r#"{"e":"depthUpdate","E":1,"s":"X","U":1,"u":1,"b":[["oops","1"]],"a":[]}"#;
        assert!(matches!(
            parse_depth_frame(frame),
            Err(FeedError::Protocol(_))
        ));
    }

    #[test]
    fn test_snapshot_normalize() {
        let raw: DepthSnapshot = serde_json::from_str(
            r#"{"lastUpdateId":10,"bids":[["100.0","2"]],"asks":[["101.0","2"]]}"#,
        )
        .unwrap();
        let snapshot = raw.normalize().unwrap();
        assert_eq!(snapshot.last_update_id, 10);
        assert_eq!(snapshot.bids[0], (Px::new(100.0), Qty::new(2.0)));
    }
}
