//! Service-level configuration
//!
//! Aggregates the per-component configs so the binary wires everything
//! from one place.

use crate::quoting::QuoteConfig;
use crate::volatility::VolatilityConfig;
use feeds::SyncConfig;

/// Everything the maker service needs to start
#[derive(Debug, Clone)]
pub struct MakerConfig {
    /// Venue symbol, e.g. `BTCUSDT`
    pub symbol: String,
    /// WebSocket endpoint for the depth stream
    pub ws_url: String,
    /// REST endpoint for depth snapshots
    pub api_url: String,
    /// Price levels requested per snapshot
    pub snapshot_depth: u32,
    /// Synchronizer settings
    pub sync: SyncConfig,
    /// Volatility estimator settings
    pub volatility: VolatilityConfig,
    /// Quoting engine settings
    pub quoting: QuoteConfig,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            ws_url: "wss://stream.binance.com:9443".to_string(),
            api_url: "https://api.binance.com".to_string(),
            snapshot_depth: 1000,
            sync: SyncConfig::default(),
            volatility: VolatilityConfig::default(),
            quoting: QuoteConfig::default(),
        }
    }
}
