//! Depth snapshot source
//!
//! The synchronizer requests snapshots through this seam, so tests can
//! script them and the exchange REST details stay at the boundary.

use crate::binance::DepthSnapshot;
use crate::error::FeedError;
use async_trait::async_trait;
use common::BookSnapshot;
use tracing::debug;

/// On-demand depth snapshot provider
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetch a fresh full-depth snapshot
    async fn fetch(&self) -> Result<BookSnapshot, FeedError>;
}

/// REST-backed snapshot source (`GET /api/v3/depth`)
pub struct RestSnapshots {
    client: reqwest::Client,
    api_url: String,
    symbol: String,
    depth_limit: u32,
}

impl RestSnapshots {
    /// Snapshot source for one symbol against the given REST endpoint
    pub fn new(api_url: impl Into<String>, symbol: &str, depth_limit: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            symbol: symbol.to_uppercase(),
            depth_limit,
        }
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshots {
    async fn fetch(&self) -> Result<BookSnapshot, FeedError> {
        let url = format!("{}/api/v3/depth", self.api_url);
        debug!(%url, symbol = %self.symbol, "fetching depth snapshot");
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", self.symbol.clone()),
                ("limit", self.depth_limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Snapshot(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Snapshot(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let snapshot: DepthSnapshot = response
            .json()
            .await
            .map_err(|e| FeedError::Snapshot(e.to_string()))?;
        snapshot.normalize()
    }
}
