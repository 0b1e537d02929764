//! Resilient WebSocket transport for the depth stream
//!
//! Owns one streaming session and the connection-lifecycle state
//! machine. Every state transition is delivered in-band on the same
//! channel as the data, so the synchronizer always learns about a lost
//! session before it sees any data from the next one.

use crate::binance::parse_depth_frame;
use crate::error::FeedError;
use common::{BookUpdate, ConnectionState, EventBus, MakerEvent};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Exponential backoff with jitter for reconnect attempts
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Ceiling on the delay
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Jitter factor (0.2 = up to ±20% of the delay)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(63) as i32);
        let raw = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + self.jitter * rand::thread_rng().gen_range(-1.0..=1.0);
            raw * factor
        } else {
            raw
        };
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket base URL, e.g. `wss://stream.binance.com:9443`
    pub ws_url: String,
    /// Stream name, e.g. `btcusdt@depth@100ms`
    pub stream: String,
    /// A session with no frame for this long is considered dead
    pub read_timeout: Duration,
    /// Reconnect backoff policy
    pub backoff: BackoffPolicy,
    /// Consecutive session failures tolerated before giving up
    pub max_reconnects: u32,
}

impl FeedConfig {
    /// Config for one symbol's depth stream against the given endpoint
    pub fn depth_stream(ws_url: impl Into<String>, symbol: &str) -> Self {
        Self {
            ws_url: ws_url.into(),
            stream: format!("{}@depth@100ms", symbol.to_lowercase()),
            read_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            max_reconnects: 5,
        }
    }

    fn stream_url(&self) -> String {
        format!("{}/ws/{}", self.ws_url, self.stream)
    }
}

/// Message delivered from the transport to the synchronizer
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Connection lifecycle transition
    StateChange(ConnectionState),
    /// Normalized depth update
    Update(BookUpdate),
}

/// One resilient streaming connection to the market-data source
pub struct FeedTransport {
    config: FeedConfig,
    events: EventBus,
    state: ConnectionState,
    /// Set by the synchronizer once the book is reconciled; drives the
    /// Syncing <-> Live transitions
    synced: watch::Receiver<bool>,
}

impl FeedTransport {
    /// Create a transport in the `Disconnected` state
    pub fn new(config: FeedConfig, events: EventBus, synced: watch::Receiver<bool>) -> Self {
        Self {
            config,
            events,
            state: ConnectionState::Disconnected,
            synced,
        }
    }

    /// Run the connect/stream/reconnect loop until the downstream
    /// channel closes (shutdown) or the retry budget is exhausted
    pub async fn run(mut self, tx: mpsc::Sender<FeedEvent>) -> Result<(), FeedError> {
        let mut failures: u32 = 0;
        loop {
            match self.session(&tx, &mut failures).await {
                Ok(()) => {
                    // Downstream hung up: orderly shutdown
                    info!("feed transport shutting down");
                    let _ = self.set_state(ConnectionState::Disconnected, &tx).await;
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "feed session ended");
                    if !self.set_state(ConnectionState::Degraded, &tx).await {
                        return Ok(());
                    }
                    failures += 1;
                    if failures > self.config.max_reconnects {
                        error!(attempts = failures, "reconnect budget exhausted");
                        return Err(FeedError::RetriesExhausted { attempts: failures });
                    }
                    let delay = self.config.backoff.delay(failures);
                    debug!(?delay, attempt = failures, "backing off before reconnect");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One session: connect, attach the stream, pump frames
    ///
    /// `Ok(())` means the downstream receiver is gone (shutdown); any
    /// fault comes back as an error for the reconnect loop.
    async fn session(
        &mut self,
        tx: &mpsc::Sender<FeedEvent>,
        failures: &mut u32,
    ) -> Result<(), FeedError> {
        if !self.set_state(ConnectionState::Connecting, tx).await {
            return Ok(());
        }
        let url = self.config.stream_url();
        debug!(%url, "connecting to depth stream");
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        // Stream attached; the synchronizer must now fetch a snapshot
        if !self.set_state(ConnectionState::Syncing, tx).await {
            return Ok(());
        }

        loop {
            let synced = *self.synced.borrow();
            match (self.state, synced) {
                (ConnectionState::Syncing, true) => {
                    if !self.set_state(ConnectionState::Live, tx).await {
                        return Ok(());
                    }
                }
                (ConnectionState::Live, false) => {
                    // Synchronizer invalidated the book (gap/crossed)
                    if !self.set_state(ConnectionState::Syncing, tx).await {
                        return Ok(());
                    }
                }
                _ => {}
            }

            let frame = tokio::select! {
                changed = self.synced.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                frame = tokio::time::timeout(self.config.read_timeout, read.next()) => frame,
            };

            let msg = match frame {
                Err(_) => {
                    return Err(FeedError::Transport(format!(
                        "no frame within {:?}",
                        self.config.read_timeout
                    )));
                }
                Ok(None) => return Err(FeedError::Transport("stream ended".into())),
                Ok(Some(Err(e))) => return Err(FeedError::Transport(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => match parse_depth_frame(&text)? {
                    Some(update) => {
                        *failures = 0;
                        if tx.send(FeedEvent::Update(update)).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => debug!("ignoring non-data frame"),
                },
                Message::Ping(data) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| FeedError::Transport(e.to_string()))?;
                }
                Message::Close(_) => {
                    return Err(FeedError::Transport("closed by server".into()));
                }
                _ => {}
            }
        }
    }

    async fn set_state(&mut self, state: ConnectionState, tx: &mpsc::Sender<FeedEvent>) -> bool {
        if self.state == state {
            return true;
        }
        info!(from = %self.state, to = %state, "connection state transition");
        self.state = state;
        self.events.publish(MakerEvent::Connection(state));
        tx.send(FeedEvent::StateChange(state)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        // Capped at the ceiling no matter how many failures
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        };
        for attempt in 1..=8 {
            let delay = policy.delay(attempt);
            let nominal = Duration::from_secs(1).as_secs_f64()
                * 2.0_f64.powi(attempt as i32 - 1);
            let nominal = nominal.min(30.0);
            assert!(delay.as_secs_f64() >= nominal * 0.8 - 1e-9);
            assert!(delay.as_secs_f64() <= 30.0 + 1e-9);
        }
    }

    #[test]
    fn test_depth_stream_config() {
        let config = FeedConfig::depth_stream("wss://stream.binance.com:9443", "BTCUSDT");
        assert_eq!(config.stream, "btcusdt@depth@100ms");
        assert_eq!(
            config.stream_url(),
            "wss://stream.binance.com:9443/ws/btcusdt@depth@100ms"
        );
    }
}
