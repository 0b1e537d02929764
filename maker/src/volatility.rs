//! Rolling mid-price volatility
//!
//! Keeps a time-bounded window of observed mids and estimates
//! volatility as the standard deviation of their log-returns. The
//! estimate gates quoting: until the window holds enough samples the
//! estimator reports `None` and the engine skips the tick instead of
//! quoting a spread computed from noise.

use common::Ts;
use lob::BookView;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Estimator configuration
#[derive(Debug, Clone)]
pub struct VolatilityConfig {
    /// How far back observations count toward the estimate
    pub window: Duration,
    /// Minimum observations before an estimate is reported
    pub min_samples: usize,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_samples: 20,
        }
    }
}

/// Rolling-window volatility estimator over mid prices
#[derive(Debug)]
pub struct VolatilityEstimator {
    config: VolatilityConfig,
    /// Observations ordered by timestamp, oldest first
    samples: VecDeque<(Ts, f64)>,
}

impl VolatilityEstimator {
    /// Create an empty estimator
    #[must_use]
    pub fn new(config: VolatilityConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    /// Record a mid-price observation and evict expired samples
    ///
    /// Non-finite and non-positive mids are rejected: a log-return over
    /// them is meaningless and one bad sample would poison the window.
    pub fn observe(&mut self, ts: Ts, mid: f64) {
        if !mid.is_finite() || mid <= 0.0 {
            debug!(mid, "rejecting degenerate mid observation");
            return;
        }
        self.samples.push_back((ts, mid));
        let horizon = self.config.window.as_nanos() as u64;
        let cutoff = ts.as_nanos().saturating_sub(horizon);
        while let Some((front_ts, _)) = self.samples.front() {
            if front_ts.as_nanos() >= cutoff {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Current estimate: stddev of log-returns over the window
    ///
    /// `None` until the window holds at least `min_samples`
    /// observations.
    #[must_use]
    pub fn current(&self) -> Option<f64> {
        if self.samples.len() < self.config.min_samples.max(2) {
            return None;
        }
        let returns: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|((_, prev), (_, next))| (next / prev).ln())
            .collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        Some(variance.sqrt())
    }

    /// Discard all samples
    ///
    /// Called when the book is invalidated: mids on either side of a
    /// resync are not a continuous series.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Number of samples currently in the window
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Feed book views into the estimator and publish the rolling estimate
///
/// Runs until the view channel closes. Publishes `None` whenever the
/// book is invalidated so the quoting engine stops trusting the old
/// estimate at the same moment it stops trusting the book.
pub async fn run_estimator(
    mut estimator: VolatilityEstimator,
    mut views: watch::Receiver<Option<Arc<BookView>>>,
    vol_tx: watch::Sender<Option<f64>>,
) {
    loop {
        if views.changed().await.is_err() {
            info!("volatility estimator shutting down");
            return;
        }
        let view = views.borrow_and_update().clone();
        match view {
            Some(view) => {
                if let Some(mid) = view.mid() {
                    estimator.observe(view.ts, mid);
                    let _ = vol_tx.send(estimator.current());
                }
            }
            None => {
                estimator.reset();
                let _ = vol_tx.send(None);
            }
        }
    }
}
