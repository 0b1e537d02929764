//! Quoting engine
//!
//! On a fixed timer it reads the latest book view and volatility
//! estimate, computes a volatility-scaled two-sided quote around the
//! mid, and reconciles the resting quote pair against it: hold when the
//! move is inside the requote threshold, otherwise cancel the old
//! generation and place the new one. Execution faults are retried a
//! bounded number of times; when the budget runs out the engine pauses
//! itself for a cooldown instead of hammering the venue.

use crate::execution::{ExecutionClient, ExecutionError};
use common::{EventBus, MakerEvent, OrderId, Px, Qty, Side, SkipReason, Ts};
use lob::BookView;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Quoting engine configuration
#[derive(Debug, Clone)]
pub struct QuoteConfig {
    /// Spread fraction of mid at zero volatility
    pub base_spread: f64,
    /// Lower clamp on the spread fraction
    pub min_spread: f64,
    /// Upper clamp on the spread fraction
    pub max_spread: f64,
    /// How strongly volatility widens the spread
    pub vol_multiplier: f64,
    /// Relative price move below which the resting quote is held
    pub requote_threshold: f64,
    /// Quoting timer period
    pub tick_period: Duration,
    /// Book views older than this are not quoted on
    pub max_view_age: Duration,
    /// Attempts per execution operation before giving up
    pub max_retries: u32,
    /// Base delay between execution retries
    pub retry_backoff: Duration,
    /// How long the engine stays paused after exhausting retries
    pub pause_cooldown: Duration,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            base_spread: 0.002,
            min_spread: 0.001,
            max_spread: 0.01,
            vol_multiplier: 100.0,
            requote_threshold: 0.0001,
            tick_period: Duration::from_millis(500),
            max_view_age: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
            pause_cooldown: Duration::from_secs(10),
        }
    }
}

/// One two-sided quote generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Generation counter; newer generations supersede older ones
    pub generation: u64,
    /// Bid price
    pub bid_px: Px,
    /// Bid size
    pub bid_qty: Qty,
    /// Ask price
    pub ask_px: Px,
    /// Ask size
    pub ask_qty: Qty,
}

/// Decides quote sizes per side
pub trait SizingPolicy: Send + Sync {
    /// Size for the given side at the given price
    fn size(&self, side: Side, px: Px) -> Qty;
}

/// Quotes the same fixed size on both sides
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub Qty);

impl SizingPolicy for FixedSize {
    fn size(&self, _side: Side, _px: Px) -> Qty {
        self.0
    }
}

/// The resting quote pair and its venue order IDs
struct LiveQuote {
    quote: Quote,
    bid_id: OrderId,
    ask_id: OrderId,
}

/// Timer-driven quoting loop
pub struct QuotingEngine {
    config: QuoteConfig,
    execution: Arc<dyn ExecutionClient>,
    sizing: Box<dyn SizingPolicy>,
    events: EventBus,
    live: Option<LiveQuote>,
    generation: u64,
    paused_until: Option<Instant>,
}

impl QuotingEngine {
    /// Create an engine with no resting quotes
    #[must_use]
    pub fn new(
        config: QuoteConfig,
        execution: Arc<dyn ExecutionClient>,
        sizing: Box<dyn SizingPolicy>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            execution,
            sizing,
            events,
            live: None,
            generation: 0,
            paused_until: None,
        }
    }

    /// Run the quoting loop until `shutdown` flips to `true` or closes
    ///
    /// On the way out the engine cancels whatever it has resting, so a
    /// drained process leaves nothing on the venue.
    pub async fn run(
        mut self,
        views: watch::Receiver<Option<Arc<BookView>>>,
        vol: watch::Receiver<Option<f64>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = self.config.tick_period.as_millis() as u64, "quoting engine started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&views, &vol).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// One quoting decision
    async fn tick(
        &mut self,
        views: &watch::Receiver<Option<Arc<BookView>>>,
        vol: &watch::Receiver<Option<f64>>,
    ) {
        if let Some(until) = self.paused_until {
            if Instant::now() < until {
                return;
            }
            self.paused_until = None;
            info!("quoting resumed after cooldown");
            self.events.publish(MakerEvent::QuotingResumed);
        }

        let view = views.borrow().clone();
        let Some(view) = view else {
            return self.skip(SkipReason::NoBook);
        };
        if !view.has_both_sides() {
            return self.skip(SkipReason::EmptySide);
        }
        if view.age(Ts::now()) > self.config.max_view_age {
            return self.skip(SkipReason::StaleBook);
        }
        let Some(vol) = *vol.borrow() else {
            return self.skip(SkipReason::NoVolatility);
        };
        let Some(mid) = view.mid() else {
            return self.skip(SkipReason::EmptySide);
        };

        let candidate = self.compute_quote(mid, vol);
        if candidate.bid_px >= candidate.ask_px {
            // Unreachable while min_spread > 0; refuse to quote anyway
            error!(bid = %candidate.bid_px, ask = %candidate.ask_px, "computed quote crossed");
            return;
        }
        if !self.should_requote(&candidate) {
            debug!(generation = self.generation, "move inside requote threshold; holding");
            return;
        }
        self.apply_quote(candidate).await;
    }

    /// Whether the engine is currently in its failure cooldown
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn skip(&self, reason: SkipReason) {
        debug!(?reason, "tick skipped");
        self.events.publish(MakerEvent::TickSkipped { reason });
    }

    /// Spread fraction for the given volatility estimate, clamped
    #[must_use]
    pub fn spread_for(config: &QuoteConfig, vol: f64) -> f64 {
        let spread = config.base_spread * (1.0 + config.vol_multiplier * vol);
        spread.clamp(config.min_spread, config.max_spread)
    }

    /// Build the next quote generation around `mid`
    fn compute_quote(&self, mid: f64, vol: f64) -> Quote {
        let spread = Self::spread_for(&self.config, vol);
        let bid_px = Px::new(mid * (1.0 - spread / 2.0));
        let ask_px = Px::new(mid * (1.0 + spread / 2.0));
        Quote {
            generation: self.generation + 1,
            bid_px,
            bid_qty: self.sizing.size(Side::Bid, bid_px),
            ask_px,
            ask_qty: self.sizing.size(Side::Ask, ask_px),
        }
    }

    /// Whether the candidate differs enough from the resting quote
    fn should_requote(&self, candidate: &Quote) -> bool {
        let Some(live) = &self.live else {
            return true;
        };
        let moved = |from: Px, to: Px| {
            let base = from.as_f64().abs().max(f64::EPSILON);
            ((to.as_f64() - from.as_f64()).abs() / base) >= self.config.requote_threshold
        };
        moved(live.quote.bid_px, candidate.bid_px)
            || moved(live.quote.ask_px, candidate.ask_px)
            || live.quote.bid_qty != candidate.bid_qty
            || live.quote.ask_qty != candidate.ask_qty
    }

    /// Cancel the resting generation and place the new one
    ///
    /// Cancellation strictly precedes placement, so at no point are two
    /// generations resting at once.
    async fn apply_quote(&mut self, quote: Quote) {
        if !self.cancel_live().await {
            self.pause(self.config.max_retries);
            return;
        }

        let bid_id = match self
            .place_with_retry(Side::Bid, quote.bid_px, quote.bid_qty)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                self.on_place_failure(err);
                return;
            }
        };
        let ask_id = match self
            .place_with_retry(Side::Ask, quote.ask_px, quote.ask_qty)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                // Never leave a one-sided quote resting
                if let Err(cancel_err) = self.execution.cancel_order(bid_id).await {
                    warn!(error = %cancel_err, %bid_id, "failed to cancel orphaned bid");
                }
                self.on_place_failure(err);
                return;
            }
        };

        self.generation = quote.generation;
        info!(
            generation = quote.generation,
            bid = %quote.bid_px,
            ask = %quote.ask_px,
            "quote issued"
        );
        self.events.publish(MakerEvent::QuoteIssued {
            generation: quote.generation,
            bid_px: quote.bid_px,
            bid_qty: quote.bid_qty,
            ask_px: quote.ask_px,
            ask_qty: quote.ask_qty,
        });
        self.live = Some(LiveQuote {
            quote,
            bid_id,
            ask_id,
        });
    }

    /// Cancel the resting quote pair, if any; `false` means the venue
    /// could not be reached and the engine should pause
    async fn cancel_live(&mut self) -> bool {
        let Some(live) = self.live.take() else {
            return true;
        };
        for id in [live.bid_id, live.ask_id] {
            match self.cancel_with_retry(id).await {
                Ok(()) => {}
                Err(ExecutionError::Rejected { reason }) => {
                    // Already gone (filled or expired); nothing resting
                    debug!(%id, reason, "cancel rejected; order no longer resting");
                }
                Err(err @ ExecutionError::Transient { .. }) => {
                    warn!(error = %err, %id, "could not cancel resting order");
                    // Keep the quote tracked so cancellation is retried;
                    // a re-cancel of the already-cancelled leg comes back
                    // Rejected and is tolerated above.
                    self.live = Some(live);
                    return false;
                }
            }
        }
        self.events.publish(MakerEvent::QuoteCancelled {
            generation: live.quote.generation,
        });
        true
    }

    fn on_place_failure(&mut self, err: ExecutionError) {
        match err {
            ExecutionError::Rejected { reason } => {
                // Next tick recomputes from fresh data; no cooldown
                warn!(reason, "order rejected; will requote next tick");
            }
            ExecutionError::Transient { reason } => {
                warn!(reason, "placement retries exhausted");
                self.pause(self.config.max_retries);
            }
        }
    }

    fn pause(&mut self, consecutive_failures: u32) {
        warn!(
            cooldown_ms = self.config.pause_cooldown.as_millis() as u64,
            "pausing quoting after execution failures"
        );
        self.paused_until = Some(Instant::now() + self.config.pause_cooldown);
        self.events.publish(MakerEvent::QuotingPaused {
            consecutive_failures,
        });
    }

    async fn place_with_retry(
        &self,
        side: Side,
        px: Px,
        qty: Qty,
    ) -> Result<OrderId, ExecutionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execution.place_order(side, px, qty).await {
                Ok(id) => return Ok(id),
                Err(err @ ExecutionError::Transient { .. }) if attempt < self.config.max_retries => {
                    warn!(error = %err, attempt, "transient placement failure; retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn cancel_with_retry(&self, id: OrderId) -> Result<(), ExecutionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execution.cancel_order(id).await {
                Ok(()) => return Ok(()),
                Err(err @ ExecutionError::Transient { .. }) if attempt < self.config.max_retries => {
                    warn!(error = %err, attempt, "transient cancel failure; retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Cancel resting quotes before the engine goes away
    async fn shutdown(&mut self) {
        info!("quoting engine stopping");
        if !self.cancel_live().await {
            warn!("resting quotes could not be cancelled during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SimExecutionClient;

    fn engine(config: QuoteConfig) -> QuotingEngine {
        QuotingEngine::new(
            config,
            Arc::new(SimExecutionClient::new()),
            Box::new(FixedSize(Qty::new(1.0))),
            EventBus::default(),
        )
    }

    #[test]
    fn test_spread_widens_with_volatility_and_clamps() {
        let config = QuoteConfig::default();
        let calm = QuotingEngine::spread_for(&config, 0.0);
        let busy = QuotingEngine::spread_for(&config, 0.0001);
        let wild = QuotingEngine::spread_for(&config, 10.0);
        assert_eq!(calm, config.base_spread);
        assert!(busy > calm);
        assert_eq!(wild, config.max_spread);

        let floor = QuotingEngine::spread_for(
            &QuoteConfig {
                base_spread: 0.0001,
                ..QuoteConfig::default()
            },
            0.0,
        );
        assert_eq!(floor, config.min_spread);
    }

    #[test]
    fn test_computed_quote_straddles_mid() {
        let eng = engine(QuoteConfig::default());
        let quote = eng.compute_quote(100.0, 0.0);
        assert!(quote.bid_px < quote.ask_px);
        assert!(quote.bid_px.as_f64() < 100.0);
        assert!(quote.ask_px.as_f64() > 100.0);
        assert_eq!(quote.generation, 1);
    }

    #[test]
    fn test_requote_only_past_threshold() {
        let mut eng = engine(QuoteConfig::default());
        let resting = eng.compute_quote(100.0, 0.0);
        eng.live = Some(LiveQuote {
            quote: resting,
            bid_id: OrderId::new(1),
            ask_id: OrderId::new(2),
        });

        // Mid unchanged and a sub-threshold drift both hold the quote
        assert!(!eng.should_requote(&eng.compute_quote(100.0, 0.0)));
        assert!(!eng.should_requote(&eng.compute_quote(100.0005, 0.0)));
        // A 0.5% move is well past the 1bp threshold
        assert!(eng.should_requote(&eng.compute_quote(100.5, 0.0)));
    }

    #[test]
    fn test_requote_when_nothing_resting() {
        let eng = engine(QuoteConfig::default());
        assert!(eng.should_requote(&eng.compute_quote(100.0, 0.0)));
    }
}
