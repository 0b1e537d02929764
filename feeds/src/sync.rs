//! Book synchronizer
//!
//! Bridges the transport and the order book: buffers updates that
//! arrive while a snapshot fetch is in flight, replays them in sequence
//! order, detects gaps and crossed books, and restarts the sync round
//! whenever the replica can no longer be trusted. It is the book's only
//! writer; readers get immutable [`BookView`]s through a watch channel
//! that holds `None` whenever the book is not synchronized.

use crate::error::FeedError;
use crate::snapshot::SnapshotSource;
use crate::transport::FeedEvent;
use common::{BookSnapshot, ConnectionState, EventBus, MakerEvent, Symbol, Ts};
use lob::{BookError, BookView, OrderBook};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SnapshotTask = JoinHandle<Result<BookSnapshot, FeedError>>;

/// Synchronizer configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Price levels per side captured into each published view
    pub view_levels: usize,
    /// Snapshot fetch/staleness budget per sync round
    pub max_snapshot_attempts: u32,
    /// Delay before refetching after a failed snapshot request
    pub snapshot_retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            view_levels: 10,
            max_snapshot_attempts: 3,
            snapshot_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Reconciles the snapshot and the update stream into the order book
pub struct Synchronizer {
    book: OrderBook,
    snapshots: Arc<dyn SnapshotSource>,
    config: SyncConfig,
    events: EventBus,
    view_tx: watch::Sender<Option<Arc<BookView>>>,
    synced_tx: watch::Sender<bool>,
    /// `Some` while a sync round is collecting updates
    buffer: Option<Vec<common::BookUpdate>>,
    /// Snapshot fetch attempts in the current round
    attempts: u32,
}

impl Synchronizer {
    /// Create a synchronizer and the read handles for its outputs
    ///
    /// Returns `(synchronizer, views, synced)`: `views` is the
    /// published-book watch channel for readers, `synced` feeds the
    /// transport's Syncing/Live transitions.
    pub fn new(
        symbol: Symbol,
        snapshots: Arc<dyn SnapshotSource>,
        config: SyncConfig,
        events: EventBus,
    ) -> (
        Self,
        watch::Receiver<Option<Arc<BookView>>>,
        watch::Receiver<bool>,
    ) {
        let (view_tx, view_rx) = watch::channel(None);
        let (synced_tx, synced_rx) = watch::channel(false);
        (
            Self {
                book: OrderBook::new(symbol),
                snapshots,
                config,
                events,
                view_tx,
                synced_tx,
                buffer: None,
                attempts: 0,
            },
            view_rx,
            synced_rx,
        )
    }

    /// Consume feed events until the transport channel closes
    ///
    /// The only error path is a fatal one: the snapshot budget for a
    /// sync round ran out, at which point continuing to quote on an
    /// unreliable book would be worse than stopping.
    pub async fn run(mut self, mut rx: mpsc::Receiver<FeedEvent>) -> Result<(), FeedError> {
        let mut pending: Option<SnapshotTask> = None;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    None => {
                        Self::abort_pending(&mut pending);
                        info!("synchronizer shutting down");
                        return Ok(());
                    }
                    Some(FeedEvent::StateChange(state)) => {
                        self.on_state_change(state, &mut pending);
                    }
                    Some(FeedEvent::Update(update)) => {
                        self.on_update(update, &mut pending);
                    }
                },
                result = Self::await_snapshot(&mut pending), if pending.is_some() => {
                    pending = None;
                    self.on_snapshot(result, &mut pending)?;
                }
            }
        }
    }

    /// Await the in-flight snapshot task, or park forever if none
    ///
    /// Only polled under the `pending.is_some()` branch condition.
    async fn await_snapshot(
        pending: &mut Option<SnapshotTask>,
    ) -> Result<BookSnapshot, FeedError> {
        match pending.as_mut() {
            Some(task) => task.await.unwrap_or_else(|e| {
                Err(FeedError::Snapshot(format!("snapshot task failed: {e}")))
            }),
            None => std::future::pending().await,
        }
    }

    fn on_state_change(&mut self, state: ConnectionState, pending: &mut Option<SnapshotTask>) {
        match state {
            ConnectionState::Syncing => {
                // The transport also re-announces Syncing when we flip
                // the synced flag ourselves; don't restart a live round.
                if self.buffer.is_none() {
                    self.begin_sync("stream attached", pending);
                }
            }
            ConnectionState::Degraded
            | ConnectionState::Disconnected
            | ConnectionState::Connecting => {
                // The session is gone; buffered updates belong to it
                // and a fresh Syncing will follow the reconnect.
                self.invalidate(pending);
            }
            ConnectionState::Live => {}
        }
    }

    fn on_update(&mut self, update: common::BookUpdate, pending: &mut Option<SnapshotTask>) {
        if let Some(buffer) = &mut self.buffer {
            buffer.push(update);
            return;
        }
        if !self.book.is_synced() {
            // Updates before the first sync round was announced
            debug!("dropping update before sync start");
            return;
        }
        match self.book.apply_update(&update) {
            Ok(()) => self.publish_view(),
            Err(BookError::StaleUpdate { .. }) => {
                debug!(final_update_id = update.final_update_id, "skipping stale update");
            }
            Err(BookError::SequenceGap { expected, got }) => {
                warn!(expected, got, "sequence gap; resynchronizing");
                self.events.publish(MakerEvent::SequenceGap { expected, got });
                self.begin_sync("sequence gap", pending);
            }
            Err(BookError::CrossedBook { bid, ask }) => {
                warn!(%bid, %ask, "crossed book; resynchronizing");
                self.events.publish(MakerEvent::CrossedBook { bid, ask });
                self.begin_sync("crossed book", pending);
            }
            Err(BookError::Poisoned) => {
                self.begin_sync("poisoned book", pending);
            }
        }
    }

    fn on_snapshot(
        &mut self,
        result: Result<BookSnapshot, FeedError>,
        pending: &mut Option<SnapshotTask>,
    ) -> Result<(), FeedError> {
        if self.buffer.is_none() {
            // Round was invalidated while the fetch was in flight
            debug!("discarding snapshot from an abandoned sync round");
            return Ok(());
        }
        match result {
            Ok(snapshot) => self.reconcile(snapshot, pending),
            Err(err) => {
                warn!(error = %err, attempt = self.attempts, "snapshot fetch failed");
                if self.attempts >= self.config.max_snapshot_attempts {
                    return Err(FeedError::SnapshotStale {
                        attempts: self.attempts,
                    });
                }
                self.request_snapshot_after(self.config.snapshot_retry_delay, pending);
                Ok(())
            }
        }
    }

    /// Apply a snapshot and replay the buffered updates over it
    fn reconcile(
        &mut self,
        snapshot: BookSnapshot,
        pending: &mut Option<SnapshotTask>,
    ) -> Result<(), FeedError> {
        let mut buffered = self.buffer.take().unwrap_or_default();
        buffered.retain(|u| u.final_update_id > snapshot.last_update_id);
        buffered.sort_by_key(|u| u.first_update_id);

        // The snapshot must cover the start of the buffered stream;
        // otherwise updates between the two are lost and the snapshot
        // is stale.
        if let Some(first) = buffered.first() {
            if first.first_update_id > snapshot.last_update_id + 1 {
                warn!(
                    snapshot_id = snapshot.last_update_id,
                    first_buffered = first.first_update_id,
                    "snapshot predates buffered stream; refetching"
                );
                self.buffer = Some(buffered);
                if self.attempts >= self.config.max_snapshot_attempts {
                    return Err(FeedError::SnapshotStale {
                        attempts: self.attempts,
                    });
                }
                self.request_snapshot_after(Duration::ZERO, pending);
                return Ok(());
            }
        }

        match self.book.apply_snapshot(&snapshot, Ts::now()) {
            Ok(()) => {}
            Err(BookError::CrossedBook { bid, ask }) => {
                warn!(%bid, %ask, "snapshot is crossed; refetching");
                self.events.publish(MakerEvent::CrossedBook { bid, ask });
                self.buffer = Some(buffered);
                if self.attempts >= self.config.max_snapshot_attempts {
                    return Err(FeedError::SnapshotStale {
                        attempts: self.attempts,
                    });
                }
                self.request_snapshot_after(self.config.snapshot_retry_delay, pending);
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "snapshot rejected; restarting sync round");
                self.begin_sync("snapshot rejected", pending);
                return Ok(());
            }
        }
        for update in &buffered {
            match self.book.apply_update(update) {
                Ok(()) | Err(BookError::StaleUpdate { .. }) => {}
                Err(err) => {
                    // A gap inside the buffer itself; nothing to patch
                    warn!(error = %err, "buffered replay failed; restarting sync round");
                    self.begin_sync("buffered replay failure", pending);
                    return Ok(());
                }
            }
        }

        info!(
            last_update_id = self.book.last_update_id(),
            replayed = buffered.len(),
            "order book synchronized"
        );
        self.events.publish(MakerEvent::SnapshotApplied {
            last_update_id: snapshot.last_update_id,
        });
        let _ = self.synced_tx.send(true);
        self.publish_view();
        Ok(())
    }

    /// Start a fresh sync round: wipe the book, hide it from readers,
    /// buffer incoming updates, request a snapshot
    fn begin_sync(&mut self, reason: &str, pending: &mut Option<SnapshotTask>) {
        info!(reason, "starting sync round");
        self.events.publish(MakerEvent::SyncRestarted {
            reason: reason.to_string(),
        });
        Self::abort_pending(pending);
        self.book.clear();
        let _ = self.view_tx.send(None);
        let _ = self.synced_tx.send(false);
        self.buffer = Some(Vec::new());
        self.attempts = 0;
        self.request_snapshot_after(Duration::ZERO, pending);
    }

    /// Drop all in-flight sync state without starting a new round
    fn invalidate(&mut self, pending: &mut Option<SnapshotTask>) {
        Self::abort_pending(pending);
        self.buffer = None;
        self.book.clear();
        let _ = self.view_tx.send(None);
        let _ = self.synced_tx.send(false);
    }

    fn request_snapshot_after(&mut self, delay: Duration, pending: &mut Option<SnapshotTask>) {
        self.attempts += 1;
        let source = Arc::clone(&self.snapshots);
        *pending = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            source.fetch().await
        }));
    }

    fn abort_pending(pending: &mut Option<SnapshotTask>) {
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }

    fn publish_view(&self) {
        let view = BookView::capture(&self.book, self.config.view_levels, Ts::now());
        let _ = self.view_tx.send(Some(Arc::new(view)));
    }
}
