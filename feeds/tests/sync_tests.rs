//! Synchronizer integration tests
//!
//! Drive the synchronizer with scripted feed events and snapshot
//! sources; assert on the published book views and emitted events.

use async_trait::async_trait;
use common::{
    BookSnapshot, BookUpdate, ConnectionState, EventBus, MakerEvent, Px, Qty, Symbol, Ts,
};
use feeds::transport::FeedEvent;
use feeds::{FeedError, SnapshotSource, SyncConfig, Synchronizer};
use lob::BookView;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Snapshot source that serves a scripted sequence of results, gated so
/// tests can control when fetches resolve.
struct ScriptedSnapshots {
    script: Mutex<VecDeque<Result<BookSnapshot, String>>>,
    gate: watch::Receiver<bool>,
    fetches: AtomicU32,
}

impl ScriptedSnapshots {
    fn new(
        script: Vec<Result<BookSnapshot, String>>,
    ) -> (Arc<Self>, watch::Sender<bool>) {
        let (gate_tx, gate_rx) = watch::channel(true);
        (
            Arc::new(Self {
                script: Mutex::new(script.into()),
                gate: gate_rx,
                fetches: AtomicU32::new(0),
            }),
            gate_tx,
        )
    }

    fn gated(
        script: Vec<Result<BookSnapshot, String>>,
    ) -> (Arc<Self>, watch::Sender<bool>) {
        let (source, gate_tx) = Self::new(script);
        gate_tx.send(false).unwrap();
        (source, gate_tx)
    }

    fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSnapshots {
    async fn fetch(&self) -> Result<BookSnapshot, FeedError> {
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open).await.map_err(|_| {
            FeedError::Snapshot("gate dropped".into())
        })?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(reason)) => Err(FeedError::Snapshot(reason)),
            None => Err(FeedError::Snapshot("script exhausted".into())),
        }
    }
}

fn snapshot(bids: &[(f64, f64)], asks: &[(f64, f64)], last_update_id: u64) -> BookSnapshot {
    BookSnapshot {
        last_update_id,
        bids: bids.iter().map(|&(p, q)| (Px::new(p), Qty::new(q))).collect(),
        asks: asks.iter().map(|&(p, q)| (Px::new(p), Qty::new(q))).collect(),
    }
}

fn update(first: u64, last: u64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> BookUpdate {
    BookUpdate {
        ts: Ts::from_millis(last),
        first_update_id: first,
        final_update_id: last,
        bids: bids.iter().map(|&(p, q)| (Px::new(p), Qty::new(q))).collect(),
        asks: asks.iter().map(|&(p, q)| (Px::new(p), Qty::new(q))).collect(),
    }
}

struct Harness {
    tx: mpsc::Sender<FeedEvent>,
    views: watch::Receiver<Option<Arc<BookView>>>,
    events: tokio::sync::broadcast::Receiver<MakerEvent>,
    task: tokio::task::JoinHandle<Result<(), FeedError>>,
}

fn spawn_sync(source: Arc<dyn SnapshotSource>, config: SyncConfig) -> Harness {
    let bus = EventBus::default();
    let events = bus.subscribe();
    let (sync, views, _synced) = Synchronizer::new(Symbol::new(1), source, config, bus);
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(sync.run(rx));
    Harness {
        tx,
        views,
        events,
        task,
    }
}

async fn wait_for_view<F>(
    views: &mut watch::Receiver<Option<Arc<BookView>>>,
    mut pred: F,
) -> Arc<BookView>
where
    F: FnMut(&BookView) -> bool,
{
    let view = timeout(
        Duration::from_secs(5),
        views.wait_for(|v| v.as_ref().is_some_and(|view| pred(view))),
    )
    .await
    .expect("timed out waiting for view")
    .expect("synchronizer dropped");
    view.clone().unwrap()
}

async fn wait_for_invalidation(views: &mut watch::Receiver<Option<Arc<BookView>>>) {
    timeout(Duration::from_secs(5), views.wait_for(|v| v.is_none()))
        .await
        .expect("timed out waiting for invalidation")
        .expect("synchronizer dropped");
}

async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<MakerEvent>,
    mut pred: F,
) -> MakerEvent
where
    F: FnMut(&MakerEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_snapshot_plus_update_moves_top_of_book() {
    let (source, _gate) = ScriptedSnapshots::new(vec![Ok(snapshot(
        &[(100.0, 2.0)],
        &[(101.0, 2.0)],
        10,
    ))]);
    let mut h = spawn_sync(source, SyncConfig::default());

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();
    h.tx.send(FeedEvent::Update(update(
        11,
        11,
        &[],
        &[(101.0, 0.0), (101.5, 3.0)],
    )))
    .await
    .unwrap();

    let view = wait_for_view(&mut h.views, |v| v.last_update_id == 11).await;
    assert_eq!(view.bid, Some((Px::new(100.0), Qty::new(2.0))));
    assert_eq!(view.ask, Some((Px::new(101.5), Qty::new(3.0))));
}

#[tokio::test]
async fn test_buffered_replay_is_arrival_order_insensitive() {
    let u1 = update(11, 11, &[(99.9, 1.0)], &[]);
    let u2 = update(12, 12, &[], &[(101.2, 2.0)]);
    let u3 = update(13, 13, &[(100.0, 5.0)], &[(101.0, 0.0)]);
    let orders: [Vec<BookUpdate>; 2] = [
        vec![u1.clone(), u2.clone(), u3.clone()],
        vec![u3, u1, u2],
    ];

    let mut results = Vec::new();
    for arrival in orders {
        // Keep the snapshot gated until every update is buffered, so
        // replay ordering is exercised rather than direct application.
        let (source, gate) = ScriptedSnapshots::gated(vec![Ok(snapshot(
            &[(100.0, 2.0)],
            &[(101.0, 2.0)],
            10,
        ))]);
        let mut h = spawn_sync(source, SyncConfig::default());

        h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
            .await
            .unwrap();
        for u in arrival {
            h.tx.send(FeedEvent::Update(u)).await.unwrap();
        }
        // Let the synchronizer drain the channel into its buffer before
        // the snapshot resolves
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.send(true).unwrap();

        let view = wait_for_view(&mut h.views, |v| v.last_update_id == 13).await;
        results.push((view.bids.clone(), view.asks.clone()));
        h.task.abort();
    }

    assert_eq!(results[0], results[1]);
    // And the replayed book is actually the merged one
    assert_eq!(results[0].0[0], (Px::new(100.0), Qty::new(5.0)));
    assert_eq!(results[0].1[0], (Px::new(101.2), Qty::new(2.0)));
}

#[tokio::test]
async fn test_sequence_gap_triggers_resync() {
    let (source, _gate) = ScriptedSnapshots::new(vec![
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 10)),
        Ok(snapshot(&[(100.5, 1.0)], &[(101.5, 1.0)], 20)),
    ]);
    let mut h = spawn_sync(source.clone(), SyncConfig::default());

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();
    wait_for_view(&mut h.views, |v| v.last_update_id == 10).await;

    // Jump ahead: ids 11..14 never arrive
    h.tx.send(FeedEvent::Update(update(15, 15, &[(100.1, 1.0)], &[])))
        .await
        .unwrap();

    let event = wait_for_event(&mut h.events, |e| matches!(e, MakerEvent::SequenceGap { .. })).await;
    assert!(matches!(
        event,
        MakerEvent::SequenceGap { expected: 11, got: 15 }
    ));

    // A fresh snapshot round recovers the book
    let view = wait_for_view(&mut h.views, |v| v.last_update_id == 20).await;
    assert_eq!(view.bid, Some((Px::new(100.5), Qty::new(1.0))));
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test]
async fn test_crossed_book_triggers_resync() {
    let (source, _gate) = ScriptedSnapshots::new(vec![
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 10)),
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 20)),
    ]);
    let mut h = spawn_sync(source, SyncConfig::default());

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();
    wait_for_view(&mut h.views, |v| v.last_update_id == 10).await;

    // A bid through the ask: feed corruption, never silently accepted
    h.tx.send(FeedEvent::Update(update(11, 11, &[(101.5, 1.0)], &[])))
        .await
        .unwrap();

    wait_for_event(&mut h.events, |e| matches!(e, MakerEvent::CrossedBook { .. })).await;
    let view = wait_for_view(&mut h.views, |v| v.last_update_id == 20).await;
    assert!(view.bid.unwrap().0 < view.ask.unwrap().0);
}

#[tokio::test]
async fn test_degraded_invalidates_published_view() {
    let (source, _gate) = ScriptedSnapshots::new(vec![
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 10)),
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 30)),
    ]);
    let mut h = spawn_sync(source, SyncConfig::default());

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();
    wait_for_view(&mut h.views, |v| v.last_update_id == 10).await;

    // Transport loses the session: readers must not see the old book
    h.tx.send(FeedEvent::StateChange(ConnectionState::Degraded))
        .await
        .unwrap();
    wait_for_invalidation(&mut h.views).await;

    // Reconnect path re-announces Syncing and recovers
    h.tx.send(FeedEvent::StateChange(ConnectionState::Connecting))
        .await
        .unwrap();
    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();
    let view = wait_for_view(&mut h.views, |v| v.last_update_id == 30).await;
    assert!(view.has_both_sides());
}

#[tokio::test]
async fn test_stale_snapshot_is_refetched() {
    // First snapshot predates the buffered stream; only the second is
    // usable.
    let (source, gate) = ScriptedSnapshots::gated(vec![
        Ok(snapshot(&[(99.0, 1.0)], &[(102.0, 1.0)], 5)),
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 10)),
    ]);
    let mut h = spawn_sync(source.clone(), SyncConfig::default());

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();
    // Buffered stream starts at id 8 > 5 + 1, so snapshot id 5 is stale
    h.tx.send(FeedEvent::Update(update(8, 9, &[(100.0, 2.0)], &[])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.send(true).unwrap();

    let view = wait_for_view(&mut h.views, |v| v.last_update_id >= 10).await;
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(view.bid, Some((Px::new(100.0), Qty::new(2.0))));
}

#[tokio::test]
async fn test_crossed_snapshot_is_refetched() {
    // A corrupted snapshot (bid through ask) must never be published;
    // the synchronizer reports it and fetches a fresh one.
    let (source, _gate) = ScriptedSnapshots::new(vec![
        Ok(snapshot(&[(102.0, 1.0)], &[(101.0, 1.0)], 5)),
        Ok(snapshot(&[(100.0, 2.0)], &[(101.0, 2.0)], 10)),
    ]);
    let config = SyncConfig {
        snapshot_retry_delay: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let mut h = spawn_sync(source.clone(), config);

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();

    wait_for_event(&mut h.events, |e| matches!(e, MakerEvent::CrossedBook { .. })).await;
    let view = wait_for_view(&mut h.views, |v| v.last_update_id == 10).await;
    assert_eq!(source.fetch_count(), 2);
    assert!(view.bid.unwrap().0 < view.ask.unwrap().0);
}

#[tokio::test]
async fn test_repeatedly_crossed_snapshots_exhaust_the_budget() {
    let crossed = || Ok(snapshot(&[(102.0, 1.0)], &[(101.0, 1.0)], 5));
    let (source, _gate) = ScriptedSnapshots::new(vec![crossed(), crossed(), crossed()]);
    let config = SyncConfig {
        snapshot_retry_delay: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let h = spawn_sync(source, config);

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), h.task)
        .await
        .expect("synchronizer did not terminate")
        .expect("task panicked");
    assert!(matches!(result, Err(FeedError::SnapshotStale { attempts: 3 })));
}

#[tokio::test]
async fn test_snapshot_budget_exhaustion_is_fatal() {
    let (source, _gate) = ScriptedSnapshots::new(vec![
        Err("503".into()),
        Err("503".into()),
        Err("503".into()),
    ]);
    let config = SyncConfig {
        snapshot_retry_delay: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let h = spawn_sync(source, config);

    h.tx.send(FeedEvent::StateChange(ConnectionState::Syncing))
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), h.task)
        .await
        .expect("synchronizer did not terminate")
        .expect("task panicked");
    assert!(matches!(result, Err(FeedError::SnapshotStale { attempts: 3 })));
}

#[tokio::test]
async fn test_shutdown_when_feed_channel_closes() {
    let (source, _gate) = ScriptedSnapshots::new(vec![]);
    let h = spawn_sync(source, SyncConfig::default());
    drop(h.tx);
    let result = timeout(Duration::from_secs(5), h.task)
        .await
        .expect("synchronizer did not terminate")
        .expect("task panicked");
    assert!(result.is_ok());
}
