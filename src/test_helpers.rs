use crate::{
    app::{
        event_subscriber::{
            EventSink,
            EventSubscriber,
            FeedSink,
            Subscription,
        },
        move_submitter::MoveSubmitter,
        snapshot_fetcher::SnapshotFetcher,
    },
    config::{
        Backoff,
        SyncConfig,
    },
    error::{
        ActionError,
        FetchError,
        TransportError,
    },
    events::DomainEvent,
    game::{
        GameId,
        GameSummary,
        Identity,
        Slot,
        Snapshot,
        Status,
        Wei,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::sync::watch;

pub const POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const PAYOUT_DELAY: Duration = Duration::from_secs(3);
pub const RESUBSCRIBE_INITIAL: Duration = Duration::from_secs(1);

pub fn alice() -> Identity {
    Identity::new([0xaa; 20])
}

pub fn bob() -> Identity {
    Identity::new([0xbb; 20])
}

pub fn stranger() -> Identity {
    Identity::new([0xcc; 20])
}

/// Alice against Bob, nobody has moved yet, Alice to play.
pub fn active_game() -> Snapshot {
    Snapshot {
        participant_b: Some(bob()),
        status: Status::Active,
        current_turn: Slot::A,
        ..Snapshot::waiting(alice(), Wei(100_000_000_000_000_000))
    }
}

/// Deterministic timings for tests running on a paused clock.
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_poll_interval(POLL_INTERVAL)
        .with_payout_refresh_delay(PAYOUT_DELAY)
        .with_resubscribe_backoff(Backoff {
            initial: RESUBSCRIBE_INITIAL,
            max: Duration::from_secs(8),
            jitter: Duration::ZERO,
        })
}

/// Lets every ready task run until the worker has nothing left to do.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct FetcherState {
    responses: Mutex<HashMap<GameId, Result<Snapshot, FetchError>>>,
    calls: Mutex<Vec<GameId>>,
    gates: Mutex<HashMap<GameId, watch::Sender<bool>>>,
    games: Mutex<Vec<GameSummary>>,
    listing_error: Mutex<Option<FetchError>>,
    list_calls: Mutex<Vec<usize>>,
}

#[derive(Clone, Default)]
pub struct FakeFetcher {
    inner: Arc<FetcherState>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, game_id: GameId, snapshot: Snapshot) {
        self.inner
            .responses
            .lock()
            .unwrap()
            .insert(game_id, Ok(snapshot));
    }

    pub fn fail(&self, game_id: GameId, error: FetchError) {
        self.inner
            .responses
            .lock()
            .unwrap()
            .insert(game_id, Err(error));
    }

    /// Fetches for `game_id` block until [`FakeFetcher::release`].
    pub fn hold(&self, game_id: GameId) {
        let (gate, _) = watch::channel(false);
        self.inner.gates.lock().unwrap().insert(game_id, gate);
    }

    pub fn release(&self, game_id: GameId) {
        if let Some(gate) = self.inner.gates.lock().unwrap().get(&game_id) {
            gate.send_replace(true);
        }
    }

    pub fn calls(&self, game_id: GameId) -> usize {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == game_id)
            .count()
    }

    /// Lobby listing, newest first; clears any listing failure.
    pub fn set_games(&self, games: Vec<GameSummary>) {
        *self.inner.games.lock().unwrap() = games;
        *self.inner.listing_error.lock().unwrap() = None;
    }

    pub fn fail_listing(&self, error: FetchError) {
        *self.inner.listing_error.lock().unwrap() = Some(error);
    }

    /// The `limit` of every listing request so far.
    pub fn list_calls(&self) -> Vec<usize> {
        self.inner.list_calls.lock().unwrap().clone()
    }
}

impl SnapshotFetcher for FakeFetcher {
    async fn fetch(&self, game_id: GameId) -> Result<Snapshot, FetchError> {
        self.inner.calls.lock().unwrap().push(game_id);
        let gate = self
            .inner
            .gates
            .lock()
            .unwrap()
            .get(&game_id)
            .map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        let response = self.inner.responses.lock().unwrap().get(&game_id).cloned();
        response.unwrap_or_else(|| {
            Err(FetchError::Unavailable {
                game_id,
                reason: "no snapshot configured".to_string(),
            })
        })
    }

    async fn list_games(&self, limit: usize) -> Result<Vec<GameSummary>, FetchError> {
        self.inner.list_calls.lock().unwrap().push(limit);
        if let Some(error) = self.inner.listing_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .inner
            .games
            .lock()
            .unwrap()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

struct FakeLink {
    game_id: GameId,
    sink: EventSink,
    closed: Arc<AtomicBool>,
}

struct FakeFeedLink {
    sink: FeedSink,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct SubscriberState {
    links: Mutex<Vec<FakeLink>>,
    feed_links: Mutex<Vec<FakeFeedLink>>,
    attempts: Mutex<HashMap<GameId, usize>>,
    refusals: Mutex<HashMap<GameId, usize>>,
    gates: Mutex<HashMap<GameId, watch::Sender<bool>>>,
}

/// Captures every sink handed to it so tests can push events by hand.
#[derive(Clone, Default)]
pub struct FakeSubscriber {
    inner: Arc<SubscriberState>,
}

impl FakeSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` opens for `game_id` fail with a connect error.
    pub fn refuse_next(&self, game_id: GameId, count: usize) {
        self.inner.refusals.lock().unwrap().insert(game_id, count);
    }

    /// Opens for `game_id` do not complete until [`FakeSubscriber::release_opens`].
    pub fn hold_opens(&self, game_id: GameId) {
        let (gate, _) = watch::channel(false);
        self.inner.gates.lock().unwrap().insert(game_id, gate);
    }

    pub fn release_opens(&self, game_id: GameId) {
        if let Some(gate) = self.inner.gates.lock().unwrap().get(&game_id) {
            gate.send_replace(true);
        }
    }

    pub fn attempts(&self, game_id: GameId) -> usize {
        self.inner
            .attempts
            .lock()
            .unwrap()
            .get(&game_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_links(&self, game_id: GameId) -> usize {
        self.inner
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|link| link.game_id == game_id && !link.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Most recent sink for `game_id`, closed or not.
    pub fn latest_sink(&self, game_id: GameId) -> Option<EventSink> {
        self.inner
            .links
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|link| link.game_id == game_id)
            .map(|link| link.sink.clone())
    }

    pub fn push(&self, game_id: GameId, events: Vec<DomainEvent>) -> bool {
        match self.latest_sink(game_id) {
            Some(sink) => sink.deliver(events),
            None => false,
        }
    }

    pub fn drop_stream(&self, game_id: GameId) {
        if let Some(sink) = self.latest_sink(game_id) {
            sink.liveness_lost("connection reset by peer");
        }
    }

    pub fn open_feed_links(&self) -> usize {
        self.inner
            .feed_links
            .lock()
            .unwrap()
            .iter()
            .filter(|link| !link.closed.load(Ordering::SeqCst))
            .count()
    }

    fn latest_feed_sink(&self) -> Option<FeedSink> {
        self.inner
            .feed_links
            .lock()
            .unwrap()
            .last()
            .map(|link| link.sink.clone())
    }

    pub fn push_feed(&self, events: Vec<DomainEvent>) -> bool {
        match self.latest_feed_sink() {
            Some(sink) => sink.deliver(events),
            None => false,
        }
    }

    pub fn drop_feed(&self) {
        if let Some(sink) = self.latest_feed_sink() {
            sink.liveness_lost("connection reset by peer");
        }
    }
}

impl EventSubscriber for FakeSubscriber {
    type Subscription = FakeSubscription;

    async fn open(
        &self,
        game_id: GameId,
        sink: EventSink,
    ) -> Result<FakeSubscription, TransportError> {
        *self
            .inner
            .attempts
            .lock()
            .unwrap()
            .entry(game_id)
            .or_default() += 1;
        let gate = self
            .inner
            .gates
            .lock()
            .unwrap()
            .get(&game_id)
            .map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        {
            let mut refusals = self.inner.refusals.lock().unwrap();
            if let Some(remaining) = refusals.get_mut(&game_id).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(TransportError::Connect("connection refused".to_string()));
            }
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.inner.links.lock().unwrap().push(FakeLink {
            game_id,
            sink,
            closed: closed.clone(),
        });
        Ok(FakeSubscription { closed })
    }

    async fn open_feed(&self, sink: FeedSink) -> Result<FakeSubscription, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        self.inner.feed_links.lock().unwrap().push(FakeFeedLink {
            sink,
            closed: closed.clone(),
        });
        Ok(FakeSubscription { closed })
    }
}

#[derive(Debug)]
pub struct FakeSubscription {
    closed: Arc<AtomicBool>,
}

impl Subscription for FakeSubscription {
    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Default)]
pub struct FakeSubmitter {
    submitted: Arc<Mutex<Vec<(GameId, u8)>>>,
    rejection: Arc<Mutex<Option<ActionError>>>,
}

impl FakeSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_with(&self, error: ActionError) {
        *self.rejection.lock().unwrap() = Some(error);
    }

    pub fn submitted(&self) -> Vec<(GameId, u8)> {
        self.submitted.lock().unwrap().clone()
    }
}

impl MoveSubmitter for FakeSubmitter {
    async fn submit_move(&self, game_id: GameId, column: u8) -> Result<(), ActionError> {
        self.submitted.lock().unwrap().push((game_id, column));
        match self.rejection.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
