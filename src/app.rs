//! Selection lifecycle and the single-writer sync worker.
//!
//! [`SyncEngine`] is a handle to one worker task. Commands, snapshot results,
//! subscription results, pushed event batches and the poll ticker are all
//! producers; the worker is their only consumer and the only writer of the
//! local view.

use crate::{
    Result,
    app::{
        event_subscriber::{
            Delivery,
            EventSink,
            EventSubscriber,
            Subscription,
        },
        snapshot_fetcher::SnapshotFetcher,
    },
    config::SyncConfig,
    error::{
        Error,
        FetchError,
        TransportError,
    },
    events::DomainEvent,
    game::{
        GameId,
        Identity,
        Snapshot,
    },
    notification::{
        Notification,
        NotificationSink,
    },
    reconciler::{
        LocalView,
        Reconciler,
        Refresh,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::JoinHandle,
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

pub mod event_subscriber;
pub mod http_game_api;
pub mod move_submitter;
pub mod snapshot_fetcher;
pub mod ws_event_subscriber;

#[cfg(test)]
mod tests;

/// Events kept for replay while the first snapshot of a selection is loading.
const EARLY_EVENT_LIMIT: usize = 64;

/// Staleness tag attached to every asynchronous result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub game_id: GameId,
    /// Selection generation; bumped on every `select`.
    pub epoch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    Idle,
    Connecting,
    Live,
    /// Push stream unavailable; the poll timer alone keeps the view fresh.
    PollOnly,
}

/// What collaborators get to see.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncState {
    pub selected: Option<GameId>,
    pub view: Option<LocalView>,
    pub notification: Option<Notification>,
    pub connectivity: Connectivity,
    pub last_fetch_error: Option<FetchError>,
    pub local_player: Option<Identity>,
}

impl SyncState {
    pub fn can_move(&self) -> bool {
        match (&self.view, &self.local_player) {
            (Some(view), Some(player)) => view.is_turn_of(player),
            _ => false,
        }
    }
}

#[derive(Debug)]
enum Command {
    Select(GameId),
    Deselect,
    Refresh,
    RetrySubscription,
    Shutdown,
}

enum Inbound<Sub> {
    Fetched {
        ticket: Ticket,
        result: std::result::Result<Snapshot, FetchError>,
    },
    Subscribed {
        ticket: Ticket,
        link: u64,
        result: std::result::Result<Sub, TransportError>,
    },
    RefreshDue {
        ticket: Ticket,
    },
    ResubscribeDue {
        ticket: Ticket,
    },
}

pub struct SyncEngine {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncState>,
    worker: JoinHandle<()>,
}

impl SyncEngine {
    /// Spawns the worker on the current tokio runtime.
    pub fn start<F, S>(
        fetcher: F,
        subscriber: S,
        config: SyncConfig,
        local_player: Option<Identity>,
    ) -> Self
    where
        F: SnapshotFetcher,
        S: EventSubscriber,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SyncState {
            local_player,
            ..SyncState::default()
        });
        let (worker, inbound_rx, delivery_rx) =
            Worker::new(fetcher, subscriber, config, local_player, state_tx);
        let worker = tokio::spawn(worker.run(command_rx, inbound_rx, delivery_rx));
        Self {
            commands,
            state,
            worker,
        }
    }

    pub fn select(&self, game_id: GameId) -> Result<()> {
        self.send(Command::Select(game_id))
    }

    pub fn deselect(&self) -> Result<()> {
        self.send(Command::Deselect)
    }

    /// Ask for a snapshot now. Coalesced with any fetch already in flight.
    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    pub fn retry_subscription(&self) -> Result<()> {
        self.send(Command::RetrySubscription)
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    pub fn can_move(&self) -> bool {
        self.state.borrow().can_move()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.worker.await.map_err(|e| {
            warn!(error = %e, "sync worker did not shut down cleanly");
            Error::EngineStopped
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::EngineStopped)
    }
}

struct Session<Sub> {
    ticket: Ticket,
    subscription: Option<Sub>,
    /// Subscription generation within this session.
    link: u64,
    connectivity: Connectivity,
    fetch: Option<JoinHandle<()>>,
    opening: Option<JoinHandle<()>>,
    resubscribe: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    failures: u32,
    /// Pushed before any snapshot landed; replayed onto the first one.
    early: Vec<DomainEvent>,
}

impl<Sub: Subscription> Session<Sub> {
    fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            subscription: None,
            link: 0,
            connectivity: Connectivity::Connecting,
            fetch: None,
            opening: None,
            resubscribe: None,
            timers: Vec::new(),
            failures: 0,
            early: Vec::new(),
        }
    }

    fn hold_early(&mut self, events: &[DomainEvent]) {
        let room = EARLY_EVENT_LIMIT.saturating_sub(self.early.len());
        if room < events.len() {
            warn!(
                game_id = %self.ticket.game_id,
                dropped = events.len() - room,
                "early event buffer full"
            );
        }
        self.early.extend(events.iter().take(room).cloned());
    }

    fn close_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    fn close(&mut self) {
        for handle in [self.fetch.take(), self.opening.take(), self.resubscribe.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.close_subscription();
    }
}

struct Worker<F, S: EventSubscriber> {
    fetcher: Arc<F>,
    subscriber: Arc<S>,
    config: SyncConfig,
    local_player: Option<Identity>,
    reconciler: Reconciler,
    notifications: NotificationSink,
    last_fetch_error: Option<FetchError>,
    session: Option<Session<S::Subscription>>,
    epochs: u64,
    state: watch::Sender<SyncState>,
    inbound: mpsc::UnboundedSender<Inbound<S::Subscription>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl<F, S> Worker<F, S>
where
    F: SnapshotFetcher,
    S: EventSubscriber,
{
    fn new(
        fetcher: F,
        subscriber: S,
        config: SyncConfig,
        local_player: Option<Identity>,
        state: watch::Sender<SyncState>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Inbound<S::Subscription>>,
        mpsc::UnboundedReceiver<Delivery>,
    ) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();
        let worker = Self {
            fetcher: Arc::new(fetcher),
            subscriber: Arc::new(subscriber),
            config,
            local_player,
            reconciler: Reconciler::new(),
            notifications: NotificationSink::new(),
            last_fetch_error: None,
            session: None,
            epochs: 0,
            state,
            inbound,
            deliveries,
        };
        (worker, inbound_rx, delivery_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound<S::Subscription>>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) {
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("sync worker started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Select(game_id)) => {
                            self.select(game_id);
                            ticker.reset();
                        }
                        Some(Command::Deselect) => self.deselect(),
                        Some(Command::Refresh) => self.request_refresh("manual"),
                        Some(Command::RetrySubscription) => self.retry_subscription(),
                        Some(Command::Shutdown) | None => break,
                    }
                }
                Some(message) = inbound.recv() => self.handle_inbound(message),
                Some(delivery) = deliveries.recv() => self.handle_delivery(delivery),
                _ = ticker.tick(), if self.session.is_some() => {
                    self.request_refresh("poll");
                }
            }
        }

        self.teardown();
        self.publish();
        info!("sync worker stopped");
    }

    fn select(&mut self, game_id: GameId) {
        self.teardown();
        self.reconciler.reset();
        self.notifications.clear();
        self.last_fetch_error = None;
        self.epochs += 1;
        let ticket = Ticket {
            game_id,
            epoch: self.epochs,
        };
        info!(%game_id, epoch = ticket.epoch, "selected game");
        self.session = Some(Session::new(ticket));
        self.request_refresh("initial");
        self.open_subscription();
        self.publish();
    }

    fn deselect(&mut self) {
        self.teardown();
        self.reconciler.reset();
        self.notifications.clear();
        self.last_fetch_error = None;
        info!("cleared game selection");
        self.publish();
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(
                game_id = %session.ticket.game_id,
                epoch = session.ticket.epoch,
                "tearing down session"
            );
            session.close();
        }
    }

    fn session_for(&mut self, ticket: Ticket) -> Option<&mut Session<S::Subscription>> {
        self.session
            .as_mut()
            .filter(|session| session.ticket == ticket)
    }

    fn request_refresh(&mut self, reason: &'static str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let ticket = session.ticket;
        if session.fetch.is_some() {
            debug!(game_id = %ticket.game_id, reason, "snapshot fetch already in flight");
            return;
        }
        debug!(game_id = %ticket.game_id, reason, "fetching snapshot");
        let fetcher = Arc::clone(&self.fetcher);
        let inbound = self.inbound.clone();
        session.fetch = Some(tokio::spawn(async move {
            let result = fetcher.fetch(ticket.game_id).await;
            let _ = inbound.send(Inbound::Fetched { ticket, result });
        }));
    }

    fn schedule_refresh(&mut self, delay: Duration) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.timers.retain(|timer| !timer.is_finished());
        let ticket = session.ticket;
        let inbound = self.inbound.clone();
        debug!(game_id = %ticket.game_id, delay_ms = delay.as_millis() as u64, "scheduling refresh");
        session.timers.push(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = inbound.send(Inbound::RefreshDue { ticket });
        }));
    }

    fn open_subscription(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.close_subscription();
        if let Some(opening) = session.opening.take() {
            opening.abort();
        }
        session.link += 1;
        session.connectivity = Connectivity::Connecting;
        let ticket = session.ticket;
        let link = session.link;
        let sink = EventSink::new(ticket, link, self.deliveries.clone());
        let subscriber = Arc::clone(&self.subscriber);
        let inbound = self.inbound.clone();
        debug!(game_id = %ticket.game_id, link, "opening event subscription");
        session.opening = Some(tokio::spawn(async move {
            let result = subscriber.open(ticket.game_id, sink).await;
            let _ = inbound.send(Inbound::Subscribed {
                ticket,
                link,
                result,
            });
        }));
    }

    fn retry_subscription(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(pending) = session.resubscribe.take() {
            pending.abort();
        }
        info!(game_id = %session.ticket.game_id, "retrying event subscription");
        self.open_subscription();
        self.publish();
    }

    /// Poll-only mode until a backed-off resubscribe succeeds.
    fn degrade(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.connectivity = Connectivity::PollOnly;
        let delay = self.config.resubscribe.delay(session.failures);
        session.failures = session.failures.saturating_add(1);
        if let Some(pending) = session.resubscribe.take() {
            pending.abort();
        }
        let ticket = session.ticket;
        let inbound = self.inbound.clone();
        info!(
            game_id = %ticket.game_id,
            attempt = session.failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling resubscribe"
        );
        session.resubscribe = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = inbound.send(Inbound::ResubscribeDue { ticket });
        }));
        self.publish();
    }

    fn handle_inbound(&mut self, message: Inbound<S::Subscription>) {
        match message {
            Inbound::Fetched { ticket, result } => self.on_fetched(ticket, result),
            Inbound::Subscribed {
                ticket,
                link,
                result,
            } => self.on_subscribed(ticket, link, result),
            Inbound::RefreshDue { ticket } => {
                if self.session_for(ticket).is_some() {
                    self.request_refresh("payout");
                }
            }
            Inbound::ResubscribeDue { ticket } => {
                let Some(session) = self.session_for(ticket) else {
                    return;
                };
                session.resubscribe = None;
                self.open_subscription();
                self.publish();
            }
        }
    }

    fn on_fetched(
        &mut self,
        ticket: Ticket,
        result: std::result::Result<Snapshot, FetchError>,
    ) {
        let Some(session) = self.session_for(ticket) else {
            debug!(game_id = %ticket.game_id, epoch = ticket.epoch, "discarding stale snapshot");
            return;
        };
        session.fetch = None;
        match result {
            Ok(snapshot) => {
                let early = std::mem::take(&mut session.early);
                debug!(
                    game_id = %ticket.game_id,
                    moves = snapshot.move_count,
                    replayed = early.len(),
                    "reconciling with fetched snapshot"
                );
                self.reconciler.reconcile(ticket.game_id, snapshot);
                self.last_fetch_error = None;
                // duplicates of what the snapshot already holds are no-ops
                self.apply_events(&early, false);
            }
            Err(e) => {
                warn!(
                    game_id = %ticket.game_id,
                    error = %e,
                    "snapshot fetch failed; keeping last known view"
                );
                self.last_fetch_error = Some(e);
            }
        }
        self.publish();
    }

    fn on_subscribed(
        &mut self,
        ticket: Ticket,
        link: u64,
        result: std::result::Result<S::Subscription, TransportError>,
    ) {
        let current = self
            .session
            .as_mut()
            .filter(|session| session.ticket == ticket && session.link == link);
        let Some(session) = current else {
            if let Ok(mut subscription) = result {
                debug!(game_id = %ticket.game_id, "closing subscription opened for stale selection");
                subscription.close();
            }
            return;
        };
        session.opening = None;
        match result {
            Ok(subscription) => {
                session.subscription = Some(subscription);
                session.connectivity = Connectivity::Live;
                let recovered = session.failures > 0;
                session.failures = 0;
                info!(game_id = %ticket.game_id, link, "event subscription live");
                if recovered {
                    // events may have been missed while disconnected
                    self.request_refresh("resubscribed");
                }
                self.publish();
            }
            Err(e) => {
                warn!(game_id = %ticket.game_id, error = %e, "event subscription failed");
                self.degrade();
            }
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Events { ticket, events, .. } => self.on_events(ticket, events),
            Delivery::LivenessLost {
                ticket,
                link,
                reason,
            } => {
                let current = self
                    .session
                    .as_mut()
                    .filter(|session| session.ticket == ticket && session.link == link);
                let Some(session) = current else {
                    debug!(game_id = %ticket.game_id, "ignoring liveness loss of stale subscription");
                    return;
                };
                warn!(game_id = %ticket.game_id, reason, "event stream lost; polling only");
                session.close_subscription();
                self.degrade();
            }
        }
    }

    fn on_events(&mut self, ticket: Ticket, mut events: Vec<DomainEvent>) {
        let awaiting_snapshot = self.reconciler.current().is_none();
        let Some(session) = self.session_for(ticket) else {
            debug!(
                game_id = %ticket.game_id,
                count = events.len(),
                "discarding events for stale selection"
            );
            return;
        };
        events.retain(|event| event.game_id == ticket.game_id);
        if awaiting_snapshot {
            session.hold_early(&events);
        }
        self.apply_events(&events, true);
        self.publish();
    }

    fn apply_events(&mut self, events: &[DomainEvent], notify: bool) {
        let mut refresh_now = false;
        let mut refresh_later = false;
        for event in events {
            if notify {
                self.notifications.record(event, self.reconciler.current());
            }
            match self.reconciler.apply(event) {
                Some(Refresh::Immediate) => refresh_now = true,
                Some(Refresh::AfterPayoutDelay) => refresh_later = true,
                None => {}
            }
        }
        if refresh_now {
            self.request_refresh("event");
        }
        if refresh_later {
            self.schedule_refresh(self.config.payout_refresh_delay);
        }
    }

    fn publish(&self) {
        let session = self.session.as_ref();
        self.state.send_replace(SyncState {
            selected: session.map(|session| session.ticket.game_id),
            view: self.reconciler.current().cloned(),
            notification: self.notifications.last().cloned(),
            connectivity: session
                .map(|session| session.connectivity)
                .unwrap_or_default(),
            last_fetch_error: self.last_fetch_error.clone(),
            local_player: self.local_player,
        });
    }
}
