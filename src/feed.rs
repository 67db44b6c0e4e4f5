//! Contract-wide live event feed.
//!
//! Independent of the game selection: it watches every game, keeps the last
//! [`FEED_CAPACITY`] describable events newest first and reconnects with the
//! same backoff as the per-game subscription.

use crate::{
    Result,
    app::event_subscriber::{
        EventSubscriber,
        FeedDelivery,
        FeedSink,
        Subscription,
    },
    config::Backoff,
    error::{
        Error,
        TransportError,
    },
    events::DomainEvent,
    notification::describe_feed,
};
use chrono::{
    DateTime,
    Local,
};
use std::{
    collections::VecDeque,
    sync::Arc,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const FEED_CAPACITY: usize = 40;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedEntry {
    /// Increases by one per entry over the lifetime of the feed.
    pub seq: u64,
    pub event: DomainEvent,
    pub message: String,
    pub at: DateTime<Local>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeedState {
    /// Newest first.
    pub entries: VecDeque<FeedEntry>,
    pub connected: bool,
}

enum FeedInbound<Sub> {
    Opened {
        link: u64,
        result: std::result::Result<Sub, TransportError>,
    },
    RetryDue {
        link: u64,
    },
}

pub struct EventFeed {
    stop: oneshot::Sender<()>,
    state: watch::Receiver<FeedState>,
    worker: JoinHandle<()>,
}

impl EventFeed {
    pub fn start<S: EventSubscriber>(subscriber: S, backoff: Backoff) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let (state_tx, state) = watch::channel(FeedState::default());
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (deliveries, delivery_rx) = mpsc::unbounded_channel();
        let worker = FeedWorker {
            subscriber: Arc::new(subscriber),
            backoff,
            link: 0,
            subscription: None,
            opening: None,
            retry: None,
            failures: 0,
            next_seq: 0,
            entries: VecDeque::with_capacity(FEED_CAPACITY),
            connected: false,
            state: state_tx,
            inbound,
            deliveries,
        };
        let worker = tokio::spawn(worker.run(stop_rx, inbound_rx, delivery_rx));
        Self {
            stop,
            state,
            worker,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(());
        self.worker.await.map_err(|e| {
            warn!(error = %e, "feed worker did not shut down cleanly");
            Error::EngineStopped
        })
    }
}

struct FeedWorker<S: EventSubscriber> {
    subscriber: Arc<S>,
    backoff: Backoff,
    link: u64,
    subscription: Option<S::Subscription>,
    opening: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    failures: u32,
    next_seq: u64,
    entries: VecDeque<FeedEntry>,
    connected: bool,
    state: watch::Sender<FeedState>,
    inbound: mpsc::UnboundedSender<FeedInbound<S::Subscription>>,
    deliveries: mpsc::UnboundedSender<FeedDelivery>,
}

impl<S: EventSubscriber> FeedWorker<S> {
    async fn run(
        mut self,
        mut stop: oneshot::Receiver<()>,
        mut inbound: mpsc::UnboundedReceiver<FeedInbound<S::Subscription>>,
        mut deliveries: mpsc::UnboundedReceiver<FeedDelivery>,
    ) {
        info!("event feed started");
        self.open();

        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(message) = inbound.recv() => match message {
                    FeedInbound::Opened { link, result } => self.on_opened(link, result),
                    FeedInbound::RetryDue { link } if link == self.link => {
                        self.retry = None;
                        self.open();
                    }
                    FeedInbound::RetryDue { .. } => {}
                },
                Some(delivery) = deliveries.recv() => self.on_delivery(delivery),
            }
        }

        for handle in [self.opening.take(), self.retry.take()].into_iter().flatten() {
            handle.abort();
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
        self.connected = false;
        self.publish();
        info!("event feed stopped");
    }

    fn open(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
        self.link += 1;
        let link = self.link;
        let sink = FeedSink::new(link, self.deliveries.clone());
        let subscriber = Arc::clone(&self.subscriber);
        let inbound = self.inbound.clone();
        debug!(link, "opening contract-wide subscription");
        self.opening = Some(tokio::spawn(async move {
            let result = subscriber.open_feed(sink).await;
            let _ = inbound.send(FeedInbound::Opened { link, result });
        }));
    }

    fn on_opened(&mut self, link: u64, result: std::result::Result<S::Subscription, TransportError>) {
        if link != self.link {
            if let Ok(mut subscription) = result {
                subscription.close();
            }
            return;
        }
        self.opening = None;
        match result {
            Ok(subscription) => {
                info!(link, "event feed live");
                self.subscription = Some(subscription);
                self.connected = true;
                self.failures = 0;
                self.publish();
            }
            Err(e) => {
                warn!(error = %e, "event feed subscription failed");
                self.schedule_retry();
            }
        }
    }

    fn on_delivery(&mut self, delivery: FeedDelivery) {
        match delivery {
            FeedDelivery::Events { link, events } if link == self.link => {
                for event in events {
                    self.record(event);
                }
                self.publish();
            }
            FeedDelivery::LivenessLost { link, reason } if link == self.link => {
                warn!(reason, "event feed lost");
                if let Some(mut subscription) = self.subscription.take() {
                    subscription.close();
                }
                self.schedule_retry();
            }
            FeedDelivery::Events { link, .. } | FeedDelivery::LivenessLost { link, .. } => {
                debug!(link, "ignoring delivery from closed feed link");
            }
        }
    }

    fn record(&mut self, event: DomainEvent) {
        let Some(message) = describe_feed(&event) else {
            debug!(kind = event.kind.name(), "skipping event the feed cannot describe");
            return;
        };
        self.next_seq += 1;
        self.entries.push_front(FeedEntry {
            seq: self.next_seq,
            event,
            message,
            at: Local::now(),
        });
        self.entries.truncate(FEED_CAPACITY);
    }

    fn schedule_retry(&mut self) {
        self.connected = false;
        let delay = self.backoff.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        if let Some(pending) = self.retry.take() {
            pending.abort();
        }
        let link = self.link;
        let inbound = self.inbound.clone();
        info!(
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling event feed reconnect"
        );
        self.retry = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = inbound.send(FeedInbound::RetryDue { link });
        }));
        self.publish();
    }

    fn publish(&self) {
        self.state.send_replace(FeedState {
            entries: self.entries.clone(),
            connected: self.connected,
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        events::EventKind,
        game::{
            GameId,
            Wei,
        },
        test_helpers::*,
    };

    fn start() -> (EventFeed, FakeSubscriber) {
        let subscriber = FakeSubscriber::new();
        let feed = EventFeed::start(subscriber.clone(), test_config().resubscribe);
        (feed, subscriber)
    }

    #[tokio::test(start_paused = true)]
    async fn start__connects_and_reports_live() {
        // when
        let (feed, subscriber) = start();
        settle().await;

        // then
        assert!(feed.state().connected);
        assert_eq!(subscriber.open_feed_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events__from_every_game__are_listed_newest_first() {
        // given
        let (feed, subscriber) = start();
        settle().await;

        // when
        subscriber.push_feed(vec![
            DomainEvent::created(GameId(1), alice(), Wei(1_000_000_000_000_000_000)),
            DomainEvent::started(GameId(2), bob()),
            DomainEvent::new(GameId(2), EventKind::Unknown("Upgraded".to_string())),
        ]);
        settle().await;

        // then
        let messages: Vec<_> = feed
            .state()
            .entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect();
        assert_eq!(
            messages,
            vec![
                "Game #2 started!".to_string(),
                "Game #1 created (1 STT)".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries__beyond_capacity__drop_the_oldest() {
        // given
        let (feed, subscriber) = start();
        settle().await;
        let events = (0..FEED_CAPACITY as u64 + 5)
            .map(|id| DomainEvent::draw(GameId(id)))
            .collect();

        // when
        subscriber.push_feed(events);
        settle().await;

        // then
        let entries = feed.state().entries;
        assert_eq!(entries.len(), FEED_CAPACITY);
        assert_eq!(entries.front().map(|e| e.event.game_id), Some(GameId(44)));
        assert_eq!(entries.back().map(|e| e.event.game_id), Some(GameId(5)));
        assert_eq!(entries.front().map(|e| e.seq), Some(45));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_lost__reconnects_after_backoff_and_keeps_entries() {
        // given
        let (feed, subscriber) = start();
        settle().await;
        subscriber.push_feed(vec![DomainEvent::draw(GameId(9))]);
        settle().await;

        // when
        subscriber.drop_feed();
        settle().await;

        // then
        let state = feed.state();
        assert!(!state.connected);
        assert_eq!(state.entries.len(), 1);
        assert_eq!(subscriber.open_feed_links(), 0);

        time::advance(RESUBSCRIBE_INITIAL).await;
        settle().await;

        assert!(feed.state().connected);
        assert_eq!(subscriber.open_feed_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown__closes_the_subscription() {
        // given
        let (feed, subscriber) = start();
        settle().await;

        // when
        feed.shutdown().await.unwrap();

        // then
        assert_eq!(subscriber.open_feed_links(), 0);
    }
}
