use crate::{
    app::Ticket,
    error::TransportError,
    events::DomainEvent,
    game::GameId,
};
use tokio::sync::mpsc;

pub trait EventSubscriber: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Open a push channel for `game_id`. While alive, the subscription
    /// delivers event batches to `sink` and reports transport failure through
    /// [`EventSink::liveness_lost`]. It must not resubscribe on its own.
    fn open(
        &self,
        game_id: GameId,
        sink: EventSink,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send;

    /// Same as [`EventSubscriber::open`] but for every game of the contract.
    fn open_feed(
        &self,
        sink: FeedSink,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send;
}

pub trait Subscription: Send + 'static {
    /// Release the underlying transport. Safe to call more than once.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Events {
        ticket: Ticket,
        link: u64,
        events: Vec<DomainEvent>,
    },
    LivenessLost {
        ticket: Ticket,
        link: u64,
        reason: String,
    },
}

/// Where a transport reader hands what it decoded.
pub trait EventTarget: Send + 'static {
    /// Only events for this game are delivered; `None` accepts every game.
    fn scope(&self) -> Option<GameId>;

    /// Returns `false` once nobody listens any more.
    fn deliver(&self, events: Vec<DomainEvent>) -> bool;

    fn liveness_lost(&self, reason: String);
}

/// Callback pair handed to a subscription. Neither method blocks.
#[derive(Clone, Debug)]
pub struct EventSink {
    ticket: Ticket,
    link: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl EventSink {
    pub(crate) fn new(
        ticket: Ticket,
        link: u64,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            ticket,
            link,
            sender,
        }
    }

    /// Returns `false` once the engine has gone away.
    pub fn deliver(&self, events: Vec<DomainEvent>) -> bool {
        if events.is_empty() {
            return !self.sender.is_closed();
        }
        self.sender
            .send(Delivery::Events {
                ticket: self.ticket,
                link: self.link,
                events,
            })
            .is_ok()
    }

    pub fn liveness_lost(&self, reason: impl Into<String>) {
        let _ = self.sender.send(Delivery::LivenessLost {
            ticket: self.ticket,
            link: self.link,
            reason: reason.into(),
        });
    }
}

impl EventTarget for EventSink {
    fn scope(&self) -> Option<GameId> {
        Some(self.ticket.game_id)
    }

    fn deliver(&self, events: Vec<DomainEvent>) -> bool {
        EventSink::deliver(self, events)
    }

    fn liveness_lost(&self, reason: String) {
        EventSink::liveness_lost(self, reason)
    }
}

#[derive(Debug)]
pub(crate) enum FeedDelivery {
    Events { link: u64, events: Vec<DomainEvent> },
    LivenessLost { link: u64, reason: String },
}

/// Callback pair for a contract-wide subscription.
#[derive(Clone, Debug)]
pub struct FeedSink {
    link: u64,
    sender: mpsc::UnboundedSender<FeedDelivery>,
}

impl FeedSink {
    pub(crate) fn new(link: u64, sender: mpsc::UnboundedSender<FeedDelivery>) -> Self {
        Self { link, sender }
    }

    pub fn deliver(&self, events: Vec<DomainEvent>) -> bool {
        if events.is_empty() {
            return !self.sender.is_closed();
        }
        self.sender
            .send(FeedDelivery::Events {
                link: self.link,
                events,
            })
            .is_ok()
    }

    pub fn liveness_lost(&self, reason: impl Into<String>) {
        let _ = self.sender.send(FeedDelivery::LivenessLost {
            link: self.link,
            reason: reason.into(),
        });
    }
}

impl EventTarget for FeedSink {
    fn scope(&self) -> Option<GameId> {
        None
    }

    fn deliver(&self, events: Vec<DomainEvent>) -> bool {
        FeedSink::deliver(self, events)
    }

    fn liveness_lost(&self, reason: String) {
        FeedSink::liveness_lost(self, reason)
    }
}

#[cfg(test)]
impl EventSink {
    pub(crate) fn detached(
        game_id: GameId,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let ticket = Ticket { game_id, epoch: 0 };
        (Self::new(ticket, 0, sender), receiver)
    }
}
