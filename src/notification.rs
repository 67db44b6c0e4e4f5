use crate::{
    events::{
        DomainEvent,
        EventKind,
    },
    reconciler::LocalView,
};
use chrono::{
    DateTime,
    Local,
};

pub const CURRENCY_TICKER: &str = "STT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub at: DateTime<Local>,
}

/// Describes one transition for a human. `view` is only used to name the
/// mover by colour; it is never modified.
pub fn describe(event: &DomainEvent, view: Option<&LocalView>) -> Option<String> {
    let message = match &event.kind {
        EventKind::Created(created) => format!(
            "Game {} created ({} {CURRENCY_TICKER})",
            event.game_id, created.stake
        ),
        EventKind::Started(_) => "Opponent joined! Game started.".to_string(),
        EventKind::MovePlayed(played) => {
            let mover = view
                .and_then(|view| view.snapshot.slot_of(&played.actor))
                .map(|slot| slot.label().to_string())
                .unwrap_or_else(|| played.actor.short());
            format!("{mover} played column {}", played.column)
        }
        EventKind::Won(won) => format!("Game over! Winner: {}", won.winner.short()),
        EventKind::Draw => "Game over — Draw!".to_string(),
        EventKind::PrizeDistributed(prize) => {
            format!("Prize paid: {} {CURRENCY_TICKER}", prize.amount)
        }
        EventKind::Unknown(_) => return None,
    };
    Some(message)
}

/// One line of the contract-wide feed. Every game is named since the feed
/// is not tied to a selection.
pub fn describe_feed(event: &DomainEvent) -> Option<String> {
    let game_id = event.game_id;
    let line = match &event.kind {
        EventKind::Created(created) => {
            format!("Game {game_id} created ({} {CURRENCY_TICKER})", created.stake)
        }
        EventKind::Started(_) => format!("Game {game_id} started!"),
        EventKind::MovePlayed(played) => format!("{game_id} move: col {}", played.column),
        EventKind::Won(won) => format!("{game_id} won by {}", won.winner.short()),
        EventKind::Draw => format!("{game_id} ended in draw"),
        EventKind::PrizeDistributed(prize) => {
            format!("{game_id} {} {CURRENCY_TICKER} paid", prize.amount)
        }
        EventKind::Unknown(_) => return None,
    };
    Some(line)
}

/// Keeps the most recent notification only.
#[derive(Debug, Default)]
pub struct NotificationSink {
    last: Option<Notification>,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &DomainEvent, view: Option<&LocalView>) {
        match describe(event, view) {
            Some(message) => {
                self.last = Some(Notification {
                    message,
                    at: Local::now(),
                });
            }
            None => {
                tracing::debug!(kind = event.kind.name(), "no notification for event");
            }
        }
    }

    pub fn last(&self) -> Option<&Notification> {
        self.last.as_ref()
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}
