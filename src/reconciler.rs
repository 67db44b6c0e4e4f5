//! Optimistic event application and snapshot reconciliation.
//!
//! [`apply`] and [`reconcile`] are pure; [`Reconciler`] is the single place
//! that holds the current view and is only ever driven by the sync worker.

use crate::{
    events::{
        DomainEvent,
        EventKind,
        MovePlayedEvent,
    },
    game::{
        COLUMNS,
        Cell,
        GameId,
        Identity,
        ROWS,
        Snapshot,
        Status,
    },
};

/// Client-held approximation of a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalView {
    pub game_id: GameId,
    pub snapshot: Snapshot,
    /// Bumped on every accepted mutation.
    pub revision: u64,
    /// Set when an event could only be used as a trigger for a fresh snapshot.
    pub pending_refresh: bool,
}

impl LocalView {
    /// Action gate: the game is active and `player` owns the current turn.
    pub fn is_turn_of(&self, player: &Identity) -> bool {
        self.snapshot.status == Status::Active
            && self.snapshot.slot_of(player) == Some(self.snapshot.current_turn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Immediate,
    AfterPayoutDelay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub view: LocalView,
    pub changed: bool,
    pub refresh: Option<Refresh>,
}

impl Transition {
    fn unchanged(view: &LocalView) -> Self {
        Self {
            view: view.clone(),
            changed: false,
            refresh: None,
        }
    }

    fn refresh_only(view: &LocalView, refresh: Refresh) -> Self {
        Self {
            view: view.clone(),
            changed: false,
            refresh: Some(refresh),
        }
    }

    fn changed(mut view: LocalView, refresh: Option<Refresh>) -> Self {
        view.revision += 1;
        Self {
            view,
            changed: true,
            refresh,
        }
    }
}

/// Applies one event optimistically. Events that do not advance the view
/// (duplicates, replays, other games, unknown kinds) leave it untouched.
pub fn apply(view: &LocalView, event: &DomainEvent) -> Transition {
    if event.game_id != view.game_id {
        return Transition::unchanged(view);
    }
    let snapshot = &view.snapshot;
    match &event.kind {
        EventKind::MovePlayed(played) => apply_move(view, played),
        EventKind::Started(_) => {
            if snapshot.participant_b.is_some() && snapshot.status != Status::Waiting {
                return Transition::unchanged(view);
            }
            let mut next = view.clone();
            next.pending_refresh = true;
            Transition::changed(next, Some(Refresh::Immediate))
        }
        EventKind::Won(won) => {
            if snapshot.status.is_terminal() {
                return Transition::unchanged(view);
            }
            let mut next = view.clone();
            next.snapshot.status = Status::Won;
            next.snapshot.winner = Some(won.winner);
            Transition::changed(next, Some(Refresh::AfterPayoutDelay))
        }
        EventKind::Draw => {
            if snapshot.status.is_terminal() {
                return Transition::unchanged(view);
            }
            let mut next = view.clone();
            next.snapshot.status = Status::Draw;
            Transition::changed(next, Some(Refresh::AfterPayoutDelay))
        }
        EventKind::PrizeDistributed(_) => {
            if snapshot.prize_paid {
                return Transition::unchanged(view);
            }
            if !snapshot.status.is_terminal() {
                return Transition::refresh_only(view, Refresh::Immediate);
            }
            let mut next = view.clone();
            next.snapshot.prize_paid = true;
            Transition::changed(next, None)
        }
        EventKind::Created(_) | EventKind::Unknown(_) => Transition::unchanged(view),
    }
}

fn apply_move(view: &LocalView, played: &MovePlayedEvent) -> Transition {
    let snapshot = &view.snapshot;
    let (row, column) = (usize::from(played.row), usize::from(played.column));
    if row >= ROWS || column >= COLUMNS {
        return Transition::unchanged(view);
    }
    let Some(next_count) = snapshot.move_count.checked_add(1) else {
        // counter from an untrustworthy snapshot; only a fresh one can fix it
        return Transition::refresh_only(view, Refresh::Immediate);
    };
    let fresh_number = match played.move_number {
        Some(number) if number <= snapshot.move_count => {
            return Transition::unchanged(view);
        }
        Some(number) if number > next_count => {
            // missed at least one move
            return Transition::refresh_only(view, Refresh::Immediate);
        }
        Some(_) => true,
        None => false,
    };
    let Some(slot) = snapshot.slot_of(&played.actor) else {
        return Transition::refresh_only(view, Refresh::Immediate);
    };
    if snapshot.board.get(row, column) != Some(Cell::Empty) {
        if fresh_number {
            return Transition::refresh_only(view, Refresh::Immediate);
        }
        return Transition::unchanged(view);
    }
    let mut next = view.clone();
    next.snapshot.board.set(row, column, Cell::from(slot));
    next.snapshot.current_turn = slot.other();
    next.snapshot.move_count = next_count;
    Transition::changed(next, None)
}

/// Replaces the view with an authoritative snapshot. The snapshot always wins.
pub fn reconcile(
    previous: Option<&LocalView>,
    game_id: GameId,
    snapshot: Snapshot,
) -> LocalView {
    let revision = match previous {
        Some(view) if view.game_id == game_id => view.revision + 1,
        _ => 1,
    };
    LocalView {
        game_id,
        snapshot,
        revision,
        pending_refresh: false,
    }
}

/// Holder of the current view for the selected game.
#[derive(Debug, Default)]
pub struct Reconciler {
    current: Option<LocalView>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&LocalView> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Applies an event and returns the refresh it asks for, if any.
    pub fn apply(&mut self, event: &DomainEvent) -> Option<Refresh> {
        let Some(view) = self.current.as_ref() else {
            // nothing to apply onto until the first snapshot lands
            return Some(Refresh::Immediate);
        };
        let transition = apply(view, event);
        if transition.changed {
            tracing::debug!(
                game_id = %event.game_id,
                kind = event.kind.name(),
                revision = transition.view.revision,
                "applied event optimistically"
            );
            self.current = Some(transition.view);
        } else {
            tracing::trace!(
                game_id = %event.game_id,
                kind = event.kind.name(),
                "event did not advance the view"
            );
        }
        transition.refresh
    }

    pub fn reconcile(&mut self, game_id: GameId, snapshot: Snapshot) {
        let view = reconcile(self.current.as_ref(), game_id, snapshot);
        self.current = Some(view);
    }
}
