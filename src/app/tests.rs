#![allow(non_snake_case)]

use super::*;
use crate::{
    app::move_submitter::play_move,
    error::ActionError,
    events::DomainEvent,
    game::{
        Cell,
        Slot,
        Status,
        Wei,
    },
    test_helpers::*,
};
use tokio::time;

const GAME: GameId = GameId(7);
const OTHER_GAME: GameId = GameId(8);

struct Harness {
    engine: SyncEngine,
    fetcher: FakeFetcher,
    subscriber: FakeSubscriber,
}

impl Harness {
    fn start(local_player: Option<Identity>) -> Self {
        let fetcher = FakeFetcher::new();
        let subscriber = FakeSubscriber::new();
        let engine = SyncEngine::start(
            fetcher.clone(),
            subscriber.clone(),
            test_config(),
            local_player,
        );
        Self {
            engine,
            fetcher,
            subscriber,
        }
    }

    async fn select_active(local_player: Option<Identity>) -> Self {
        let harness = Self::start(local_player);
        harness.fetcher.set_snapshot(GAME, active_game());
        harness.engine.select(GAME).unwrap();
        settle().await;
        harness
    }

    fn view(&self) -> LocalView {
        self.engine.state().view.expect("view should be present")
    }
}

#[tokio::test(start_paused = true)]
async fn select__fetches_snapshot_and_goes_live() {
    // given
    let harness = Harness::start(Some(alice()));
    harness.fetcher.set_snapshot(GAME, active_game());

    // when
    harness.engine.select(GAME).unwrap();
    settle().await;

    // then
    let state = harness.engine.state();
    assert_eq!(state.selected, Some(GAME));
    assert_eq!(state.connectivity, Connectivity::Live);
    assert_eq!(state.view.map(|view| view.snapshot), Some(active_game()));
    assert_eq!(harness.fetcher.calls(GAME), 1);
    assert_eq!(harness.subscriber.open_links(GAME), 1);
    assert!(harness.engine.can_move());
}

#[tokio::test(start_paused = true)]
async fn move_event__updates_board_and_turn_without_fetching() {
    // given
    let harness = Harness::select_active(Some(alice())).await;

    // when
    harness.subscriber.push(
        GAME,
        vec![DomainEvent::move_played(GAME, 3, 0, alice(), Some(1))],
    );
    settle().await;

    // then
    let view = harness.view();
    assert_eq!(view.snapshot.board.get(0, 3), Some(Cell::A));
    assert_eq!(view.snapshot.current_turn, Slot::B);
    assert_eq!(view.snapshot.move_count, 1);
    assert!(!harness.engine.can_move());
    assert_eq!(harness.fetcher.calls(GAME), 1);
    let notification = harness.engine.state().notification.unwrap();
    assert_eq!(notification.message, "Red played column 3");
}

#[tokio::test(start_paused = true)]
async fn won_event__applies_at_once_then_refreshes_after_payout_delay() {
    // given
    let harness = Harness::select_active(None).await;
    let settled = Snapshot {
        status: Status::Won,
        winner: Some(alice()),
        prize_paid: true,
        ..active_game()
    };
    harness.fetcher.set_snapshot(GAME, settled.clone());

    // when
    harness
        .subscriber
        .push(GAME, vec![DomainEvent::won(GAME, alice())]);
    settle().await;

    // then
    let view = harness.view();
    assert_eq!(view.snapshot.status, Status::Won);
    assert_eq!(view.snapshot.winner, Some(alice()));
    assert!(!view.snapshot.prize_paid);
    assert_eq!(harness.fetcher.calls(GAME), 1);

    time::advance(PAYOUT_DELAY).await;
    settle().await;

    assert_eq!(harness.fetcher.calls(GAME), 2);
    assert_eq!(harness.view().snapshot, settled);
}

#[tokio::test(start_paused = true)]
async fn refresh_triggers__while_fetch_in_flight__issue_a_single_fetch() {
    // given
    let harness = Harness::start(None);
    harness.fetcher.set_snapshot(GAME, active_game());
    harness.fetcher.hold(GAME);
    harness.engine.select(GAME).unwrap();
    settle().await;

    // when
    harness.engine.refresh().unwrap();
    harness
        .subscriber
        .push(GAME, vec![DomainEvent::started(GAME, bob())]);
    time::advance(POLL_INTERVAL).await;
    settle().await;
    harness.fetcher.release(GAME);
    settle().await;

    // then
    assert_eq!(harness.fetcher.calls(GAME), 1);
    assert_eq!(harness.view().snapshot, active_game());
}

#[tokio::test(start_paused = true)]
async fn poll_timer__refetches_every_interval() {
    // given
    let harness = Harness::select_active(None).await;

    // when
    time::advance(POLL_INTERVAL).await;
    settle().await;
    time::advance(POLL_INTERVAL).await;
    settle().await;

    // then
    assert_eq!(harness.fetcher.calls(GAME), 3);
}

#[tokio::test(start_paused = true)]
async fn late_move__after_newer_snapshot__is_ignored() {
    // given
    let harness = Harness::start(None);
    let mut newer = active_game();
    newer.board.set(0, 3, Cell::A);
    newer.board.set(0, 4, Cell::B);
    newer.move_count = 2;
    harness.fetcher.set_snapshot(GAME, newer.clone());
    harness.engine.select(GAME).unwrap();
    settle().await;
    let before = harness.view();

    // when
    harness.subscriber.push(
        GAME,
        vec![DomainEvent::move_played(GAME, 3, 0, alice(), Some(1))],
    );
    settle().await;

    // then
    assert_eq!(harness.view(), before);
    assert_eq!(harness.fetcher.calls(GAME), 1);
}

#[tokio::test(start_paused = true)]
async fn select__switching_games__discards_events_from_previous_selection() {
    // given
    let harness = Harness::select_active(None).await;
    let stale_sink = harness.subscriber.latest_sink(GAME).unwrap();
    let other = Snapshot::waiting(bob(), Wei(1));
    harness.fetcher.set_snapshot(OTHER_GAME, other.clone());

    // when
    harness.engine.select(OTHER_GAME).unwrap();
    settle().await;
    stale_sink.deliver(vec![DomainEvent::move_played(GAME, 0, 0, alice(), Some(1))]);
    stale_sink.liveness_lost("late failure");
    settle().await;

    // then
    let state = harness.engine.state();
    assert_eq!(state.selected, Some(OTHER_GAME));
    assert_eq!(state.connectivity, Connectivity::Live);
    assert_eq!(state.view.map(|view| view.snapshot), Some(other));
    assert_eq!(harness.subscriber.open_links(GAME), 0);
    assert_eq!(harness.subscriber.open_links(OTHER_GAME), 1);
}

#[tokio::test(start_paused = true)]
async fn select__switching_during_fetch__never_shows_previous_game() {
    // given
    let harness = Harness::start(None);
    harness.fetcher.set_snapshot(GAME, active_game());
    harness.fetcher.hold(GAME);
    harness.engine.select(GAME).unwrap();
    settle().await;
    harness
        .fetcher
        .set_snapshot(OTHER_GAME, Snapshot::waiting(bob(), Wei(1)));

    // when
    harness.engine.select(OTHER_GAME).unwrap();
    settle().await;
    harness.fetcher.release(GAME);
    settle().await;

    // then
    let view = harness.view();
    assert_eq!(view.game_id, OTHER_GAME);
    assert_eq!(view.snapshot.participant_a, bob());
}

#[tokio::test(start_paused = true)]
async fn subscription_opened_after_switch__is_closed_not_adopted() {
    // the open may win or lose the race with the switch; both must end closed
    for _ in 0..8 {
        // given
        let harness = Harness::start(None);
        harness.fetcher.set_snapshot(GAME, active_game());
        harness
            .fetcher
            .set_snapshot(OTHER_GAME, Snapshot::waiting(bob(), Wei(1)));
        harness.subscriber.hold_opens(GAME);
        harness.engine.select(GAME).unwrap();
        settle().await;
        assert_eq!(harness.subscriber.attempts(GAME), 1);

        // when
        harness.subscriber.release_opens(GAME);
        harness.engine.select(OTHER_GAME).unwrap();
        settle().await;

        // then
        let state = harness.engine.state();
        assert_eq!(state.selected, Some(OTHER_GAME));
        assert_eq!(state.connectivity, Connectivity::Live);
        assert_eq!(harness.subscriber.open_links(GAME), 0);
        assert_eq!(harness.subscriber.open_links(OTHER_GAME), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn event_before_first_snapshot__is_replayed_onto_it() {
    // given
    let harness = Harness::start(None);
    harness.fetcher.set_snapshot(GAME, active_game());
    harness.fetcher.hold(GAME);
    harness.engine.select(GAME).unwrap();
    settle().await;

    // when
    harness.subscriber.push(
        GAME,
        vec![DomainEvent::move_played(GAME, 3, 0, alice(), Some(1))],
    );
    settle().await;
    harness.fetcher.release(GAME);
    settle().await;

    // then
    let view = harness.view();
    assert_eq!(view.snapshot.board.get(0, 3), Some(Cell::A));
    assert_eq!(view.snapshot.move_count, 1);
    assert_eq!(view.snapshot.current_turn, Slot::B);
    assert_eq!(harness.fetcher.calls(GAME), 1);
}

#[tokio::test(start_paused = true)]
async fn event_before_first_snapshot__already_in_snapshot__is_not_applied_twice() {
    // given
    let harness = Harness::start(None);
    let mut moved = active_game();
    moved.board.set(0, 3, Cell::A);
    moved.current_turn = Slot::B;
    moved.move_count = 1;
    harness.fetcher.set_snapshot(GAME, moved.clone());
    harness.fetcher.hold(GAME);
    harness.engine.select(GAME).unwrap();
    settle().await;

    // when
    harness.subscriber.push(
        GAME,
        vec![DomainEvent::move_played(GAME, 3, 0, alice(), None)],
    );
    settle().await;
    harness.fetcher.release(GAME);
    settle().await;

    // then
    assert_eq!(harness.view().snapshot, moved);
}

#[tokio::test(start_paused = true)]
async fn move_on_exhausted_counter__refetches_and_engine_keeps_serving() {
    // given
    let harness = Harness::start(None);
    let mut corrupt = active_game();
    corrupt.move_count = u32::MAX;
    harness.fetcher.set_snapshot(GAME, corrupt.clone());
    harness
        .fetcher
        .set_snapshot(OTHER_GAME, Snapshot::waiting(bob(), Wei(1)));
    harness.engine.select(GAME).unwrap();
    settle().await;

    // when
    harness.subscriber.push(
        GAME,
        vec![DomainEvent::move_played(GAME, 3, 0, alice(), None)],
    );
    settle().await;

    // then
    assert_eq!(harness.view().snapshot, corrupt);
    assert_eq!(harness.fetcher.calls(GAME), 2);
    assert!(harness.engine.select(OTHER_GAME).is_ok());
    settle().await;
    assert_eq!(harness.view().game_id, OTHER_GAME);
}

#[tokio::test(start_paused = true)]
async fn liveness_lost__falls_back_to_polling_then_resubscribes() {
    // given
    let harness = Harness::select_active(None).await;

    // when
    harness.subscriber.drop_stream(GAME);
    settle().await;

    // then
    assert_eq!(harness.engine.state().connectivity, Connectivity::PollOnly);
    assert_eq!(harness.subscriber.open_links(GAME), 0);

    time::advance(RESUBSCRIBE_INITIAL).await;
    settle().await;

    assert_eq!(harness.engine.state().connectivity, Connectivity::Live);
    assert_eq!(harness.subscriber.attempts(GAME), 2);
    assert_eq!(harness.subscriber.open_links(GAME), 1);
    // missed events are recovered through a snapshot
    assert_eq!(harness.fetcher.calls(GAME), 2);
}

#[tokio::test(start_paused = true)]
async fn open_failure__retries_with_growing_backoff() {
    // given
    let harness = Harness::start(None);
    harness.fetcher.set_snapshot(GAME, active_game());
    harness.subscriber.refuse_next(GAME, 2);

    // when
    harness.engine.select(GAME).unwrap();
    settle().await;

    // then
    assert_eq!(harness.engine.state().connectivity, Connectivity::PollOnly);
    assert!(harness.engine.state().view.is_some());

    time::advance(RESUBSCRIBE_INITIAL).await;
    settle().await;
    assert_eq!(harness.subscriber.attempts(GAME), 2);
    assert_eq!(harness.engine.state().connectivity, Connectivity::PollOnly);

    time::advance(RESUBSCRIBE_INITIAL).await;
    settle().await;
    assert_eq!(harness.subscriber.attempts(GAME), 2);

    time::advance(RESUBSCRIBE_INITIAL).await;
    settle().await;
    assert_eq!(harness.subscriber.attempts(GAME), 3);
    assert_eq!(harness.engine.state().connectivity, Connectivity::Live);
}

#[tokio::test(start_paused = true)]
async fn retry_subscription__reopens_immediately() {
    // given
    let harness = Harness::start(None);
    harness.fetcher.set_snapshot(GAME, active_game());
    harness.subscriber.refuse_next(GAME, 1);
    harness.engine.select(GAME).unwrap();
    settle().await;

    // when
    harness.engine.retry_subscription().unwrap();
    settle().await;

    // then
    assert_eq!(harness.subscriber.attempts(GAME), 2);
    assert_eq!(harness.engine.state().connectivity, Connectivity::Live);
}

#[tokio::test(start_paused = true)]
async fn fetch_error__keeps_last_known_view() {
    // given
    let harness = Harness::select_active(None).await;
    let before = harness.view();
    let error = FetchError::Unavailable {
        game_id: GAME,
        reason: "rpc timeout".to_string(),
    };
    harness.fetcher.fail(GAME, error.clone());

    // when
    harness.engine.refresh().unwrap();
    settle().await;

    // then
    let state = harness.engine.state();
    assert_eq!(state.view, Some(before));
    assert_eq!(state.last_fetch_error, Some(error));
}

#[tokio::test(start_paused = true)]
async fn fetch_error__before_first_snapshot__leaves_view_empty() {
    // given
    let harness = Harness::start(None);

    // when
    harness.engine.select(GAME).unwrap();
    settle().await;

    // then
    let state = harness.engine.state();
    assert_eq!(state.selected, Some(GAME));
    assert!(state.view.is_none());
    assert!(state.last_fetch_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn deselect__clears_state_and_stops_polling() {
    // given
    let harness = Harness::select_active(None).await;

    // when
    harness.engine.deselect().unwrap();
    settle().await;
    time::advance(POLL_INTERVAL).await;
    settle().await;

    // then
    let state = harness.engine.state();
    assert_eq!(state.selected, None);
    assert_eq!(state.view, None);
    assert_eq!(state.connectivity, Connectivity::Idle);
    assert_eq!(harness.subscriber.open_links(GAME), 0);
    assert_eq!(harness.fetcher.calls(GAME), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown__closes_subscription() {
    // given
    let harness = Harness::select_active(None).await;
    let subscriber = harness.subscriber.clone();

    // when
    harness.engine.shutdown().await.unwrap();

    // then
    assert_eq!(subscriber.open_links(GAME), 0);
}

#[tokio::test(start_paused = true)]
async fn play_move__on_our_turn__forwards_to_submitter() {
    // given
    let harness = Harness::select_active(Some(alice())).await;
    let submitter = FakeSubmitter::new();

    // when
    let result = play_move(&harness.engine, &submitter, 3).await;

    // then
    assert_eq!(result, Ok(()));
    assert_eq!(submitter.submitted(), vec![(GAME, 3)]);
}

#[tokio::test(start_paused = true)]
async fn play_move__not_our_turn__is_refused_locally() {
    let harness = Harness::select_active(Some(bob())).await;
    let submitter = FakeSubmitter::new();

    let result = play_move(&harness.engine, &submitter, 3).await;

    assert_eq!(result, Err(ActionError::NotYourTurn));
    assert!(submitter.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn play_move__spectator__is_refused_locally() {
    let harness = Harness::select_active(Some(stranger())).await;
    let submitter = FakeSubmitter::new();

    let result = play_move(&harness.engine, &submitter, 0).await;

    assert_eq!(result, Err(ActionError::NotYourTurn));
}

#[tokio::test(start_paused = true)]
async fn play_move__without_selection__is_refused() {
    let harness = Harness::start(Some(alice()));
    let submitter = FakeSubmitter::new();

    let result = play_move(&harness.engine, &submitter, 0).await;

    assert_eq!(result, Err(ActionError::NoSelection));
}

#[tokio::test(start_paused = true)]
async fn play_move__column_off_board__is_refused() {
    let harness = Harness::select_active(Some(alice())).await;
    let submitter = FakeSubmitter::new();

    let result = play_move(&harness.engine, &submitter, 7).await;

    assert_eq!(result, Err(ActionError::InvalidColumn(7)));
}

#[tokio::test(start_paused = true)]
async fn play_move__rejected__leaves_view_untouched() {
    // given
    let harness = Harness::select_active(Some(alice())).await;
    let before = harness.view();
    let submitter = FakeSubmitter::new();
    submitter.reject_with(ActionError::Rejected("column full".to_string()));

    // when
    let result = play_move(&harness.engine, &submitter, 2).await;
    settle().await;

    // then
    assert_eq!(
        result,
        Err(ActionError::Rejected("column full".to_string()))
    );
    assert_eq!(harness.view(), before);
}
