use crate::{
    app::SyncEngine,
    error::ActionError,
    game::{
        COLUMNS,
        GameId,
    },
};

pub trait MoveSubmitter: Send + Sync {
    /// Submit a move. Confirmation arrives later as an event or snapshot.
    fn submit_move(
        &self,
        game_id: GameId,
        column: u8,
    ) -> impl Future<Output = Result<(), ActionError>> + Send;
}

/// Checks the action gate against the engine's current view and forwards the
/// move. The view is left untouched whatever the outcome.
pub async fn play_move<M: MoveSubmitter>(
    engine: &SyncEngine,
    submitter: &M,
    column: u8,
) -> Result<(), ActionError> {
    if usize::from(column) >= COLUMNS {
        return Err(ActionError::InvalidColumn(column));
    }
    let state = engine.state();
    let game_id = state.selected.ok_or(ActionError::NoSelection)?;
    if !state.can_move() {
        return Err(ActionError::NotYourTurn);
    }
    tracing::info!(%game_id, column, "submitting move");
    submitter.submit_move(game_id, column).await.inspect_err(|e| {
        tracing::warn!(%game_id, column, error = %e, "move submission failed");
    })
}
