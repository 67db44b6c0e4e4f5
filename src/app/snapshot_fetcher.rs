use crate::{
    error::FetchError,
    game::{
        GameId,
        GameSummary,
        Snapshot,
    },
};

pub trait SnapshotFetcher: Send + Sync + 'static {
    /// Pull one full authoritative snapshot. No caching, no retries.
    fn fetch(
        &self,
        game_id: GameId,
    ) -> impl Future<Output = Result<Snapshot, FetchError>> + Send;

    /// The `limit` most recently created games, newest first.
    fn list_games(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<GameSummary>, FetchError>> + Send;
}
