use crate::game::GameId;
use thiserror::Error;

/// Failure of the snapshot query interface, for one game or the lobby list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("snapshot for game {game_id} unavailable: {reason}")]
    Unavailable { game_id: GameId, reason: String },

    #[error("snapshot for game {game_id} is malformed: {reason}")]
    Malformed { game_id: GameId, reason: String },

    #[error("game list unavailable: {0}")]
    ListUnavailable(String),

    #[error("game list is malformed: {0}")]
    ListMalformed(String),
}

/// Failure of the push subscription transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect event stream: {0}")]
    Connect(String),

    #[error("event stream protocol error: {0}")]
    Protocol(String),
}

/// Failure to submit a move. Never mutates the local view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("no game selected")]
    NoSelection,

    #[error("it is not the local player's turn")]
    NotYourTurn,

    #[error("column {0} is outside the board")]
    InvalidColumn(u8),

    #[error("move rejected: {0}")]
    Rejected(String),

    #[error("action interface unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identity {0}")]
    InvalidIdentity(String),

    #[error("invalid board: {0}")]
    InvalidBoard(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("sync engine stopped")]
    EngineStopped,
}
