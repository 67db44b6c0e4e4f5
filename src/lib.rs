//! Keeps a client-side view of one remote Connect Four game in sync with the
//! chain, combining pushed events with periodic snapshot reads. Alongside it
//! run a polled lobby of recent games and a contract-wide event feed.

use std::path::Path;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod game;
pub mod lobby;
pub mod notification;
pub mod reconciler;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use app::{
    Connectivity,
    SyncEngine,
    SyncState,
    http_game_api::GameApiClient,
    move_submitter::play_move,
    ws_event_subscriber::WsEventSubscriber,
};
pub use error::Error;
pub use feed::EventFeed;
pub use lobby::Lobby;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub const LOG_FILE_PREFIX: &str = "connect-four-sync.log";

/// Installs the global subscriber. Filtering follows `RUST_LOG`, defaulting
/// to `info`. With `log_dir` set, output goes to a daily rolling file and the
/// returned guard must be kept alive to flush it.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));
            let _ = fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}
