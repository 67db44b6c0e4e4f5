//! The lobby: the most recently created games, refreshed on a timer.

use crate::{
    Result,
    app::snapshot_fetcher::SnapshotFetcher,
    config::LobbyConfig,
    error::{
        Error,
        FetchError,
    },
    game::GameSummary,
};
use chrono::{
    DateTime,
    Local,
};
use std::sync::Arc;
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

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LobbyState {
    /// Newest first.
    pub games: Vec<GameSummary>,
    pub last_error: Option<FetchError>,
    pub refreshed_at: Option<DateTime<Local>>,
}

#[derive(Debug)]
enum LobbyCommand {
    Refresh,
    Shutdown,
}

type Listing = std::result::Result<Vec<GameSummary>, FetchError>;

pub struct Lobby {
    commands: mpsc::UnboundedSender<LobbyCommand>,
    state: watch::Receiver<LobbyState>,
    worker: JoinHandle<()>,
}

impl Lobby {
    /// Spawns the lobby worker. The first listing is requested at once.
    pub fn start<F: SnapshotFetcher>(fetcher: F, config: LobbyConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LobbyState::default());
        let worker = LobbyWorker {
            fetcher: Arc::new(fetcher),
            config,
            in_flight: None,
            state: state_tx,
        };
        let worker = tokio::spawn(worker.run(command_rx));
        Self {
            commands,
            state,
            worker,
        }
    }

    pub fn refresh(&self) -> Result<()> {
        self.commands
            .send(LobbyCommand::Refresh)
            .map_err(|_| Error::EngineStopped)
    }

    pub fn state(&self) -> LobbyState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LobbyState> {
        self.state.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(LobbyCommand::Shutdown);
        self.worker.await.map_err(|e| {
            warn!(error = %e, "lobby worker did not shut down cleanly");
            Error::EngineStopped
        })
    }
}

struct LobbyWorker<F> {
    fetcher: Arc<F>,
    config: LobbyConfig,
    in_flight: Option<JoinHandle<()>>,
    state: watch::Sender<LobbyState>,
}

impl<F: SnapshotFetcher> LobbyWorker<F> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LobbyCommand>) {
        let (listed, mut listings) = mpsc::unbounded_channel();
        let mut ticker = time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(size = self.config.size, "lobby worker started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LobbyCommand::Refresh) => self.request_listing(&listed, "manual"),
                    Some(LobbyCommand::Shutdown) | None => break,
                },
                Some(listing) = listings.recv() => self.on_listed(listing),
                _ = ticker.tick() => self.request_listing(&listed, "poll"),
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
        info!("lobby worker stopped");
    }

    fn request_listing(&mut self, listed: &mpsc::UnboundedSender<Listing>, reason: &'static str) {
        if self.in_flight.is_some() {
            debug!(reason, "game listing already in flight");
            return;
        }
        debug!(reason, "listing recent games");
        let fetcher = Arc::clone(&self.fetcher);
        let limit = self.config.size;
        let listed = listed.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let _ = listed.send(fetcher.list_games(limit).await);
        }));
    }

    fn on_listed(&mut self, listing: Listing) {
        self.in_flight = None;
        self.state.send_modify(|state| match listing {
            Ok(mut games) => {
                games.truncate(self.config.size);
                debug!(count = games.len(), "lobby refreshed");
                state.games = games;
                state.last_error = None;
                state.refreshed_at = Some(Local::now());
            }
            Err(e) => {
                warn!(error = %e, "lobby refresh failed; keeping last list");
                state.last_error = Some(e);
            }
        });
    }
}
