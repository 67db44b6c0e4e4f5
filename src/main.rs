use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use connect_four_sync::{
    EventFeed,
    GameApiClient,
    Lobby,
    SyncEngine,
    SyncState,
    WsEventSubscriber,
    config::{
        Backoff,
        DEFAULT_API_URL,
        DEFAULT_WS_URL,
        LobbyConfig,
        SyncConfig,
    },
    feed::FeedState,
    game::{
        COLUMNS,
        GameId,
        Identity,
        Status,
    },
    init_tracing,
    lobby::LobbyState,
    notification::CURRENCY_TICKER,
    play_move,
};
use std::{
    path::PathBuf,
    str::FromStr,
    sync::OnceLock,
    time::Duration,
};
use tokio::io::{
    AsyncBufReadExt,
    BufReader,
};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    #[arg(long, default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Game to watch on startup
    #[arg(short, long)]
    game: Option<u64>,

    /// Local player address; without it the game is only watched
    #[arg(short, long)]
    player: Option<String>,

    #[arg(long, default_value_t = 15)]
    poll_interval_secs: u64,

    #[arg(long, default_value_t = 3)]
    payout_delay_secs: u64,

    #[arg(long, default_value_t = 6)]
    lobby_interval_secs: u64,

    /// Only print the contract-wide event feed
    #[arg(short, long)]
    watch: bool,

    /// Write logs to a daily rolling file here instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Play(u8),
    Refresh,
    Select(GameId),
    Deselect,
    Lobby,
    Feed,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let mut parts = line.split_whitespace();
    let input = match parts.next()? {
        "q" | "quit" => Input::Quit,
        "r" | "refresh" => Input::Refresh,
        "d" | "deselect" => Input::Deselect,
        "l" | "lobby" => Input::Lobby,
        "f" | "feed" => Input::Feed,
        "g" | "game" => Input::Select(GameId(parts.next()?.parse().ok()?)),
        column => Input::Play(column.parse().ok()?),
    };
    Some(input)
}

fn print_help() {
    println!(
        "commands: 0-{} play column, r refresh, g <id> select game, d deselect, \
         l lobby, f feed, q quit",
        COLUMNS - 1
    );
}

fn render(state: &SyncState) {
    println!();
    let Some(game_id) = state.selected else {
        println!("No game selected.");
        return;
    };
    match &state.view {
        None => println!("Game {game_id}: loading..."),
        Some(view) => {
            let snapshot = &view.snapshot;
            println!("Game {game_id}: {}", snapshot.status);
            println!("  Red:    {}", snapshot.participant_a);
            match snapshot.participant_b {
                Some(b) => println!("  Yellow: {b}"),
                None => println!("  Yellow: waiting..."),
            }
            println!(
                "  Stake:  {} {CURRENCY_TICKER}   Moves: {}",
                snapshot.stake, snapshot.move_count
            );
            if snapshot.status == Status::Active {
                println!("  Turn:   {}", snapshot.current_turn.label());
            }
            if let Some(winner) = snapshot.winner {
                println!("  Winner: {winner}");
            }
            if snapshot.status.is_terminal() {
                let paid = if snapshot.prize_paid { "yes" } else { "pending" };
                println!("  Prize paid: {paid}");
            }
            print!("{}", snapshot.board);
            if state.can_move() {
                println!("Your turn! Enter a column (0-{}).", COLUMNS - 1);
            }
        }
    }
    println!("Connection: {:?}", state.connectivity);
    if let Some(error) = &state.last_fetch_error {
        println!("Last refresh failed: {error}");
    }
    if let Some(notification) = &state.notification {
        println!(
            "[{}] {}",
            notification.at.format("%H:%M:%S"),
            notification.message
        );
    }
}

fn render_lobby(state: &LobbyState) {
    println!();
    println!("Recent games:");
    if state.games.is_empty() {
        println!("  (none)");
    }
    for game in &state.games {
        let opponent = game
            .participant_b
            .map(|b| b.short())
            .unwrap_or_else(|| "open".to_string());
        println!(
            "  {:>6}  {:<8} {} {CURRENCY_TICKER}  {} vs {}",
            game.game_id.to_string(),
            game.status.to_string(),
            game.stake,
            game.participant_a.short(),
            opponent
        );
    }
    if let Some(at) = state.refreshed_at {
        println!("Updated {}", at.format("%H:%M:%S"));
    }
    if let Some(error) = &state.last_error {
        println!("Last lobby refresh failed: {error}");
    }
}

fn render_feed(state: &FeedState) {
    println!();
    let dot = if state.connected { "live" } else { "offline" };
    println!("Live events ({dot}):");
    if state.entries.is_empty() {
        println!("  waiting for events...");
    }
    for entry in &state.entries {
        println!("  [{}] {}", entry.at.format("%H:%M:%S"), entry.message);
    }
}

/// Prints feed entries as they arrive, oldest first.
async fn run_watch(feed: &EventFeed) -> Result<()> {
    let mut states = feed.watch();
    let mut printed = 0;
    let mut connected = false;
    println!("Watching all games, ctrl-c to stop.");
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Err(eyre!("event feed stopped unexpectedly"));
                }
                let state = states.borrow_and_update().clone();
                if state.connected != connected {
                    connected = state.connected;
                    println!("{}", if connected { "connected" } else { "disconnected, retrying" });
                }
                for entry in state.entries.iter().rev() {
                    if entry.seq <= printed {
                        continue;
                    }
                    println!(
                        "[{}] {} {}",
                        entry.at.format("%Y-%m-%d %H:%M:%S"),
                        entry.event.kind.name(),
                        entry.message
                    );
                    printed = entry.seq;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(());
            }
        }
    }
}

async fn run_loop(
    engine: &SyncEngine,
    api: &GameApiClient,
    lobby: &Lobby,
    feed: &EventFeed,
) -> Result<()> {
    let mut states = engine.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    render(&states.borrow_and_update().clone());

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Err(eyre!("sync engine stopped unexpectedly"));
                }
                let state = states.borrow_and_update().clone();
                render(&state);
            }
            line = lines.next_line() => {
                let Some(line) = line.wrap_err("failed to read stdin")? else {
                    return Ok(());
                };
                match parse_input(&line) {
                    Some(Input::Quit) => return Ok(()),
                    Some(Input::Play(column)) => {
                        if let Err(e) = play_move(engine, api, column).await {
                            println!("Move not sent: {e}");
                        }
                    }
                    Some(Input::Refresh) => engine.refresh()?,
                    Some(Input::Select(game_id)) => engine.select(game_id)?,
                    Some(Input::Deselect) => engine.deselect()?,
                    Some(Input::Lobby) => {
                        render_lobby(&lobby.state());
                        lobby.refresh()?;
                    }
                    Some(Input::Feed) => render_feed(&feed.state()),
                    None => print_help(),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    if let Some(guard) = init_tracing(args.log_dir.as_deref()) {
        let _ = LOG_GUARD.set(guard);
    }

    let subscriber =
        WsEventSubscriber::new(&args.ws_url).wrap_err("invalid --ws-url")?;
    let feed = EventFeed::start(subscriber.clone(), Backoff::default());
    if args.watch {
        let result = run_watch(&feed).await;
        feed.shutdown().await?;
        return result;
    }

    let local_player = args
        .player
        .as_deref()
        .map(Identity::from_str)
        .transpose()
        .wrap_err("invalid --player address")?;
    let api = GameApiClient::new(&args.api_url)?;
    let lobby = Lobby::start(
        api.clone(),
        LobbyConfig::default()
            .with_refresh_interval(Duration::from_secs(args.lobby_interval_secs.max(1))),
    );
    let config = SyncConfig::default()
        .with_poll_interval(Duration::from_secs(args.poll_interval_secs.max(1)))
        .with_payout_refresh_delay(Duration::from_secs(args.payout_delay_secs));

    let engine = SyncEngine::start(api.clone(), subscriber, config, local_player);
    if let Some(game) = args.game {
        engine.select(GameId(game))?;
    }
    print_help();

    let result = run_loop(&engine, &api, &lobby, &feed).await;
    engine.shutdown().await?;
    lobby.shutdown().await?;
    feed.shutdown().await?;
    tracing::info!("bye");
    result
}
