use crate::{
    app::{
        move_submitter::MoveSubmitter,
        snapshot_fetcher::SnapshotFetcher,
    },
    error::{
        ActionError,
        Error,
        FetchError,
    },
    game::{
        Board,
        GameId,
        GameSummary,
        Identity,
        Slot,
        Snapshot,
        Status,
        Wei,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use reqwest::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP adapter for the game API: snapshot reads, the lobby list and move
/// submission.
#[derive(Clone)]
pub struct GameApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl GameApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("failed to build HTTP client for game api")?;
        Ok(Self { base_url, http })
    }

    fn game_url(&self, game_id: GameId) -> String {
        format!("{}/games/{}", self.base_url, game_id.0)
    }

    fn games_url(&self) -> String {
        format!("{}/games", self.base_url)
    }
}

impl SnapshotFetcher for GameApiClient {
    async fn fetch(&self, game_id: GameId) -> Result<Snapshot, FetchError> {
        let unavailable = |reason: String| FetchError::Unavailable { game_id, reason };
        let res = self
            .http
            .get(self.game_url(game_id))
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {e}")))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| unavailable(format!("failed to read response body: {e}")))?;
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::Malformed {
                game_id,
                reason: "game does not exist".to_string(),
            });
        }
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(unavailable(format!("api responded with {status}: {body}")));
        }
        let malformed = |reason: String| FetchError::Malformed { game_id, reason };
        let dto: SnapshotDto = serde_json::from_slice(&bytes)
            .map_err(|e| malformed(format!("invalid snapshot payload: {e}")))?;
        Snapshot::try_from(dto).map_err(|e| malformed(e.to_string()))
    }

    async fn list_games(&self, limit: usize) -> Result<Vec<GameSummary>, FetchError> {
        let res = self
            .http
            .get(self.games_url())
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| FetchError::ListUnavailable(format!("request failed: {e}")))?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|e| {
            FetchError::ListUnavailable(format!("failed to read response body: {e}"))
        })?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(FetchError::ListUnavailable(format!(
                "api responded with {status}: {body}"
            )));
        }
        let dtos: Vec<GameSummaryDto> = serde_json::from_slice(&bytes).map_err(|e| {
            FetchError::ListMalformed(format!("invalid game list payload: {e}"))
        })?;
        newest_first(dtos, limit).map_err(|e| FetchError::ListMalformed(e.to_string()))
    }
}

fn newest_first(dtos: Vec<GameSummaryDto>, limit: usize) -> Result<Vec<GameSummary>, Error> {
    let mut games = dtos
        .into_iter()
        .map(GameSummary::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    games.sort_by(|a, b| b.game_id.cmp(&a.game_id));
    games.truncate(limit);
    Ok(games)
}

impl MoveSubmitter for GameApiClient {
    async fn submit_move(&self, game_id: GameId, column: u8) -> Result<(), ActionError> {
        let url = format!("{}/moves", self.game_url(game_id));
        let res = self
            .http
            .post(url)
            .json(&MoveRequestDto { column })
            .send()
            .await
            .map_err(|e| ActionError::Unavailable(format!("request failed: {e}")))?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ActionError::Rejected(format!("{status}: {body}")))
        } else {
            Err(ActionError::Unavailable(format!("{status}: {body}")))
        }
    }
}

#[derive(Debug, Serialize)]
struct MoveRequestDto {
    column: u8,
}

#[derive(Debug, Deserialize)]
struct GameSummaryDto {
    id: u64,
    player1: String,
    player2: String,
    status: u8,
    stake: String,
}

impl TryFrom<GameSummaryDto> for GameSummary {
    type Error = Error;

    fn try_from(dto: GameSummaryDto) -> Result<Self, Self::Error> {
        let game_id = GameId(dto.id);
        let participant_a = Identity::parse_optional(&dto.player1)?.ok_or_else(|| {
            Error::InvalidBoard(format!("game {game_id} has no creator"))
        })?;
        let status = Status::from_wire(dto.status).ok_or_else(|| {
            Error::InvalidBoard(format!("game {game_id} has unknown status {}", dto.status))
        })?;
        let stake = dto.stake.parse::<Wei>().map_err(|_| {
            Error::InvalidBoard(format!("game {game_id} has invalid stake {}", dto.stake))
        })?;
        Ok(GameSummary {
            game_id,
            participant_a,
            participant_b: Identity::parse_optional(&dto.player2)?,
            status,
            stake,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotDto {
    player1: String,
    player2: String,
    current_turn: u8,
    status: u8,
    /// Wei as a decimal string; u128 does not fit a JSON number.
    stake: String,
    winner: String,
    prize_paid: bool,
    move_count: u32,
    board: Vec<Vec<u8>>,
}

impl TryFrom<SnapshotDto> for Snapshot {
    type Error = Error;

    fn try_from(dto: SnapshotDto) -> Result<Self, Self::Error> {
        let participant_a = Identity::parse_optional(&dto.player1)?
            .ok_or_else(|| Error::InvalidBoard("game does not exist".to_string()))?;
        // a game nobody has moved in yet may report turn 0
        let current_turn = match dto.current_turn {
            0 => Slot::A,
            other => Slot::from_wire(other).ok_or_else(|| {
                Error::InvalidBoard(format!("unknown turn marker {other}"))
            })?,
        };
        let status = Status::from_wire(dto.status)
            .ok_or_else(|| Error::InvalidBoard(format!("unknown status {}", dto.status)))?;
        let stake = dto
            .stake
            .parse::<Wei>()
            .map_err(|_| Error::InvalidBoard(format!("invalid stake {}", dto.stake)))?;
        let board = Board::from_rows(&dto.board)?;
        if usize::try_from(dto.move_count).ok() != Some(board.occupied()) {
            return Err(Error::InvalidBoard(format!(
                "move count {} does not match {} occupied cells",
                dto.move_count,
                board.occupied()
            )));
        }
        Ok(Snapshot {
            participant_a,
            participant_b: Identity::parse_optional(&dto.player2)?,
            current_turn,
            status,
            stake,
            winner: Identity::parse_optional(&dto.winner)?,
            prize_paid: dto.prize_paid,
            move_count: dto.move_count,
            board,
        })
    }
}
