use crate::game::{
    GameId,
    Identity,
    Wei,
};

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct DomainEvent {
    pub game_id: GameId,
    pub kind: EventKind,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum EventKind {
    Created(CreatedEvent),
    Started(StartedEvent),
    MovePlayed(MovePlayedEvent),
    Won(WonEvent),
    Draw,
    PrizeDistributed(PrizeDistributedEvent),
    /// Kinds this client does not understand; carried so they can be logged.
    Unknown(String),
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct CreatedEvent {
    pub creator: Identity,
    pub stake: Wei,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct StartedEvent {
    pub participant_b: Identity,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct MovePlayedEvent {
    pub column: u8,
    pub row: u8,
    pub actor: Identity,
    // 1-based index of this move, when the relay provides it
    pub move_number: Option<u32>,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct WonEvent {
    pub winner: Identity,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct PrizeDistributedEvent {
    pub recipient: Identity,
    pub amount: Wei,
}

impl EventKind {
    pub fn name(&self) -> &str {
        match self {
            EventKind::Created(_) => "GameCreated",
            EventKind::Started(_) => "GameStarted",
            EventKind::MovePlayed(_) => "MovePlayed",
            EventKind::Won(_) => "GameWon",
            EventKind::Draw => "GameDraw",
            EventKind::PrizeDistributed(_) => "PrizeDistributed",
            EventKind::Unknown(name) => name,
        }
    }
}

impl DomainEvent {
    pub fn new(game_id: GameId, kind: EventKind) -> Self {
        Self { game_id, kind }
    }

    pub fn created(game_id: GameId, creator: Identity, stake: Wei) -> Self {
        Self::new(game_id, EventKind::Created(CreatedEvent { creator, stake }))
    }

    pub fn started(game_id: GameId, participant_b: Identity) -> Self {
        Self::new(game_id, EventKind::Started(StartedEvent { participant_b }))
    }

    pub fn move_played(
        game_id: GameId,
        column: u8,
        row: u8,
        actor: Identity,
        move_number: Option<u32>,
    ) -> Self {
        let inner = MovePlayedEvent {
            column,
            row,
            actor,
            move_number,
        };
        Self::new(game_id, EventKind::MovePlayed(inner))
    }

    pub fn won(game_id: GameId, winner: Identity) -> Self {
        Self::new(game_id, EventKind::Won(WonEvent { winner }))
    }

    pub fn draw(game_id: GameId) -> Self {
        Self::new(game_id, EventKind::Draw)
    }

    pub fn prize_distributed(game_id: GameId, recipient: Identity, amount: Wei) -> Self {
        let inner = PrizeDistributedEvent { recipient, amount };
        Self::new(game_id, EventKind::PrizeDistributed(inner))
    }
}
