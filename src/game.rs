use crate::error::Error;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};

pub const ROWS: usize = 6;
pub const COLUMNS: usize = 7;
const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub u64);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 20-byte account address of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; 20]);

impl Identity {
    pub const ZERO: Identity = Identity([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// `0x` plus the first eight hex digits, as shown in event feeds.
    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}...", &full[..10])
    }

    /// Parses an address, mapping the zero address to `None`.
    pub fn parse_optional(raw: &str) -> Result<Option<Self>, Error> {
        let identity = Identity::from_str(raw)?;
        Ok((!identity.is_zero()).then_some(identity))
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| Error::InvalidIdentity(format!("{s}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Slot::A => "Red",
            Slot::B => "Yellow",
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Slot::A),
            2 => Some(Slot::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cell {
    #[default]
    Empty,
    A,
    B,
}

impl Cell {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Cell::Empty),
            1 => Some(Cell::A),
            2 => Some(Cell::B),
            _ => None,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Cell::Empty => " ",
            Cell::A => "X",
            Cell::B => "O",
        }
    }
}

impl From<Slot> for Cell {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::A => Cell::A,
            Slot::B => Cell::B,
        }
    }
}

/// Row 0 is the bottom of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Board([[Cell; COLUMNS]; ROWS]);

impl Board {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, row: usize, column: usize) -> Option<Cell> {
        self.0.get(row).and_then(|cells| cells.get(column)).copied()
    }

    pub fn set(&mut self, row: usize, column: usize, cell: Cell) {
        self.0[row][column] = cell;
    }

    pub fn occupied(&self) -> usize {
        self.0
            .iter()
            .flatten()
            .filter(|cell| **cell != Cell::Empty)
            .count()
    }

    pub fn from_rows(rows: &[Vec<u8>]) -> Result<Self, Error> {
        if rows.len() != ROWS {
            return Err(Error::InvalidBoard(format!(
                "expected {ROWS} rows, got {}",
                rows.len()
            )));
        }
        let mut board = Board::empty();
        for (r, row) in rows.iter().enumerate() {
            if row.len() != COLUMNS {
                return Err(Error::InvalidBoard(format!(
                    "row {r} has {} cells, expected {COLUMNS}",
                    row.len()
                )));
            }
            for (c, raw) in row.iter().enumerate() {
                let cell = Cell::from_wire(*raw).ok_or_else(|| {
                    Error::InvalidBoard(format!("cell ({r}, {c}) has value {raw}"))
                })?;
                board.set(r, c, cell);
            }
        }
        Ok(board)
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use itertools::Itertools;

        let separator = format!("  +{}", "---+".repeat(COLUMNS));
        writeln!(f, "    {}", (0..COLUMNS).join("   "))?;
        writeln!(f, "{separator}")?;
        for row in self.0.iter().rev() {
            let cells = row.iter().map(|cell| format!(" {} |", cell.symbol())).join("");
            writeln!(f, "  |{cells}")?;
            writeln!(f, "{separator}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Waiting,
    Active,
    Won,
    Draw,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Won | Status::Draw)
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::Waiting),
            1 => Some(Status::Active),
            2 => Some(Status::Won),
            3 => Some(Status::Draw),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Waiting => "Waiting for opponent",
            Status::Active => "Game in progress",
            Status::Won => "Game over — Winner!",
            Status::Draw => "Game over — Draw",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Wei(pub u128);

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / WEI_PER_ETHER;
        let fraction = self.0 % WEI_PER_ETHER;
        if fraction == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{fraction:018}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for Wei {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Wei)
    }
}

/// Authoritative point-in-time record of one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub participant_a: Identity,
    pub participant_b: Option<Identity>,
    pub current_turn: Slot,
    pub status: Status,
    pub stake: Wei,
    pub winner: Option<Identity>,
    pub prize_paid: bool,
    pub move_count: u32,
    pub board: Board,
}

impl Snapshot {
    /// A freshly created game waiting for its second participant.
    pub fn waiting(participant_a: Identity, stake: Wei) -> Self {
        Self {
            participant_a,
            participant_b: None,
            current_turn: Slot::A,
            status: Status::Waiting,
            stake,
            winner: None,
            prize_paid: false,
            move_count: 0,
            board: Board::empty(),
        }
    }

    pub fn slot_of(&self, identity: &Identity) -> Option<Slot> {
        if *identity == self.participant_a {
            Some(Slot::A)
        } else if self.participant_b.as_ref() == Some(identity) {
            Some(Slot::B)
        } else {
            None
        }
    }
}

/// One row of the game lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSummary {
    pub game_id: GameId,
    pub participant_a: Identity,
    pub participant_b: Option<Identity>,
    pub status: Status,
    pub stake: Wei,
}
