use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// ---- Cards ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rank {
    Two = 2,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
        Rank::Ace,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Self {
        Card { rank, suit }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = match self.rank {
            Rank::Ace => "A",
            Rank::King => "K",
            Rank::Queen => "Q",
            Rank::Jack => "J",
            Rank::Ten => "10",
            Rank::Nine => "9",
            Rank::Eight => "8",
            Rank::Seven => "7",
            Rank::Six => "6",
            Rank::Five => "5",
            Rank::Four => "4",
            Rank::Three => "3",
            Rank::Two => "2",
        };
        let s = match self.suit {
            Suit::Clubs => "♣",
            Suit::Diamonds => "♦",
            Suit::Hearts => "♥",
            Suit::Spades => "♠",
        };
        write!(f, "{}{}", r, s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deck {
    pub cards: Vec<Card>,
}

impl Deck {
    /// Unshuffled 52 cards, clubs first.
    pub fn standard() -> Self {
        let mut cards = Vec::with_capacity(52);
        for &s in &[Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades] {
            for r in Rank::ALL {
                cards.push(Card { rank: r, suit: s });
            }
        }
        Deck { cards }
    }

    /// Shuffles with a caller supplied generator so a seeded rng reproduces the order.
    pub fn shuffled_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut deck = Deck::standard();
        deck.cards.shuffle(rng);
        deck
    }

    pub fn draw(&mut self) -> Option<Card> {
        self.cards.pop()
    }
}

/// ---- Table state ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preflop,
    Flop,
    Turn,
    River,
    Showdown,
    /// Fewer than two seats still hold chips.
    Finished,
}

impl Phase {
    pub fn is_betting(self) -> bool {
        matches!(self, Phase::Preflop | Phase::Flop | Phase::Turn | Phase::River)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Active,
    Folded,
    AllIn,
    SittingOut,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Fold,
    Check,
    Call,
    Bet,
    Raise,
    AllIn,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Fold => "fold",
            ActionKind::Check => "check",
            ActionKind::Call => "call",
            ActionKind::Bet => "bet",
            ActionKind::Raise => "raise",
            ActionKind::AllIn => "all_in",
        };
        f.write_str(s)
    }
}

/// One legal move for the seat to act. For bet/raise the amounts are the
/// total round contribution the seat ends up with ("raise to").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegalAction {
    pub action: ActionKind,
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRecord {
    pub seat: usize,
    pub action: ActionKind,
    /// Chips moved into the pot by this action.
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payout {
    pub seat: usize,
    pub amount: u64,
    /// Hand category name when the pot went to showdown.
    pub hand: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandResult {
    pub hand_number: u64,
    pub board: Vec<Card>,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicPlayer {
    pub seat: usize,
    pub user_id: String,
    pub stack: u64,
    pub round_contribution: u64,
    pub hand_contribution: u64,
    pub status: PlayerStatus,
    /// Holds hole cards that are still live. The cards themselves are never public.
    pub has_cards: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicState {
    pub game_id: String,
    pub hand_number: u64,
    pub phase: Phase,
    pub pot: u64,
    pub board: Vec<Card>,
    pub dealer_seat: usize,
    pub small_blind_seat: usize,
    pub big_blind_seat: usize,
    pub to_act: Option<usize>,
    pub current_bet: u64,
    pub min_raise: u64,
    pub small_blind: u64,
    pub big_blind: u64,
    pub players: Vec<PublicPlayer>,
    pub last_action: Option<ActionRecord>,
    pub last_result: Option<HandResult>,
    pub version: u64,
}

/// Changes between two public states. Unchanged scalar fields are left out;
/// `players` lists only the seats whose public row changed. `to_act` is always
/// present since `None` is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PublicDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<Vec<Card>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dealer_seat: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_blind_seat: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_blind_seat: Option<usize>,
    pub to_act: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_bet: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_raise: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub players: Vec<PublicPlayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<HandResult>,
}

fn changed<T: PartialEq + Clone>(before: &T, after: &T) -> Option<T> {
    if before == after {
        None
    } else {
        Some(after.clone())
    }
}

impl PublicState {
    pub fn diff(&self, next: &PublicState) -> PublicDelta {
        let players = next
            .players
            .iter()
            .filter(|p| !self.players.iter().any(|q| q == *p))
            .cloned()
            .collect();
        PublicDelta {
            hand_number: changed(&self.hand_number, &next.hand_number),
            phase: changed(&self.phase, &next.phase),
            pot: changed(&self.pot, &next.pot),
            board: changed(&self.board, &next.board),
            dealer_seat: changed(&self.dealer_seat, &next.dealer_seat),
            small_blind_seat: changed(&self.small_blind_seat, &next.small_blind_seat),
            big_blind_seat: changed(&self.big_blind_seat, &next.big_blind_seat),
            to_act: next.to_act,
            current_bet: changed(&self.current_bet, &next.current_bet),
            min_raise: changed(&self.min_raise, &next.min_raise),
            players,
            last_action: next.last_action.clone().filter(|_| self.last_action != next.last_action),
            last_result: next.last_result.clone().filter(|_| self.last_result != next.last_result),
        }
    }

    /// Applies a delta received with `version`. Clients use this to keep a
    /// local copy in step with `STATE_DIFF` frames.
    pub fn apply(&mut self, delta: &PublicDelta, version: u64) {
        if let Some(h) = delta.hand_number {
            self.hand_number = h;
        }
        if let Some(p) = delta.phase {
            self.phase = p;
        }
        if let Some(pot) = delta.pot {
            self.pot = pot;
        }
        if let Some(board) = &delta.board {
            self.board = board.clone();
        }
        if let Some(s) = delta.dealer_seat {
            self.dealer_seat = s;
        }
        if let Some(s) = delta.small_blind_seat {
            self.small_blind_seat = s;
        }
        if let Some(s) = delta.big_blind_seat {
            self.big_blind_seat = s;
        }
        self.to_act = delta.to_act;
        if let Some(b) = delta.current_bet {
            self.current_bet = b;
        }
        if let Some(m) = delta.min_raise {
            self.min_raise = m;
        }
        for row in &delta.players {
            match self.players.iter_mut().find(|p| p.seat == row.seat) {
                Some(p) => *p = row.clone(),
                None => self.players.push(row.clone()),
            }
        }
        if delta.last_action.is_some() {
            self.last_action = delta.last_action.clone();
        }
        if delta.last_result.is_some() {
            self.last_result = delta.last_result.clone();
        }
        self.version = version;
    }
}

/// What only the owning connection gets to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PrivateState {
    /// `None` for observers.
    pub seat: Option<usize>,
    pub my_cards: Vec<Card>,
    pub legal_actions: Vec<LegalAction>,
    pub to_call: u64,
}

/// ---- Inbound frames ----
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum GameCommand {
    Action {
        action: ActionKind,
        #[serde(default)]
        amount: u64,
        game_version: u64,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LobbyKind {
    Chat,
    Challenge,
    ChallengeResponse,
    Logout,
}

/// Lobby-scope frame, passed through untouched to whoever owns the lobby.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbyMessage {
    pub kind: LobbyKind,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientToServer {
    Game(GameCommand),
    Lobby(LobbyMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    MalformedJson,
    MissingType,
    UnknownMessage(String),
    InvalidFrame(String),
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::MalformedJson => "malformed_json",
            FrameError::MissingType => "missing_type",
            FrameError::UnknownMessage(_) => "unknown_message",
            FrameError::InvalidFrame(_) => "invalid_frame",
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::MalformedJson => write!(f, "frame is not valid JSON"),
            FrameError::MissingType => write!(f, "frame has neither `cmd` nor `type`"),
            FrameError::UnknownMessage(t) => write!(f, "unknown message `{}`", t),
            FrameError::InvalidFrame(e) => write!(f, "invalid frame: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

const GAME_COMMANDS: &[&str] = &["action", "ping"];

impl ClientToServer {
    /// `cmd` frames are game commands, `type` frames belong to the lobby.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|_| FrameError::MalformedJson)?;
        let obj = value.as_object().ok_or(FrameError::MissingType)?;

        if let Some(cmd) = obj.get("cmd") {
            let name = cmd.as_str().ok_or(FrameError::MissingType)?.to_string();
            if !GAME_COMMANDS.contains(&name.as_str()) {
                return Err(FrameError::UnknownMessage(name));
            }
            return serde_json::from_value::<GameCommand>(value)
                .map(ClientToServer::Game)
                .map_err(|e| FrameError::InvalidFrame(e.to_string()));
        }

        if let Some(t) = obj.get("type") {
            let name = t.as_str().ok_or(FrameError::MissingType)?;
            let kind = serde_json::from_value::<LobbyKind>(Value::String(name.to_string()))
                .map_err(|_| FrameError::UnknownMessage(name.to_string()))?;
            return Ok(ClientToServer::Lobby(LobbyMessage { kind, body: value }));
        }

        Err(FrameError::MissingType)
    }
}

/// ---- Outbound frames ----
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerToClient {
    #[serde(rename = "STATE_SYNC")]
    StateSync {
        game_id: String,
        state: PublicState,
        version: u64,
    },
    #[serde(rename = "STATE_DIFF")]
    StateDiff { state: PublicDelta, version: u64 },
    #[serde(rename = "STATE_PRIVATE")]
    StatePrivate { state: PrivateState },
    #[serde(rename = "PLAYER_DISCONNECTED")]
    PlayerDisconnected { seat: Option<usize>, user_id: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_version: Option<u64>,
    },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerToClient {
    /// Connection-level failure: `{type:"error", message:<code>}`.
    pub fn error_message(code: impl Into<String>) -> Self {
        ServerToClient::Error {
            error: None,
            message: Some(code.into()),
            current_version: None,
        }
    }

    /// Game-level rejection with a stable code plus a readable detail.
    pub fn rejection(code: impl Into<String>, detail: impl Into<String>) -> Self {
        ServerToClient::Error {
            error: Some(code.into()),
            message: Some(detail.into()),
            current_version: None,
        }
    }

    pub fn stale_version(current_version: u64) -> Self {
        ServerToClient::Error {
            error: Some("stale_version".into()),
            message: None,
            current_version: Some(current_version),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            ServerToClient::Error { error, message, .. } => error.as_deref().or(message.as_deref()),
            _ => None,
        }
    }
}
