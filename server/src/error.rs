//! Error taxonomy. Every variant maps to a stable snake_case code that ends up
//! in the `error`/`message` field of an outbound error frame.

use cardroom_protocol::{ActionKind, FrameError};
use thiserror::Error;

pub const SERVER_ERROR: &str = "server_error";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("action log for {game_id} expected seq {expected}, got {got}")]
    SeqConflict { game_id: String, expected: u64, got: u64 },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no handshake request attached")]
    MissingHandshake,
    #[error("neither token nor session cookie supplied")]
    MissingCredentials,
    #[error("token is unknown, expired or already used")]
    InvalidToken,
    #[error("session is unknown, expired or revoked")]
    InvalidSession,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingHandshake => "missing_handshake",
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::InvalidToken => "invalid_token",
            AuthError::InvalidSession => "invalid_session",
            AuthError::Store(_) => SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LimitError {
    #[error("too many connections from this address")]
    Ip,
    #[error("too many connections for this user")]
    User,
}

impl LimitError {
    pub fn code(&self) -> &'static str {
        match self {
            LimitError::Ip => "ip_connection_limit_exceeded",
            LimitError::User => "user_connection_limit_exceeded",
        }
    }
}

/// Recoverable per-frame problems; the connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("payload of {size} bytes exceeds {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("too many messages")]
    RateLimited,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Frame(e) => e.code(),
            ProtocolError::PayloadTooLarge { .. } => "payload_too_large",
            ProtocolError::RateLimited => "rate_limited",
        }
    }
}

/// Rule violations. State is never touched when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("seat {0} is not at this table")]
    UnknownSeat(usize),
    #[error("seat {seat} acted but seat {to_act:?} is to act")]
    NotYourTurn { seat: usize, to_act: Option<usize> },
    #[error("{action} not allowed: {reason}")]
    IllegalAction { action: ActionKind, reason: &'static str },
    #[error("amount {amount} outside [{min}, {max}]")]
    InvalidAmount { amount: u64, min: u64, max: u64 },
    #[error("game is finished")]
    GameFinished,
    #[error("need at least two funded seats")]
    NotEnoughPlayers,
    #[error("{0} seats is more than a table holds")]
    TooManySeats(usize),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnknownSeat(_) => "unknown_seat",
            EngineError::NotYourTurn { .. } => "not_your_turn",
            EngineError::IllegalAction { .. } => "illegal_action",
            EngineError::InvalidAmount { .. } => "invalid_amount",
            EngineError::GameFinished => "game_finished",
            EngineError::NotEnoughPlayers => "not_enough_players",
            EngineError::TooManySeats(_) => "too_many_seats",
        }
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("game {0} has no record")]
    MissingGame(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("replay of seq {seq} rejected: {source}")]
    Replay { seq: u64, source: EngineError },
    #[error("log out of step: expected seq {expected}, found {found}")]
    Divergence { expected: u64, found: u64 },
    #[error("could not build initial state: {0}")]
    Initial(EngineError),
}

/// Reasons the session layer refuses a connection at open time.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("user holds no seat in game {0}")]
    NotSeated(String),
    #[error("game {0} not found")]
    GameNotFound(String),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotSeated(_) => "not_seated",
            SessionError::GameNotFound(_) => "game_not_found",
            SessionError::Recovery(RecoveryError::MissingGame(_)) => "game_not_found",
            SessionError::Recovery(_) | SessionError::Store(_) => SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_failures_surface_as_server_error() {
        let store = StoreError::Unavailable("down".into());
        assert_eq!(AuthError::from(store).code(), SERVER_ERROR);
        let rec = RecoveryError::Divergence { expected: 3, found: 4 };
        assert_eq!(SessionError::from(rec).code(), SERVER_ERROR);
    }

    #[test]
    fn rule_codes_are_snake_case() {
        let e = EngineError::NotYourTurn { seat: 2, to_act: Some(1) };
        assert_eq!(e.code(), "not_your_turn");
        assert_eq!(LimitError::User.code(), "user_connection_limit_exceeded");
        assert_eq!(ProtocolError::RateLimited.code(), "rate_limited");
    }
}
