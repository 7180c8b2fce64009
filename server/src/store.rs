//! Narrow persistence interface for the action log, snapshots, game records
//! and handshake credentials, with an in-memory backend and a JSONL file
//! backend.

use crate::engine::{Blinds, GameState, SeatAssignment};
use crate::error::StoreError;
use cardroom_protocol::ActionKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Table definition owned by whoever creates games (lobby, admin tooling).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameRecord {
    pub game_id: String,
    pub seed: u64,
    pub blinds: Blinds,
    pub seats: Vec<SeatAssignment>,
    pub created_at: DateTime<Utc>,
}

impl GameRecord {
    pub fn seat_of(&self, user_id: &str) -> Option<usize> {
        self.seats.iter().find(|s| s.user_id == user_id).map(|s| s.seat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionLogEntry {
    pub game_id: String,
    /// Equals the game version this entry produced.
    pub seq: u64,
    /// Always set for player actions; `None` is reserved for system events.
    pub actor_seat: Option<usize>,
    pub action_type: ActionKind,
    /// Amount exactly as submitted, so replay validates the same input.
    pub amount: u64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub game_id: String,
    pub version: u64,
    pub state: GameState,
    pub created_at: DateTime<Utc>,
}

/// Single-use handshake token. Only the SHA-256 of the token is kept (`nonce`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRow {
    pub nonce: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub user_id: String,
    pub session_id: Uuid,
}

pub trait GameStore: Send + Sync {
    fn create_game(&self, record: &GameRecord) -> Result<(), StoreError>;
    fn game(&self, game_id: &str) -> Result<Option<GameRecord>, StoreError>;
    /// Rejects anything but `last seq + 1` so the log stays gapless.
    fn append_action(&self, entry: &ActionLogEntry) -> Result<(), StoreError>;
    /// Entries with `seq > after`, ascending.
    fn actions_after(&self, game_id: &str, after: u64) -> Result<Vec<ActionLogEntry>, StoreError>;
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
    fn latest_snapshot(&self, game_id: &str) -> Result<Option<Snapshot>, StoreError>;
}

pub trait AuthStore: Send + Sync {
    fn insert_session(&self, row: &SessionRow) -> Result<(), StoreError>;
    fn session(&self, session_id: Uuid) -> Result<Option<SessionRow>, StoreError>;
    fn insert_token(&self, row: &TokenRow) -> Result<(), StoreError>;
    /// Check-and-mark in one critical section: of two racing callers with the
    /// same nonce at most one gets `Some`.
    fn consume_token(&self, nonce: &str, now: DateTime<Utc>) -> Result<Option<TokenGrant>, StoreError>;
}

fn check_next_seq(game_id: &str, last: u64, entry: &ActionLogEntry) -> Result<(), StoreError> {
    if entry.seq != last + 1 {
        return Err(StoreError::SeqConflict {
            game_id: game_id.to_string(),
            expected: last + 1,
            got: entry.seq,
        });
    }
    Ok(())
}

fn mark_token_used(
    tokens: &mut HashMap<String, TokenRow>,
    sessions: &HashMap<Uuid, SessionRow>,
    nonce: &str,
    now: DateTime<Utc>,
) -> Option<TokenGrant> {
    let row = tokens.get_mut(nonce)?;
    if row.used_at.is_some() || row.expires_at <= now {
        return None;
    }
    row.used_at = Some(now);
    let session = sessions.get(&row.session_id)?;
    if !session.is_valid_at(now) {
        return None;
    }
    Some(TokenGrant {
        user_id: session.user_id.clone(),
        session_id: session.session_id,
    })
}

/// Drops spent and expired tokens; a missing row reads the same as a used one.
/// Returns whether anything was removed.
fn prune_tokens(tokens: &mut HashMap<String, TokenRow>, now: DateTime<Utc>) -> bool {
    let before = tokens.len();
    tokens.retain(|_, t| t.used_at.is_none() && t.expires_at > now);
    tokens.len() != before
}

/* ---------------- in-memory ---------------- */

#[derive(Default)]
struct MemoryInner {
    games: HashMap<String, GameRecord>,
    actions: HashMap<String, Vec<ActionLogEntry>>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    sessions: HashMap<Uuid, SessionRow>,
    tokens: HashMap<String, TokenRow>,
}

/// Process-lifetime store. `set_available(false)` makes every call fail,
/// which is how outages are exercised in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    down: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

impl GameStore for MemoryStore {
    fn create_game(&self, record: &GameRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().games.insert(record.game_id.clone(), record.clone());
        Ok(())
    }

    fn game(&self, game_id: &str) -> Result<Option<GameRecord>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().games.get(game_id).cloned())
    }

    fn append_action(&self, entry: &ActionLogEntry) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let log = inner.actions.entry(entry.game_id.clone()).or_default();
        let last = log.last().map_or(0, |e| e.seq);
        check_next_seq(&entry.game_id, last, entry)?;
        log.push(entry.clone());
        Ok(())
    }

    fn actions_after(&self, game_id: &str, after: u64) -> Result<Vec<ActionLogEntry>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .actions
            .get(game_id)
            .map(|log| log.iter().filter(|e| e.seq > after).cloned().collect())
            .unwrap_or_default())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .snapshots
            .entry(snapshot.game_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    fn latest_snapshot(&self, game_id: &str) -> Result<Option<Snapshot>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .snapshots
            .get(game_id)
            .and_then(|s| s.iter().max_by_key(|s| s.version).cloned()))
    }
}

impl AuthStore for MemoryStore {
    fn insert_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().sessions.insert(row.session_id, row.clone());
        Ok(())
    }

    fn session(&self, session_id: Uuid) -> Result<Option<SessionRow>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().sessions.get(&session_id).cloned())
    }

    fn insert_token(&self, row: &TokenRow) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().tokens.insert(row.nonce.clone(), row.clone());
        Ok(())
    }

    fn consume_token(&self, nonce: &str, now: DateTime<Utc>) -> Result<Option<TokenGrant>, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let MemoryInner { tokens, sessions, .. } = &mut *inner;
        Ok(mark_token_used(tokens, sessions, nonce, now))
    }
}

/* ---------------- files ---------------- */

/// One directory per concern under `data_dir`:
/// `games/<id>.json`, `actions/<id>.jsonl`, `snapshots/<id>.jsonl`,
/// `auth/sessions.json`, `auth/tokens.json`.
pub struct FileStore {
    data_dir: PathBuf,
    last_seq: Mutex<HashMap<String, u64>>,
    auth_lock: Mutex<()>,
}

fn check_id(id: &str) -> Result<&str, StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(id)
    } else {
        Err(StoreError::Unavailable(format!("refusing game id {:?}", id)))
    }
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(row) => rows.push(row),
            // a torn last line after a crash; anything it held was never acknowledged
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "[STORE] skipping unreadable line"),
        }
    }
    Ok(rows)
}

/// Cuts a partial last line left by a crash mid-write back to the last `\n`,
/// so the next row starts on a line of its own.
fn trim_torn_tail(file: &mut fs::File, path: &Path) -> Result<(), StoreError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }
    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(path = %path.display(), dropped = len - keep as u64, "[STORE] trimming torn tail");
    file.set_len(keep as u64)?;
    file.sync_data()?;
    Ok(())
}

fn append_line<T: Serialize>(path: &Path, row: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(row)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
    trim_torn_tail(&mut file, path)?;
    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn read_json_map<K, V>(path: &Path) -> Result<HashMap<K, V>, StoreError>
where
    K: for<'de> Deserialize<'de> + std::hash::Hash + Eq,
    V: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(HashMap::new());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl FileStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        for sub in ["games", "actions", "snapshots", "auth"] {
            fs::create_dir_all(data_dir.join(sub))?;
        }
        Ok(FileStore {
            data_dir,
            last_seq: Mutex::new(HashMap::new()),
            auth_lock: Mutex::new(()),
        })
    }

    fn game_path(&self, game_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.data_dir.join("games").join(format!("{}.json", check_id(game_id)?)))
    }

    fn actions_path(&self, game_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.data_dir.join("actions").join(format!("{}.jsonl", check_id(game_id)?)))
    }

    fn snapshots_path(&self, game_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.data_dir.join("snapshots").join(format!("{}.jsonl", check_id(game_id)?)))
    }

    fn sessions_path(&self) -> PathBuf {
        self.data_dir.join("auth").join("sessions.json")
    }

    fn tokens_path(&self) -> PathBuf {
        self.data_dir.join("auth").join("tokens.json")
    }
}

impl GameStore for FileStore {
    fn create_game(&self, record: &GameRecord) -> Result<(), StoreError> {
        write_json(&self.game_path(&record.game_id)?, record)
    }

    fn game(&self, game_id: &str) -> Result<Option<GameRecord>, StoreError> {
        let path = self.game_path(game_id)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    fn append_action(&self, entry: &ActionLogEntry) -> Result<(), StoreError> {
        let path = self.actions_path(&entry.game_id)?;
        let mut cache = self.last_seq.lock();
        let last = match cache.get(&entry.game_id) {
            Some(last) => *last,
            None => read_jsonl::<ActionLogEntry>(&path)?.last().map_or(0, |e| e.seq),
        };
        check_next_seq(&entry.game_id, last, entry)?;
        append_line(&path, entry)?;
        cache.insert(entry.game_id.clone(), entry.seq);
        Ok(())
    }

    fn actions_after(&self, game_id: &str, after: u64) -> Result<Vec<ActionLogEntry>, StoreError> {
        let mut rows: Vec<ActionLogEntry> = read_jsonl::<ActionLogEntry>(&self.actions_path(game_id)?)?
            .into_iter()
            .filter(|e| e.seq > after)
            .collect();
        rows.sort_by_key(|e| e.seq);
        Ok(rows)
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        append_line(&self.snapshots_path(&snapshot.game_id)?, snapshot)
    }

    fn latest_snapshot(&self, game_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(read_jsonl::<Snapshot>(&self.snapshots_path(game_id)?)?
            .into_iter()
            .max_by_key(|s| s.version))
    }
}

impl AuthStore for FileStore {
    fn insert_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        let _guard = self.auth_lock.lock();
        let mut sessions: HashMap<Uuid, SessionRow> = read_json_map(&self.sessions_path())?;
        sessions.insert(row.session_id, row.clone());
        write_json(&self.sessions_path(), &sessions)
    }

    fn session(&self, session_id: Uuid) -> Result<Option<SessionRow>, StoreError> {
        let _guard = self.auth_lock.lock();
        let sessions: HashMap<Uuid, SessionRow> = read_json_map(&self.sessions_path())?;
        Ok(sessions.get(&session_id).cloned())
    }

    fn insert_token(&self, row: &TokenRow) -> Result<(), StoreError> {
        let _guard = self.auth_lock.lock();
        let mut tokens: HashMap<String, TokenRow> = read_json_map(&self.tokens_path())?;
        prune_tokens(&mut tokens, Utc::now());
        tokens.insert(row.nonce.clone(), row.clone());
        write_json(&self.tokens_path(), &tokens)
    }

    fn consume_token(&self, nonce: &str, now: DateTime<Utc>) -> Result<Option<TokenGrant>, StoreError> {
        let _guard = self.auth_lock.lock();
        let mut tokens: HashMap<String, TokenRow> = read_json_map(&self.tokens_path())?;
        let sessions: HashMap<Uuid, SessionRow> = read_json_map(&self.sessions_path())?;
        let grant = mark_token_used(&mut tokens, &sessions, nonce, now);
        // the token just marked is pruned too, so any change shows up here
        if prune_tokens(&mut tokens, now) {
            write_json(&self.tokens_path(), &tokens)?;
        }
        Ok(grant)
    }
}
