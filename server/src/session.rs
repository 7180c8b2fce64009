//! Game session registry. Each live game is owned by one actor task holding
//! the engine; connections talk to it over an unbounded channel so every
//! mutation of a game is applied in a single order.

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::error::{ProtocolError, SessionError, SERVER_ERROR};
use crate::gateway::{ConnId, Connection, ConnectionContext, ConnectionHandler};
use crate::recovery::RecoveryService;
use cardroom_protocol::{ActionKind, ClientToServer, GameCommand, LobbyMessage, ServerToClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receives lobby-scope frames (chat, challenges, logout). The game core does
/// not interpret them.
pub trait LobbyRelay: Send + Sync {
    fn relay(&self, ctx: &ConnectionContext, msg: LobbyMessage);
}

pub struct LoggingLobby;

impl LobbyRelay for LoggingLobby {
    fn relay(&self, ctx: &ConnectionContext, msg: LobbyMessage) {
        tracing::info!(user = %ctx.user_id, game = %ctx.game_id, kind = ?msg.kind, "[LOBBY] dropped");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub departure_grace: Duration,
    pub allow_observers: bool,
}

impl SessionPolicy {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        SessionPolicy {
            departure_grace: cfg.departure_grace(),
            allow_observers: cfg.allow_observers,
        }
    }
}

enum ActorCmd {
    Join {
        conn: Connection,
        user_id: String,
        seat: Option<usize>,
    },
    Action {
        conn: Connection,
        seat: usize,
        action: ActionKind,
        amount: u64,
        game_version: u64,
    },
    Leave {
        conn_id: ConnId,
        user_id: String,
    },
    DepartureExpired {
        user_id: String,
        generation: u64,
    },
}

#[derive(Clone)]
struct GameHandle {
    tx: mpsc::UnboundedSender<ActorCmd>,
}

struct Shared {
    recovery: RecoveryService,
    lobby: Box<dyn LobbyRelay>,
    policy: SessionPolicy,
    games: Mutex<HashMap<String, GameHandle>>,
    /// Bumped under the `games` lock each time an actor is spawned.
    started: AtomicU64,
}

pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    pub fn new(recovery: RecoveryService, lobby: Box<dyn LobbyRelay>, policy: SessionPolicy) -> Self {
        SessionRegistry {
            shared: Arc::new(Shared {
                recovery,
                lobby,
                policy,
                games: Mutex::new(HashMap::new()),
                started: AtomicU64::new(0),
            }),
        }
    }

    pub fn recovery(&self) -> &RecoveryService {
        &self.shared.recovery
    }

    pub fn is_live(&self, game_id: &str) -> bool {
        self.shared.games.lock().contains_key(game_id)
    }

    pub fn live_games(&self) -> usize {
        self.shared.games.lock().len()
    }

    fn handle(&self, game_id: &str) -> Option<GameHandle> {
        self.shared.games.lock().get(game_id).cloned()
    }
}

impl ConnectionHandler for SessionRegistry {
    fn on_open(&self, conn: &Connection, ctx: &ConnectionContext) -> Result<Option<usize>, SessionError> {
        let record = self
            .shared
            .recovery
            .store()
            .game(&ctx.game_id)?
            .ok_or_else(|| SessionError::GameNotFound(ctx.game_id.clone()))?;
        let seat = record.seat_of(&ctx.user_id);
        if seat.is_none() && !self.shared.policy.allow_observers {
            return Err(SessionError::NotSeated(ctx.game_id.clone()));
        }

        let join = |handle: &GameHandle| {
            handle
                .tx
                .send(ActorCmd::Join {
                    conn: conn.clone(),
                    user_id: ctx.user_id.clone(),
                    seat,
                })
                .map(|_| seat)
                .map_err(|_| SessionError::GameNotFound(ctx.game_id.clone()))
        };

        // Joins are queued while the registry lock is held so an actor
        // retiring at the same moment cannot miss them. The log replay runs
        // outside the lock; if an actor was started meanwhile the loaded
        // engine is discarded.
        loop {
            let epoch = {
                let games = self.shared.games.lock();
                if let Some(h) = live_handle(&games, &ctx.game_id) {
                    return join(h);
                }
                self.shared.started.load(Ordering::SeqCst)
            };

            let engine = self.shared.recovery.load(&ctx.game_id)?;

            let mut games = self.shared.games.lock();
            if let Some(h) = live_handle(&games, &ctx.game_id) {
                return join(h);
            }
            if self.shared.started.load(Ordering::SeqCst) != epoch {
                // an actor ran and retired during the replay; its actions are newer
                continue;
            }
            self.shared.started.fetch_add(1, Ordering::SeqCst);
            let handle = spawn_actor(self.shared.clone(), engine);
            games.insert(ctx.game_id.clone(), handle.clone());
            return join(&handle);
        }
    }

    fn on_message(&self, conn: &Connection, ctx: &ConnectionContext, payload: &str) -> Result<(), ProtocolError> {
        match ClientToServer::parse(payload)? {
            ClientToServer::Game(GameCommand::Ping) => {
                conn.send(ServerToClient::Pong);
            }
            ClientToServer::Game(GameCommand::Action {
                action,
                amount,
                game_version,
            }) => {
                let Some(seat) = ctx.seat else {
                    conn.send(ServerToClient::rejection("not_seated", "observers cannot act"));
                    return Ok(());
                };
                let sent = self.handle(&ctx.game_id).is_some_and(|h| {
                    h.tx.send(ActorCmd::Action {
                        conn: conn.clone(),
                        seat,
                        action,
                        amount,
                        game_version,
                    })
                    .is_ok()
                });
                if !sent {
                    tracing::error!(game = %ctx.game_id, conn = conn.id(), "[ACTION] no live game");
                    conn.send(ServerToClient::error_message(SERVER_ERROR));
                    conn.close();
                }
            }
            ClientToServer::Lobby(msg) => self.shared.lobby.relay(ctx, msg),
        }
        Ok(())
    }

    fn on_close(&self, conn: &Connection, ctx: &ConnectionContext) {
        if let Some(h) = self.handle(&ctx.game_id) {
            let _ = h.tx.send(ActorCmd::Leave {
                conn_id: conn.id(),
                user_id: ctx.user_id.clone(),
            });
        }
    }

    fn on_error(&self, conn: &Connection, ctx: Option<&ConnectionContext>, error: &str) {
        tracing::warn!(
            conn = conn.id(),
            game = ctx.map(|c| c.game_id.as_str()).unwrap_or("-"),
            error,
            "[SESSION] connection error"
        );
    }
}

struct Member {
    conn: Connection,
    user_id: String,
    seat: Option<usize>,
}

struct GameActor {
    game_id: String,
    engine: Engine,
    members: HashMap<ConnId, Member>,
    /// user id -> generation of the pending departure timer
    departures: HashMap<String, u64>,
    next_generation: u64,
    tx: mpsc::UnboundedSender<ActorCmd>,
    shared: Arc<Shared>,
}

fn live_handle<'a>(games: &'a HashMap<String, GameHandle>, game_id: &str) -> Option<&'a GameHandle> {
    games.get(game_id).filter(|h| !h.tx.is_closed())
}

fn spawn_actor(shared: Arc<Shared>, engine: Engine) -> GameHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = GameActor {
        game_id: engine.state().game_id.clone(),
        engine,
        members: HashMap::new(),
        departures: HashMap::new(),
        next_generation: 0,
        tx: tx.clone(),
        shared,
    };
    tracing::info!(game = %actor.game_id, version = actor.engine.version(), "[GAME] actor started");
    tokio::spawn(actor.run(rx));
    GameHandle { tx }
}

enum Retire {
    Busy(ActorCmd),
    Done,
}

impl GameActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorCmd>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
            while self.members.is_empty() && self.departures.is_empty() {
                match self.try_retire(&mut rx) {
                    Retire::Busy(cmd) => self.handle(cmd),
                    Retire::Done => {
                        tracing::info!(game = %self.game_id, version = self.engine.version(), "[GAME] actor retired");
                        return;
                    }
                }
            }
        }
    }

    fn try_retire(&self, rx: &mut mpsc::UnboundedReceiver<ActorCmd>) -> Retire {
        let mut games = self.shared.games.lock();
        if let Ok(cmd) = rx.try_recv() {
            return Retire::Busy(cmd);
        }
        if games.get(&self.game_id).is_some_and(|h| h.tx.same_channel(&self.tx)) {
            games.remove(&self.game_id);
        }
        Retire::Done
    }

    fn handle(&mut self, cmd: ActorCmd) {
        match cmd {
            ActorCmd::Join { conn, user_id, seat } => self.join(conn, user_id, seat),
            ActorCmd::Action {
                conn,
                seat,
                action,
                amount,
                game_version,
            } => self.act(&conn, seat, action, amount, game_version),
            ActorCmd::Leave { conn_id, user_id } => self.leave(conn_id, user_id),
            ActorCmd::DepartureExpired { user_id, generation } => self.departure_expired(user_id, generation),
        }
    }

    fn join(&mut self, conn: Connection, user_id: String, seat: Option<usize>) {
        if self.departures.remove(&user_id).is_some() {
            tracing::info!(game = %self.game_id, user = %user_id, "[RECONNECT] within grace");
        }
        let (public, private) = self.engine.get_state(seat);
        conn.send(ServerToClient::StateSync {
            game_id: self.game_id.clone(),
            state: public,
            version: self.engine.version(),
        });
        conn.send(ServerToClient::StatePrivate { state: private });
        tracing::info!(game = %self.game_id, user = %user_id, seat = ?seat, "[JOIN]");
        self.members.insert(conn.id(), Member { conn, user_id, seat });
    }

    fn act(&mut self, conn: &Connection, seat: usize, action: ActionKind, amount: u64, game_version: u64) {
        let current = self.engine.version();
        if game_version != current {
            tracing::debug!(game = %self.game_id, seat, game_version, current, "[ACTION] stale");
            conn.send(ServerToClient::stale_version(current));
            return;
        }

        let mut next = self.engine.clone();
        let outcome = match next.player_action(seat, action, amount) {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!(game = %self.game_id, seat, %action, amount, error = %e, "[ACTION] rejected");
                conn.send(ServerToClient::rejection(e.code(), e.to_string()));
                return;
            }
        };

        if let Err(e) = self.shared.recovery.record_action(&next, seat, action, amount) {
            tracing::error!(game = %self.game_id, seat, version = next.version(), error = %e, "[ACTION] not persisted");
            conn.send(ServerToClient::error_message(SERVER_ERROR));
            conn.close();
            return;
        }

        let before = self.engine.public_view();
        self.engine = next;
        let after = self.engine.public_view();
        tracing::info!(game = %self.game_id, seat, %action, paid = outcome.record.amount, version = outcome.version, "[ACTION]");
        for result in &outcome.completed_hands {
            tracing::info!(game = %self.game_id, hand = result.hand_number, payouts = ?result.payouts, "[HAND] complete");
        }
        self.broadcast_state(before.diff(&after));
    }

    fn broadcast_state(&self, delta: cardroom_protocol::PublicDelta) {
        let version = self.engine.version();
        for m in self.members.values() {
            m.conn.send(ServerToClient::StateDiff {
                state: delta.clone(),
                version,
            });
            if let Some(private) = m.seat.and_then(|s| self.engine.private_view(s)) {
                m.conn.send(ServerToClient::StatePrivate { state: private });
            }
        }
        tracing::debug!(game = %self.game_id, version, members = self.members.len(), "[BROADCAST]");
    }

    fn leave(&mut self, conn_id: ConnId, user_id: String) {
        let Some(member) = self.members.remove(&conn_id) else {
            return;
        };
        if member.seat.is_none() || self.members.values().any(|m| m.user_id == user_id) {
            return;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.departures.insert(user_id.clone(), generation);
        tracing::info!(game = %self.game_id, user = %user_id, "[LEAVE] grace started");

        let tx = self.tx.clone();
        let grace = self.shared.policy.departure_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(ActorCmd::DepartureExpired { user_id, generation });
        });
    }

    fn departure_expired(&mut self, user_id: String, generation: u64) {
        if self.departures.get(&user_id) != Some(&generation) {
            return;
        }
        self.departures.remove(&user_id);
        let seat = self.engine.seat_of(&user_id);
        tracing::info!(game = %self.game_id, user = %user_id, seat = ?seat, "[DISCONNECT]");
        for m in self.members.values() {
            m.conn.send(ServerToClient::PlayerDisconnected {
                seat,
                user_id: user_id.clone(),
            });
        }
    }
}
