//! Front door for every socket: authenticates the handshake, enforces
//! connection ceilings and per-connection frame limits, then hands the
//! connection to an inner [`ConnectionHandler`].

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::{AuthError, ProtocolError, SessionError, SERVER_ERROR};
use crate::limiter::{ConnectionLimiter, MessageBudget};
use cardroom_protocol::ServerToClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnId = u64;

/// Everything the transport knows about an upgrade request. Header names are
/// lowercase.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub game_id: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub remote_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub conn_id: ConnId,
    pub game_id: String,
    pub user_id: String,
    pub session_id: Uuid,
    /// `None` while opening and for observers.
    pub seat: Option<usize>,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerToClient),
    Close,
}

/// Write half of a socket as seen by handlers. Frames queue on an unbounded
/// channel drained by the socket's writer task.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new(id: ConnId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Connection { id, tx }
    }

    pub fn channel(id: ConnId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn send(&self, frame: ServerToClient) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn fail(&self, code: &str) {
        self.send(ServerToClient::error_message(code));
        self.close();
    }
}

pub trait ConnectionHandler: Send + Sync {
    /// Returns the seat the user holds, `None` for an observer. An error
    /// refuses the connection.
    fn on_open(&self, conn: &Connection, ctx: &ConnectionContext) -> Result<Option<usize>, SessionError>;
    /// Recoverable frame problems come back as `ProtocolError`; everything
    /// else the handler answers itself.
    fn on_message(&self, conn: &Connection, ctx: &ConnectionContext, payload: &str) -> Result<(), ProtocolError>;
    fn on_close(&self, conn: &Connection, ctx: &ConnectionContext);
    fn on_error(&self, conn: &Connection, ctx: Option<&ConnectionContext>, error: &str);
}

struct Attached {
    ctx: ConnectionContext,
    budget: MessageBudget,
    strikes: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_message_bytes: usize,
    pub messages_per_second: u32,
    pub message_burst: u32,
    pub max_protocol_strikes: u32,
}

impl FrameLimits {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        FrameLimits {
            max_message_bytes: cfg.max_message_bytes,
            messages_per_second: cfg.messages_per_second,
            message_burst: cfg.message_burst,
            max_protocol_strikes: cfg.max_protocol_strikes,
        }
    }
}

pub struct Gateway<H> {
    inner: H,
    auth: Authenticator,
    limiter: Arc<ConnectionLimiter>,
    limits: FrameLimits,
    attached: Mutex<HashMap<ConnId, Attached>>,
}

impl<H: ConnectionHandler> Gateway<H> {
    pub fn new(inner: H, auth: Authenticator, limiter: Arc<ConnectionLimiter>, limits: FrameLimits) -> Self {
        Gateway {
            inner,
            auth,
            limiter,
            limits,
            attached: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub fn context(&self, conn: ConnId) -> Option<ConnectionContext> {
        self.attached.lock().get(&conn).map(|a| a.ctx.clone())
    }

    pub fn open_connections(&self) -> usize {
        self.attached.lock().len()
    }

    /// Returns whether the connection was admitted. A refused connection has
    /// received exactly one error frame followed by a close.
    pub fn on_open(&self, conn: &Connection, handshake: Option<&HandshakeRequest>) -> bool {
        let Some(hs) = handshake else {
            tracing::warn!(conn = conn.id(), "[AUTH] no handshake");
            conn.fail(AuthError::MissingHandshake.code());
            return false;
        };

        let who = match self.auth.authenticate(hs) {
            Ok(who) => who,
            Err(e) => {
                tracing::warn!(conn = conn.id(), ip = %hs.remote_ip, game = %hs.game_id, error = %e, "[AUTH] rejected");
                conn.fail(e.code());
                return false;
            }
        };

        if let Err(e) = self.limiter.try_acquire(hs.remote_ip, &who.user_id) {
            tracing::warn!(conn = conn.id(), ip = %hs.remote_ip, user = %who.user_id, "[LIMIT] {}", e);
            conn.fail(e.code());
            return false;
        }

        let mut ctx = ConnectionContext {
            conn_id: conn.id(),
            game_id: hs.game_id.clone(),
            user_id: who.user_id,
            session_id: who.session_id,
            seat: None,
            ip: hs.remote_ip,
        };

        match self.inner.on_open(conn, &ctx) {
            Ok(seat) => {
                ctx.seat = seat;
                tracing::info!(conn = conn.id(), user = %ctx.user_id, game = %ctx.game_id, seat = ?seat, "[OPEN]");
                self.attached.lock().insert(
                    conn.id(),
                    Attached {
                        ctx,
                        budget: MessageBudget::new(self.limits.messages_per_second, self.limits.message_burst),
                        strikes: 0,
                    },
                );
                true
            }
            Err(e) => {
                tracing::warn!(conn = conn.id(), user = %ctx.user_id, game = %ctx.game_id, error = %e, "[OPEN] refused");
                self.limiter.release(ctx.ip, &ctx.user_id);
                conn.fail(e.code());
                false
            }
        }
    }

    pub fn on_message(&self, conn: &Connection, payload: &str) {
        let checked = self.attached.lock().get_mut(&conn.id()).map(|a| {
            if payload.len() > self.limits.max_message_bytes {
                Err(ProtocolError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.limits.max_message_bytes,
                })
            } else if !a.budget.allow(Instant::now()) {
                Err(ProtocolError::RateLimited)
            } else {
                Ok(a.ctx.clone())
            }
        });
        let Some(checked) = checked else {
            tracing::warn!(conn = conn.id(), "[MSG] no context");
            conn.fail("unauthorized");
            return;
        };

        let result = checked.and_then(|ctx| self.inner.on_message(conn, &ctx, payload));
        if let Err(e) = result {
            self.strike(conn, e);
        }
    }

    fn strike(&self, conn: &Connection, e: ProtocolError) {
        conn.send(ServerToClient::rejection(e.code(), e.to_string()));
        let strikes = {
            let mut attached = self.attached.lock();
            match attached.get_mut(&conn.id()) {
                Some(a) => {
                    a.strikes += 1;
                    a.strikes
                }
                None => return,
            }
        };
        tracing::debug!(conn = conn.id(), strikes, error = %e, "[MSG] protocol error");
        if strikes >= self.limits.max_protocol_strikes {
            tracing::warn!(conn = conn.id(), strikes, "[MSG] too many protocol errors, closing");
            conn.close();
        }
    }

    pub fn on_close(&self, conn: &Connection) {
        let Some(a) = self.attached.lock().remove(&conn.id()) else {
            return;
        };
        self.limiter.release(a.ctx.ip, &a.ctx.user_id);
        tracing::info!(conn = conn.id(), user = %a.ctx.user_id, game = %a.ctx.game_id, "[CLOSE]");
        self.inner.on_close(conn, &a.ctx);
    }

    pub fn on_error(&self, conn: &Connection, error: &str) {
        let ctx = self.context(conn.id());
        tracing::error!(conn = conn.id(), error, "[ERROR]");
        self.inner.on_error(conn, ctx.as_ref(), error);
        conn.fail(SERVER_ERROR);
    }
}
