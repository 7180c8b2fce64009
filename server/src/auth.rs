use crate::error::{AuthError, StoreError};
use crate::gateway::HandshakeRequest;
use crate::store::{AuthStore, SessionRow, TokenGrant, TokenRow};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TOKEN_BYTES: usize = 32;

/// Who is on the other end of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub session_id: Uuid,
}

impl From<TokenGrant> for Identity {
    fn from(g: TokenGrant) -> Self {
        Identity {
            user_id: g.user_id,
            session_id: g.session_id,
        }
    }
}

fn nonce_of(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

/// Reads a cookie out of a raw `Cookie:` header value.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
}

pub struct Authenticator {
    store: Arc<dyn AuthStore>,
    token_ttl: Duration,
    token_param: String,
    session_cookie: String,
}

impl Authenticator {
    pub fn new(store: Arc<dyn AuthStore>, token_ttl: Duration, token_param: &str, session_cookie: &str) -> Self {
        Authenticator {
            store,
            token_ttl,
            token_param: token_param.to_string(),
            session_cookie: session_cookie.to_string(),
        }
    }

    pub fn create_session(&self, user_id: &str, ttl: Duration) -> Result<SessionRow, StoreError> {
        let now = Utc::now();
        let row = SessionRow {
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + to_chrono(ttl),
            revoked_at: None,
        };
        self.store.insert_session(&row)?;
        Ok(row)
    }

    /// New single-use token for `session_id`. The caller gets the only copy of
    /// the plaintext; the store keeps its digest.
    pub fn issue_token(&self, session_id: Uuid) -> Result<String, StoreError> {
        self.issue_token_with_ttl(session_id, self.token_ttl)
    }

    pub fn issue_token_with_ttl(&self, session_id: Uuid, ttl: Duration) -> Result<String, StoreError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let now = Utc::now();
        self.store.insert_token(&TokenRow {
            nonce: nonce_of(&token),
            session_id,
            created_at: now,
            expires_at: now + to_chrono(ttl),
            used_at: None,
        })?;
        Ok(token)
    }

    pub fn consume_token(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        self.consume_token_at(token, Utc::now())
    }

    pub fn consume_token_at(&self, token: &str, now: DateTime<Utc>) -> Result<Option<Identity>, StoreError> {
        Ok(self.store.consume_token(&nonce_of(token), now)?.map(Identity::from))
    }

    pub fn validate_session(&self, raw_session_id: &str) -> Result<Option<Identity>, StoreError> {
        let Ok(session_id) = Uuid::parse_str(raw_session_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        Ok(self
            .store
            .session(session_id)?
            .filter(|s| s.is_valid_at(now))
            .map(|s| Identity {
                user_id: s.user_id,
                session_id: s.session_id,
            }))
    }

    /// Token from the query string wins; the session cookie is only consulted
    /// when no token was supplied.
    pub fn authenticate(&self, handshake: &HandshakeRequest) -> Result<Identity, AuthError> {
        if let Some(token) = handshake.query.get(&self.token_param).filter(|t| !t.is_empty()) {
            return self.consume_token(token)?.ok_or(AuthError::InvalidToken);
        }
        let cookie = handshake
            .headers
            .get("cookie")
            .and_then(|h| cookie_value(h, &self.session_cookie));
        match cookie {
            Some(sid) => self.validate_session(sid)?.ok_or(AuthError::InvalidSession),
            None => Err(AuthError::MissingCredentials),
        }
    }
}
