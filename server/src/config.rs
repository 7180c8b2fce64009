use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

// ==== knobs ====
const DEFAULT_PORT: u16 = 9001;
const MAX_CONNECTIONS_PER_IP: usize = 10;
const MAX_CONNECTIONS_PER_USER: usize = 5;
const TOKEN_TTL_SECS: u64 = 30; // single-use handshake tokens
const DEPARTURE_GRACE_MS: u64 = 5_000; // refresh vs real disconnect
const SNAPSHOT_INTERVAL: u64 = 5; // accepted actions between snapshots
const MAX_MESSAGE_BYTES: usize = 4 * 1024;
const MESSAGES_PER_SECOND: u32 = 20;
const MESSAGE_BURST: u32 = 40;
const MAX_PROTOCOL_STRIKES: u32 = 5; // protocol errors before we hang up

/// Server configuration persisted as TOML. Missing keys fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections_per_ip: usize,
    pub max_connections_per_user: usize,
    pub token_ttl_secs: u64,
    pub token_param: String,
    pub session_cookie: String,
    pub departure_grace_ms: u64,
    pub snapshot_interval: u64,
    pub max_message_bytes: usize,
    pub messages_per_second: u32,
    pub message_burst: u32,
    pub max_protocol_strikes: u32,
    pub allow_observers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("./cardroom_data"),
            max_connections_per_ip: MAX_CONNECTIONS_PER_IP,
            max_connections_per_user: MAX_CONNECTIONS_PER_USER,
            token_ttl_secs: TOKEN_TTL_SECS,
            token_param: "token".to_string(),
            session_cookie: "cardroom_session".to_string(),
            departure_grace_ms: DEPARTURE_GRACE_MS,
            snapshot_interval: SNAPSHOT_INTERVAL,
            max_message_bytes: MAX_MESSAGE_BYTES,
            messages_per_second: MESSAGES_PER_SECOND,
            message_burst: MESSAGE_BURST,
            max_protocol_strikes: MAX_PROTOCOL_STRIKES,
            allow_observers: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path`. If the file does not exist, create it
    /// with defaults and return those.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let s = fs::read_to_string(path)
                .with_context(|| format!("reading config file '{}'", path.display()))?;
            let cfg: ServerConfig = toml::from_str(&s)
                .with_context(|| format!("parsing TOML config '{}'", path.display()))?;
            cfg.validate()?;
            return Ok(cfg);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating config directory '{}'", parent.display()))?;
            }
        }
        let cfg = ServerConfig::default();
        let toml_text = toml::to_string_pretty(&cfg).context("serializing default config to TOML")?;
        fs::write(path, toml_text)
            .with_context(|| format!("writing default config to '{}'", path.display()))?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.snapshot_interval == 0 {
            anyhow::bail!("snapshot_interval must be at least 1");
        }
        if self.max_connections_per_ip == 0 || self.max_connections_per_user == 0 {
            anyhow::bail!("connection ceilings must be at least 1");
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn departure_grace(&self) -> Duration {
        Duration::from_millis(self.departure_grace_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
