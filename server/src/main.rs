use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod auth;
mod config;
mod engine;
mod error;
mod eval;
mod gateway;
mod limiter;
mod recovery;
mod seed;
mod session;
mod store;
mod transport;
#[cfg(test)]
mod tests;

use auth::Authenticator;
use config::ServerConfig;
use engine::{Blinds, SeatAssignment};
use gateway::{FrameLimits, Gateway};
use limiter::ConnectionLimiter;
use recovery::RecoveryService;
use session::{LoggingLobby, SessionPolicy, SessionRegistry};
use store::{FileStore, GameRecord, GameStore};
use transport::AppState;

// ==== knobs ====
const DEMO_GAME: &str = "demo";
const DEMO_PLAYERS: [&str; 2] = ["alice", "bob"];
const DEMO_STACK: u64 = 1000;
const DEMO_BLINDS: Blinds = Blinds { small: 10, big: 20 };
const DEMO_CREDENTIAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "cardroom-server", about = "Real-time poker table server")]
struct ServerCli {
    /// Path to the TOML config file; created with defaults when missing.
    #[arg(long, default_value = "cardroom.toml")]
    config: PathBuf,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,

    /// Seed a two-seat `demo` game and print credentials for it.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ServerCli::parse();

    let log_filter = if cli.debug {
        "debug".to_string()
    } else {
        "cardroom_server=info,warn".to_string()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.debug)
        .with_line_number(cli.debug)
        .init();

    let mut cfg = ServerConfig::load_or_create(&cli.config)
        .with_context(|| format!("loading or creating config '{}'", cli.config.display()))?;
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
        cfg.port = port;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }

    let store = Arc::new(
        FileStore::open(&cfg.data_dir)
            .with_context(|| format!("opening data dir '{}'", cfg.data_dir.display()))?,
    );
    let auth = Authenticator::new(store.clone(), cfg.token_ttl(), &cfg.token_param, &cfg.session_cookie);
    let registry = SessionRegistry::new(
        RecoveryService::new(store.clone(), cfg.snapshot_interval),
        Box::new(LoggingLobby),
        SessionPolicy::from_config(&cfg),
    );
    let limiter = Arc::new(ConnectionLimiter::new(
        cfg.max_connections_per_ip,
        cfg.max_connections_per_user,
    ));
    let gateway = Gateway::new(registry, auth, limiter, FrameLimits::from_config(&cfg));

    if cli.demo {
        seed_demo(store.as_ref(), gateway.authenticator(), &cfg).context("seeding demo game")?;
    }

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(config = %cli.config.display(), data_dir = %cfg.data_dir.display(), "[BOOT] server listening on ws://{addr}/ws/{{game_id}}");
    transport::serve(listener, AppState::new(gateway)).await?;
    Ok(())
}

/// Creates the demo table if needed and logs a cookie and a token per seat.
fn seed_demo(store: &dyn GameStore, auth: &Authenticator, cfg: &ServerConfig) -> anyhow::Result<()> {
    if store.game(DEMO_GAME)?.is_none() {
        let record = GameRecord {
            game_id: DEMO_GAME.to_string(),
            seed: rand::thread_rng().next_u64(),
            blinds: DEMO_BLINDS,
            seats: DEMO_PLAYERS
                .iter()
                .enumerate()
                .map(|(i, user)| SeatAssignment {
                    seat: i + 1,
                    user_id: user.to_string(),
                    stack: DEMO_STACK,
                })
                .collect(),
            created_at: chrono::Utc::now(),
        };
        store.create_game(&record)?;
        tracing::info!(game = DEMO_GAME, "[DEMO] game created");
    }

    for user in DEMO_PLAYERS {
        let session = auth.create_session(user, DEMO_CREDENTIAL_TTL)?;
        let token = auth.issue_token_with_ttl(session.session_id, DEMO_CREDENTIAL_TTL)?;
        tracing::info!(
            user,
            cookie = %format!("{}={}", cfg.session_cookie, session.session_id),
            url = %format!("ws://127.0.0.1:{}/ws/{}?{}={}", cfg.port, DEMO_GAME, cfg.token_param, token),
            "[DEMO] credentials"
        );
    }
    Ok(())
}
