use cardroom_protocol::{ActionKind, GameCommand, PrivateState, PublicState, ServerToClient};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser)]
#[command(name = "cli_client", about = "Terminal client for a cardroom table")]
struct Args {
    /// e.g. ws://127.0.0.1:9001/ws/demo?token=...
    url: String,
    /// Session id sent as the `cardroom_session` cookie
    #[arg(long)]
    session: Option<String>,
}

type Table = Arc<Mutex<Option<PublicState>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    println!("🎮 Cardroom CLI Client");
    println!("======================");

    let mut request = args.url.as_str().into_client_request()?;
    if let Some(session) = &args.session {
        request
            .headers_mut()
            .insert("cookie", HeaderValue::from_str(&format!("cardroom_session={session}"))?);
    }

    println!("🔗 Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(request).await?;
    println!("✅ Connected!");

    let (mut write, mut read) = ws_stream.split();
    let table: Table = Arc::new(Mutex::new(None));

    tokio::spawn({
        let table = table.clone();
        async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerToClient>(&text) {
                        Ok(server_msg) => handle_server_message(server_msg, &table),
                        Err(_) => println!("📨 {text}"),
                    },
                    Ok(Message::Close(_)) => {
                        println!("🔌 Connection closed by server");
                        break;
                    }
                    Err(e) => {
                        println!("❌ WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    });

    println!("\n📋 Commands available:");
    println!("  fold | check | call | allin");
    println!("  bet <to>    - Open the betting to <to> chips");
    println!("  raise <to>  - Raise to <to> chips total this round");
    println!("  ping        - Round trip check");
    println!("  chat <msg>  - Send a lobby chat message");
    println!("  quit        - Exit");
    println!("\nType commands and press Enter:");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line == "quit" {
            break;
        }
        let version = table.lock().ok().and_then(|t| t.as_ref().map(|s| s.version)).unwrap_or(0);
        match parse_command(line, version) {
            Some(json) => write.send(Message::Text(json)).await?,
            None => println!("❓ Unknown command: {line}"),
        }
    }

    println!("👋 Goodbye!");
    Ok(())
}

fn handle_server_message(msg: ServerToClient, table: &Table) {
    let Ok(mut current) = table.lock() else {
        return;
    };
    match msg {
        ServerToClient::StateSync { game_id, state, version } => {
            println!("🎯 Synced to {game_id} at version {version}");
            print_game_state(&state);
            *current = Some(state);
        }
        ServerToClient::StateDiff { state, version } => match current.as_mut() {
            Some(s) => {
                s.apply(&state, version);
                print_game_state(s);
            }
            None => println!("📨 diff at version {version} before sync"),
        },
        ServerToClient::StatePrivate { state } => print_private(&state),
        ServerToClient::PlayerDisconnected { seat, user_id } => {
            println!("🚪 {user_id} (seat {seat:?}) left the table");
        }
        ServerToClient::Error { error, message, current_version } => {
            let code = error.or(message).unwrap_or_default();
            match current_version {
                Some(v) => println!("❌ Error: {code} (table is at version {v})"),
                None => println!("❌ Error: {code}"),
            }
        }
        ServerToClient::Pong => println!("🏓 pong"),
    }
}

fn print_game_state(s: &PublicState) {
    println!("\n🎲 === HAND #{} v{} ===", s.hand_number, s.version);
    println!("🕹️  Phase: {:?}", s.phase);
    println!("💰 Pot: {} chips  (bet {} / min raise {})", s.pot, s.current_bet, s.min_raise);
    if !s.board.is_empty() {
        let board: Vec<String> = s.board.iter().map(|c| c.to_string()).collect();
        println!("🃏 Board: {}", board.join(" "));
    }
    for p in &s.players {
        let to_act = if Some(p.seat) == s.to_act { " 👈 TO ACT" } else { "" };
        let dealer = if p.seat == s.dealer_seat { " 🎩" } else { "" };
        println!(
            "  {}: {} ({} chips, {} in){:?}{}{}",
            p.seat, p.user_id, p.stack, p.round_contribution, p.status, to_act, dealer
        );
    }
    if let Some(result) = &s.last_result {
        println!("🏆 Last hand #{}: {:?}", result.hand_number, result.payouts);
    }
    println!("==================\n");
}

fn print_private(p: &PrivateState) {
    if p.seat.is_none() {
        return;
    }
    let cards: Vec<String> = p.my_cards.iter().map(|c| c.to_string()).collect();
    println!("🂠 Your cards: {}  (to call: {})", cards.join(" "), p.to_call);
    for la in &p.legal_actions {
        println!("   {} [{}..{}]", la.action, la.min, la.max);
    }
}

fn parse_command(input: &str, version: u64) -> Option<String> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let first = parts.first()?.to_lowercase();
    let amount = parts.get(1).and_then(|a| a.parse::<u64>().ok());

    let action = |action: ActionKind, amount: u64| {
        serde_json::to_string(&GameCommand::Action {
            action,
            amount,
            game_version: version,
        })
        .ok()
    };

    match first.as_str() {
        "fold" => action(ActionKind::Fold, 0),
        "check" => action(ActionKind::Check, 0),
        "call" => action(ActionKind::Call, 0),
        "allin" | "all_in" => action(ActionKind::AllIn, 0),
        "bet" => action(ActionKind::Bet, amount?),
        "raise" => action(ActionKind::Raise, amount?),
        "ping" => serde_json::to_string(&GameCommand::Ping).ok(),
        "chat" if parts.len() > 1 => {
            Some(serde_json::json!({ "type": "chat", "text": parts[1..].join(" ") }).to_string())
        }
        _ => None,
    }
}
