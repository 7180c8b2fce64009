use crate::gateway::{ConnId, Connection, Gateway, HandshakeRequest, Outbound};
use crate::session::SessionRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const CLOSE_FLUSH: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway<SessionRegistry>>,
    next_conn: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(gateway: Gateway<SessionRegistry>) -> Self {
        AppState {
            gateway: Arc::new(gateway),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/:game_id", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn health() -> &'static str {
    "ok"
}

/// Lowercase header map; repeated headers (several `Cookie:` lines) are joined
/// with `; `.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|v| {
                v.push_str("; ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(game_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let handshake = HandshakeRequest {
        game_id,
        query,
        headers: flatten_headers(&headers),
        remote_ip: addr.ip(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake))
}

async fn handle_socket(socket: WebSocket, state: AppState, handshake: HandshakeRequest) {
    let (mut sender, mut receiver) = socket.split();
    let (tx_out, mut rx_out) = mpsc::unbounded_channel::<Outbound>();
    let conn = Connection::new(state.next_conn_id(), tx_out);

    let mut writer = tokio::spawn(async move {
        while let Some(out) = rx_out.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "[WS] could not encode frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let gateway = &state.gateway;
    if !gateway.on_open(&conn, Some(&handshake)) {
        let _ = writer.await;
        return;
    }

    let mut writer_done = false;
    let mut flush = false;
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(t))) => gateway.on_message(&conn, &t),
                Some(Ok(Message::Binary(b))) => gateway.on_message(&conn, &String::from_utf8_lossy(&b)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    gateway.on_error(&conn, &e.to_string());
                    flush = true;
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    gateway.on_close(&conn);
    if !writer_done {
        // let the error frame out before dropping the socket
        if flush {
            let _ = tokio::time::timeout(CLOSE_FLUSH, &mut writer).await;
        }
        writer.abort();
    }
}
