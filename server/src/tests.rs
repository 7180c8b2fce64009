use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::engine::{Blinds, Engine, SeatAssignment};
use crate::gateway::{Connection, FrameLimits, Gateway, HandshakeRequest, Outbound};
use crate::limiter::ConnectionLimiter;
use crate::recovery::RecoveryService;
use crate::seed::GameSeed;
use crate::session::{LoggingLobby, SessionPolicy, SessionRegistry};
use crate::store::{GameRecord, GameStore, MemoryStore};
use cardroom_protocol::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn seats() -> Vec<SeatAssignment> {
    vec![
        SeatAssignment { seat: 1, user_id: "ann".into(), stack: 1000 },
        SeatAssignment { seat: 2, user_id: "bo".into(), stack: 1000 },
    ]
}

#[cfg(test)]
mod game_tests {
    use super::*;

    fn passive(engine: &Engine, seat: usize) -> ActionKind {
        let legal = engine.legal_actions(seat);
        if legal.iter().any(|l| l.action == ActionKind::Check) {
            ActionKind::Check
        } else {
            ActionKind::Call
        }
    }

    /// Heads-up hand checked down to showdown; chips are conserved and the
    /// next hand is dealt with the button moved.
    #[test]
    fn test_heads_up_hand_to_showdown() {
        let mut engine =
            Engine::start_hand("hu", GameSeed::from_u64(11), Blinds { small: 10, big: 20 }, &seats()).unwrap();
        assert_eq!(engine.state().hand_number, 1);
        assert_eq!(engine.state().dealer_seat, 1);

        let mut finished = None;
        for _ in 0..20 {
            let seat = engine.state().to_act.unwrap();
            let out = engine.player_action(seat, passive(&engine, seat), 0).unwrap();
            if let Some(result) = out.completed_hands.into_iter().next() {
                finished = Some(result);
                break;
            }
        }

        let result = finished.expect("hand should reach showdown");
        assert_eq!(result.hand_number, 1);
        assert_eq!(result.board.len(), 5);
        assert_eq!(result.payouts.iter().map(|p| p.amount).sum::<u64>(), 40);
        assert!(result.payouts.iter().all(|p| p.hand.is_some()));

        let s = engine.state();
        assert_eq!(s.hand_number, 2);
        assert_eq!(s.dealer_seat, 2);
        assert_eq!(s.phase, Phase::Preflop);
        let chips: u64 = s.players.iter().map(|p| p.stack).sum::<u64>() + s.pot;
        assert_eq!(chips, 2000);
    }

    /// Deltas applied on top of the first sync reproduce every later public view.
    #[test]
    fn test_deltas_rebuild_public_view() {
        let mut engine =
            Engine::start_hand("d", GameSeed::from_u64(3), Blinds { small: 5, big: 10 }, &seats()).unwrap();
        let mut client = engine.public_view();

        let script = [
            (ActionKind::Raise, 30),
            (ActionKind::Call, 0),
            (ActionKind::Bet, 40),
            (ActionKind::Fold, 0),
        ];
        for (action, amount) in script {
            let before = engine.public_view();
            let seat = engine.state().to_act.unwrap();
            engine.player_action(seat, action, amount).unwrap();
            let after = engine.public_view();
            client.apply(&before.diff(&after), engine.version());
            assert_eq!(client, after, "after {action}");
        }
        assert_eq!(engine.version(), 4);
        assert_eq!(client.hand_number, 2);
    }

    /// The private view only ever shows the owner's cards.
    #[test]
    fn test_private_views_are_disjoint() {
        let engine = Engine::start_hand("p", GameSeed::from_u64(5), Blinds { small: 10, big: 20 }, &seats()).unwrap();
        let (_, ann) = engine.get_state(Some(1));
        let (_, bo) = engine.get_state(Some(2));
        let (_, nobody) = engine.get_state(None);
        assert_eq!(ann.my_cards.len(), 2);
        assert_eq!(bo.my_cards.len(), 2);
        assert!(ann.my_cards.iter().all(|c| !bo.my_cards.contains(c)));
        assert_eq!(nobody, PrivateState::default());
        // seat 1 is on the button and acts first heads-up
        assert!(!ann.legal_actions.is_empty());
        assert!(bo.legal_actions.is_empty());
        assert_eq!(ann.to_call, 10);
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;

    const GAME: &str = "t1";

    struct Table {
        store: Arc<MemoryStore>,
        gw: Gateway<SessionRegistry>,
    }

    fn table(grace_ms: u64, allow_observers: bool) -> Table {
        let store = Arc::new(MemoryStore::new());
        store
            .create_game(&GameRecord {
                game_id: GAME.into(),
                seed: 7,
                blinds: Blinds { small: 10, big: 20 },
                seats: seats(),
                created_at: chrono::Utc::now(),
            })
            .unwrap();
        let auth = Authenticator::new(store.clone(), Duration::from_secs(30), "token", "cardroom_session");
        let registry = SessionRegistry::new(
            RecoveryService::new(store.clone(), 5),
            Box::new(LoggingLobby),
            SessionPolicy {
                departure_grace: Duration::from_millis(grace_ms),
                allow_observers,
            },
        );
        let limits = FrameLimits::from_config(&ServerConfig::default());
        let gw = Gateway::new(registry, auth, Arc::new(ConnectionLimiter::new(10, 5)), limits);
        Table { store, gw }
    }

    fn handshake(t: &Table, game: &str, user: &str) -> HandshakeRequest {
        let session = t.gw.authenticator().create_session(user, Duration::from_secs(600)).unwrap();
        let mut headers = HashMap::new();
        headers.insert("cookie".to_string(), format!("cardroom_session={}", session.session_id));
        HandshakeRequest {
            game_id: game.into(),
            query: HashMap::new(),
            headers,
            remote_ip: "127.0.0.1".parse().unwrap(),
        }
    }

    fn open(t: &Table, id: u64, user: &str) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, rx) = Connection::channel(id);
        assert!(t.gw.on_open(&conn, Some(&handshake(t, GAME, user))), "{user} refused");
        (conn, rx)
    }

    async fn next_out(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed")
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerToClient {
        match next_out(rx).await {
            Outbound::Frame(f) => f,
            Outbound::Close => panic!("connection closed"),
        }
    }

    async fn quiet(rx: &mut mpsc::UnboundedReceiver<Outbound>, ms: u64) -> bool {
        tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await.is_err()
    }

    /// Reads the STATE_SYNC + STATE_PRIVATE pair every join starts with.
    async fn synced(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> (PublicState, PrivateState) {
        let public = match next_frame(rx).await {
            ServerToClient::StateSync { state, version, game_id } => {
                assert_eq!(game_id, GAME);
                assert_eq!(state.version, version);
                state
            }
            other => panic!("expected STATE_SYNC, got {other:?}"),
        };
        let private = match next_frame(rx).await {
            ServerToClient::StatePrivate { state } => state,
            other => panic!("expected STATE_PRIVATE, got {other:?}"),
        };
        (public, private)
    }

    fn action(kind: &str, version: u64) -> String {
        format!(r#"{{"cmd":"action","action":"{kind}","game_version":{version}}}"#)
    }

    #[tokio::test]
    async fn test_join_receives_sync_then_private() {
        let t = table(5000, false);
        let (_c, mut rx) = open(&t, 1, "ann");
        let (public, private) = synced(&mut rx).await;
        assert_eq!(public.version, 0);
        assert_eq!(public.pot, 30);
        assert_eq!(public.phase, Phase::Preflop);
        assert_eq!(private.seat, Some(1));
        assert_eq!(private.my_cards.len(), 2);
        assert_eq!(t.gw.context(1).unwrap().seat, Some(1));
    }

    #[tokio::test]
    async fn test_stale_version_rejected_without_mutation() {
        let t = table(5000, false);
        let (ann, mut ann_rx) = open(&t, 1, "ann");
        let (_bo, mut bo_rx) = open(&t, 2, "bo");
        synced(&mut ann_rx).await;
        synced(&mut bo_rx).await;

        t.gw.on_message(&ann, &action("call", 5));
        match next_frame(&mut ann_rx).await {
            ServerToClient::Error { error, current_version, .. } => {
                assert_eq!(error.as_deref(), Some("stale_version"));
                assert_eq!(current_version, Some(0));
            }
            other => panic!("expected stale_version, got {other:?}"),
        }
        assert!(quiet(&mut bo_rx, 100).await);
        assert!(t.store.actions_after(GAME, 0).unwrap().is_empty());

        t.gw.on_message(&ann, &action("call", 0));
        for rx in [&mut ann_rx, &mut bo_rx] {
            match next_frame(rx).await {
                ServerToClient::StateDiff { state, version } => {
                    assert_eq!(version, 1);
                    assert_eq!(state.pot, Some(40));
                    assert_eq!(state.to_act, Some(2));
                }
                other => panic!("expected STATE_DIFF, got {other:?}"),
            }
            assert!(matches!(next_frame(rx).await, ServerToClient::StatePrivate { .. }));
        }
        assert_eq!(t.store.actions_after(GAME, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fold_awards_pot_and_deals_next_hand() {
        let t = table(5000, false);
        let (ann, mut rx) = open(&t, 1, "ann");
        let (mut view, _) = synced(&mut rx).await;

        t.gw.on_message(&ann, &action("fold", 0));
        let ServerToClient::StateDiff { state, version } = next_frame(&mut rx).await else {
            panic!("expected STATE_DIFF");
        };
        view.apply(&state, version);

        assert_eq!(view.hand_number, 2);
        assert_eq!(view.phase, Phase::Preflop);
        let result = view.last_result.clone().unwrap();
        assert_eq!(result.payouts, vec![Payout { seat: 2, amount: 30, hand: None }]);
        // blinds of the new hand are already in
        assert_eq!(view.pot, 30);
        let stacks: u64 = view.players.iter().map(|p| p.stack).sum();
        assert_eq!(stacks + view.pot, 2000);
    }

    #[tokio::test]
    async fn test_rule_violation_keeps_state() {
        let t = table(5000, false);
        let (_ann, mut ann_rx) = open(&t, 1, "ann");
        let (bo, mut bo_rx) = open(&t, 2, "bo");
        synced(&mut ann_rx).await;
        synced(&mut bo_rx).await;

        t.gw.on_message(&bo, &action("check", 0));
        assert_eq!(next_frame(&mut bo_rx).await.error_code(), Some("not_your_turn"));
        assert!(quiet(&mut ann_rx, 100).await);
        // still open: rule violations do not count as protocol strikes
        assert!(!bo.is_closed());
        assert!(t.gw.context(2).is_some());
    }

    #[tokio::test]
    async fn test_ping_and_lobby_frames() {
        let t = table(5000, false);
        let (ann, mut rx) = open(&t, 1, "ann");
        synced(&mut rx).await;

        t.gw.on_message(&ann, r#"{"cmd":"ping"}"#);
        assert_eq!(next_frame(&mut rx).await, ServerToClient::Pong);

        t.gw.on_message(&ann, r#"{"type":"chat","text":"gl"}"#);
        assert!(quiet(&mut rx, 100).await);

        t.gw.on_message(&ann, r#"{"cmd":"action","action":"shove","game_version":0}"#);
        assert_eq!(next_frame(&mut rx).await.error_code(), Some("invalid_frame"));
    }

    #[tokio::test]
    async fn test_observers_follow_policy() {
        let closed = table(5000, false);
        let (conn, mut rx) = Connection::channel(9);
        assert!(!closed.gw.on_open(&conn, Some(&handshake(&closed, GAME, "eve"))));
        assert_eq!(next_frame(&mut rx).await.error_code(), Some("not_seated"));
        assert_eq!(next_out(&mut rx).await, Outbound::Close);

        let open_table = table(5000, true);
        let (eve, mut rx) = open(&open_table, 9, "eve");
        let (public, private) = synced(&mut rx).await;
        assert_eq!(public.players.len(), 2);
        assert_eq!(private, PrivateState::default());

        open_table.gw.on_message(&eve, &action("call", 0));
        assert_eq!(next_frame(&mut rx).await.error_code(), Some("not_seated"));
    }

    #[tokio::test]
    async fn test_unknown_game_is_refused() {
        let t = table(5000, false);
        let (conn, mut rx) = Connection::channel(1);
        assert!(!t.gw.on_open(&conn, Some(&handshake(&t, "nope", "ann"))));
        assert_eq!(next_frame(&mut rx).await.error_code(), Some("game_not_found"));
        assert_eq!(next_out(&mut rx).await, Outbound::Close);
    }

    /// A store outage while persisting fails the acting socket and leaves the
    /// live game where it was.
    #[tokio::test]
    async fn test_persistence_failure_closes_and_keeps_state() {
        let t = table(5000, false);
        let (ann, mut ann_rx) = open(&t, 1, "ann");
        let (_bo, mut bo_rx) = open(&t, 2, "bo");
        synced(&mut ann_rx).await;
        synced(&mut bo_rx).await;

        t.store.set_available(false);
        t.gw.on_message(&ann, &action("call", 0));
        assert_eq!(next_frame(&mut ann_rx).await.error_code(), Some("server_error"));
        assert_eq!(next_out(&mut ann_rx).await, Outbound::Close);
        assert!(quiet(&mut bo_rx, 100).await);
        t.gw.on_close(&ann);

        t.store.set_available(true);
        let (ann, mut ann_rx) = open(&t, 3, "ann");
        let (public, _) = synced(&mut ann_rx).await;
        assert_eq!(public.version, 0);

        t.gw.on_message(&ann, &action("call", 0));
        assert!(matches!(next_frame(&mut ann_rx).await, ServerToClient::StateDiff { version: 1, .. }));
    }

    #[tokio::test]
    async fn test_reconnect_inside_grace_is_silent() {
        let t = table(150, false);
        let (_ann, mut ann_rx) = open(&t, 1, "ann");
        let (bo, mut bo_rx) = open(&t, 2, "bo");
        synced(&mut ann_rx).await;
        synced(&mut bo_rx).await;

        t.gw.on_close(&bo);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_bo, mut bo_rx) = open(&t, 3, "bo");
        synced(&mut bo_rx).await;

        assert!(quiet(&mut ann_rx, 400).await, "no PLAYER_DISCONNECTED expected");
    }

    #[tokio::test]
    async fn test_disconnect_after_grace_is_broadcast() {
        let t = table(50, false);
        let (_ann, mut ann_rx) = open(&t, 1, "ann");
        let (bo, mut bo_rx) = open(&t, 2, "bo");
        synced(&mut ann_rx).await;
        synced(&mut bo_rx).await;

        t.gw.on_close(&bo);
        assert_eq!(
            next_frame(&mut ann_rx).await,
            ServerToClient::PlayerDisconnected { seat: Some(2), user_id: "bo".into() }
        );
    }

    /// An empty game retires its actor; the next join rebuilds it from the
    /// snapshot and the log.
    #[tokio::test]
    async fn test_idle_game_is_recovered_on_next_join() {
        let t = table(20, false);
        let (ann, mut rx) = open(&t, 1, "ann");
        synced(&mut rx).await;
        t.gw.on_message(&ann, &action("call", 0));
        assert!(matches!(next_frame(&mut rx).await, ServerToClient::StateDiff { version: 1, .. }));
        t.gw.on_close(&ann);

        let mut retired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !t.gw.inner().is_live(GAME) {
                retired = true;
                break;
            }
        }
        assert!(retired, "actor should retire once empty");
        assert_eq!(t.gw.inner().live_games(), 0);

        let (_ann, mut rx) = open(&t, 2, "ann");
        let (public, private) = synced(&mut rx).await;
        assert_eq!(public.version, 1);
        assert_eq!(public.to_act, Some(2));
        assert!(private.legal_actions.is_empty());
    }

    /// Holds the first log read of `game` until released, so a cold load can be
    /// caught halfway.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        game: &'static str,
        entered: parking_lot::Mutex<Option<std::sync::mpsc::Sender<()>>>,
        release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl GameStore for GatedStore {
        fn create_game(&self, record: &GameRecord) -> Result<(), crate::error::StoreError> {
            self.inner.create_game(record)
        }
        fn game(&self, game_id: &str) -> Result<Option<GameRecord>, crate::error::StoreError> {
            self.inner.game(game_id)
        }
        fn append_action(&self, entry: &crate::store::ActionLogEntry) -> Result<(), crate::error::StoreError> {
            self.inner.append_action(entry)
        }
        fn actions_after(
            &self,
            game_id: &str,
            after: u64,
        ) -> Result<Vec<crate::store::ActionLogEntry>, crate::error::StoreError> {
            if game_id == self.game {
                if let Some(entered) = self.entered.lock().take() {
                    let _ = entered.send(());
                    let _ = self.release.lock().recv_timeout(Duration::from_secs(2));
                }
            }
            self.inner.actions_after(game_id, after)
        }
        fn save_snapshot(&self, snapshot: &crate::store::Snapshot) -> Result<(), crate::error::StoreError> {
            self.inner.save_snapshot(snapshot)
        }
        fn latest_snapshot(&self, game_id: &str) -> Result<Option<crate::store::Snapshot>, crate::error::StoreError> {
            self.inner.latest_snapshot(game_id)
        }
    }

    /// A game being rebuilt from its log must not hold up play at other tables.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cold_load_does_not_block_other_games() {
        let memory = Arc::new(MemoryStore::new());
        for game_id in [GAME, "cold"] {
            memory
                .create_game(&GameRecord {
                    game_id: game_id.into(),
                    seed: 7,
                    blinds: Blinds { small: 10, big: 20 },
                    seats: seats(),
                    created_at: chrono::Utc::now(),
                })
                .unwrap();
        }
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let gated = Arc::new(GatedStore {
            inner: memory.clone(),
            game: "cold",
            entered: parking_lot::Mutex::new(Some(entered_tx)),
            release: parking_lot::Mutex::new(release_rx),
        });
        let registry = SessionRegistry::new(
            RecoveryService::new(gated, 5),
            Box::new(LoggingLobby),
            SessionPolicy {
                departure_grace: Duration::from_secs(5),
                allow_observers: false,
            },
        );
        let auth = Authenticator::new(memory.clone(), Duration::from_secs(30), "token", "cardroom_session");
        let limits = FrameLimits::from_config(&ServerConfig::default());
        let gw = Gateway::new(registry, auth, Arc::new(ConnectionLimiter::new(10, 5)), limits);
        let t = Arc::new(Table { store: memory, gw });

        let (ann, mut ann_rx) = open(&t, 1, "ann");
        synced(&mut ann_rx).await;

        let loading = {
            let t = t.clone();
            tokio::task::spawn_blocking(move || {
                let (conn, rx) = Connection::channel(2);
                let opened = t.gw.on_open(&conn, Some(&handshake(&t, "cold", "bo")));
                (opened, conn, rx)
            })
        };
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("cold load never reached the log");

        t.gw.on_message(&ann, &action("call", 0));
        assert!(matches!(next_frame(&mut ann_rx).await, ServerToClient::StateDiff { version: 1, .. }));
        assert!(!loading.is_finished(), "cold load finished before the other table moved");

        release_tx.send(()).unwrap();
        let (opened, _conn, mut rx) = loading.await.unwrap();
        assert!(opened);
        assert!(matches!(next_frame(&mut rx).await, ServerToClient::StateSync { version: 0, .. }));
        assert_eq!(t.gw.inner().live_games(), 2);
    }

    #[tokio::test]
    async fn test_user_ceiling_and_release() {
        let t = table(5000, false);
        let mut conns = vec![];
        for id in 0..5 {
            conns.push(open(&t, id, "ann"));
        }
        let (extra, mut rx) = Connection::channel(99);
        assert!(!t.gw.on_open(&extra, Some(&handshake(&t, GAME, "ann"))));
        assert_eq!(next_frame(&mut rx).await.error_code(), Some("user_connection_limit_exceeded"));

        t.gw.on_close(&conns[0].0);
        let (again, _rx) = Connection::channel(100);
        assert!(t.gw.on_open(&again, Some(&handshake(&t, GAME, "ann"))));
        assert_eq!(t.gw.open_connections(), 5);
    }

    /// Full round trip over a real socket: token handshake, sync, ping, and a
    /// replayed token failing closed.
    #[tokio::test]
    async fn test_websocket_round_trip() {
        use crate::transport::{self, AppState};
        use futures::{SinkExt, StreamExt};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        let t = table(5000, false);
        let session = t.gw.authenticator().create_session("ann", Duration::from_secs(600)).unwrap();
        let token = t.gw.authenticator().issue_token(session.session_id).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(transport::serve(listener, AppState::new(t.gw)));

        async fn read_frame<S>(ws: &mut S) -> ServerToClient
        where
            S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
        {
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                    .await
                    .expect("timed out")
                    .expect("stream ended")
                    .expect("ws error");
                if let Message::Text(text) = msg {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }

        let url = format!("ws://{addr}/ws/{GAME}?token={token}");
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        assert!(matches!(read_frame(&mut ws).await, ServerToClient::StateSync { version: 0, .. }));
        assert!(matches!(read_frame(&mut ws).await, ServerToClient::StatePrivate { .. }));

        ws.send(Message::Text(r#"{"cmd":"ping"}"#.into())).await.unwrap();
        assert_eq!(read_frame(&mut ws).await, ServerToClient::Pong);

        let (mut replay, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(read_frame(&mut replay).await.error_code(), Some("invalid_token"));

        let mut tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        tcp.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        tcp.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.ends_with("ok"));
    }
}
