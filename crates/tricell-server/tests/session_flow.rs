use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use tricell_core::{Phase, SimConfigInput};
use tricell_server::protocol::{ClientMessage, FrameMessage, ServerMessage, StateMessage};
use tricell_server::session::{Connection, SessionEvent, SessionManager};
use tricell_server::ws::AppState;

type Outbound = mpsc::UnboundedReceiver<ServerMessage>;

fn manager() -> SessionManager {
    SessionManager::new(Duration::from_secs(60))
}

fn attach(sessions: &SessionManager, identity: &str) -> (Connection, Outbound) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = sessions.attach(identity, tx);
    (connection, rx)
}

fn control(connection: &Connection, message: ClientMessage) {
    connection
        .events
        .send(SessionEvent::Control(message))
        .expect("session mailbox open");
}

async fn recv(rx: &mut Outbound) -> ServerMessage {
    timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("transport closed")
}

async fn recv_state(rx: &mut Outbound) -> StateMessage {
    match recv(rx).await {
        ServerMessage::State(state) => state,
        other => panic!("expected state message, got {other:?}"),
    }
}

async fn recv_frame(rx: &mut Outbound) -> FrameMessage {
    match recv(rx).await {
        ServerMessage::Frame(frame) => frame,
        other => panic!("expected frame message, got {other:?}"),
    }
}

async fn recv_error(rx: &mut Outbound) -> String {
    match recv(rx).await {
        ServerMessage::Error { message } => message,
        other => panic!("expected error message, got {other:?}"),
    }
}

fn start_message(seed: u64) -> ClientMessage {
    ClientMessage::Start {
        config: Some(SimConfigInput {
            width: Some(16),
            height: Some(16),
            seed: Some(seed),
            alive_ratio: Some(0.3),
            ..SimConfigInput::default()
        }),
        backend: None,
    }
}

#[tokio::test(start_paused = true)]
async fn connect_then_start_emits_initial_frame() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "alpha");

    let state = recv_state(&mut rx).await;
    assert!(!state.has_run);
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.run_id, None);

    control(&connection, start_message(11));
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.tick, 0);
    assert_eq!(frame.backend, "reference");
    assert!(frame.payload.is_some(), "live frames carry the state arrays");

    let state = recv_state(&mut rx).await;
    assert!(state.has_run);
    assert_eq!(state.phase, Phase::Running);
    assert_eq!(state.tick, 0);
    assert_eq!(state.seed, Some(11));
    assert_eq!(state.run_id.as_deref(), Some(frame.run_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn step_emits_one_frame_per_tick() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "beta");
    let _ = recv_state(&mut rx).await;

    control(&connection, start_message(5));
    let _ = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;
    control(&connection, ClientMessage::Pause);
    let _ = recv_state(&mut rx).await;

    control(&connection, ClientMessage::Step { ticks: Some(3.0) });
    for expected_tick in 1..=3 {
        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.tick, expected_tick);
    }
    let state = recv_state(&mut rx).await;
    assert_eq!(state.tick, 3);
    assert_eq!(state.phase, Phase::Paused);
}

#[tokio::test(start_paused = true)]
async fn step_zero_normalizes_to_one_tick() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "gamma");
    let _ = recv_state(&mut rx).await;
    control(&connection, start_message(5));
    let _ = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;
    control(&connection, ClientMessage::Pause);
    let _ = recv_state(&mut rx).await;

    control(&connection, ClientMessage::Step { ticks: Some(0.0) });
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.tick, 1);
    let state = recv_state(&mut rx).await;
    assert_eq!(state.tick, 1);
}

#[tokio::test(start_paused = true)]
async fn autoplay_advances_until_paused() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "delta");
    let _ = recv_state(&mut rx).await;

    control(&connection, start_message(21));
    let _ = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;

    // The paused clock only advances while every task is idle, so each recv
    // below deterministically lands on the next autoplay fire.
    let first = recv_frame(&mut rx).await;
    assert_eq!(first.tick, 1);
    let second = recv_frame(&mut rx).await;
    assert_eq!(second.tick, 2);

    control(&connection, ClientMessage::Pause);
    let state = recv_state(&mut rx).await;
    assert_eq!(state.phase, Phase::Paused);

    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert!(
        rx.try_recv().is_err(),
        "no frames may be produced while paused"
    );
}

#[tokio::test(start_paused = true)]
async fn control_errors_for_missing_run() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "epsilon");
    let _ = recv_state(&mut rx).await;

    control(&connection, ClientMessage::Reset { seed: None, config: None });
    assert_eq!(recv_error(&mut rx).await, "no active run");
    let state = recv_state(&mut rx).await;
    assert!(!state.has_run, "session state is unchanged after an error");

    control(&connection, ClientMessage::Step { ticks: Some(2.0) });
    assert_eq!(recv_error(&mut rx).await, "no active run");
    let _ = recv_state(&mut rx).await;

    // Pause without a run is a no-op, not an error: only the state snapshot
    // comes back.
    control(&connection, ClientMessage::Pause);
    let state = recv_state(&mut rx).await;
    assert_eq!(state.phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn unknown_backend_is_rejected() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "zeta");
    let _ = recv_state(&mut rx).await;

    control(
        &connection,
        ClientMessage::Start { config: None, backend: Some("native-simd".into()) },
    );
    let error = recv_error(&mut rx).await;
    assert!(error.contains("native-simd"));
    let state = recv_state(&mut rx).await;
    assert!(!state.has_run);
}

#[tokio::test(start_paused = true)]
async fn malformed_input_reports_and_rebroadcasts() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "eta");
    let _ = recv_state(&mut rx).await;

    connection
        .events
        .send(SessionEvent::Malformed("unknown variant `warp`".into()))
        .expect("mailbox open");
    let error = recv_error(&mut rx).await;
    assert!(error.contains("warp"));
    let _ = recv_state(&mut rx).await;
}

#[tokio::test(start_paused = true)]
async fn reset_preserves_run_identity_and_replays_tick_zero() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "theta");
    let _ = recv_state(&mut rx).await;

    control(&connection, start_message(99));
    let initial = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;
    control(&connection, ClientMessage::Pause);
    let _ = recv_state(&mut rx).await;

    control(&connection, ClientMessage::Step { ticks: Some(4.0) });
    for _ in 0..4 {
        let _ = recv_frame(&mut rx).await;
    }
    let _ = recv_state(&mut rx).await;

    // Reset with no overrides rebuilds from the same seed: the fresh initial
    // frame must reproduce the original digest.
    control(&connection, ClientMessage::Reset { seed: None, config: None });
    let fresh = recv_frame(&mut rx).await;
    assert_eq!(fresh.tick, 0);
    assert_eq!(fresh.digest, initial.digest);
    assert_eq!(fresh.run_id, initial.run_id);
    let state = recv_state(&mut rx).await;
    assert_eq!(state.tick, 0);
    assert_eq!(state.phase, Phase::Paused, "reset preserves the phase");

    // A seed override changes the layout.
    control(&connection, ClientMessage::Reset { seed: Some(100), config: None });
    let reseeded = recv_frame(&mut rx).await;
    assert_eq!(reseeded.tick, 0);
    assert_ne!(reseeded.digest, initial.digest);
    let state = recv_state(&mut rx).await;
    assert_eq!(state.seed, Some(100));
}

#[tokio::test(start_paused = true)]
async fn stop_clears_the_run() {
    let sessions = manager();
    let (connection, mut rx) = attach(&sessions, "iota");
    let _ = recv_state(&mut rx).await;
    control(&connection, start_message(7));
    let _ = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;

    control(&connection, ClientMessage::Stop);
    match recv(&mut rx).await {
        ServerMessage::Info { message } => assert!(message.contains("stopped")),
        other => panic!("expected info message, got {other:?}"),
    }
    let state = recv_state(&mut rx).await;
    assert!(!state.has_run);
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.run_id, None);
    assert_eq!(state.backend, None);
    assert_eq!(state.seed, None);

    // A stopped session accepts a fresh start.
    control(&connection, start_message(8));
    let frame = recv_frame(&mut rx).await;
    assert_eq!(frame.tick, 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_the_disconnect_tick() {
    let sessions = manager();
    let identity = "kappa";
    let (connection, mut rx) = attach(&sessions, identity);
    let _ = recv_state(&mut rx).await;

    control(&connection, start_message(31));
    let _ = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;
    control(&connection, ClientMessage::Pause);
    let _ = recv_state(&mut rx).await;
    control(&connection, ClientMessage::Step { ticks: Some(5.0) });
    let mut last_digest = String::new();
    for _ in 0..5 {
        last_digest = recv_frame(&mut rx).await.digest;
    }
    let _ = recv_state(&mut rx).await;
    control(&connection, ClientMessage::Resume);
    let resumed = recv_state(&mut rx).await;
    assert_eq!(resumed.phase, Phase::Running);

    // Consume any autoplay frames that land before the disconnect so the
    // replay expectation below is exact.
    connection
        .events
        .send(SessionEvent::Disconnect { conn: connection.conn })
        .expect("mailbox open");
    tokio::task::yield_now().await;
    let mut tick_at_disconnect = 5;
    while let Ok(message) = rx.try_recv() {
        if let ServerMessage::Frame(frame) = message {
            tick_at_disconnect = frame.tick;
            last_digest = frame.digest;
        }
    }

    // While detached the simulation must not advance at all.
    tokio::time::advance(Duration::from_secs(20)).await;
    tokio::task::yield_now().await;

    let (reconnection, mut rx2) = attach(&sessions, identity);
    let state = recv_state(&mut rx2).await;
    assert!(state.has_run);
    assert_eq!(state.tick, tick_at_disconnect, "no hidden tick drift");

    let replay = recv_frame(&mut rx2).await;
    assert_eq!(replay.tick, tick_at_disconnect);
    assert_eq!(replay.digest, last_digest);
    assert!(replay.payload.is_none(), "replay sends omit the payload");

    // The run was running at disconnect, so autoplay resumes immediately.
    let next = recv_frame(&mut rx2).await;
    assert_eq!(next.tick, tick_at_disconnect + 1);
    drop(reconnection);
}

#[tokio::test(start_paused = true)]
async fn disconnect_ttl_discards_the_session() {
    let sessions = SessionManager::new(Duration::from_secs(5));
    let identity = "lambda";
    let (connection, mut rx) = attach(&sessions, identity);
    let _ = recv_state(&mut rx).await;
    control(&connection, start_message(3));
    let _ = recv_frame(&mut rx).await;
    let _ = recv_state(&mut rx).await;
    assert_eq!(sessions.session_count(), 1);

    connection
        .events
        .send(SessionEvent::Disconnect { conn: connection.conn })
        .expect("mailbox open");
    tokio::task::yield_now().await;

    // Short of the TTL the session survives and the run is intact.
    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    assert_eq!(sessions.session_count(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sessions.session_count(), 0);

    // A late reconnect gets a fresh, idle session.
    let (_connection, mut rx2) = attach(&sessions, identity);
    let state = recv_state(&mut rx2).await;
    assert!(!state.has_run);
}

#[tokio::test(start_paused = true)]
async fn sessions_are_independent() {
    let sessions = manager();
    let (left, mut left_rx) = attach(&sessions, "mu");
    let (right, mut right_rx) = attach(&sessions, "nu");
    let _ = recv_state(&mut left_rx).await;
    let _ = recv_state(&mut right_rx).await;
    assert_eq!(sessions.session_count(), 2);

    control(&left, start_message(41));
    let left_frame = recv_frame(&mut left_rx).await;
    let _ = recv_state(&mut left_rx).await;

    control(&right, start_message(42));
    let right_frame = recv_frame(&mut right_rx).await;
    let _ = recv_state(&mut right_rx).await;

    assert_ne!(left_frame.run_id, right_frame.run_id);
    assert_ne!(left_frame.digest, right_frame.digest);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_every_session() {
    let sessions = manager();
    let (_a, mut rx_a) = attach(&sessions, "xi");
    let (_b, mut rx_b) = attach(&sessions, "omicron");
    let _ = recv_state(&mut rx_a).await;
    let _ = recv_state(&mut rx_b).await;

    sessions.shutdown();
    assert_eq!(sessions.session_count(), 0);

    // AppState is just a cheap clone over the same manager.
    let state = AppState { sessions: sessions.clone() };
    assert_eq!(state.sessions.session_count(), 0);
}
