//! Session orchestration: one authoritative run per logical client.
//!
//! Each session is a single tokio task that owns its state outright. Every
//! mutation flows through the task's mailbox (control messages, transport
//! attach/detach) or one of its own timer arms (autoplay, disconnect
//! deadline), so per-session ordering is total without any locking. The
//! registry lock only serializes mailbox sends against session teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

use tricell_core::{
    ControlAction, Phase, SessionSnapshot, SimConfig, SimConfigInput, Simulator, TickReport,
    decide,
};

use crate::protocol::{ClientMessage, FrameMessage, FramePayload, ServerMessage, StateMessage};

/// Outbound half of an attached viewer connection. The ws layer drains this
/// and serializes onto the socket.
pub type Transport = mpsc::UnboundedSender<ServerMessage>;

/// The only backend this server executes. Alternate compiled backends are
/// external parity targets, not selectable engines.
pub const REFERENCE_BACKEND: &str = "reference";

/// Events consumed by a session task.
#[derive(Debug)]
pub enum SessionEvent {
    /// A parsed control message from the attached transport.
    Control(ClientMessage),
    /// The transport delivered something unparseable; echo the reason.
    Malformed(String),
    /// A transport attached (fresh connect or reconnect).
    Connect { conn: u64, transport: Transport },
    /// The identified connection went away. Stale ids are ignored so a
    /// reconnect can never be detached by its predecessor's teardown.
    Disconnect { conn: u64 },
    /// Orchestrator-wide shutdown.
    Shutdown,
}

/// Mailbox handle to a live session, as returned by
/// [`SessionManager::attach`].
#[derive(Debug, Clone)]
pub struct Connection {
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub conn: u64,
}

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SessionEvent>>>>;

/// Owns all live sessions, keyed by client identity. Identical identity
/// routes to the same session across reconnects within the TTL window.
#[derive(Clone)]
pub struct SessionManager {
    registry: Registry,
    disconnect_ttl: Duration,
    conn_counter: Arc<AtomicU64>,
}

impl SessionManager {
    #[must_use]
    pub fn new(disconnect_ttl: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            disconnect_ttl,
            conn_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attaches a transport to the identity's session, spawning the session
    /// task on first contact. The send happens under the registry lock so it
    /// cannot race a TTL teardown.
    pub fn attach(&self, identity: &str, transport: Transport) -> Connection {
        let conn = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.lock().unwrap();
        if let Some(events) = registry.get(identity) {
            if events
                .send(SessionEvent::Connect { conn, transport: transport.clone() })
                .is_ok()
            {
                return Connection { events: events.clone(), conn };
            }
            // The task already exited; fall through and replace it.
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            identity.to_owned(),
            Arc::clone(&self.registry),
            self.disconnect_ttl,
        );
        tokio::spawn(actor.run(rx));
        tx.send(SessionEvent::Connect { conn, transport })
            .expect("freshly spawned session cannot be closed");
        registry.insert(identity.to_owned(), tx.clone());
        info!(identity, "session created");
        Connection { events: tx, conn }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Tears down every session: autoplay timers stop and transports close
    /// when each task drops its state.
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock().unwrap();
        for (identity, events) in registry.drain() {
            debug!(identity, "shutting down session");
            let _ = events.send(SessionEvent::Shutdown);
        }
    }
}

/// Active-run fields are all-or-nothing; a partial run is unrepresentable.
enum RunSlot {
    Idle,
    Active(ActiveRun),
}

struct ActiveRun {
    run_id: String,
    backend: String,
    config: SimConfig,
    simulator: Simulator,
}

/// What the main loop woke up for.
enum Wake {
    Event(Option<SessionEvent>),
    TickDue,
    DropDue,
}

struct SessionActor {
    identity: String,
    registry: Registry,
    disconnect_ttl: Duration,
    run: RunSlot,
    phase: Phase,
    transport: Option<Transport>,
    current_conn: u64,
    last_frame: Option<FrameMessage>,
}

impl SessionActor {
    fn new(identity: String, registry: Registry, disconnect_ttl: Duration) -> Self {
        Self {
            identity,
            registry,
            disconnect_ttl,
            run: RunSlot::Idle,
            phase: Phase::Idle,
            transport: None,
            current_conn: 0,
            last_frame: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        // The autoplay interval and drop deadline live outside `self` so the
        // select arms below borrow disjoint state.
        let mut autoplay: Option<Interval> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let wake = {
                let tick_due = async {
                    match autoplay.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                let drop_due = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    event = rx.recv() => Wake::Event(event),
                    () = tick_due => Wake::TickDue,
                    () = drop_due => Wake::DropDue,
                }
            };

            match wake {
                Wake::Event(None) => break,
                Wake::Event(Some(event)) => {
                    if !self.handle_event(event, &mut autoplay, &mut deadline) {
                        break;
                    }
                }
                Wake::TickDue => self.autoplay_fire(),
                Wake::DropDue => {
                    let (revived, pending) = self.expire(&mut rx);
                    deadline = None;
                    let mut keep_running = revived;
                    for event in pending {
                        if !self.handle_event(event, &mut autoplay, &mut deadline) {
                            keep_running = false;
                        }
                    }
                    if !keep_running {
                        info!(identity = %self.identity, "session dropped after disconnect TTL");
                        break;
                    }
                }
            }
        }
    }

    /// Deadline expiry. Sends happen under the registry lock, so draining the
    /// mailbox while holding it observes every event that was ever queued: a
    /// pending connect revives the session instead of losing the client.
    fn expire(&mut self, rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> (bool, Vec<SessionEvent>) {
        let mut registry = self.registry.lock().unwrap();
        let mut pending = Vec::new();
        while let Ok(event) = rx.try_recv() {
            pending.push(event);
        }
        let revived = pending
            .iter()
            .any(|event| matches!(event, SessionEvent::Connect { .. }));
        if !revived {
            rx.close();
            while let Ok(event) = rx.try_recv() {
                pending.push(event);
            }
            registry.remove(&self.identity);
        }
        (revived, pending)
    }

    /// Returns `false` when the session should terminate.
    fn handle_event(
        &mut self,
        event: SessionEvent,
        autoplay: &mut Option<Interval>,
        deadline: &mut Option<Instant>,
    ) -> bool {
        match event {
            SessionEvent::Control(message) => self.handle_control(message, autoplay),
            SessionEvent::Malformed(reason) => {
                warn!(identity = %self.identity, %reason, "malformed control message");
                self.send(ServerMessage::Error { message: format!("malformed message: {reason}") });
                self.send_state();
            }
            SessionEvent::Connect { conn, transport } => {
                self.handle_connect(conn, transport, autoplay, deadline);
            }
            SessionEvent::Disconnect { conn } => {
                if conn != self.current_conn {
                    debug!(identity = %self.identity, conn, "ignoring stale disconnect");
                    return true;
                }
                self.handle_disconnect(autoplay, deadline);
            }
            SessionEvent::Shutdown => return false,
        }
        true
    }

    fn handle_connect(
        &mut self,
        conn: u64,
        transport: Transport,
        autoplay: &mut Option<Interval>,
        deadline: &mut Option<Instant>,
    ) {
        debug!(identity = %self.identity, conn, "transport attached");
        *deadline = None;
        self.current_conn = conn;
        self.transport = Some(transport);
        // Replay, not re-simulation: the first tick a reconnecting viewer
        // sees is exactly the tick at disconnect.
        self.send_state();
        if let Some(frame) = self.last_frame.clone() {
            self.send(ServerMessage::Frame(frame));
        }
        if self.phase == Phase::Running {
            self.arm_autoplay(autoplay);
        }
    }

    fn handle_disconnect(
        &mut self,
        autoplay: &mut Option<Interval>,
        deadline: &mut Option<Instant>,
    ) {
        debug!(identity = %self.identity, "transport detached");
        self.transport = None;
        // No target for frames: autoplay halts here and the run holds its
        // tick until reconnect or TTL expiry.
        *autoplay = None;
        *deadline = Some(Instant::now() + self.disconnect_ttl);
    }

    fn handle_control(&mut self, message: ClientMessage, autoplay: &mut Option<Interval>) {
        let snapshot = SessionSnapshot {
            has_run: matches!(self.run, RunSlot::Active(_)),
            phase: self.phase,
        };
        let action = decide(snapshot, &message.verb());
        debug!(identity = %self.identity, ?action, "control decision");
        match action {
            ControlAction::StartNew => {
                let ClientMessage::Start { config, backend } = message else {
                    unreachable!("decision table maps StartNew only from start");
                };
                self.start_new(config, backend, autoplay);
            }
            ControlAction::Resume => {
                self.phase = Phase::Running;
                self.arm_autoplay(autoplay);
            }
            ControlAction::Pause => {
                self.phase = Phase::Paused;
                *autoplay = None;
            }
            ControlAction::Reset => {
                let ClientMessage::Reset { seed, config } = message else {
                    unreachable!("decision table maps Reset only from reset");
                };
                self.reset(seed, config, autoplay);
            }
            ControlAction::Step { ticks } => {
                let reports = {
                    let RunSlot::Active(run) = &mut self.run else {
                        unreachable!("decision table rejects step without a run");
                    };
                    run.simulator.step_many(u64::from(ticks))
                };
                for report in &reports {
                    self.emit_frame(report);
                }
            }
            ControlAction::Stop => {
                let run_id = match &self.run {
                    RunSlot::Active(run) => run.run_id.clone(),
                    RunSlot::Idle => unreachable!("decision table maps Stop only with a run"),
                };
                self.run = RunSlot::Idle;
                self.phase = Phase::Idle;
                self.last_frame = None;
                *autoplay = None;
                info!(identity = %self.identity, run_id, "run stopped");
                self.send(ServerMessage::Info { message: format!("run {run_id} stopped") });
            }
            ControlAction::Noop => {}
            ControlAction::Reject { reason } => {
                self.send(ServerMessage::Error { message: reason.to_owned() });
            }
        }
        // The authoritative phase is re-broadcast after every handled
        // message, errors included, so viewers can always resynchronize.
        self.send_state();
    }

    fn start_new(
        &mut self,
        config: Option<SimConfigInput>,
        backend: Option<String>,
        autoplay: &mut Option<Interval>,
    ) {
        let backend = backend.unwrap_or_else(|| REFERENCE_BACKEND.to_owned());
        if backend != REFERENCE_BACKEND {
            self.send(ServerMessage::Error {
                message: format!("unknown backend '{backend}'"),
            });
            return;
        }
        let config = SimConfig::from_input(&config.unwrap_or_default());
        let run_id = format!("run-{:08x}", rand::random::<u32>());
        info!(identity = %self.identity, run_id, seed = config.seed, "starting run");
        let simulator = Simulator::new(config.clone());
        self.run = RunSlot::Active(ActiveRun { run_id, backend, config, simulator });
        self.phase = Phase::Running;
        self.emit_initial_frame();
        self.arm_autoplay(autoplay);
    }

    /// Rebuilds the simulator from the current config with optional partial
    /// overrides, preserving run id and phase.
    fn reset(
        &mut self,
        seed: Option<u64>,
        config: Option<SimConfigInput>,
        autoplay: &mut Option<Interval>,
    ) {
        let RunSlot::Active(run) = &mut self.run else {
            unreachable!("decision table rejects reset without a run");
        };
        let mut patch = config.unwrap_or_default();
        if seed.is_some() {
            patch.seed = seed;
        }
        let next_config = run.config.merged(&patch);
        info!(
            identity = %self.identity,
            run_id = run.run_id,
            seed = next_config.seed,
            "resetting run"
        );
        run.simulator = Simulator::new(next_config.clone());
        run.config = next_config;
        self.emit_initial_frame();
        if self.phase == Phase::Running {
            self.arm_autoplay(autoplay);
        } else {
            *autoplay = None;
        }
    }

    fn autoplay_fire(&mut self) {
        // A fire with nothing to do is simply skipped; there is no catch-up.
        if self.phase != Phase::Running || self.transport.is_none() {
            return;
        }
        let report = {
            let RunSlot::Active(run) = &mut self.run else {
                return;
            };
            run.simulator.step()
        };
        self.emit_frame(&report);
    }

    /// Always replaces the previous interval so a stale timer can never fire
    /// against a replaced simulator.
    fn arm_autoplay(&self, autoplay: &mut Option<Interval>) {
        let RunSlot::Active(run) = &self.run else {
            *autoplay = None;
            return;
        };
        let period = Duration::from_millis(run.config.autoplay_interval_ms());
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        *autoplay = Some(interval);
    }

    fn emit_initial_frame(&mut self) {
        let RunSlot::Active(run) = &self.run else {
            return;
        };
        let report = run.simulator.report();
        self.emit_frame(&report);
    }

    fn emit_frame(&mut self, report: &TickReport) {
        let RunSlot::Active(run) = &self.run else {
            return;
        };
        let frame = FrameMessage {
            run_id: run.run_id.clone(),
            tick: report.tick,
            digest: report.digest.clone(),
            backend: run.backend.clone(),
            metrics: report.metrics,
            payload: Some(FramePayload::encode(&run.simulator.state())),
        };
        self.last_frame = Some(frame.replay_copy());
        self.send(ServerMessage::Frame(frame));
    }

    fn send_state(&mut self) {
        let message = match &self.run {
            RunSlot::Idle => StateMessage {
                phase: self.phase,
                has_run: false,
                run_id: None,
                tick: 0,
                backend: None,
                seed: None,
            },
            RunSlot::Active(run) => StateMessage {
                phase: self.phase,
                has_run: true,
                run_id: Some(run.run_id.clone()),
                tick: run.simulator.tick(),
                backend: Some(run.backend.clone()),
                seed: Some(run.config.seed as u64),
            },
        };
        self.send(ServerMessage::State(message));
    }

    fn send(&mut self, message: ServerMessage) {
        let Some(transport) = &self.transport else {
            return;
        };
        if transport.send(message).is_err() {
            // The writer half is gone; the ws layer's disconnect event may
            // still be in flight. Detach now so nothing else is queued.
            debug!(identity = %self.identity, "transport send failed; detaching");
            self.transport = None;
        }
    }
}
