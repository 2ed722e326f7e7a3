use crate::channel::Channel;
use crate::error::{HostError, HostErrorCode};
use crate::event::{Emitter, Listener};
use crate::process_transport::{spawn_pipe, ControlLane, PipeChannel};
use crate::protocol::ControlMessage;
use crate::rpc::{DispatchGate, RpcProtocol};
use crate::settings::SupervisorSettings;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostState {
    Starting,
    Running,
    Terminating,
    Terminated,
}

impl HostState {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

/// Lifecycle state of one supervised host. Transitions only move forward.
pub struct HostHandle {
    host_id: String,
    state: Mutex<HostState>,
    on_did_change_state: Emitter<HostState>,
}

impl HostHandle {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            state: Mutex::new(HostState::Starting),
            on_did_change_state: Emitter::new(),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    pub fn is_terminating(&self) -> bool {
        self.state() >= HostState::Terminating
    }

    pub fn on_did_change_state(&self) -> &Emitter<HostState> {
        &self.on_did_change_state
    }

    /// Moves to `next`. Returns `Ok(false)` when already there; moving
    /// backwards is an error. Intermediate states may be skipped.
    pub fn advance(&self, next: HostState) -> Result<bool, HostError> {
        {
            let mut state = self.state.lock();
            if *state == next {
                return Ok(false);
            }
            if *state > next {
                return Err(HostError::new(
                    HostErrorCode::InvalidTransition,
                    format!("{} -> {}", state.as_tag(), next.as_tag()),
                ));
            }
            *state = next;
        }
        tracing::debug!(host = %self.host_id, state = next.as_tag(), "host state changed");
        self.on_did_change_state.fire(&next);
        Ok(true)
    }
}

impl DispatchGate for HostHandle {
    fn accepts_messages(&self) -> bool {
        self.state() != HostState::Terminated
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The host acknowledged or exited before the deadline.
    Graceful,
    /// The deadline passed and the host was killed.
    Forced,
    /// The host went away without being asked to.
    Exited,
    AlreadyTerminated,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SupervisorTelemetrySnapshot {
    pub graceful_terminations: u64,
    pub forced_terminations: u64,
    pub unexpected_exits: u64,
}

#[derive(Default)]
struct SupervisorTelemetry {
    graceful_terminations: AtomicU64,
    forced_terminations: AtomicU64,
    unexpected_exits: AtomicU64,
}

/// Owns one out-of-process host: spawn, handshake, and termination.
pub struct HostSupervisor {
    handle: Arc<HostHandle>,
    settings: SupervisorSettings,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    channel: Arc<PipeChannel>,
    control: Arc<ControlLane>,
    protocol: Arc<RpcProtocol>,
    on_did_terminate: Arc<Emitter<TerminationOutcome>>,
    // Outcome of the terminate call in progress, for callers that arrive during it.
    termination: watch::Sender<Option<TerminationOutcome>>,
    telemetry: Arc<SupervisorTelemetry>,
    _exit_watch: Listener,
}

impl HostSupervisor {
    /// Spawns the worker, performs the handshake, and returns once the host is Running.
    pub async fn start(host_id: &str, settings: SupervisorSettings) -> Result<Self, HostError> {
        if settings.command.trim().is_empty() {
            return Err(HostError::new(
                HostErrorCode::InvalidConfig,
                "host command is empty",
            ));
        }

        let mut command = Command::new(&settings.command);
        command
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .env("EXTHOST_HOST_ID", host_id);
        for (key, value) in &settings.extra_env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            HostError::new(
                HostErrorCode::SpawnFailed,
                format!("spawn extension host failed: {err}"),
            )
        })?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(HostError::new(
                HostErrorCode::TransportIo,
                "host stdio is not piped",
            ));
        };
        tracing::info!(host = host_id, pid, command = %settings.command, "spawned extension host");

        let handle = Arc::new(HostHandle::new(host_id));
        let (channel, control) = spawn_pipe(stdout, stdin);
        let protocol = RpcProtocol::with_gate(channel.clone(), handle.clone());
        let on_did_terminate = Arc::new(Emitter::new());
        let telemetry = Arc::new(SupervisorTelemetry::default());
        let exit_watch = watch_unexpected_exit(
            &control,
            handle.clone(),
            Arc::downgrade(&protocol),
            on_did_terminate.clone(),
            telemetry.clone(),
        );

        let supervisor = Self {
            handle,
            settings,
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
            channel,
            control,
            protocol,
            on_did_terminate,
            termination: watch::channel(None).0,
            telemetry,
            _exit_watch: exit_watch,
        };

        if let Err(err) = supervisor.handshake().await {
            tracing::warn!(host = host_id, error = %err, "extension host handshake failed");
            supervisor.kill().await;
            supervisor.protocol.dispose();
            supervisor.channel.close();
            let _ = supervisor.handle.advance(HostState::Terminated);
            return Err(err);
        }
        Ok(supervisor)
    }

    async fn handshake(&self) -> Result<(), HostError> {
        let (tx, rx) = oneshot::channel::<Result<(u32, bool, Option<String>), HostError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let _ack = {
            let tx = tx.clone();
            self.control.on_message().subscribe(move |message| {
                if let ControlMessage::HandshakeAck {
                    protocol_version,
                    accepted,
                    reason,
                } = message
                {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(Ok((*protocol_version, *accepted, reason.clone())));
                    }
                }
            })
        };
        let _closed = {
            let tx = tx.clone();
            self.control.on_close().subscribe(move |_| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(HostError::new(
                        HostErrorCode::TransportIo,
                        "host exited before handshake",
                    )));
                }
            })
        };

        self.control
            .send(ControlMessage::Handshake {
                protocol_version: self.settings.protocol_version,
                supported_protocol_versions: self.settings.normalized_supported_protocol_versions(),
                host_id: self.handle.host_id().to_string(),
            })
            .map_err(|err| HostError::new(HostErrorCode::TransportIo, err.to_string()))?;

        let ack = tokio::time::timeout(self.settings.ready_timeout(), rx)
            .await
            .map_err(|_| {
                HostError::new(HostErrorCode::ReadyTimeout, "no handshake ack before timeout")
            })?
            .map_err(|_| HostError::new(HostErrorCode::TransportIo, "handshake listener dropped"))?;
        let (protocol_version, accepted, reason) = ack?;

        if !accepted {
            return Err(HostError::new(
                HostErrorCode::HandshakeRejected,
                reason.unwrap_or_else(|| "host rejected handshake".to_string()),
            ));
        }
        if self.settings.negotiate_protocol(protocol_version).is_none() {
            return Err(HostError::new(
                HostErrorCode::ProtocolMismatch,
                format!(
                    "host protocol {protocol_version} not in {:?}",
                    self.settings.normalized_supported_protocol_versions()
                ),
            ));
        }

        self.handle.advance(HostState::Running)?;
        tracing::info!(host = %self.handle.host_id(), protocol_version, "extension host running");
        Ok(())
    }

    pub fn host_id(&self) -> &str {
        self.handle.host_id()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> HostState {
        self.handle.state()
    }

    pub fn handle(&self) -> &Arc<HostHandle> {
        &self.handle
    }

    pub fn protocol(&self) -> &Arc<RpcProtocol> {
        &self.protocol
    }

    pub fn on_did_terminate(&self) -> &Emitter<TerminationOutcome> {
        &self.on_did_terminate
    }

    pub fn telemetry_snapshot(&self) -> SupervisorTelemetrySnapshot {
        SupervisorTelemetrySnapshot {
            graceful_terminations: self.telemetry.graceful_terminations.load(Ordering::Relaxed),
            forced_terminations: self.telemetry.forced_terminations.load(Ordering::Relaxed),
            unexpected_exits: self.telemetry.unexpected_exits.load(Ordering::Relaxed),
        }
    }

    /// Terminates with the configured deadline.
    pub async fn shutdown(&self) -> TerminationOutcome {
        self.terminate(self.settings.terminate_deadline()).await
    }

    /// Asks the host to stop and races its acknowledgement (or exit) against
    /// `deadline` plus the configured grace. `None` waits indefinitely. On
    /// expiry the process is killed. Always ends in Terminated.
    ///
    /// A call made while another is in progress waits for it and returns its
    /// outcome. Once Terminated, calls return `AlreadyTerminated`.
    pub async fn terminate(&self, deadline: Option<Duration>) -> TerminationOutcome {
        match self.handle.advance(HostState::Terminating) {
            Ok(true) => {}
            Ok(false) => return self.pending_termination().await,
            Err(_) => return TerminationOutcome::AlreadyTerminated,
        }
        let started_at = Instant::now();
        let deadline_ms = deadline.map(|d| d.as_millis() as u64);
        tracing::info!(host = %self.handle.host_id(), deadline_ms, "terminating extension host");

        let (ack_tx, ack_rx) = oneshot::channel::<()>();
        let ack_tx = Mutex::new(Some(ack_tx));
        let ack_listener = self.control.on_message().subscribe(move |message| {
            if matches!(message, ControlMessage::TerminateAck) {
                if let Some(tx) = ack_tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        if let Err(err) = self
            .control
            .send(ControlMessage::TerminateRequest { deadline_ms })
        {
            tracing::debug!(host = %self.handle.host_id(), error = %err, "terminate request not delivered");
        }

        let mut child = self.child.lock().await;
        let settled = {
            let race = async {
                tokio::select! {
                    _ = ack_rx => {}
                    _ = wait_for_exit(&mut child) => {}
                }
            };
            match deadline {
                Some(deadline) => {
                    tokio::time::timeout(deadline + self.settings.terminate_grace(), race)
                        .await
                        .is_ok()
                }
                None => {
                    race.await;
                    true
                }
            }
        };
        ack_listener.dispose();

        let outcome = if settled {
            // Give an acknowledging host a moment to exit on its own.
            if let Some(process) = child.as_mut() {
                if tokio::time::timeout(self.settings.terminate_grace(), process.wait())
                    .await
                    .is_err()
                {
                    let _ = process.start_kill();
                    let _ = process.wait().await;
                }
            }
            self.telemetry
                .graceful_terminations
                .fetch_add(1, Ordering::Relaxed);
            TerminationOutcome::Graceful
        } else {
            tracing::warn!(host = %self.handle.host_id(), deadline_ms, "extension host missed termination deadline; killing");
            if let Some(process) = child.as_mut() {
                let _ = process.start_kill();
                let _ = process.wait().await;
            }
            self.telemetry
                .forced_terminations
                .fetch_add(1, Ordering::Relaxed);
            TerminationOutcome::Forced
        };
        *child = None;
        drop(child);

        self.protocol.dispose();
        self.channel.close();
        let _ = self.handle.advance(HostState::Terminated);
        self.termination.send_replace(Some(outcome));
        tracing::info!(
            host = %self.handle.host_id(),
            outcome = ?outcome,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "extension host terminated"
        );
        self.on_did_terminate.fire(&outcome);
        outcome
    }

    async fn pending_termination(&self) -> TerminationOutcome {
        let mut termination = self.termination.subscribe();
        let outcome = match termination.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => None,
        };
        outcome.unwrap_or(TerminationOutcome::AlreadyTerminated)
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Some(process) = child.as_mut() {
            let _ = process.start_kill();
            let _ = process.wait().await;
        }
        *child = None;
    }
}

async fn wait_for_exit(child: &mut Option<Child>) {
    if let Some(process) = child.as_mut() {
        let _ = process.wait().await;
    }
}

fn watch_unexpected_exit(
    control: &ControlLane,
    handle: Arc<HostHandle>,
    protocol: Weak<RpcProtocol>,
    on_did_terminate: Arc<Emitter<TerminationOutcome>>,
    telemetry: Arc<SupervisorTelemetry>,
) -> Listener {
    control.on_close().subscribe(move |_| {
        if handle.state() != HostState::Running {
            return;
        }
        tracing::warn!(host = %handle.host_id(), "extension host exited unexpectedly");
        if let Some(protocol) = protocol.upgrade() {
            protocol.dispose();
        }
        if matches!(handle.advance(HostState::Terminated), Ok(true)) {
            telemetry.unexpected_exits.fetch_add(1, Ordering::Relaxed);
            on_did_terminate.fire(&TerminationOutcome::Exited);
        }
    })
}
