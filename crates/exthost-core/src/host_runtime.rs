//! Remote side of a supervised host: answers the owner's handshake, runs the
//! registered contributions, and tears down on a terminate request.

use crate::channel::Channel;
use crate::contribution::ContributionRegistry;
use crate::event::Listener;
use crate::fault::ProcessGuard;
use crate::process_transport::ControlLane;
use crate::protocol::{normalized_protocol_versions, select_protocol_version, ControlMessage};
use crate::rejection::{RejectionTracker, UnhandledRejection};
use crate::rpc::RpcProtocol;
use crate::settings::HostSettings;
use crate::supervisor::{HostHandle, HostState};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Inbound {
    Control(ControlMessage),
    Closed,
}

pub struct HostRuntime {
    settings: HostSettings,
    handle: Arc<HostHandle>,
    channel: Arc<dyn Channel>,
    control: Arc<ControlLane>,
    protocol: Arc<RpcProtocol>,
    contributions: Arc<ContributionRegistry>,
    rejections: Arc<RejectionTracker>,
    guard: Arc<ProcessGuard>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    startup: Mutex<Option<JoinHandle<()>>>,
    _listeners: Vec<Listener>,
}

impl HostRuntime {
    /// Subscribes to `control` immediately, so messages that arrive before
    /// [`HostRuntime::serve`] is polled are queued rather than lost.
    pub fn new(
        host_id: &str,
        channel: Arc<dyn Channel>,
        control: Arc<ControlLane>,
        settings: HostSettings,
    ) -> Self {
        let handle = Arc::new(HostHandle::new(host_id));
        let protocol = RpcProtocol::with_gate(channel.clone(), handle.clone());
        let rejections = RejectionTracker::new(settings.rejections.grace(), Some(handle.clone()));

        let (tx, rx) = mpsc::unbounded_channel();
        let on_message = {
            let tx = tx.clone();
            control.on_message().subscribe(move |message| {
                let _ = tx.send(Inbound::Control(message.clone()));
            })
        };
        let on_close = control.on_close().subscribe(move |_| {
            let _ = tx.send(Inbound::Closed);
        });

        Self {
            settings,
            handle,
            channel,
            control,
            protocol,
            contributions: Arc::new(ContributionRegistry::new()),
            rejections,
            guard: Arc::new(ProcessGuard::new()),
            inbound: Mutex::new(Some(rx)),
            startup: Mutex::new(None),
            _listeners: vec![on_message, on_close],
        }
    }

    pub fn handle(&self) -> &Arc<HostHandle> {
        &self.handle
    }

    pub fn protocol(&self) -> &Arc<RpcProtocol> {
        &self.protocol
    }

    pub fn contributions(&self) -> &Arc<ContributionRegistry> {
        &self.contributions
    }

    pub fn rejections(&self) -> &Arc<RejectionTracker> {
        &self.rejections
    }

    pub fn process_guard(&self) -> &Arc<ProcessGuard> {
        &self.guard
    }

    /// Runs `work` in the background. A failure nobody claims within the
    /// rejection grace window is logged.
    pub fn spawn_detached<F>(&self, work: F) -> JoinHandle<Option<UnhandledRejection>>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let rejections = self.rejections.clone();
        tokio::spawn(async move {
            match work.await {
                Ok(()) => None,
                Err(err) => Some(rejections.report(err)),
            }
        })
    }

    /// Processes control messages until the host is Terminated. Can only be run once.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let Some(mut inbound) = self.inbound.lock().take() else {
            anyhow::bail!("host runtime is already serving");
        };

        while let Some(next) = inbound.recv().await {
            match next {
                Inbound::Control(ControlMessage::Handshake {
                    protocol_version,
                    supported_protocol_versions,
                    host_id,
                }) => {
                    self.on_handshake(protocol_version, &supported_protocol_versions, &host_id)
                        .await?
                }
                Inbound::Control(ControlMessage::TerminateRequest { deadline_ms }) => {
                    self.on_terminate_request(deadline_ms.map(Duration::from_millis))
                        .await
                }
                Inbound::Control(other) => {
                    tracing::warn!(host = %self.handle.host_id(), message = ?other, "unexpected control message")
                }
                Inbound::Closed => self.on_owner_gone().await,
            }
            if self.handle.state() == HostState::Terminated {
                break;
            }
        }
        Ok(())
    }

    async fn on_handshake(
        &self,
        requested: u32,
        offered: &[u32],
        owner_host_id: &str,
    ) -> anyhow::Result<()> {
        if self.handle.state() != HostState::Starting {
            tracing::warn!(host = %self.handle.host_id(), "duplicate handshake ignored");
            return Ok(());
        }

        let supervisor = &self.settings.supervisor;
        let local = normalized_protocol_versions(
            supervisor.protocol_version,
            &supervisor.supported_protocol_versions,
        );
        let Some(protocol_version) = select_protocol_version(requested, offered, &local) else {
            tracing::warn!(
                host = %self.handle.host_id(),
                requested,
                offered = ?offered,
                local = ?local,
                "no common protocol version"
            );
            self.control.send(ControlMessage::HandshakeAck {
                protocol_version: requested,
                accepted: false,
                reason: Some(format!("unsupported protocol version {requested}")),
            })?;
            return Ok(());
        };

        self.control.send(ControlMessage::HandshakeAck {
            protocol_version,
            accepted: true,
            reason: None,
        })?;
        self.handle.advance(HostState::Running)?;
        tracing::info!(
            host = %self.handle.host_id(),
            owner_host_id,
            protocol_version,
            "host runtime running"
        );

        // Started off the control loop so a terminate request can preempt it.
        let contributions = self.contributions.clone();
        let host_id = self.handle.host_id().to_string();
        *self.startup.lock() = Some(tokio::spawn(async move {
            let report = contributions.start_all().await;
            if !report.failed.is_empty() {
                tracing::warn!(host = %host_id, failed = ?report.failed, "some contributions failed to start");
            }
        }));
        Ok(())
    }

    fn abort_startup(&self) {
        if let Some(startup) = self.startup.lock().take() {
            if !startup.is_finished() {
                tracing::warn!(host = %self.handle.host_id(), "contribution start-up still running; aborted");
                startup.abort();
            }
        }
    }

    async fn on_terminate_request(&self, deadline: Option<Duration>) {
        match self.handle.advance(HostState::Terminating) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                tracing::debug!(host = %self.handle.host_id(), "terminate request ignored; already terminating");
                return;
            }
        }
        let started_at = Instant::now();
        let deadline_ms = deadline.map(|d| d.as_millis() as u64);
        tracing::info!(host = %self.handle.host_id(), deadline_ms, "terminate requested");
        self.abort_startup();

        let graceful = match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.contributions.stop_all() => true,
                    _ = tokio::time::sleep(deadline) => false,
                }
            }
            None => {
                self.contributions.stop_all().await;
                true
            }
        };
        if !graceful {
            tracing::warn!(host = %self.handle.host_id(), deadline_ms, "contributions did not stop before the deadline");
        }

        self.protocol.dispose();
        if let Err(err) = self.control.send(ControlMessage::TerminateAck) {
            tracing::debug!(host = %self.handle.host_id(), error = %err, "terminate ack not delivered");
        } else if let Err(err) = self.control.flush().await {
            tracing::debug!(host = %self.handle.host_id(), error = %err, "terminate ack not flushed");
        }
        let _ = self.handle.advance(HostState::Terminated);
        tracing::info!(
            host = %self.handle.host_id(),
            graceful,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "host runtime terminated"
        );
    }

    async fn on_owner_gone(&self) {
        if self.handle.advance(HostState::Terminating).unwrap_or(false) {
            tracing::warn!(host = %self.handle.host_id(), "owner pipe closed; stopping");
            self.abort_startup();
            let deadline = self
                .settings
                .supervisor
                .terminate_deadline()
                .unwrap_or(Duration::from_secs(5));
            let _ = tokio::time::timeout(deadline, self.contributions.stop_all()).await;
        }
        self.protocol.dispose();
        self.channel.close();
        let _ = self.handle.advance(HostState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contribution::HostContribution;
    use crate::error::RpcError;
    use crate::event::wait_for_event;
    use crate::process_transport::{spawn_pipe, PipeChannel};
    use crate::protocol::PROTOCOL_VERSION;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Owner {
        _rpc: Arc<PipeChannel>,
        control: Arc<ControlLane>,
    }

    fn connected_runtime() -> (Arc<HostRuntime>, Owner) {
        let (owner_io, host_io) = tokio::io::duplex(64 * 1024);
        let (owner_read, owner_write) = tokio::io::split(owner_io);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (owner_rpc, owner_control) = spawn_pipe(owner_read, owner_write);
        let (host_rpc, host_control) = spawn_pipe(host_read, host_write);
        let runtime = Arc::new(HostRuntime::new(
            "test-host",
            host_rpc,
            host_control,
            HostSettings::default(),
        ));
        (
            runtime,
            Owner {
                _rpc: owner_rpc,
                control: owner_control,
            },
        )
    }

    async fn handshake(owner: &Owner, version: u32) -> ControlMessage {
        let ack = {
            let control = owner.control.clone();
            tokio::spawn(async move {
                wait_for_event(
                    control.on_message(),
                    |m: &ControlMessage| matches!(m, ControlMessage::HandshakeAck { .. }),
                    Some(Duration::from_secs(5)),
                )
                .await
            })
        };
        while owner.control.on_message().listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        owner
            .control
            .send(ControlMessage::Handshake {
                protocol_version: version,
                supported_protocol_versions: vec![version],
                host_id: "test-host".to_string(),
            })
            .expect("send handshake");
        ack.await.expect("join ack").expect("handshake ack")
    }

    struct Counting {
        started: Arc<AtomicUsize>,
        stop_delay: Duration,
    }

    #[async_trait]
    impl HostContribution for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_start(&self) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stop(&self) -> anyhow::Result<()> {
            tokio::time::sleep(self.stop_delay).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn handshake_starts_contributions_and_terminate_acks() {
        let (runtime, owner) = connected_runtime();
        let started = Arc::new(AtomicUsize::new(0));
        runtime.contributions().register(Arc::new(Counting {
            started: started.clone(),
            stop_delay: Duration::from_millis(1),
        }));
        let serving = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve().await })
        };

        let ack = handshake(&owner, PROTOCOL_VERSION).await;
        assert_eq!(
            ack,
            ControlMessage::HandshakeAck {
                protocol_version: PROTOCOL_VERSION,
                accepted: true,
                reason: None,
            }
        );
        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.handle().state(), HostState::Running);

        let terminated = {
            let control = owner.control.clone();
            tokio::spawn(async move {
                wait_for_event(
                    control.on_message(),
                    |m: &ControlMessage| matches!(m, ControlMessage::TerminateAck),
                    Some(Duration::from_secs(5)),
                )
                .await
            })
        };
        while owner.control.on_message().listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        owner
            .control
            .send(ControlMessage::TerminateRequest {
                deadline_ms: Some(1_000),
            })
            .expect("send terminate");

        assert_eq!(
            terminated.await.expect("join"),
            Some(ControlMessage::TerminateAck)
        );
        serving.await.expect("join serve").expect("serve");
        assert_eq!(runtime.handle().state(), HostState::Terminated);
        assert!(runtime.protocol().is_disposed());
    }

    #[tokio::test]
    async fn slow_stop_is_cut_off_at_the_deadline() {
        let (runtime, owner) = connected_runtime();
        runtime.contributions().register(Arc::new(Counting {
            started: Arc::new(AtomicUsize::new(0)),
            stop_delay: Duration::from_secs(60),
        }));
        let serving = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve().await })
        };
        handshake(&owner, PROTOCOL_VERSION).await;

        let started_at = Instant::now();
        owner
            .control
            .send(ControlMessage::TerminateRequest {
                deadline_ms: Some(50),
            })
            .expect("send terminate");
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("serve finished before the test timeout")
            .expect("join")
            .expect("serve");
        assert!(started_at.elapsed() < Duration::from_secs(5));
        assert_eq!(runtime.handle().state(), HostState::Terminated);
    }

    struct NeverStarts;

    #[async_trait]
    impl HostContribution for NeverStarts {
        fn name(&self) -> &str {
            "never-starts"
        }

        async fn on_start(&self) -> anyhow::Result<()> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn terminate_preempts_a_hung_start() {
        let (runtime, owner) = connected_runtime();
        runtime.contributions().register(Arc::new(NeverStarts));
        let serving = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve().await })
        };
        handshake(&owner, PROTOCOL_VERSION).await;

        let terminated = {
            let control = owner.control.clone();
            tokio::spawn(async move {
                wait_for_event(
                    control.on_message(),
                    |m: &ControlMessage| matches!(m, ControlMessage::TerminateAck),
                    Some(Duration::from_secs(3)),
                )
                .await
            })
        };
        while owner.control.on_message().listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        owner
            .control
            .send(ControlMessage::TerminateRequest {
                deadline_ms: Some(100),
            })
            .expect("send terminate");

        assert_eq!(
            terminated.await.expect("join"),
            Some(ControlMessage::TerminateAck)
        );
        serving.await.expect("join serve").expect("serve");
        assert_eq!(runtime.handle().state(), HostState::Terminated);
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected() {
        let (runtime, owner) = connected_runtime();
        let _serving = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve().await })
        };

        let ack = handshake(&owner, PROTOCOL_VERSION + 41).await;
        let ControlMessage::HandshakeAck { accepted, reason, .. } = ack else {
            panic!("expected handshake ack, got {ack:?}");
        };
        assert!(!accepted);
        assert!(reason.unwrap_or_default().contains("unsupported"));
        assert_eq!(runtime.handle().state(), HostState::Starting);
    }

    #[tokio::test]
    async fn detached_failures_are_reported() {
        let (runtime, _owner) = connected_runtime();
        let ticket = runtime
            .spawn_detached(async { Err(RpcError::remote("background work failed").into()) })
            .await
            .expect("join")
            .expect("failure reported");
        assert_eq!(runtime.rejections().pending_count(), 1);
        assert!(ticket.claim().is_some());
        assert_eq!(runtime.rejections().telemetry_snapshot().claimed, 1);
    }
}
