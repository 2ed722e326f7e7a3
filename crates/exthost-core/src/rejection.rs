use crate::error::RpcError;
use crate::supervisor::HostHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RejectionTelemetrySnapshot {
    pub reported: u64,
    pub claimed: u64,
    pub logged: u64,
    pub suppressed: u64,
}

struct Pending {
    error: anyhow::Error,
    // Host state when the failure was reported.
    during_shutdown: bool,
}

/// Holds failures nobody has handled yet. After the grace window an
/// unclaimed failure is logged, except connection-closed errors reported
/// while the host was already shutting down.
pub struct RejectionTracker {
    grace: Duration,
    handle: Option<Arc<HostHandle>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    telemetry: Mutex<RejectionTelemetrySnapshot>,
}

impl RejectionTracker {
    pub fn new(grace: Duration, handle: Option<Arc<HostHandle>>) -> Arc<Self> {
        Arc::new(Self {
            grace,
            handle,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            telemetry: Mutex::new(RejectionTelemetrySnapshot::default()),
        })
    }

    /// Records an unhandled failure. Must be called within a Tokio runtime.
    pub fn report(self: &Arc<Self>, error: impl Into<anyhow::Error>) -> UnhandledRejection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let during_shutdown = self
            .handle
            .as_ref()
            .is_some_and(|handle| handle.is_terminating());
        self.pending.lock().insert(
            id,
            Pending {
                error: error.into(),
                during_shutdown,
            },
        );
        self.telemetry.lock().reported += 1;

        let tracker = Arc::downgrade(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(id);
            }
        });

        UnhandledRejection {
            id,
            tracker: Arc::downgrade(self),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn telemetry_snapshot(&self) -> RejectionTelemetrySnapshot {
        self.telemetry.lock().clone()
    }

    fn claim(&self, id: u64) -> Option<anyhow::Error> {
        let pending = self.pending.lock().remove(&id)?;
        self.telemetry.lock().claimed += 1;
        Some(pending.error)
    }

    fn expire(&self, id: u64) {
        let Some(Pending {
            error,
            during_shutdown,
        }) = self.pending.lock().remove(&id)
        else {
            return;
        };

        let connection_closed = error
            .downcast_ref::<RpcError>()
            .is_some_and(RpcError::is_connection_closed);
        if during_shutdown && connection_closed {
            self.telemetry.lock().suppressed += 1;
            tracing::trace!(id, "suppressed connection-closed rejection during shutdown");
            return;
        }

        self.telemetry.lock().logged += 1;
        let stack = error.downcast_ref::<RpcError>().and_then(RpcError::stack);
        tracing::error!(id, error = %format!("{error:#}"), stack, "unhandled rejection");
    }
}

/// Claim ticket for a reported failure.
#[derive(Debug)]
pub struct UnhandledRejection {
    id: u64,
    tracker: Weak<RejectionTracker>,
}

impl UnhandledRejection {
    /// Marks the failure handled. Returns it if the grace window has not passed yet.
    pub fn claim(self) -> Option<anyhow::Error> {
        self.tracker.upgrade()?.claim(self.id)
    }
}
