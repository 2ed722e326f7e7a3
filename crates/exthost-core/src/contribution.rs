use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TIMER_WARNING_THRESHOLD: Duration = Duration::from_millis(100);

/// A unit of host-side functionality with optional lifecycle hooks.
/// Every hook defaults to a no-op.
#[async_trait]
pub trait HostContribution: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn configure(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    Configure,
    Start,
    Stop,
}

impl Phase {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Configure => "configure",
            Self::Start => "on_start",
            Self::Stop => "on_stop",
        }
    }
}

/// Names of contributions whose hook failed during one phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub failed: Vec<String>,
}

/// Runs contributions in registration order. A failing hook is logged and
/// the remaining contributions still run.
pub struct ContributionRegistry {
    items: Mutex<Vec<Arc<dyn HostContribution>>>,
    warn_threshold: Duration,
}

impl Default for ContributionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContributionRegistry {
    pub fn new() -> Self {
        Self::with_warn_threshold(TIMER_WARNING_THRESHOLD)
    }

    pub fn with_warn_threshold(warn_threshold: Duration) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            warn_threshold,
        }
    }

    pub fn register(&self, contribution: Arc<dyn HostContribution>) {
        self.items.lock().push(contribution);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn HostContribution>> {
        self.items.lock().clone()
    }

    pub fn initialize_all(&self) -> PhaseReport {
        self.run_sync(Phase::Initialize, |c| c.initialize())
    }

    pub fn configure_all(&self) -> PhaseReport {
        self.run_sync(Phase::Configure, |c| c.configure())
    }

    /// Initialize, configure, then start every contribution.
    pub async fn start_all(&self) -> PhaseReport {
        let mut report = self.initialize_all();
        report.failed.extend(self.configure_all().failed);

        for contribution in self.snapshot() {
            let started_at = Instant::now();
            let outcome = contribution.on_start().await;
            self.finish(Phase::Start, contribution.name(), started_at, outcome, &mut report);
        }
        report
    }

    pub async fn stop_all(&self) -> PhaseReport {
        let mut report = PhaseReport::default();
        for contribution in self.snapshot() {
            let started_at = Instant::now();
            let outcome = contribution.on_stop().await;
            self.finish(Phase::Stop, contribution.name(), started_at, outcome, &mut report);
        }
        report
    }

    fn run_sync(
        &self,
        phase: Phase,
        hook: impl Fn(&dyn HostContribution) -> anyhow::Result<()>,
    ) -> PhaseReport {
        let mut report = PhaseReport::default();
        for contribution in self.snapshot() {
            let started_at = Instant::now();
            let outcome = hook(contribution.as_ref());
            self.finish(phase, contribution.name(), started_at, outcome, &mut report);
        }
        report
    }

    fn finish(
        &self,
        phase: Phase,
        name: &str,
        started_at: Instant,
        outcome: anyhow::Result<()>,
        report: &mut PhaseReport,
    ) {
        let elapsed = started_at.elapsed();
        if elapsed > self.warn_threshold {
            tracing::warn!(
                contribution = name,
                phase = phase.as_tag(),
                elapsed_ms = elapsed.as_millis() as u64,
                "contribution hook is slow"
            );
        }
        if let Err(err) = outcome {
            tracing::error!(
                contribution = name,
                phase = phase.as_tag(),
                error = %format!("{err:#}"),
                "contribution hook failed"
            );
            report.failed.push(name.to_string());
        }
    }
}
