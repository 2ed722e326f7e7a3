use anyhow::{Context as _, Result};
use async_trait::async_trait;
use exthost_core::contribution::HostContribution;
use exthost_core::error::RpcError;
use exthost_core::fault::{install_panic_hook, CapabilityToken, ProcessGuard};
use exthost_core::host_runtime::HostRuntime;
use exthost_core::logging::init_logging;
use exthost_core::manager::{BootstrapData, PluginManager, PluginManagerTarget, PLUGIN_MANAGER};
use exthost_core::process_transport::spawn_pipe;
use exthost_core::settings::HostSettings;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const HOST_ID_ENV: &str = "EXTHOST_HOST_ID";
const DELAY_ENV: &str = "EXTHOST_WORKER_DELAY_MS";
const FAIL_EVENTS_ENV: &str = "EXTHOST_WORKER_FAIL_EVENTS";
const STOP_DELAY_ENV: &str = "EXTHOST_WORKER_STOP_DELAY_MS";
const BLOCK_ON_STOP_ENV: &str = "EXTHOST_WORKER_BLOCK_ON_STOP_MS";
const PROTOCOL_VERSION_ENV: &str = "EXTHOST_WORKER_PROTOCOL_VERSION";

// Activating this event makes the plugin try to exit the whole host before
// it is itself registered as loaded.
const EXIT_EVENT: &str = "onCommand:exthost.exit";

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Clone, Debug, Default)]
struct Knobs {
    activation_delay: Duration,
    failing_events: Vec<String>,
    stop_delay: Duration,
    block_on_stop: Duration,
    protocol_version: Option<u32>,
}

impl Knobs {
    fn from_env() -> Self {
        Self {
            activation_delay: Duration::from_millis(env_u64(DELAY_ENV).unwrap_or(0)),
            failing_events: env_list(FAIL_EVENTS_ENV),
            stop_delay: Duration::from_millis(env_u64(STOP_DELAY_ENV).unwrap_or(0)),
            block_on_stop: Duration::from_millis(env_u64(BLOCK_ON_STOP_ENV).unwrap_or(0)),
            protocol_version: env_u64(PROTOCOL_VERSION_ENV).and_then(|v| u32::try_from(v).ok()),
        }
    }
}

struct WorkerPluginManager {
    knobs: Knobs,
    guard: Arc<ProcessGuard>,
    storage_path: Mutex<Option<String>>,
    activated: Mutex<Vec<(String, CapabilityToken)>>,
}

impl WorkerPluginManager {
    fn new(knobs: Knobs, guard: Arc<ProcessGuard>) -> Self {
        Self {
            knobs,
            guard,
            storage_path: Mutex::new(None),
            activated: Mutex::new(Vec::new()),
        }
    }

    fn deactivate_all(&self) -> usize {
        let deactivated = std::mem::take(&mut *self.activated.lock());
        deactivated.len()
    }
}

#[async_trait]
impl PluginManager for WorkerPluginManager {
    async fn init(&self, data: BootstrapData) -> Result<bool, RpcError> {
        tracing::info!(
            host = %data.host_id,
            events = data.supported_activation_events.len(),
            storage_path = data.storage_path.as_deref(),
            "plugin manager initialized"
        );
        *self.storage_path.lock() = data.storage_path;
        Ok(true)
    }

    async fn activate_by_event(&self, event: &str) -> Result<(), RpcError> {
        if !self.knobs.activation_delay.is_zero() {
            tokio::time::sleep(self.knobs.activation_delay).await;
        }
        if self.knobs.failing_events.iter().any(|failing| failing == event) {
            return Err(RpcError::remote(format!("activation of {event} failed")));
        }
        if event == EXIT_EVENT {
            self.guard.exit(0);
        }
        let token = self.guard.capability_loaded(event);
        let total = {
            let mut activated = self.activated.lock();
            activated.push((event.to_string(), token));
            activated.len()
        };
        tracing::info!(event, total, "activated");
        Ok(())
    }

    async fn update_storage_path(&self, path: Option<String>) -> Result<(), RpcError> {
        tracing::debug!(storage_path = path.as_deref(), "storage path updated");
        let previous = std::mem::replace(&mut *self.storage_path.lock(), path);
        tracing::trace!(previous = previous.as_deref(), "previous storage path");
        Ok(())
    }
}

/// Stands in for plugin deactivation during shutdown.
struct PluginDeactivation {
    knobs: Knobs,
    manager: Arc<WorkerPluginManager>,
}

#[async_trait]
impl HostContribution for PluginDeactivation {
    fn name(&self) -> &str {
        "plugin-deactivation"
    }

    async fn on_stop(&self) -> Result<()> {
        if !self.knobs.block_on_stop.is_zero() {
            // Stalls the runtime thread, so no ack can be sent.
            std::thread::sleep(self.knobs.block_on_stop);
        }
        if !self.knobs.stop_delay.is_zero() {
            tokio::time::sleep(self.knobs.stop_delay).await;
        }
        let deactivated = self.manager.deactivate_all();
        tracing::info!(deactivated, "plugins deactivated");
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let knobs = Knobs::from_env();
    let mut settings = HostSettings::default();
    settings.apply_env();
    if let Some(version) = knobs.protocol_version {
        settings.supervisor.protocol_version = version;
        settings.supervisor.supported_protocol_versions = vec![version];
    }

    init_logging(&settings.logging).context("init logging")?;
    install_panic_hook();

    let host_id = std::env::var(HOST_ID_ENV).unwrap_or_else(|_| "exthost".to_string());
    let (channel, control) = spawn_pipe(tokio::io::stdin(), tokio::io::stdout());
    let runtime = HostRuntime::new(&host_id, channel, control, settings);

    let manager = Arc::new(WorkerPluginManager::new(
        knobs.clone(),
        runtime.process_guard().clone(),
    ));
    runtime.protocol().set_local(
        PLUGIN_MANAGER,
        Arc::new(PluginManagerTarget::new(manager.clone())),
    );
    runtime
        .contributions()
        .register(Arc::new(PluginDeactivation { knobs, manager }));

    tracing::info!(host = %host_id, pid = std::process::id(), "worker started");
    runtime.serve().await.context("serve host runtime")?;
    tracing::info!(host = %host_id, "worker exiting");

    // The stdin reader blocks in a runtime thread and would hold the process open.
    std::process::exit(0)
}
