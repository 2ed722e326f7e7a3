//! Activation events: each (host, event) pair activates at most once.
//!
//! Concurrent triggers of the same pair share one in-flight attempt. A
//! successful attempt is remembered. A failed one disables the pair, unless
//! `max_failed_activations` allows further attempts.

use crate::command::CommandRegistry;
use crate::error::{ActivationError, RpcError};
use crate::event::{wait_for_event, Decided, Listener, WaitUntilEvent};
use crate::manager::{
    supported_activation_events, BootstrapData, PluginManager, PluginManagerProxy, PLUGIN_MANAGER,
};
use crate::paths::is_glob_pattern;
use crate::rpc::RpcProtocol;
use crate::settings::ActivationSettings;
use crate::workspace::{FileSearch, FileSystemProviders, Workspace};
use futures::future::{join_all, ready, select, BoxFuture, Either, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const ALL_ACTIVATION_EVENT: &str = "*";
pub const WORKSPACE_CONTAINS_PREFIX: &str = "workspaceContains:";
pub const RUN_TASK_COMMAND: &str = "workbench.action.tasks.runTask";

pub type Activation = BoxFuture<'static, Result<(), ActivationError>>;
type SharedActivation = Shared<Activation>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    Unfired,
    Firing,
    Fired,
    Disabled,
}

enum EventSlot {
    Firing {
        attempt: u64,
        activation: SharedActivation,
    },
    Fired,
    Disabled,
}

struct HostRecord {
    generation: u64,
    manager: Arc<dyn PluginManager>,
    events: HashMap<String, EventSlot>,
    failures: HashMap<String, u32>,
}

/// What a plugin declares about when it wants to run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: String,
    pub activation_events: Vec<String>,
}

pub struct ActivationCoordinator {
    settings: ActivationSettings,
    workspace: Arc<dyn Workspace>,
    file_search: Arc<dyn FileSearch>,
    hosts: Mutex<HashMap<String, HostRecord>>,
    // Events fired for every host, replayed onto hosts that join later.
    global_events: Mutex<Vec<String>>,
    storage_path: Mutex<Option<String>>,
    next_id: AtomicU64,
}

fn settled(result: Result<(), ActivationError>) -> SharedActivation {
    ready(result).boxed().shared()
}

fn wait_all(pending: Vec<SharedActivation>) -> Activation {
    async move {
        for result in join_all(pending).await {
            result?;
        }
        Ok(())
    }
    .boxed()
}

impl ActivationCoordinator {
    pub fn new(
        settings: ActivationSettings,
        workspace: Arc<dyn Workspace>,
        file_search: Arc<dyn FileSearch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            workspace,
            file_search,
            hosts: Mutex::new(HashMap::new()),
            global_events: Mutex::new(Vec::new()),
            storage_path: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn settings(&self) -> &ActivationSettings {
        &self.settings
    }

    /// Connects the plugin manager served on `protocol` under `key`.
    pub async fn add_host(
        self: &Arc<Self>,
        key: &str,
        protocol: &Arc<RpcProtocol>,
        bootstrap: BootstrapData,
    ) -> Result<(), ActivationError> {
        let manager: Arc<PluginManagerProxy> = protocol.get_proxy(PLUGIN_MANAGER);
        self.add_host_manager(key, manager, bootstrap).await
    }

    /// Initializes `manager`, registers it under `key`, and replays every
    /// event already fired for all hosts. An empty event list in `bootstrap`
    /// is filled with the built-in events plus the configured additional ones.
    pub async fn add_host_manager(
        self: &Arc<Self>,
        key: &str,
        manager: Arc<dyn PluginManager>,
        mut bootstrap: BootstrapData,
    ) -> Result<(), ActivationError> {
        if bootstrap.supported_activation_events.is_empty() {
            bootstrap.supported_activation_events =
                supported_activation_events(&self.settings.additional_activation_events);
        }
        if bootstrap.storage_path.is_none() {
            bootstrap.storage_path = self.storage_path.lock().clone();
        }
        let accepted = manager.init(bootstrap).await.map_err(|err| ActivationError::Init {
            host: key.to_string(),
            message: err.to_string(),
        })?;
        if !accepted {
            return Err(ActivationError::Init {
                host: key.to_string(),
                message: "host declined initialization".to_string(),
            });
        }

        let generation = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .hosts
            .lock()
            .insert(
                key.to_string(),
                HostRecord {
                    generation,
                    manager,
                    events: HashMap::new(),
                    failures: HashMap::new(),
                },
            )
            .is_some();
        if replaced {
            tracing::warn!(host = key, "replaced existing plugin host");
        }

        let replay = self.global_events.lock().clone();
        tracing::info!(host = key, replayed = replay.len(), "plugin host added");
        for event in replay {
            drop(self.activate_by_event_on(key, &event));
        }
        Ok(())
    }

    /// Forgets `key`. Attempts still running settle for their waiters but are not recorded.
    pub fn remove_host(&self, key: &str) -> bool {
        let removed = self.hosts.lock().remove(key).is_some();
        if removed {
            tracing::info!(host = key, "plugin host removed");
        }
        removed
    }

    pub fn host_keys(&self) -> Vec<String> {
        let mut keys = self.hosts.lock().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn event_state(&self, host: &str, event: &str) -> EventState {
        match self.hosts.lock().get(host).and_then(|r| r.events.get(event)) {
            None => EventState::Unfired,
            Some(EventSlot::Firing { .. }) => EventState::Firing,
            Some(EventSlot::Fired) => EventState::Fired,
            Some(EventSlot::Disabled) => EventState::Disabled,
        }
    }

    pub fn is_fired(&self, host: &str, event: &str) -> bool {
        self.event_state(host, event) == EventState::Fired
    }

    /// Activates `event` on one host. The attempt starts immediately, whether
    /// or not the returned future is polled. Must be called within a Tokio runtime.
    pub fn activate_by_event_on(self: &Arc<Self>, host: &str, event: &str) -> SharedActivation {
        let mut hosts = self.hosts.lock();
        let Some(record) = hosts.get_mut(host) else {
            return settled(Err(ActivationError::HostGone {
                host: host.to_string(),
            }));
        };
        match record.events.get(event) {
            Some(EventSlot::Fired) => return settled(Ok(())),
            Some(EventSlot::Disabled) => {
                return settled(Err(ActivationError::Disabled {
                    event: event.to_string(),
                }))
            }
            Some(EventSlot::Firing { activation, .. }) => return activation.clone(),
            None => {}
        }

        let attempt = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let activation = async move { rx.await.unwrap_or(Err(ActivationError::Aborted)) }
            .boxed()
            .shared();
        record.events.insert(
            event.to_string(),
            EventSlot::Firing {
                attempt,
                activation: activation.clone(),
            },
        );
        let manager = record.manager.clone();
        let generation = record.generation;
        drop(hosts);

        tracing::debug!(host, event, "activating");
        let coordinator = Arc::downgrade(self);
        let host = host.to_string();
        let event = event.to_string();
        tokio::spawn(async move {
            let outcome = manager
                .activate_by_event(&event)
                .await
                .map_err(|err| match err {
                    RpcError::ConnectionClosed => ActivationError::HostGone { host: host.clone() },
                    other => ActivationError::Remote {
                        host: host.clone(),
                        event: event.clone(),
                        message: other.to_string(),
                    },
                });
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.settle(&host, generation, attempt, &event, &outcome);
            }
            let _ = tx.send(outcome);
        });
        activation
    }

    fn settle(
        &self,
        host: &str,
        generation: u64,
        attempt: u64,
        event: &str,
        outcome: &Result<(), ActivationError>,
    ) {
        let mut hosts = self.hosts.lock();
        let Some(record) = hosts.get_mut(host) else {
            return;
        };
        let current = matches!(
            record.events.get(event),
            Some(EventSlot::Firing { attempt: a, .. }) if *a == attempt
        );
        if record.generation != generation || !current {
            return;
        }

        match outcome {
            Ok(()) => {
                record.events.insert(event.to_string(), EventSlot::Fired);
                record.failures.remove(event);
                tracing::debug!(host, event, "activated");
            }
            Err(err) => {
                let failures = if matches!(err, ActivationError::HostGone { .. }) {
                    0
                } else {
                    let failures = record.failures.entry(event.to_string()).or_insert(0);
                    *failures += 1;
                    *failures
                };
                if failures >= self.settings.normalized_max_failed_activations() {
                    record.events.insert(event.to_string(), EventSlot::Disabled);
                    tracing::error!(host, event, failures, error = %err, "activation disabled after repeated failures");
                } else {
                    record.events.remove(event);
                    tracing::warn!(host, event, failures, error = %err, "activation failed");
                }
            }
        }
    }

    /// Activates `event` on every host, now and on hosts added later.
    pub fn activate_by_event(self: &Arc<Self>, event: &str) -> Activation {
        {
            let mut global = self.global_events.lock();
            if !global.iter().any(|existing| existing == event) {
                global.push(event.to_string());
            }
        }
        let pending = self
            .host_keys()
            .iter()
            .map(|host| self.activate_by_event_on(host, event))
            .collect::<Vec<_>>();
        wait_all(pending)
    }

    fn activate_all<I>(self: &Arc<Self>, events: I) -> Activation
    where
        I: IntoIterator<Item = String>,
    {
        let pending = events
            .into_iter()
            .map(|event| self.activate_by_event(&event).shared())
            .collect::<Vec<_>>();
        wait_all(pending)
    }

    pub fn activate_by_language(self: &Arc<Self>, language_id: &str) -> Activation {
        self.activate_all([
            "onLanguage".to_string(),
            format!("onLanguage:{language_id}"),
        ])
    }

    pub fn activate_by_command(self: &Arc<Self>, command_id: &str) -> Activation {
        self.activate_by_event(&format!("onCommand:{command_id}"))
    }

    pub fn activate_by_view(self: &Arc<Self>, view_id: &str) -> Activation {
        self.activate_by_event(&format!("onView:{view_id}"))
    }

    /// Activates every view of a container.
    pub fn activate_by_view_container(self: &Arc<Self>, view_ids: &[String]) -> Activation {
        self.activate_all(view_ids.iter().map(|id| format!("onView:{id}")))
    }

    pub fn activate_by_uri(self: &Arc<Self>, scheme: &str, authority: &str) -> Activation {
        self.activate_by_event(&format!("onUri:{scheme}://{authority}"))
    }

    pub fn activate_by_task_type(self: &Arc<Self>, task_type: &str) -> Activation {
        self.activate_by_event(&format!("onTaskType:{task_type}"))
    }

    pub fn activate_by_custom_editor(self: &Arc<Self>, view_type: &str) -> Activation {
        self.activate_by_event(&format!("onCustomEditor:{view_type}"))
    }

    pub fn activate_by_notebook(self: &Arc<Self>, view_type: &str) -> Activation {
        self.activate_by_event(&format!("onNotebook:{view_type}"))
    }

    pub fn activate_by_notebook_serializer(self: &Arc<Self>, view_type: &str) -> Activation {
        self.activate_by_event(&format!("onNotebookSerializer:{view_type}"))
    }

    pub fn activate_by_notebook_renderer(self: &Arc<Self>, renderer_id: &str) -> Activation {
        self.activate_by_event(&format!("onRenderer:{renderer_id}"))
    }

    pub fn activate_by_file_system(self: &Arc<Self>, scheme: &str) -> Activation {
        self.activate_by_event(&format!("onFileSystem:{scheme}"))
    }

    pub fn activate_by_terminal_profile(self: &Arc<Self>, profile_id: &str) -> Activation {
        self.activate_by_event(&format!("onTerminalProfile:{profile_id}"))
    }

    pub fn activate_by_webview_panel(self: &Arc<Self>, view_type: &str) -> Activation {
        self.activate_by_event(&format!("onWebviewPanel:{view_type}"))
    }

    /// `onDebug`, plus `activation_event` and `activation_event:debug_type` when given.
    pub fn activate_by_debug(
        self: &Arc<Self>,
        activation_event: Option<&str>,
        debug_type: Option<&str>,
    ) -> Activation {
        let mut events = vec!["onDebug".to_string()];
        if let Some(activation_event) = activation_event {
            events.push(activation_event.to_string());
            if let Some(debug_type) = debug_type {
                events.push(format!("{activation_event}:{debug_type}"));
            }
        }
        self.activate_all(events)
    }

    /// Holds `event` until the command's plugin is active and its handler is
    /// bound, or until activation fails.
    pub fn ensure_command_handler_registration(
        self: &Arc<Self>,
        registry: &Arc<CommandRegistry>,
        event: &WaitUntilEvent<String>,
    ) {
        let command = event.payload.clone();
        let activation = self.activate_by_command(&command);
        if registry.is_known(&command)
            && (!registry.is_plugin_contributed(&command) || registry.has_handler(&command))
        {
            return;
        }

        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let listener = {
            let tx = tx.clone();
            let command = command.clone();
            registry.on_did_register_handler().subscribe(move |id| {
                if *id == command {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(());
                    }
                }
            })
        };
        // A handler may have been bound between the check above and subscribing.
        if registry.has_handler(&command) {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        }

        let handler_timeout = self.settings.provider_registration_timeout();
        event.wait_until(async move {
            let outcome = match select(rx, activation).await {
                Either::Left(_) => Ok(()),
                Either::Right((Err(err), _)) => Err(err),
                Either::Right((Ok(()), registered)) => {
                    if tokio::time::timeout(handler_timeout, registered).await.is_err() {
                        tracing::warn!(command = %command, "plugin activated without binding a command handler");
                    }
                    Ok(())
                }
            };
            listener.dispose();
            outcome.map_err(anyhow::Error::from)
        });
    }

    pub fn ensure_debug_activation<T>(
        self: &Arc<Self>,
        event: &WaitUntilEvent<T>,
        activation_event: Option<&str>,
        debug_type: Option<&str>,
    ) {
        let activation = self.activate_by_debug(activation_event, debug_type);
        event.wait_until(async move { activation.await.map_err(anyhow::Error::from) });
    }

    /// `task_type` of `*` activates every type in `all_task_types`.
    pub fn ensure_task_activation<T>(
        self: &Arc<Self>,
        event: &WaitUntilEvent<T>,
        task_type: Option<&str>,
        all_task_types: &[String],
    ) {
        let mut pending = vec![self.activate_by_command(RUN_TASK_COMMAND).shared()];
        match task_type {
            Some(ALL_ACTIVATION_EVENT) => pending.extend(
                all_task_types
                    .iter()
                    .map(|task_type| self.activate_by_task_type(task_type).shared()),
            ),
            Some(task_type) => pending.push(self.activate_by_task_type(task_type).shared()),
            None => {}
        }
        let all = wait_all(pending);
        event.wait_until(async move { all.await.map_err(anyhow::Error::from) });
    }

    /// Holds `event` (carrying a URI scheme) until a provider for the scheme
    /// registers, bounded by the provider registration timeout.
    pub fn ensure_file_system_activation(
        self: &Arc<Self>,
        event: &WaitUntilEvent<String>,
        providers: &Arc<FileSystemProviders>,
    ) {
        let scheme = event.payload.clone();
        let activation = self.activate_by_file_system(&scheme);
        let providers = providers.clone();
        let timeout = self.settings.provider_registration_timeout();
        event.wait_until(async move {
            activation.await?;
            if providers.has_provider(&scheme) {
                return Ok(());
            }
            let wanted = scheme.clone();
            let change = wait_for_event(
                providers.on_did_change(),
                move |change| change.added && change.scheme == wanted,
                Some(timeout),
            )
            .await;
            if change.is_none() {
                tracing::warn!(scheme = %scheme, "no file system provider registered in time");
            }
            Ok(())
        });
    }

    /// Routes command dispatch through [`Self::ensure_command_handler_registration`].
    pub fn bind_command_registry(self: &Arc<Self>, registry: &Arc<CommandRegistry>) -> Listener {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let weak_registry = Arc::downgrade(registry);
        registry.on_will_execute(move |event| {
            if let (Some(coordinator), Some(registry)) =
                (coordinator.upgrade(), weak_registry.upgrade())
            {
                coordinator.ensure_command_handler_registration(&registry, event);
            }
        })
    }

    /// Activates `plugin` on `host` when the workspace holds one of its
    /// `workspaceContains:` entries. The search is bounded by the workspace
    /// search timeout; when that passes, the plugin is activated anyway.
    /// Resolves to whether an activation was started.
    pub fn activate_by_workspace_contains(
        self: &Arc<Self>,
        host: &str,
        plugin: &PluginDescriptor,
    ) -> BoxFuture<'static, Result<bool, ActivationError>> {
        let mut paths = Vec::new();
        let mut include_patterns = Vec::new();
        for event in &plugin.activation_events {
            let Some(target) = event.strip_prefix(WORKSPACE_CONTAINS_PREFIX) else {
                continue;
            };
            if is_glob_pattern(target) {
                include_patterns.push(target.to_string());
            } else {
                paths.push(target.to_string());
            }
        }

        let coordinator = self.clone();
        let host = host.to_string();
        let event = format!("onPlugin:{}", plugin.id);
        async move {
            if paths.is_empty() && include_patterns.is_empty() {
                return Ok(false);
            }

            let decided = Decided::new();
            let started: Mutex<Option<SharedActivation>> = Mutex::new(None);
            let activate = || {
                if decided.decide() {
                    *started.lock() = Some(coordinator.activate_by_event_on(&host, &event));
                }
            };

            let by_path = async {
                !paths.is_empty() && coordinator.workspace.contains_some(&paths).await
            };
            let search = async {
                if include_patterns.is_empty() {
                    return false;
                }
                let token = CancellationToken::new();
                let roots = coordinator.workspace.roots();
                let timeout = coordinator.settings.workspace_search_timeout();
                let find = coordinator
                    .file_search
                    .find(&roots, &include_patterns, 1, token.clone());
                match tokio::time::timeout(timeout, find).await {
                    Ok(Ok(found)) => !found.is_empty(),
                    Ok(Err(err)) => {
                        if !err.is_cancelled() {
                            tracing::warn!(host = %host, event = %event, error = %err, "workspace search failed");
                        }
                        false
                    }
                    Err(_) => {
                        token.cancel();
                        tracing::info!(
                            host = %host,
                            event = %event,
                            timeout_ms = timeout.as_millis() as u64,
                            "workspace search timed out; activating eagerly"
                        );
                        activate();
                        false
                    }
                }
            };

            let (exists, matched) = tokio::join!(by_path, search);
            if exists || matched {
                activate();
            }
            let started = started.lock().take();
            match started {
                Some(activation) => activation.await.map(|()| true),
                None => Ok(false),
            }
        }
        .boxed()
    }

    /// Sends the new storage location to every connected host.
    pub async fn update_storage_path(&self, path: Option<String>) {
        *self.storage_path.lock() = path.clone();
        let managers = self
            .hosts
            .lock()
            .iter()
            .map(|(key, record)| (key.clone(), record.manager.clone()))
            .collect::<Vec<_>>();
        let updates = managers.into_iter().map(|(key, manager)| {
            let path = path.clone();
            async move {
                if let Err(err) = manager.update_storage_path(path).await {
                    tracing::warn!(host = %key, error = %err, "update storage path failed");
                }
            }
        });
        join_all(updates).await;
    }
}
