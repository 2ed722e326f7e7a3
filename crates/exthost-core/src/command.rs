use crate::error::CommandError;
use crate::event::{Emitter, Listener, WaitUntilEmitter, WaitUntilEvent};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandOrigin {
    Builtin,
    Plugin,
}

impl CommandOrigin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Plugin => "plugin",
        }
    }
}

pub type CommandHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub fn command_handler<F, Fut>(handler: F) -> CommandHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(handler(args)))
}

struct CommandEntry {
    origin: CommandOrigin,
    // Most recent registration wins.
    handlers: Vec<(u64, CommandHandler)>,
}

impl CommandEntry {
    fn new(origin: CommandOrigin) -> Self {
        Self {
            origin,
            handlers: Vec::new(),
        }
    }
}

/// Known commands and their bound handlers. A command can be known (declared
/// by a plugin) long before the plugin activates and binds a handler.
pub struct CommandRegistry {
    commands: Arc<Mutex<HashMap<String, CommandEntry>>>,
    next_handler: AtomicU64,
    on_did_register_handler: Emitter<String>,
    on_will_execute: WaitUntilEmitter<String>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(HashMap::new())),
            next_handler: AtomicU64::new(1),
            on_did_register_handler: Emitter::new(),
            on_will_execute: WaitUntilEmitter::new(),
        }
    }

    /// Declares `id`. Returns false when it was already known.
    pub fn register_command(&self, id: impl Into<String>, origin: CommandOrigin) -> bool {
        let id = id.into();
        let mut commands = self.commands.lock();
        if commands.contains_key(&id) {
            return false;
        }
        tracing::trace!(command = %id, origin = origin.as_str(), "command declared");
        commands.insert(id, CommandEntry::new(origin));
        true
    }

    /// Binds `handler` to `id` until the listener is disposed. Unknown ids are
    /// declared as builtin.
    pub fn register_handler(&self, id: impl Into<String>, handler: CommandHandler) -> Listener {
        let id = id.into();
        let handler_id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.commands
            .lock()
            .entry(id.clone())
            .or_insert_with(|| CommandEntry::new(CommandOrigin::Builtin))
            .handlers
            .push((handler_id, handler));
        self.on_did_register_handler.fire(&id);

        let commands = Arc::downgrade(&self.commands);
        Listener::new(move || {
            if let Some(commands) = commands.upgrade() {
                if let Some(entry) = commands.lock().get_mut(&id) {
                    entry.handlers.retain(|(existing, _)| *existing != handler_id);
                }
            }
        })
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.commands.lock().contains_key(id)
    }

    pub fn is_plugin_contributed(&self, id: &str) -> bool {
        self.commands
            .lock()
            .get(id)
            .is_some_and(|entry| entry.origin == CommandOrigin::Plugin)
    }

    pub fn has_handler(&self, id: &str) -> bool {
        self.commands
            .lock()
            .get(id)
            .is_some_and(|entry| !entry.handlers.is_empty())
    }

    /// Fired with the command id each time a handler is bound.
    pub fn on_did_register_handler(&self) -> &Emitter<String> {
        &self.on_did_register_handler
    }

    pub fn on_will_execute(
        &self,
        callback: impl Fn(&WaitUntilEvent<String>) + Send + Sync + 'static,
    ) -> Listener {
        self.on_will_execute.subscribe(callback)
    }

    /// Waits for every will-execute contribution, then runs the bound handler.
    pub async fn execute_command(&self, id: &str, args: Vec<Value>) -> Result<Value, CommandError> {
        if !self.is_known(id) {
            return Err(CommandError::NotFound(id.to_string()));
        }

        if let Err(err) = self.on_will_execute.fire(id.to_string(), None).await {
            return Err(CommandError::Aborted {
                command: id.to_string(),
                message: format!("{err:#}"),
            });
        }

        let handler = self
            .commands
            .lock()
            .get(id)
            .and_then(|entry| entry.handlers.last().map(|(_, handler)| handler.clone()));
        let Some(handler) = handler else {
            return Err(CommandError::NoHandler(id.to_string()));
        };

        tracing::debug!(command = id, "executing command");
        handler(args).await.map_err(|err| CommandError::Handler {
            command: id.to_string(),
            message: format!("{err:#}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> CommandHandler {
        command_handler(|args| async move { Ok(json!(args)) })
    }

    #[tokio::test]
    async fn declared_command_without_handler() {
        let registry = CommandRegistry::new();
        assert!(registry.register_command("sample.hello", CommandOrigin::Plugin));
        assert!(!registry.register_command("sample.hello", CommandOrigin::Builtin));
        assert!(registry.is_known("sample.hello"));
        assert!(registry.is_plugin_contributed("sample.hello"));
        assert!(!registry.has_handler("sample.hello"));

        let err = registry
            .execute_command("sample.hello", Vec::new())
            .await
            .expect_err("no handler");
        assert_eq!(err, CommandError::NoHandler("sample.hello".into()));

        let err = registry
            .execute_command("sample.missing", Vec::new())
            .await
            .expect_err("unknown");
        assert_eq!(err, CommandError::NotFound("sample.missing".into()));
    }

    #[tokio::test]
    async fn latest_handler_wins_until_disposed() {
        let registry = CommandRegistry::new();
        let registered = Arc::new(Mutex::new(Vec::new()));
        let _watch = {
            let registered = registered.clone();
            registry
                .on_did_register_handler()
                .subscribe(move |id| registered.lock().push(id.clone()))
        };

        let _first = registry.register_handler("core.echo", echo());
        let second = registry.register_handler(
            "core.echo",
            command_handler(|_args| async { Ok(json!("second")) }),
        );
        assert_eq!(
            registry.execute_command("core.echo", vec![json!(1)]).await,
            Ok(json!("second"))
        );

        second.dispose();
        assert_eq!(
            registry.execute_command("core.echo", vec![json!(1)]).await,
            Ok(json!([1]))
        );
        assert!(!registry.is_plugin_contributed("core.echo"));
        assert_eq!(*registered.lock(), vec!["core.echo", "core.echo"]);
    }

    #[tokio::test]
    async fn will_execute_failures_abort_dispatch() {
        let registry = CommandRegistry::new();
        let _handler = registry.register_handler("core.echo", echo());
        let _veto = registry.on_will_execute(|event| {
            if event.payload == "core.echo" {
                event.wait_until(async { Err(anyhow::anyhow!("activation failed")) });
            }
        });

        let err = registry
            .execute_command("core.echo", Vec::new())
            .await
            .expect_err("aborted");
        assert!(matches!(err, CommandError::Aborted { .. }));
        assert!(err.to_string().contains("activation failed"));
    }

    #[tokio::test]
    async fn handler_errors_are_reported() {
        let registry = CommandRegistry::new();
        let _handler = registry.register_handler(
            "core.fail",
            command_handler(|_args| async { Err(anyhow::anyhow!("bad input")) }),
        );
        let err = registry
            .execute_command("core.fail", Vec::new())
            .await
            .expect_err("handler error");
        assert_eq!(
            err,
            CommandError::Handler {
                command: "core.fail".into(),
                message: "bad input".into()
            }
        );
    }
}
