use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};

type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;
type AbortHook = Arc<dyn Fn() + Send + Sync>;

fn process_exit(code: i32) {
    std::process::exit(code);
}

fn process_abort() {
    std::process::abort();
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FaultTelemetrySnapshot {
    pub prevented_exits: u64,
    pub prevented_aborts: u64,
    pub loaded_capabilities: usize,
}

#[derive(Default)]
struct Loaded {
    next_id: u64,
    names: HashMap<u64, String>,
}

/// Gate in front of process-wide destructive operations. While any plugin
/// capability is loaded, `exit` and `abort` are logged and ignored.
pub struct ProcessGuard {
    loaded: Arc<Mutex<Loaded>>,
    exit_hook: ExitHook,
    abort_hook: AbortHook,
    prevented_exits: AtomicU64,
    prevented_aborts: AtomicU64,
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self::with_hooks(Arc::new(process_exit), Arc::new(process_abort))
    }

    pub fn with_hooks(exit_hook: ExitHook, abort_hook: AbortHook) -> Self {
        Self {
            loaded: Arc::new(Mutex::new(Loaded::default())),
            exit_hook,
            abort_hook,
            prevented_exits: AtomicU64::new(0),
            prevented_aborts: AtomicU64::new(0),
        }
    }

    /// Marks `name` as loaded until the returned token is dropped.
    pub fn capability_loaded(&self, name: impl Into<String>) -> CapabilityToken {
        let mut loaded = self.loaded.lock();
        loaded.next_id += 1;
        let id = loaded.next_id;
        loaded.names.insert(id, name.into());
        CapabilityToken {
            id,
            loaded: Arc::downgrade(&self.loaded),
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().names.len()
    }

    pub fn exit(&self, code: i32) {
        if let Some(loaded) = self.loaded_names() {
            self.prevented_exits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(code, loaded = ?loaded, "plugin attempted to exit the host; ignored");
            return;
        }
        (self.exit_hook)(code);
    }

    pub fn abort(&self) {
        if let Some(loaded) = self.loaded_names() {
            self.prevented_aborts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(loaded = ?loaded, "plugin attempted to abort the host; ignored");
            return;
        }
        (self.abort_hook)();
    }

    pub fn telemetry_snapshot(&self) -> FaultTelemetrySnapshot {
        FaultTelemetrySnapshot {
            prevented_exits: self.prevented_exits.load(Ordering::Relaxed),
            prevented_aborts: self.prevented_aborts.load(Ordering::Relaxed),
            loaded_capabilities: self.loaded_count(),
        }
    }

    fn loaded_names(&self) -> Option<Vec<String>> {
        let loaded = self.loaded.lock();
        if loaded.names.is_empty() {
            return None;
        }
        let mut names = loaded.names.values().cloned().collect::<Vec<_>>();
        names.sort();
        Some(names)
    }
}

/// Keeps one capability registered with its [`ProcessGuard`].
#[derive(Debug)]
pub struct CapabilityToken {
    id: u64,
    loaded: Weak<Mutex<Loaded>>,
}

impl Drop for CapabilityToken {
    fn drop(&mut self) {
        if let Some(loaded) = self.loaded.upgrade() {
            loaded.lock().names.remove(&self.id);
        }
    }
}

static PANIC_HOOK: Once = Once::new();

/// Routes panics to `tracing` before the previous hook runs. Installed once per process.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|location| format!("{}:{}", location.file(), location.line()));
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(location = location.as_deref(), message = %message, "uncaught panic");
            previous(info);
        }));
    });
}
