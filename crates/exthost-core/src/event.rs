use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Synchronous multicast event. Listeners run in subscription order on the firing thread.
pub struct Emitter<T> {
    subscribers: Arc<Mutex<Subscribers<T>>>,
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Listener {
        let id = {
            let mut subscribers = self.subscribers.lock();
            subscribers.next_id += 1;
            let id = subscribers.next_id;
            subscribers.entries.push((id, Arc::new(callback)));
            id
        };

        let weak = Arc::downgrade(&self.subscribers);
        Listener::new(move || {
            if let Some(subscribers) = weak.upgrade() {
                subscribers.lock().entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub fn fire(&self, value: &T) {
        // Snapshot so listeners may subscribe or dispose while being notified.
        let snapshot = self
            .subscribers
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect::<Vec<_>>();
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }
}

/// Subscription handle. Dropping it disposes the subscription.
pub struct Listener {
    dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Listener {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    pub fn dispose(&self) {
        let dispose = self.dispose.lock().take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose.lock().is_none()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// One-shot latch for races: only the first `decide` wins.
#[derive(Debug, Default)]
pub struct Decided(AtomicBool);

impl Decided {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_decided(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resolves with the first fired value matching `predicate`, or `None` once `timeout` elapses.
pub async fn wait_for_event<T, P>(
    emitter: &Emitter<T>,
    predicate: P,
    timeout: Option<Duration>,
) -> Option<T>
where
    T: Clone + Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let listener = emitter.subscribe(move |value: &T| {
        if predicate(value) {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(value.clone());
            }
        }
    });

    let value = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, rx)
            .await
            .ok()
            .and_then(Result::ok),
        None => rx.await.ok(),
    };
    listener.dispose();
    value
}

type Contribution = BoxFuture<'static, anyhow::Result<()>>;

/// Payload of a wait-until emission. Listeners may extend it with pending work
/// by calling [`WaitUntilEvent::wait_until`] while they are being notified.
pub struct WaitUntilEvent<T> {
    pub payload: T,
    contributions: Mutex<Option<Vec<Contribution>>>,
}

impl<T> WaitUntilEvent<T> {
    fn new(payload: T) -> Self {
        Self {
            payload,
            contributions: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn wait_until(&self, work: impl Future<Output = anyhow::Result<()>> + Send + 'static) {
        match self.contributions.lock().as_mut() {
            Some(contributions) => contributions.push(Box::pin(work)),
            None => tracing::warn!("wait_until called after dispatch finished; contribution dropped"),
        }
    }

    fn seal(&self) -> Vec<Contribution> {
        self.contributions.lock().take().unwrap_or_default()
    }
}

pub struct WaitUntilEmitter<T> {
    emitter: Emitter<WaitUntilEvent<T>>,
}

impl<T: Send + 'static> Default for WaitUntilEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> WaitUntilEmitter<T> {
    pub fn new() -> Self {
        Self {
            emitter: Emitter::new(),
        }
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&WaitUntilEvent<T>) + Send + Sync + 'static,
    ) -> Listener {
        self.emitter.subscribe(callback)
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    /// Notifies listeners, then awaits every contribution they made.
    ///
    /// All contributions settle before the first failure is returned. When
    /// `timeout` elapses first a warning is logged and the emission completes.
    pub async fn fire(&self, payload: T, timeout: Option<Duration>) -> anyhow::Result<()> {
        let event = WaitUntilEvent::new(payload);
        self.emitter.fire(&event);
        let contributions = event.seal();
        if contributions.is_empty() {
            return Ok(());
        }

        let pending = contributions.len();
        let all = join_all(contributions);
        let results = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, all).await {
                Ok(results) => results,
                Err(_) => {
                    tracing::warn!(
                        pending,
                        timeout_ms = timeout.as_millis() as u64,
                        "wait-until contributions timed out; proceeding"
                    );
                    return Ok(());
                }
            },
            None => all.await,
        };
        results.into_iter().collect::<anyhow::Result<Vec<()>>>()?;
        Ok(())
    }
}
