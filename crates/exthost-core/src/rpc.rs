//! Request/notification multiplexer over a [`Channel`].
//!
//! Calls are correlated by id, never by order: replies may settle in any
//! sequence. Several named capability sets ([`ProxyIdentifier`]) share one
//! channel; every frame carries the identifier it belongs to.

use crate::channel::Channel;
use crate::error::RpcError;
use crate::event::Listener;
use crate::protocol::{decode_message, encode_message, RpcMessage};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Stable name of a remote-exposed capability set, typed by its proxy.
pub struct ProxyIdentifier<T: ?Sized> {
    name: &'static str,
    _proxy: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized> ProxyIdentifier<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _proxy: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized> Clone for ProxyIdentifier<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for ProxyIdentifier<T> {}

impl<T: ?Sized> std::fmt::Debug for ProxyIdentifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProxyIdentifier").field(&self.name).finish()
    }
}

/// Typed wrapper built around an untyped [`RpcProxy`].
pub trait RemoteProxy: Send + Sync + 'static {
    fn from_proxy(proxy: RpcProxy) -> Self;
}

/// Local object answering requests addressed to one identifier.
#[async_trait]
pub trait RpcTarget: Send + Sync {
    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError>;
}

/// Checked before any inbound message is processed.
pub trait DispatchGate: Send + Sync {
    fn accepts_messages(&self) -> bool;
}

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

pub struct RpcProtocol {
    channel: Arc<dyn Channel>,
    gate: Option<Arc<dyn DispatchGate>>,
    runtime: Handle,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    inbound: Mutex<HashMap<u64, CancellationToken>>,
    locals: Mutex<HashMap<String, Arc<dyn RpcTarget>>>,
    proxies: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
    listener: Mutex<Option<Listener>>,
    disposed: AtomicBool,
}

impl RpcProtocol {
    /// Binds `channel`. Must be called from within a Tokio runtime; inbound
    /// requests are served on that runtime.
    pub fn new(channel: Arc<dyn Channel>) -> Arc<Self> {
        Self::build(channel, None)
    }

    pub fn with_gate(channel: Arc<dyn Channel>, gate: Arc<dyn DispatchGate>) -> Arc<Self> {
        Self::build(channel, Some(gate))
    }

    fn build(channel: Arc<dyn Channel>, gate: Option<Arc<dyn DispatchGate>>) -> Arc<Self> {
        let protocol = Arc::new(Self {
            channel,
            gate,
            runtime: Handle::current(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            locals: Mutex::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&protocol);
        let listener = protocol.channel.on_message().subscribe(move |bytes| {
            if let Some(protocol) = weak.upgrade() {
                protocol.receive(bytes);
            }
        });
        *protocol.listener.lock() = Some(listener);
        protocol
    }

    pub fn set_local<T: ?Sized>(&self, identifier: ProxyIdentifier<T>, target: Arc<dyn RpcTarget>) {
        self.locals.lock().insert(identifier.name().to_string(), target);
    }

    /// Memoized per identifier: repeated lookups return the same proxy.
    pub fn get_proxy<T: RemoteProxy>(self: &Arc<Self>, identifier: ProxyIdentifier<T>) -> Arc<T> {
        let mut proxies = self.proxies.lock();
        if let Some(existing) = proxies.get(identifier.name()) {
            if let Ok(proxy) = existing.clone().downcast::<T>() {
                return proxy;
            }
        }
        let proxy = Arc::new(T::from_proxy(RpcProxy {
            protocol: Arc::downgrade(self),
            identifier: identifier.name(),
        }));
        proxies.insert(identifier.name(), proxy.clone());
        proxy
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Rejects every outstanding call with a connection-closed error and
    /// detaches from the channel. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.dispose();
        }

        let pending = self
            .pending
            .lock()
            .drain()
            .map(|(_, reply)| reply)
            .collect::<Vec<_>>();
        let rejected = pending.len();
        for reply in pending {
            let _ = reply.send(Err(RpcError::ConnectionClosed));
        }
        for (_, token) in self.inbound.lock().drain() {
            token.cancel();
        }
        tracing::debug!(rejected, "rpc protocol disposed");
    }

    async fn call(
        &self,
        identifier: &str,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            // Checked under the lock so a concurrent dispose cannot miss this entry.
            if self.is_disposed() {
                return Err(RpcError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }
        let _guard = PendingGuard { protocol: self, id };

        self.send(&RpcMessage::Request {
            id,
            identifier: identifier.to_string(),
            method: method.to_string(),
            args,
        })?;
        tracing::trace!(id, identifier, method, "rpc request sent");

        let settled = match cancel {
            None => rx.await,
            Some(token) => {
                tokio::select! {
                    settled = &mut rx => settled,
                    _ = token.cancelled() => {
                        tracing::debug!(id, identifier, method, "cancelling rpc request");
                        if let Err(err) = self.send(&RpcMessage::Cancel { id }) {
                            tracing::debug!(id, error = %err, "cancel not delivered");
                        }
                        // The peer still owes a terminal reply.
                        rx.await
                    }
                }
            }
        };
        settled.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    fn notify(&self, identifier: &str, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        if self.is_disposed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.send(&RpcMessage::Notify {
            identifier: identifier.to_string(),
            method: method.to_string(),
            args,
        })
    }

    fn send(&self, message: &RpcMessage) -> Result<(), RpcError> {
        let bytes = encode_message(message)?;
        self.channel.send(bytes)?;
        Ok(())
    }

    fn receive(self: &Arc<Self>, bytes: &[u8]) {
        if self.is_disposed() {
            return;
        }
        if let Some(gate) = &self.gate {
            if !gate.accepts_messages() {
                tracing::debug!("host terminated; dropping inbound rpc message");
                return;
            }
        }

        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed rpc message");
                return;
            }
        };

        match message {
            RpcMessage::Request {
                id,
                identifier,
                method,
                args,
            } => self.dispatch_request(id, identifier, method, args),
            RpcMessage::Notify {
                identifier,
                method,
                args,
            } => self.dispatch_notification(identifier, method, args),
            RpcMessage::Reply { id, result } => self.settle(id, Ok(result)),
            RpcMessage::Error {
                id,
                message,
                stack,
                cancelled,
            } => {
                let err = if cancelled {
                    RpcError::Cancelled
                } else {
                    RpcError::Remote { message, stack }
                };
                self.settle(id, Err(err));
            }
            RpcMessage::Cancel { id } => {
                let token = self.inbound.lock().get(&id).cloned();
                match token {
                    Some(token) => token.cancel(),
                    None => tracing::trace!(id, "cancel for request no longer running"),
                }
            }
        }
    }

    fn settle(&self, id: u64, result: Result<Value, RpcError>) {
        let reply = self.pending.lock().remove(&id);
        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::debug!(id, "reply for unknown or abandoned call"),
        }
    }

    fn local(&self, identifier: &str) -> Option<Arc<dyn RpcTarget>> {
        self.locals.lock().get(identifier).cloned()
    }

    fn dispatch_request(self: &Arc<Self>, id: u64, identifier: String, method: String, args: Vec<Value>) {
        let Some(target) = self.local(&identifier) else {
            tracing::warn!(id, %identifier, %method, "request for unknown rpc target");
            let reply = RpcMessage::error_reply(id, &RpcError::UnknownTarget(identifier));
            if let Err(err) = self.send(&reply) {
                tracing::debug!(id, error = %err, "error reply not delivered");
            }
            return;
        };

        let token = CancellationToken::new();
        self.inbound.lock().insert(id, token.clone());
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let outcome = AssertUnwindSafe(target.invoke(&method, args, token))
                .catch_unwind()
                .await;
            let Some(protocol) = weak.upgrade() else {
                return;
            };
            protocol.inbound.lock().remove(&id);
            if protocol.is_disposed() {
                return;
            }

            let reply = match outcome {
                Ok(Ok(result)) => RpcMessage::Reply { id, result },
                Ok(Err(err)) => {
                    tracing::debug!(id, %identifier, %method, error = %err, "rpc request failed");
                    RpcMessage::error_reply(id, &err)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(id, %identifier, %method, %message, "rpc handler panicked");
                    RpcMessage::error_reply(id, &RpcError::remote(message))
                }
            };
            if let Err(err) = protocol.send(&reply) {
                tracing::debug!(id, error = %err, "rpc reply not delivered");
            }
        });
    }

    fn dispatch_notification(&self, identifier: String, method: String, args: Vec<Value>) {
        let Some(target) = self.local(&identifier) else {
            tracing::warn!(%identifier, %method, "notification for unknown rpc target");
            return;
        };
        self.runtime.spawn(async move {
            let outcome = AssertUnwindSafe(target.invoke(&method, args, CancellationToken::new()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(%identifier, %method, error = %err, "notification handler failed")
                }
                Err(panic) => tracing::error!(
                    %identifier,
                    %method,
                    message = %panic_message(panic.as_ref()),
                    "notification handler panicked"
                ),
            }
        });
    }
}

impl Drop for RpcProtocol {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct PendingGuard<'a> {
    protocol: &'a RpcProtocol,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.protocol.pending.lock().remove(&self.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "rpc handler panicked".to_string()
    }
}

/// Untyped handle for one identifier on one protocol.
#[derive(Clone)]
pub struct RpcProxy {
    protocol: Weak<RpcProtocol>,
    identifier: &'static str,
}

impl RpcProxy {
    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    fn protocol(&self) -> Result<Arc<RpcProtocol>, RpcError> {
        self.protocol.upgrade().ok_or(RpcError::ConnectionClosed)
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let protocol = self.protocol()?;
        protocol.call(self.identifier, method, args, None).await
    }

    /// Like [`RpcProxy::call`], but sends a cancel frame once `token` fires and
    /// then keeps waiting for the peer's terminal reply.
    pub async fn call_with_cancel(
        &self,
        method: &str,
        args: Vec<Value>,
        token: CancellationToken,
    ) -> Result<Value, RpcError> {
        let protocol = self.protocol()?;
        protocol
            .call(self.identifier, method, args, Some(token))
            .await
    }

    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.protocol()?.notify(self.identifier, method, args)
    }
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl RemoteProxy for RpcProxy {
    fn from_proxy(proxy: RpcProxy) -> Self {
        proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ECHO: ProxyIdentifier<RpcProxy> = ProxyIdentifier::new("Echo");
    const OTHER: ProxyIdentifier<RpcProxy> = ProxyIdentifier::new("Other");

    struct EchoTarget {
        notified: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl RpcTarget for EchoTarget {
        async fn invoke(
            &self,
            method: &str,
            args: Vec<Value>,
            cancel: CancellationToken,
        ) -> Result<Value, RpcError> {
            match method {
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
                "nothing" => Ok(Value::Null),
                "sleep" => {
                    let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!(ms))
                }
                "hello" => {
                    let _ = self.notified.send("hello".to_string());
                    Ok(Value::Null)
                }
                "fails" => panic!("fails failed"),
                "fails2" => Err(RpcError::remote("fails2 failed")),
                "notification_fails" => {
                    let _ = self.notified.send("notification_fails".to_string());
                    Err(RpcError::remote("nobody hears this"))
                }
                "wait_for_cancel" => {
                    cancel.cancelled().await;
                    Err(RpcError::Cancelled)
                }
                "hang" => futures::future::pending().await,
                other => Err(RpcError::UnknownMethod(other.to_string())),
            }
        }
    }

    struct Other;

    #[async_trait]
    impl RpcTarget for Other {
        async fn invoke(
            &self,
            method: &str,
            _args: Vec<Value>,
            _cancel: CancellationToken,
        ) -> Result<Value, RpcError> {
            Ok(json!(format!("other:{method}")))
        }
    }

    fn connected_pair() -> (Arc<RpcProtocol>, Arc<RpcProtocol>, mpsc::UnboundedReceiver<String>) {
        let (client_channel, server_channel) = LoopbackChannel::pair();
        let client = RpcProtocol::new(client_channel);
        let server = RpcProtocol::new(server_channel);
        let (tx, rx) = mpsc::unbounded_channel();
        server.set_local(ECHO, Arc::new(EchoTarget { notified: tx }));
        server.set_local(OTHER, Arc::new(Other));
        (client, server, rx)
    }

    #[tokio::test]
    async fn notification_is_observed_exactly_once() {
        let (client, _server, mut notified) = connected_pair();
        client.get_proxy(ECHO).notify("hello", vec![]).expect("notify");

        assert_eq!(notified.recv().await.as_deref(), Some("hello"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notified.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_notification_sends_no_reply() {
        let (client_channel, server_channel) = LoopbackChannel::pair();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let _tap = {
            let frames = frames.clone();
            client_channel
                .on_message()
                .subscribe(move |bytes| frames.lock().push(bytes.clone()))
        };
        let client = RpcProtocol::new(client_channel);
        let server = RpcProtocol::new(server_channel);
        let (tx, mut notified) = mpsc::unbounded_channel();
        server.set_local(ECHO, Arc::new(EchoTarget { notified: tx }));

        client
            .get_proxy(ECHO)
            .notify("notification_fails", vec![])
            .expect("notify");
        assert_eq!(notified.recv().await.as_deref(), Some("notification_fails"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(frames.lock().is_empty());
    }

    #[tokio::test]
    async fn panicking_method_rejects_with_original_text() {
        let (client, _server, _) = connected_pair();
        let err = client
            .get_proxy(ECHO)
            .call("fails", vec![])
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("fails failed"));
        assert!(matches!(err, RpcError::Remote { .. }));
    }

    #[tokio::test]
    async fn rejecting_method_rejects_with_original_text() {
        let (client, _server, _) = connected_pair();
        let err = client
            .get_proxy(ECHO)
            .call("fails2", vec![])
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("fails2 failed"));
    }

    #[tokio::test]
    async fn unit_result_still_replies() {
        let (client, _server, _) = connected_pair();
        let value = client
            .get_proxy(ECHO)
            .call("nothing", vec![])
            .await
            .expect("call");
        assert_eq!(value, Value::Null);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replies_settle_out_of_order_by_id() {
        let (client, _server, _) = connected_pair();
        let proxy = client.get_proxy(ECHO);

        let slow = proxy.call("sleep", vec![json!(50)]);
        let fast = proxy.call("sleep", vec![json!(5)]);
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.expect("slow"), json!(50));
        assert_eq!(fast.expect("fast"), json!(5));
    }

    #[tokio::test]
    async fn identifiers_are_multiplexed_and_proxies_memoized() {
        let (client, _server, _) = connected_pair();
        let first = client.get_proxy(OTHER);
        let second = client.get_proxy(OTHER);
        assert!(Arc::ptr_eq(&first, &second));

        let other = first.call("ping", vec![]).await.expect("other call");
        let echo = client
            .get_proxy(ECHO)
            .call("echo", vec![json!("ping")])
            .await
            .expect("echo call");
        assert_eq!(other, json!("other:ping"));
        assert_eq!(echo, json!("ping"));
    }

    #[tokio::test]
    async fn unknown_identifier_is_a_remote_error() {
        let (client_channel, server_channel) = LoopbackChannel::pair();
        let client = RpcProtocol::new(client_channel);
        let _server = RpcProtocol::new(server_channel);

        let err = client
            .get_proxy(ECHO)
            .call("echo", vec![])
            .await
            .expect_err("no target");
        assert!(err.to_string().contains("unknown rpc target: Echo"));
    }

    #[tokio::test]
    async fn cancel_yields_distinguished_error() {
        let (client, _server, _) = connected_pair();
        let token = CancellationToken::new();
        let call = {
            let proxy = client.get_proxy(ECHO);
            let token = token.clone();
            tokio::spawn(async move { proxy.call_with_cancel("wait_for_cancel", vec![], token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let err = call.await.expect("join").expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(!err.is_connection_closed());
    }

    #[tokio::test]
    async fn dispose_rejects_pending_calls_and_is_idempotent() {
        let (client, _server, _) = connected_pair();
        let proxy = client.get_proxy(ECHO);
        let hanging = tokio::spawn(async move { proxy.call("hang", vec![]).await });
        while client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        client.dispose();
        client.dispose();

        let err = hanging.await.expect("join").expect_err("closed");
        assert!(err.is_connection_closed());
        assert_eq!(client.pending_count(), 0);

        let err = client
            .get_proxy(ECHO)
            .call("echo", vec![])
            .await
            .expect_err("disposed");
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn gate_drops_messages_once_closed() {
        struct Gate(AtomicBool);
        impl DispatchGate for Gate {
            fn accepts_messages(&self) -> bool {
                self.0.load(Ordering::SeqCst)
            }
        }

        let (client_channel, server_channel) = LoopbackChannel::pair();
        let client = RpcProtocol::new(client_channel);
        let gate = Arc::new(Gate(AtomicBool::new(false)));
        let server = RpcProtocol::with_gate(server_channel, gate.clone());
        let (tx, mut notified) = mpsc::unbounded_channel();
        server.set_local(ECHO, Arc::new(EchoTarget { notified: tx }));

        client.get_proxy(ECHO).notify("hello", vec![]).expect("notify");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notified.try_recv().is_err());

        gate.0.store(true, Ordering::SeqCst);
        client.get_proxy(ECHO).notify("hello", vec![]).expect("notify");
        assert_eq!(notified.recv().await.as_deref(), Some("hello"));
    }
}
