use crate::error::RpcError;
use crate::rpc::{ProxyIdentifier, RemoteProxy, RpcProxy, RpcTarget};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_MANAGER: ProxyIdentifier<PluginManagerProxy> =
    ProxyIdentifier::new("PluginManager");

pub const BUILTIN_ACTIVATION_EVENTS: &[&str] = &[
    "*",
    "onLanguage",
    "onCommand",
    "onDebug",
    "onDebugInitialConfigurations",
    "onDebugResolve",
    "onDebugAdapterProtocolTracker",
    "onDebugDynamicConfigurations",
    "onTaskType",
    "workspaceContains",
    "onView",
    "onUri",
    "onTerminalProfile",
    "onWebviewPanel",
    "onFileSystem",
    "onCustomEditor",
    "onStartupFinished",
    "onAuthenticationRequest",
    "onNotebook",
    "onNotebookSerializer",
];

/// Builtin events followed by `additional`, trimmed and without duplicates.
pub fn supported_activation_events(additional: &[String]) -> Vec<String> {
    let mut events = BUILTIN_ACTIVATION_EVENTS
        .iter()
        .map(|event| event.to_string())
        .collect::<Vec<_>>();
    for event in additional {
        let event = event.trim();
        if !event.is_empty() && !events.iter().any(|existing| existing == event) {
            events.push(event.to_string());
        }
    }
    events
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapData {
    pub host_id: String,
    #[serde(default)]
    pub supported_activation_events: Vec<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
}

/// Remote capability that initializes a host and activates plugins by event.
#[async_trait]
pub trait PluginManager: Send + Sync {
    async fn init(&self, data: BootstrapData) -> Result<bool, RpcError>;
    async fn activate_by_event(&self, event: &str) -> Result<(), RpcError>;
    async fn update_storage_path(&self, path: Option<String>) -> Result<(), RpcError>;
}

const METHOD_INIT: &str = "init";
const METHOD_ACTIVATE_BY_EVENT: &str = "activateByEvent";
const METHOD_UPDATE_STORAGE_PATH: &str = "updateStoragePath";

pub struct PluginManagerProxy {
    proxy: RpcProxy,
}

impl RemoteProxy for PluginManagerProxy {
    fn from_proxy(proxy: RpcProxy) -> Self {
        Self { proxy }
    }
}

fn to_arg(method: &str, value: impl Serialize) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| RpcError::invalid_arguments(method, err))
}

fn from_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value)
        .map_err(|err| RpcError::Codec(format!("decode result of {method}: {err}")))
}

#[async_trait]
impl PluginManager for PluginManagerProxy {
    async fn init(&self, data: BootstrapData) -> Result<bool, RpcError> {
        let args = vec![to_arg(METHOD_INIT, data)?];
        let result = self.proxy.call(METHOD_INIT, args).await?;
        from_result(METHOD_INIT, result)
    }

    async fn activate_by_event(&self, event: &str) -> Result<(), RpcError> {
        self.proxy
            .call(METHOD_ACTIVATE_BY_EVENT, vec![json!(event)])
            .await?;
        Ok(())
    }

    async fn update_storage_path(&self, path: Option<String>) -> Result<(), RpcError> {
        self.proxy
            .call(METHOD_UPDATE_STORAGE_PATH, vec![json!(path)])
            .await?;
        Ok(())
    }
}

/// Serves a local [`PluginManager`] under [`PLUGIN_MANAGER`].
pub struct PluginManagerTarget<M: ?Sized> {
    manager: Arc<M>,
}

impl<M: PluginManager + ?Sized + 'static> PluginManagerTarget<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }
}

fn take_arg<T: DeserializeOwned>(method: &str, args: &mut Vec<Value>, index: usize) -> Result<T, RpcError> {
    let value = if index < args.len() {
        std::mem::take(&mut args[index])
    } else {
        Value::Null
    };
    serde_json::from_value(value).map_err(|err| RpcError::invalid_arguments(method, err))
}

#[async_trait]
impl<M: PluginManager + ?Sized + 'static> RpcTarget for PluginManagerTarget<M> {
    async fn invoke(
        &self,
        method: &str,
        mut args: Vec<Value>,
        _cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            METHOD_INIT => {
                let data: BootstrapData = take_arg(method, &mut args, 0)?;
                let accepted = self.manager.init(data).await?;
                Ok(json!(accepted))
            }
            METHOD_ACTIVATE_BY_EVENT => {
                let event: String = take_arg(method, &mut args, 0)?;
                self.manager.activate_by_event(&event).await?;
                Ok(Value::Null)
            }
            METHOD_UPDATE_STORAGE_PATH => {
                let path: Option<String> = take_arg(method, &mut args, 0)?;
                self.manager.update_storage_path(path).await?;
                Ok(Value::Null)
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::rpc::RpcProtocol;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingManager {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PluginManager for RecordingManager {
        async fn init(&self, data: BootstrapData) -> Result<bool, RpcError> {
            self.calls.lock().push(format!("init:{}", data.host_id));
            Ok(true)
        }

        async fn activate_by_event(&self, event: &str) -> Result<(), RpcError> {
            if event == "onCommand:broken" {
                return Err(RpcError::remote("plugin threw during activate"));
            }
            self.calls.lock().push(format!("activate:{event}"));
            Ok(())
        }

        async fn update_storage_path(&self, path: Option<String>) -> Result<(), RpcError> {
            self.calls
                .lock()
                .push(format!("storage:{}", path.unwrap_or_default()));
            Ok(())
        }
    }

    #[test]
    fn supported_events_append_additional_once() {
        let events = supported_activation_events(&[
            " onAuthenticationRequest ".to_string(),
            "onIssueReporterOpened".to_string(),
            String::new(),
        ]);
        assert_eq!(events.len(), BUILTIN_ACTIVATION_EVENTS.len() + 1);
        assert_eq!(events.last().map(String::as_str), Some("onIssueReporterOpened"));
    }

    #[tokio::test]
    async fn proxy_round_trips_through_target() {
        let (owner_channel, host_channel) = LoopbackChannel::pair();
        let owner = RpcProtocol::new(owner_channel);
        let host = RpcProtocol::new(host_channel);
        let manager = Arc::new(RecordingManager::default());
        host.set_local(PLUGIN_MANAGER, Arc::new(PluginManagerTarget::new(manager.clone())));

        let proxy = owner.get_proxy(PLUGIN_MANAGER);
        let accepted = proxy
            .init(BootstrapData {
                host_id: "main".to_string(),
                ..BootstrapData::default()
            })
            .await
            .expect("init");
        assert!(accepted);
        proxy
            .activate_by_event("onLanguage:json")
            .await
            .expect("activate");
        proxy
            .update_storage_path(Some("/tmp/state".to_string()))
            .await
            .expect("storage path");

        let err = proxy
            .activate_by_event("onCommand:broken")
            .await
            .expect_err("activation error");
        assert!(err.to_string().contains("plugin threw during activate"));

        assert_eq!(
            *manager.calls.lock(),
            vec![
                "init:main".to_string(),
                "activate:onLanguage:json".to_string(),
                "storage:/tmp/state".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected() {
        let target = PluginManagerTarget::new(Arc::new(RecordingManager::default()));
        let err = target
            .invoke(METHOD_ACTIVATE_BY_EVENT, vec![json!(42)], CancellationToken::new())
            .await
            .expect_err("bad args");
        assert!(matches!(err, RpcError::InvalidArguments { .. }));
    }
}
