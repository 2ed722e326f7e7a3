#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("channel encoding failed: {0}")]
    Encoding(String),
}

/// Failure of a single RPC call, as observed by the caller.
///
/// Classify with [`RpcError::is_cancelled`] and [`RpcError::is_connection_closed`];
/// remote messages are free text and must not be matched on.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unknown rpc target: {0}")]
    UnknownTarget(String),
    #[error("unknown rpc method: {0}")]
    UnknownMethod(String),
    #[error("invalid arguments for {method}: {detail}")]
    InvalidArguments { method: String, detail: String },
    #[error("rpc codec failure: {0}")]
    Codec(String),
}

impl RpcError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            stack: None,
        }
    }

    pub fn invalid_arguments(method: &str, detail: impl std::fmt::Display) -> Self {
        Self::InvalidArguments {
            method: method.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

impl From<ChannelError> for RpcError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Self::ConnectionClosed,
            ChannelError::Encoding(detail) => Self::Codec(detail),
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RpcError>() {
            Ok(rpc) => rpc,
            Err(other) => Self::Remote {
                message: format!("{other:#}"),
                stack: None,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostErrorCode {
    InvalidConfig,
    SpawnFailed,
    TransportIo,
    HandshakeRejected,
    ProtocolMismatch,
    ProtocolViolation,
    InvalidTransition,
    ReadyTimeout,
}

impl HostErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::SpawnFailed => "spawn_failed",
            Self::TransportIo => "transport_io",
            Self::HandshakeRejected => "handshake_rejected",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::ProtocolViolation => "protocol_violation",
            Self::InvalidTransition => "invalid_transition",
            Self::ReadyTimeout => "ready_timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{}: {}", .code.as_tag(), .detail)]
pub struct HostError {
    pub code: HostErrorCode,
    pub detail: String,
}

impl HostError {
    pub fn new(code: HostErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Settlement of one activation attempt. Cloned to every waiter of a shared attempt.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    #[error("activation of `{event}` failed on host {host}: {message}")]
    Remote {
        host: String,
        event: String,
        message: String,
    },
    #[error("host {host} failed to initialize: {message}")]
    Init { host: String, message: String },
    #[error("host {host} is not connected")]
    HostGone { host: String },
    #[error("activation event `{event}` disabled after repeated failures")]
    Disabled { event: String },
    #[error("activation task aborted")]
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    #[error("search cancelled")]
    Cancelled,
    #[error("invalid search pattern: {0}")]
    Pattern(String),
    #[error("search failed: {0}")]
    Io(String),
}

impl SearchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("command `{0}` has no handler")]
    NoHandler(String),
    #[error("command `{command}` aborted before dispatch: {message}")]
    Aborted { command: String, message: String },
    #[error("command `{command}` failed: {message}")]
    Handler { command: String, message: String },
}
