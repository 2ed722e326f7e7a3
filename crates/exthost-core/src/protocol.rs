use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

/// One framed unit on an RPC channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcMessage {
    Request {
        id: u64,
        identifier: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Notify {
        identifier: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cancelled: bool,
    },
    Cancel {
        id: u64,
    },
}

impl RpcMessage {
    pub fn error_reply(id: u64, err: &RpcError) -> Self {
        Self::Error {
            id,
            message: err.to_string(),
            stack: err.stack().map(str::to_string),
            cancelled: err.is_cancelled(),
        }
    }
}

/// Process-control messages exchanged on the side channel of a supervised host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Handshake {
        protocol_version: u32,
        #[serde(default)]
        supported_protocol_versions: Vec<u32>,
        host_id: String,
    },
    HandshakeAck {
        protocol_version: u32,
        accepted: bool,
        reason: Option<String>,
    },
    TerminateRequest {
        #[serde(default)]
        deadline_ms: Option<u64>,
    },
    TerminateAck,
}

pub fn encode_message(message: &RpcMessage) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(message).map_err(|err| RpcError::Codec(format!("encode rpc message: {err}")))
}

pub fn decode_message(bytes: &[u8]) -> Result<RpcMessage, RpcError> {
    serde_json::from_slice(bytes).map_err(|err| RpcError::Codec(format!("decode rpc message: {err}")))
}

/// Positive versions from `supported` plus `primary`, highest first.
pub fn normalized_protocol_versions(primary: u32, supported: &[u32]) -> Vec<u32> {
    let mut versions = supported
        .iter()
        .copied()
        .filter(|v| *v > 0)
        .collect::<Vec<_>>();
    if primary > 0 && !versions.contains(&primary) {
        versions.push(primary);
    }
    versions.sort_unstable();
    versions.dedup();
    versions.reverse();
    versions
}

/// Picks the version a host answers with: the requested one when it is
/// supported locally, else the highest version both sides offer.
pub fn select_protocol_version(requested: u32, offered: &[u32], local: &[u32]) -> Option<u32> {
    if requested > 0 && local.contains(&requested) {
        return Some(requested);
    }
    normalized_protocol_versions(requested, offered)
        .into_iter()
        .find(|candidate| local.contains(candidate))
}
