//! Newline-delimited JSON-RPC wire records.
//!
//! Two envelope families share the socket: JSON-RPC 2.0 for the EthProxy
//! dialect and the bare Stratum shape for NiceHash. Responses always carry
//! both `result` and `error` (success frames serialize `"error":null`);
//! `jsonrpc` only appears on the 2.0 path. NiceHash errors are two-element
//! `[code, message]` arrays rather than objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::upstream::ErrorReply;

/// Largest accepted request frame in bytes, newline included. Anything that
/// fills the read buffer without a newline is treated as a socket flood.
pub const MAX_REQ_SIZE: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct StratumReq {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    /// Kept raw; each handler parses the shape it expects.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub worker: String,
}

#[derive(Debug, Serialize)]
pub struct StratumResp {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<&'static str>,
    pub result: Value,
    pub error: Value,
}

impl StratumResp {
    pub fn rpc_result(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: Some("2.0"),
            result,
            error: Value::Null,
        }
    }

    pub fn rpc_error(id: Value, reply: &ErrorReply) -> Self {
        Self {
            id,
            jsonrpc: Some("2.0"),
            result: Value::Null,
            error: serde_json::json!({ "code": reply.code, "message": reply.message.clone() }),
        }
    }

    pub fn stratum_result(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: None,
            result,
            error: Value::Null,
        }
    }

    pub fn stratum_error(id: Value, error: Value) -> Self {
        Self {
            id,
            jsonrpc: None,
            result: Value::Null,
            error,
        }
    }
}

/// Server-initiated request or notification in the NiceHash shape.
#[derive(Debug, Serialize)]
pub struct StratumNotify {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: &'static str,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algo: Option<String>,
}

/// Legacy EthProxy push: response-shaped with a forced zero id, which is what
/// deployed Claymore-era clients expect.
#[derive(Debug, Serialize)]
pub struct PushMessage {
    pub jsonrpc: &'static str,
    pub result: Value,
    pub id: u64,
}
