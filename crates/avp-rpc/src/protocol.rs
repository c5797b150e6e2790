//! Message types for the broker JSON-RPC dialect.
//!
//! The brokers predate JSON-RPC 2.0: there is no `jsonrpc` version field,
//! ids are plain integers, and any inbound object carrying an `id` is a
//! reply. Objects without an `id` are subscription notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel code for client-side transport failures (not connected, timeout,
/// malformed reply). The brokers never emit it; call sites match on it to
/// distinguish local failures from server-reported ones.
pub const TRANSPORT_FAILURE: i32 = 0;

/// Another listener currently holds the control token.
pub const TOKEN_HELD: i32 = -31929;

/// The broker cannot unsubscribe while suspended.
pub const SUSPENDED_UNSUBSCRIBE: i32 = -31917;

/// An outbound RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, id: u64, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            id,
            params,
        }
    }
}

/// A reply to a request, matched to it by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: u64,
}

impl Reply {
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn failure(id: u64, error: RpcError) -> Self {
        Self {
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Collapse into the `result` payload or the carried error.
    ///
    /// A reply with neither field yields `Null`, which some brokers send
    /// for fire-and-forget acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns the server-reported [`RpcError`] when the reply carries one.
    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// An unsolicited server message; no `id`, never answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Error object carried in failed replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            data: None,
        }
    }

    /// Client-side failure surfaced as an error value (code 0), mirroring
    /// what callers see for server-side failures.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TRANSPORT_FAILURE, message)
    }

    #[must_use]
    pub fn is_transport(&self) -> bool {
        self.code == TRANSPORT_FAILURE
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// An inbound message: a reply if it carries an `id`, otherwise a
/// notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Reply(Reply),
    Notification(Notification),
}

impl Message {
    /// Parse a JSON string into a `Message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or matches neither shape.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::Reply(_))
    }

    #[must_use]
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }
}
