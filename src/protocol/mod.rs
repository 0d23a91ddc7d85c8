//! Request/response envelopes of the bridge wire protocol.

mod codec;

pub use codec::{decode_request, decode_response, encode, DecodeError, EncodeError};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// Request envelope.
///
/// A missing `id` marks a notification, `"id": null` is kept as a present null id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default, deserialize_with = "params_or_empty")]
    pub params: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Map<String, Value>, id: impl Into<Value>) -> Self {
        Self {
            jsonrpc: None,
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// `null` params are treated as no params at all.
fn params_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Distinguish a present `null` from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Protocol-level error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "result")]
    Result(Value),
    #[serde(rename = "error")]
    Error(ErrorObject),
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(default)]
    pub id: Value,
}

impl Response {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: None,
            outcome: Outcome::Result(result),
            id: id.unwrap_or(Value::Null),
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: None,
            outcome: Outcome::Error(ErrorObject {
                code,
                message: message.into(),
            }),
            id: id.unwrap_or(Value::Null),
        }
    }

    /// Answer in the protocol dialect of the request (echo `jsonrpc` if present).
    pub fn in_reply_to(mut self, request: &Request) -> Self {
        self.jsonrpc = request.jsonrpc.clone();
        self
    }

    pub fn as_result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(v) => Some(v),
            Outcome::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorObject> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(e) => Some(e),
        }
    }
}
