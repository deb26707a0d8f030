//! Classification of inbound lines.
//!
//! A line is decoded into one of three envelopes, tried in a fixed order:
//! response shape, notification shape, request shape. Anything else is a
//! [`Rejection`], which tells the router whether a reply can be addressed.
//!
//! ```rust
//! use linerpc_core::message::{classify, InboundMessage};
//!
//! let msg = classify(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
//! assert!(matches!(msg, InboundMessage::Request(_)));
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion, RequestId,
};

/// A successfully classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to a request this side originated
    Response(JsonRpcResponse),
    /// One-way message, never answered
    Notification(JsonRpcNotification),
    /// Call to be served by the registered handler
    Request(JsonRpcRequest),
}

impl InboundMessage {
    /// Short label for diagnostics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
            Self::Request(_) => "request",
        }
    }
}

/// Why a line could not be classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The line is not valid JSON
    Parse {
        /// Parser error message
        error: String,
        /// Id recovered by scanning the raw text, if any
        id: Option<RequestId>,
    },
    /// Valid JSON, but not an object
    NotAnObject,
    /// `jsonrpc` is missing or is not `"2.0"`
    UnsupportedVersion {
        /// Id of the offending message, if it had a usable one
        id: Option<RequestId>,
        /// What was found in the `jsonrpc` member
        found: Option<Value>,
    },
    /// Right version, wrong shape
    Malformed {
        /// Id of the offending message, if it had a usable one
        id: Option<RequestId>,
        /// What was wrong
        reason: String,
    },
    /// Response-shaped message with a bad payload. Never answered, since
    /// replying to a reply could loop between peers.
    MalformedResponse {
        /// Id the response carried
        id: RequestId,
        /// What was wrong
        reason: String,
    },
}

impl Rejection {
    /// Id a reply can be addressed to. `None` means the line can only be logged.
    #[must_use]
    pub fn reply_id(&self) -> Option<&RequestId> {
        match self {
            Self::Parse { id, .. }
            | Self::UnsupportedVersion { id, .. }
            | Self::Malformed { id, .. } => id.as_ref(),
            Self::NotAnObject | Self::MalformedResponse { .. } => None,
        }
    }

    /// Error object to send back when [`reply_id`](Self::reply_id) is known.
    #[must_use]
    pub fn to_error(&self) -> JsonRpcError {
        match self {
            Self::Parse { error, .. } => JsonRpcError::parse_error(format!("Parse error: {error}")),
            Self::NotAnObject => JsonRpcError::invalid_request("Message must be a JSON object"),
            Self::UnsupportedVersion { found, .. } => JsonRpcError::invalid_request(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got {}",
                found
                    .as_ref()
                    .map_or_else(|| "nothing".to_string(), Value::to_string)
            )),
            Self::Malformed { reason, .. } | Self::MalformedResponse { reason, .. } => {
                JsonRpcError::invalid_request(format!("Invalid Request: {reason}"))
            }
        }
    }
}

/// Classify one inbound line.
///
/// # Errors
///
/// Returns a [`Rejection`] when the line is not a well-formed JSON-RPC 2.0
/// request, response or notification.
pub fn classify(line: &str) -> Result<InboundMessage, Rejection> {
    let value: Value = serde_json::from_str(line).map_err(|e| Rejection::Parse {
        error: e.to_string(),
        id: recover_id(line),
    })?;

    let Value::Object(map) = value else {
        return Err(Rejection::NotAnObject);
    };

    let id = map.get("id").and_then(RequestId::from_value);

    match map.get("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        other => {
            return Err(Rejection::UnsupportedVersion {
                id,
                found: other.cloned(),
            });
        }
    }

    decode(map, id)
}

fn decode(mut map: Map<String, Value>, id: Option<RequestId>) -> Result<InboundMessage, Rejection> {
    let has_id_member = map.contains_key("id");
    let has_result = map.contains_key("result");
    let has_error = map.contains_key("error");
    let malformed = |id: Option<RequestId>, reason: &str| Rejection::Malformed {
        id,
        reason: reason.to_string(),
    };

    // Response shape
    if let Some(id) = id.clone()
        && (has_result || has_error)
    {
        let bad_response = |id: RequestId, reason: &str| Rejection::MalformedResponse {
            id,
            reason: reason.to_string(),
        };
        if has_result && has_error {
            return Err(bad_response(id, "response carries both result and error"));
        }
        let response = if let Some(error) = map.remove("error") {
            let error: JsonRpcError = serde_json::from_value(error)
                .map_err(|_| bad_response(id.clone(), "error member is not an error object"))?;
            JsonRpcResponse::error(id, error)
        } else {
            let result = map.remove("result").unwrap_or(Value::Null);
            JsonRpcResponse::success(id, result)
        };
        return Ok(InboundMessage::Response(response));
    }

    if has_id_member && id.is_none() {
        return Err(malformed(None, "id must be a string or an integer"));
    }

    let method = match map.remove("method") {
        Some(Value::String(method)) => Some(method),
        Some(_) => return Err(malformed(id, "method must be a string")),
        None => None,
    };
    let params = map.remove("params");

    match (id, method) {
        // Notification shape
        (None, Some(method)) => Ok(InboundMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method,
            params,
        })),
        // Request shape
        (Some(id), Some(method)) => Ok(InboundMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id,
            method,
            params,
        })),
        (id, None) => Err(malformed(id, "missing method, result or error")),
    }
}

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""id"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+)"#).expect("id pattern is a valid regex")
});

/// Best-effort scan of a raw (possibly malformed) line for an `"id": <value>`
/// member.
///
/// This is a diagnostic aid only: it takes the first string or integer that
/// follows an `"id"` key anywhere in the text, so a nested `id` can be picked
/// up when the top-level one is missing.
#[must_use]
pub fn recover_id(raw: &str) -> Option<RequestId> {
    let token = ID_PATTERN.captures(raw)?.get(1)?.as_str();
    if token.starts_with('"') {
        serde_json::from_str::<String>(token).ok().map(RequestId::String)
    } else {
        token.parse::<i64>().ok().map(RequestId::Number)
    }
}
