//! JSON-RPC 2.0 message codec
//!
//! Encodes and decodes the three message shapes that travel over the
//! signaling channel: requests, notifications (requests without an id) and
//! responses. Every wire message is a single JSON object carrying
//! `"jsonrpc": "2.0"`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Protocol version string carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
///
/// The standard range is reserved for transport/protocol-level faults;
/// `-32000` and below are implementation-defined server errors. Codes are
/// passed through verbatim, never reinterpreted by the client.
pub mod error_codes {
    /// Invalid JSON was received by the server
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Start of the range reserved for implementation-defined server errors
    pub const SERVER_ERROR: i64 = -32000;
}

/// A JSON-RPC 2.0 request or notification
///
/// A request without an id is a notification: fire-and-forget, never tracked,
/// never retried. Requests are immutable once sent; retries resend the
/// identical value.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request identifier, echoed back by the server; `None` for notifications
    pub id: Option<u64>,
    /// Name of the requested method
    pub method: String,
    /// Parameters, an object or an array when present
    pub params: Option<Value>,
}

impl Request {
    /// Create a request with no id yet: sent as-is it is a notification,
    /// sent through the client's request path it gets the next id
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Create a request with an explicit identifier
    pub fn with_id(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Whether this request is a notification
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Encode to a wire JSON object
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        if let Some(id) = self.id {
            obj.insert("id".into(), json!(id));
        }
        obj.insert("method".into(), json!(self.method));
        if let Some(params) = &self.params {
            obj.insert("params".into(), params.clone());
        }
        Value::Object(obj)
    }

    /// Encode to wire text
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

/// A JSON-RPC 2.0 response error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Error code (standard pre-defined or application-specific)
    pub code: i64,
    /// Short description of the error
    pub message: String,
    /// Additional application-defined information, may be omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Create a new response error
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// A JSON-RPC 2.0 response
///
/// Exactly one of `result` / `error` is present. The id is `None` only when
/// the server could not determine which request triggered a parse or protocol
/// error (encoded as JSON `null`).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Identifier of the request this response answers
    pub id: Option<u64>,
    /// Result value on success
    pub result: Option<Value>,
    /// Error object on failure
    pub error: Option<ResponseError>,
}

impl Response {
    /// Create a success response
    pub fn result(id: Option<u64>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<u64>, error: ResponseError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this response reports a failure
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Encode to a wire JSON object
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        obj.insert("id".into(), self.id.map_or(Value::Null, |id| json!(id)));
        if let Some(result) = &self.result {
            obj.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            // Serialization of a plain struct cannot fail
            obj.insert("error".into(), serde_json::to_value(error).unwrap_or(Value::Null));
        }
        Value::Object(obj)
    }

    /// Encode to wire text
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

/// A decoded inbound message, classified by shape
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request or notification (server-originated calls included)
    Request(Request),
    /// A response to a previously sent request
    Response(Response),
}

impl Message {
    /// Decode and classify one wire JSON object
    ///
    /// Objects carrying a `method` member are requests/notifications; objects
    /// carrying `result` or `error` are responses. Anything else, or a
    /// message without `"jsonrpc": "2.0"`, is malformed.
    pub fn decode(value: &Value) -> Result<Message> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedMessage("not a JSON object".into()))?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unsupported jsonrpc version: {:?}",
                    other
                )))
            }
        }

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| Error::MalformedMessage("method is not a string".into()))?;
            let id = decode_id(obj.get("id"))?;
            let params = obj.get("params").cloned();
            if let Some(params) = &params {
                if !params.is_object() && !params.is_array() {
                    return Err(Error::MalformedMessage(
                        "params must be an object or an array".into(),
                    ));
                }
            }
            return Ok(Message::Request(Request {
                id,
                method: method.to_owned(),
                params,
            }));
        }

        let result = obj.get("result").cloned();
        let error = match obj.get("error") {
            Some(error) => Some(
                serde_json::from_value::<ResponseError>(error.clone())
                    .map_err(|e| Error::MalformedMessage(format!("bad error object: {}", e)))?,
            ),
            None => None,
        };
        match (&result, &error) {
            (None, None) => Err(Error::MalformedMessage(
                "neither method, result nor error present".into(),
            )),
            (Some(_), Some(_)) => Err(Error::MalformedMessage(
                "both result and error present".into(),
            )),
            _ => Ok(Message::Response(Response {
                id: decode_id(obj.get("id"))?,
                result,
                error,
            })),
        }
    }

    /// Decode one wire text message
    pub fn decode_str(text: &str) -> Result<Message> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON: {}", e)))?;
        Message::decode(&value)
    }

    /// Encode to a wire JSON object
    pub fn to_json(&self) -> Value {
        match self {
            Message::Request(request) => request.to_json(),
            Message::Response(response) => response.to_json(),
        }
    }
}

fn decode_id(id: Option<&Value>) -> Result<Option<u64>> {
    match id {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::MalformedMessage(format!("non-integer id: {}", value))),
    }
}
