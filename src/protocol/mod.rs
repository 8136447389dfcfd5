//! JSON-RPC envelopes exchanged between MCP peers.
//!
//! Every frame on the wire is one of four shapes: a [`Request`], a [`Notification`],
//! a [`Response`] or an [`ErrorResponse`]. [`Message`] wraps all four and decodes a
//! payload without knowing in advance which shape it carries.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, ErrorCode};

pub mod engine;

pub use engine::{
    Protocol, ProtocolOptions, RequestHandlerExtra, RequestOptions, DEFAULT_REQUEST_TIMEOUT,
};

/// The latest supported protocol version of MCP
///
/// It is used during client-server handshake to ensure compatibility.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// List of all protocol versions supported by this SDK
///
/// The versions are listed in order of preference, with the most recent version first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[LATEST_PROTOCOL_VERSION, "2024-11-05", "2024-10-07"];

/// JSON-RPC version used by the MCP protocol
pub const JSONRPC_VERSION: &str = "2.0";

/// A unique identifier for a request
///
/// Either a string or a number, as per JSON-RPC 2.0. Ids are scoped to one connection
/// and must be unique among the requests a party has in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String representation of the request ID
    String(String),
    /// Numeric representation of the request ID
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Base JSON-RPC request structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Name of the method to be invoked
    pub method: String,
    /// Optional parameters for the method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Unique identifier for the request
    pub id: RequestId,
}

/// Base JSON-RPC notification structure
///
/// Same as a request minus the id: the absence of an id is what marks a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Name of the method to be invoked
    pub method: String,
    /// Optional parameters for the method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Successful JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// ID of the request this response corresponds to
    pub id: RequestId,
    /// The result of the request
    pub result: Value,
}

/// JSON-RPC error response
///
/// The id is `null` when the request it answers could not be parsed far enough to
/// recover one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// ID of the request this error corresponds to
    pub id: Option<RequestId>,
    /// The error object
    pub error: ResponseError,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// The error code
    pub code: i32,
    /// A short description of the error
    pub message: String,
    /// Additional information about the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Request {
    /// Creates a new Request instance
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

impl Notification {
    /// Creates a new Notification instance
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl Response {
    /// Creates a new successful Response instance
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

impl ErrorResponse {
    /// Creates a new error response for the given request id
    pub fn new(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<Error> for ResponseError {
    fn from(err: Error) -> Self {
        match err {
            Error::Protocol {
                code,
                message,
                data,
            } => ResponseError {
                code: code.into(),
                message,
                data,
            },
            Error::Remote(err) => err,
            Error::Serialization(err) => ResponseError::new(ErrorCode::ParseError, err.to_string()),
            Error::Transport(msg) => {
                ResponseError::new(ErrorCode::InternalError, format!("Transport error: {}", msg))
            }
            other => ResponseError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

/// Any JSON-RPC message
///
/// Decoding tries the variants in a fixed order (request, notification, response, error)
/// and keeps the first one that is structurally valid.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

impl Message {
    /// Decodes one message from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decodes one message from an already parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(map) = &value else {
            return Err("message must be a JSON object".to_string());
        };
        match map.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            _ => return Err(format!("jsonrpc field must be \"{}\"", JSONRPC_VERSION)),
        }

        let has_id = map.contains_key("id");
        let has_method = map.contains_key("method");

        if has_id && has_method {
            if let Ok(request) = serde_json::from_value::<Request>(value.clone()) {
                return Ok(Message::Request(request));
            }
        }
        if !has_id && has_method {
            if let Ok(notification) = serde_json::from_value::<Notification>(value.clone()) {
                return Ok(Message::Notification(notification));
            }
        }
        if has_id && map.contains_key("result") {
            if let Ok(response) = serde_json::from_value::<Response>(value.clone()) {
                return Ok(Message::Response(response));
            }
        }
        if map.contains_key("error") {
            if let Ok(error) = serde_json::from_value::<ErrorResponse>(value) {
                return Ok(Message::Error(error));
            }
        }
        Err("payload is not a request, notification, response or error".to_string())
    }

    /// The id carried by the message, if any
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => e.id.as_ref(),
            Message::Notification(_) => None,
        }
    }

    /// The method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Request(r) => r.serialize(serializer),
            Message::Notification(n) => n.serialize(serializer),
            Message::Response(r) => r.serialize(serializer),
            Message::Error(e) => e.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(de::Error::custom)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<ErrorResponse> for Message {
    fn from(error: ErrorResponse) -> Self {
        Message::Error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_creation() {
        let id = RequestId::Number(1);
        let params = Some(json!({"key": "value"}));
        let request = Request::new("test_method", params.clone(), id.clone());

        assert_eq!(request.jsonrpc, JSONRPC_VERSION);
        assert_eq!(request.method, "test_method");
        assert_eq!(request.params, params);
        assert_eq!(request.id, id);
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::Number(42).to_string(), "42");
        assert_eq!(RequestId::from("test-id").to_string(), "test-id");
    }

    #[test]
    fn test_protocol_versions() {
        assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&LATEST_PROTOCOL_VERSION));
        assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&"2024-11-05"));
        assert_eq!(JSONRPC_VERSION, "2.0");
    }

    #[test]
    fn decodes_each_variant_from_its_shape() {
        let request: Message =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"})).unwrap();
        assert!(matches!(request, Message::Request(ref r) if r.id == RequestId::Number(7)));

        let notification: Message = serde_json::from_value(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .unwrap();
        assert!(matches!(notification, Message::Notification(_)));

        let response: Message =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": "a", "result": {}})).unwrap();
        assert!(matches!(response, Message::Response(ref r) if r.id == RequestId::from("a")));

        let error: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        match error {
            Message::Error(e) => {
                assert_eq!(e.id, None);
                assert_eq!(e.error.code, -32700);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn null_result_is_still_a_response() {
        let message: Message =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": null})).unwrap();
        assert_eq!(
            message,
            Message::Response(Response::success(RequestId::Number(1), Value::Null))
        );
    }

    #[test]
    fn rejects_id_without_method_result_or_error() {
        let err = serde_json::from_value::<Message>(json!({"jsonrpc": "2.0", "id": 3}));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_wrong_version_and_non_objects() {
        assert!(serde_json::from_value::<Message>(json!({"jsonrpc": "1.0", "method": "x"})).is_err());
        assert!(serde_json::from_value::<Message>(json!([1, 2, 3])).is_err());
        assert!(Message::from_slice(b"{not json").is_err());
    }

    #[test]
    fn serialized_messages_decode_to_the_same_variant() {
        let messages = vec![
            Message::Request(Request::new(
                "tools/call",
                Some(json!({"name": "echo"})),
                RequestId::from("r-1"),
            )),
            Message::Notification(Notification::new("notifications/cancelled", None)),
            Message::Response(Response::success(RequestId::Number(9), json!({"ok": true}))),
            Message::Error(ErrorResponse::new(
                Some(RequestId::Number(9)),
                ResponseError::new(ErrorCode::InvalidParams, "missing name")
                    .with_data(json!({"field": "name"})),
            )),
        ];
        for message in messages {
            let bytes = serde_json::to_vec(&message).unwrap();
            assert_eq!(Message::from_slice(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn error_conversion_preserves_protocol_code() {
        let err = Error::protocol(ErrorCode::MethodNotFound, "Method foo not found");
        let wire = ResponseError::from(err);
        assert_eq!(wire.code, -32601);
        assert_eq!(wire.message, "Method foo not found");
    }
}
