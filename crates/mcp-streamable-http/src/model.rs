//! JSON-RPC 2.0 envelope types.
//!
//! The transport treats message payloads as opaque; all it discriminates on
//! are the `method`, `id`, `result` and `error` fields. Deserializing into
//! [`JsonRpcMessage`] doubles as schema validation: anything that is not a
//! well-formed JSON-RPC 2.0 envelope fails to parse.

use std::{borrow::Cow, fmt::Display, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The `jsonrpc: "2.0"` version marker. Deserialization rejects any other
/// version string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported JSON-RPC version: {version}"
            )))
        }
    }
}

/// A JSON-RPC id: a JSON string or number, unique within a session for the
/// lifetime of an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(i64),
    String(Arc<str>),
}

pub type RequestId = NumberOrString;

impl Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => Display::fmt(n, f),
            NumberOrString::String(s) => Display::fmt(s, f),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.into())
    }
}

/// A request: carries both `method` and `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A notification: `method` without `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful response: `id` with `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

/// An error response. `id` is `null` for protocol-level errors that could not
/// be attributed to a request, so it is serialized even when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

/// JSON-RPC error codes used on the transport surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Generic bad request: header policy violations, auth failures,
    /// unsupported methods.
    pub const BAD_REQUEST: Self = Self(-32000);
    /// The supplied `Mcp-Session-Id` does not match any live session.
    pub const SESSION_NOT_FOUND: Self = Self(-32001);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const PARSE_ERROR: Self = Self(-32700);
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Any JSON-RPC 2.0 message. Untagged: the variant is inferred from which of
/// the discriminating fields are present, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// `method` is present together with `id`.
    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }

    /// `result` or `error` is present.
    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_))
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// The request id of a request, or the id a response answers.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }
}

/// One HTTP POST body: a single message or an ordered batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcBatch {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

impl JsonRpcBatch {
    pub fn messages(&self) -> &[JsonRpcMessage] {
        match self {
            JsonRpcBatch::Single(message) => std::slice::from_ref(message),
            JsonRpcBatch::Batch(messages) => messages,
        }
    }

    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            JsonRpcBatch::Single(message) => vec![message],
            JsonRpcBatch::Batch(messages) => messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    /// At least one message has both `method` and `id`.
    pub fn has_requests(&self) -> bool {
        self.messages().iter().any(JsonRpcMessage::is_request)
    }

    /// Every message is a notification or a response.
    pub fn only_notifications_or_responses(&self) -> bool {
        self.messages()
            .iter()
            .all(|m| m.is_notification() || m.is_response())
    }

    /// Some message is an `initialize` request.
    pub fn contains_initialize(&self) -> bool {
        self.messages()
            .iter()
            .any(|m| m.method() == Some("initialize"))
    }
}

impl From<JsonRpcMessage> for JsonRpcBatch {
    fn from(message: JsonRpcMessage) -> Self {
        JsonRpcBatch::Single(message)
    }
}

impl From<Vec<JsonRpcMessage>> for JsonRpcBatch {
    fn from(messages: Vec<JsonRpcMessage>) -> Self {
        JsonRpcBatch::Batch(messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_discrimination() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "echo"}
        }))
        .unwrap();
        assert!(message.is_request());
        assert_eq!(message.method(), Some("tools/call"));
        assert_eq!(message.request_id(), Some(&NumberOrString::Number(1)));
    }

    #[test]
    fn test_notification_discrimination() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(message.is_notification());
        assert!(!message.is_request());
        assert!(message.request_id().is_none());
    }

    #[test]
    fn test_response_discrimination() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "result": {}
        }))
        .unwrap();
        assert!(message.is_response());
        assert_eq!(message.request_id(), Some(&NumberOrString::String("abc".into())));
    }

    #[test]
    fn test_error_discrimination() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32000, "message": "Bad Request"}
        }))
        .unwrap();
        match message {
            JsonRpcMessage::Error(e) => {
                assert_eq!(e.error.code, ErrorCode::BAD_REQUEST);
                assert!(e.id.is_none());
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_wrong_version() {
        let result: Result<JsonRpcMessage, _> = serde_json::from_value(json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": "ping"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_error_envelope_serializes_null_id() {
        let envelope = JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id: None,
            error: ErrorData::new(ErrorCode::PARSE_ERROR, "Parse error", None),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["code"], -32700);
    }

    #[test]
    fn test_batch_roundtrip() {
        let batch: JsonRpcBatch = serde_json::from_value(json!([
            {"jsonrpc": "2.0", "id": 1, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/progress"}
        ]))
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.has_requests());
        assert!(!batch.only_notifications_or_responses());

        let single: JsonRpcBatch = serde_json::from_value(json!(
            {"jsonrpc": "2.0", "method": "notifications/initialized"}
        ))
        .unwrap();
        assert_eq!(single.len(), 1);
        assert!(single.only_notifications_or_responses());
    }

    #[test]
    fn test_contains_initialize() {
        let batch: JsonRpcBatch = serde_json::from_value(json!(
            {"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}
        ))
        .unwrap();
        assert!(batch.contains_initialize());
        assert!(batch.has_requests());
    }
}
