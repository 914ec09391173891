//! Response payloads.
//!
//! Structured responses are JSON objects carrying either `result` or `error`.

use serde::Serialize;
use serde_json::{Value, json};

use super::codec::{JSON_CONTENT_TYPE, PNG_CONTENT_TYPE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Response {
    /// `200` with `{"result": value}`.
    pub fn result(value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        Self::json(200, &json!({ "result": value }))
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &json!({ "error": message.into() }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::error(404, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(500, message)
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: value.to_string().into_bytes(),
        }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::bytes(200, PNG_CONTENT_TYPE, bytes)
    }

    pub fn bytes(status: u16, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_wraps_value() {
        let response = Response::result(true);
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, JSON_CONTENT_TYPE);
        assert_eq!(response.body, br#"{"result":true}"#);
    }

    #[test]
    fn error_carries_message_and_status() {
        let response = Response::not_found("path not found");
        assert_eq!(response.status, 404);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "path not found");
        assert!(body.get("result").is_none());
    }
}
