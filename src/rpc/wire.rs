//! JSON-lines wire format: one request or response document per line.
//!
//! The response envelope is extensible. Methods may attach extra top-level
//! fields; both ends preserve fields they do not understand instead of
//! rejecting them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::TransportError;

/// One request frame: `{"method": <string>, "args": <object>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// One response frame: `{"ok": true, "result": ...}` or
/// `{"ok": false, "error": ...}`, plus any extra top-level fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
            extra: Map::new(),
        }
    }

    /// Collapse the envelope into the call outcome.
    pub fn into_result(self) -> Result<Value, TransportError> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(TransportError::Remote {
                message: self
                    .error
                    .unwrap_or_else(|| "unspecified remote error".to_string()),
            })
        }
    }
}

/// Serialize one frame as a single newline-terminated line.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, TransportError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Parse one received line into a frame.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, TransportError> {
    serde_json::from_str(line.trim()).map_err(|e| TransportError::Malformed {
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_round_trip() {
        let request = Request::new("find", json!({"name": "OK"}));
        let line = encode_line(&request).unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.trim().contains('\n'), "one document per line");
        let back: Request = decode_line(&line).unwrap();
        assert_eq!(back.method, "find");
        assert_eq!(back.args["name"], "OK");
    }

    #[test]
    fn test_request_args_default_to_null() {
        let back: Request = decode_line(r#"{"method":"focus"}"#).unwrap();
        assert_eq!(back.method, "focus");
        assert!(back.args.is_null());
    }

    #[test]
    fn test_response_envelope_keeps_unknown_fields() {
        let line = r#"{"ok":true,"result":"el-3","elapsed_ms":12,"session":"s1"}"#;
        let response: Response = decode_line(line).unwrap();
        assert!(response.ok);
        assert_eq!(response.extra["elapsed_ms"], 12);
        assert_eq!(response.extra["session"], "s1");
        let reencoded = encode_line(&response).unwrap();
        assert!(reencoded.contains("elapsed_ms"));
    }

    #[test]
    fn test_error_response_becomes_remote_fault() {
        let response = Response::failure("unknown method 'bogus'");
        let err = response.into_result().unwrap_err();
        assert!(err.to_string().contains("unknown method 'bogus'"));
    }

    #[test]
    fn test_success_without_result_is_null() {
        let response: Response = decode_line(r#"{"ok":true}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_malformed_line_is_malformed_fault() {
        let err = decode_line::<Request>("{not json").unwrap_err();
        assert!(err.to_string().contains("malformed message"));
    }
}
