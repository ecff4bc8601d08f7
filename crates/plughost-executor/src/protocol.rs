//! Wire format between the host and a plugin process.
//!
//! Newline-delimited JSON on the plugin's stdin/stdout.  The host sends a
//! [`Request`] per line; the plugin answers each with exactly one
//! [`Response`] carrying the same `id`.  Anything else the plugin prints on
//! stdout is ignored by the host.
//!
//! ```text
//! -> {"id":1,"method":"initialize","params":{"plugin_id":"echo","config":null}}
//! <- {"id":1,"result":{"success":true,"methods":["process","cleanup"]}}
//! -> {"id":2,"method":"process","params":{"procedure":"echo.run","input":{},"context":{}}}
//! <- {"id":2,"result":{"success":true,"data":{}}}
//! <- {"id":2,"error":"message"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake method, always the first call.
pub const INITIALIZE: &str = "initialize";

/// Generic dispatch method: `{procedure, input, context}`.
pub const PROCESS: &str = "process";

/// Optional farewell before the host closes stdin.
pub const CLEANUP: &str = "cleanup";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(Value::String(message.into())),
        }
    }

    /// `Ok(result)` or `Err(message)`.  A missing result reads as `null`.
    pub fn into_outcome(self) -> std::result::Result<Value, String> {
        match self.error {
            Some(error) => Err(error_message(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Payload of a successful `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializeReply {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Serialize a message as one protocol line, newline included.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line from a plugin.  Returns `None` for blank lines and for
/// output that is not a response (log lines, stray prints).
pub fn decode_response(line: &str) -> Option<Response> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn error_message(error: Value) -> String {
    match error {
        Value::String(s) => s,
        Value::Object(ref map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_owned(),
            None => error.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_line_is_newline_terminated() {
        let line = encode(&Request::new(7, PROCESS, json!({"procedure": "x"}))).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Request = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.method, "process");
    }

    #[test]
    fn noise_is_not_a_response() {
        assert!(decode_response("").is_none());
        assert!(decode_response("loading model...").is_none());
        assert!(decode_response(r#"{"level":"info"}"#).is_none());
    }

    #[test]
    fn error_forms_are_flattened() {
        let plain = decode_response(r#"{"id":1,"error":"boom"}"#).unwrap();
        assert_eq!(plain.into_outcome(), Err("boom".to_owned()));

        let object = decode_response(r#"{"id":2,"error":{"message":"nope","code":3}}"#).unwrap();
        assert_eq!(object.into_outcome(), Err("nope".to_owned()));
    }

    #[test]
    fn null_result_is_ok() {
        let response = decode_response(r#"{"id":3,"result":null}"#).unwrap();
        assert_eq!(response.into_outcome(), Ok(Value::Null));
    }

    #[test]
    fn initialize_reply_defaults_to_success() {
        let reply: InitializeReply = serde_json::from_value(json!({"methods": ["process"]})).unwrap();
        assert!(reply.success);
        assert_eq!(reply.methods, vec!["process".to_owned()]);
    }
}
