//! Wire envelopes.
//!
//! ```text
//! request: {"m": "<signature>", "a": [<value>, ...]}
//! reply:   {"r": <value>} | {"e": <status>} | {}
//! ```
//!
//! Each is a single flat JSON object; framing is the transport's concern.
//! Anything else, including a JSON array in field order, is malformed.

use crate::config::WireConfig;
use crate::error::{DynRpcError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parse `text` as one JSON object.
fn parse_object(what: &'static str, text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(text).map_err(|e| DynRpcError::parse(what, e))? {
        Value::Object(object) => Ok(object),
        _ => Err(DynRpcError::malformed(what, "expected a JSON object")),
    }
}

/// Request envelope: the method signature plus one value per STANDARD argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "m")]
    pub method: String,
    #[serde(rename = "a", default)]
    pub args: Vec<Value>,
}

impl CallEnvelope {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Parse request text. A payload without a string `m` is malformed.
    pub fn parse(text: &str) -> Result<Self> {
        let object = parse_object("request", text)?;
        if !object.get(WireConfig::METHOD_FIELD).is_some_and(Value::is_string) {
            return Err(DynRpcError::malformed(
                "request",
                format!("missing string '{}' field", WireConfig::METHOD_FIELD),
            ));
        }
        if object.get(WireConfig::ARGS_FIELD).is_some_and(|args| !args.is_array()) {
            return Err(DynRpcError::malformed(
                "request",
                format!("'{}' must be an array", WireConfig::ARGS_FIELD),
            ));
        }
        serde_json::from_value(Value::Object(object)).map_err(|e| DynRpcError::parse("request", e))
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DynRpcError::parse("request", e))
    }
}

/// Reply envelope.
///
/// `error` holds the native function's own non-zero status; `result` is only
/// present when the call succeeded and produced a value. Both absent means
/// success without a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<i32>,
}

impl ReplyEnvelope {
    /// Reply for a call that returned status 0.
    pub fn success(result: Option<Value>) -> Self {
        Self {
            result,
            error: None,
        }
    }

    /// Reply for a call that returned a non-zero status.
    pub fn failure(status: i32) -> Self {
        Self {
            result: None,
            error: Some(status),
        }
    }

    /// Parse reply text: an object carrying either a result or a non-zero
    /// status, never both.
    pub fn parse(text: &str) -> Result<Self> {
        let object = parse_object("reply", text)?;
        if object.contains_key(WireConfig::RESULT_FIELD) && object.contains_key(WireConfig::ERROR_FIELD) {
            return Err(DynRpcError::malformed(
                "reply",
                format!(
                    "carries both '{}' and '{}'",
                    WireConfig::RESULT_FIELD,
                    WireConfig::ERROR_FIELD
                ),
            ));
        }
        let envelope: Self =
            serde_json::from_value(Value::Object(object)).map_err(|e| DynRpcError::parse("reply", e))?;
        if envelope.error == Some(WireConfig::STATUS_OK) {
            return Err(DynRpcError::malformed(
                "reply",
                format!("'{}' must carry a non-zero status", WireConfig::ERROR_FIELD),
            ));
        }
        Ok(envelope)
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DynRpcError::parse("reply", e))
    }

    /// Status carried by the reply: the `e` value, or 0 when absent.
    pub fn status(&self) -> i32 {
        self.error.unwrap_or(WireConfig::STATUS_OK)
    }
}
