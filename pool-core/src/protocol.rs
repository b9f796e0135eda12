use crate::{Result, Error};
use crate::types::{JobParams, StratumError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stratum V1 message structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumMessage {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StratumMessage {
    /// Parse a Stratum message from a line of JSON
    pub fn from_line(line: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(line)
            .map_err(|e| Error::Protocol(format!("Failed to parse Stratum message: {}", e)))?;
        if !message.is_request() {
            return Err(Error::Protocol("Message has no method".to_string()));
        }
        Ok(message)
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Protocol(format!("Failed to serialize Stratum message: {}", e)))
    }

    /// Check if this is a request message
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Reply to a request; `result` and `error` are always both present
    pub fn response(id: Value, result: Value, error: Option<&StratumError>) -> Self {
        Self {
            id,
            method: None,
            params: None,
            result: Some(result),
            error: Some(error.map(StratumError::to_json).unwrap_or(Value::Null)),
        }
    }

    /// Server-initiated notification
    pub fn notification(method: &str, params: Vec<Value>) -> Self {
        Self {
            id: Value::Null,
            method: Some(method.to_string()),
            params: Some(Value::Array(params)),
            result: None,
            error: None,
        }
    }

    pub fn set_difficulty(difficulty: f64) -> Self {
        Self::notification("mining.set_difficulty", vec![serde_json::json!(difficulty)])
    }

    pub fn notify(params: &JobParams) -> Self {
        Self::notification("mining.notify", params.to_notify_params())
    }

    /// Positional parameter as a string
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.as_ref()?.get(index)?.as_str()
    }
}
