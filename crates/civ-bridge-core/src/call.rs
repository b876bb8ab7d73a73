//! Uniform call outcome

use crate::error::{BridgeError, ErrorPayload, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured success/failure result returned across the bridge boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl CallResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: &BridgeError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_payload()),
        }
    }

    /// Back to a `Result`, treating a failure without detail as internal
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.map(BridgeError::from).unwrap_or_else(|| {
                BridgeError::InternalError("failure reported without error detail".into())
            }))
        }
    }
}

impl From<Result<Value>> for CallResult {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => CallResult::ok(value),
            Err(e) => CallResult::failure(&e),
        }
    }
}
