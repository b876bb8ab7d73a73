//! Error types for the bridge

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error kinds
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// No transport to the native process
    #[error("DLL is not connected")]
    Disconnected,

    /// Initial connection did not complete in time
    #[error("Connection timeout after {0} ms")]
    ConnectionTimeout(u64),

    /// No reply within the call's own deadline
    #[error("Call timed out after {0} ms")]
    CallTimeout(u64),

    /// Transport write failure or webhook connection failure
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Unknown function name
    #[error("Invalid function: {0}")]
    InvalidFunction(String),

    /// Malformed registration or argument
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Name already taken in the external registry
    #[error("Function already registered: {0}")]
    AlreadyRegistered(String),

    /// Empty or missing script body
    #[error("Invalid script: {0}")]
    InvalidScript(String),

    /// Webhook answered with a non-2xx status
    #[error("Call failed with status {status}: {body}")]
    CallFailed { status: u16, body: String },

    /// Unexpected failure anywhere in the path
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the native side, code preserved verbatim
    #[error("{0}")]
    Remote(ErrorPayload),
}

impl BridgeError {
    /// Wire code surfaced to the route layer and the native side
    pub fn code(&self) -> &str {
        match self {
            BridgeError::Disconnected | BridgeError::ConnectionTimeout(_) => {
                error_codes::DLL_DISCONNECTED
            }
            BridgeError::CallTimeout(_) => error_codes::CALL_TIMEOUT,
            BridgeError::NetworkError(_) => error_codes::NETWORK_ERROR,
            BridgeError::InvalidFunction(_) => error_codes::INVALID_FUNCTION,
            BridgeError::InvalidArguments(_) | BridgeError::AlreadyRegistered(_) => {
                error_codes::INVALID_ARGUMENTS
            }
            BridgeError::InvalidScript(_) => error_codes::INVALID_SCRIPT,
            BridgeError::CallFailed { .. } => error_codes::CALL_FAILED,
            BridgeError::InternalError(_)
            | BridgeError::Serialization(_)
            | BridgeError::Protocol(_) => error_codes::INTERNAL_ERROR,
            BridgeError::Remote(payload) => &payload.code,
        }
    }

    /// Serializable form of this error
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            BridgeError::Remote(payload) => payload.clone(),
            BridgeError::CallFailed { status, body } => ErrorPayload {
                code: self.code().to_string(),
                message: self.to_string(),
                details: Some(serde_json::json!({ "status": status, "body": body })),
            },
            _ => ErrorPayload::new(self.code(), self.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<ErrorPayload> for BridgeError {
    fn from(payload: ErrorPayload) -> Self {
        BridgeError::Remote(payload)
    }
}

/// Error as it crosses the native-protocol and route-layer boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Error codes surfaced across the bridge boundary
pub mod error_codes {
    pub const DLL_DISCONNECTED: &str = "DLL_DISCONNECTED";
    pub const CALL_TIMEOUT: &str = "CALL_TIMEOUT";
    pub const CALL_FAILED: &str = "CALL_FAILED";
    pub const INVALID_FUNCTION: &str = "INVALID_FUNCTION";
    pub const INVALID_SCRIPT: &str = "INVALID_SCRIPT";
    pub const INVALID_ARGUMENTS: &str = "INVALID_ARGUMENTS";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}
