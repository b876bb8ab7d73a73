//! Function registrations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Webhook timeout applied when a registration does not name one
pub const DEFAULT_EXTERNAL_TIMEOUT_MS: u64 = 5000;

/// Registration request for an externally served function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalFunctionSpec {
    /// Identifier the native side calls the function by
    pub name: String,
    /// Absolute webhook URL
    pub url: String,
    /// Whether the native side awaits the call asynchronously
    #[serde(rename = "async")]
    pub is_async: bool,
    /// Webhook timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A registered external function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalFunction {
    pub name: String,
    pub url: String,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl ExternalFunction {
    /// Build a registration from an already-validated spec
    pub fn from_spec(spec: ExternalFunctionSpec) -> Self {
        Self {
            name: spec.name,
            url: spec.url,
            is_async: spec.is_async,
            timeout_ms: spec.timeout_ms.unwrap_or(DEFAULT_EXTERNAL_TIMEOUT_MS),
            description: spec.description,
            registered_at: Utc::now(),
        }
    }
}

/// A Lua function announced by the native side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LuaFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}
