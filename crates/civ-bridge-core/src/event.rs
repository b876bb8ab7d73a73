//! Game event records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single game event, as delivered to push subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl GameEventRecord {
    /// Event synthesized by the bridge itself
    pub fn bridge(event: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            event: event.into(),
            payload,
            extra_payload: None,
            visibility: None,
            timestamp: Utc::now(),
        }
    }
}

/// One coalesced delivery to push subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub events: Vec<GameEventRecord>,
    pub flushed_at: DateTime<Utc>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
