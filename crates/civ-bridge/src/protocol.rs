//! Wire protocol for bridge <-> native process communication
//!
//! Messages are JSON objects with an internally-tagged `type` field in
//! snake_case, e.g. `{"type":"lua_response","id":"...","success":true}`.
//! Field names follow the native side's conventions (`extraPayload`,
//! `playerID`, `async`), so a few fields are renamed explicitly.

use civ_bridge_core::{BridgeError, ErrorPayload, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages exchanged with the native process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeMessage {
    // === Bridge -> native ===
    /// Invoke a registered Lua function
    LuaCall {
        #[serde(default)]
        id: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Run a Lua chunk
    LuaExecute {
        #[serde(default)]
        id: String,
        script: String,
    },

    /// Announce an externally served function
    ExternalRegister {
        name: String,
        #[serde(rename = "async")]
        is_async: bool,
        timeout: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// Withdraw an externally served function
    ExternalUnregister { name: String },

    /// Reply to a reverse call
    ExternalResponse {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// Add a player to the auto-pause set
    PausePlayer {
        #[serde(rename = "playerID")]
        player_id: u32,
    },

    /// Remove a player from the auto-pause set
    UnpausePlayer {
        #[serde(rename = "playerID")]
        player_id: u32,
    },

    /// Empty the auto-pause set
    ClearPausedPlayers,

    // === Native -> bridge ===
    /// Reply to `lua_call` / `lua_execute`
    LuaResponse {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// A Lua function became callable
    LuaRegister {
        function: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// A Lua function went away
    LuaUnregister { function: String },

    /// Reverse call into an externally served function
    ExternalCall {
        function: String,
        #[serde(default)]
        args: Value,
        id: String,
        #[serde(rename = "async", default)]
        is_async: bool,
    },

    /// Game event for push subscribers
    GameEvent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(
            rename = "extraPayload",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        extra_payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visibility: Option<Value>,
    },
}

impl NativeMessage {
    /// The `type` tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            NativeMessage::LuaCall { .. } => "lua_call",
            NativeMessage::LuaExecute { .. } => "lua_execute",
            NativeMessage::ExternalRegister { .. } => "external_register",
            NativeMessage::ExternalUnregister { .. } => "external_unregister",
            NativeMessage::ExternalResponse { .. } => "external_response",
            NativeMessage::PausePlayer { .. } => "pause_player",
            NativeMessage::UnpausePlayer { .. } => "unpause_player",
            NativeMessage::ClearPausedPlayers => "clear_paused_players",
            NativeMessage::LuaResponse { .. } => "lua_response",
            NativeMessage::LuaRegister { .. } => "lua_register",
            NativeMessage::LuaUnregister { .. } => "lua_unregister",
            NativeMessage::ExternalCall { .. } => "external_call",
            NativeMessage::GameEvent { .. } => "game_event",
        }
    }

    /// Assign a fresh correlation id if the message expects a reply and has none.
    ///
    /// Returns the id, or `None` for message types that are never replied to.
    pub fn ensure_correlation_id(&mut self) -> Option<String> {
        let id = match self {
            NativeMessage::LuaCall { id, .. } | NativeMessage::LuaExecute { id, .. } => id,
            _ => return None,
        };
        if id.is_empty() {
            *id = uuid::Uuid::new_v4().to_string();
        }
        Some(id.clone())
    }

    /// Correlated reply to a reverse call
    pub fn external_response(id: impl Into<String>, outcome: Result<Value>) -> Self {
        let id = id.into();
        match outcome {
            Ok(result) => NativeMessage::ExternalResponse {
                id,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(e) => NativeMessage::ExternalResponse {
                id,
                success: false,
                result: None,
                error: Some(e.to_payload()),
            },
        }
    }
}

/// Interpret the `success`/`result`/`error` triple of a reply
pub fn reply_outcome(success: bool, result: Option<Value>, error: Option<ErrorPayload>) -> Result<Value> {
    if success {
        Ok(result.unwrap_or(Value::Null))
    } else {
        Err(error.map(BridgeError::from).unwrap_or_else(|| {
            BridgeError::InternalError("native side reported failure without error detail".into())
        }))
    }
}

/// Serialize a message to JSON bytes
pub fn serialize(msg: &NativeMessage) -> std::result::Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Deserialize a message from JSON bytes
pub fn deserialize(bytes: &[u8]) -> std::result::Result<NativeMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Short printable prefix of a frame, for traffic logging
pub fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_event_from_native() {
        let json = r#"{"type":"game_event","id":42,"event":"TurnStarted","payload":{"turn":12},"extraPayload":{"era":"Medieval"},"visibility":[1,0,1]}"#;

        match deserialize(json.as_bytes()).unwrap() {
            NativeMessage::GameEvent {
                id,
                event,
                payload,
                extra_payload,
                visibility,
            } => {
                assert_eq!(id, Some(42));
                assert_eq!(event, "TurnStarted");
                assert_eq!(payload["turn"], 12);
                assert_eq!(extra_payload.unwrap()["era"], "Medieval");
                assert!(visibility.is_some());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_external_call_from_native() {
        let json = r#"{"type":"external_call","function":"notify","args":{"text":"hi"},"id":"call-7","async":true}"#;

        match deserialize(json.as_bytes()).unwrap() {
            NativeMessage::ExternalCall {
                function,
                args,
                id,
                is_async,
            } => {
                assert_eq!(function, "notify");
                assert_eq!(args["text"], "hi");
                assert_eq!(id, "call-7");
                assert!(is_async);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_pause_player_wire_format() {
        let bytes = serialize(&NativeMessage::PausePlayer { player_id: 3 }).unwrap();
        let json = String::from_utf8_lossy(&bytes);

        assert!(json.contains("\"type\":\"pause_player\""));
        assert!(json.contains("\"playerID\":3"));

        let bytes = serialize(&NativeMessage::ClearPausedPlayers).unwrap();
        assert_eq!(bytes, br#"{"type":"clear_paused_players"}"#);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type":"teleport_unit","unit":5}"#;
        assert!(deserialize(json.as_bytes()).is_err());
    }

    #[test]
    fn test_correlation_id_assigned_once() {
        let mut msg = NativeMessage::LuaCall {
            id: String::new(),
            function: "GetPlayerGold".into(),
            args: vec![Value::from(0)],
        };
        let first = msg.ensure_correlation_id().unwrap();
        assert!(!first.is_empty());
        assert_eq!(msg.ensure_correlation_id().unwrap(), first);

        let mut caller_supplied = NativeMessage::LuaExecute {
            id: "script-1".into(),
            script: "return 1".into(),
        };
        assert_eq!(caller_supplied.ensure_correlation_id().unwrap(), "script-1");

        assert!(NativeMessage::ClearPausedPlayers.ensure_correlation_id().is_none());
    }

    #[test]
    fn test_failed_reply_keeps_native_error() {
        let err = reply_outcome(
            false,
            None,
            Some(ErrorPayload::new("INVALID_FUNCTION", "no such function")),
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_FUNCTION");

        assert_eq!(reply_outcome(true, None, None).unwrap(), Value::Null);
    }
}
