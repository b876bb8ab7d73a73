//! Lua gateway
//!
//! Thin call/batch/execute façade over the connector, plus a passive registry
//! of Lua functions the native side has announced. The registry is only
//! mutated by inbound announcements and is kept for discovery.

use crate::connector::Connector;
use crate::protocol::NativeMessage;
use chrono::Utc;
use civ_bridge_core::{BridgeError, CallResult, LuaFunction, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Registry announcement from the native side
#[derive(Debug, Clone, PartialEq)]
pub enum LuaRegistryUpdate {
    Register {
        name: String,
        description: Option<String>,
    },
    Unregister {
        name: String,
    },
}

/// One entry of a batched call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LuaCall {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl LuaCall {
    pub fn new(function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }
}

/// Gateway for calling into the native Lua environment
pub struct LuaGateway {
    connector: Arc<Connector>,
    registry: Mutex<BTreeMap<String, LuaFunction>>,
}

impl LuaGateway {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self {
            connector,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    /// Call a Lua function by name
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.connector
            .send(
                NativeMessage::LuaCall {
                    id: String::new(),
                    function: function.to_string(),
                    args,
                },
                None,
            )
            .await
    }

    /// Run a Lua chunk on the native side
    pub async fn execute_script(&self, script: &str) -> Result<Value> {
        if script.trim().is_empty() {
            return Err(BridgeError::InvalidScript("script body is empty".into()));
        }
        self.connector
            .send(
                NativeMessage::LuaExecute {
                    id: String::new(),
                    script: script.to_string(),
                },
                None,
            )
            .await
    }

    /// Issue every call independently; results come back in input order
    pub async fn call_batch(&self, calls: Vec<LuaCall>) -> Vec<CallResult> {
        let count = calls.len();
        let mut tasks = JoinSet::new();
        for (index, call) in calls.into_iter().enumerate() {
            let connector = self.connector.clone();
            tasks.spawn(async move {
                let outcome = connector
                    .send(
                        NativeMessage::LuaCall {
                            id: String::new(),
                            function: call.function,
                            args: call.args,
                        },
                        None,
                    )
                    .await;
                (index, outcome)
            });
        }

        let mut results: Vec<Option<CallResult>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => results[index] = Some(CallResult::from(outcome)),
                Err(e) => error!("Batch call task failed: {}", e),
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    CallResult::failure(&BridgeError::InternalError(
                        "batch call did not complete".into(),
                    ))
                })
            })
            .collect()
    }

    /// Names of announced Lua functions
    pub fn get_functions(&self) -> Vec<String> {
        self.registry.lock().keys().cloned().collect()
    }

    /// Announced Lua functions with metadata
    pub fn list(&self) -> Vec<LuaFunction> {
        self.registry.lock().values().cloned().collect()
    }

    pub(crate) fn apply(&self, update: LuaRegistryUpdate) {
        match update {
            LuaRegistryUpdate::Register { name, description } => {
                self.register_function(name, description)
            }
            LuaRegistryUpdate::Unregister { name } => self.unregister_function(&name),
        }
    }

    pub(crate) fn register_function(&self, name: String, description: Option<String>) {
        debug!("Lua function announced: {}", name);
        let function = LuaFunction {
            name: name.clone(),
            description,
            registered_at: Utc::now(),
        };
        self.registry.lock().insert(name, function);
    }

    pub(crate) fn unregister_function(&self, name: &str) {
        if self.registry.lock().remove(name).is_some() {
            debug!("Lua function withdrawn: {}", name);
        }
    }

    pub(crate) fn clear_registry(&self) {
        let mut registry = self.registry.lock();
        if !registry.is_empty() {
            info!("Clearing {} announced Lua function(s)", registry.len());
            registry.clear();
        }
    }
}
