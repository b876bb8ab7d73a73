//! External function gateway
//!
//! Reverse RPC: the native side calls a function by name, and the bridge
//! fulfils it by POSTing to the webhook an external service registered
//! earlier. Every reverse call gets exactly one correlated
//! `external_response`, success or failure.

use crate::connector::Connector;
use crate::protocol::NativeMessage;
use civ_bridge_core::{BridgeError, ExternalFunction, ExternalFunctionSpec, Result};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Reverse call received from the native side
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCallRequest {
    pub function: String,
    pub args: Value,
    pub id: String,
    pub is_async: bool,
}

/// Registry and dispatcher for webhook-backed functions
pub struct ExternalGateway {
    connector: Arc<Connector>,
    client: Client,
    functions: Mutex<HashMap<String, ExternalFunction>>,
}

impl ExternalGateway {
    /// Webhooks are local services, so system proxies are bypassed
    pub fn new(connector: Arc<Connector>) -> Self {
        let client = Client::builder().no_proxy().build().unwrap_or_else(|e| {
            warn!("Falling back to default HTTP client: {}", e);
            Client::new()
        });
        Self::with_client(connector, client)
    }

    /// Gateway with a preconfigured HTTP client
    pub fn with_client(connector: Arc<Connector>, client: Client) -> Self {
        Self {
            connector,
            client,
            functions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a webhook-backed function and announce it to the native side
    pub async fn register(&self, spec: ExternalFunctionSpec) -> Result<ExternalFunction> {
        validate(&spec)?;

        let function = ExternalFunction::from_spec(spec);
        {
            let mut functions = self.functions.lock();
            if functions.contains_key(&function.name) {
                return Err(BridgeError::AlreadyRegistered(function.name));
            }
            functions.insert(function.name.clone(), function.clone());
        }
        info!("Registered external function {} -> {}", function.name, function.url);

        if let Err(e) = self.connector.send_no_wait(announcement(&function)).await {
            debug!("Native side not told about {} yet: {}", function.name, e);
        }
        Ok(function)
    }

    /// Remove a registration and withdraw it from the native side
    pub async fn unregister(&self, name: &str) -> Result<()> {
        if self.functions.lock().remove(name).is_none() {
            return Err(BridgeError::InvalidFunction(format!(
                "{} is not registered",
                name
            )));
        }
        info!("Unregistered external function {}", name);

        let message = NativeMessage::ExternalUnregister {
            name: name.to_string(),
        };
        if let Err(e) = self.connector.send_no_wait(message).await {
            debug!("Native side not told about removal of {}: {}", name, e);
        }
        Ok(())
    }

    /// All registrations, sorted by name
    pub fn list(&self) -> Vec<ExternalFunction> {
        let mut functions: Vec<ExternalFunction> =
            self.functions.lock().values().cloned().collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }

    pub fn get(&self, name: &str) -> Option<ExternalFunction> {
        self.functions.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.lock().is_empty()
    }

    /// Announce every registration again; returns how many were delivered
    pub async fn reregister_all(&self) -> usize {
        let functions = self.list();
        let mut delivered = 0;
        for function in &functions {
            match self.connector.send_no_wait(announcement(function)).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to re-register {}: {}", function.name, e),
            }
        }
        if !functions.is_empty() {
            info!(
                "Re-registered {}/{} external function(s)",
                delivered,
                functions.len()
            );
        }
        delivered
    }

    /// Service a reverse call and send its correlated reply
    pub async fn handle_call(&self, call: ExternalCallRequest) {
        debug!("Reverse call {} -> {}", call.id, call.function);
        let outcome = self.invoke(&call).await;
        if let Err(e) = &outcome {
            warn!("External call {} ({}) failed: {}", call.id, call.function, e);
        }

        let reply = NativeMessage::external_response(call.id.clone(), outcome);
        if let Err(e) = self.connector.send_no_wait(reply).await {
            error!("Could not deliver reply for external call {}: {}", call.id, e);
        }
    }

    async fn invoke(&self, call: &ExternalCallRequest) -> Result<Value> {
        let function = self
            .get(&call.function)
            .ok_or_else(|| BridgeError::InvalidFunction(format!("{} is not registered", call.function)))?;

        let response = self
            .client
            .post(&function.url)
            .timeout(Duration::from_millis(function.timeout_ms))
            .json(&json!({ "args": call.args, "id": call.id }))
            .send()
            .await
            .map_err(|e| classify(e, function.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::CallFailed {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| classify(e, function.timeout_ms))?;
        Ok(match body {
            Value::Object(mut map) => match map.remove("result") {
                Some(result) => result,
                None => Value::Object(map),
            },
            other => other,
        })
    }
}

fn announcement(function: &ExternalFunction) -> NativeMessage {
    NativeMessage::ExternalRegister {
        name: function.name.clone(),
        is_async: function.is_async,
        timeout: function.timeout_ms,
        description: function.description.clone(),
    }
}

/// Map a client-side failure onto the error taxonomy
fn classify(err: reqwest::Error, timeout_ms: u64) -> BridgeError {
    if err.is_timeout() {
        BridgeError::CallTimeout(timeout_ms)
    } else if err.is_connect() {
        BridgeError::NetworkError(err.to_string())
    } else if err.is_decode() {
        BridgeError::InternalError(format!("webhook returned invalid JSON: {}", err))
    } else {
        BridgeError::InternalError(err.to_string())
    }
}

fn validate(spec: &ExternalFunctionSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(BridgeError::InvalidArguments("name is required".into()));
    }
    if !is_identifier(&spec.name) {
        return Err(BridgeError::InvalidArguments(format!(
            "name must be letters, digits or underscores and not start with a digit: {}",
            spec.name
        )));
    }
    if let Err(e) = Url::parse(&spec.url) {
        return Err(BridgeError::InvalidArguments(format!(
            "url must be an absolute URL ({}): {}",
            e, spec.url
        )));
    }
    if spec.timeout_ms == Some(0) {
        return Err(BridgeError::InvalidArguments(
            "timeout must be a positive integer".into(),
        ));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
