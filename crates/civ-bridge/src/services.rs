//! Service context handed to the route layer
//!
//! `BridgeServices` owns one instance of every component and the background
//! tasks that couple them: inbound routes feed the gateways and the event
//! broadcaster, and connection transitions trigger re-registration, pause
//! resync and the synthesized `dll_connected`/`dll_disconnected` events.

use crate::config::BridgeConfig;
use crate::connector::{ConnectionEvent, ConnectionState, Connector, ConnectorStats, InboundRoutes};
use crate::events::{BroadcasterStats, EventBroadcaster};
use crate::external::ExternalGateway;
use crate::lua::{LuaCall, LuaGateway};
use crate::pause::{PauseCoordinator, PauseLock, pause_lock_for_host};
use crate::pipe::NamedPipeDialer;
use crate::transport::Dialer;
use civ_bridge_core::{
    CallResult, EventBatch, ExternalFunction, ExternalFunctionSpec, GameEventRecord, Result,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health snapshot for status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeHealth {
    pub connection: ConnectorStats,
    pub external_functions: usize,
    pub lua_functions: usize,
    pub paused_players: Vec<u32>,
    pub manually_paused: bool,
    pub events: BroadcasterStats,
}

/// Every bridge component, constructed once per process
pub struct BridgeServices {
    connector: Arc<Connector>,
    lua: Arc<LuaGateway>,
    external: Arc<ExternalGateway>,
    events: Arc<EventBroadcaster>,
    pause: Arc<PauseCoordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeServices {
    /// Services talking to the named pipe from `config`
    pub fn new(config: BridgeConfig) -> Self {
        let dialer = Arc::new(NamedPipeDialer::new(&config.pipe_name));
        let lock = pause_lock_for_host(&config.pause_lock_name);
        Self::with_parts(config, dialer, lock)
    }

    /// Services over an arbitrary dialer and pause lock
    pub fn with_parts(config: BridgeConfig, dialer: Arc<dyn Dialer>, lock: Box<dyn PauseLock>) -> Self {
        let (connector, routes) = Connector::new(&config, dialer);
        let lua = Arc::new(LuaGateway::new(connector.clone()));
        let external = Arc::new(ExternalGateway::new(connector.clone()));
        let events = EventBroadcaster::new(
            config.batch_window,
            config.batch_size,
            config.event_channel_capacity,
        );
        let pause = Arc::new(PauseCoordinator::new(connector.clone(), config.max_players, lock));

        let services = Self {
            connector,
            lua,
            external,
            events,
            pause,
            tasks: Mutex::new(Vec::new()),
        };
        services.spawn_pumps(routes);
        services
    }

    fn spawn_pumps(&self, routes: InboundRoutes) {
        let InboundRoutes {
            mut game_events,
            mut external_calls,
            mut lua_registry,
        } = routes;
        let mut tasks = self.tasks.lock();

        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = game_events.recv().await {
                events.broadcast(event, false);
            }
        }));

        let external = self.external.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(call) = external_calls.recv().await {
                let external = external.clone();
                tokio::spawn(async move { external.handle_call(call).await });
            }
        }));

        let lua = self.lua.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(update) = lua_registry.recv().await {
                lua.apply(update);
            }
        }));

        // Subscribe before returning so the first transition is never missed
        let mut states = self.connector.subscribe_state();
        let coupling = self.coupling();
        tasks.push(tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(event) => coupling.apply(event).await,
                    Err(RecvError::Lagged(skipped)) => coupling.catch_up(skipped).await,
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn coupling(&self) -> Coupling {
        Coupling {
            connector: self.connector.clone(),
            lua: self.lua.clone(),
            external: self.external.clone(),
            events: self.events.clone(),
            pause: self.pause.clone(),
        }
    }

    /// Connect to the native process
    pub async fn connect(&self) -> Result<()> {
        self.connector.connect().await
    }

    /// Retry after automatic reconnection gave up
    pub async fn reconnect(&self) -> Result<()> {
        self.connector.reconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub async fn register_external(&self, spec: ExternalFunctionSpec) -> Result<ExternalFunction> {
        self.external.register(spec).await
    }

    pub async fn unregister_external(&self, name: &str) -> Result<()> {
        self.external.unregister(name).await
    }

    pub fn list_external(&self) -> Vec<ExternalFunction> {
        self.external.list()
    }

    /// Call a Lua function and wrap the outcome for the route layer
    pub async fn call_lua(&self, function: &str, args: Vec<Value>) -> CallResult {
        CallResult::from(self.lua.call(function, args).await)
    }

    pub async fn call_lua_batch(&self, calls: Vec<LuaCall>) -> Vec<CallResult> {
        self.lua.call_batch(calls).await
    }

    pub async fn execute_lua_script(&self, script: &str) -> CallResult {
        CallResult::from(self.lua.execute_script(script).await)
    }

    pub fn list_lua_functions(&self) -> Vec<String> {
        self.lua.get_functions()
    }

    pub fn pause_manual(&self) -> bool {
        self.pause.pause_game()
    }

    pub fn resume_manual(&self) -> bool {
        self.pause.resume_game()
    }

    pub async fn register_auto_pause(&self, player_id: u32) -> Result<()> {
        self.pause.register_paused_player(player_id).await
    }

    pub async fn unregister_auto_pause(&self, player_id: u32) -> Result<()> {
        self.pause.unregister_paused_player(player_id).await
    }

    pub async fn clear_auto_pause(&self) -> usize {
        self.pause.clear_paused_players().await
    }

    pub fn list_auto_pause(&self) -> Vec<u32> {
        self.pause.paused_players()
    }

    /// Stream of coalesced event batches
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventBatch> {
        self.events.subscribe()
    }

    pub fn health(&self) -> BridgeHealth {
        BridgeHealth {
            connection: self.connector.stats(),
            external_functions: self.external.len(),
            lua_functions: self.lua.get_functions().len(),
            paused_players: self.pause.paused_players(),
            manually_paused: self.pause.is_manually_paused(),
            events: self.events.stats(),
        }
    }

    /// Disconnect, release the manual pause lock and deliver buffered events
    pub async fn shutdown(&self) {
        info!("Shutting down bridge services");
        self.connector.disconnect().await;
        self.pause.shutdown();
        self.events.shutdown();
    }
}

/// Reacts to connection transitions on behalf of the other components
struct Coupling {
    connector: Arc<Connector>,
    lua: Arc<LuaGateway>,
    external: Arc<ExternalGateway>,
    events: Arc<EventBroadcaster>,
    pause: Arc<PauseCoordinator>,
}

impl Coupling {
    async fn apply(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                let functions = self.external.reregister_all().await;
                let players = self.pause.resync().await;
                debug!(
                    "Resynced {} external function(s) and {} paused player(s)",
                    functions, players
                );
                let endpoint = self.connector.stats().endpoint;
                self.events.broadcast(
                    GameEventRecord::bridge("dll_connected", json!({ "endpoint": endpoint })),
                    true,
                );
            }
            ConnectionEvent::Disconnected => {
                self.pause.clear_local();
                self.lua.clear_registry();
                self.events
                    .broadcast(GameEventRecord::bridge("dll_disconnected", Value::Null), true);
            }
        }
    }

    /// Transitions were missed; act on the state the connector is in now
    async fn catch_up(&self, skipped: u64) {
        let state = self.connector.state();
        warn!(
            "Missed {} connection transition(s); resyncing for {:?}",
            skipped, state
        );
        let event = match state {
            ConnectionState::Connected => ConnectionEvent::Connected,
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::ReconnectScheduled => ConnectionEvent::Disconnected,
        };
        self.apply(event).await;
    }
}

impl Drop for BridgeServices {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
