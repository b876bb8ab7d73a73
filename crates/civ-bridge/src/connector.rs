//! Connection to the native process
//!
//! The connector owns the single transport connection and a small state
//! machine around it:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (lost) -> ReconnectScheduled -> Connecting ...
//! ```
//!
//! Only the state machine holds the reconnect timer, so at most one
//! reconnect attempt is ever in flight. Each connection gets a reader task
//! that routes inbound frames by their `type` tag and a writer task that
//! owns the write half. Teardown aborts both, so a peer that stops reading
//! can never block a disconnect.

use crate::config::{BridgeConfig, ReconnectPolicy};
use crate::correlator::Correlator;
use crate::external::ExternalCallRequest;
use crate::lua::LuaRegistryUpdate;
use crate::protocol::{NativeMessage, deserialize, preview, reply_outcome, serialize};
use crate::transport::{AsyncReader, AsyncWriter, Connection, Dialer};
use chrono::{DateTime, Utc};
use civ_bridge_core::{BridgeError, GameEventRecord, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

/// Connection transitions published to interested components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Snapshot of connector health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStats {
    pub state: ConnectionState,
    pub connected: bool,
    pub endpoint: String,
    pub reconnect_attempts: u32,
    pub pending_requests: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Receivers for inbound traffic that is not a reply
pub struct InboundRoutes {
    pub game_events: mpsc::UnboundedReceiver<GameEventRecord>,
    pub external_calls: mpsc::UnboundedReceiver<ExternalCallRequest>,
    pub lua_registry: mpsc::UnboundedReceiver<LuaRegistryUpdate>,
}

/// A frame queued for the writer task, acknowledged once written
struct Outgoing {
    data: Vec<u8>,
    written: oneshot::Sender<Result<()>>,
}

struct Inner {
    state: ConnectionState,
    reconnect_attempts: u32,
    /// Bumped on every attach/teardown so stale reader tasks are ignored
    generation: u64,
    auto_reconnect: bool,
    outbox: Option<mpsc::UnboundedSender<Outgoing>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl Inner {
    /// Drop the current connection's tasks and outbox
    fn teardown(&mut self) {
        self.generation += 1;
        self.outbox = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Traffic {
    sent: AtomicU64,
    received: AtomicU64,
}

/// Single connection to the native process
pub struct Connector {
    dialer: Arc<dyn Dialer>,
    connect_timeout: Duration,
    connect_retry_interval: Duration,
    reconnect_policy: ReconnectPolicy,
    default_call_timeout: Duration,
    inner: Mutex<Inner>,
    correlator: Arc<Correlator>,
    router: Router,
    traffic: Arc<Traffic>,
    state_tx: broadcast::Sender<ConnectionEvent>,
}

impl Connector {
    /// Create a connector (not connected yet) and the routes for inbound traffic
    pub fn new(config: &BridgeConfig, dialer: Arc<dyn Dialer>) -> (Arc<Self>, InboundRoutes) {
        let (game_events_tx, game_events) = mpsc::unbounded_channel();
        let (external_calls_tx, external_calls) = mpsc::unbounded_channel();
        let (lua_registry_tx, lua_registry) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(16);

        let correlator = Arc::new(Correlator::new());
        let traffic = Arc::new(Traffic::default());
        let router = Router {
            correlator: correlator.clone(),
            traffic: traffic.clone(),
            game_events: game_events_tx,
            external_calls: external_calls_tx,
            lua_registry: lua_registry_tx,
        };

        let connector = Arc::new(Self {
            dialer,
            connect_timeout: config.connect_timeout,
            connect_retry_interval: config.connect_retry_interval,
            reconnect_policy: config.reconnect.clone(),
            default_call_timeout: config.default_call_timeout,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                generation: 0,
                auto_reconnect: false,
                outbox: None,
                reader_task: None,
                writer_task: None,
                reconnect_task: None,
                last_connected_at: None,
            }),
            correlator,
            router,
            traffic,
            state_tx,
        });

        (
            connector,
            InboundRoutes {
                game_events,
                external_calls,
                lua_registry,
            },
        )
    }

    /// Connect, retrying until connected or `connect_timeout` elapses.
    ///
    /// If an automatic reconnect attempt is already dialing, waits for its
    /// outcome instead of dialing a second time.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                match inner.state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Connecting => {}
                    ConnectionState::ReconnectScheduled | ConnectionState::Disconnected => {
                        if let Some(task) = inner.reconnect_task.take() {
                            task.abort();
                        }
                        inner.state = ConnectionState::Connecting;
                        inner.auto_reconnect = true;
                        break;
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(self.connect_timed_out());
            }
            debug!("Connection attempt in progress; waiting for it");
            tokio::time::sleep_until(deadline.min(Instant::now() + self.connect_retry_interval)).await;
        }

        info!("Connecting to native process at {}", self.dialer.endpoint());
        loop {
            match tokio::time::timeout_at(deadline, self.dialer.dial()).await {
                Ok(Ok(connection)) => {
                    return if self.attach(connection) {
                        Ok(())
                    } else {
                        Err(BridgeError::Disconnected)
                    };
                }
                Ok(Err(e)) => {
                    debug!("Connect attempt failed: {}", e);
                    tokio::time::sleep_until(deadline.min(Instant::now() + self.connect_retry_interval))
                        .await;
                }
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connecting {
                inner.state = ConnectionState::Disconnected;
            }
        }
        Err(self.connect_timed_out())
    }

    /// Tear down the connection, cancel any scheduled reconnect and fail
    /// every pending request. Safe to call repeatedly; never waits on I/O.
    pub async fn disconnect(&self) {
        let was_connected = {
            let mut inner = self.inner.lock();
            inner.auto_reconnect = false;
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.teardown();
            let was_connected = inner.state == ConnectionState::Connected;
            inner.state = ConnectionState::Disconnected;
            was_connected
        };

        self.correlator.fail_all(BridgeError::Disconnected);
        if was_connected {
            info!("Disconnected from native process");
            let _ = self.state_tx.send(ConnectionEvent::Disconnected);
        }
    }

    /// Explicit retry after automatic reconnection gave up
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        info!("Manual reconnect requested");
        self.disconnect().await;
        self.inner.lock().reconnect_attempts = 0;
        self.connect().await
    }

    /// Send a correlated message and wait for its reply.
    ///
    /// `timeout` bounds the whole call, writing the frame included.
    pub async fn send(&self, mut message: NativeMessage, timeout: Option<Duration>) -> Result<Value> {
        let id = message.ensure_correlation_id().ok_or_else(|| {
            BridgeError::InternalError(format!("{} messages carry no correlation id", message.kind()))
        })?;
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let timeout = timeout.unwrap_or(self.default_call_timeout);
        let deadline = Instant::now() + timeout;
        let reply = self.correlator.register(id.clone(), timeout)?;
        match tokio::time::timeout_at(deadline, self.transmit(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.correlator.cancel(&id);
                return Err(e);
            }
            Err(_) => {
                self.correlator.cancel(&id);
                warn!("Request {} could not be written within {:?}", id, timeout);
                return Err(BridgeError::CallTimeout(millis(timeout)));
            }
        }

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Disconnected),
        }
    }

    /// Send without registering for a reply.
    ///
    /// Fails with `NetworkError` if the frame cannot be written within the
    /// default call timeout.
    pub async fn send_no_wait(&self, message: NativeMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        match tokio::time::timeout(self.default_call_timeout, self.transmit(&message)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::NetworkError(format!(
                "{} not written within {} ms",
                message.kind(),
                millis(self.default_call_timeout)
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Subscribe to connected/disconnected transitions
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state_tx.subscribe()
    }

    /// Number of requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn stats(&self) -> ConnectorStats {
        let inner = self.inner.lock();
        ConnectorStats {
            state: inner.state,
            connected: inner.state == ConnectionState::Connected,
            endpoint: self.dialer.endpoint(),
            reconnect_attempts: inner.reconnect_attempts,
            pending_requests: self.correlator.len(),
            messages_sent: self.traffic.sent.load(Ordering::Relaxed),
            messages_received: self.traffic.received.load(Ordering::Relaxed),
            last_connected_at: inner.last_connected_at,
        }
    }

    /// Queue a frame for the writer task and wait until it is written
    async fn transmit(&self, message: &NativeMessage) -> Result<()> {
        let data = serialize(message)?;
        debug!("[Bridge→Native] len={} json={}", data.len(), preview(&data));

        let outbox = self
            .inner
            .lock()
            .outbox
            .clone()
            .ok_or(BridgeError::Disconnected)?;
        let (written, done) = oneshot::channel();
        outbox
            .send(Outgoing { data, written })
            .map_err(|_| BridgeError::Disconnected)?;

        // Sender dropped: the writer task was torn down
        done.await.unwrap_or(Err(BridgeError::Disconnected))
    }

    /// Install a freshly dialed connection; false if it arrived too late
    fn attach(self: &Arc<Self>, connection: Connection) -> bool {
        let Connection { reader, writer } = connection;
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connecting {
                // Disconnected while dialing
                debug!("Discarding connection opened after disconnect");
                return false;
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connected;
            inner.reconnect_attempts = 0;
            inner.last_connected_at = Some(Utc::now());
            inner.reconnect_task = None;

            let (outbox, queue) = mpsc::unbounded_channel();
            inner.outbox = Some(outbox);
            inner.writer_task = Some(tokio::spawn(writer_task(writer, queue, self.traffic.clone())));
            inner.reader_task = Some(tokio::spawn(reader_task(
                Arc::downgrade(self),
                reader,
                inner.generation,
                self.router.clone(),
            )));
        }

        info!("Connected to native process at {}", self.dialer.endpoint());
        let _ = self.state_tx.send(ConnectionEvent::Connected);
        true
    }

    fn connection_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                return;
            }
            // The reader task is the caller; it exits on its own
            inner.reader_task = None;
            inner.teardown();
            inner.state = ConnectionState::Disconnected;
        }

        warn!("Connection to native process lost");
        self.correlator.fail_all(BridgeError::Disconnected);
        let _ = self.state_tx.send(ConnectionEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if !inner.auto_reconnect || inner.state != ConnectionState::Disconnected {
            return;
        }
        if inner.reconnect_attempts >= self.reconnect_policy.max_attempts {
            warn!(
                "Giving up after {} reconnect attempts; waiting for manual reconnect",
                inner.reconnect_attempts
            );
            return;
        }

        let delay = self.reconnect_policy.delay_for(inner.reconnect_attempts);
        inner.reconnect_attempts += 1;
        inner.state = ConnectionState::ReconnectScheduled;
        info!(
            "Reconnect attempt {}/{} in {:?}",
            inner.reconnect_attempts, self.reconnect_policy.max_attempts, delay
        );

        let connector = Arc::downgrade(self);
        inner.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connector) = connector.upgrade() {
                connector.attempt_reconnect().await;
            }
        }));
    }

    async fn attempt_reconnect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::ReconnectScheduled {
                return;
            }
            inner.state = ConnectionState::Connecting;
        }

        match tokio::time::timeout(self.connect_timeout, self.dialer.dial()).await {
            Ok(Ok(connection)) => {
                self.attach(connection);
            }
            Ok(Err(e)) => self.reconnect_failed(e),
            Err(_) => self.reconnect_failed(BridgeError::ConnectionTimeout(millis(self.connect_timeout))),
        }
    }

    fn reconnect_failed(self: &Arc<Self>, error: BridgeError) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connecting {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.reconnect_task = None;
        }
        warn!("Reconnect attempt failed: {}", error);
        self.schedule_reconnect();
    }

    fn connect_timed_out(&self) -> BridgeError {
        let millis = millis(self.connect_timeout);
        error!("Could not connect to {} within {} ms", self.dialer.endpoint(), millis);
        BridgeError::ConnectionTimeout(millis)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Dispatches inbound messages by type
#[derive(Clone)]
struct Router {
    correlator: Arc<Correlator>,
    traffic: Arc<Traffic>,
    game_events: mpsc::UnboundedSender<GameEventRecord>,
    external_calls: mpsc::UnboundedSender<ExternalCallRequest>,
    lua_registry: mpsc::UnboundedSender<LuaRegistryUpdate>,
}

impl Router {
    fn route(&self, message: NativeMessage) {
        self.traffic.received.fetch_add(1, Ordering::Relaxed);
        match message {
            NativeMessage::LuaResponse {
                id,
                success,
                result,
                error,
            }
            | NativeMessage::ExternalResponse {
                id,
                success,
                result,
                error,
            } => {
                self.correlator
                    .complete(&id, reply_outcome(success, result, error));
            }
            NativeMessage::GameEvent {
                id,
                event,
                payload,
                extra_payload,
                visibility,
            } => {
                let record = GameEventRecord {
                    id,
                    event,
                    payload,
                    extra_payload,
                    visibility,
                    timestamp: Utc::now(),
                };
                if self.game_events.send(record).is_err() {
                    debug!("No event consumer; dropping game event");
                }
            }
            NativeMessage::ExternalCall {
                function,
                args,
                id,
                is_async,
            } => {
                let call = ExternalCallRequest {
                    function,
                    args,
                    id,
                    is_async,
                };
                if let Err(e) = self.external_calls.send(call) {
                    warn!("No external gateway; dropping reverse call {}", e.0.id);
                }
            }
            NativeMessage::LuaRegister {
                function,
                description,
            } => {
                let _ = self.lua_registry.send(LuaRegistryUpdate::Register {
                    name: function,
                    description,
                });
            }
            NativeMessage::LuaUnregister { function } => {
                let _ = self
                    .lua_registry
                    .send(LuaRegistryUpdate::Unregister { name: function });
            }
            other => {
                warn!("Dropping unexpected {} message from native side", other.kind());
            }
        }
    }
}

/// Background reader for one connection
///
/// Reads frames until the transport fails, then reports the loss to the
/// connector (if it still exists and this connection is still current).
async fn reader_task(
    connector: Weak<Connector>,
    mut reader: Box<dyn AsyncReader>,
    generation: u64,
    router: Router,
) {
    loop {
        match reader.read_message().await {
            Ok(data) => {
                debug!("[Native→Bridge] len={} json={}", data.len(), preview(&data));
                match deserialize(&data) {
                    Ok(message) => router.route(message),
                    Err(e) => warn!("Dropping unrecognized message: {}", e),
                }
            }
            Err(e) => {
                debug!("Reader task stopping: {}", e);
                break;
            }
        }
    }

    if let Some(connector) = connector.upgrade() {
        connector.connection_lost(generation);
    }
}

/// Background writer for one connection; frames go out in queue order
async fn writer_task(
    mut writer: Box<dyn AsyncWriter>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    traffic: Arc<Traffic>,
) {
    while let Some(Outgoing { data, written }) = queue.recv().await {
        let result = writer.write_message(&data).await;
        match &result {
            Ok(()) => {
                traffic.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!("Write to native process failed: {}", e),
        }
        // Caller may have given up waiting
        let _ = written.send(result);
    }
}
