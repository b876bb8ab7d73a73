//! Protocol bridge between the native game process and external consumers
//!
//! This crate provides:
//! - Wire protocol and framed transports (Unix sockets / named pipes)
//! - Connector with reconnection and inbound routing by message type
//! - Correlator for request/reply matching with per-request timeouts
//! - Lua gateway and reverse-RPC gateway for externally served functions
//! - Event batching for push delivery
//! - Per-player auto-pause and manual pause coordination
//! - `BridgeServices`, the context handed to the route layer

pub mod config;
pub mod connector;
pub mod correlator;
pub mod events;
pub mod external;
pub mod lua;
pub mod pause;
pub mod pipe;
pub mod protocol;
pub mod services;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use civ_bridge_core::{
    BridgeError, CallResult, ErrorPayload, EventBatch, ExternalFunction, ExternalFunctionSpec,
    GameEventRecord, LuaFunction, Result, error_codes,
};
pub use config::{BridgeConfig, ReconnectPolicy};
pub use connector::{ConnectionEvent, ConnectionState, Connector, ConnectorStats};
pub use protocol::NativeMessage;
pub use services::{BridgeHealth, BridgeServices};
pub use transport::{AsyncReader, AsyncWriter, Connection, Dialer, MemoryDialer, MemoryListener};
