//! Test helpers: a scripted native peer on the far end of a memory channel

use crate::config::{BridgeConfig, ReconnectPolicy};
use crate::protocol::{NativeMessage, deserialize, serialize};
use crate::transport::{AsyncReader, AsyncWriter, FrameReader, FrameWriter, MemoryListener};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

/// Short timeouts so paused-clock tests stay readable
pub(crate) fn test_config() -> BridgeConfig {
    BridgeConfig {
        connect_timeout: Duration::from_millis(1000),
        connect_retry_interval: Duration::from_millis(100),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 3,
        },
        max_players: 8,
        ..BridgeConfig::default()
    }
}

/// Stand-in for the native process
pub(crate) struct NativePeer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl NativePeer {
    pub(crate) async fn accept(listener: &mut MemoryListener) -> Self {
        let stream = listener.accept().await.expect("dialer dropped");
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader(read_half),
            writer: FrameWriter(write_half),
        }
    }

    pub(crate) async fn recv(&mut self) -> NativeMessage {
        let data = self
            .reader
            .read_message()
            .await
            .expect("bridge closed the channel");
        deserialize(&data).expect("bridge sent an invalid message")
    }

    /// Receive a `lua_call`/`lua_execute` and return its correlation id
    pub(crate) async fn recv_call_id(&mut self) -> String {
        match self.recv().await {
            NativeMessage::LuaCall { id, .. } | NativeMessage::LuaExecute { id, .. } => id,
            other => panic!("Expected a correlated call, got {:?}", other),
        }
    }

    pub(crate) async fn reply(&mut self, id: &str, result: Value) {
        self.send(&NativeMessage::LuaResponse {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        })
        .await;
    }

    pub(crate) async fn send(&mut self, message: &NativeMessage) {
        let data = serialize(message).expect("serializable message");
        self.send_raw(&data).await;
    }

    pub(crate) async fn send_raw(&mut self, data: &[u8]) {
        self.writer
            .write_message(data)
            .await
            .expect("bridge closed the channel");
    }
}
