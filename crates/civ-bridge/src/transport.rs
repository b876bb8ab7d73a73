//! Transport abstractions for the native channel
//!
//! Frames are length-prefixed: 4-byte little-endian length + JSON payload.
//! `FrameReader`/`FrameWriter` implement this over any tokio byte stream,
//! so named pipes, Unix sockets and in-memory duplex streams share one codec.

use async_trait::async_trait;
use civ_bridge_core::{BridgeError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Largest frame accepted from the wire
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Trait for async reading from a transport
#[async_trait]
pub trait AsyncReader: Send {
    /// Read a complete message from the transport
    async fn read_message(&mut self) -> Result<Vec<u8>>;
}

/// Trait for async writing to a transport
#[async_trait]
pub trait AsyncWriter: Send {
    /// Write a complete message to the transport
    async fn write_message(&mut self, data: &[u8]) -> Result<()>;
}

/// Length-prefixed frame reader
pub struct FrameReader<R>(pub R);

#[async_trait]
impl<R> AsyncReader for FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.0
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| BridgeError::NetworkError(format!("Read length failed: {}", e)))?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_LEN {
            return Err(BridgeError::Protocol(format!(
                "Message too large: {} bytes",
                len
            )));
        }

        let mut data = vec![0u8; len];
        self.0
            .read_exact(&mut data)
            .await
            .map_err(|e| BridgeError::NetworkError(format!("Read data failed: {}", e)))?;

        Ok(data)
    }
}

/// Length-prefixed frame writer
pub struct FrameWriter<W>(pub W);

#[async_trait]
impl<W> AsyncWriter for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| BridgeError::Protocol(format!("Message too large: {} bytes", data.len())))?
            .to_le_bytes();
        self.0
            .write_all(&len)
            .await
            .map_err(|e| BridgeError::NetworkError(format!("Write length failed: {}", e)))?;
        self.0
            .write_all(data)
            .await
            .map_err(|e| BridgeError::NetworkError(format!("Write data failed: {}", e)))?;
        self.0
            .flush()
            .await
            .map_err(|e| BridgeError::NetworkError(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// An open channel to the native process, split into halves
pub struct Connection {
    pub reader: Box<dyn AsyncReader>,
    pub writer: Box<dyn AsyncWriter>,
}

impl Connection {
    /// Wrap a bidirectional byte stream in the frame codec
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Box::new(FrameReader(read_half)),
            writer: Box::new(FrameWriter(write_half)),
        }
    }
}

/// Opens fresh connections to the native process
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a new connection
    async fn dial(&self) -> Result<Connection>;

    /// Where this dialer connects to, for logs
    fn endpoint(&self) -> String;
}

const MEMORY_BUFFER: usize = 64 * 1024;

/// In-process dialer backed by duplex streams
///
/// Each successful dial hands the peer end to the paired `MemoryListener`.
pub struct MemoryDialer {
    tx: mpsc::UnboundedSender<DuplexStream>,
    accepting: Arc<AtomicBool>,
    dials: Arc<AtomicUsize>,
}

/// Accepting side of a `MemoryDialer`
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    accepting: Arc<AtomicBool>,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// Create a connected dialer/listener pair
    pub fn pair() -> (MemoryDialer, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let accepting = Arc::new(AtomicBool::new(true));
        let dials = Arc::new(AtomicUsize::new(0));
        (
            MemoryDialer {
                tx,
                accepting: accepting.clone(),
                dials: dials.clone(),
            },
            MemoryListener {
                rx,
                accepting,
                dials,
            },
        )
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BridgeError::NetworkError("connection refused".into()));
        }
        let (client, server) = tokio::io::duplex(MEMORY_BUFFER);
        self.tx
            .send(server)
            .map_err(|_| BridgeError::NetworkError("listener closed".into()))?;
        Ok(Connection::from_stream(client))
    }

    fn endpoint(&self) -> String {
        "memory".into()
    }
}

impl MemoryListener {
    /// Wait for the next dialed connection
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }

    /// Refuse (or resume accepting) future dials
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of dial attempts so far, refused ones included
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}
