//! Named channel transport to the native process
//!
//! On Windows this is a named pipe (`\\.\pipe\<name>`); on Unix the same
//! name maps to a domain socket under `/tmp`.

use crate::transport::{Connection, Dialer};
use async_trait::async_trait;
use civ_bridge_core::{BridgeError, Result};

/// Resolve a channel name to a platform path
pub fn pipe_path(name: &str) -> String {
    #[cfg(windows)]
    {
        format!(r"\\.\pipe\{}", name)
    }
    #[cfg(not(windows))]
    {
        format!("/tmp/{}.sock", name)
    }
}

/// Dialer for the native process's named channel
pub struct NamedPipeDialer {
    path: String,
}

impl NamedPipeDialer {
    /// Dialer for a channel name (see [`pipe_path`])
    pub fn new(name: &str) -> Self {
        Self {
            path: pipe_path(name),
        }
    }

    /// Dialer for an explicit path
    pub fn with_path(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Dialer for NamedPipeDialer {
    async fn dial(&self) -> Result<Connection> {
        open(&self.path)
            .await
            .map_err(|e| BridgeError::NetworkError(format!("Failed to connect to {}: {}", self.path, e)))
    }

    fn endpoint(&self) -> String {
        self.path.clone()
    }
}

#[cfg(unix)]
async fn open(path: &str) -> std::io::Result<Connection> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Connection::from_stream(stream))
}

#[cfg(windows)]
async fn open(path: &str) -> std::io::Result<Connection> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new().open(path)?;
    Ok(Connection::from_stream(client))
}

#[cfg(not(any(unix, windows)))]
async fn open(path: &str) -> std::io::Result<Connection> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("no named channel support for {}", path),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::{AsyncReader, AsyncWriter, FrameReader};

    #[tokio::test]
    async fn test_dials_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("native.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let dialer = NamedPipeDialer::with_path(path.to_string_lossy().to_string());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut conn = dialer.dial().await.unwrap();
        let server = accept.await.unwrap();

        conn.writer.write_message(b"{}").await.unwrap();
        let mut reader = FrameReader(server);
        assert_eq!(reader.read_message().await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_missing_socket_is_network_error() {
        let dialer = NamedPipeDialer::with_path("/nonexistent/civ-bridge-test.sock");
        assert!(matches!(
            dialer.dial().await,
            Err(BridgeError::NetworkError(_))
        ));
    }
}
