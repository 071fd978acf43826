//! IPC Transport Layer
//!
//! This module defines the transport trait the session controller sends
//! control requests through, the framing shared by both ends of the Unix
//! domain socket, and the client-side socket session.

use async_trait::async_trait;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout, Duration};

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Length prefix marking a reply that carries no response at all
const ABSENT_FRAME: u32 = u32::MAX;

/// Default per-operation I/O timeout
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Request encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Message path into a running tunnel process.
///
/// One call carries one encoded request and yields the tunnel's reply, which
/// may legitimately be absent.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn send_message(&self, payload: Vec<u8>) -> IpcResult<Option<Vec<u8>>>;
}

/// Write one frame: a u32 little-endian length prefix followed by the payload.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    payload: Option<&[u8]>,
    io_timeout: Duration,
) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = match payload {
        Some(data) if data.len() > MAX_FRAME_LEN => {
            return Err(IpcError::Protocol(format!(
                "Message too large: {} bytes",
                data.len()
            )));
        }
        Some(data) => data.len() as u32,
        None => ABSENT_FRAME,
    };

    match timeout(io_timeout, writer.write_all(&len.to_le_bytes())).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Write operation timed out".to_string())),
    };

    if let Some(data) = payload {
        match timeout(io_timeout, writer.write_all(data)).await {
            Ok(result) => result?,
            Err(_) => return Err(IpcError::Timeout("Write operation timed out".to_string())),
        };
    }

    match timeout(io_timeout, writer.flush()).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Flush timed out".to_string())),
    };

    Ok(())
}

/// Read one frame written by [`write_frame`].
pub(crate) async fn read_frame<R>(reader: &mut R, io_timeout: Duration) -> IpcResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match timeout(io_timeout, reader.read_exact(&mut len_buf)).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Read operation timed out".to_string())),
    };

    let len = u32::from_le_bytes(len_buf);
    if len == ABSENT_FRAME {
        return Ok(None);
    }

    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    match timeout(io_timeout, reader.read_exact(&mut data)).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Read operation timed out".to_string())),
    };

    Ok(Some(data))
}

/// Control session over a Unix domain socket.
///
/// Each message opens its own connection, so a tunnel process restart between
/// two requests is picked up without reconnect bookkeeping.
#[derive(Debug, Clone)]
pub struct UnixSocketSession {
    socket_path: PathBuf,
    io_timeout: Duration,
}

impl UnixSocketSession {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Override the per-operation I/O timeout
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> IpcResult<UnixStream> {
        match timeout(self.io_timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(result) => result.map_err(|e| {
                IpcError::Connection(format!(
                    "Failed to connect to {}: {}",
                    self.socket_path.display(),
                    e
                ))
            }),
            Err(_) => Err(IpcError::Timeout("Connect timed out".to_string())),
        }
    }
}

#[async_trait]
impl ProviderSession for UnixSocketSession {
    async fn send_message(&self, payload: Vec<u8>) -> IpcResult<Option<Vec<u8>>> {
        let mut stream = self.connect().await?;

        write_frame(&mut stream, Some(&payload), self.io_timeout).await?;
        let reply = read_frame(&mut stream, self.io_timeout).await?;

        if let Err(e) = stream.shutdown().await {
            debug!("Ignoring shutdown error on control socket: {}", e);
        }

        Ok(reply)
    }
}
