//! Connection handling for ChatRelay
//!
//! Manages individual control connections, including:
//! - Stream framing through the protocol decoder
//! - Raw frame writes (forwarded packets are never re-encoded)
//! - Cloneable handles that queue frames for the owning task

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::{CodecError, Decoder, Frame};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A framed control connection
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    stream: S,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Write one already-encoded frame
    pub async fn send_raw(&mut self, frame: &[u8]) -> ConnectionResult<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive a frame (returns None on a clean close)
    ///
    /// Cancel safe: partial reads stay in the internal buffer.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
        }
    }

    /// Shut down the write half
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A handle for queueing frames onto a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    addr: SocketAddr,
    sender: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(addr: SocketAddr, sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Unique id of the underlying connection
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a frame without waiting
    ///
    /// A slow or dead peer fails here instead of stalling the caller.
    pub fn send(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::QueueFull,
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
