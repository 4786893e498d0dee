//! TCP Network Transport Implementation
//!
//! Length-prefixed frame transport for peer links. Every frame is a 4-byte
//! big-endian length followed by that many payload bytes. A connection is
//! split into a [`FrameReader`] and a [`FrameWriter`] so the reader and the
//! writer of a link can live on separate tasks.

use crate::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// Length prefix size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum frame size accepted or sent
    pub max_frame_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Read half of a framed connection
pub struct FrameReader {
    stream: OwnedReadHalf,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    /// Reusable read buffer
    read_buffer: BytesMut,
    pub(crate) bytes_received: u64,
}

/// Write half of a framed connection
pub struct FrameWriter {
    stream: OwnedWriteHalf,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    /// Reusable write buffer
    write_buffer: BytesMut,
    pub(crate) bytes_sent: u64,
}

/// Split a connected stream into its framed halves
pub fn split(stream: TcpStream, config: &TcpConfig) -> Result<(FrameReader, FrameWriter)> {
    // Configure TCP socket
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| TransportError::network_with_source("Failed to get peer address", e))?;

    let (read_half, write_half) = stream.into_split();

    Ok((
        FrameReader {
            stream: read_half,
            peer_addr,
            max_frame_size: config.max_frame_size,
            read_buffer: BytesMut::with_capacity(64 * 1024),
            bytes_received: 0,
        },
        FrameWriter {
            stream: write_half,
            peer_addr,
            max_frame_size: config.max_frame_size,
            write_buffer: BytesMut::with_capacity(64 * 1024),
            bytes_sent: 0,
        },
    ))
}

impl FrameReader {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Receive one frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly between
    /// frames. A close in the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        // Read message length prefix
        let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
        match self.stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(peer = %self.peer_addr, "TCP peer closed connection");
                return Ok(None);
            }
            Err(e) => {
                return Err(TransportError::network_with_source(
                    "Failed to read frame length",
                    e,
                ))
            }
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(TransportError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame_len, self.max_frame_size
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(frame_len, 0);

        self.stream
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to read frame data", e))?;

        self.bytes_received += (FRAME_HEADER_SIZE + frame_len) as u64;

        trace!(
            peer = %self.peer_addr,
            bytes = frame_len,
            total_received = self.bytes_received,
            "Received frame over TCP"
        );

        Ok(Some(self.read_buffer.split_to(frame_len).freeze()))
    }
}

impl FrameWriter {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one frame with its length prefix
    pub async fn send_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_frame_size {
            return Err(TransportError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                data.len(),
                self.max_frame_size
            )));
        }

        self.write_buffer.clear();
        self.write_buffer
            .extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.write_buffer.extend_from_slice(data);

        // Single write call for better performance
        self.stream
            .write_all(&self.write_buffer)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to write frame", e))?;

        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to flush TCP stream", e))?;

        self.bytes_sent += (FRAME_HEADER_SIZE + data.len()) as u64;

        trace!(
            peer = %self.peer_addr,
            bytes = data.len(),
            total_sent = self.bytes_sent,
            "Sent frame over TCP"
        );

        Ok(())
    }

    /// Close the write side of the connection
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Error shutting down TCP connection to {}: {}", self.peer_addr, e);
        }
    }
}

/// Establish an outbound connection with timeout
pub async fn connect(address: &str, config: &TcpConfig) -> Result<TcpStream> {
    debug!("Connecting to TCP peer at {}", address);

    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            TransportError::timeout("TCP connect", config.connect_timeout.as_millis() as u64)
        })?
        .map_err(|e| TransportError::network_with_source("Failed to connect to TCP peer", e))?;

    Ok(stream)
}

/// Bind the listener a node accepts peer links on
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| TransportError::network_with_source("Failed to bind TCP listener", e))?;

    if let Ok(addr) = listener.local_addr() {
        info!("TCP listener bound on {}", addr);
    }
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(config: &TcpConfig) -> ((FrameReader, FrameWriter), (FrameReader, FrameWriter)) {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, server) = tokio::join!(connect(&addr, config), listener.accept());
        let client = split(client.unwrap(), config).unwrap();
        let server = split(server.unwrap().0, config).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let config = TcpConfig::default();
        let ((_, mut client_writer), (mut server_reader, _)) = pair(&config).await;

        for i in 0..10u8 {
            client_writer.send_frame(&[i; 32]).await.unwrap();
        }
        for i in 0..10u8 {
            let frame = server_reader.read_frame().await.unwrap().unwrap();
            assert_eq!(frame.as_ref(), &[i; 32]);
        }
    }

    #[tokio::test]
    async fn test_clean_close_reads_as_none() {
        let config = TcpConfig::default();
        let ((client_reader, client_writer), (mut server_reader, _)) = pair(&config).await;

        drop(client_reader);
        client_writer.close().await;

        assert!(server_reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let config = TcpConfig {
            max_frame_size: 1024,
            ..Default::default()
        };
        let ((_, mut client_writer), _) = pair(&config).await;

        let err = client_writer.send_frame(&vec![0u8; 2048]).await.unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(connect(&addr, &TcpConfig::default()).await.is_err());
    }
}
