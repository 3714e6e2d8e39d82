// brokerage-core/src/transport.rs

//! Framed TCP transport for protocol messages.
//!
//! Every frame on the wire is a little-endian `u32` length prefix followed by
//! that many bytes. A logical message is one header frame, followed by one
//! payload frame iff the message kind carries a payload. The receiver tracks
//! this two-phase delivery per connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{BrokerageError, Result};
use crate::protocol::{ipv4_to_wire, Message};

/// Upper bound for a single frame. Real messages are far smaller; anything
/// above this is a framing violation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// A framed, bidirectional connection to a peer.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Dials `host:port` with a millisecond timeout.
    pub async fn connect(host: &str, port: u16, timeout_ms: u64) -> Result<Self> {
        let address = format!("{host}:{port}");

        let dial = TcpStream::connect((host, port));
        let stream = match tokio::time::timeout(Duration::from_millis(timeout_ms), dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BrokerageError::connect_with_source(
                    address,
                    "dial failed",
                    e,
                ))
            }
            Err(_) => {
                return Err(BrokerageError::connect(
                    address,
                    format!("dial timed out after {timeout_ms} ms"),
                ))
            }
        };

        let peer = stream
            .peer_addr()
            .map_err(|e| BrokerageError::connect_with_source(&address, "no peer address", e))?;

        Ok(Self { stream, peer })
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Peer IPv4 address in wire order; `None` for non-IPv4 peers.
    pub fn peer_addr_wire(&self) -> Option<u32> {
        match self.peer {
            SocketAddr::V4(v4) => Some(ipv4_to_wire(*v4.ip())),
            SocketAddr::V6(_) => None,
        }
    }

    /// Sends one logical message (header frame + optional payload frame).
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.write_frame(&msg.encode_header()).await?;
        if let Some(payload) = msg.encode_payload() {
            self.write_frame(&payload).await?;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| self.io_error("flush failed", e))?;
        Ok(())
    }

    /// Receives one logical message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection at a message
    /// boundary. An unknown message kind, an oversized frame, or a close in
    /// the middle of a message is a protocol error.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        let header = match self.read_frame().await? {
            Some(header) => header,
            None => return Ok(None),
        };

        let kind = *header
            .first()
            .ok_or_else(|| BrokerageError::protocol("empty header frame"))?;

        let payload = if Message::kind_has_payload(kind)? {
            match self.read_frame().await? {
                Some(payload) => Some(payload),
                None => {
                    return Err(BrokerageError::protocol(
                        "connection closed before message payload",
                    ))
                }
            }
        } else {
            None
        };

        Message::decode(&header, payload.as_deref()).map(Some)
    }

    /// Shuts down the write side and drops the connection.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(self.io_error("read failed", e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            return Err(BrokerageError::protocol(format!(
                "invalid frame length {len}"
            )));
        }

        let mut frame = vec![0u8; len];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| self.io_error("read failed mid-frame", e))?;
        Ok(Some(frame))
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| self.io_error("write failed", e))?;
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| self.io_error("write failed", e))?;
        Ok(())
    }

    fn io_error(&self, message: &str, source: std::io::Error) -> BrokerageError {
        BrokerageError::connect_with_source(self.peer.to_string(), message, source)
    }
}
