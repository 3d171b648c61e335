//! TCP connection carrying one registry exchange

use crate::error::{RegistryError, Result};
use crate::protocol::{MAX_FRAME_SIZE, REPLY_ERROR, REPLY_OK};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A single request/reply exchange over TCP, counting bytes in both directions
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    read: u64,
    written: u64,
}

impl Connection {
    /// Connect to `addr`, giving up after `connect_timeout`
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        debug!("Connection: connected to {}", addr);
        Ok(Self::new(stream, addr))
    }

    /// Wrap a freshly accepted stream
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            read: 0,
            written: 0,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let byte = self.stream.read_u8().await?;
        self.read += 1;
        Ok(byte)
    }

    /// Write the magic and opcode bytes that open a request
    pub async fn write_header(&mut self, magic: u8, opcode: u8) -> Result<()> {
        self.write_all(&[magic, opcode]).await
    }

    /// Read a length-prefixed body
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let len = self.stream.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RegistryError::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        self.read += 4 + len as u64;
        Ok(body)
    }

    /// Write a length-prefixed body
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(RegistryError::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        self.write_all(&buf).await
    }

    pub async fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = self.read_frame().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn write_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.write_frame(&body).await
    }

    pub async fn send_ok_reply(&mut self) -> Result<()> {
        self.write_all(&[REPLY_OK]).await
    }

    /// Send an error reply carrying `message` as a UTF string
    pub async fn send_error(&mut self, message: &str) -> Result<()> {
        let message = truncate_utf8(message, u16::MAX as usize);
        let mut buf = Vec::with_capacity(3 + message.len());
        buf.push(REPLY_ERROR);
        buf.extend_from_slice(&(message.len() as u16).to_be_bytes());
        buf.extend_from_slice(message.as_bytes());
        self.write_all(&buf).await
    }

    /// Read a reply byte, turning an error reply into [`RegistryError::Protocol`]
    pub async fn get_and_check_reply(&mut self) -> Result<()> {
        match self.read_u8().await? {
            REPLY_OK => Ok(()),
            REPLY_ERROR => {
                let message = self.read_utf().await?;
                Err(RegistryError::Protocol(message))
            }
            other => Err(RegistryError::protocol(format!(
                "unknown reply byte: {}",
                other
            ))),
        }
    }

    /// Shut down the write side, letting the peer see a clean end of stream
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn read_utf(&mut self) -> Result<String> {
        let len = self.stream.read_u16().await? as usize;
        let mut bytes = vec![0u8; len];
        self.stream.read_exact(&mut bytes).await?;
        self.read += 2 + len as u64;
        String::from_utf8(bytes).map_err(|e| RegistryError::protocol(e.to_string()))
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Longest prefix of `s` no longer than `max` bytes, cut on a char boundary
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
