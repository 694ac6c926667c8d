//! Line and payload framing over a TCP stream.
//!
//! A [`Connection`] owns both halves of a socket. Text messages are read up to
//! `\n` (bounded by `max_line_bytes`); raw payloads are read with
//! `read_exact` under `io_timeout`. A short payload, an oversized line or a
//! peer that hangs up mid-frame is a framing error: the stream is not
//! resynchronised and the caller drops the connection.

use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{self, MessageType, Request, Status, FIELD_SEPARATOR};

/// Bounds applied to every frame read or written on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Longest accepted message line, excluding the terminator
    pub max_line_bytes: usize,
    /// Largest accepted declared payload
    pub max_payload_bytes: usize,
    /// Deadline for payload reads and request round trips
    pub io_timeout: Duration,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 1024 * 1024,
            max_payload_bytes: 64 * 1024 * 1024,
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// A framed connection.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    limits: FrameLimits,
}

impl Connection {
    /// Wrap an accepted or dialed stream.
    pub fn new(stream: TcpStream, limits: FrameLimits) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer_addr,
            limits,
        })
    }

    /// Dial `addr` (`host:port`), bounded by `limits.io_timeout`.
    pub async fn connect(addr: &str, limits: FrameLimits) -> Result<Self> {
        let stream = timeout(limits.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(limits.io_timeout))??;
        Self::new(stream, limits)
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Framing bounds this connection enforces.
    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    /// Write one message line. Fields are validated before anything is sent.
    pub async fn write_message<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<()> {
        let mut line = String::new();
        for (i, field) in fields.iter().enumerate() {
            let field = field.as_ref();
            protocol::validate_field(field)?;
            if i > 0 {
                line.push(FIELD_SEPARATOR);
            }
            line.push_str(field);
        }
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send `ACK|<status>`.
    pub async fn write_ack(&mut self, status: Status) -> Result<()> {
        self.write_message(&[MessageType::Ack.code(), status.code()])
            .await
    }

    /// Write a raw payload block and flush it. No framing is added.
    pub async fn write_raw(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one message line and split it into fields.
    ///
    /// Blocks until a full line is available. A trailing `\r` is dropped.
    ///
    /// # Errors
    /// - [`Error::Closed`] when the peer hung up before sending anything
    /// - [`Error::Framing`] for an oversized line or a line cut off by EOF
    /// - [`Error::Protocol`] for a complete line that is not valid UTF-8
    pub async fn read_message(&mut self) -> Result<Vec<String>> {
        let limit = self.limits.max_line_bytes as u64 + 1;
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() as u64 >= limit {
                return Err(Error::Framing(format!(
                    "message line exceeds {} bytes",
                    self.limits.max_line_bytes
                )));
            }
            return Err(Error::Framing("connection closed mid-line".to_string()));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8(buf)
            .map_err(|_| Error::Protocol("message line is not valid UTF-8".to_string()))?;
        debug!("read from {}: {}", self.peer_addr, line);
        Ok(line.split(FIELD_SEPARATOR).map(str::to_string).collect())
    }

    /// Read exactly `len` payload bytes.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.limits.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size: len,
                limit: self.limits.max_payload_bytes,
            });
        }
        let mut payload = vec![0u8; len];
        match timeout(self.limits.io_timeout, self.reader.read_exact(&mut payload)).await {
            Err(_) => Err(Error::Timeout(self.limits.io_timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Framing(
                format!("connection closed before {} payload bytes arrived", len),
            )),
            Ok(Err(e)) => Err(Error::Io(e)),
            Ok(Ok(_)) => Ok(payload),
        }
    }

    /// Read one `ACK|<status>` line.
    pub async fn read_ack(&mut self) -> Result<Status> {
        let fields = self.read_message().await?;
        if fields.first().map(String::as_str) != Some(MessageType::Ack.code()) {
            return Err(Error::WrongMessageType(format!(
                "expected ACK, received {:?}",
                fields.join("|")
            )));
        }
        fields
            .get(1)
            .and_then(|code| Status::from_code(code))
            .ok_or_else(|| Error::Protocol(format!("unknown acknowledgement: {}", fields.join("|"))))
    }

    /// Read an acknowledgement and turn any non-success status into an error.
    pub async fn expect_success(&mut self) -> Result<()> {
        match Error::from_status(self.read_ack().await?) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Issue a listing request (`LIS`/`LSE`) and collect the entries of its reply.
    pub async fn request_listing(&mut self, request: &Request, reply: MessageType) -> Result<Vec<String>> {
        self.write_message(&request.encode()).await?;
        self.expect_success().await?;
        let fields = self.read_message().await?;
        protocol::parse_listing(&fields, reply)
    }

    /// Flush and half-close the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
