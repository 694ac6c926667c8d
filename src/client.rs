//! # Client
//!
//! A synchronous-style facade over one connection to one node. Every call
//! sends one request and waits for its acknowledgement before returning, so
//! a `Client` never has more than one request in flight.
//!
//! ```rust,no_run
//! # async fn demo() -> fedstore::Result<()> {
//! let mut client = fedstore::Client::connect("127.0.0.1", 7070).await?;
//! client.put("greeting", b"hello").await?;
//! assert_eq!(client.get("greeting").await?, b"hello");
//! let keys = client.list().await?; // keys from the whole group
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use log::debug;

use crate::codec::{Connection, FrameLimits};
use crate::error::{Error, Result};
use crate::protocol::{self, MessageType, Request, Role};

pub struct Client {
    conn: Option<Connection>,
    server_addr: String,
}

impl Client {
    /// Connect to `host:port` and perform the client handshake.
    ///
    /// # Errors
    /// [`Error::Rejected`] when the server refuses the handshake (its client
    /// cap is reached); transport errors otherwise.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(&format!("{}:{}", host, port), FrameLimits::default()).await
    }

    /// Connect to `addr` (`host:port`) with explicit framing limits.
    pub async fn connect_with(addr: &str, limits: FrameLimits) -> Result<Self> {
        let mut conn = Connection::connect(addr, limits).await?;
        let hello = Request::Connect {
            role: Role::Client,
            listen_addr: None,
        };
        conn.write_message(&hello.encode()).await?;
        match conn.expect_success().await {
            Ok(()) => {}
            Err(Error::OperationFailed) => return Err(Error::Rejected),
            Err(e) => return Err(e),
        }
        debug!("Connected to {}", addr);
        Ok(Self {
            conn: Some(conn),
            server_addr: addr.to_string(),
        })
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Send `DIS` and close the socket. Calling it twice is harmless.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            conn.write_message(&[MessageType::Disconnect.code()]).await?;
            conn.shutdown().await?;
            debug!("Disconnected from {}", self.server_addr);
        }
        Ok(())
    }

    /// Store `payload` under `key`, replacing any previous value.
    pub async fn put(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        protocol::validate_key(key)?;
        let request = Request::Put {
            key: key.to_string(),
            len: payload.len(),
        };
        let conn = self.conn()?;
        let result = async {
            conn.write_message(&request.encode()).await?;
            // Server is ready for the payload
            conn.expect_success().await?;
            conn.write_raw(payload).await?;
            conn.expect_success().await
        }
        .await;
        self.settle(result)
    }

    /// Fetch the object stored under `key`.
    ///
    /// # Errors
    /// - [`Error::KeyNotFound`] if the node does not hold `key`
    /// - [`Error::PayloadTooLarge`] if the object exceeds this client's
    ///   payload limit; the connection is dropped since the unread payload
    ///   is still in flight
    pub async fn get(&mut self, key: &str) -> Result<Vec<u8>> {
        protocol::validate_key(key)?;
        let request = Request::Get { key: key.to_string() };
        let conn = self.conn()?;
        let result = async {
            conn.write_message(&request.encode()).await?;
            conn.expect_success().await?;
            let header = conn.read_message().await?;
            let len = match protocol::parse_size_reply(&header, MessageType::Get) {
                Ok(len) => len,
                // the payload that follows can't be skipped reliably
                Err(e) => return Err(Error::Framing(e.to_string())),
            };
            conn.read_raw(len).await
        }
        .await;
        if let Err(Error::PayloadTooLarge { .. }) = &result {
            debug!("Dropping connection to {}: GET payload left unread", self.server_addr);
            self.conn = None;
        }
        self.settle(result)
    }

    /// Remove `key`. Removing an absent key succeeds.
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        protocol::validate_key(key)?;
        let request = Request::Delete { key: key.to_string() };
        let conn = self.conn()?;
        let result = async {
            conn.write_message(&request.encode()).await?;
            conn.expect_success().await
        }
        .await;
        self.settle(result)
    }

    /// List every key in the group this node belongs to.
    ///
    /// Keys present on several nodes appear once per node.
    pub async fn list(&mut self) -> Result<Vec<String>> {
        let request = Request::List { origin: Role::Client };
        let conn = self.conn()?;
        let result = conn.request_listing(&request, MessageType::List).await;
        self.settle(result)
    }

    /// Addresses of the peers the node is linked to.
    pub async fn list_peers(&mut self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let result = conn
            .request_listing(&Request::ListPeers, MessageType::ListPeers)
            .await;
        self.settle(result)
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::NotConnected)
    }

    /// Drop the connection after a transport error; it cannot be reused.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                debug!("Dropping connection to {}: {}", self.server_addr, e);
                self.conn = None;
            }
        }
        result
    }
}
