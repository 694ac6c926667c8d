//! # TCP Server
//!
//! Accepts connections, classifies each one with a CONNECT handshake and
//! serves object requests against the node's [`LocalStore`]. Client LIST
//! requests are fanned out through the node's [`FederationRegistry`].
//!
//! ## Architecture
//!
//! - One accept loop per node
//! - One task per accepted connection, running [`handle_connection`]
//! - The store and registry are shared by every task
//!
//! ## Connection states
//!
//! ```text
//! UNCLASSIFIED --CON|CLI--> CLIENT --+
//!      |       --CON|SER--> SERVER --+--> CLOSED
//!      +-----------DIS / error-------+
//! ```
//!
//! A CLIENT handshake is refused (and the socket closed) once `max_clients`
//! client connections are active. The count drops again when a client
//! connection ends.
//!
//! ## Shutdown
//!
//! [`Server::stop`] fires a watch channel every task selects on, drops the
//! listener and closes all outbound peer links. Handlers blocked in a read
//! wake up and exit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use crate::codec::{Connection, FrameLimits};
use crate::config::Config;
use crate::error::Error;
use crate::federation::FederationRegistry;
use crate::protocol::{self, MessageType, Protocol, Request, Role, Status};
use crate::store::LocalStore;

/// Server statistics.
#[derive(Debug)]
pub struct ServerStats {
    /// Total number of connections since server start
    pub total_connections: AtomicU64,

    /// Currently open sockets, classified or not
    pub active_connections: AtomicU64,

    /// Currently open CLIENT connections
    pub active_clients: AtomicUsize,

    /// Currently open SERVER connections (inbound peer links)
    pub active_servers: AtomicUsize,

    /// Client handshakes refused because the cap was reached
    pub rejected_clients: AtomicU64,

    /// Total number of requests processed
    pub total_commands: AtomicU64,

    pub put_commands: AtomicU64,
    pub get_commands: AtomicU64,
    pub delete_commands: AtomicU64,
    pub list_commands: AtomicU64,
    pub list_peers_commands: AtomicU64,

    /// Server start time
    pub start_time: Instant,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            active_clients: AtomicUsize::new(0),
            active_servers: AtomicUsize::new(0),
            rejected_clients: AtomicU64::new(0),
            total_commands: AtomicU64::new(0),
            put_commands: AtomicU64::new(0),
            get_commands: AtomicU64::new(0),
            delete_commands: AtomicU64::new(0),
            list_commands: AtomicU64::new(0),
            list_peers_commands: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Acquire)
    }

    pub fn active_servers(&self) -> usize {
        self.active_servers.load(Ordering::Acquire)
    }

    /// Increment the counter for a specific request type
    pub fn increment_command_counter(&self, request: &Request) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);

        let counter = match request {
            Request::Put { .. } => &self.put_commands,
            Request::Get { .. } => &self.get_commands,
            Request::Delete { .. } => &self.delete_commands,
            Request::List { .. } => &self.list_commands,
            Request::ListPeers => &self.list_peers_commands,
            Request::Connect { .. } | Request::Disconnect | Request::Ack { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reserve a client slot if fewer than `cap` are in use.
    fn try_admit_client(&self, cap: usize) -> bool {
        self.active_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < cap {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn counter_for(&self, role: Role) -> &AtomicUsize {
        match role {
            Role::Client => &self.active_clients,
            Role::Server => &self.active_servers,
        }
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: Config,
    limits: FrameLimits,
    store: LocalStore,
    registry: Arc<FederationRegistry>,
    stats: ServerStats,
    shutdown: watch::Sender<bool>,
}

/// Holds a role slot for the lifetime of a classified connection.
struct RoleSlot {
    shared: Arc<Shared>,
    role: Role,
}

impl Drop for RoleSlot {
    fn drop(&mut self) {
        self.shared
            .stats
            .counter_for(self.role)
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// A federated object-store node.
///
/// Cheap to clone; clones control the same node.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
    listener: Arc<Mutex<Option<TcpListener>>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listening socket described by `config`.
    ///
    /// The node does not accept connections until [`Server::run`] is called,
    /// but peers dialing it in the meantime queue in the listen backlog.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let advertised = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        let limits = config.frame_limits();

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Arc::new(FederationRegistry::new(advertised, limits)),
            store: LocalStore::new(),
            stats: ServerStats::new(),
            limits,
            config,
            shutdown,
        });

        Ok(Self {
            shared,
            listener: Arc::new(Mutex::new(Some(listener))),
            local_addr,
        })
    }

    /// Bind and serve until [`Server::stop`] is called.
    pub async fn start(config: Config) -> Result<()> {
        Self::bind(config).await?.run().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address this node announces to peers.
    pub fn advertised_addr(&self) -> &str {
        self.shared.registry.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.shared.store
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Addresses of the peers this node has linked to.
    pub fn peers(&self) -> Vec<String> {
        self.shared.registry.peers()
    }

    pub fn is_linked(&self, addr: &str) -> bool {
        self.shared.registry.is_linked(addr)
    }

    /// Serve connections until stopped. Returns immediately on a stopped node.
    ///
    /// # Errors
    /// Returns an error if another task is already running this node.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("server on {} is already running", self.local_addr))?;
        info!(
            "Server listening on {} (advertised as {})",
            self.local_addr,
            self.advertised_addr()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let stats = &self.shared.stats;
                        stats.total_connections.fetch_add(1, Ordering::Relaxed);
                        stats.active_connections.fetch_add(1, Ordering::Relaxed);

                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, addr, Arc::clone(&shared)).await {
                                warn!("Connection from {} ended with error: {}", addr, e);
                            }
                            shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        }

        info!("Server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Stop serving: close the listener, every connection and every peer link.
    pub async fn stop(&self) {
        info!("Stopping server on {}", self.local_addr);
        self.shared.shutdown.send_replace(true);
        self.listener.lock().await.take();
        self.shared.registry.shutdown().await;
    }

    /// Join the group `seed_host:seed_port` belongs to.
    pub async fn connect(&self, seed_host: &str, seed_port: u16) -> Result<()> {
        self.join(&format!("{}:{}", seed_host, seed_port)).await
    }

    /// Join the group `seed` (`host:port`) belongs to.
    pub async fn join(&self, seed: &str) -> Result<()> {
        let linked = self.shared.registry.join_group(seed).await?;
        info!("Node {} now linked to {} peer(s)", self.advertised_addr(), linked);
        Ok(())
    }
}

/// Handle a single connection until it disconnects, errors or the node stops.
///
/// # Protocol Handling
/// - The first accepted message must be `CON`; anything else is answered
///   with `ACK|FAI` and the connection stays unclassified
/// - Once classified, requests are dispatched to the store or the registry
/// - Malformed requests are answered with `ACK|FAI`; the loop continues
///
/// # Error Handling
/// - Transport and framing errors end the connection
/// - Write failures propagate to the caller
async fn handle_connection(socket: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<()> {
    let mut conn = Connection::new(socket, shared.limits)?;
    let mut shutdown = shared.shutdown.subscribe();
    let protocol = Protocol::new();
    let mut slot: Option<RoleSlot> = None;

    if *shutdown.borrow_and_update() {
        return Ok(());
    }

    loop {
        let fields = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("Closing connection from {} for shutdown", addr);
                break;
            }
            read = conn.read_message() => match read {
                Ok(fields) => fields,
                Err(Error::Closed) => {
                    debug!("{} disconnected", addr);
                    break;
                }
                Err(e) if e.is_transport() => {
                    warn!("Dropping connection from {}: {}", addr, e);
                    break;
                }
                Err(e) => {
                    debug!("Unreadable message from {}: {}", addr, e);
                    conn.write_ack(Status::Failure).await?;
                    continue;
                }
            }
        };

        let request = match protocol.parse(&fields) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting message from {}: {}", addr, e);
                conn.write_ack(Status::Failure).await?;
                continue;
            }
        };
        shared.stats.increment_command_counter(&request);

        let role = slot.as_ref().map(|s| s.role);
        match (role, request) {
            (_, Request::Disconnect) => {
                debug!("{} sent DIS", addr);
                break;
            }
            (None, Request::Connect { role, listen_addr }) => {
                if role == Role::Client && !shared.stats.try_admit_client(shared.config.max_clients) {
                    shared.stats.rejected_clients.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Refusing client {}: {} clients already connected",
                        addr, shared.config.max_clients
                    );
                    conn.write_ack(Status::Failure).await?;
                    break;
                }
                if role == Role::Server {
                    shared.stats.active_servers.fetch_add(1, Ordering::AcqRel);
                }
                slot = Some(RoleSlot {
                    shared: Arc::clone(&shared),
                    role,
                });
                conn.write_ack(Status::Success).await?;
                info!("{} classified as {:?}", addr, role);

                if role == Role::Server {
                    let peer = listen_addr.unwrap_or_else(|| addr.to_string());
                    shared.registry.accept_peer(peer);
                }
            }
            (None, other) => {
                debug!("{} sent {:?} before CONNECT", addr, other.message_type());
                conn.write_ack(Status::Failure).await?;
            }
            (Some(_), Request::Connect { .. }) | (Some(_), Request::Ack { .. }) => {
                conn.write_ack(Status::Failure).await?;
            }
            (Some(_), Request::Put { key, len }) => handle_put(&mut conn, &shared, key, len).await?,
            (Some(_), Request::Get { key }) => handle_get(&mut conn, &shared, &key).await?,
            (Some(_), Request::Delete { key }) => {
                shared.store.delete(&key);
                conn.write_ack(Status::Success).await?;
            }
            (Some(role), Request::List { origin }) => {
                handle_list(&mut conn, &shared, role, origin).await?
            }
            (Some(_), Request::ListPeers) => {
                let peers = shared.registry.peers();
                write_listing(&mut conn, &shared, MessageType::ListPeers, &peers).await?;
            }
        }
    }

    let _ = conn.shutdown().await;
    Ok(())
}

/// Ready ack, payload, final ack. A failed payload read ends the connection.
async fn handle_put(conn: &mut Connection, shared: &Shared, key: String, len: usize) -> Result<()> {
    if len > shared.limits.max_payload_bytes {
        warn!(
            "Refusing PUT {} from {}: {} bytes exceeds limit of {}",
            key,
            conn.peer_addr(),
            len,
            shared.limits.max_payload_bytes
        );
        conn.write_ack(Status::Failure).await?;
        return Ok(());
    }

    conn.write_ack(Status::Success).await?;
    match conn.read_raw(len).await {
        Ok(payload) => {
            shared.store.put(key, payload);
            conn.write_ack(Status::Success).await?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.write_ack(Status::ReadError).await;
            Err(e.into())
        }
    }
}

async fn handle_get(conn: &mut Connection, shared: &Shared, key: &str) -> Result<()> {
    let payload = match shared.store.get(key) {
        Some(payload) => payload,
        None => {
            conn.write_ack(Status::ExistsError).await?;
            return Ok(());
        }
    };
    conn.write_ack(Status::Success).await?;
    conn.write_message(&protocol::encode_size_reply(MessageType::Get, payload.len()))
        .await?;
    conn.write_raw(&payload).await?;
    Ok(())
}

/// Local keys, plus every peer's keys when a client asked.
async fn handle_list(conn: &mut Connection, shared: &Shared, role: Role, origin: Role) -> Result<()> {
    if origin != role {
        debug!(
            "{} is a {:?} connection but sent LIS|{}",
            conn.peer_addr(),
            role,
            origin.code()
        );
        conn.write_ack(Status::WrongTypeError).await?;
        return Ok(());
    }

    let mut keys = shared.store.list_local();
    if role == Role::Client {
        keys.extend(shared.registry.fan_out_list().await);
    }
    write_listing(conn, shared, MessageType::List, &keys).await
}

/// `ACK|SUC` and the listing line, or `ACK|FAI` when the line would exceed
/// the line limit.
async fn write_listing(
    conn: &mut Connection,
    shared: &Shared,
    reply: MessageType,
    entries: &[String],
) -> Result<()> {
    let line = protocol::encode_listing(reply, entries);
    let len = protocol::line_len(&line);
    if len > shared.limits.max_line_bytes {
        warn!(
            "Refusing {} reply to {}: {} entries need {} bytes, limit is {}",
            reply.code(),
            conn.peer_addr(),
            entries.len(),
            len,
            shared.limits.max_line_bytes
        );
        conn.write_ack(Status::Failure).await?;
        return Ok(());
    }
    conn.write_ack(Status::Success).await?;
    conn.write_message(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_command_counters() {
        let stats = ServerStats::new();
        stats.increment_command_counter(&Request::Put { key: "k".into(), len: 1 });
        stats.increment_command_counter(&Request::ListPeers);
        stats.increment_command_counter(&Request::Disconnect);
        assert_eq!(stats.total_commands.load(Ordering::Relaxed), 3);
        assert_eq!(stats.put_commands.load(Ordering::Relaxed), 1);
        assert_eq!(stats.list_peers_commands.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_client_admission_cap() {
        let stats = ServerStats::new();
        for _ in 0..3 {
            assert!(stats.try_admit_client(3));
        }
        assert!(!stats.try_admit_client(3));
        stats.active_clients.fetch_sub(1, Ordering::AcqRel);
        assert!(stats.try_admit_client(3));
    }

    #[tokio::test]
    async fn test_bind_reports_advertised_address() {
        let server = Server::bind(test_config()).await.unwrap();
        assert_eq!(server.advertised_addr(), server.local_addr().to_string());

        let advertised = Config {
            advertise_addr: Some("node-a:7070".to_string()),
            ..test_config()
        };
        let server = Server::bind(advertised).await.unwrap();
        assert_eq!(server.advertised_addr(), "node-a:7070");
    }

    #[tokio::test]
    async fn test_run_after_stop_returns() {
        let server = Server::bind(test_config()).await.unwrap();
        server.stop().await;
        assert!(server.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_second_run_is_refused() {
        let server = Server::bind(test_config()).await.unwrap();
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        // let the first run take the listener
        while server.listener.lock().await.is_some() {
            tokio::task::yield_now().await;
        }
        assert!(server.run().await.is_err());
        server.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = Config {
            max_clients: 0,
            ..test_config()
        };
        assert!(Server::bind(config).await.is_err());
    }
}
