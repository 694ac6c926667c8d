//! # Federation Registry
//!
//! Tracks the peer servers this node has linked to and runs the two
//! server-to-server procedures: joining a group and fanning a LIST out.
//!
//! ## Links
//!
//! Every peer pair is connected by two half-duplex links, one dialed in each
//! direction. A node only *issues* requests on links it dialed (the ones held
//! in this registry) and only *answers* requests on links it accepted (served
//! by the ordinary connection handler). Requests and replies therefore never
//! share a direction on one socket and need no correlation tags.
//!
//! ## Joining
//!
//! 1. Dial the seed, send `CON|SER|<own address>`, wait for `ACK|SUC`
//! 2. Ask the seed for its peers with `LSE`
//! 3. Dial each listed address that is not ourselves and not linked yet
//!
//! A node receiving `CON|SER|<addr>` dials `<addr>` back, which makes
//! membership symmetric without the joiner having to be re-dialed by hand.
//!
//! ## Fan-out
//!
//! A client LIST asks every linked peer for its *local* keys with `LIS|SER`.
//! Peers never fan out on a server-originated LIST, so a query travels at
//! most one hop. A peer that fails or times out contributes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::codec::{Connection, FrameLimits};
use crate::error::{Error, Result};
use crate::protocol::{MessageType, Request, Role};

/// An outbound link to one peer server.
pub struct PeerLink {
    address: String,
    conn: Mutex<Option<Connection>>,
    broken: AtomicBool,
}

impl PeerLink {
    fn new(address: String, conn: Connection) -> Self {
        Self {
            address,
            conn: Mutex::new(Some(conn)),
            broken: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// False once the link hit a transport error or was closed.
    pub fn is_live(&self) -> bool {
        !self.broken.load(Ordering::Acquire)
    }

    /// Ask the peer for its local keys.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        self.request_listing(Request::List { origin: Role::Server }, MessageType::List)
            .await
    }

    /// Ask the peer for the addresses it is linked to.
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        self.request_listing(Request::ListPeers, MessageType::ListPeers)
            .await
    }

    async fn request_listing(&self, request: Request, reply: MessageType) -> Result<Vec<String>> {
        // One request in flight per link
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        let deadline = conn.limits().io_timeout;

        let result = match timeout(deadline, conn.request_listing(&request, reply)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        };

        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Link to {} broken: {}", self.address, e);
                self.broken.store(true, Ordering::Release);
                guard.take();
            }
        }
        result
    }

    /// Say goodbye and drop the socket.
    async fn close(&self) {
        self.broken.store(true, Ordering::Release);
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.write_message(&[MessageType::Disconnect.code()]).await;
            let _ = conn.shutdown().await;
        }
    }
}

/// Concurrent address → link map plus the join and fan-out procedures.
pub struct FederationRegistry {
    local_addr: String,
    peers: DashMap<String, Arc<PeerLink>>,
    dialing: DashSet<String>,
    limits: FrameLimits,
    closed: AtomicBool,
}

impl FederationRegistry {
    /// # Arguments
    /// * `local_addr` - the address this node advertises to peers
    /// * `limits` - framing bounds for outbound links
    pub fn new(local_addr: impl Into<String>, limits: FrameLimits) -> Self {
        Self {
            local_addr: local_addr.into(),
            peers: DashMap::new(),
            dialing: DashSet::new(),
            limits,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Registered peer addresses, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether a live outbound link to `addr` exists.
    pub fn is_linked(&self, addr: &str) -> bool {
        self.peers.get(addr).map(|link| link.is_live()).unwrap_or(false)
    }

    fn link_for(&self, addr: &str) -> Option<Arc<PeerLink>> {
        self.peers.get(addr).map(|link| Arc::clone(link.value()))
    }

    /// Snapshot of live links. Taken so no map guard is held across an await.
    fn live_links(&self) -> Vec<Arc<PeerLink>> {
        self.peers
            .iter()
            .filter(|e| e.value().is_live())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Dial `addr`, perform the server handshake and register the link.
    ///
    /// Returns `Ok(false)` without dialing when `addr` is this node, is
    /// already linked, or another task is dialing it right now.
    pub async fn link(&self, addr: &str) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        if addr == self.local_addr || self.is_linked(addr) {
            return Ok(false);
        }
        if !self.dialing.insert(addr.to_string()) {
            return Ok(false);
        }
        let dialed = self.dial(addr).await;
        self.dialing.remove(addr);
        let conn = dialed?;

        let link = Arc::new(PeerLink::new(addr.to_string(), conn));
        let displaced = match self.peers.entry(addr.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => Some(link),
            Entry::Occupied(mut entry) => Some(entry.insert(link)),
            Entry::Vacant(entry) => {
                entry.insert(link);
                None
            }
        };
        if let Some(extra) = displaced {
            extra.close().await;
        }

        // stop() may have drained the map while we were dialing
        if self.closed.load(Ordering::Acquire) {
            if let Some((_, link)) = self.peers.remove(addr) {
                link.close().await;
            }
            return Err(Error::NotConnected);
        }

        info!("Linked to peer {}", addr);
        Ok(true)
    }

    async fn dial(&self, addr: &str) -> Result<Connection> {
        debug!("Dialing peer {}", addr);
        let mut conn = Connection::connect(addr, self.limits).await?;
        let hello = Request::Connect {
            role: Role::Server,
            listen_addr: Some(self.local_addr.clone()),
        };
        conn.write_message(&hello.encode()).await?;
        match timeout(self.limits.io_timeout, conn.expect_success()).await {
            Err(_) => Err(Error::Timeout(self.limits.io_timeout)),
            Ok(Err(Error::OperationFailed)) => Err(Error::Rejected),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(conn),
        }
    }

    /// Join the group `seed` belongs to.
    ///
    /// Failing to reach the seed is an error; failing to reach any peer the
    /// seed lists is logged and skipped.
    ///
    /// # Returns
    /// * `Result<usize>` - number of peers registered after the join
    pub async fn join_group(&self, seed: &str) -> Result<usize> {
        info!("Joining group via seed {}", seed);
        self.link(seed).await?;
        let seed_link = self.wait_for_link(seed).await?;
        let listed = seed_link.list_peers().await?;

        for addr in listed {
            if addr == self.local_addr || addr == seed {
                continue;
            }
            match self.link(&addr).await {
                Ok(true) => {}
                Ok(false) => debug!("Skipping {}: already linked or dialing", addr),
                Err(e) => warn!("Skipping peer {} while joining: {}", addr, e),
            }
        }

        info!("Joined group; {} peer(s) linked", self.len());
        Ok(self.len())
    }

    /// The link to `addr`, waiting out a dial another task has in flight.
    async fn wait_for_link(&self, addr: &str) -> Result<Arc<PeerLink>> {
        let deadline = Instant::now() + self.limits.io_timeout;
        loop {
            if let Some(link) = self.link_for(addr).filter(|link| link.is_live()) {
                return Ok(link);
            }
            if !self.dialing.contains(addr) || Instant::now() >= deadline {
                return Err(Error::NotConnected);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// React to an inbound server handshake by dialing the peer back.
    ///
    /// Runs in the background so the handshake reply is not delayed.
    pub fn accept_peer(self: &Arc<Self>, addr: String) {
        if addr == self.local_addr || self.is_linked(&addr) || self.dialing.contains(&addr) {
            return;
        }
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            match registry.link(&addr).await {
                Ok(true) => info!("Dialed back new peer {}", addr),
                Ok(false) => {}
                Err(e) => warn!("Dial-back to {} failed: {}", addr, e),
            }
        });
    }

    /// Collect the local keys of every linked peer.
    ///
    /// Peers are queried concurrently; errors are logged and skipped.
    /// Keys are not deduplicated.
    pub async fn fan_out_list(&self) -> Vec<String> {
        let mut queries = JoinSet::new();
        for link in self.live_links() {
            queries.spawn(async move {
                let result = link.list_keys().await;
                (link.address().to_string(), result)
            });
        }

        let mut keys = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((_, Ok(peer_keys))) => keys.extend(peer_keys),
                Ok((addr, Err(e))) => warn!("Peer {} skipped during LIST fan-out: {}", addr, e),
                Err(e) => warn!("LIST fan-out task failed: {}", e),
            }
        }
        keys
    }

    /// Close every link and refuse new ones.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let links: Vec<Arc<PeerLink>> = self.peers.iter().map(|e| Arc::clone(e.value())).collect();
        self.peers.clear();
        for link in links {
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quick_limits() -> FrameLimits {
        FrameLimits {
            io_timeout: Duration::from_millis(500),
            ..FrameLimits::default()
        }
    }

    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_link_to_self_is_skipped() {
        let registry = FederationRegistry::new("127.0.0.1:7000", quick_limits());
        assert!(!registry.link("127.0.0.1:7000").await.unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_seed_fails_join() {
        let registry = FederationRegistry::new("127.0.0.1:7000", quick_limits());
        let addr = unused_addr().await;
        assert!(registry.join_group(&addr).await.is_err());
        assert!(registry.peers().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_without_peers_is_empty() {
        let registry = FederationRegistry::new("127.0.0.1:7000", quick_limits());
        assert!(registry.fan_out_list().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket, FrameLimits::default()).unwrap();
            let hello = conn.read_message().await.unwrap();
            assert_eq!(hello[0], "CON");
            assert_eq!(hello[1], "SER");
            assert_eq!(hello[2], "127.0.0.1:7000");
            conn.write_ack(crate::protocol::Status::Failure).await.unwrap();
        });

        let registry = FederationRegistry::new("127.0.0.1:7000", quick_limits());
        assert!(matches!(registry.link(&addr).await, Err(Error::Rejected)));
        assert!(!registry.is_linked(&addr));
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_links() {
        let registry = FederationRegistry::new("127.0.0.1:7000", quick_limits());
        registry.shutdown().await;
        let addr = unused_addr().await;
        assert!(matches!(registry.link(&addr).await, Err(Error::NotConnected)));
    }
}
