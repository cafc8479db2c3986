//! The listening side of a node.
//!
//! One server owns one TCP listener, the routing table of established
//! connections, and the admission ceilings. Dial-back handshake sockets
//! land on the same listener as peer connections and are routed into the
//! shared [`HandshakeRegistry`](crate::handshake::HandshakeRegistry).

use dashmap::DashMap;
use lattice_crypto::NodeIdentity;
use lattice_wire::Message;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{
    CloseMode, Connection, ConnectionConfig, ConnectionHooks, ConnectionParams,
};
use crate::error::TransportError;
use crate::handshake::{self, AcceptOutcome, HandshakeRegistry};
use crate::registry::Registry;
use crate::reqid::ReqIdGenerator;

/// Accept-error backoff bounds, from the first retry to the cap.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Tunables for a listening node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ceiling on simultaneously routed connections. Zero means unlimited.
    pub max_connections: usize,
    /// Ceiling on aggregate read+write bytes per second across all
    /// connections. Zero means unlimited.
    pub max_flow_per_second: u64,
    /// Deadline for each inbound handshake.
    pub handshake_timeout: Duration,
    /// Engine tunables applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_flow_per_second: 0,
            handshake_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
        }
    }
}

/// A listening node endpoint.
pub struct Server {
    identity: Arc<NodeIdentity>,
    registry: Arc<Registry>,
    handshakes: Arc<HandshakeRegistry>,
    req_ids: Arc<ReqIdGenerator>,
    config: ServerConfig,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
    next_id: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// A server sharing the given handler table and handshake registry.
    ///
    /// `next_id` is the connection id counter; share it with a
    /// [`Connector`](crate::client::Connector) when ids must be unique
    /// across both directions of a node.
    #[must_use]
    pub fn new(
        identity: Arc<NodeIdentity>,
        registry: Arc<Registry>,
        handshakes: Arc<HandshakeRegistry>,
        req_ids: Arc<ReqIdGenerator>,
        next_id: Arc<AtomicU64>,
        config: ServerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            identity,
            registry,
            handshakes,
            req_ids,
            config,
            connections: Arc::new(DashMap::new()),
            next_id,
            shutdown,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::ServerClosed);
        }
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);

        let loop_state = AcceptLoop {
            listener,
            identity: Arc::clone(&self.identity),
            registry: Arc::clone(&self.registry),
            handshakes: Arc::clone(&self.handshakes),
            req_ids: Arc::clone(&self.req_ids),
            config: self.config.clone(),
            connections: Arc::clone(&self.connections),
            next_id: Arc::clone(&self.next_id),
            shutdown: self.shutdown.subscribe(),
        };
        let handle = tokio::spawn(loop_state.run());
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(%local_addr, "listening");
        Ok(local_addr)
    }

    /// The bound listener address, once `serve` has run.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of routed connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Look up a routed connection by id.
    #[must_use]
    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Send one message to one routed connection.
    pub async fn unicast(&self, id: u64, message: Message) -> Result<u64, TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::ServerClosed);
        }
        let Some(conn) = self.connection(id) else {
            warn!(id, "unicast to unknown connection");
            return Err(TransportError::UnknownConnection(id));
        };
        conn.write(message).await
    }

    /// Send one message to every routed connection, best effort past
    /// individual failures. Connections are written concurrently so a
    /// peer with a full outbound queue cannot delay the others.
    /// Returns how many accepted it.
    pub async fn broadcast(&self, message: Message) -> Result<usize, TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::ServerClosed);
        }
        let mut writes = tokio::task::JoinSet::new();
        for entry in self.connections.iter() {
            let conn = Arc::clone(entry.value());
            let message = message.clone();
            writes.spawn(async move {
                if let Err(err) = conn.write(message).await {
                    debug!(id = conn.id(), error = %err, "broadcast skipped connection");
                    return false;
                }
                true
            });
        }
        let mut delivered = 0;
        while let Some(accepted) = writes.join_next().await {
            if matches!(accepted, Ok(true)) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Stop the listener, close every connection, and wait for teardown.
    ///
    /// A stopped server is final: later `serve`, `unicast`, and
    /// `broadcast` calls return `ServerClosed`.
    pub async fn stop(&self, mode: CloseMode) {
        let _ = self.shutdown.send(true);
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let remaining: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in remaining {
            conn.close(mode).await;
        }
        info!("server stopped");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

struct AcceptLoop {
    listener: TcpListener,
    identity: Arc<NodeIdentity>,
    registry: Arc<Registry>,
    handshakes: Arc<HandshakeRegistry>,
    req_ids: Arc<ReqIdGenerator>,
    config: ServerConfig,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
    next_id: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = ACCEPT_BACKOFF_MIN;
                        self.admit(stream, peer);
                    }
                    Err(err) => {
                        // Descriptor exhaustion and friends; hold the
                        // accept loop back instead of spinning.
                        warn!(error = %err, delay = ?backoff, "accept failed, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                },
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        if self.over_capacity() {
            debug!(%peer, "rejecting connection at capacity");
            return; // dropping the stream closes it
        }

        let identity = Arc::clone(&self.identity);
        let registry = Arc::clone(&self.registry);
        let handshakes = Arc::clone(&self.handshakes);
        let req_ids = Arc::clone(&self.req_ids);
        let connections = Arc::clone(&self.connections);
        let next_id = Arc::clone(&self.next_id);
        let config = self.config.clone();

        tokio::spawn(async move {
            let outcome =
                handshake::respond(&mut stream, &identity, &handshakes, config.handshake_timeout)
                    .await;
            let session = match outcome {
                Ok(AcceptOutcome::Established(session)) => session,
                Ok(AcceptOutcome::CallbackDelivered) => return,
                Err(err) => {
                    debug!(%peer, error = %err, "inbound handshake failed");
                    return;
                }
            };

            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let table = Arc::clone(&connections);
            let hooks = ConnectionHooks {
                on_close: Some(Box::new(move |id, _mode| {
                    table.remove(&id);
                })),
                on_write: None,
            };
            let params = ConnectionParams {
                id,
                config: config.connection,
                identity: Some(identity),
                registry,
                req_ids,
                hooks,
            };
            match Connection::spawn(stream, session, params) {
                Ok(conn) => {
                    info!(id, peer = %conn.peer_address(), %peer, "connection established");
                    let conn = Arc::new(conn);
                    connections.insert(id, Arc::clone(&conn));
                    // The engine may have died between spawn and insert;
                    // its removal hook ran first in that case.
                    if conn.is_closed() {
                        connections.remove(&id);
                    }
                }
                Err(err) => {
                    warn!(%peer, error = %err, "failed to start connection engine");
                }
            }
        });
    }

    /// Admission check: connection count and aggregate per-second flow.
    fn over_capacity(&self) -> bool {
        if self.config.max_connections > 0
            && self.connections.len() >= self.config.max_connections
        {
            return true;
        }
        if self.config.max_flow_per_second > 0 {
            let flow: u64 = self
                .connections
                .iter()
                .map(|entry| {
                    let snap = entry.value().flow();
                    snap.read_per_second + snap.write_per_second
                })
                .sum();
            if flow >= self.config.max_flow_per_second {
                return true;
            }
        }
        false
    }
}

/// Bind a TCP listener with address reuse, matching how long-lived node
/// endpoints restart in place.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}
