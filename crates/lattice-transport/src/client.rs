//! The dialing side of a node.
//!
//! A [`Connector`] establishes outbound connections and installs the
//! periodic jobs a client connection runs: heartbeats, the guarded
//! latency probe, and the flow-window roll the engine starts on its own.
//! Reconnecting always produces a fresh [`Connection`]; an engine that
//! has torn down is never revived in place.

use lattice_crypto::NodeIdentity;
use lattice_wire::{CommandCode, Message};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionHooks, ConnectionParams, ConnectionWriter};
use crate::error::TransportError;
use crate::handshake::{self, HandshakeRegistry};
use crate::registry::{MessageContext, MessageHandler, Registry};
use crate::reqid::ReqIdGenerator;

/// Backoff schedule for dial retries.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Delay ceiling.
    pub max: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it.
    pub jitter: f64,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

/// Tunables for outbound connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the full handshake, dial-back included.
    pub handshake_timeout: Duration,
    /// Heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Latency probe period; `None` disables probing.
    pub latency_interval: Option<Duration>,
    /// A probe with no response for this long is considered lost and the
    /// in-flight guard is released.
    pub latency_probe_timeout: Duration,
    /// Engine tunables for each established connection.
    pub connection: crate::connection::ConnectionConfig,
    /// Retry schedule for `connect_with_retry`.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(60)),
            latency_interval: None,
            latency_probe_timeout: Duration::from_secs(10),
            connection: crate::connection::ConnectionConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Round-trip measurement shared between the probe job and its handler.
#[derive(Debug, Default)]
pub struct LatencyProbe {
    in_flight: AtomicBool,
    sent_at_nanos: AtomicU64,
    last_rtt_nanos: AtomicU64,
}

impl LatencyProbe {
    /// The most recently measured round trip, if any probe has completed.
    #[must_use]
    pub fn last_rtt(&self) -> Option<Duration> {
        match self.last_rtt_nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}

/// Handles `RspLatcy` by closing out the pending probe.
struct LatencyResponder {
    probe: Arc<LatencyProbe>,
}

#[async_trait::async_trait]
impl MessageHandler for LatencyResponder {
    async fn handle(&self, message: Message, _ctx: MessageContext) {
        let Ok(sent) = <[u8; 8]>::try_from(message.body.as_slice()) else {
            debug!("latency response with malformed body");
            return;
        };
        let sent = u64::from_be_bytes(sent);
        let rtt = unix_nanos().saturating_sub(sent).max(1);
        self.probe.last_rtt_nanos.store(rtt, Ordering::Relaxed);
        self.probe.in_flight.store(false, Ordering::Release);
    }
}

/// Establishes outbound connections for a node.
pub struct Connector {
    identity: Arc<NodeIdentity>,
    registry: Arc<Registry>,
    handshakes: Arc<HandshakeRegistry>,
    req_ids: Arc<ReqIdGenerator>,
    next_id: Arc<AtomicU64>,
    listener_port: u16,
    config: ClientConfig,
    latency: Arc<LatencyProbe>,
}

impl Connector {
    /// A connector for the node listening on `listener_port`.
    ///
    /// The handshake registry must be the one the node's own listener
    /// routes dial-back sockets into; the listener port tells peers where
    /// that listener is.
    #[must_use]
    pub fn new(
        identity: Arc<NodeIdentity>,
        registry: Arc<Registry>,
        handshakes: Arc<HandshakeRegistry>,
        req_ids: Arc<ReqIdGenerator>,
        next_id: Arc<AtomicU64>,
        listener_port: u16,
        config: ClientConfig,
    ) -> Self {
        Self {
            identity,
            registry,
            handshakes,
            req_ids,
            next_id,
            listener_port,
            config,
            latency: Arc::new(LatencyProbe::default()),
        }
    }

    /// Latency measurements for connections made by this connector.
    #[must_use]
    pub fn latency(&self) -> Arc<LatencyProbe> {
        Arc::clone(&self.latency)
    }

    /// Dial, handshake, and start the engine on one fresh connection.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        let session = handshake::initiate(
            &mut stream,
            &self.identity,
            &self.handshakes,
            self.listener_port,
            self.config.handshake_timeout,
        )
        .await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = ConnectionParams {
            id,
            config: self.config.connection.clone(),
            identity: Some(Arc::clone(&self.identity)),
            registry: Arc::clone(&self.registry),
            req_ids: Arc::clone(&self.req_ids),
            hooks: ConnectionHooks::default(),
        };
        let conn = Connection::spawn(stream, session, params)?;
        info!(id, peer = %conn.peer_address(), %addr, "connected");

        if let Some(period) = self.config.heartbeat_interval {
            conn.on_interval(period, heartbeat_job);
        }
        if let Some(period) = self.config.latency_interval {
            self.registry.register(
                CommandCode::RSP_LATENCY,
                Arc::new(LatencyResponder {
                    probe: Arc::clone(&self.latency),
                }),
            );
            let probe = Arc::clone(&self.latency);
            let probe_timeout = self.config.latency_probe_timeout;
            conn.on_interval(period, move |writer| {
                latency_job(Arc::clone(&probe), probe_timeout, writer)
            });
        }
        Ok(conn)
    }

    /// Dial with the configured backoff schedule until a connection is
    /// established or the attempt budget runs out.
    pub async fn connect_with_retry(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let policy = &self.config.reconnect;
        let mut delay = policy.initial;
        let mut attempt = 0u32;
        let mut rng = StdRng::from_entropy();
        loop {
            match self.connect(addr).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    attempt += 1;
                    if let Some(max) = policy.max_attempts {
                        if attempt >= max {
                            return Err(err);
                        }
                    }
                    let spread = rng.gen_range(-policy.jitter..=policy.jitter);
                    let jittered = delay.mul_f64((1.0 + spread).max(0.0));
                    warn!(%addr, error = %err, attempt, delay = ?jittered, "connect failed, retrying");
                    tokio::time::sleep(jittered).await;
                    delay = delay.mul_f64(policy.multiplier).min(policy.max);
                }
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("listener_port", &self.listener_port)
            .finish_non_exhaustive()
    }
}

async fn heartbeat_job(writer: ConnectionWriter) {
    let beat = Message::new(CommandCode::REQ_HEARTBEAT, Vec::new(), Vec::new());
    if let Err(err) = writer.write(beat).await {
        debug!(error = %err, "heartbeat not sent");
    }
}

async fn latency_job(probe: Arc<LatencyProbe>, probe_timeout: Duration, writer: ConnectionWriter) {
    let now = unix_nanos();
    if probe.in_flight.swap(true, Ordering::AcqRel) {
        let sent = probe.sent_at_nanos.load(Ordering::Relaxed);
        if now.saturating_sub(sent) < probe_timeout.as_nanos() as u64 {
            return; // previous probe still pending
        }
        debug!("latency probe lost, releasing guard");
    }
    probe.sent_at_nanos.store(now, Ordering::Relaxed);
    let msg = Message::new(
        CommandCode::REQ_LATENCY,
        now.to_be_bytes().to_vec(),
        Vec::new(),
    );
    if let Err(err) = writer.write(msg).await {
        debug!(error = %err, "latency probe not sent");
        probe.in_flight.store(false, Ordering::Release);
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
