//! Full-stack tests: two nodes, real listeners, dial-back handshakes.

use async_trait::async_trait;
use lattice_crypto::{NodeAddress, NodeIdentity};
use lattice_transport::{
    ClientConfig, CloseMode, ConnectionConfig, Connector, HandshakeRegistry, MessageContext,
    MessageHandler, Registry, ReqIdGenerator, Server, ServerConfig, TransportError,
};
use lattice_wire::{CommandCode, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Node {
    identity: Arc<NodeIdentity>,
    registry: Arc<Registry>,
    server: Arc<Server>,
    connector: Connector,
    addr: SocketAddr,
}

async fn start_node(server_config: ServerConfig, client_config: ClientConfig) -> Node {
    let identity = Arc::new(NodeIdentity::generate());
    let registry = Arc::new(Registry::new());
    let handshakes = Arc::new(HandshakeRegistry::new());
    let req_ids = Arc::new(ReqIdGenerator::new(7));
    let next_id = Arc::new(AtomicU64::new(1));

    let server = Arc::new(Server::new(
        Arc::clone(&identity),
        Arc::clone(&registry),
        Arc::clone(&handshakes),
        Arc::clone(&req_ids),
        Arc::clone(&next_id),
        server_config,
    ));
    let addr = server.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let connector = Connector::new(
        Arc::clone(&identity),
        Arc::clone(&registry),
        handshakes,
        req_ids,
        next_id,
        addr.port(),
        client_config,
    );
    Node {
        identity,
        registry,
        server,
        connector,
        addr,
    }
}

async fn start_node_pair() -> (Node, Node) {
    let quiet = ClientConfig {
        heartbeat_interval: None,
        ..ClientConfig::default()
    };
    (
        start_node(ServerConfig::default(), quiet.clone()).await,
        start_node(ServerConfig::default(), quiet).await,
    )
}

/// Captures every message it sees on a channel.
struct Capture {
    tx: mpsc::UnboundedSender<(Message, u64, NodeAddress)>,
}

#[async_trait]
impl MessageHandler for Capture {
    async fn handle(&self, message: Message, ctx: MessageContext) {
        let _ = self.tx.send((message, ctx.req_id, ctx.source));
    }
}

fn capture() -> (Arc<Capture>, mpsc::UnboundedReceiver<(Message, u64, NodeAddress)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Capture { tx }), rx)
}

#[tokio::test]
async fn handshake_and_happy_path() {
    let (alice, bob) = start_node_pair().await;
    let ping = CommandCode::from_bytes(*b"PING1234");
    let (handler, mut inbox) = capture();
    bob.registry.register(ping, handler);

    let conn = alice.connector.connect(bob.addr).await.unwrap();
    assert_eq!(*conn.peer_address(), bob.identity.address());

    let sent_id = conn
        .write(Message::new(ping, b"hi".to_vec(), Vec::new()))
        .await
        .unwrap();

    let (message, req_id, source) = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.command, ping);
    assert_eq!(message.body, b"hi");
    assert_eq!(req_id, sent_id);
    assert_ne!(req_id, 0);
    assert_eq!(source, alice.identity.address());

    conn.close(CloseMode::Graceful).await;
    bob.server.stop(CloseMode::Forced).await;
    alice.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn messages_arrive_in_write_order() {
    let (alice, bob) = start_node_pair().await;
    let ordered = CommandCode::from_str_padded("ORDERED");
    let (handler, mut inbox) = capture();
    bob.registry.register(ordered, handler);

    let conn = alice.connector.connect(bob.addr).await.unwrap();
    for body in [b"A".to_vec(), b"B".to_vec(), b"C".to_vec()] {
        conn.write(Message::new(ordered, body, Vec::new())).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (message, _, _) = timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(message.body);
    }
    assert_eq!(seen, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);

    conn.close(CloseMode::Graceful).await;
    bob.server.stop(CloseMode::Forced).await;
    alice.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn stale_versions_are_skipped_silently() {
    let strict_server = ServerConfig {
        connection: ConnectionConfig {
            min_app_version: 5,
            ..ConnectionConfig::default()
        },
        ..ServerConfig::default()
    };
    let quiet = ClientConfig {
        heartbeat_interval: None,
        ..ClientConfig::default()
    };
    let bob = start_node(strict_server, quiet.clone()).await;

    let stale_client = ClientConfig {
        connection: ConnectionConfig {
            local_version: 3,
            ..ConnectionConfig::default()
        },
        ..quiet.clone()
    };
    let current_client = ClientConfig {
        connection: ConnectionConfig {
            local_version: 5,
            ..ConnectionConfig::default()
        },
        ..quiet
    };
    let alice = start_node(ServerConfig::default(), stale_client).await;
    let carol = start_node(ServerConfig::default(), current_client).await;

    let probe = CommandCode::from_str_padded("PROBE");
    let (handler, mut inbox) = capture();
    bob.registry.register(probe, handler);

    let stale_conn = alice.connector.connect(bob.addr).await.unwrap();
    stale_conn
        .write(Message::new(probe, b"old".to_vec(), Vec::new()))
        .await
        .unwrap();

    let current_conn = carol.connector.connect(bob.addr).await.unwrap();
    current_conn
        .write(Message::new(probe, b"new".to_vec(), Vec::new()))
        .await
        .unwrap();

    // Only the current-version message is dispatched; the stale one is
    // consumed without teardown.
    let (message, _, source) = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body, b"new");
    assert_eq!(source, carol.identity.address());
    assert!(inbox.try_recv().is_err());
    assert!(!stale_conn.is_closed());

    stale_conn.close(CloseMode::Forced).await;
    current_conn.close(CloseMode::Forced).await;
    for node in [&alice, &bob, &carol] {
        node.server.stop(CloseMode::Forced).await;
    }
}

#[tokio::test]
async fn oversized_message_tears_down_receiver() {
    let tiny_server = ServerConfig {
        connection: ConnectionConfig {
            max_frame_size: 1024,
            ..ConnectionConfig::default()
        },
        ..ServerConfig::default()
    };
    let quiet = ClientConfig {
        heartbeat_interval: None,
        ..ClientConfig::default()
    };
    let bob = start_node(tiny_server, quiet.clone()).await;
    let alice = start_node(ServerConfig::default(), quiet).await;

    let conn = alice.connector.connect(bob.addr).await.unwrap();
    assert_eq!(bob.server.connection_count(), 1);

    let bulk = CommandCode::from_str_padded("BULK");
    conn.write(Message::new(bulk, Vec::new(), vec![0u8; 4096]))
        .await
        .unwrap();

    // The receiver drops the connection; our end sees the socket close.
    timeout(Duration::from_secs(5), async {
        while bob.server.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    conn.close(CloseMode::Forced).await;
    bob.server.stop(CloseMode::Forced).await;
    alice.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn unicast_and_broadcast_reach_routed_connections() {
    let (alice, bob) = start_node_pair().await;
    let notify = CommandCode::from_str_padded("NOTIFY");
    let (handler, mut inbox) = capture();
    alice.registry.register(notify, handler);

    let conn = alice.connector.connect(bob.addr).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while bob.server.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let delivered = bob
        .server
        .broadcast(Message::new(notify, b"hello all".to_vec(), Vec::new()))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    let (message, _, source) = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body, b"hello all");
    assert_eq!(source, bob.identity.address());

    let err = bob
        .server
        .unicast(9999, Message::new(notify, Vec::new(), Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnknownConnection(9999)));

    conn.close(CloseMode::Graceful).await;
    bob.server.stop(CloseMode::Forced).await;
    alice.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn stopped_server_refuses_routing() {
    let quiet = ClientConfig {
        heartbeat_interval: None,
        ..ClientConfig::default()
    };
    let node = start_node(ServerConfig::default(), quiet).await;
    node.server.stop(CloseMode::Graceful).await;

    let notify = CommandCode::from_str_padded("NOTIFY");
    let err = node
        .server
        .unicast(1, Message::new(notify, Vec::new(), Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ServerClosed));

    let err = node
        .server
        .broadcast(Message::new(notify, Vec::new(), Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ServerClosed));

    let err = node
        .server
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ServerClosed));
}

/// Echoes latency probes back to the sender.
struct LatencyEcho;

#[async_trait]
impl MessageHandler for LatencyEcho {
    async fn handle(&self, message: Message, ctx: MessageContext) {
        let mut reply = Message::new(CommandCode::RSP_LATENCY, message.body, Vec::new());
        reply.req_id = ctx.req_id;
        let _ = ctx.writer.write(reply).await;
    }
}

/// Counts heartbeats.
struct HeartbeatCount {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler for HeartbeatCount {
    async fn handle(&self, _message: Message, _ctx: MessageContext) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn scheduler_runs_heartbeat_and_latency_jobs() {
    let beats = Arc::new(AtomicUsize::new(0));
    let chatty = ClientConfig {
        heartbeat_interval: Some(Duration::from_millis(100)),
        latency_interval: Some(Duration::from_millis(100)),
        ..ClientConfig::default()
    };
    let bob = start_node(
        ServerConfig::default(),
        ClientConfig {
            heartbeat_interval: None,
            ..ClientConfig::default()
        },
    )
    .await;
    bob.registry
        .register(CommandCode::REQ_LATENCY, Arc::new(LatencyEcho));
    bob.registry.register(
        CommandCode::REQ_HEARTBEAT,
        Arc::new(HeartbeatCount {
            count: Arc::clone(&beats),
        }),
    );
    let alice = start_node(ServerConfig::default(), chatty).await;

    let conn = alice.connector.connect(bob.addr).await.unwrap();
    let latency = alice.connector.latency();

    timeout(Duration::from_secs(5), async {
        while beats.load(Ordering::SeqCst) < 2 || latency.last_rtt().is_none() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap();
    assert!(latency.last_rtt().unwrap() > Duration::ZERO);

    let flow = conn.flow();
    assert!(flow.write_total > 0);

    conn.close(CloseMode::Graceful).await;
    bob.server.stop(CloseMode::Forced).await;
    alice.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn mis_signed_ephemeral_key_is_rejected() {
    use ed25519_dalek::{Signer, SigningKey};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let quiet = ClientConfig {
        heartbeat_interval: None,
        ..ClientConfig::default()
    };
    let bob = start_node(ServerConfig::default(), quiet).await;

    // A bare listener standing in for our node: it accepts bob's dial-back
    // but never completes the exchange.
    let decoy = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let decoy_port = decoy.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((socket, _)) = decoy.accept().await {
            // Hold the dial-back open until the test ends.
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        }
    });

    let mut stream = tokio::net::TcpStream::connect(bob.addr).await.unwrap();
    let mut bootstrap = [0u8; 7];
    bootstrap[0] = 1; // peer connection
    bootstrap[1..3].copy_from_slice(&decoy_port.to_be_bytes());
    bootstrap[3..7].copy_from_slice(&1u32.to_be_bytes());
    stream.write_all(&bootstrap).await.unwrap();

    // Syntactically valid key exchange, signed over the wrong bytes.
    let ephemeral = SigningKey::generate(&mut rand::rngs::OsRng);
    let mut kx = [0u8; 96];
    kx[..32].copy_from_slice(&ephemeral.verifying_key().to_bytes());
    kx[32..].copy_from_slice(&ephemeral.sign(b"not the handshake context").to_bytes());
    stream.write_all(&kx).await.unwrap();

    // The honest peer refuses and drops the socket.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
    assert_eq!(bob.server.connection_count(), 0);

    bob.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn connect_with_retry_gives_up_after_budget() {
    let quiet = ClientConfig {
        heartbeat_interval: None,
        reconnect: lattice_transport::ReconnectPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            max_attempts: Some(3),
            ..lattice_transport::ReconnectPolicy::default()
        },
        ..ClientConfig::default()
    };
    let alice = start_node(ServerConfig::default(), quiet).await;

    // A port nothing listens on: bind then drop.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let err = alice.connector.connect_with_retry(dead_addr).await;
    assert!(err.is_err());
    alice.server.stop(CloseMode::Forced).await;
}

#[tokio::test]
async fn connection_ceiling_rejects_extra_peers() {
    let capped = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let quiet = ClientConfig {
        heartbeat_interval: None,
        handshake_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    };
    let bob = start_node(capped, quiet.clone()).await;
    let alice = start_node(ServerConfig::default(), quiet.clone()).await;
    let carol = start_node(ServerConfig::default(), quiet).await;

    let first = alice.connector.connect(bob.addr).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while bob.server.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // At capacity the listener drops the socket before any handshake.
    assert!(carol.connector.connect(bob.addr).await.is_err());
    assert_eq!(bob.server.connection_count(), 1);

    first.close(CloseMode::Graceful).await;
    for node in [&alice, &bob, &carol] {
        node.server.stop(CloseMode::Forced).await;
    }
}
