//! Authenticated key agreement between peers.
//!
//! The handshake uses a dial-back topology. The dialer sends a plaintext
//! bootstrap record and its signed ephemeral key on the socket it opened,
//! then waits. The accepting node opens a second, short-lived socket back
//! to the dialer's listener and delivers its own signed ephemeral key
//! there, tagged with the channel id from the bootstrap so the dialer can
//! correlate it. Both sides then convert their Ed25519 ephemerals to
//! X25519, derive the session key, and exchange their declared node
//! addresses over the first encrypted frames. Reaching a node's listener
//! from its advertised address is therefore part of what the handshake
//! proves.

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lattice_crypto::{
    NodeAddress, NodeIdentity, NonceCounter, PUBLIC_KEY_SIZE, SIGNATURE_SIZE, SessionCipher,
    derive_shared_key,
};
use rand::Rng;
use rand::rngs::OsRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::framing;

/// Context string signed by ephemeral keys to prove liveness.
const HANDSHAKE_CONTEXT: &[u8] = b"lattice transport handshake v1";

/// Size of the plaintext bootstrap record.
pub const BOOTSTRAP_SIZE: usize = 7;

/// Size of the plaintext key-exchange record.
pub const KEY_EXCHANGE_SIZE: usize = PUBLIC_KEY_SIZE + SIGNATURE_SIZE;

/// Cap on the encrypted identity frame.
const IDENTITY_FRAME_MAX: usize = 256;

/// Role of an inbound socket, declared in its bootstrap record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    /// A peer connection that will carry traffic after the handshake.
    Peer,
    /// A short-lived dial-back socket delivering key-exchange material.
    Callback,
}

impl ConnType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Peer => 1,
            Self::Callback => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, TransportError> {
        match b {
            1 => Ok(Self::Peer),
            2 => Ok(Self::Callback),
            other => Err(TransportError::InvalidPeerIdentity(format!(
                "unknown connection type {other}"
            ))),
        }
    }
}

/// The plaintext record that opens every inbound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrap {
    /// Declared role of the socket.
    pub conn_type: ConnType,
    /// The sender's listener port, used for the dial-back.
    pub listener_port: u16,
    /// Correlation id for the dial-back delivery.
    pub channel_id: u32,
}

impl Bootstrap {
    fn encode(&self) -> [u8; BOOTSTRAP_SIZE] {
        let mut out = [0u8; BOOTSTRAP_SIZE];
        out[0] = self.conn_type.to_byte();
        out[1..3].copy_from_slice(&self.listener_port.to_be_bytes());
        out[3..7].copy_from_slice(&self.channel_id.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8; BOOTSTRAP_SIZE]) -> Result<Self, TransportError> {
        Ok(Self {
            conn_type: ConnType::from_byte(bytes[0])?,
            listener_port: u16::from_be_bytes([bytes[1], bytes[2]]),
            channel_id: u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        })
    }
}

/// A signed ephemeral public key.
struct KeyExchange {
    ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    signature: [u8; SIGNATURE_SIZE],
}

impl KeyExchange {
    fn new(ephemeral: &SigningKey) -> Self {
        Self {
            ephemeral_public: ephemeral.verifying_key().to_bytes(),
            signature: ephemeral.sign(HANDSHAKE_CONTEXT).to_bytes(),
        }
    }

    fn encode(&self) -> [u8; KEY_EXCHANGE_SIZE] {
        let mut out = [0u8; KEY_EXCHANGE_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.ephemeral_public);
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.signature);
        out
    }

    /// Parse and verify the self-signature, returning the ephemeral key.
    fn verify(bytes: &[u8; KEY_EXCHANGE_SIZE]) -> Result<VerifyingKey, TransportError> {
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        let mut signature = [0u8; SIGNATURE_SIZE];
        public.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        signature.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);

        let key = VerifyingKey::from_bytes(&public)
            .map_err(|_| TransportError::InvalidHandshakeSignature)?;
        key.verify(HANDSHAKE_CONTEXT, &Signature::from_bytes(&signature))
            .map_err(|_| TransportError::InvalidHandshakeSignature)?;
        Ok(key)
    }
}

/// Everything the connection engine needs after a completed handshake.
pub struct SessionContext {
    /// The shared session cipher.
    pub cipher: Arc<SessionCipher>,
    /// Nonce counter for frames this side sends.
    pub send_counter: Arc<NonceCounter>,
    /// Nonce counter for frames this side receives.
    pub recv_counter: Arc<NonceCounter>,
    /// Declared address of the remote node, validated against the
    /// network address encoding.
    pub peer_address: NodeAddress,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("peer_address", &self.peer_address)
            .finish_non_exhaustive()
    }
}

/// Pending dial-side handshakes awaiting their dial-back delivery.
///
/// Shared between a node's connector and its listener; constructed by the
/// caller and injected into both, never a global.
#[derive(Debug, Default)]
pub struct HandshakeRegistry {
    pending: DashMap<u32, oneshot::Sender<[u8; KEY_EXCHANGE_SIZE]>>,
}

impl HandshakeRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh channel id and the receiver its delivery will land on.
    pub fn register(&self) -> (u32, oneshot::Receiver<[u8; KEY_EXCHANGE_SIZE]>) {
        loop {
            let id: u32 = OsRng.gen();
            if let dashmap::Entry::Vacant(slot) = self.pending.entry(id) {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    /// Deliver dial-back bytes to the waiting handshake, if any.
    pub fn deliver(&self, channel_id: u32, bytes: [u8; KEY_EXCHANGE_SIZE]) -> bool {
        match self.pending.remove(&channel_id) {
            Some((_, tx)) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Drop a reservation. Harmless if the delivery already happened.
    pub fn remove(&self, channel_id: u32) {
        self.pending.remove(&channel_id);
    }
}

/// Outcome of handling one inbound socket.
pub enum AcceptOutcome {
    /// A full peer handshake completed; the socket carries traffic now.
    Established(SessionContext),
    /// The socket was a dial-back; its payload was delivered and the
    /// caller should drop the socket.
    CallbackDelivered,
}

/// Run the dial side of the handshake on a freshly connected socket.
///
/// `listener_port` is this node's own listener, where the peer's dial-back
/// will arrive; that listener must route `ConnType::Callback` sockets into
/// the same `registry`.
pub async fn initiate(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
    registry: &HandshakeRegistry,
    listener_port: u16,
    timeout: Duration,
) -> Result<SessionContext, TransportError> {
    let (channel_id, callback_rx) = registry.register();
    let result = tokio::time::timeout(
        timeout,
        initiate_inner(stream, identity, callback_rx, channel_id, listener_port),
    )
    .await
    .unwrap_or(Err(TransportError::HandshakeTimeout));
    registry.remove(channel_id);
    result
}

async fn initiate_inner(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
    callback_rx: oneshot::Receiver<[u8; KEY_EXCHANGE_SIZE]>,
    channel_id: u32,
    listener_port: u16,
) -> Result<SessionContext, TransportError> {
    let bootstrap = Bootstrap {
        conn_type: ConnType::Peer,
        listener_port,
        channel_id,
    };
    stream.write_all(&bootstrap.encode()).await?;

    let ephemeral = SigningKey::generate(&mut OsRng);
    stream.write_all(&KeyExchange::new(&ephemeral).encode()).await?;

    trace!(channel_id, "awaiting dial-back key exchange");
    let callback_bytes = callback_rx
        .await
        .map_err(|_| TransportError::ConnectionClosed)?;
    let peer_ephemeral = KeyExchange::verify(&callback_bytes)?;
    let key = derive_shared_key(&ephemeral, &peer_ephemeral)?;

    let cipher = Arc::new(SessionCipher::new(&key));
    let send_counter = Arc::new(NonceCounter::new());
    let recv_counter = Arc::new(NonceCounter::new());

    // Accept side sends its identity first; mirror that here.
    let peer_address = read_identity(stream, &cipher, &recv_counter).await?;
    write_identity(stream, &cipher, &send_counter, identity).await?;

    debug!(peer = %peer_address, "handshake complete (dial side)");
    Ok(SessionContext {
        cipher,
        send_counter,
        recv_counter,
        peer_address,
    })
}

/// Run the accept side of the handshake on an inbound socket.
///
/// `registry` receives dial-back payloads when the socket turns out to be
/// a `Callback` rather than a peer.
pub async fn respond(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
    registry: &HandshakeRegistry,
    timeout: Duration,
) -> Result<AcceptOutcome, TransportError> {
    tokio::time::timeout(timeout, respond_inner(stream, identity, registry))
        .await
        .unwrap_or(Err(TransportError::HandshakeTimeout))
}

async fn respond_inner(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
    registry: &HandshakeRegistry,
) -> Result<AcceptOutcome, TransportError> {
    let mut bootstrap_buf = [0u8; BOOTSTRAP_SIZE];
    stream.read_exact(&mut bootstrap_buf).await?;
    let bootstrap = Bootstrap::decode(&bootstrap_buf)?;

    match bootstrap.conn_type {
        ConnType::Callback => {
            let mut kx = [0u8; KEY_EXCHANGE_SIZE];
            stream.read_exact(&mut kx).await?;
            if !registry.deliver(bootstrap.channel_id, kx) {
                debug!(
                    channel_id = bootstrap.channel_id,
                    "dial-back for unknown handshake channel"
                );
            }
            Ok(AcceptOutcome::CallbackDelivered)
        }
        ConnType::Peer => {
            let ephemeral = SigningKey::generate(&mut OsRng);
            dial_back(stream.peer_addr()?, &bootstrap, &ephemeral).await?;

            let mut kx = [0u8; KEY_EXCHANGE_SIZE];
            stream.read_exact(&mut kx).await?;
            let peer_ephemeral = KeyExchange::verify(&kx)?;
            let key = derive_shared_key(&ephemeral, &peer_ephemeral)?;

            let cipher = Arc::new(SessionCipher::new(&key));
            let send_counter = Arc::new(NonceCounter::new());
            let recv_counter = Arc::new(NonceCounter::new());

            write_identity(stream, &cipher, &send_counter, identity).await?;
            let peer_address = read_identity(stream, &cipher, &recv_counter).await?;

            debug!(peer = %peer_address, "handshake complete (accept side)");
            Ok(AcceptOutcome::Established(SessionContext {
                cipher,
                send_counter,
                recv_counter,
                peer_address,
            }))
        }
    }
}

/// Open the short-lived dial-back socket and deliver our key exchange.
async fn dial_back(
    peer: SocketAddr,
    bootstrap: &Bootstrap,
    ephemeral: &SigningKey,
) -> Result<(), TransportError> {
    let target = SocketAddr::new(peer.ip(), bootstrap.listener_port);
    let mut callback = TcpStream::connect(target).await?;
    let reply = Bootstrap {
        conn_type: ConnType::Callback,
        listener_port: 0,
        channel_id: bootstrap.channel_id,
    };
    callback.write_all(&reply.encode()).await?;
    callback
        .write_all(&KeyExchange::new(ephemeral).encode())
        .await?;
    callback.shutdown().await?;
    Ok(())
}

/// Send our declared address as the first encrypted frame.
async fn write_identity<S>(
    stream: &mut S,
    cipher: &SessionCipher,
    counter: &NonceCounter,
    identity: &NodeIdentity,
) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    framing::write_frame(stream, cipher, counter, identity.address().as_str().as_bytes()).await
}

/// Read the peer's self-declared address and validate it against the
/// network address encoding. The declaration is authenticated only by
/// arriving inside the channel the verified key exchange established.
async fn read_identity<S>(
    stream: &mut S,
    cipher: &SessionCipher,
    counter: &NonceCounter,
) -> Result<NodeAddress, TransportError>
where
    S: AsyncRead + Unpin,
{
    let frame = framing::read_frame(stream, cipher, counter, IDENTITY_FRAME_MAX).await?;
    let declared = std::str::from_utf8(&frame).map_err(|_| {
        TransportError::InvalidPeerIdentity("identity frame is not utf-8".to_owned())
    })?;
    NodeAddress::parse(declared).map_err(|err| TransportError::InvalidPeerIdentity(err.to_string()))
}
