//! The per-connection concurrency engine.
//!
//! Every established connection runs three tasks over bounded queues:
//!
//! - **read**: pulls frames off the socket, decodes and verifies them,
//!   and pushes inbound messages to the dispatch queue
//! - **write**: pops queued outbound messages in FIFO order, seals and
//!   writes them with a per-write deadline
//! - **dispatch**: runs one registered handler at a time, in arrival order
//!
//! A `watch` channel carries the close signal. Any task exiting, for any
//! reason, trips the signal so the others unwind; a supervisor task joins
//! all three and then runs teardown exactly once, no matter how many
//! callers raced to close. `close()` returns only after teardown is done.

use lattice_crypto::{NodeAddress, NodeIdentity, NonceCounter, SessionCipher};
use lattice_wire::{CommandCode, HEADER_SIZE, Message, MessageHeader, MessageSign};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::flow::{FlowCounters, FlowSnapshot, TokenBucket};
use crate::framing;
use crate::handshake::SessionContext;
use crate::registry::{MessageContext, Registry};
use crate::reqid::ReqIdGenerator;

/// How a connection should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop reading, flush the already-queued outbound messages, then stop.
    Graceful,
    /// Drop everything immediately.
    Forced,
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Open,
    Closing(CloseMode),
}

/// A bytes-per-second cap for one bulk command.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Sustained bytes per second.
    pub rate: u64,
    /// Burst capacity in bytes.
    pub burst: u64,
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest body segment accepted or produced, in bytes.
    pub max_frame_size: usize,
    /// Idle deadline refreshed before every read.
    pub read_timeout: Duration,
    /// Deadline applied to each message write.
    pub write_timeout: Duration,
    /// Outbound queue depth.
    pub send_queue_len: usize,
    /// Inbound dispatch queue depth.
    pub dispatch_queue_len: usize,
    /// Version stamped on outbound messages.
    pub local_version: u16,
    /// Inbound messages below this version are silently skipped.
    pub min_app_version: u16,
    /// Optional cap on inbound download-slice responses.
    pub inbound_limit: Option<RateLimit>,
    /// Optional cap on outbound upload-slice requests.
    pub outbound_limit: Option<RateLimit>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(30),
            send_queue_len: 1024,
            dispatch_queue_len: 1024,
            local_version: 1,
            min_app_version: 0,
            inbound_limit: None,
            outbound_limit: None,
        }
    }
}

/// Per-command write observation: command, bytes on the wire, elapsed time.
pub type WriteHook = Arc<dyn Fn(CommandCode, u64, Duration) + Send + Sync>;

/// Runs once at teardown with the connection id and the close mode.
pub type CloseHook = Box<dyn FnOnce(u64, CloseMode) + Send>;

/// Callbacks installed when the connection is spawned.
#[derive(Default)]
pub struct ConnectionHooks {
    /// Teardown callback; runs exactly once.
    pub on_close: Option<CloseHook>,
    /// Observed after every completed message write.
    pub on_write: Option<WriteHook>,
}

/// Everything `Connection::spawn` needs besides the socket and session.
pub struct ConnectionParams {
    /// Server-assigned or connector-assigned connection id.
    pub id: u64,
    /// Engine tunables.
    pub config: ConnectionConfig,
    /// Identity used to sign outbound messages. Without one, only
    /// pre-signed messages can be written.
    pub identity: Option<Arc<NodeIdentity>>,
    /// Handler table consulted by the dispatch task.
    pub registry: Arc<Registry>,
    /// Request id source for outbound messages with no id.
    pub req_ids: Arc<ReqIdGenerator>,
    /// Lifecycle callbacks.
    pub hooks: ConnectionHooks,
}

struct SignedOutbound {
    message: Message,
    sign: MessageSign,
}

/// A cheap clonable handle for enqueueing outbound messages.
#[derive(Clone)]
pub struct ConnectionWriter {
    queue: mpsc::Sender<SignedOutbound>,
    signer: Option<Arc<NodeIdentity>>,
    req_ids: Arc<ReqIdGenerator>,
    local_version: u16,
    max_frame_size: usize,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl ConnectionWriter {
    /// Sign, stamp, and enqueue one message. Returns its request id.
    ///
    /// Messages that already carry a sign block keep it; otherwise the
    /// connection identity signs the body. A message whose segment would
    /// exceed the frame cap is refused with `FrameTooLarge` before it is
    /// queued, so an `Ok` here means the message will reach the wire
    /// unless the connection dies first. Waits when the queue is full,
    /// but never blocks past engine shutdown.
    pub async fn write(&self, mut message: Message) -> Result<u64, TransportError> {
        if !matches!(*self.lifecycle.borrow(), Lifecycle::Open) {
            return Err(TransportError::ConnectionClosed);
        }
        let segment_len = message.header().segment_len();
        if segment_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: segment_len,
                max: self.max_frame_size,
            });
        }
        let sign = match (&message.sign, &self.signer) {
            (Some(sign), _) => sign.clone(),
            (None, Some(identity)) => MessageSign::sign(identity, &message.body),
            (None, None) => return Err(TransportError::MissingSignatureInfo),
        };
        if message.req_id == 0 {
            message.req_id = self.req_ids.next();
        }
        message.version = self.local_version;
        let req_id = message.req_id;
        self.queue
            .send(SignedOutbound { message, sign })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(req_id)
    }
}

impl std::fmt::Debug for ConnectionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWriter").finish_non_exhaustive()
    }
}

/// An established, running connection.
pub struct Connection {
    id: u64,
    peer_address: NodeAddress,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    writer: ConnectionWriter,
    flow: Arc<FlowCounters>,
    lifecycle_tx: Arc<watch::Sender<Lifecycle>>,
    done: watch::Receiver<bool>,
    jobs: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Connection {
    /// Start the engine on a socket that completed its handshake.
    pub fn spawn(
        stream: TcpStream,
        session: SessionContext,
        params: ConnectionParams,
    ) -> Result<Self, TransportError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let config = params.config;
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Open);
        let lifecycle_tx = Arc::new(lifecycle_tx);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_len);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_len);
        let (done_tx, done_rx) = watch::channel(false);
        let flow = Arc::new(FlowCounters::new());
        let jobs: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let writer = ConnectionWriter {
            queue: send_tx,
            signer: params.identity,
            req_ids: params.req_ids,
            local_version: config.local_version,
            max_frame_size: config.max_frame_size,
            lifecycle: lifecycle_rx.clone(),
        };

        let read_task = ReadTask {
            id: params.id,
            half: read_half,
            cipher: Arc::clone(&session.cipher),
            counter: Arc::clone(&session.recv_counter),
            config: config.clone(),
            peer_address: session.peer_address.clone(),
            flow: Arc::clone(&flow),
            dispatch: dispatch_tx,
            inbound_bucket: config.inbound_limit.map(|l| TokenBucket::new(l.rate, l.burst)),
            lifecycle: lifecycle_rx.clone(),
            cancel: Arc::clone(&lifecycle_tx),
        };
        let write_task = WriteTask {
            id: params.id,
            half: write_half,
            cipher: Arc::clone(&session.cipher),
            counter: Arc::clone(&session.send_counter),
            config: config.clone(),
            flow: Arc::clone(&flow),
            queue: send_rx,
            on_write: params.hooks.on_write,
            outbound_bucket: config.outbound_limit.map(|l| TokenBucket::new(l.rate, l.burst)),
            lifecycle: lifecycle_rx.clone(),
            cancel: Arc::clone(&lifecycle_tx),
        };
        let dispatch_task = DispatchTask {
            id: params.id,
            queue: dispatch_rx,
            registry: params.registry,
            peer_address: session.peer_address.clone(),
            writer: writer.clone(),
            lifecycle: lifecycle_rx.clone(),
            cancel: Arc::clone(&lifecycle_tx),
        };

        let read_handle = tokio::spawn(read_task.run());
        let write_handle = tokio::spawn(write_task.run());
        let dispatch_handle = tokio::spawn(dispatch_task.run());

        // Supervisor: join every loop, then tear down exactly once.
        let supervisor_jobs = Arc::clone(&jobs);
        let supervisor_lifecycle = lifecycle_rx.clone();
        let on_close = params.hooks.on_close;
        let conn_id = params.id;
        tokio::spawn(async move {
            let _ = read_handle.await;
            let _ = write_handle.await;
            let _ = dispatch_handle.await;
            let drained: Vec<_> = {
                let mut jobs = supervisor_jobs.lock().unwrap_or_else(|e| e.into_inner());
                jobs.drain(..).collect()
            };
            for job in drained {
                job.abort();
            }
            let mode = match *supervisor_lifecycle.borrow() {
                Lifecycle::Closing(mode) => mode,
                Lifecycle::Open => CloseMode::Forced,
            };
            if let Some(hook) = on_close {
                hook(conn_id, mode);
            }
            trace!(id = conn_id, ?mode, "connection torn down");
            let _ = done_tx.send(true);
        });

        let conn = Self {
            id: params.id,
            peer_address: session.peer_address,
            local_addr,
            remote_addr,
            writer,
            flow,
            lifecycle_tx,
            done: done_rx,
            jobs,
        };
        conn.spawn_flow_roll();
        Ok(conn)
    }

    /// Enqueue one outbound message. See [`ConnectionWriter::write`].
    pub async fn write(&self, message: Message) -> Result<u64, TransportError> {
        self.writer.write(message).await
    }

    /// A clonable write handle usable from handlers and scheduler jobs.
    #[must_use]
    pub fn writer(&self) -> ConnectionWriter {
        self.writer.clone()
    }

    /// Close the connection and wait until teardown has finished.
    ///
    /// Safe to call repeatedly and concurrently; the first caller picks
    /// the mode, every caller waits on the same completion.
    pub async fn close(&self, mode: CloseMode) {
        self.lifecycle_tx.send_if_modified(|state| {
            if matches!(state, Lifecycle::Open) {
                *state = Lifecycle::Closing(mode);
                true
            } else {
                false
            }
        });
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    /// Whether the engine has started (or finished) shutting down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !matches!(*self.lifecycle_tx.borrow(), Lifecycle::Open)
    }

    /// Run an async job on a fixed period until the connection closes.
    ///
    /// Jobs are aborted at teardown; a job must not outlive its tick.
    pub fn on_interval<F, Fut>(&self, period: Duration, mut job: F)
    where
        F: FnMut(ConnectionWriter) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let writer = self.writer.clone();
        let mut lifecycle = self.writer.lifecycle.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = lifecycle.changed() => break,
                    _ = tick.tick() => job(writer.clone()).await,
                }
            }
        });
        self.track_job(handle);
    }

    /// The connection id assigned at spawn.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Verified address of the remote node.
    #[must_use]
    pub fn peer_address(&self) -> &NodeAddress {
        &self.peer_address
    }

    /// Local socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current flow counters.
    #[must_use]
    pub fn flow(&self) -> FlowSnapshot {
        self.flow.snapshot()
    }

    fn track_job(&self, handle: JoinHandle<()>) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Roll the per-second flow window once a second.
    fn spawn_flow_roll(&self) {
        let flow = Arc::clone(&self.flow);
        let mut lifecycle = self.writer.lifecycle.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = lifecycle.changed() => break,
                    _ = tick.tick() => flow.roll_window(),
                }
            }
        });
        self.track_job(handle);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer_address)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

fn cancel(lifecycle_tx: &watch::Sender<Lifecycle>) {
    lifecycle_tx.send_if_modified(|state| {
        if matches!(state, Lifecycle::Open) {
            *state = Lifecycle::Closing(CloseMode::Forced);
            true
        } else {
            false
        }
    });
}

struct ReadTask {
    id: u64,
    half: OwnedReadHalf,
    cipher: Arc<SessionCipher>,
    counter: Arc<NonceCounter>,
    config: ConnectionConfig,
    peer_address: NodeAddress,
    flow: Arc<FlowCounters>,
    dispatch: mpsc::Sender<(Message, Instant)>,
    inbound_bucket: Option<TokenBucket>,
    lifecycle: watch::Receiver<Lifecycle>,
    cancel: Arc<watch::Sender<Lifecycle>>,
}

impl ReadTask {
    async fn run(mut self) {
        let mut lifecycle = self.lifecycle.clone();
        loop {
            tokio::select! {
                biased;
                _ = lifecycle.changed() => break,
                result = tokio::time::timeout(self.config.read_timeout, self.read_one()) => match result {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => break, // dispatch side gone
                    Ok(Err(err)) => {
                        match &err {
                            TransportError::Io(io)
                                if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                            {
                                debug!(id = self.id, "peer closed the connection");
                            }
                            other => {
                                warn!(id = self.id, error = %other, "read loop failed");
                            }
                        }
                        break;
                    }
                    Err(_) => {
                        debug!(id = self.id, "connection idle past read timeout");
                        break;
                    }
                },
            }
        }
        cancel(&self.cancel);
    }

    /// Read and route one message. `Ok(false)` means the dispatch queue is
    /// gone and the loop should stop.
    async fn read_one(&mut self) -> Result<bool, TransportError> {
        let header_frame =
            framing::read_frame(&mut self.half, &self.cipher, &self.counter, HEADER_SIZE).await?;
        let header_bytes: [u8; HEADER_SIZE] = header_frame.as_slice().try_into().map_err(|_| {
            TransportError::Wire(lattice_wire::WireError::InvalidLength {
                expected: HEADER_SIZE,
                actual: header_frame.len(),
            })
        })?;
        let header = MessageHeader::decode(&header_bytes);

        let segment_len = header.segment_len();
        if segment_len > self.config.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: segment_len,
                max: self.config.max_frame_size,
            });
        }
        let segment =
            framing::read_frame(&mut self.half, &self.cipher, &self.counter, segment_len).await?;
        let recv_start = Instant::now();
        self.flow.record_read((HEADER_SIZE + segment.len()) as u64);

        // Stale versions are skipped, not answered. Both frames are already
        // decrypted at this point, so the nonce counters stay aligned.
        if header.version < self.config.min_app_version {
            debug!(
                id = self.id,
                version = header.version,
                min = self.config.min_app_version,
                command = %header.command,
                "skipping message below minimum version"
            );
            return Ok(true);
        }

        let message = Message::decode_segment(&header, &segment)?;
        if let Some(sign) = &message.sign {
            if let Err(err) = sign.verify(&message.body, &self.peer_address) {
                warn!(
                    id = self.id,
                    command = %message.command,
                    error = %err,
                    "dropping message with bad signature"
                );
                return Ok(true);
            }
        }

        if message.command == CommandCode::RSP_DOWNLOAD_SLICE {
            if let Some(bucket) = &self.inbound_bucket {
                let wait = bucket.debit(segment.len() as u64);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        Ok(self.dispatch.send((message, recv_start)).await.is_ok())
    }
}

struct WriteTask {
    id: u64,
    half: OwnedWriteHalf,
    cipher: Arc<SessionCipher>,
    counter: Arc<NonceCounter>,
    config: ConnectionConfig,
    flow: Arc<FlowCounters>,
    queue: mpsc::Receiver<SignedOutbound>,
    on_write: Option<WriteHook>,
    outbound_bucket: Option<TokenBucket>,
    lifecycle: watch::Receiver<Lifecycle>,
    cancel: Arc<watch::Sender<Lifecycle>>,
}

impl WriteTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.lifecycle.changed() => {
                    if matches!(*self.lifecycle.borrow(), Lifecycle::Closing(CloseMode::Graceful)) {
                        self.drain().await;
                    }
                    break;
                }
                item = self.queue.recv() => match item {
                    Some(out) => {
                        if let Err(err) = self.write_one(out).await {
                            warn!(id = self.id, error = %err, "write loop failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        cancel(&self.cancel);
    }

    /// Flush messages that were already queued when the graceful close
    /// landed. New writes are refused upstream by then.
    async fn drain(&mut self) {
        while let Ok(out) = self.queue.try_recv() {
            if let Err(err) = self.write_one(out).await {
                warn!(id = self.id, error = %err, "drain aborted");
                break;
            }
        }
    }

    async fn write_one(&mut self, out: SignedOutbound) -> Result<(), TransportError> {
        let start = Instant::now();
        let header = out.message.header();
        let segment = out.message.encode_segment(&out.sign);

        if out.message.command == CommandCode::REQ_UPLOAD_SLICE {
            if let Some(bucket) = &self.outbound_bucket {
                let wait = bucket.debit(segment.len() as u64);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        tokio::time::timeout(self.config.write_timeout, async {
            framing::write_frame(&mut self.half, &self.cipher, &self.counter, &header.encode())
                .await?;
            framing::write_frame(&mut self.half, &self.cipher, &self.counter, &segment).await
        })
        .await
        .map_err(|_| TransportError::Io(std::io::ErrorKind::TimedOut.into()))??;

        let bytes = (HEADER_SIZE + segment.len()) as u64;
        self.flow.record_write(bytes);
        if let Some(hook) = &self.on_write {
            hook(out.message.command, bytes, start.elapsed());
        }
        Ok(())
    }
}

struct DispatchTask {
    id: u64,
    queue: mpsc::Receiver<(Message, Instant)>,
    registry: Arc<Registry>,
    peer_address: NodeAddress,
    writer: ConnectionWriter,
    lifecycle: watch::Receiver<Lifecycle>,
    cancel: Arc<watch::Sender<Lifecycle>>,
}

impl DispatchTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.lifecycle.changed() => break,
                item = self.queue.recv() => match item {
                    Some((message, recv_start)) => self.dispatch_one(message, recv_start).await,
                    None => break,
                },
            }
        }
        cancel(&self.cancel);
    }

    async fn dispatch_one(&self, message: Message, recv_start: Instant) {
        let Some(handler) = self.registry.resolve(&message.command) else {
            debug!(id = self.id, command = %message.command, "no handler registered");
            return;
        };
        let ctx = MessageContext {
            req_id: message.req_id,
            recv_start,
            source: self.peer_address.clone(),
            writer: self.writer.clone(),
        };
        handler.handle(message, ctx).await;
    }
}
