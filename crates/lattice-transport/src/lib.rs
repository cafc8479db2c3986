//! # Lattice Transport
//!
//! The peer transport layer of the Lattice decentralized storage network:
//! authenticated dial-back handshakes, length-prefixed AEAD framing, and a
//! three-task connection engine with bounded queues and idempotent
//! teardown.
//!
//! ## Topology
//!
//! Every node runs one [`Server`] (its listener) and any number of
//! [`Connector`]s. The two share a [`HandshakeRegistry`], because the
//! handshake is dial-back shaped: a peer accepting our connection proves
//! itself by opening a short-lived socket back to our listener and
//! delivering its key-exchange material there.
//!
//! ## Message flow
//!
//! Established connections exchange [`Message`](lattice_wire::Message)s.
//! Inbound messages are routed by command code through a [`Registry`] of
//! handlers; outbound messages are signed with the node identity, stamped
//! with a request id, and written strictly in enqueue order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod error;
pub mod flow;
pub mod framing;
pub mod handshake;
pub mod registry;
pub mod reqid;
pub mod server;

pub use client::{ClientConfig, Connector, LatencyProbe, ReconnectPolicy};
pub use connection::{
    CloseMode, Connection, ConnectionConfig, ConnectionHooks, ConnectionParams, ConnectionWriter,
    RateLimit,
};
pub use error::TransportError;
pub use flow::{FlowCounters, FlowSnapshot, TokenBucket};
pub use handshake::{AcceptOutcome, HandshakeRegistry, SessionContext};
pub use registry::{MessageContext, MessageHandler, Registry};
pub use reqid::ReqIdGenerator;
pub use server::{Server, ServerConfig};
