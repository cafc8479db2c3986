//! Message handler registration and dispatch context.
//!
//! Handlers are keyed by command code. A registry is an ordinary value
//! shared by the connections that should route through it; nothing here is
//! process-global. A lookup miss is normal traffic, not an error: the
//! fallback handler sees it if one is installed, otherwise the message is
//! logged and dropped.

use async_trait::async_trait;
use dashmap::DashMap;
use lattice_crypto::NodeAddress;
use lattice_wire::{CommandCode, Message};
use std::sync::Arc;
use std::time::Instant;

use crate::connection::ConnectionWriter;

/// Context handed to a handler alongside the message.
#[derive(Clone)]
pub struct MessageContext {
    /// Correlation id of the inbound message.
    pub req_id: u64,
    /// When the read task finished receiving the message.
    pub recv_start: Instant,
    /// Verified address of the sending peer.
    pub source: NodeAddress,
    /// Write handle for replies on the same connection.
    pub writer: ConnectionWriter,
}

/// An application message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one inbound message. Runs on the connection's dispatch task;
    /// the next message is not dispatched until this returns.
    async fn handle(&self, message: Message, ctx: MessageContext);
}

/// A table of handlers keyed by command code.
#[derive(Default)]
pub struct Registry {
    handlers: DashMap<CommandCode, Arc<dyn MessageHandler>>,
    fallback: std::sync::RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for a command, replacing any previous one.
    pub fn register(&self, command: CommandCode, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(command, handler);
    }

    /// Install the fallback handler for unregistered commands.
    pub fn set_fallback(&self, handler: Arc<dyn MessageHandler>) {
        *self.fallback.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Look up the handler for a command, falling back if none is registered.
    #[must_use]
    pub fn resolve(&self, command: &CommandCode) -> Option<Arc<dyn MessageHandler>> {
        if let Some(handler) = self.handlers.get(command) {
            return Some(Arc::clone(handler.value()));
        }
        self.fallback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}
