//! Connections: the app-side record of an attached peer, and the handle a
//! local peer drives it with.
//!
//! A connection starts out owned by the app dispatcher. The first command
//! that resolves to an engine migrates the connection onto that graph; the
//! binding is decided once, under the binding lock, and never changes for
//! the connection's remaining lifetime.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::app::AppShared;
use crate::core::errors::{PlexusError, Result};
use crate::msg::{Message, PathId, WireMessage};

/// Outward leg of a connection, toward the remote peer.
pub trait PeerLink: Send + Sync {
    fn send(&self, msg: WireMessage) -> Result<()>;
}

/// In-process peer backed by a channel. Used by local clients and tests.
pub(crate) struct ChannelPeer(pub(crate) mpsc::Sender<WireMessage>);

impl PeerLink for ChannelPeer {
    fn send(&self, msg: WireMessage) -> Result<()> {
        self.0
            .send(msg)
            .map_err(|_| PlexusError::protocol("peer receiver dropped"))
    }
}

/// What a connection is currently attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Binding {
    /// Still serviced by the app dispatcher.
    Unbound,
    /// Migrated onto the engine running this graph.
    Engine(String),
}

pub struct ConnState {
    pub id: Uuid,
    peer: Box<dyn PeerLink>,
    binding: Mutex<Binding>,
}

impl ConnState {
    pub(crate) fn new(id: Uuid, peer: Box<dyn PeerLink>) -> ConnState {
        ConnState {
            id,
            peer,
            binding: Mutex::new(Binding::Unbound),
        }
    }

    pub fn send_to_peer(&self, msg: Message) -> Result<()> {
        self.peer.send(WireMessage::from_message(&msg))
    }

    pub(crate) fn binding(&self) -> Result<Binding> {
        Ok(self
            .binding
            .lock()
            .map_err(|_| PlexusError::internal("binding mutex poisoned"))?
            .clone())
    }

    /// Migrates the connection onto a graph. Idempotent for the same graph;
    /// a second migration to a different graph is refused.
    pub(crate) fn bind(&self, graph_id: &str) -> Result<()> {
        let mut binding = self
            .binding
            .lock()
            .map_err(|_| PlexusError::internal("binding mutex poisoned"))?;
        match &*binding {
            Binding::Unbound => {
                debug!(conn = %self.id, graph = %graph_id, "connection migrated");
                *binding = Binding::Engine(graph_id.to_string());
                Ok(())
            }
            Binding::Engine(bound) if bound == graph_id => Ok(()),
            Binding::Engine(bound) => Err(PlexusError::lifecycle(
                "connection",
                format!("already migrated to graph {bound}, refusing {graph_id}"),
            )),
        }
    }
}

/// Client half of an in-process connection. Dropping it closes the
/// connection and tears down any graph scoped to it.
pub struct ConnectionHandle {
    app: Weak<AppShared>,
    pub id: Uuid,
    rx: mpsc::Receiver<WireMessage>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        app: Weak<AppShared>,
        id: Uuid,
        rx: mpsc::Receiver<WireMessage>,
    ) -> ConnectionHandle {
        ConnectionHandle { app, id, rx }
    }

    fn app(&self) -> Result<Arc<AppShared>> {
        self.app
            .upgrade()
            .ok_or_else(|| PlexusError::lifecycle("connection", "app is gone"))
    }

    /// Fire-and-forget submission into the app.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.app()?.inbound_from_connection(self.id, msg)
    }

    /// Blocks for the next message addressed to this peer.
    pub fn recv(&self, timeout: Duration) -> Result<WireMessage> {
        self.rx.recv_timeout(timeout).map_err(|_| {
            PlexusError::timeout("connection recv", timeout.as_millis() as u64)
        })
    }

    /// Sends a command and blocks for its terminal result, matched by
    /// sequence id. Unrelated traffic arriving in between is dropped.
    pub fn request(&self, mut cmd: Message, timeout: Duration) -> Result<WireMessage> {
        let seq: PathId = cmd.origin_path_id.unwrap_or_else(Uuid::new_v4);
        cmd.origin_path_id = Some(seq);
        self.send(cmd)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    PlexusError::timeout("connection request", timeout.as_millis() as u64)
                })?;
            let wire = self.recv(remaining)?;
            if wire.seq_id.as_deref() == Some(seq.to_string().as_str()) {
                return Ok(wire);
            }
            debug!(conn = %self.id, seq = ?wire.seq_id, "discarding unmatched reply");
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(app) = self.app.upgrade() {
            app.connection_closed(self.id);
        }
    }
}
