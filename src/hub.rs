//! # Broadcast Hub
//!
//! ## Responsibility
//! Owns the message history and the connection registry and implements the
//! relay protocol: history replay on connect, append-and-broadcast of
//! messages, and relay of typing presence to everyone but the sender.
//!
//! ## Guarantees
//! - Serial: [`Hub`] is plain `&mut self` state. In production it lives inside
//!   one task ([`spawn`]) that applies [`HubCommand`]s one at a time, so the
//!   history is never mutated concurrently and needs no lock.
//! - Snapshot consistency: a new connection receives `previousMessages`
//!   before any broadcast issued after its `Connect` command, and no message
//!   is both in the snapshot and delivered live.
//! - Non-blocking: fan-out uses [`Outbound::deliver`], which never waits on a
//!   slow client.
//!
//! ## NOT Responsible For
//! - Payload validation (done in [`crate::protocol::decode`] before a command
//!   is submitted)
//! - Socket I/O (see [`crate::session`])

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{ProtocolError, RelayError};
use crate::history::History;
use crate::protocol::{ClientEvent, ErrorNotice, Message, NewMessage, Presence, ServerEvent};
use crate::registry::{ConnectionId, Delivery, Outbound, OutboundQueue, Registry};

pub struct Hub<C> {
    history: History,
    registry: Registry<C>,
    config: HubConfig,
}

impl<C: Outbound> Hub<C> {
    pub fn new(config: HubConfig) -> Self {
        Self {
            history: History::new(config.max_history.max(1)),
            registry: Registry::new(),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a connection and send it the current history, to it alone.
    pub fn on_connect(&mut self, id: ConnectionId, outbound: C) {
        self.registry.register(id, outbound);
        let snapshot = Arc::new(ServerEvent::PreviousMessages(self.history.snapshot()));
        if self.registry.send_to(id, snapshot) == Some(Delivery::Closed) {
            self.registry.unregister(id);
            debug!(conn = %id, "connection closed before history was delivered");
            return;
        }
        info!(
            conn = %id,
            connections = self.registry.len(),
            history = self.history.len(),
            "connection registered"
        );
    }

    /// Stamp, store and broadcast a message. Returns the stored message.
    pub fn on_message(&mut self, id: ConnectionId, message: NewMessage) -> Arc<Message> {
        self.registry.note_username(id, &message.username);
        let message = Arc::new(message.into_message(uuid::Uuid::new_v4().to_string()));

        if let Some(evicted) = self.history.push(Arc::clone(&message)) {
            debug!(evicted = %evicted.id, "history full, evicted oldest message");
        }

        let event = Arc::new(ServerEvent::Message(Arc::clone(&message)));
        let closed = if self.config.echo_to_sender {
            self.registry.broadcast_all(&event)
        } else {
            self.registry.broadcast_except(id, &event)
        };
        debug!(
            conn = %id,
            message = %message.id,
            recipients = self.registry.len(),
            "message relayed"
        );
        self.reap(closed);
        message
    }

    pub fn on_typing(&mut self, id: ConnectionId, presence: Presence) {
        self.registry.note_username(id, &presence.username);
        let event = Arc::new(ServerEvent::Typing(presence));
        let closed = self.registry.broadcast_except(id, &event);
        self.reap(closed);
    }

    pub fn on_stop_typing(&mut self, id: ConnectionId) {
        let event = Arc::new(ServerEvent::StopTyping {});
        let closed = self.registry.broadcast_except(id, &event);
        self.reap(closed);
    }

    /// Drop a connection. Returns `false` if it was already gone.
    pub fn on_disconnect(&mut self, id: ConnectionId) -> bool {
        let username = self.registry.username(id).map(str::to_owned);
        if !self.registry.unregister(id) {
            return false;
        }
        info!(conn = %id, connections = self.registry.len(), "connection unregistered");

        if self.config.announce_departures {
            if let Some(username) = username {
                let event = Arc::new(ServerEvent::UserLeft(Presence { username }));
                let closed = self.registry.broadcast_all(&event);
                self.reap(closed);
            }
        }
        true
    }

    /// Tell one connection its frame was refused. Nothing is stored or relayed.
    pub fn reject(&mut self, id: ConnectionId, error: &ProtocolError) {
        warn!(conn = %id, code = error.code(), %error, "rejected client frame");
        let event = Arc::new(ServerEvent::Error(ErrorNotice::from(error)));
        if self.registry.send_to(id, event) == Some(Delivery::Closed) {
            self.on_disconnect(id);
        }
    }

    /// Dispatch a validated client event.
    pub fn handle(&mut self, id: ConnectionId, event: ClientEvent) {
        if !self.registry.contains(id) {
            debug!(conn = %id, "ignoring event from unregistered connection");
            return;
        }
        match event {
            ClientEvent::Message(message) => {
                self.on_message(id, message);
            }
            ClientEvent::Typing(presence) => self.on_typing(id, presence),
            ClientEvent::StopTyping => self.on_stop_typing(id),
        }
    }

    pub fn history(&self) -> Vec<Arc<Message>> {
        self.history.snapshot()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    fn reap(&mut self, closed: Vec<ConnectionId>) {
        for id in closed {
            self.on_disconnect(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Work items applied by the hub task, in arrival order.
#[derive(Debug)]
pub enum HubCommand {
    Connect { id: ConnectionId, outbound: OutboundQueue },
    Event { id: ConnectionId, event: ClientEvent },
    Reject { id: ConnectionId, error: ProtocolError },
    Disconnect { id: ConnectionId },
}

impl Hub<OutboundQueue> {
    pub fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { id, outbound } => self.on_connect(id, outbound),
            HubCommand::Event { id, event } => self.handle(id, event),
            HubCommand::Reject { id, error } => self.reject(id, &error),
            HubCommand::Disconnect { id } => {
                self.on_disconnect(id);
            }
        }
    }
}

/// Cloneable front for a hub running in its own task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
    outbound_queue: usize,
}

/// Move `hub` into a new task and return a handle to it.
///
/// The task ends once every [`HubHandle`] has been dropped.
pub fn spawn(hub: Hub<OutboundQueue>) -> HubHandle {
    let outbound_queue = hub.config().outbound_queue.max(1);
    let (tx, rx) = mpsc::channel(hub.config().command_queue.max(1));
    tokio::spawn(run(hub, rx));
    HubHandle {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
        outbound_queue,
    }
}

async fn run(mut hub: Hub<OutboundQueue>, mut rx: mpsc::Receiver<HubCommand>) {
    while let Some(command) = rx.recv().await {
        hub.apply(command);
    }
    debug!("hub task stopped");
}

impl HubHandle {
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate an id and an outbound queue and register them with the hub.
    ///
    /// The first event on the returned receiver is always `previousMessages`.
    pub async fn open(&self) -> Result<(ConnectionId, mpsc::Receiver<Arc<ServerEvent>>), RelayError> {
        let id = self.next_connection_id();
        let (outbound, rx) = mpsc::channel(self.outbound_queue);
        self.connect(id, outbound).await?;
        Ok((id, rx))
    }

    pub async fn connect(&self, id: ConnectionId, outbound: OutboundQueue) -> Result<(), RelayError> {
        self.send(HubCommand::Connect { id, outbound }).await
    }

    /// Waits while the command queue is full, which throttles the socket
    /// feeding it.
    pub async fn submit(&self, id: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        self.send(HubCommand::Event { id, event }).await
    }

    pub async fn reject(&self, id: ConnectionId, error: ProtocolError) -> Result<(), RelayError> {
        self.send(HubCommand::Reject { id, error }).await
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), RelayError> {
        self.send(HubCommand::Disconnect { id }).await
    }

    async fn send(&self, command: HubCommand) -> Result<(), RelayError> {
        self.tx.send(command).await.map_err(|_| RelayError::HubClosed)
    }
}
