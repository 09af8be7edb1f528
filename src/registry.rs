//! Live connection set and fan-out primitives.
//!
//! The registry is generic over [`Outbound`], the hub never sees how a
//! connection's events actually reach the wire. Production uses a bounded
//! `tokio::sync::mpsc` queue per connection; tests plug in plain channels.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::ServerEvent;

/// Opaque handle for one live connection, allocated by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of handing one event to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The connection's buffer is full; this event is lost for it only.
    Dropped,
    /// The receiving side is gone.
    Closed,
}

/// Anything that can accept events on behalf of one connection.
///
/// Implementations must not block: the hub calls this inline for every
/// recipient of every broadcast.
pub trait Outbound {
    fn deliver(&self, event: Arc<ServerEvent>) -> Delivery;
}

/// The per-connection queue drained by a session task.
pub type OutboundQueue = mpsc::Sender<Arc<ServerEvent>>;

impl Outbound for mpsc::Sender<Arc<ServerEvent>> {
    fn deliver(&self, event: Arc<ServerEvent>) -> Delivery {
        match self.try_send(event) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

impl Outbound for mpsc::UnboundedSender<Arc<ServerEvent>> {
    fn deliver(&self, event: Arc<ServerEvent>) -> Delivery {
        match self.send(event) {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        }
    }
}

struct Entry<C> {
    outbound: C,
    /// Last display name seen from this connection.
    username: Option<String>,
}

pub struct Registry<C> {
    connections: BTreeMap<ConnectionId, Entry<C>>,
}

impl<C: Outbound> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Outbound> Registry<C> {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
        }
    }

    /// Add a connection. Re-registering an id replaces its outbound.
    pub fn register(&mut self, id: ConnectionId, outbound: C) {
        self.connections.insert(
            id,
            Entry {
                outbound,
                username: None,
            },
        );
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn note_username(&mut self, id: ConnectionId, username: &str) {
        if let Some(entry) = self.connections.get_mut(&id) {
            if entry.username.as_deref() != Some(username) {
                entry.username = Some(username.to_string());
            }
        }
    }

    pub fn username(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(&id)?.username.as_deref()
    }

    /// Deliver to a single connection. `None` if it is not registered.
    pub fn send_to(&self, id: ConnectionId, event: Arc<ServerEvent>) -> Option<Delivery> {
        let entry = self.connections.get(&id)?;
        let outcome = entry.outbound.deliver(event);
        if outcome == Delivery::Dropped {
            warn!(conn = %id, "outbound queue full, dropping event");
        }
        Some(outcome)
    }

    /// Deliver to every connection. Returns the ids whose outbound has closed.
    pub fn broadcast_all(&self, event: &Arc<ServerEvent>) -> Vec<ConnectionId> {
        self.fan_out(None, event)
    }

    /// Deliver to every connection except `sender`.
    pub fn broadcast_except(&self, sender: ConnectionId, event: &Arc<ServerEvent>) -> Vec<ConnectionId> {
        self.fan_out(Some(sender), event)
    }

    fn fan_out(&self, skip: Option<ConnectionId>, event: &Arc<ServerEvent>) -> Vec<ConnectionId> {
        let mut closed = Vec::new();
        for (&id, entry) in &self.connections {
            if Some(id) == skip {
                continue;
            }
            match entry.outbound.deliver(Arc::clone(event)) {
                Delivery::Sent => {}
                Delivery::Dropped => {
                    warn!(conn = %id, event = event.name(), "outbound queue full, dropping event");
                }
                Delivery::Closed => closed.push(id),
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Presence;

    type Rx = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

    fn conn(reg: &mut Registry<mpsc::UnboundedSender<Arc<ServerEvent>>>, n: u64) -> Rx {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.register(ConnectionId::new(n), tx);
        rx
    }

    fn typing() -> Arc<ServerEvent> {
        Arc::new(ServerEvent::Typing(Presence { username: "a".into() }))
    }

    #[test]
    fn test_register_and_len() {
        let mut reg = Registry::new();
        let _a = conn(&mut reg, 1);
        let _b = conn(&mut reg, 2);
        assert_eq!(reg.len(), 2);
        assert!(reg.contains(ConnectionId::new(1)));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut reg = Registry::new();
        let _a = conn(&mut reg, 1);
        let mut b = conn(&mut reg, 2);
        assert!(reg.unregister(ConnectionId::new(1)));
        assert!(!reg.unregister(ConnectionId::new(1)));
        assert_eq!(reg.len(), 1);

        reg.broadcast_all(&typing());
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_all_reaches_everyone() {
        let mut reg = Registry::new();
        let mut a = conn(&mut reg, 1);
        let mut b = conn(&mut reg, 2);
        let closed = reg.broadcast_all(&typing());
        assert!(closed.is_empty());
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_except_skips_sender() {
        let mut reg = Registry::new();
        let mut a = conn(&mut reg, 1);
        let mut b = conn(&mut reg, 2);
        let mut c = conn(&mut reg, 3);
        reg.broadcast_except(ConnectionId::new(2), &typing());
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_err());
        assert!(c.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_reports_closed_connections() {
        let mut reg = Registry::new();
        let a = conn(&mut reg, 1);
        let _b = conn(&mut reg, 2);
        drop(a);
        assert_eq!(reg.broadcast_all(&typing()), vec![ConnectionId::new(1)]);
    }

    #[test]
    fn test_send_to_unknown_is_none() {
        let reg: Registry<mpsc::UnboundedSender<Arc<ServerEvent>>> = Registry::new();
        assert!(reg.send_to(ConnectionId::new(9), typing()).is_none());
    }

    #[test]
    fn test_bounded_queue_drops_when_full() {
        let mut reg = Registry::new();
        let (tx, mut rx) = mpsc::channel(1);
        reg.register(ConnectionId::new(1), tx);
        assert_eq!(reg.send_to(ConnectionId::new(1), typing()), Some(Delivery::Sent));
        assert_eq!(reg.send_to(ConnectionId::new(1), typing()), Some(Delivery::Dropped));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_username_tracking() {
        let mut reg = Registry::new();
        let _a = conn(&mut reg, 1);
        assert_eq!(reg.username(ConnectionId::new(1)), None);
        reg.note_username(ConnectionId::new(1), "alice");
        assert_eq!(reg.username(ConnectionId::new(1)), Some("alice"));
        reg.note_username(ConnectionId::new(7), "ghost");
        assert_eq!(reg.username(ConnectionId::new(7)), None);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "#42");
    }
}
