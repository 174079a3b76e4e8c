//! Shared plumbing for transport implementations
//!
//! `TransportHub` allocates connection handles and publishes inbound
//! messages and connection events. `Connections` tracks the writer half and
//! reader cancellation for every live connection.

use super::{ConnectionEvent, ConnectionHandle, InboundMessage, TransportError, TransportKind};
use crate::protocol::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Event fan-out shared by a transport and its connection tasks
pub struct TransportHub {
    kind: TransportKind,
    next_id: AtomicU64,
    messages: broadcast::Sender<InboundMessage>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl TransportHub {
    pub fn new(kind: TransportKind) -> Self {
        let (messages, _) = broadcast::channel(EVENT_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind,
            next_id: AtomicU64::new(1),
            messages,
            events,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Allocate a handle for a new connection
    pub fn allocate(&self, peer: impl Into<String>) -> ConnectionHandle {
        ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: self.kind,
            peer: peer.into(),
        }
    }

    pub fn opened(&self, handle: &ConnectionHandle) {
        tracing::debug!("Connection opened: {}", handle);
        let _ = self.events.send(ConnectionEvent::Opened(handle.clone()));
    }

    pub fn closed(&self, handle: &ConnectionHandle, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!("Connection closed: {} ({})", handle, reason);
        let _ = self.events.send(ConnectionEvent::Closed {
            handle: handle.clone(),
            reason,
        });
    }

    pub fn deliver(&self, handle: &ConnectionHandle, message: Message) {
        tracing::trace!("Inbound {} on {}", message.kind(), handle);
        let _ = self.messages.send(InboundMessage {
            handle: handle.clone(),
            message,
        });
    }

    pub fn malformed(&self, handle: &ConnectionHandle, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!("Discarding malformed record on {}: {}", handle, error);
        let _ = self.events.send(ConnectionEvent::Malformed {
            handle: handle.clone(),
            error,
        });
    }

    /// Decode a raw record and deliver it, or report it as malformed
    pub fn deliver_record(&self, handle: &ConnectionHandle, record: &str) {
        match Message::decode(record) {
            Ok(message) => self.deliver(handle, message),
            Err(e) => self.malformed(handle, e.to_string()),
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

struct ConnectionEntry<W> {
    handle: ConnectionHandle,
    writer: Arc<tokio::sync::Mutex<W>>,
    reader: CancellationToken,
}

/// Live connections keyed by handle id
pub struct Connections<W> {
    entries: Mutex<HashMap<u64, ConnectionEntry<W>>>,
}

impl<W> Connections<W> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: ConnectionHandle, writer: W, reader: CancellationToken) {
        self.entries.lock().insert(
            handle.id,
            ConnectionEntry {
                handle,
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                reader,
            },
        );
    }

    /// Writer for a live connection
    pub fn writer(&self, id: u64) -> Result<Arc<tokio::sync::Mutex<W>>, TransportError> {
        self.entries
            .lock()
            .get(&id)
            .map(|entry| entry.writer.clone())
            .ok_or(TransportError::UnknownConnection(id))
    }

    /// Remove a connection and stop its reader. Returns the writer so the
    /// caller can close it.
    pub fn remove(&self, id: u64) -> Option<Arc<tokio::sync::Mutex<W>>> {
        let entry = self.entries.lock().remove(&id)?;
        entry.reader.cancel();
        Some(entry.writer)
    }

    /// Remove every connection
    pub fn drain(&self) -> Vec<(ConnectionHandle, Arc<tokio::sync::Mutex<W>>)> {
        let drained: Vec<_> = self.entries.lock().drain().map(|(_, e)| e).collect();
        drained
            .into_iter()
            .map(|entry| {
                entry.reader.cancel();
                (entry.handle, entry.writer)
            })
            .collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<W> Default for Connections<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_are_unique() {
        let hub = TransportHub::new(TransportKind::Stream);
        let a = hub.allocate("a");
        let b = hub.allocate("b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, TransportKind::Stream);
    }

    #[tokio::test]
    async fn test_deliver_record_routes_malformed_to_events() {
        let hub = TransportHub::new(TransportKind::Stream);
        let mut messages = hub.subscribe_messages();
        let mut events = hub.subscribe_events();
        let handle = hub.allocate("peer");

        hub.deliver_record(&handle, r#"{"type":"ping","timestamp":3}"#);
        hub.deliver_record(&handle, "{{{");

        let inbound = messages.recv().await.unwrap();
        assert_eq!(inbound.message, Message::Ping { timestamp: 3 });
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Malformed { .. }
        ));
    }

    #[test]
    fn test_remove_cancels_reader() {
        let hub = TransportHub::new(TransportKind::Radio);
        let connections: Connections<()> = Connections::new();
        let handle = hub.allocate("peer");
        let token = CancellationToken::new();

        connections.insert(handle.clone(), (), token.clone());
        assert!(connections.contains(handle.id));
        assert!(connections.remove(handle.id).is_some());
        assert!(token.is_cancelled());
        assert!(connections.remove(handle.id).is_none());
        assert!(connections.is_empty());
    }
}
