//! Relay mailbox transport
//!
//! For links where neither device can reach the other directly, both poll a
//! shared store keyed by the session code. Each device publishes a presence
//! entry and owns an inbox; sending posts an envelope into the peer's inbox.
//!
//! Ordering: every envelope carries a per-sender monotonic timestamp. The
//! receiver sorts fetched envelopes by it, delivers, then deletes each one
//! (consume-then-delete), and drops anything not newer than the last
//! envelope delivered from that sender.
//!
//! Liveness: a peer whose presence entry disappears, or stops changing for
//! several poll intervals, is reported closed. Staleness is judged by local
//! observation time, so device clock skew doesn't matter.

use super::{
    Ack, ConnectTarget, ConnectionEvent, ConnectionHandle, InboundMessage, Transport,
    TransportError, TransportHub, TransportKind,
};
use crate::protocol::{unix_millis, Message, Role};
use crate::session::SessionCode;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Relay peer id the camera always uses
pub const CAMERA_PEER_ID: &str = "camera";

/// A device's presence entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub peer_id: String,
    pub role: Role,
    /// Publisher's clock; only compared against earlier values from the
    /// same publisher
    pub last_seen_ms: i64,
}

/// One record in transit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: String,
    /// Per-sender monotonic
    pub timestamp: i64,
    pub record: String,
}

/// An envelope as stored, with the key needed to delete it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEnvelope {
    pub key: String,
    pub envelope: Envelope,
}

/// Shared store backing a relay
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn announce(&self, code: &SessionCode, presence: &Presence)
        -> Result<(), TransportError>;

    async fn withdraw(&self, code: &SessionCode, peer_id: &str) -> Result<(), TransportError>;

    async fn peers(&self, code: &SessionCode) -> Result<Vec<Presence>, TransportError>;

    async fn post(
        &self,
        code: &SessionCode,
        to: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError>;

    async fn fetch(
        &self,
        code: &SessionCode,
        peer_id: &str,
    ) -> Result<Vec<StoredEnvelope>, TransportError>;

    async fn remove(&self, code: &SessionCode, peer_id: &str, key: &str)
        -> Result<(), TransportError>;
}

struct RelayLink {
    handle: ConnectionHandle,
    /// Newest envelope timestamp delivered from this peer
    last_delivered: i64,
    presence_ms: i64,
    presence_changed: Instant,
}

struct MailboxInner {
    store: Arc<dyn Mailbox>,
    role: Role,
    peer_id: String,
    poll_interval: Duration,
    hub: TransportHub,
    code: Mutex<Option<SessionCode>>,
    links: Mutex<HashMap<String, RelayLink>>,
    last_sent: AtomicI64,
}

/// Transport over a relay mailbox
pub struct MailboxTransport {
    inner: Arc<MailboxInner>,
    poller: Mutex<Option<CancellationToken>>,
}

impl MailboxTransport {
    pub fn new(
        store: Arc<dyn Mailbox>,
        kind: TransportKind,
        role: Role,
        poll_interval: Duration,
    ) -> Self {
        static REMOTE_SEQ: AtomicU64 = AtomicU64::new(0);
        let peer_id = match role {
            Role::Camera => CAMERA_PEER_ID.to_string(),
            Role::Remote => format!(
                "remote-{}-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8],
                REMOTE_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
        };

        Self {
            inner: Arc::new(MailboxInner {
                store,
                role,
                peer_id,
                poll_interval,
                hub: TransportHub::new(kind),
                code: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
                last_sent: AtomicI64::new(0),
            }),
            poller: Mutex::new(None),
        }
    }

    /// This device's relay peer id
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    fn start_polling(&self, code: &SessionCode) {
        *self.inner.code.lock() = Some(code.clone());
        let token = CancellationToken::new();
        if let Some(previous) = self.poller.lock().replace(token.clone()) {
            previous.cancel();
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.poll_once().await {
                            tracing::warn!("Relay poll failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

impl MailboxInner {
    fn current_code(&self) -> Result<SessionCode, TransportError> {
        self.code
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Relay("no active session".to_string()))
    }

    fn stale_after(&self) -> Duration {
        (self.poll_interval * 6).max(Duration::from_secs(3))
    }

    fn presence(&self) -> Presence {
        Presence {
            peer_id: self.peer_id.clone(),
            role: self.role,
            last_seen_ms: unix_millis(),
        }
    }

    /// Strictly increasing send timestamp
    fn next_timestamp(&self) -> i64 {
        let now = unix_millis();
        let mut previous = self.last_sent.load(Ordering::SeqCst);
        loop {
            let next = now.max(previous + 1);
            match self.last_sent.compare_exchange(
                previous,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Open a link to `presence` unless one exists
    fn ensure_link(&self, presence: &Presence) -> ConnectionHandle {
        let mut links = self.links.lock();
        if let Some(link) = links.get(&presence.peer_id) {
            return link.handle.clone();
        }
        let handle = self.hub.allocate(presence.peer_id.clone());
        links.insert(
            presence.peer_id.clone(),
            RelayLink {
                handle: handle.clone(),
                last_delivered: 0,
                presence_ms: presence.last_seen_ms,
                presence_changed: Instant::now(),
            },
        );
        drop(links);
        self.hub.opened(&handle);
        handle
    }

    fn drop_link(&self, peer_id: &str, reason: &str) {
        let removed = self.links.lock().remove(peer_id);
        if let Some(link) = removed {
            self.hub.closed(&link.handle, reason);
        }
    }

    fn peer_for(&self, handle: &ConnectionHandle) -> Option<String> {
        self.links
            .lock()
            .iter()
            .find(|(_, link)| link.handle.id == handle.id)
            .map(|(peer_id, _)| peer_id.clone())
    }

    async fn poll_once(&self) -> Result<(), TransportError> {
        let code = self.current_code()?;
        self.store.announce(&code, &self.presence()).await?;

        let present: HashMap<String, Presence> = self
            .store
            .peers(&code)
            .await?
            .into_iter()
            .filter(|p| p.role != self.role)
            .map(|p| (p.peer_id.clone(), p))
            .collect();

        // Liveness of existing links
        let now = Instant::now();
        let stale_after = self.stale_after();
        let mut lost = Vec::new();
        {
            let mut links = self.links.lock();
            for (peer_id, link) in links.iter_mut() {
                match present.get(peer_id) {
                    None => lost.push((peer_id.clone(), "presence withdrawn")),
                    Some(p) if p.last_seen_ms != link.presence_ms => {
                        link.presence_ms = p.last_seen_ms;
                        link.presence_changed = now;
                    }
                    Some(_) => {
                        if now.duration_since(link.presence_changed) > stale_after {
                            lost.push((peer_id.clone(), "presence stale"));
                        }
                    }
                }
            }
        }
        for (peer_id, reason) in lost {
            self.drop_link(&peer_id, reason);
        }

        let mut inbox = self.store.fetch(&code, &self.peer_id).await?;
        inbox.sort_by_key(|stored| stored.envelope.timestamp);

        for stored in inbox {
            let from = stored.envelope.from.clone();
            let handle = {
                let known = self.links.lock().get(&from).map(|l| l.handle.clone());
                match (known, present.get(&from)) {
                    (Some(handle), _) => Some(handle),
                    // First contact from a remote announces a new connection
                    (None, Some(presence)) if self.role == Role::Camera => {
                        Some(self.ensure_link(presence))
                    }
                    _ => None,
                }
            };

            if let Some(handle) = handle {
                let fresh = {
                    let mut links = self.links.lock();
                    match links.get_mut(&from) {
                        Some(link) if stored.envelope.timestamp > link.last_delivered => {
                            link.last_delivered = stored.envelope.timestamp;
                            true
                        }
                        _ => false,
                    }
                };
                if fresh {
                    self.hub.deliver_record(&handle, &stored.envelope.record);
                } else {
                    tracing::debug!("Dropping duplicate envelope from {}", from);
                }
            } else {
                tracing::debug!("Dropping envelope from unknown peer {}", from);
            }

            self.store.remove(&code, &self.peer_id, &stored.key).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for MailboxTransport {
    fn kind(&self) -> TransportKind {
        self.inner.hub.kind()
    }

    async fn advertise(&self, code: &SessionCode) -> Result<(), TransportError> {
        self.inner.store.announce(code, &self.inner.presence()).await?;
        tracing::info!("Announced {} on relay for session {}", self.inner.peer_id, code);
        self.start_polling(code);
        Ok(())
    }

    /// Announce, then wait for the camera's presence to appear
    async fn connect(&self, target: &ConnectTarget) -> Result<ConnectionHandle, TransportError> {
        let code = target.code.clone();
        self.inner.drop_link(CAMERA_PEER_ID, "reconnecting");

        loop {
            self.inner.store.announce(&code, &self.inner.presence()).await?;
            let camera = self
                .inner
                .store
                .peers(&code)
                .await?
                .into_iter()
                .find(|p| p.peer_id == CAMERA_PEER_ID && p.role == Role::Camera);

            if let Some(camera) = camera {
                *self.inner.code.lock() = Some(code.clone());
                let handle = self.inner.ensure_link(&camera);
                self.start_polling(&code);
                return Ok(handle);
            }

            tokio::time::sleep(self.inner.poll_interval).await;
        }
    }

    async fn send(
        &self,
        handle: &ConnectionHandle,
        message: &Message,
    ) -> Result<Ack, TransportError> {
        let to = self
            .inner
            .peer_for(handle)
            .ok_or(TransportError::UnknownConnection(handle.id))?;
        let code = self.inner.current_code()?;
        let envelope = Envelope {
            from: self.inner.peer_id.clone(),
            timestamp: self.inner.next_timestamp(),
            record: message.encode()?,
        };
        self.inner.store.post(&code, &to, &envelope).await?;
        Ok(Ack)
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.hub.subscribe_messages()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.hub.subscribe_events()
    }

    async fn close(&self, handle: &ConnectionHandle) {
        if let Some(peer_id) = self.inner.peer_for(handle) {
            self.inner.drop_link(&peer_id, "closed locally");
        }
    }

    async fn shutdown(&self) {
        if let Some(token) = self.poller.lock().take() {
            token.cancel();
        }
        let peers: Vec<String> = self.inner.links.lock().keys().cloned().collect();
        for peer_id in peers {
            self.inner.drop_link(&peer_id, "shutdown");
        }
        let code = self.inner.code.lock().take();
        if let Some(code) = code {
            if let Err(e) = self.inner.store.withdraw(&code, &self.inner.peer_id).await {
                tracing::warn!("Withdrawing presence failed: {}", e);
            }
        }
    }
}

#[derive(Default)]
struct Room {
    presence: HashMap<String, Presence>,
    inboxes: HashMap<String, BTreeMap<String, Envelope>>,
}

/// In-memory mailbox store
#[derive(Default)]
pub struct MemoryMailbox {
    rooms: Mutex<HashMap<String, Room>>,
    next_key: AtomicU64,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending envelopes for `peer_id`
    pub fn pending(&self, code: &SessionCode, peer_id: &str) -> usize {
        self.rooms
            .lock()
            .get(code.as_str())
            .and_then(|room| room.inboxes.get(peer_id))
            .map(|inbox| inbox.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn announce(
        &self,
        code: &SessionCode,
        presence: &Presence,
    ) -> Result<(), TransportError> {
        self.rooms
            .lock()
            .entry(code.to_string())
            .or_default()
            .presence
            .insert(presence.peer_id.clone(), presence.clone());
        Ok(())
    }

    async fn withdraw(&self, code: &SessionCode, peer_id: &str) -> Result<(), TransportError> {
        if let Some(room) = self.rooms.lock().get_mut(code.as_str()) {
            room.presence.remove(peer_id);
            room.inboxes.remove(peer_id);
        }
        Ok(())
    }

    async fn peers(&self, code: &SessionCode) -> Result<Vec<Presence>, TransportError> {
        Ok(self
            .rooms
            .lock()
            .get(code.as_str())
            .map(|room| room.presence.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn post(
        &self,
        code: &SessionCode,
        to: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let key = format!("{:016}", self.next_key.fetch_add(1, Ordering::Relaxed));
        self.rooms
            .lock()
            .entry(code.to_string())
            .or_default()
            .inboxes
            .entry(to.to_string())
            .or_default()
            .insert(key, envelope.clone());
        Ok(())
    }

    async fn fetch(
        &self,
        code: &SessionCode,
        peer_id: &str,
    ) -> Result<Vec<StoredEnvelope>, TransportError> {
        Ok(self
            .rooms
            .lock()
            .get(code.as_str())
            .and_then(|room| room.inboxes.get(peer_id))
            .map(|inbox| {
                inbox
                    .iter()
                    .map(|(key, envelope)| StoredEnvelope {
                        key: key.clone(),
                        envelope: envelope.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(
        &self,
        code: &SessionCode,
        peer_id: &str,
        key: &str,
    ) -> Result<(), TransportError> {
        if let Some(inbox) = self
            .rooms
            .lock()
            .get_mut(code.as_str())
            .and_then(|room| room.inboxes.get_mut(peer_id))
        {
            inbox.remove(key);
        }
        Ok(())
    }
}
