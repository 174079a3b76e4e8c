//! Proximity radio transport
//!
//! Short-range links with advertise/discover semantics. The platform radio
//! stack sits behind `RadioAdapter`: the camera advertises a service named
//! after the session code, a remote discovers it and opens a link. Each
//! link payload is one JSON record.
//!
//! `LocalRadio` is an in-process medium implementing the adapter, used for
//! tests and for running both roles in one process.

use super::hub::{Connections, TransportHub};
use super::{
    Ack, ConnectTarget, ConnectionEvent, ConnectionHandle, InboundMessage, Transport,
    TransportError, TransportKind,
};
use crate::protocol::{Message, MAX_RECORD_LEN};
use crate::session::SessionCode;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

const LINK_CAPACITY: usize = 64;

/// Advertised service name for a session
pub fn service_name(code: &SessionCode) -> String {
    format!("replaycam-{}", code)
}

/// One open radio link: payloads out, payloads in
pub struct RadioLink {
    /// Name of the device on the other end
    pub peer: String,
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Platform radio stack
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// This device's radio name
    fn name(&self) -> &str;

    /// Advertise `service`; inbound links arrive on the returned channel
    async fn start_advertising(
        &self,
        service: &str,
    ) -> Result<mpsc::Receiver<RadioLink>, TransportError>;

    async fn stop_advertising(&self);

    /// Wait for a device advertising `service` to come in range, then open
    /// a link to it
    async fn discover(&self, service: &str) -> Result<RadioLink, TransportError>;
}

/// Radio-backed transport
pub struct RadioTransport {
    adapter: Arc<dyn RadioAdapter>,
    hub: Arc<TransportHub>,
    connections: Arc<Connections<mpsc::Sender<Vec<u8>>>>,
    advertising: Mutex<Option<CancellationToken>>,
}

impl RadioTransport {
    pub fn new(adapter: Arc<dyn RadioAdapter>) -> Self {
        Self {
            adapter,
            hub: Arc::new(TransportHub::new(TransportKind::Radio)),
            connections: Arc::new(Connections::new()),
            advertising: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for RadioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    async fn advertise(&self, code: &SessionCode) -> Result<(), TransportError> {
        if let Some(previous) = self.advertising.lock().take() {
            previous.cancel();
        }

        let service = service_name(code);
        let mut incoming = self.adapter.start_advertising(&service).await?;
        tracing::info!("{} advertising {}", self.adapter.name(), service);

        let token = CancellationToken::new();
        *self.advertising.lock() = Some(token.clone());
        let hub = self.hub.clone();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    link = incoming.recv() => match link {
                        Some(link) => {
                            tracing::info!("Radio link from {}", link.peer);
                            attach(&hub, &connections, link);
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(())
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<ConnectionHandle, TransportError> {
        let service = service_name(&target.code);
        tracing::debug!("Discovering {}", service);
        let link = self.adapter.discover(&service).await?;
        Ok(attach(&self.hub, &self.connections, link))
    }

    async fn send(
        &self,
        handle: &ConnectionHandle,
        message: &Message,
    ) -> Result<Ack, TransportError> {
        let record = message.encode()?;
        let writer = self.connections.writer(handle.id)?;
        let tx = writer.lock().await;
        tx.send(record.into_bytes())
            .await
            .map_err(|_| TransportError::Send(format!("radio link to {} lost", handle.peer)))?;
        Ok(Ack)
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.hub.subscribe_messages()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.hub.subscribe_events()
    }

    async fn close(&self, handle: &ConnectionHandle) {
        self.connections.remove(handle.id);
    }

    async fn shutdown(&self) {
        let advertising = self.advertising.lock().take();
        if let Some(token) = advertising {
            token.cancel();
            self.adapter.stop_advertising().await;
        }
        self.connections.drain();
    }
}

fn attach(
    hub: &Arc<TransportHub>,
    connections: &Arc<Connections<mpsc::Sender<Vec<u8>>>>,
    link: RadioLink,
) -> ConnectionHandle {
    let RadioLink { peer, tx, mut rx } = link;
    let handle = hub.allocate(peer);
    let token = CancellationToken::new();
    connections.insert(handle.clone(), tx, token.clone());
    hub.opened(&handle);

    let hub = hub.clone();
    let connections = connections.clone();
    let reader_handle = handle.clone();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => break "closed locally",
                payload = rx.recv() => match payload {
                    Some(bytes) if bytes.len() > MAX_RECORD_LEN => {
                        hub.malformed(&reader_handle, "record exceeds maximum length");
                    }
                    Some(bytes) => match String::from_utf8(bytes) {
                        Ok(record) => hub.deliver_record(&reader_handle, &record),
                        Err(_) => hub.malformed(&reader_handle, "payload is not UTF-8"),
                    },
                    None => break "link lost",
                }
            }
        };
        connections.remove(reader_handle.id);
        hub.closed(&reader_handle, reason);
    });

    handle
}

struct Advertiser {
    device: String,
    incoming: mpsc::Sender<RadioLink>,
}

struct Medium {
    advertisers: Mutex<HashMap<String, Advertiser>>,
    reachable: Mutex<bool>,
    /// Cancelled to sever every link opened under it
    generation: Mutex<CancellationToken>,
    changed: Notify,
}

/// In-process radio medium shared by any number of adapters
#[derive(Clone)]
pub struct LocalRadio {
    medium: Arc<Medium>,
}

impl LocalRadio {
    pub fn new() -> Self {
        Self {
            medium: Arc::new(Medium {
                advertisers: Mutex::new(HashMap::new()),
                reachable: Mutex::new(true),
                generation: Mutex::new(CancellationToken::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// An adapter for one device on this medium
    pub fn adapter(&self, device: &str) -> LocalRadioAdapter {
        LocalRadioAdapter {
            medium: self.medium.clone(),
            device: device.to_string(),
        }
    }

    /// Drop every open link. Advertisements stay up.
    pub fn sever(&self) {
        let previous =
            std::mem::replace(&mut *self.medium.generation.lock(), CancellationToken::new());
        previous.cancel();
    }

    /// Take devices out of (or back into) range. Going out of range severs
    /// open links and stalls discovery.
    pub fn set_reachable(&self, reachable: bool) {
        *self.medium.reachable.lock() = reachable;
        if !reachable {
            self.sever();
        }
        self.medium.changed.notify_waiters();
    }

    /// Names of advertised services
    pub fn advertised(&self) -> Vec<String> {
        self.medium.advertisers.lock().keys().cloned().collect()
    }

    fn link_pair(&self, a: &str, b: &str) -> (RadioLink, RadioLink) {
        let token = self.medium.generation.lock().clone();
        let (a_tx, a_out) = mpsc::channel(LINK_CAPACITY);
        let (b_tx, b_out) = mpsc::channel(LINK_CAPACITY);
        let (to_a, a_rx) = mpsc::channel(LINK_CAPACITY);
        let (to_b, b_rx) = mpsc::channel(LINK_CAPACITY);

        tokio::spawn(forward(a_out, to_b, token.clone()));
        tokio::spawn(forward(b_out, to_a, token));

        (
            RadioLink {
                peer: b.to_string(),
                tx: a_tx,
                rx: a_rx,
            },
            RadioLink {
                peer: a.to_string(),
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

impl Default for LocalRadio {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward(
    mut from: mpsc::Receiver<Vec<u8>>,
    to: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            payload = from.recv() => match payload {
                Some(bytes) => {
                    if to.send(bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// One device's view of a `LocalRadio`
pub struct LocalRadioAdapter {
    medium: Arc<Medium>,
    device: String,
}

#[async_trait]
impl RadioAdapter for LocalRadioAdapter {
    fn name(&self) -> &str {
        &self.device
    }

    async fn start_advertising(
        &self,
        service: &str,
    ) -> Result<mpsc::Receiver<RadioLink>, TransportError> {
        let (incoming, rx) = mpsc::channel(8);
        self.medium.advertisers.lock().insert(
            service.to_string(),
            Advertiser {
                device: self.device.clone(),
                incoming,
            },
        );
        self.medium.changed.notify_waiters();
        Ok(rx)
    }

    async fn stop_advertising(&self) {
        self.medium
            .advertisers
            .lock()
            .retain(|_, advertiser| advertiser.device != self.device);
        self.medium.changed.notify_waiters();
    }

    async fn discover(&self, service: &str) -> Result<RadioLink, TransportError> {
        let radio = LocalRadio {
            medium: self.medium.clone(),
        };
        loop {
            let changed = self.medium.changed.notified();

            let found = {
                let reachable = *self.medium.reachable.lock();
                let advertisers = self.medium.advertisers.lock();
                advertisers
                    .get(service)
                    .filter(|advertiser| reachable && advertiser.device != self.device)
                    .map(|advertiser| (advertiser.device.clone(), advertiser.incoming.clone()))
            };

            if let Some((device, incoming)) = found {
                let (ours, theirs) = radio.link_pair(&self.device, &device);
                if incoming.send(theirs).await.is_ok() {
                    return Ok(ours);
                }
                return Err(TransportError::PeerNotFound(service.to_string()));
            }

            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use std::time::Duration;

    #[tokio::test]
    async fn test_discover_waits_for_advertiser() {
        let radio = LocalRadio::new();
        let camera = RadioTransport::new(Arc::new(radio.adapter("camera")));
        let remote = RadioTransport::new(Arc::new(radio.adapter("remote")));
        let code = SessionCode::generate();

        let connecting = {
            let code = code.clone();
            tokio::spawn(async move {
                let handle = remote.connect(&ConnectTarget::new("", code)).await;
                (remote, handle)
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!connecting.is_finished());

        let mut camera_messages = camera.messages();
        camera.advertise(&code).await.unwrap();
        assert_eq!(radio.advertised(), vec![service_name(&code)]);

        let (remote, handle) = connecting.await.unwrap();
        let handle = handle.unwrap();
        assert_eq!(handle.peer, "camera");

        remote.send(&handle, &Message::register(Role::Remote)).await.unwrap();
        assert_eq!(
            camera_messages.recv().await.unwrap().message,
            Message::register(Role::Remote)
        );

        camera.shutdown().await;
        assert!(radio.advertised().is_empty());
    }

    #[tokio::test]
    async fn test_sever_closes_links_on_both_ends() {
        let radio = LocalRadio::new();
        let camera = RadioTransport::new(Arc::new(radio.adapter("camera")));
        let remote = RadioTransport::new(Arc::new(radio.adapter("remote")));
        let code = SessionCode::generate();
        camera.advertise(&code).await.unwrap();

        let mut camera_events = camera.connection_events();
        let mut remote_events = remote.connection_events();
        let handle = remote.connect(&ConnectTarget::new("", code)).await.unwrap();
        assert!(matches!(
            camera_events.recv().await.unwrap(),
            ConnectionEvent::Opened(_)
        ));
        assert!(matches!(
            remote_events.recv().await.unwrap(),
            ConnectionEvent::Opened(_)
        ));

        radio.sever();

        assert!(matches!(
            camera_events.recv().await.unwrap(),
            ConnectionEvent::Closed { .. }
        ));
        assert!(matches!(
            remote_events.recv().await.unwrap(),
            ConnectionEvent::Closed { .. }
        ));
        assert!(remote
            .send(&handle, &Message::Ping { timestamp: 1 })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_non_utf8_payload_is_malformed() {
        let radio = LocalRadio::new();
        let (ours, theirs) = radio.link_pair("a", "b");
        let hub = Arc::new(TransportHub::new(TransportKind::Radio));
        let connections = Arc::new(Connections::new());
        let mut events = hub.subscribe_events();

        attach(&hub, &connections, theirs);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Opened(_)));

        ours.tx.send(vec![0xff, 0xfe]).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Malformed { .. }
        ));
    }
}
