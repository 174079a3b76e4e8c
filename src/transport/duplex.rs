//! Message-framed duplex transport
//!
//! WebSocket connections, one JSON record per text frame. The camera serves
//! `ws://<listen>/session/<CODE>` and rejects upgrades for any other path,
//! so remotes holding a stale code never pair. Liveness is the socket's own
//! ping/pong keepalive, on top of the session heartbeat.

use super::hub::{Connections, TransportHub};
use super::{
    Ack, ConnectTarget, ConnectionEvent, ConnectionHandle, InboundMessage, Transport,
    TransportError, TransportKind,
};
use crate::protocol::{Message, MAX_RECORD_LEN};
use crate::session::SessionCode;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;

type FrameSink = Box<dyn Sink<WsMessage, Error = WsError> + Send + Unpin>;

/// Path a session is served on
pub fn session_path(code: &SessionCode) -> String {
    format!("/session/{}", code)
}

/// Full URL a remote dials for `target`
pub fn session_url(target: &ConnectTarget) -> String {
    let base = target.address.trim_end_matches('/');
    let base = if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };
    format!("{}{}", base, session_path(&target.code))
}

/// JSON over WebSocket text frames
pub struct DuplexTransport {
    listen_addr: String,
    keepalive: Duration,
    hub: Arc<TransportHub>,
    connections: Arc<Connections<FrameSink>>,
    listener: Mutex<Option<CancellationToken>>,
    bound: Mutex<Option<std::net::SocketAddr>>,
}

impl DuplexTransport {
    pub fn new(listen_addr: &str, keepalive: Duration) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            keepalive,
            hub: Arc::new(TransportHub::new(TransportKind::Duplex)),
            connections: Arc::new(Connections::new()),
            listener: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.bound.lock()
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    async fn advertise(&self, code: &SessionCode) -> Result<(), TransportError> {
        if let Some(previous) = self.listener.lock().take() {
            previous.cancel();
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local = listener.local_addr()?;
        *self.bound.lock() = Some(local);
        let path = session_path(code);
        tracing::info!("Serving ws://{}{}", local, path);

        let token = CancellationToken::new();
        *self.listener.lock() = Some(token.clone());

        let hub = self.hub.clone();
        let connections = self.connections.clone();
        let keepalive = self.keepalive;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let hub = hub.clone();
                            let connections = connections.clone();
                            let path = path.clone();
                            tokio::spawn(async move {
                                match upgrade(stream, path).await {
                                    Ok(ws) => {
                                        tracing::info!("Inbound WebSocket from {}", addr);
                                        let (sink, frames) = ws.split();
                                        attach(&hub, &connections, Box::new(sink), frames, addr.to_string(), keepalive);
                                    }
                                    Err(e) => tracing::warn!("Rejected upgrade from {}: {}", addr, e),
                                }
                            });
                        }
                        Err(e) => tracing::warn!("Accept failed: {}", e),
                    }
                }
            }
            tracing::debug!("Stopped serving on {}", local);
        });

        Ok(())
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<ConnectionHandle, TransportError> {
        let url = session_url(target);
        let (ws, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", url, e)))?;
        let (sink, frames) = ws.split();
        Ok(attach(
            &self.hub,
            &self.connections,
            Box::new(sink),
            frames,
            url,
            self.keepalive,
        ))
    }

    async fn send(
        &self,
        handle: &ConnectionHandle,
        message: &Message,
    ) -> Result<Ack, TransportError> {
        let record = message.encode()?;
        let writer = self.connections.writer(handle.id)?;
        let mut sink = writer.lock().await;
        sink.send(WsMessage::Text(record))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(Ack)
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.hub.subscribe_messages()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.hub.subscribe_events()
    }

    async fn close(&self, handle: &ConnectionHandle) {
        if let Some(writer) = self.connections.remove(handle.id) {
            let _ = writer.lock().await.close().await;
        }
    }

    async fn shutdown(&self) {
        if let Some(token) = self.listener.lock().take() {
            token.cancel();
        }
        *self.bound.lock() = None;
        for (_, writer) in self.connections.drain() {
            let _ = writer.lock().await.close().await;
        }
    }
}

async fn upgrade(
    stream: TcpStream,
    expected_path: String,
) -> Result<tokio_tungstenite::WebSocketStream<TcpStream>, WsError> {
    let _ = stream.set_nodelay(true);
    tokio_tungstenite::accept_hdr_async(stream, move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("unknown session".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    })
    .await
}

/// Register a socket, spawn its reader and keepalive
fn attach<S>(
    hub: &Arc<TransportHub>,
    connections: &Arc<Connections<FrameSink>>,
    sink: FrameSink,
    mut frames: S,
    peer: String,
    keepalive: Duration,
) -> ConnectionHandle
where
    S: Stream<Item = Result<WsMessage, WsError>> + Send + Unpin + 'static,
{
    let handle = hub.allocate(peer);
    let token = CancellationToken::new();
    connections.insert(handle.clone(), sink, token.clone());
    hub.opened(&handle);

    if let Ok(writer) = connections.writer(handle.id) {
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if writer.lock().await.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let hub = hub.clone();
    let connections = connections.clone();
    let reader_handle = handle.clone();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => break "closed locally".to_string(),
                frame = frames.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > MAX_RECORD_LEN {
                            hub.malformed(&reader_handle, "record exceeds maximum length");
                        } else {
                            hub.deliver_record(&reader_handle, &text);
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        hub.malformed(&reader_handle, "binary frame");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break format!("peer closed ({:?})", frame);
                    }
                    // Ping/pong handled by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "peer closed".to_string(),
                }
            }
        };
        connections.remove(reader_handle.id);
        hub.closed(&reader_handle, reason);
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    #[test]
    fn test_session_url_building() {
        let code: SessionCode = "ABC234".parse().unwrap();
        assert_eq!(
            session_url(&ConnectTarget::new("192.168.4.1:8765", code.clone())),
            "ws://192.168.4.1:8765/session/ABC234"
        );
        assert_eq!(
            session_url(&ConnectTarget::new("wss://relay.local/", code)),
            "wss://relay.local/session/ABC234"
        );
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let camera = DuplexTransport::new("127.0.0.1:0", Duration::from_secs(15));
        let code = SessionCode::generate();
        camera.advertise(&code).await.unwrap();
        let addr = camera.local_addr().unwrap();
        let mut camera_events = camera.connection_events();
        let mut camera_messages = camera.messages();

        let remote = DuplexTransport::new("127.0.0.1:0", Duration::from_secs(15));
        let mut remote_messages = remote.messages();
        let handle = remote
            .connect(&ConnectTarget::new(addr.to_string(), code))
            .await
            .unwrap();

        let inbound = match camera_events.recv().await.unwrap() {
            ConnectionEvent::Opened(h) => h,
            other => panic!("unexpected event {:?}", other),
        };

        remote
            .send(&handle, &Message::capture(1_000, Some(20)))
            .await
            .unwrap();
        assert_eq!(
            camera_messages.recv().await.unwrap().message,
            Message::capture(1_000, Some(20))
        );

        camera
            .send(&inbound, &Message::register(Role::Camera))
            .await
            .unwrap();
        assert_eq!(
            remote_messages.recv().await.unwrap().message,
            Message::register(Role::Camera)
        );

        camera.shutdown().await;
        remote.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_code_is_rejected() {
        let camera = DuplexTransport::new("127.0.0.1:0", Duration::from_secs(15));
        camera.advertise(&"ABCDEF".parse().unwrap()).await.unwrap();
        let addr = camera.local_addr().unwrap();

        let remote = DuplexTransport::new("127.0.0.1:0", Duration::from_secs(15));
        let result = remote
            .connect(&ConnectTarget::new(addr.to_string(), "ZZZZZZ".parse().unwrap()))
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));

        camera.shutdown().await;
    }
}
