//! Stream socket transport
//!
//! TCP connections carrying newline-terminated JSON records. The camera
//! listens, remotes connect to `host:port`. Liveness comes from the
//! session's ping/pong heartbeat.

use super::hub::{Connections, TransportHub};
use super::{
    Ack, ConnectTarget, ConnectionEvent, ConnectionHandle, InboundMessage, Transport,
    TransportError, TransportKind,
};
use crate::protocol::{Message, MAX_RECORD_LEN};
use crate::session::SessionCode;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

type LineSink = SplitSink<Framed<TcpStream, LinesCodec>, String>;

/// Newline-delimited JSON over TCP
pub struct StreamTransport {
    listen_addr: String,
    hub: Arc<TransportHub>,
    connections: Arc<Connections<LineSink>>,
    listener: Mutex<Option<CancellationToken>>,
    bound: Mutex<Option<std::net::SocketAddr>>,
}

impl StreamTransport {
    pub fn new(listen_addr: &str) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            hub: Arc::new(TransportHub::new(TransportKind::Stream)),
            connections: Arc::new(Connections::new()),
            listener: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    /// Address actually bound while advertising (useful with port 0)
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.bound.lock()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn advertise(&self, code: &SessionCode) -> Result<(), TransportError> {
        if let Some(previous) = self.listener.lock().take() {
            previous.cancel();
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local = listener.local_addr()?;
        *self.bound.lock() = Some(local);
        tracing::info!("Listening for remotes on {} (session {})", local, code);

        let token = CancellationToken::new();
        *self.listener.lock() = Some(token.clone());

        let hub = self.hub.clone();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::info!("Inbound connection from {}", addr);
                            attach(&hub, &connections, stream, addr.to_string());
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Stopped listening on {}", local);
        });

        Ok(())
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<ConnectionHandle, TransportError> {
        let stream = TcpStream::connect(&target.address)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", target.address, e)))?;
        Ok(attach(
            &self.hub,
            &self.connections,
            stream,
            target.address.clone(),
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
        sink.send(record)
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

/// Register a socket and spawn its reader
fn attach(
    hub: &Arc<TransportHub>,
    connections: &Arc<Connections<LineSink>>,
    stream: TcpStream,
    peer: String,
) -> ConnectionHandle {
    let _ = stream.set_nodelay(true);
    let handle = hub.allocate(peer);
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_RECORD_LEN));
    let (sink, mut lines) = framed.split();
    let token = CancellationToken::new();

    connections.insert(handle.clone(), sink, token.clone());
    hub.opened(&handle);

    let hub = hub.clone();
    let connections = connections.clone();
    let reader_handle = handle.clone();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => break "closed locally".to_string(),
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if !line.trim().is_empty() {
                            hub.deliver_record(&reader_handle, &line);
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        hub.malformed(&reader_handle, "record exceeds maximum length");
                    }
                    Some(Err(LinesCodecError::Io(e))) => break e.to_string(),
                    None => break "peer closed".to_string(),
                }
            }
        };
        connections.remove(reader_handle.id);
        hub.closed(&reader_handle, reason);
    });

    handle
}
