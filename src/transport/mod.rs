//! Transports
//!
//! One capability set over several physical links:
//! - `stream`: TCP socket, newline-delimited JSON records
//! - `duplex`: WebSocket, one record per text frame
//! - `radio`: short-range radio link with advertise/discover semantics
//! - `mailbox`: relay mailbox, polled over HTTP (`http_poll`) or a realtime
//!   cloud store (`cloud`)
//!
//! A transport owns framing and its own liveness signal. It never retries a
//! failed send; retry policy belongs to the session.

pub mod cloud;
pub mod duplex;
pub mod http_poll;
pub mod hub;
pub mod mailbox;
pub mod radio;
pub mod stream;

use crate::protocol::{Message, ProtocolError, Role};
use crate::session::SessionCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub use hub::{Connections, TransportHub};

/// Recommended connect timeout for direct links
pub const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Recommended connect timeout for discovery-based links
pub const DISCOVERY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Physical link family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stream,
    Duplex,
    Radio,
    PollRelay,
    CloudRelay,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Duplex => "duplex",
            TransportKind::Radio => "radio",
            TransportKind::PollRelay => "poll-relay",
            TransportKind::CloudRelay => "cloud-relay",
        }
    }

    /// Whether connecting involves discovering the peer first
    pub fn is_discovery_based(&self) -> bool {
        matches!(
            self,
            TransportKind::Radio | TransportKind::PollRelay | TransportKind::CloudRelay
        )
    }

    pub fn default_connect_timeout(&self) -> Duration {
        if self.is_discovery_based() {
            DISCOVERY_CONNECT_TIMEOUT
        } else {
            DIRECT_CONNECT_TIMEOUT
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(TransportKind::Stream),
            "duplex" | "websocket" | "ws" => Ok(TransportKind::Duplex),
            "radio" | "proximity" => Ok(TransportKind::Radio),
            "poll-relay" | "poll" => Ok(TransportKind::PollRelay),
            "cloud-relay" | "cloud" => Ok(TransportKind::CloudRelay),
            other => Err(TransportError::Unsupported(format!(
                "unknown transport kind: {}",
                other
            ))),
        }
    }
}

/// Opaque handle for one live connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    /// Unique within the owning transport
    pub id: u64,
    pub kind: TransportKind,
    /// Human-readable peer label (address, radio name, relay peer id)
    pub peer: String,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({})", self.kind, self.id, self.peer)
    }
}

/// Where an initiating device should connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Transport-specific address: `host:port`, `ws://host:port`, radio
    /// service hint, or relay base URL (may be empty when the transport was
    /// configured with one)
    pub address: String,
    /// Session code exchanged out-of-band
    pub code: SessionCode,
}

impl ConnectTarget {
    pub fn new(address: impl Into<String>, code: SessionCode) -> Self {
        Self {
            address: address.into(),
            code,
        }
    }
}

/// Successful hand-off of a message to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Inbound message with its connection
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub handle: ConnectionHandle,
    pub message: Message,
}

/// Connection-state notifications
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was established (inbound or outbound)
    Opened(ConnectionHandle),
    /// A connection ended; `reason` is diagnostic only
    Closed {
        handle: ConnectionHandle,
        reason: String,
    },
    /// An inbound record could not be decoded and was discarded
    Malformed {
        handle: ConnectionHandle,
        error: String,
    },
}

/// The capability set every physical link provides
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Connect timeout the session should apply when none is configured
    fn connect_timeout(&self) -> Duration {
        self.kind().default_connect_timeout()
    }

    /// Start accepting inbound connections for `code` (camera side).
    /// New connections are reported as `ConnectionEvent::Opened`.
    async fn advertise(&self, code: &SessionCode) -> Result<(), TransportError>;

    /// Open a connection to `target` (remote side)
    async fn connect(&self, target: &ConnectTarget) -> Result<ConnectionHandle, TransportError>;

    /// Hand one message to the link
    async fn send(&self, handle: &ConnectionHandle, message: &Message)
        -> Result<Ack, TransportError>;

    /// Subscribe to inbound messages
    fn messages(&self) -> broadcast::Receiver<InboundMessage>;

    /// Subscribe to connection-state changes
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Close one connection. Closing an unknown handle is a no-op.
    async fn close(&self, handle: &ConnectionHandle);

    /// Stop advertising and close every connection
    async fn shutdown(&self);
}

/// Transport errors. All are recoverable from the session's point of view.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Unknown connection {0}")]
    UnknownConnection(u64),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Role-aware settings needed to build a transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub kind: TransportKind,
    pub role: Role,
    /// Local bind address for listening transports
    pub listen_addr: String,
    /// Relay base URL for relay transports
    pub relay_url: Option<String>,
    /// Relay credential (cloud store auth token)
    pub relay_auth: Option<String>,
    /// Relay polling interval
    pub poll_interval: Duration,
    /// WebSocket keepalive ping interval
    pub keepalive_interval: Duration,
}

/// Build the transport selected by `options`.
///
/// The radio variant needs a platform adapter; callers on devices without
/// one get `TransportError::Unsupported`.
pub fn build_transport(
    options: &TransportOptions,
    radio: Option<Arc<dyn radio::RadioAdapter>>,
) -> Result<Arc<dyn Transport>, TransportError> {
    let transport: Arc<dyn Transport> = match options.kind {
        TransportKind::Stream => Arc::new(stream::StreamTransport::new(&options.listen_addr)),
        TransportKind::Duplex => Arc::new(duplex::DuplexTransport::new(
            &options.listen_addr,
            options.keepalive_interval,
        )),
        TransportKind::Radio => {
            let adapter = radio.ok_or_else(|| {
                TransportError::Unsupported("no radio adapter on this device".to_string())
            })?;
            Arc::new(radio::RadioTransport::new(adapter))
        }
        TransportKind::PollRelay => {
            let url = relay_url(options)?;
            let store = http_poll::HttpPollMailbox::new(url)?;
            Arc::new(mailbox::MailboxTransport::new(
                Arc::new(store),
                TransportKind::PollRelay,
                options.role,
                options.poll_interval,
            ))
        }
        TransportKind::CloudRelay => {
            let url = relay_url(options)?;
            let store = cloud::CloudStoreMailbox::new(url, options.relay_auth.clone())?;
            Arc::new(mailbox::MailboxTransport::new(
                Arc::new(store),
                TransportKind::CloudRelay,
                options.role,
                options.poll_interval,
            ))
        }
    };

    tracing::info!("Using {} transport as {}", options.kind, options.role);
    Ok(transport)
}

fn relay_url(options: &TransportOptions) -> Result<String, TransportError> {
    options
        .relay_url
        .clone()
        .ok_or_else(|| TransportError::Relay(format!("{} requires a relay URL", options.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_and_timeouts() {
        assert_eq!("tcp".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert_eq!("ws".parse::<TransportKind>().unwrap(), TransportKind::Duplex);
        assert_eq!("cloud".parse::<TransportKind>().unwrap(), TransportKind::CloudRelay);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());

        assert_eq!(TransportKind::Stream.default_connect_timeout(), DIRECT_CONNECT_TIMEOUT);
        assert_eq!(TransportKind::Radio.default_connect_timeout(), DISCOVERY_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_radio_requires_adapter() {
        let options = TransportOptions {
            kind: TransportKind::Radio,
            role: Role::Camera,
            listen_addr: "127.0.0.1:0".to_string(),
            relay_url: None,
            relay_auth: None,
            poll_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(15),
        };
        assert!(matches!(
            build_transport(&options, None),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_relay_requires_url() {
        let options = TransportOptions {
            kind: TransportKind::PollRelay,
            role: Role::Remote,
            listen_addr: String::new(),
            relay_url: None,
            relay_auth: None,
            poll_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(15),
        };
        assert!(matches!(
            build_transport(&options, None),
            Err(TransportError::Relay(_))
        ));
    }
}
