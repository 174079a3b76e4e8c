//! Pairing session
//!
//! Owns the device role, exactly one transport, the registration handshake,
//! heartbeats and the reconnection policy. The application consumes a typed
//! `SessionEvent` stream; ping/pong never leave this module.
//!
//! Timers are bound to the state that started them: every transition
//! cancels the previous state's token, so a heartbeat started on entering
//! `Connected` or a backoff started on entering `Reconnecting` cannot
//! outlive that state.

use super::code::SessionCode;
use super::peers::{PeerSummary, PeerTracker};
use super::state::SessionState;
use crate::config::SessionSettings;
use crate::protocol::{unix_millis, CaptureCoalescer, Message, Role};
use crate::transport::{
    ConnectTarget, ConnectionEvent, ConnectionHandle, InboundMessage, Transport, TransportError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Operation requires the {expected} role, session is {actual}")]
    WrongRole { expected: Role, actual: Role },

    #[error("Session already active ({0})")]
    AlreadyActive(SessionState),

    #[error("A connect attempt is already in flight")]
    ConnectInFlight,

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Peer did not register within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("Connection lost during registration")]
    ConnectionLost,

    #[error("Cancelled by disconnect")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A capture request accepted by the camera
#[derive(Debug, Clone)]
pub struct CaptureSignal {
    /// Remote that sent it
    pub peer: ConnectionHandle,
    /// Remote's send time (unix ms, remote clock)
    pub sent_at_ms: i64,
    /// Local arrival instant; the clip trigger time derives from this
    pub received_at: Instant,
    pub requested_duration_secs: Option<u32>,
}

/// Events published to the application layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    PeerRegistered { peer: ConnectionHandle, role: Role },
    PeerLost { peer: ConnectionHandle, reason: String },
    Capture(CaptureSignal),
    Status { peer: ConnectionHandle, text: String },
}

/// Live timer tasks, for diagnostics and leak checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerCounts {
    pub heartbeat: usize,
    pub backoff: usize,
}

/// Counts a running timer task for as long as it lives
struct TimerGuard(Arc<AtomicUsize>);

impl TimerGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears the in-flight flag when a connect attempt ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct StateCell {
    state: SessionState,
    /// Cancelled whenever `state` changes
    token: CancellationToken,
}

struct SessionInner {
    role: Role,
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    cell: Mutex<StateCell>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    peers: PeerTracker,
    coalescer: Mutex<CaptureCoalescer>,
    code: Mutex<Option<SessionCode>>,
    target: Mutex<Option<ConnectTarget>>,
    /// Remote's outbound connection
    primary: Mutex<Option<ConnectionHandle>>,
    /// Camera register that arrived before `connect()` returned its handle.
    /// Locked only while `primary` is held.
    early_register: Mutex<Option<(ConnectionHandle, Role)>>,
    primary_closed: Notify,
    /// Cancelled on explicit disconnect
    lifecycle: Mutex<CancellationToken>,
    connect_in_flight: AtomicBool,
    heartbeat_timers: Arc<AtomicUsize>,
    backoff_timers: Arc<AtomicUsize>,
}

/// One device's pairing session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(role: Role, transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(256);
        let coalescer = CaptureCoalescer::new(settings.coalesce_window());
        let lifecycle = CancellationToken::new();
        lifecycle.cancel();

        Self {
            inner: Arc::new(SessionInner {
                role,
                transport,
                settings,
                cell: Mutex::new(StateCell {
                    state: SessionState::Idle,
                    token: CancellationToken::new(),
                }),
                state_tx,
                events,
                peers: PeerTracker::new(),
                coalescer: Mutex::new(coalescer),
                code: Mutex::new(None),
                target: Mutex::new(None),
                primary: Mutex::new(None),
                early_register: Mutex::new(None),
                primary_closed: Notify::new(),
                lifecycle: Mutex::new(lifecycle),
                connect_in_flight: AtomicBool::new(false),
                heartbeat_timers: Arc::new(AtomicUsize::new(0)),
                backoff_timers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> SessionState {
        self.inner.cell.lock().state
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Code of the current session, if any
    pub fn code(&self) -> Option<SessionCode> {
        self.inner.code.lock().clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.inner.peers.summaries()
    }

    pub fn timer_counts(&self) -> TimerCounts {
        TimerCounts {
            heartbeat: self.inner.heartbeat_timers.load(Ordering::SeqCst),
            backoff: self.inner.backoff_timers.load(Ordering::SeqCst),
        }
    }

    fn connect_timeout(&self) -> Duration {
        self.inner
            .settings
            .connect_timeout()
            .unwrap_or_else(|| self.inner.transport.connect_timeout())
    }

    fn lifecycle(&self) -> CancellationToken {
        self.inner.lifecycle.lock().clone()
    }

    fn require_role(&self, expected: Role) -> Result<(), SessionError> {
        if self.inner.role == expected {
            Ok(())
        } else {
            Err(SessionError::WrongRole {
                expected,
                actual: self.inner.role,
            })
        }
    }

    // ---- state transitions ----

    /// Move to `next`, cancelling timers bound to the previous state.
    /// Returns the token for the new state.
    fn set_state(&self, next: SessionState) -> CancellationToken {
        self.transition(|_| true, next)
            .unwrap_or_else(|| self.inner.cell.lock().token.clone())
    }

    /// Move to `next` only if `allowed(current)` holds
    fn transition(
        &self,
        allowed: impl FnOnce(SessionState) -> bool,
        next: SessionState,
    ) -> Option<CancellationToken> {
        let (previous, token) = {
            let mut cell = self.inner.cell.lock();
            if !allowed(cell.state) {
                return None;
            }
            if cell.state == next {
                return Some(cell.token.clone());
            }
            let previous = cell.state;
            cell.state = next;
            cell.token.cancel();
            cell.token = CancellationToken::new();
            (previous, cell.token.clone())
        };

        tracing::info!(role = %self.inner.role, "Session {} -> {}", previous, next);
        self.inner.state_tx.send_replace(next);
        let _ = self.inner.events.send(SessionEvent::StateChanged(next));
        Some(token)
    }

    fn enter_connected(&self) {
        let Some(token) = self.transition(
            |s| s.is_active() && s != SessionState::Connected,
            SessionState::Connected,
        ) else {
            return;
        };
        self.start_heartbeat(token);
    }

    // ---- camera side ----

    /// Start a camera session: generate (or adopt) a code and advertise.
    pub async fn start(&self, code: Option<SessionCode>) -> Result<SessionCode, SessionError> {
        self.require_role(Role::Camera)?;
        let current = self.state();
        if current.is_active() {
            return Err(SessionError::AlreadyActive(current));
        }

        let code = code.unwrap_or_else(SessionCode::generate);
        let lifecycle = self.begin_lifecycle();
        self.spawn_pump(lifecycle);
        *self.inner.code.lock() = Some(code.clone());
        self.set_state(SessionState::Advertising);

        if let Err(e) = self.inner.transport.advertise(&code).await {
            tracing::warn!("Advertising failed: {}", e);
            self.teardown().await;
            return Err(e.into());
        }

        tracing::info!("Camera session {} advertising", code);
        Ok(code)
    }

    // ---- remote side ----

    /// Connect a remote to its camera. Resolves once the camera has
    /// registered back, or with the failure. Retries after a later link
    /// loss happen automatically.
    pub async fn connect(&self, target: ConnectTarget) -> Result<(), SessionError> {
        self.require_role(Role::Remote)?;
        if self.inner.connect_in_flight.swap(true, Ordering::SeqCst) {
            return Err(SessionError::ConnectInFlight);
        }
        let _in_flight = InFlight(&self.inner.connect_in_flight);

        let current = self.state();
        if current.is_active() {
            return Err(SessionError::AlreadyActive(current));
        }

        let lifecycle = self.begin_lifecycle();
        self.spawn_pump(lifecycle.clone());
        *self.inner.code.lock() = Some(target.code.clone());
        *self.inner.target.lock() = Some(target.clone());
        self.set_state(SessionState::Discovering);

        match self.establish(&target, &lifecycle).await {
            Ok(()) => Ok(()),
            Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
            Err(e) => {
                tracing::warn!("Connect to {} failed: {}", target.address, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Connect, register, and wait for the camera's registration
    async fn establish(
        &self,
        target: &ConnectTarget,
        lifecycle: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);
        self.inner.early_register.lock().take();
        let timeout = self.connect_timeout();

        let handle = tokio::select! {
            _ = lifecycle.cancelled() => return Err(SessionError::Cancelled),
            result = tokio::time::timeout(timeout, self.inner.transport.connect(target)) => match result {
                Err(_) => return Err(SessionError::ConnectTimeout(timeout)),
                Ok(result) => result?,
            }
        };

        if lifecycle.is_cancelled() {
            self.inner.transport.close(&handle).await;
            return Err(SessionError::Cancelled);
        }

        self.inner.peers.add(&handle);
        let early = {
            let mut primary = self.inner.primary.lock();
            *primary = Some(handle.clone());
            self.inner.early_register.lock().take()
        };
        let closed = self.inner.primary_closed.notified();
        let mut state_rx = self.inner.state_tx.subscribe();
        self.transition(
            |s| s == SessionState::Connecting,
            SessionState::Registering,
        );
        if let Some((early_handle, role)) = early {
            if early_handle.id == handle.id {
                self.on_register(early_handle, role);
            }
        }

        if let Err(e) = self
            .inner
            .transport
            .send(&handle, &Message::register(self.inner.role))
            .await
        {
            self.drop_primary(&handle).await;
            return Err(e.into());
        }

        let registered = async {
            state_rx
                .wait_for(|s| *s == SessionState::Connected)
                .await
                .is_ok()
        };

        tokio::select! {
            biased;
            _ = lifecycle.cancelled() => Err(SessionError::Cancelled),
            _ = closed => Err(SessionError::ConnectionLost),
            result = tokio::time::timeout(timeout, registered) => match result {
                Ok(true) => Ok(()),
                Ok(false) => Err(SessionError::Cancelled),
                Err(_) => {
                    self.drop_primary(&handle).await;
                    Err(SessionError::RegistrationTimeout(timeout))
                }
            }
        }
    }

    async fn drop_primary(&self, handle: &ConnectionHandle) {
        self.inner.peers.remove(handle.id);
        {
            let mut primary = self.inner.primary.lock();
            if primary.as_ref().map(|p| p.id) == Some(handle.id) {
                *primary = None;
            }
        }
        self.inner.transport.close(handle).await;
    }

    /// Enter Reconnecting and arm one backoff timer
    fn schedule_reconnect(&self) {
        let Some(token) = self.transition(|s| s.is_active(), SessionState::Reconnecting) else {
            return;
        };
        let backoff = self.inner.settings.reconnect_backoff();
        let guard = TimerGuard::new(&self.inner.backoff_timers);
        let session = self.clone();

        tracing::info!("Reconnecting in {:?}", backoff);
        tokio::spawn(async move {
            let guard = guard;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            drop(guard);
            session.reconnect_attempt().await;
        });
    }

    async fn reconnect_attempt(&self) {
        let lifecycle = self.lifecycle();
        let target = self.inner.target.lock().clone();
        let Some(target) = target else {
            return;
        };
        if lifecycle.is_cancelled() || self.state() != SessionState::Reconnecting {
            return;
        }
        if self.inner.connect_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight = InFlight(&self.inner.connect_in_flight);

        let result = self.establish(&target, &lifecycle).await;
        drop(in_flight);

        match result {
            Ok(()) => tracing::info!("Reconnected to {}", target.address),
            Err(SessionError::Cancelled) => {}
            Err(e) => {
                tracing::warn!("Reconnect to {} failed: {}", target.address, e);
                if !lifecycle.is_cancelled() {
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// Send a capture request to the camera. At-most-once: if the link is
    /// down the request is rejected, never queued.
    pub async fn send_capture(&self, duration_secs: Option<u32>) -> Result<(), SessionError> {
        self.require_role(Role::Remote)?;
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let primary = self.inner.primary.lock().clone();
        let handle = primary.ok_or(SessionError::NotConnected)?;

        self.inner
            .transport
            .send(&handle, &Message::capture(unix_millis(), duration_secs))
            .await?;
        tracing::info!("Capture sent to {}", handle);
        Ok(())
    }

    /// Send an advisory status line to one peer
    pub async fn send_status(
        &self,
        peer: &ConnectionHandle,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        if !self.inner.peers.is_registered(peer.id) {
            return Err(SessionError::NotConnected);
        }
        self.inner
            .transport
            .send(peer, &Message::status(text))
            .await?;
        Ok(())
    }

    /// Send a status line to every registered peer
    pub async fn broadcast_status(&self, text: &str) -> usize {
        let mut delivered = 0;
        for handle in self.inner.peers.registered() {
            match self.inner.transport.send(&handle, &Message::status(text)).await {
                Ok(_) => delivered += 1,
                Err(e) => tracing::warn!("Status to {} failed: {}", handle, e),
            }
        }
        delivered
    }

    // ---- teardown ----

    /// Explicit disconnect: cancel everything, close the transport, clear
    /// identifiers, return to Idle.
    pub async fn disconnect(&self) {
        tracing::info!("Disconnecting session");
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.inner.lifecycle.lock().cancel();
        self.set_state(SessionState::Idle);

        for handle in self.inner.peers.drain() {
            self.inner.transport.close(&handle).await;
        }
        self.inner.transport.shutdown().await;

        *self.inner.code.lock() = None;
        *self.inner.target.lock() = None;
        *self.inner.primary.lock() = None;
        self.inner.early_register.lock().take();
        self.inner.coalescer.lock().clear();
        self.inner.primary_closed.notify_waiters();
    }

    fn begin_lifecycle(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.inner.lifecycle.lock(), token.clone());
        previous.cancel();
        token
    }

    // ---- inbound ----

    fn spawn_pump(&self, lifecycle: CancellationToken) {
        let mut messages = self.inner.transport.messages();
        let mut events = self.inner.transport.connection_events();
        let session = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lifecycle.cancelled() => break,
                    message = messages.recv() => match message {
                        Ok(inbound) => session.handle_message(inbound).await,
                        Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} inbound messages", n),
                        Err(RecvError::Closed) => break,
                    },
                    event = events.recv() => match event {
                        Ok(event) => session.handle_event(event, &lifecycle).await,
                        Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} connection events", n),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Session pump stopped");
        });
    }

    async fn handle_event(&self, event: ConnectionEvent, lifecycle: &CancellationToken) {
        match event {
            ConnectionEvent::Opened(handle) => {
                if self.inner.role == Role::Camera {
                    self.accept_inbound(handle, lifecycle);
                }
            }
            ConnectionEvent::Closed { handle, reason } => {
                self.peer_lost(&handle, &reason).await;
            }
            ConnectionEvent::Malformed { handle, error } => {
                tracing::debug!("Malformed record from {}: {}", handle, error);
            }
        }
    }

    /// Camera: a remote opened a connection. Register back immediately and
    /// close it if it never registers.
    fn accept_inbound(&self, handle: ConnectionHandle, lifecycle: &CancellationToken) {
        self.inner.peers.add(&handle);
        self.transition(
            |s| s == SessionState::Advertising,
            SessionState::Registering,
        );

        let session = self.clone();
        let lifecycle = lifecycle.clone();
        let deadline = self.connect_timeout();
        tokio::spawn(async move {
            if let Err(e) = session
                .inner
                .transport
                .send(&handle, &Message::register(Role::Camera))
                .await
            {
                tracing::warn!("Register to {} failed: {}", handle, e);
                session.peer_lost(&handle, &e.to_string()).await;
                return;
            }

            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if session.inner.peers.contains(handle.id)
                        && !session.inner.peers.is_registered(handle.id)
                    {
                        tracing::warn!("{} never registered, closing", handle);
                        session.peer_lost(&handle, "registration timeout").await;
                    }
                }
            }
        });
    }

    async fn handle_message(&self, inbound: InboundMessage) {
        let InboundMessage { handle, message } = inbound;
        self.inner.peers.touch(handle.id);

        match message {
            Message::Register { role } => self.on_register(handle, role),
            Message::Ping { timestamp } => {
                let transport = self.inner.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.send(&handle, &Message::Pong { timestamp }).await {
                        tracing::debug!("Pong to {} failed: {}", handle, e);
                    }
                });
            }
            Message::Pong { timestamp } => {
                tracing::trace!(
                    "Pong from {} ({} ms round trip)",
                    handle,
                    unix_millis() - timestamp
                );
            }
            Message::Capture {
                timestamp,
                duration,
            } => self.on_capture(handle, timestamp, duration),
            Message::Status { message } => {
                tracing::info!("Status from {}: {}", handle, message);
                let _ = self.inner.events.send(SessionEvent::Status {
                    peer: handle,
                    text: message,
                });
            }
        }
    }

    fn on_register(&self, handle: ConnectionHandle, role: Role) {
        if role == self.inner.role {
            tracing::warn!("{} registered as {}, same as us; ignoring", handle, role);
            return;
        }
        if !self.state().is_active() {
            tracing::debug!("Register from {} while idle; ignoring", handle);
            return;
        }
        if self.inner.role == Role::Remote {
            let primary = self.inner.primary.lock();
            match primary.as_ref() {
                Some(p) if p.id == handle.id => {}
                Some(_) => {
                    tracing::debug!("Register from stale connection {}; ignoring", handle);
                    return;
                }
                // The camera's register can beat our own connect() returning
                None if self.state() == SessionState::Connecting => {
                    *self.inner.early_register.lock() = Some((handle, role));
                    return;
                }
                None => {
                    tracing::debug!("Register from {} with no live connection; ignoring", handle);
                    return;
                }
            }
        }

        if self.inner.peers.register(&handle, role) {
            tracing::info!("{} registered as {}", handle, role);
            let _ = self.inner.events.send(SessionEvent::PeerRegistered {
                peer: handle,
                role,
            });
        }
        self.enter_connected();
    }

    fn on_capture(&self, handle: ConnectionHandle, sent_at_ms: i64, duration: Option<u32>) {
        if self.inner.role != Role::Camera {
            tracing::warn!("Capture from {} but this device is a remote; discarding", handle);
            return;
        }
        if !self.inner.peers.is_registered(handle.id) {
            tracing::warn!(
                "Capture from {} in state {} before registration; discarding",
                handle,
                self.state()
            );
            return;
        }

        let received_at = Instant::now();
        if !self.inner.coalescer.lock().admit(handle.id, received_at) {
            tracing::debug!("Coalesced duplicate capture from {}", handle);
            return;
        }

        self.inner.peers.record_capture(handle.id);
        tracing::info!("Capture from {} (requested {:?}s)", handle, duration);
        let _ = self.inner.events.send(SessionEvent::Capture(CaptureSignal {
            peer: handle,
            sent_at_ms,
            received_at,
            requested_duration_secs: duration,
        }));
    }

    /// A peer went away: closed, failed a send, or missed heartbeats
    async fn peer_lost(&self, handle: &ConnectionHandle, reason: &str) {
        let Some(handle) = self.inner.peers.remove(handle.id) else {
            return;
        };
        self.inner.coalescer.lock().forget(handle.id);
        self.inner.transport.close(&handle).await;
        tracing::info!("Lost {}: {}", handle, reason);
        let _ = self.inner.events.send(SessionEvent::PeerLost {
            peer: handle.clone(),
            reason: reason.to_string(),
        });

        match self.inner.role {
            Role::Camera => {
                if self.inner.peers.registered_count() > 0 {
                    return;
                }
                let next = if self.inner.peers.is_empty() {
                    SessionState::Advertising
                } else {
                    SessionState::Registering
                };
                self.transition(
                    |s| matches!(s, SessionState::Connected | SessionState::Registering),
                    next,
                );
            }
            Role::Remote => {
                let was_primary = {
                    let mut primary = self.inner.primary.lock();
                    if primary.as_ref().map(|p| p.id) == Some(handle.id) {
                        *primary = None;
                        true
                    } else {
                        false
                    }
                };
                if !was_primary {
                    return;
                }
                if self.state() == SessionState::Connected {
                    self.schedule_reconnect();
                } else {
                    self.inner.primary_closed.notify_waiters();
                }
            }
        }
    }

    // ---- heartbeat ----

    fn start_heartbeat(&self, token: CancellationToken) {
        let guard = TimerGuard::new(&self.inner.heartbeat_timers);
        let interval = self.inner.settings.heartbeat_interval();
        let session = self.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => session.heartbeat_tick().await,
                }
            }
        });
    }

    async fn heartbeat_tick(&self) {
        for handle in self
            .inner
            .peers
            .stale(self.inner.settings.heartbeat_timeout())
        {
            tracing::warn!("No reply from {} within heartbeat timeout", handle);
            self.peer_lost(&handle, "heartbeat timeout").await;
        }

        let ping = Message::Ping {
            timestamp: unix_millis(),
        };
        for handle in self.inner.peers.registered() {
            tracing::trace!("Ping {}", handle);
            if let Err(e) = self.inner.transport.send(&handle, &ping).await {
                tracing::warn!("Ping to {} failed: {}", handle, e);
                self.peer_lost(&handle, &e.to_string()).await;
            }
        }
    }
}
