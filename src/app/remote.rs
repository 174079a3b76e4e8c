//! Remote side: operator commands to capture signals

use crate::session::{Session, SessionError, SessionEvent, SessionState};
use crate::transport::ConnectTarget;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One line of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// `c` or `c <secs>`
    Capture(Option<u32>),
    /// `s <text>`
    Status(String),
    /// `q`
    Quit,
}

impl RemoteCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head {
            "c" | "capture" if rest.is_empty() => Some(RemoteCommand::Capture(None)),
            "c" | "capture" => rest
                .parse::<u32>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(|secs| RemoteCommand::Capture(Some(secs))),
            "s" | "status" if !rest.is_empty() => Some(RemoteCommand::Status(rest.to_string())),
            "q" | "quit" => Some(RemoteCommand::Quit),
            _ => None,
        }
    }
}

/// Drives a remote session
#[derive(Clone)]
pub struct RemoteController {
    session: Session,
}

impl RemoteController {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn connect(&self, target: ConnectTarget) -> Result<(), SessionError> {
        self.session.connect(target).await
    }

    pub async fn capture(&self, duration_secs: Option<u32>) -> Result<(), SessionError> {
        self.session.send_capture(duration_secs).await
    }

    /// Run one command. Returns `false` once the operator quits.
    pub async fn execute(&self, command: RemoteCommand) -> Result<bool, SessionError> {
        match command {
            RemoteCommand::Capture(secs) => {
                self.capture(secs).await?;
                Ok(true)
            }
            RemoteCommand::Status(text) => {
                let sent = self.session.broadcast_status(&text).await;
                if sent == 0 {
                    return Err(SessionError::NotConnected);
                }
                Ok(true)
            }
            RemoteCommand::Quit => {
                self.session.disconnect().await;
                Ok(false)
            }
        }
    }

    /// Forward status lines from the camera and state changes to `tx`
    pub fn forward_updates(&self, tx: mpsc::Sender<String>) -> JoinHandle<()> {
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                let line = match events.recv().await {
                    Ok(SessionEvent::Status { text, .. }) => text,
                    Ok(SessionEvent::StateChanged(SessionState::Reconnecting)) => {
                        "connection lost, reconnecting".to_string()
                    }
                    Ok(SessionEvent::StateChanged(SessionState::Connected)) => {
                        "connected".to_string()
                    }
                    Ok(SessionEvent::PeerLost { reason, .. }) => format!("camera lost: {}", reason),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        })
    }
}
