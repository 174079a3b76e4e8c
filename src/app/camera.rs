//! Camera side: capture signals in, clips out
//!
//! Each capture is handled on its own task so a slow extraction never
//! delays the next signal or the session's heartbeat.

use crate::clock::SessionClock;
use crate::config::ClipSettings;
use crate::extract::{ClipExtractor, ClipOutcome, ClipRequest, Coverage, ExtractError};
use crate::highlights::Highlight;
use crate::session::{CaptureSignal, Session, SessionEvent};
use crate::utils::ErrorResponse;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one capture, for whoever drives the camera UI
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CameraEvent {
    #[serde(rename_all = "camelCase")]
    ClipSaved {
        highlight: Highlight,
        coverage: Coverage,
    },
    #[serde(rename_all = "camelCase")]
    ClipFailed { peer: String, error: ErrorResponse },
}

/// Status line sent back to the remote
pub fn status_text(result: &Result<ClipOutcome, ExtractError>) -> String {
    match result {
        Ok(outcome) => {
            let saved = format!(
                "saved {} {:.1}s",
                outcome.highlight.id,
                outcome.highlight.duration_secs()
            );
            match outcome.coverage {
                Coverage::Full => saved,
                Coverage::Partial { reason, .. } => format!("{} (partial: {})", saved, reason),
            }
        }
        Err(e) => {
            let response = ErrorResponse {
                code: e.code().to_string(),
                message: e.to_string(),
            };
            format!("failed {}", response)
        }
    }
}

pub struct CameraService {
    session: Session,
    extractor: ClipExtractor,
    clock: SessionClock,
    settings: ClipSettings,
    events: broadcast::Sender<CameraEvent>,
}

impl CameraService {
    pub fn new(
        session: Session,
        extractor: ClipExtractor,
        clock: SessionClock,
        settings: ClipSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            session,
            extractor,
            clock,
            settings,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }

    pub fn extractor(&self) -> &ClipExtractor {
        &self.extractor
    }

    fn coverage_wait(&self) -> Duration {
        let segment = self.extractor.buffer().config().segment_duration_ms() as u64;
        Duration::from_millis(segment) + self.settings.coverage_grace()
    }

    /// Extract the clip for one capture and report back to its sender
    pub async fn handle_capture(
        &self,
        signal: CaptureSignal,
    ) -> Result<ClipOutcome, ExtractError> {
        let trigger_ms = self.clock.ms_at(signal.received_at);
        let duration_secs = signal
            .requested_duration_secs
            .unwrap_or(self.settings.default_duration_secs);
        let request = ClipRequest::new(trigger_ms, duration_secs);

        tracing::info!(
            peer = %signal.peer.peer,
            trigger_ms,
            "Capture requested: last {}s",
            duration_secs
        );

        // The segment holding the trigger is usually still being recorded
        let buffer = self.extractor.buffer();
        if !buffer.wait_until_covered(trigger_ms, self.coverage_wait()).await {
            tracing::warn!(
                trigger_ms,
                covered_to = ?buffer.coverage_end_ms(),
                "Trigger not buffered in time, extracting what exists"
            );
        }

        let result = self
            .extractor
            .extract(request, Some(signal.peer.peer.clone()))
            .await;

        let text = status_text(&result);
        if let Err(e) = self.session.send_status(&signal.peer, text.as_str()).await {
            tracing::warn!(peer = %signal.peer.peer, "Could not report capture result: {}", e);
        }

        let event = match &result {
            Ok(outcome) => {
                tracing::info!("{}", text);
                CameraEvent::ClipSaved {
                    highlight: outcome.highlight.clone(),
                    coverage: outcome.coverage,
                }
            }
            Err(e) => CameraEvent::ClipFailed {
                peer: signal.peer.peer.clone(),
                error: ErrorResponse {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            },
        };
        let _ = self.events.send(event);

        result
    }

    /// Serve capture signals until `cancel` fires or the session goes away
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SessionEvent::Capture(signal)) => {
                            let service = self.clone();
                            tokio::spawn(async move {
                                let _ = service.handle_capture(signal).await;
                            });
                        }
                        Ok(SessionEvent::PeerRegistered { peer, role }) => {
                            tracing::info!("{} {} joined", role, peer.peer);
                        }
                        Ok(SessionEvent::PeerLost { peer, reason }) => {
                            tracing::info!("{} left: {}", peer.peer, reason);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("Camera service missed {} session events", n)
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Camera service stopped");
        })
    }
}
