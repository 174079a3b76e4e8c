//! Camera and remote over TCP, from capture button to saved clip

use async_trait::async_trait;
use replaycam::app::CameraService;
use replaycam::buffer::{CapturedSegment, MemorySegmentStore, RollingBuffer, SegmentConfig, StorageRef};
use replaycam::clock::SessionClock;
use replaycam::config::{ClipSettings, SessionSettings};
use replaycam::extract::{ClipExtractor, ExtractError, ExtractionJob, SegmentExtractor};
use replaycam::highlights::{FsHighlightStorage, HighlightLedger};
use replaycam::protocol::Role;
use replaycam::session::{Session, SessionEvent, SessionState};
use replaycam::transport::stream::StreamTransport;
use replaycam::transport::ConnectTarget;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

/// Writes a marker file, or fails on demand
struct FakeExtractor {
    fail: bool,
}

#[async_trait]
impl SegmentExtractor for FakeExtractor {
    async fn extract(&self, job: &ExtractionJob) -> Result<(), ExtractError> {
        if self.fail {
            return Err(ExtractError::Primitive("encoder crashed".to_string()));
        }
        let marker = format!(
            "{} segments from {}ms for {}ms",
            job.sources.len(),
            job.start_offset_ms,
            job.duration_ms
        );
        tokio::fs::write(job.output.to_path(), marker).await?;
        Ok(())
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        heartbeat_interval_ms: 200,
        heartbeat_timeout_ms: 800,
        reconnect_backoff_ms: 200,
        connect_timeout_ms: Some(2_000),
        coalesce_window_ms: 1_000,
    }
}

/// Buffer holding the last 320s of footage and 10s past now
fn filled_buffer(clock: &SessionClock) -> RollingBuffer {
    let config = SegmentConfig::default();
    let buffer = RollingBuffer::new(
        config,
        Duration::from_secs(330),
        Arc::new(MemorySegmentStore::new()),
    )
    .unwrap();
    let base = clock.now_ms() - 320_000;
    for i in 0..11 {
        buffer
            .ingest(CapturedSegment::nominal(
                &config,
                base + i * 30_000,
                StorageRef::new(format!("/segments/seg_{:03}.mp4", i)),
            ))
            .unwrap();
    }
    buffer
}

struct Rig {
    camera: Session,
    remote: Session,
    ledger: Arc<HighlightLedger>,
    cancel: CancellationToken,
}

async fn rig(dir: &Path, fail: bool) -> Rig {
    let clock = SessionClock::start();
    let buffer = filled_buffer(&clock);
    let storage = Arc::new(FsHighlightStorage::new(dir).unwrap());
    let ledger = Arc::new(HighlightLedger::new(storage));
    let extractor = ClipExtractor::new(buffer, Arc::new(FakeExtractor { fail }), ledger.clone());

    let camera_transport = Arc::new(StreamTransport::new("127.0.0.1:0"));
    let camera = Session::new(Role::Camera, camera_transport.clone(), settings());
    let code = camera.start(None).await.unwrap();
    let address = camera_transport.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let service = Arc::new(CameraService::new(
        camera.clone(),
        extractor,
        clock,
        ClipSettings::default(),
    ));
    service.spawn(cancel.clone());

    let remote = Session::new(
        Role::Remote,
        Arc::new(StreamTransport::new("127.0.0.1:0")),
        settings(),
    );
    remote
        .connect(ConnectTarget::new(address, code))
        .await
        .unwrap();

    let mut state = camera.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SessionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    Rig {
        camera,
        remote,
        ledger,
        cancel,
    }
}

async fn next_status(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SessionEvent::Status { text, .. }) = events.recv().await {
                return text;
            }
        }
    })
    .await
    .expect("no status from camera")
}

async fn shutdown(rig: Rig) {
    rig.cancel.cancel();
    rig.remote.disconnect().await;
    rig.camera.disconnect().await;
}

#[tokio::test]
async fn test_capture_saves_clip_and_acknowledges() {
    let dir = tempdir().unwrap();
    let rig = rig(dir.path(), false).await;
    let mut events = rig.remote.subscribe();

    rig.remote.send_capture(Some(40)).await.unwrap();
    let status = next_status(&mut events).await;

    assert!(status.starts_with("saved "), "{}", status);
    assert_eq!(rig.ledger.len(), 1);
    let highlight = rig.ledger.list()[0].clone();
    assert!(!highlight.partial);
    assert!((40_000..42_000).contains(&highlight.duration_ms));
    assert!(status.contains(&highlight.id.to_string()));

    let marker = std::fs::read_to_string(highlight.storage.to_path()).unwrap();
    assert!(marker.starts_with("2 segments") || marker.starts_with("3 segments"));

    shutdown(rig).await;
}

#[tokio::test]
async fn test_double_tap_produces_one_clip() {
    let dir = tempdir().unwrap();
    let rig = rig(dir.path(), false).await;
    let mut events = rig.remote.subscribe();

    rig.remote.send_capture(None).await.unwrap();
    rig.remote.send_capture(None).await.unwrap();
    next_status(&mut events).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(rig.ledger.len(), 1);
    assert_eq!(rig.ledger.list()[0].requested_ms, 30_000);

    shutdown(rig).await;
}

#[tokio::test]
async fn test_failed_extraction_is_reported() {
    let dir = tempdir().unwrap();
    let rig = rig(dir.path(), true).await;
    let mut events = rig.remote.subscribe();

    rig.remote.send_capture(Some(20)).await.unwrap();
    let status = next_status(&mut events).await;

    assert!(status.starts_with("failed [EXTRACTION_FAILED]"), "{}", status);
    assert!(rig.ledger.is_empty());
    let clips: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "mp4"))
        .collect();
    assert!(clips.is_empty());

    shutdown(rig).await;
}
