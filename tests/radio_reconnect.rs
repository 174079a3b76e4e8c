//! Link loss and recovery over the in-process radio

use replaycam::config::SessionSettings;
use replaycam::protocol::Role;
use replaycam::session::{Session, SessionEvent, SessionState};
use replaycam::transport::radio::{LocalRadio, RadioTransport};
use replaycam::transport::ConnectTarget;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> SessionSettings {
    SessionSettings {
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 400,
        reconnect_backoff_ms: 100,
        connect_timeout_ms: Some(300),
        coalesce_window_ms: 1_000,
    }
}

fn session(radio: &LocalRadio, device: &str, role: Role) -> Session {
    Session::new(
        role,
        Arc::new(RadioTransport::new(Arc::new(radio.adapter(device)))),
        settings(),
    )
}

async fn wait_state(session: &Session, state: SessionState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {}", state))
        .unwrap();
}

/// Wait for a transition that may be short-lived
async fn saw_state(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    state: SessionState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SessionEvent::StateChanged(next)) = events.recv().await {
                if next == state {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never entered {}", state));
}

async fn paired(radio: &LocalRadio) -> (Session, Session) {
    let camera = session(radio, "camera", Role::Camera);
    let remote = session(radio, "remote", Role::Remote);
    let code = camera.start(None).await.unwrap();
    remote.connect(ConnectTarget::new("", code)).await.unwrap();
    wait_state(&camera, SessionState::Connected).await;
    (camera, remote)
}

#[tokio::test]
async fn test_severed_link_reconnects() {
    let radio = LocalRadio::new();
    let (camera, remote) = paired(&radio).await;
    let mut events = remote.subscribe();

    radio.sever();
    saw_state(&mut events, SessionState::Reconnecting).await;
    wait_state(&remote, SessionState::Connected).await;
    wait_state(&camera, SessionState::Connected).await;

    // Give cancelled timers a moment to unwind
    tokio::time::sleep(Duration::from_millis(150)).await;
    let timers = remote.timer_counts();
    assert_eq!(timers.heartbeat, 1);
    assert_eq!(timers.backoff, 0);
    assert_eq!(camera.timer_counts().heartbeat, 1);

    remote.send_capture(None).await.unwrap();

    remote.disconnect().await;
    camera.disconnect().await;
}

#[tokio::test]
async fn test_out_of_range_keeps_one_timer() {
    let radio = LocalRadio::new();
    let (camera, remote) = paired(&radio).await;
    let mut events = remote.subscribe();

    radio.set_reachable(false);
    saw_state(&mut events, SessionState::Reconnecting).await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let timers = remote.timer_counts();
        assert!(timers.backoff <= 1, "{:?}", timers);
        assert!(remote.state() != SessionState::Connected);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.timer_counts().heartbeat, 0);
    assert!(matches!(
        remote.send_capture(None).await,
        Err(replaycam::session::SessionError::NotConnected)
    ));

    radio.set_reachable(true);
    wait_state(&remote, SessionState::Connected).await;
    wait_state(&camera, SessionState::Connected).await;

    remote.disconnect().await;
    camera.disconnect().await;
    assert_eq!(remote.state(), SessionState::Idle);
}
