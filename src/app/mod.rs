//! Application wiring
//!
//! Builds the configured transport and session, then runs as camera or
//! remote until interrupted.

pub mod camera;
pub mod remote;

pub use camera::{status_text, CameraEvent, CameraService};
pub use remote::{RemoteCommand, RemoteController};

use crate::buffer::{FsSegmentStore, RollingBuffer};
use crate::capture::SegmentListWatcher;
use crate::clock::SessionClock;
use crate::config::AppConfig;
use crate::extract::{ClipExtractor, FfmpegExtractor};
use crate::highlights::{FsHighlightStorage, HighlightLedger};
use crate::protocol::Role;
use crate::session::Session;
use crate::transport::build_transport;
use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    match config.role {
        Role::Camera => run_camera(config).await,
        Role::Remote => run_remote(config).await,
    }
}

pub async fn run_camera(config: AppConfig) -> anyhow::Result<()> {
    let clock = SessionClock::start();
    let cancel = CancellationToken::new();

    let buffer = RollingBuffer::new(
        config.buffer.segment_config()?,
        config.buffer.retention(),
        Arc::new(FsSegmentStore),
    )?;
    match &config.buffer.segment_list {
        Some(list) => {
            SegmentListWatcher::new(list, buffer.clone(), 0).spawn(cancel.clone());
        }
        None => tracing::warn!("No segment list configured; the buffer will stay empty"),
    }

    let storage = FsHighlightStorage::new(&config.clip.highlights_dir)
        .context("Failed to prepare highlights directory")?
        .with_index(config.clip.persist_index);
    let ledger = Arc::new(HighlightLedger::open(Arc::new(storage)).await?);
    let extractor = ClipExtractor::new(
        buffer,
        Arc::new(FfmpegExtractor::with_binary(&config.clip.ffmpeg_path)),
        ledger,
    );

    let transport = build_transport(&config.transport.options(Role::Camera), None)?;
    let session = Session::new(Role::Camera, transport, config.session.clone());
    let code = session.start(config.transport.session_code()?).await?;
    println!("Session code: {}", code);

    let service = Arc::new(CameraService::new(
        session.clone(),
        extractor,
        clock,
        config.clip.clone(),
    ));
    let serving = service.spawn(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down camera");
    cancel.cancel();
    session.disconnect().await;
    let _ = serving.await;
    Ok(())
}

pub async fn run_remote(config: AppConfig) -> anyhow::Result<()> {
    let target = config.transport.connect_target()?;
    let transport = build_transport(&config.transport.options(Role::Remote), None)?;
    let session = Session::new(Role::Remote, transport, config.session.clone());
    let controller = RemoteController::new(session);

    controller
        .connect(target)
        .await
        .context("Could not reach the camera")?;

    let (tx, mut updates) = mpsc::channel(32);
    let forwarding = controller.forward_updates(tx);
    let printing = tokio::spawn(async move {
        while let Some(line) = updates.recv().await {
            println!("< {}", line);
        }
    });

    println!("Commands: c [secs] = capture, s <text> = status, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = RemoteCommand::parse(&line) else {
            if !line.trim().is_empty() {
                println!("? unknown command: {}", line.trim());
            }
            continue;
        };
        match controller.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {}", e),
        }
    }

    controller.session().disconnect().await;
    forwarding.abort();
    printing.abort();
    Ok(())
}
