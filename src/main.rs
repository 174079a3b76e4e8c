//! `replaycam` -- camera or remote, chosen by configuration.
//!
//! # Environment variables
//!
//! | Variable                 | Default   | Description                          |
//! |--------------------------|-----------|--------------------------------------|
//! | `REPLAYCAM_CONFIG`       | --        | JSON configuration file              |
//! | `REPLAYCAM_ROLE`         | `camera`  | `camera` or `remote`                 |
//! | `REPLAYCAM_TRANSPORT`    | `stream`  | `stream`, `duplex`, `poll`, `cloud`  |
//! | `REPLAYCAM_PEER`         | --        | Camera address (remote only)         |
//! | `REPLAYCAM_CODE`         | generated | Session code                         |
//! | `RUST_LOG`               | `replaycam=debug` | Log filter                   |

use anyhow::Context;
use replaycam::utils::logging;
use replaycam::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Invalid configuration")?;
    logging::init();

    tracing::info!(
        role = %config.role,
        transport = %config.transport.kind,
        "Configuration loaded"
    );

    replaycam::app::run(config).await
}
