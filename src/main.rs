mod api;
mod config;
mod events;
mod logging;
mod meta;
mod monitor;
mod recorder;
mod recovery;
mod rooms;
mod upload;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use api::{BiliClient, StaticCredentials};
use config::Config;
use meta::MetaStore;
use recorder::RecorderSettings;
use rooms::{AgentContext, RoomSetManager};
use upload::ChunkUploader;

fn print_help() {
    println!("bililive-agent - record live rooms and upload the replays");
    println!();
    println!("USAGE:");
    println!("    bililive-agent");
    println!();
    println!("Watched rooms, credentials, and paths come from the config file;");
    println!("run once to create it with defaults, then edit and restart.");
    println!();
    println!("ENVIRONMENT:");
    println!("    BILILIVE_AGENT_LOG_PATH    Override the log directory");
    println!("    RUST_LOG                   Log filter (default: info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init_logging()?;

    if std::env::args().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return Ok(());
    }

    let config = Config::load()?;
    info!(path = ?config.config_path()?, "configuration loaded");

    let save_dir = config.save_dir();
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("Failed to create save directory: {:?}", save_dir))?;

    let client = Arc::new(BiliClient::new()?);
    let credentials = Arc::new(StaticCredentials::new(
        config.upload.cookie.clone().unwrap_or_default(),
    ));
    if config.upload.cookie.is_none() && config.upload.auto_upload {
        warn!("no upload cookie configured; finished recordings will fail to upload");
    }

    let store = MetaStore::new(save_dir.clone());
    let uploader = Arc::new(ChunkUploader::new(client.clone(), credentials));
    let (events, _) = broadcast::channel(256);

    let ctx = Arc::new(AgentContext {
        api: client,
        store,
        uploader,
        settings: RecorderSettings {
            save_dir,
            ffmpeg_path: config.recording.ffmpeg_path.clone(),
            keep_segments: config.recording.keep_segments,
        },
        monitor: config.monitor.clone(),
        upload: config.upload.clone(),
        events: events.clone(),
    });

    // Mirror the event stream into the log; external consumers subscribe
    // to the same channel.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    info!(room_id = event.room_id, event = event.kind.name(), "room event")
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "event log consumer lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    recovery::run_recovery(&ctx).await?;

    let mut manager = RoomSetManager::new(ctx);
    for room_id in &config.rooms {
        manager.add_subscriber(*room_id, "config");
    }
    if manager.room_ids().is_empty() {
        warn!("no rooms configured; edit the config file and restart");
    } else {
        info!(rooms = ?manager.room_ids(), "agent running");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping rooms");
    manager.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
