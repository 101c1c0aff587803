//! Per-room task wiring the monitor, recorder, and upload handoff into one
//! select loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{RoomEvent, RoomEventKind};
use crate::meta::{Sidecar, UploadSidecar, SCHEMA_VERSION};
use crate::monitor::RoomMonitor;
use crate::recorder::{FinishedRecording, Recorder};
use crate::upload::options::build_upload_options;

use super::AgentContext;

#[derive(Debug)]
enum ControllerCommand {
    Stop,
    Destroy,
}

/// Handle to one room's pipeline task.
pub struct RecordingController {
    room_id: u64,
    cmd_tx: mpsc::Sender<ControllerCommand>,
    task: JoinHandle<()>,
}

impl RecordingController {
    pub fn spawn(room_id: u64, ctx: Arc<AgentContext>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run(room_id, ctx, cmd_rx));
        Self {
            room_id,
            cmd_tx,
            task,
        }
    }

    /// Stop the current recording without tearing the room down.
    pub async fn stop_recording(&self) {
        let _ = self.cmd_tx.send(ControllerCommand::Stop).await;
    }

    /// Stop everything and wait for the pipeline task to finish.
    pub async fn destroy(self) {
        let _ = self.cmd_tx.send(ControllerCommand::Destroy).await;
        if let Err(err) = self.task.await {
            warn!(room_id = self.room_id, "controller task join failed: {err}");
        }
    }
}

fn publish(ctx: &AgentContext, room_id: u64, kind: RoomEventKind) {
    debug!(room_id, event = kind.name(), "room event");
    let _ = ctx.events.send(RoomEvent { room_id, kind });
}

fn publish_all(ctx: &AgentContext, room_id: u64, kinds: Vec<RoomEventKind>) {
    for kind in kinds {
        publish(ctx, room_id, kind);
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    room_id: u64,
    ctx: Arc<AgentContext>,
    mut cmd_rx: mpsc::Receiver<ControllerCommand>,
) {
    info!(room_id, "room pipeline started");

    let mut monitor = RoomMonitor::new(room_id, Arc::clone(&ctx.api), ctx.monitor.slideshow_as_end);
    let (mut recorder, mut capture_rx) = Recorder::new(
        room_id,
        Arc::clone(&ctx.api),
        ctx.store.clone(),
        ctx.settings.clone(),
    );

    let mut poll = tokio::time::interval(Duration::from_secs(ctx.monitor.poll_interval_secs.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let retry = recorder.retry_at();

        tokio::select! {
            _ = poll.tick() => {
                for kind in monitor.poll().await {
                    let follow_up = match &kind {
                        RoomEventKind::LiveStart => Some(true),
                        RoomEventKind::LiveEnd { .. } => Some(false),
                        _ => None,
                    };
                    publish(&ctx, room_id, kind);
                    match follow_up {
                        Some(true) => publish_all(&ctx, room_id, recorder.rec().await),
                        Some(false) => publish_all(&ctx, room_id, recorder.stop().await),
                        None => {}
                    }
                }
            }
            Some(event) = capture_rx.recv() => {
                publish_all(&ctx, room_id, recorder.handle_capture_event(event).await);
            }
            _ = maybe_sleep(retry), if retry.is_some() => {
                publish_all(&ctx, room_id, recorder.rec().await);
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ControllerCommand::Stop) => {
                        publish_all(&ctx, room_id, recorder.stop().await);
                    }
                    Some(ControllerCommand::Destroy) | None => {
                        // No merge here; an in-flight session stays on disk
                        // for the next startup's recovery pass.
                        publish_all(&ctx, room_id, recorder.destroy().await);
                        break;
                    }
                }
            }
        }

        if let Some(finished) = recorder.take_finished() {
            spawn_upload(Arc::clone(&ctx), finished);
        }
    }

    info!(room_id, "room pipeline stopped");
}

fn spawn_upload(ctx: Arc<AgentContext>, finished: FinishedRecording) {
    if !ctx.upload.auto_upload {
        info!(
            room_id = finished.room_id,
            merged = ?finished.merged_file,
            "auto upload disabled, keeping merged file"
        );
        return;
    }
    tokio::spawn(async move {
        upload_finished(&ctx, finished).await;
    });
}

/// Persist an upload sidecar for a finished recording and run the upload.
/// Also the entry point for the recovery pass after it merges an orphaned
/// session.
pub(crate) async fn upload_finished(ctx: &AgentContext, finished: FinishedRecording) {
    let options = build_upload_options(ctx.api.as_ref(), &finished, &ctx.upload).await;
    let sidecar = UploadSidecar {
        schema_version: SCHEMA_VERSION,
        hash: finished.hash,
        room_id: finished.room_id,
        live_start_ms: finished.live_start_ms,
        merged_file: finished.merged_file,
        stat: finished.stat,
        options,
    };
    if let Err(err) = ctx.store.write(&Sidecar::Upload(sidecar.clone())) {
        warn!(room_id = sidecar.room_id, "failed to persist upload sidecar: {err}");
    }
    run_upload_sidecar(ctx, sidecar).await;
}

/// Run the upload described by a sidecar. On success the sidecar and the
/// merged file are deleted (unless sources are being kept for debugging).
pub(crate) async fn run_upload_sidecar(ctx: &AgentContext, sidecar: UploadSidecar) {
    let task = ctx.uploader.create_task(sidecar.room_id, sidecar.options.clone());
    publish(ctx, sidecar.room_id, RoomEventKind::UploadStart { task_id: task.id });

    match ctx.uploader.run(&task).await {
        Ok(receipt) => {
            ctx.store.delete_upload(&sidecar.hash);
            if !ctx.settings.keep_segments {
                if let Err(err) = std::fs::remove_file(&sidecar.merged_file) {
                    warn!(
                        room_id = sidecar.room_id,
                        "failed to delete uploaded file {:?}: {}", sidecar.merged_file, err
                    );
                }
            }
            publish(
                ctx,
                sidecar.room_id,
                RoomEventKind::UploadSuccess {
                    task_id: task.id,
                    aid: receipt.aid,
                    bvid: receipt.bvid,
                },
            );
        }
        Err(err) => {
            warn!(room_id = sidecar.room_id, task_id = task.id, "upload failed: {err}");
            publish(
                ctx,
                sidecar.room_id,
                RoomEventKind::UploadError {
                    task_id: task.id,
                    message: err.to_string(),
                },
            );
        }
    }
}
