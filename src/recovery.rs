//! Startup recovery: finish what a crashed process left behind.
//!
//! Interrupted recordings are merged and handed to the upload path, except
//! when the same broadcast is still live, in which case the sidecar is left
//! for the room's recorder to adopt. Interrupted uploads rerun from their
//! persisted options.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::api::RoomStatus;
use crate::meta::scan::scan;
use crate::meta::{RecordSidecar, SessionStat};
use crate::recorder::{merged_file_name, session_hash, FinishedRecording};
use crate::recorder::merge::merge_segments;
use crate::rooms::controller::{run_upload_sidecar, upload_finished};
use crate::rooms::AgentContext;

pub async fn run_recovery(ctx: &Arc<AgentContext>) -> Result<()> {
    if ctx.settings.keep_segments {
        info!("segment keeping enabled, skipping recovery pass");
        return Ok(());
    }

    let report = scan(&ctx.store)?;
    info!(
        recordings = report.recordings.len(),
        uploads = report.uploads.len(),
        unknown_files = report.unknown_files.len(),
        unknown_dirs = report.unknown_dirs.len(),
        "recovery scan complete"
    );
    for path in &report.unknown_files {
        warn!("unreferenced file in save directory: {:?}", path);
    }
    for path in &report.unknown_dirs {
        warn!("unexpected directory in save directory: {:?}", path);
    }

    for recording in report.recordings {
        recover_recording(ctx, recording).await;
    }

    for upload in report.uploads {
        if !ctx.upload.auto_upload {
            info!(
                room_id = upload.room_id,
                "auto upload disabled, leaving interrupted upload {:?}", upload.merged_file
            );
            continue;
        }
        info!(room_id = upload.room_id, hash = %upload.hash, "resuming interrupted upload");
        run_upload_sidecar(ctx, upload).await;
    }

    Ok(())
}

async fn recover_recording(ctx: &Arc<AgentContext>, sidecar: RecordSidecar) {
    // The broadcast may still be running; the recorder will then adopt
    // this very sidecar instead of starting a parallel session.
    if let Ok(info) = ctx.api.room_info(sidecar.room_id).await {
        if info.status() == RoomStatus::Live
            && session_hash(sidecar.room_id, info.live_start_ms()) == sidecar.hash
        {
            info!(
                room_id = sidecar.room_id,
                hash = %sidecar.hash,
                "broadcast still live, leaving session for adoption"
            );
            return;
        }
    }

    info!(
        room_id = sidecar.room_id,
        hash = %sidecar.hash,
        segments = sidecar.segment_files.len(),
        "merging orphaned session"
    );

    let slug = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let output = ctx
        .settings
        .save_dir
        .join(merged_file_name(sidecar.room_id, &slug));

    let merged = merge_segments(
        &ctx.settings.ffmpeg_path,
        sidecar.segment_files.clone(),
        &output,
        ctx.settings.keep_segments,
    )
    .await;

    match merged {
        Ok(merged_file) => {
            ctx.store.delete_record(&sidecar.hash);
            if !ctx.upload.auto_upload {
                info!(
                    room_id = sidecar.room_id,
                    "auto upload disabled, keeping merged file {:?}", merged_file
                );
                return;
            }
            let end_ms = sidecar
                .session_end_ms
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            let finished = FinishedRecording {
                hash: sidecar.hash,
                room_id: sidecar.room_id,
                live_start_ms: sidecar.live_start_ms,
                merged_file,
                stat: SessionStat {
                    start_ms: sidecar.session_start_ms,
                    end_ms: Some(end_ms),
                },
                room_info: sidecar.room_info,
            };
            upload_finished(ctx, finished).await;
        }
        Err(err) => {
            warn!(
                room_id = sidecar.room_id,
                hash = %sidecar.hash,
                "orphan merge failed, leaving sidecar in place: {err}"
            );
        }
    }
}
