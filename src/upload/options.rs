//! Upload metadata composed from the room snapshot and session bounds.

use tracing::warn;

use crate::api::{LiveApi, UploadOptions, VideoMeta};
use crate::config::UploadConfig;
use crate::recorder::FinishedRecording;

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Build the publish metadata for one finished recording. A cover fetch
/// failure degrades to a coverless submission instead of blocking the
/// upload.
pub async fn build_upload_options(
    api: &dyn LiveApi,
    finished: &FinishedRecording,
    config: &UploadConfig,
) -> UploadOptions {
    let info = &finished.room_info;

    let title = format!("【直播回放】{} {}", info.title, info.live_time);
    let description = format!(
        "直播间: https://live.bilibili.com/{}\n开播时间: {}\n录制区间: {} - {}\n\n{}",
        finished.room_id,
        info.live_time,
        format_ms(finished.stat.start_ms),
        format_ms(finished.stat.end_ms.unwrap_or(finished.stat.start_ms)),
        info.description,
    );

    let cover_source = if !info.keyframe.is_empty() {
        Some(info.keyframe.as_str())
    } else if !info.user_cover.is_empty() {
        Some(info.user_cover.as_str())
    } else {
        None
    };

    let cover_base64 = match cover_source {
        Some(url) => match api.image_base64(url).await {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                warn!(room_id = finished.room_id, "cover fetch failed, publishing without: {err}");
                None
            }
        },
        None => None,
    };

    UploadOptions {
        file_path: finished.merged_file.clone(),
        video: VideoMeta {
            title,
            description,
            tag: config.tag.clone(),
            tid: config.tid,
        },
        cover_base64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{room_info, ScriptedApi};
    use crate::meta::SessionStat;
    use std::path::PathBuf;

    fn finished(info: crate::api::RoomInfo) -> FinishedRecording {
        FinishedRecording {
            hash: "h".into(),
            room_id: info.room_id,
            live_start_ms: info.live_start_ms(),
            merged_file: PathBuf::from("/tmp/7_merged.flv"),
            stat: SessionStat {
                start_ms: 1_714_593_600_000,
                end_ms: Some(1_714_597_200_000),
            },
            room_info: info,
        }
    }

    #[tokio::test]
    async fn composes_title_description_and_cover() {
        let mut info = room_info(7, 0, "2024-05-01 20:00:00");
        info.keyframe = "https://img.test/keyframe.jpg".into();
        let api = ScriptedApi::new();

        let options = build_upload_options(&api, &finished(info), &UploadConfig::default()).await;
        assert!(options.video.title.contains("直播回放"));
        assert!(options.video.title.contains("test room"));
        assert!(options.video.description.contains("https://live.bilibili.com/7"));
        assert!(options.video.description.contains("2024-05-01 20:00:00"));
        assert_eq!(options.video.tid, 27);
        assert_eq!(options.cover_base64.as_deref(), Some("aGVsbG8="));
        assert_eq!(options.file_path, PathBuf::from("/tmp/7_merged.flv"));
    }

    #[tokio::test]
    async fn missing_cover_source_yields_no_cover() {
        let info = room_info(7, 0, "2024-05-01 20:00:00");
        let api = ScriptedApi::new();
        let options = build_upload_options(&api, &finished(info), &UploadConfig::default()).await;
        assert!(options.cover_base64.is_none());
    }
}
