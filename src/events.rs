//! Typed events published to collaborator layers (notifications, admin API).
//!
//! Components do not inherit a shared emitter; every controller writes to
//! one broadcast channel and consumers subscribe to the whole stream.

use std::path::PathBuf;

use crate::api::RoomStatus;

/// One event from one room's pipeline.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room_id: u64,
    pub kind: RoomEventKind,
}

#[derive(Debug, Clone)]
pub enum RoomEventKind {
    /// Polled live status differs from the previous poll.
    StatusChange { status: RoomStatus },
    /// Room transitioned to live.
    LiveStart,
    /// Room transitioned out of live; elapsed seconds since the reported
    /// live start, or 0 if no live snapshot was observed.
    LiveEnd { elapsed_secs: u64 },
    /// Room transitioned to the slideshow state.
    LiveSlideshow,
    /// A status poll failed; the poll loop continues.
    MonitorError { message: String },

    /// First segment of a recording session started.
    RecStart { hash: String },
    /// Stop path entered; merge is about to run.
    RecStopping { hash: String },
    /// Periodic capture progress sample.
    RecProgress { out_time_secs: f64, bytes: u64 },
    /// Segment list changed (new capture segment started).
    SegmentChange { hash: String, segments: Vec<PathBuf> },
    /// Capture subprocess failed; the recorder will retry unless stopping.
    RecError { message: String },
    /// Session finalized into one merged file.
    RecEnd {
        hash: String,
        merged_file: PathBuf,
        duration_secs: u64,
    },
    /// Merge failed; not retried automatically.
    RecMergeError { message: String },

    UploadStart { task_id: u64 },
    UploadSuccess { task_id: u64, aid: u64, bvid: String },
    UploadError { task_id: u64, message: String },

    /// A controller was created for a newly subscribed room.
    HotReloadAdd,
    /// A controller was destroyed after its last subscriber left.
    HotReloadRemove,
}

impl RoomEventKind {
    /// Stable kebab-case name consumed by the notification/admin layers.
    /// The stop event is deliberately "rec-stopping", correcting the
    /// legacy "rec-stoping" spelling older consumer integrations used.
    pub fn name(&self) -> &'static str {
        match self {
            RoomEventKind::StatusChange { .. } => "status-change",
            RoomEventKind::LiveStart => "live-start",
            RoomEventKind::LiveEnd { .. } => "live-end",
            RoomEventKind::LiveSlideshow => "live-slideshow",
            RoomEventKind::MonitorError { .. } => "monitor-error",
            RoomEventKind::RecStart { .. } => "rec-start",
            RoomEventKind::RecStopping { .. } => "rec-stopping",
            RoomEventKind::RecProgress { .. } => "rec-progress",
            RoomEventKind::SegmentChange { .. } => "segment-change",
            RoomEventKind::RecError { .. } => "rec-error",
            RoomEventKind::RecEnd { .. } => "rec-end",
            RoomEventKind::RecMergeError { .. } => "rec-merge-error",
            RoomEventKind::UploadStart { .. } => "upload-start",
            RoomEventKind::UploadSuccess { .. } => "upload-success",
            RoomEventKind::UploadError { .. } => "upload-error",
            RoomEventKind::HotReloadAdd => "hot-reload-add",
            RoomEventKind::HotReloadRemove => "hot-reload-remove",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_stable() {
        let kind = RoomEventKind::RecEnd {
            hash: "abc".into(),
            merged_file: PathBuf::from("/tmp/x.flv"),
            duration_secs: 10,
        };
        assert_eq!(kind.name(), "rec-end");
        assert_eq!(RoomEventKind::HotReloadAdd.name(), "hot-reload-add");
        // The corrected spelling, not the legacy "rec-stoping".
        assert_eq!(
            RoomEventKind::RecStopping { hash: "abc".into() }.name(),
            "rec-stopping"
        );
        assert_eq!(
            RoomEventKind::LiveEnd { elapsed_secs: 0 }.name(),
            "live-end"
        );
    }
}
