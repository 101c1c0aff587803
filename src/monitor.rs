//! Polling live-status monitor for a single room.

use std::sync::Arc;

use tracing::debug;

use crate::api::{LiveApi, RoomInfo, RoomStatus};
use crate::events::RoomEventKind;

/// Tracks one room's live status across polls and turns transitions into
/// events. Owns no timer; the caller decides the poll cadence.
pub struct RoomMonitor {
    room_id: u64,
    api: Arc<dyn LiveApi>,
    /// When set, the slideshow status is treated as the broadcast having
    /// ended rather than as its own state.
    slideshow_as_end: bool,
    last_status: Option<RoomStatus>,
    /// Snapshot from the most recent poll that saw the room live. Source of
    /// the elapsed time reported at live end.
    last_live_info: Option<RoomInfo>,
}

impl RoomMonitor {
    pub fn new(room_id: u64, api: Arc<dyn LiveApi>, slideshow_as_end: bool) -> Self {
        Self {
            room_id,
            api,
            slideshow_as_end,
            last_status: None,
            last_live_info: None,
        }
    }

    pub fn last_live_info(&self) -> Option<&RoomInfo> {
        self.last_live_info.as_ref()
    }

    fn effective_status(&self, raw: RoomStatus) -> RoomStatus {
        if raw == RoomStatus::Slideshow && self.slideshow_as_end {
            RoomStatus::Ended
        } else {
            raw
        }
    }

    fn elapsed_secs(&self) -> u64 {
        let Some(info) = &self.last_live_info else {
            return 0;
        };
        let start_ms = info.live_start_ms();
        if start_ms <= 0 {
            return 0;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        (now_ms.saturating_sub(start_ms).max(0) / 1000) as u64
    }

    /// One poll step. Returns the events this step produced, in order.
    pub async fn poll(&mut self) -> Vec<RoomEventKind> {
        let info = match self.api.room_info(self.room_id).await {
            Ok(info) => info,
            Err(err) => {
                debug!(room_id = self.room_id, "status poll failed: {err}");
                return vec![RoomEventKind::MonitorError {
                    message: err.to_string(),
                }];
            }
        };

        let status = self.effective_status(info.status());
        if info.status() == RoomStatus::Live {
            self.last_live_info = Some(info);
        }

        let previous = self.last_status.replace(status);
        if previous == Some(status) {
            return Vec::new();
        }

        let mut events = vec![RoomEventKind::StatusChange { status }];
        match status {
            RoomStatus::Live => events.push(RoomEventKind::LiveStart),
            RoomStatus::Ended => {
                // First poll establishing an idle baseline is not an end.
                if previous == Some(RoomStatus::Live) || previous == Some(RoomStatus::Slideshow) {
                    events.push(RoomEventKind::LiveEnd {
                        elapsed_secs: self.elapsed_secs(),
                    });
                }
            }
            RoomStatus::Slideshow => events.push(RoomEventKind::LiveSlideshow),
        }

        events
    }
}
