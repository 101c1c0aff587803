//! Per-room recording state machine.
//!
//! A session spans one broadcast and may be captured in several segments
//! when ffmpeg dies and the room turns out to still be live. The session
//! is keyed by a hash of room id and live start time, which also names the
//! sidecar file, so a restarted process resumes the same session instead
//! of starting a parallel one.

pub mod capture;
pub mod merge;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApiError, LiveApi, RoomInfo, RoomStatus};
use crate::events::RoomEventKind;
use crate::meta::{MetaStore, RecordSidecar, SessionStat, Sidecar, SCHEMA_VERSION};
use capture::{CaptureConfig, CaptureEvent, CaptureEventKind, CaptureHandle};

/// Delay before retrying a failed capture start.
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Natural-end verification: polls before the broadcast counts as over.
const END_VERIFY_ATTEMPTS: u32 = 24;
const END_VERIFY_DELAY: Duration = Duration::from_secs(5);

/// Session key: identical for every capture of the same broadcast, across
/// process restarts.
pub fn session_hash(room_id: u64, live_start_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{room_id}_{live_start_ms}").as_bytes());
    hex::encode(hasher.finalize())
}

pub fn segment_file_name(room_id: u64, slug: &str) -> String {
    format!("{room_id}_{slug}.flv")
}

pub fn merged_file_name(room_id: u64, slug: &str) -> String {
    format!("{room_id}_merged_{slug}.flv")
}

fn timestamp_slug() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    NotRecording,
    Recording,
    Stopping,
}

/// Filesystem and tool settings, resolved from configuration.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub save_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub keep_segments: bool,
}

/// Result of a finalized session, handed to the upload path.
#[derive(Debug, Clone)]
pub struct FinishedRecording {
    pub hash: String,
    pub room_id: u64,
    pub live_start_ms: i64,
    pub merged_file: PathBuf,
    pub stat: SessionStat,
    pub room_info: RoomInfo,
}

struct Session {
    sidecar: RecordSidecar,
    handle: Option<CaptureHandle>,
    /// Media seconds reported for the capture still running; folded into
    /// the sidecar's total when the capture exits.
    active_secs: f64,
}

pub struct Recorder {
    room_id: u64,
    api: Arc<dyn LiveApi>,
    store: MetaStore,
    settings: RecorderSettings,
    state: RecorderState,
    session: Option<Session>,
    /// Bumped whenever a capture is started or deliberately killed; exit
    /// events carrying an older generation are ignored.
    generation: u64,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    retry_at: Option<Instant>,
    finished: Option<FinishedRecording>,
}

impl Recorder {
    /// The returned receiver carries capture events that must be fed back
    /// through [`Recorder::handle_capture_event`].
    pub fn new(
        room_id: u64,
        api: Arc<dyn LiveApi>,
        store: MetaStore,
        settings: RecorderSettings,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let recorder = Self {
            room_id,
            api,
            store,
            settings,
            state: RecorderState::NotRecording,
            session: None,
            generation: 0,
            capture_tx,
            retry_at: None,
            finished: None,
        };
        (recorder, capture_rx)
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// When set, the controller should call [`Recorder::rec`] again at this
    /// deadline.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Consume the result of the most recently finalized session.
    pub fn take_finished(&mut self) -> Option<FinishedRecording> {
        self.finished.take()
    }

    fn capture_active(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.handle.is_some())
            .unwrap_or(false)
    }

    /// Start (or retry) capturing. No-op while a capture child is already
    /// running; safe to call on every live-start signal.
    pub async fn rec(&mut self) -> Vec<RoomEventKind> {
        if self.capture_active() || self.state == RecorderState::Stopping {
            return Vec::new();
        }
        self.retry_at = None;

        let info = match self.api.room_info(self.room_id).await {
            Ok(info) => info,
            Err(err) => return self.capture_failed(format!("room info fetch failed: {err}")),
        };
        if info.status() != RoomStatus::Live {
            debug!(room_id = self.room_id, "not live, skipping capture start");
            // A session that never captured a segment has nothing worth
            // keeping once the broadcast is gone.
            if self
                .session
                .as_ref()
                .map(|session| session.sidecar.segment_files.is_empty())
                .unwrap_or(false)
            {
                self.abandon_session();
            }
            return Vec::new();
        }

        self.start_or_resume(info).await
    }

    /// Spawn a capture for the current session, creating or adopting the
    /// session first when none is active.
    async fn start_or_resume(&mut self, info: RoomInfo) -> Vec<RoomEventKind> {
        // A session left over from an earlier broadcast must not absorb
        // this one's segments; the hash is keyed on the live start time.
        if self
            .session
            .as_ref()
            .map(|session| session.sidecar.live_start_ms != info.live_start_ms())
            .unwrap_or(false)
        {
            self.abandon_session();
            self.state = RecorderState::NotRecording;
        }

        if self.session.is_none() {
            let hash = session_hash(self.room_id, info.live_start_ms());
            let sidecar = match self.store.load_record(&hash) {
                Some(mut existing) => {
                    existing.segment_files = merge::clean_segments(existing.segment_files);
                    info!(
                        room_id = self.room_id,
                        hash,
                        segments = existing.segment_files.len(),
                        "adopted interrupted session"
                    );
                    existing.room_info = info.clone();
                    existing
                }
                None => RecordSidecar {
                    schema_version: SCHEMA_VERSION,
                    hash: hash.clone(),
                    room_id: self.room_id,
                    live_start_ms: info.live_start_ms(),
                    segment_files: Vec::new(),
                    session_start_ms: now_ms(),
                    session_end_ms: None,
                    recorded_secs: 0.0,
                    room_info: info.clone(),
                },
            };
            self.session = Some(Session {
                sidecar,
                handle: None,
                active_secs: 0.0,
            });
        }

        let url = match self.pick_stream_url().await {
            Ok(url) => url,
            Err(err) => return self.capture_failed(format!("no usable stream: {err}")),
        };

        let segment = self
            .settings
            .save_dir
            .join(segment_file_name(self.room_id, &timestamp_slug()));

        self.generation += 1;
        let spawned = capture::spawn_capture(
            CaptureConfig {
                ffmpeg_path: self.settings.ffmpeg_path.clone(),
                stream_url: url,
                output: segment.clone(),
            },
            self.generation,
            self.capture_tx.clone(),
        );

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => return self.capture_failed(format!("capture spawn failed: {err}")),
        };

        let mut events = Vec::new();
        if let Some(session) = self.session.as_mut() {
            session.sidecar.segment_files.push(segment);
            session.handle = Some(handle);

            if let Err(err) = self.store.write(&Sidecar::Recording(session.sidecar.clone())) {
                warn!(room_id = self.room_id, "failed to persist sidecar: {err}");
            }

            let hash = session.sidecar.hash.clone();
            if self.state == RecorderState::NotRecording {
                self.state = RecorderState::Recording;
                events.push(RoomEventKind::RecStart { hash: hash.clone() });
            }
            events.push(RoomEventKind::SegmentChange {
                hash,
                segments: session.sidecar.segment_files.clone(),
            });
        }
        events
    }

    async fn pick_stream_url(&self) -> Result<String, ApiError> {
        let urls = self.api.stream_urls(self.room_id).await?;
        for url in urls {
            if self.api.stream_reachable(&url).await {
                return Ok(url);
            }
        }
        Err(ApiError::Other("no candidate stream answered".into()))
    }

    /// Drop a session that belongs to a broadcast this recorder is done
    /// with. An empty one disappears; one with segments is killed and left
    /// on disk for the recovery pass, like a crash would leave it.
    fn abandon_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(handle) = session.handle.take() {
            handle.kill();
        }
        self.generation += 1;

        if session.sidecar.segment_files.is_empty() {
            debug!(
                room_id = self.room_id,
                hash = %session.sidecar.hash,
                "dropping segmentless session"
            );
            self.store.delete_record(&session.sidecar.hash);
            return;
        }

        session.sidecar.session_end_ms = Some(now_ms());
        if let Err(err) = self.store.write(&Sidecar::Recording(session.sidecar.clone())) {
            warn!(room_id = self.room_id, "failed to stamp session end: {err}");
        }
        info!(
            room_id = self.room_id,
            hash = %session.sidecar.hash,
            "session left on disk for recovery"
        );
    }

    fn capture_failed(&mut self, message: String) -> Vec<RoomEventKind> {
        warn!(room_id = self.room_id, "{message}");
        self.retry_at = Some(Instant::now() + RETRY_DELAY);
        vec![RoomEventKind::RecError { message }]
    }

    /// React to a capture event from this recorder's channel.
    pub async fn handle_capture_event(&mut self, event: CaptureEvent) -> Vec<RoomEventKind> {
        if event.generation != self.generation {
            debug!(
                room_id = self.room_id,
                generation = event.generation,
                "dropping event from abandoned capture"
            );
            return Vec::new();
        }

        match event.kind {
            CaptureEventKind::Progress {
                out_time_secs,
                bytes,
            } => {
                if let Some(session) = self.session.as_mut() {
                    session.active_secs = out_time_secs;
                }
                vec![RoomEventKind::RecProgress {
                    out_time_secs,
                    bytes,
                }]
            }
            CaptureEventKind::Exited {
                out_time_secs,
                reason,
            } => {
                info!(
                    room_id = self.room_id,
                    out_time_secs,
                    ?reason,
                    "capture exited"
                );
                if let Some(session) = self.session.as_mut() {
                    session.handle = None;
                    session.sidecar.recorded_secs += out_time_secs;
                    session.active_secs = 0.0;
                }
                if self.state != RecorderState::Recording {
                    return Vec::new();
                }
                match reason {
                    capture::ExitReason::Natural => self.verify_end_or_resume().await,
                    capture::ExitReason::Killed(message) | capture::ExitReason::Error(message) => {
                        // A dead capture is not a dead broadcast; retry and
                        // let the monitor's live-end close the session if
                        // the room really went offline.
                        self.capture_failed(format!("capture ended early: {message}"))
                    }
                }
            }
        }
    }

    /// The capture died. Distinguish a real broadcast end from a dropped
    /// stream by re-polling the room; only a confirmed end (or exhausted
    /// attempts) finalizes the session.
    async fn verify_end_or_resume(&mut self) -> Vec<RoomEventKind> {
        for _ in 0..END_VERIFY_ATTEMPTS {
            match self.api.room_info(self.room_id).await {
                Ok(info) if info.status() == RoomStatus::Live => {
                    info!(room_id = self.room_id, "room still live, starting next segment");
                    return self.start_or_resume(info).await;
                }
                Ok(_) => break,
                Err(err) => {
                    debug!(room_id = self.room_id, "end verification poll failed: {err}");
                    tokio::time::sleep(END_VERIFY_DELAY).await;
                }
            }
        }
        self.stop_internal().await
    }

    /// Stop the session: kill the capture and merge what was recorded.
    pub async fn stop(&mut self) -> Vec<RoomEventKind> {
        if self.state != RecorderState::Recording {
            return Vec::new();
        }
        self.stop_internal().await
    }

    /// Tear down without merging: kill the capture, stamp the session end,
    /// and leave the sidecar and segments on disk for the startup recovery
    /// pass. Used at controller teardown.
    pub async fn destroy(&mut self) -> Vec<RoomEventKind> {
        self.retry_at = None;
        self.abandon_session();
        self.state = RecorderState::NotRecording;
        Vec::new()
    }

    async fn stop_internal(&mut self) -> Vec<RoomEventKind> {
        self.state = RecorderState::Stopping;
        let mut events = Vec::new();

        if let Some(session) = self.session.as_mut() {
            events.push(RoomEventKind::RecStopping {
                hash: session.sidecar.hash.clone(),
            });
            if let Some(handle) = session.handle.take() {
                handle.kill();
            }
        }
        // The killed child's exit event must not trigger a second finalize.
        self.generation += 1;

        events.extend(self.finalize().await);
        events
    }

    async fn finalize(&mut self) -> Vec<RoomEventKind> {
        self.state = RecorderState::NotRecording;
        self.retry_at = None;

        let Some(mut session) = self.session.take() else {
            return Vec::new();
        };

        let end_ms = now_ms();
        session.sidecar.session_end_ms = Some(end_ms);
        // Stamp the end before merging so a crash mid-merge keeps bounds.
        if let Err(err) = self.store.write(&Sidecar::Recording(session.sidecar.clone())) {
            warn!(room_id = self.room_id, "failed to stamp session end: {err}");
        }

        let hash = session.sidecar.hash.clone();
        let output = self
            .settings
            .save_dir
            .join(merged_file_name(self.room_id, &timestamp_slug()));

        let merged = merge::merge_segments(
            &self.settings.ffmpeg_path,
            session.sidecar.segment_files.clone(),
            &output,
            self.settings.keep_segments,
        )
        .await;

        match merged {
            Ok(merged_file) => {
                self.store.delete_record(&hash);
                // Media time as reported by ffmpeg, not the wall-clock
                // session span: retry gaps and end verification windows
                // must not count.
                let duration_secs =
                    (session.sidecar.recorded_secs + session.active_secs).round() as u64;
                self.finished = Some(FinishedRecording {
                    hash: hash.clone(),
                    room_id: self.room_id,
                    live_start_ms: session.sidecar.live_start_ms,
                    merged_file: merged_file.clone(),
                    stat: SessionStat {
                        start_ms: session.sidecar.session_start_ms,
                        end_ms: Some(end_ms),
                    },
                    room_info: session.sidecar.room_info,
                });
                vec![RoomEventKind::RecEnd {
                    hash,
                    merged_file,
                    duration_secs,
                }]
            }
            Err(err) => {
                warn!(room_id = self.room_id, "merge failed: {err}");
                vec![RoomEventKind::RecMergeError {
                    message: err.to_string(),
                }]
            }
        }
    }

    #[cfg(test)]
    fn inject_session(&mut self, sidecar: RecordSidecar) {
        self.session = Some(Session {
            sidecar,
            handle: None,
            active_secs: 0.0,
        });
        self.state = RecorderState::Recording;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{room_info, ScriptedApi};
    use crate::meta::testing::{record_sidecar, touch};
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path, ffmpeg: &str) -> RecorderSettings {
        RecorderSettings {
            save_dir: dir.to_path_buf(),
            ffmpeg_path: PathBuf::from(ffmpeg),
            keep_segments: false,
        }
    }

    fn kinds(events: &[RoomEventKind]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    #[test]
    fn session_hash_is_deterministic_and_distinct() {
        let a = session_hash(12345, 1_700_000_000_000);
        let b = session_hash(12345, 1_700_000_000_000);
        let c = session_hash(12345, 1_700_000_000_001);
        let d = session_hash(12346, 1_700_000_000_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn file_names_carry_room_and_slug() {
        assert_eq!(
            segment_file_name(42, "2024-05-01_20-00-00"),
            "42_2024-05-01_20-00-00.flv"
        );
        assert_eq!(
            merged_file_name(42, "2024-05-01_20-00-00"),
            "42_merged_2024-05-01_20-00-00.flv"
        );
    }

    #[tokio::test]
    async fn rec_skips_rooms_that_are_not_live() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::with_fallback(room_info(1, 0, "")));
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(1, api, store, settings(dir.path(), "ffmpeg"));

        assert!(recorder.rec().await.is_empty());
        assert_eq!(recorder.state(), RecorderState::NotRecording);
        assert!(recorder.retry_at().is_none());
    }

    #[tokio::test]
    async fn rec_arms_retry_on_poll_failure() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(1, api, store, settings(dir.path(), "ffmpeg"));

        let events = recorder.rec().await;
        assert_eq!(kinds(&events), vec!["rec-error"]);
        assert!(recorder.retry_at().is_some());
    }

    #[tokio::test]
    async fn rec_arms_retry_when_spawn_fails() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::with_fallback(room_info(
            1,
            1,
            "2024-05-01 20:00:00",
        )));
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(
            1,
            api,
            store,
            settings(dir.path(), "/nonexistent/ffmpeg-binary"),
        );

        let events = recorder.rec().await;
        assert_eq!(kinds(&events), vec!["rec-error"]);
        assert!(recorder.retry_at().is_some());
        assert_eq!(recorder.state(), RecorderState::NotRecording);
    }

    #[tokio::test]
    async fn stop_finalizes_single_segment_by_rename() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::with_fallback(room_info(
            7,
            0,
            "2024-05-01 20:00:00",
        )));
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) =
            Recorder::new(7, api, store.clone(), settings(dir.path(), "ffmpeg"));

        let seg = dir.path().join("7_2024-05-01_20-00-01.flv");
        touch(&seg, 256);
        let sidecar = record_sidecar("hash7", 7, "2024-05-01 20:00:00", vec![seg.clone()]);
        store.write(&Sidecar::Recording(sidecar.clone())).unwrap();
        recorder.inject_session(sidecar);

        let events = recorder.stop().await;
        assert_eq!(kinds(&events), vec!["rec-stopping", "rec-end"]);
        assert_eq!(recorder.state(), RecorderState::NotRecording);

        let finished = recorder.take_finished().unwrap();
        assert_eq!(finished.room_id, 7);
        assert!(finished.merged_file.exists());
        assert!(!seg.exists());
        // Sidecar removed once the merged file exists.
        assert!(store.load_record("hash7").is_none());
    }

    #[tokio::test]
    async fn stop_without_session_is_a_no_op() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(1, api, store, settings(dir.path(), "ffmpeg"));

        assert!(recorder.stop().await.is_empty());
        assert!(recorder.destroy().await.is_empty());
    }

    #[tokio::test]
    async fn merge_failure_keeps_the_sidecar() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) =
            Recorder::new(7, api, store.clone(), settings(dir.path(), "ffmpeg"));

        // Both segments vanish before the merge, so there is nothing usable.
        let sidecar = record_sidecar(
            "hash7",
            7,
            "2024-05-01 20:00:00",
            vec![dir.path().join("gone1.flv"), dir.path().join("gone2.flv")],
        );
        store.write(&Sidecar::Recording(sidecar.clone())).unwrap();
        recorder.inject_session(sidecar);

        let events = recorder.stop().await;
        assert_eq!(kinds(&events), vec!["rec-stopping", "rec-merge-error"]);
        assert!(recorder.take_finished().is_none());
        // End stamp persisted even though the merge failed.
        let raw = std::fs::read_to_string(store.record_path("hash7")).unwrap();
        assert!(raw.contains("session_end_ms"));
    }

    #[tokio::test]
    async fn adopts_existing_sidecar_for_the_same_broadcast() {
        let dir = tempdir().unwrap();
        let info = room_info(12345, 1, "2024-05-01 20:00:00");
        let hash = session_hash(12345, info.live_start_ms());

        let good_a = dir.path().join("12345_a.flv");
        touch(&good_a, 100);
        let good_b = dir.path().join("12345_b.flv");
        touch(&good_b, 100);
        let empty = dir.path().join("12345_empty.flv");
        touch(&empty, 0);

        let store = MetaStore::new(dir.path().to_path_buf());
        let sidecar = record_sidecar(
            &hash,
            12345,
            "2024-05-01 20:00:00",
            vec![good_a.clone(), empty.clone(), good_b.clone()],
        );
        store.write(&Sidecar::Recording(sidecar)).unwrap();

        let api = Arc::new(ScriptedApi::with_fallback(info));
        // Using a binary that exists so the spawn itself succeeds.
        let (mut recorder, _rx) =
            Recorder::new(12345, api, store.clone(), settings(dir.path(), "/bin/true"));

        let events = recorder.rec().await;
        assert_eq!(kinds(&events), vec!["rec-start", "segment-change"]);
        assert_eq!(recorder.state(), RecorderState::Recording);

        match &events[1] {
            RoomEventKind::SegmentChange { segments, .. } => {
                // Two adopted segments plus the new one; the empty adoptee
                // was dropped and deleted.
                assert_eq!(segments.len(), 3);
                assert_eq!(segments[0], good_a);
                assert_eq!(segments[1], good_b);
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert!(!empty.exists());
    }

    #[tokio::test]
    async fn new_broadcast_never_lands_in_a_stale_session() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(
            9,
            api.clone() as Arc<dyn LiveApi>,
            store.clone(),
            settings(dir.path(), "/bin/true"),
        );

        // Broadcast A goes live but no stream answers, so a segmentless
        // session is created and the retry is armed.
        let info_a = room_info(9, 1, "2024-05-01 20:00:00");
        let hash_a = session_hash(9, info_a.live_start_ms());
        api.reachable.store(false, std::sync::atomic::Ordering::SeqCst);
        api.push(Ok(info_a));
        assert_eq!(kinds(&recorder.rec().await), vec!["rec-error"]);

        // Broadcast A ends before anything was captured; stop has nothing
        // to do.
        assert!(recorder.stop().await.is_empty());

        // Broadcast B starts with a different live start time.
        let info_b = room_info(9, 1, "2024-05-02 21:00:00");
        let hash_b = session_hash(9, info_b.live_start_ms());
        api.reachable.store(true, std::sync::atomic::Ordering::SeqCst);
        api.push(Ok(info_b));
        let events = recorder.rec().await;
        assert_eq!(kinds(&events), vec!["rec-start", "segment-change"]);

        match &events[0] {
            RoomEventKind::RecStart { hash } => assert_eq!(hash, &hash_b),
            other => panic!("unexpected event {}", other.name()),
        }
        assert!(store.record_path(&hash_b).exists());
        assert!(!store.record_path(&hash_a).exists());

        let raw = std::fs::read_to_string(store.record_path(&hash_b)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value["live_start_ms"].as_i64(),
            Some(room_info(9, 1, "2024-05-02 21:00:00").live_start_ms())
        );
    }

    #[tokio::test]
    async fn rec_end_duration_is_accumulated_media_time() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(7, api, store, settings(dir.path(), "ffmpeg"));

        let seg = dir.path().join("7_part.flv");
        touch(&seg, 256);
        // The session started hours of wall time ago but carries 100s of
        // media from earlier segments.
        let mut sidecar = record_sidecar("hash7", 7, "2024-05-01 20:00:00", vec![seg]);
        sidecar.recorded_secs = 100.0;
        recorder.inject_session(sidecar);

        let progress = CaptureEvent {
            generation: 0,
            kind: CaptureEventKind::Progress {
                out_time_secs: 20.0,
                bytes: 4096,
            },
        };
        assert_eq!(
            kinds(&recorder.handle_capture_event(progress).await),
            vec!["rec-progress"]
        );

        let events = recorder.stop().await;
        assert_eq!(kinds(&events), vec!["rec-stopping", "rec-end"]);
        match &events[1] {
            RoomEventKind::RecEnd { duration_secs, .. } => assert_eq!(*duration_secs, 120),
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn destroy_leaves_the_session_for_recovery() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) =
            Recorder::new(7, api, store.clone(), settings(dir.path(), "ffmpeg"));

        let seg = dir.path().join("7_part.flv");
        touch(&seg, 256);
        let sidecar = record_sidecar("hash7", 7, "2024-05-01 20:00:00", vec![seg.clone()]);
        recorder.inject_session(sidecar);

        assert!(recorder.destroy().await.is_empty());
        assert_eq!(recorder.state(), RecorderState::NotRecording);
        assert!(seg.exists());

        let left = store.load_record("hash7").unwrap();
        assert!(left.session_end_ms.is_some());
    }

    #[tokio::test]
    async fn failed_capture_exit_arms_a_retry() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(7, api, store, settings(dir.path(), "ffmpeg"));

        let seg = dir.path().join("7_part.flv");
        touch(&seg, 256);
        recorder.inject_session(record_sidecar(
            "hash7",
            7,
            "2024-05-01 20:00:00",
            vec![seg],
        ));

        let exit = CaptureEvent {
            generation: 0,
            kind: CaptureEventKind::Exited {
                out_time_secs: 12.0,
                reason: capture::ExitReason::Error("ffmpeg exited with signal".into()),
            },
        };
        let events = recorder.handle_capture_event(exit).await;
        assert_eq!(kinds(&events), vec!["rec-error"]);
        assert_eq!(recorder.state(), RecorderState::Recording);
        assert!(recorder.retry_at().is_some());
    }

    #[tokio::test]
    async fn stale_capture_events_are_ignored() {
        let dir = tempdir().unwrap();
        let api = Arc::new(ScriptedApi::new());
        let store = MetaStore::new(dir.path().to_path_buf());
        let (mut recorder, _rx) = Recorder::new(1, api, store, settings(dir.path(), "ffmpeg"));

        let stale = CaptureEvent {
            generation: 99,
            kind: CaptureEventKind::Progress {
                out_time_secs: 1.0,
                bytes: 100,
            },
        };
        assert!(recorder.handle_capture_event(stale).await.is_empty());
    }
}
