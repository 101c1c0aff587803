//! Sidecar persistence for in-flight recording and upload sessions.
//!
//! One JSON file per session, named from the session hash, written
//! atomically (temp file + rename) so a restarted process never reads a
//! half-written sidecar. This directory is the single cross-restart source
//! of truth; everything in-memory can be rebuilt from it.

pub mod scan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{RoomInfo, UploadOptions};

pub const SCHEMA_VERSION: u32 = 2;

/// Wall-clock bounds of one recording session (epoch milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStat {
    pub start_ms: i64,
    #[serde(default)]
    pub end_ms: Option<i64>,
}

/// Durable state of a recording in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSidecar {
    pub schema_version: u32,
    pub hash: String,
    pub room_id: u64,
    pub live_start_ms: i64,
    pub segment_files: Vec<PathBuf>,
    pub session_start_ms: i64,
    #[serde(default)]
    pub session_end_ms: Option<i64>,
    /// Media seconds captured by segments that already ended, as reported
    /// by ffmpeg. Survives restarts so the final duration covers adopted
    /// segments too.
    #[serde(default)]
    pub recorded_secs: f64,
    /// Room snapshot taken while live; feeds upload metadata after the
    /// broadcast has ended.
    pub room_info: RoomInfo,
}

/// Durable state of an upload that has not published yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSidecar {
    pub schema_version: u32,
    pub hash: String,
    pub room_id: u64,
    pub live_start_ms: i64,
    pub merged_file: PathBuf,
    pub stat: SessionStat,
    pub options: UploadOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Sidecar {
    #[serde(rename = "recording")]
    Recording(RecordSidecar),
    #[serde(rename = "upload")]
    Upload(UploadSidecar),
}

impl Sidecar {
    fn hash(&self) -> &str {
        match self {
            Sidecar::Recording(rec) => &rec.hash,
            Sidecar::Upload(up) => &up.hash,
        }
    }
}

/// Reads and writes sidecar files under one directory. Pure persistence;
/// no recording or upload logic.
#[derive(Clone)]
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.meta.json"))
    }

    pub fn upload_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.upload.meta.json"))
    }

    /// Persist a sidecar at its deterministic path.
    pub fn write(&self, sidecar: &Sidecar) -> Result<PathBuf> {
        let path = match sidecar {
            Sidecar::Recording(_) => self.record_path(sidecar.hash()),
            Sidecar::Upload(_) => self.upload_path(sidecar.hash()),
        };
        let bytes = serde_json::to_vec_pretty(sidecar).context("Failed to serialize sidecar")?;
        self.write_atomic(&path, &bytes)?;
        Ok(path)
    }

    /// Write-to-temp-then-rename so concurrent readers never observe a
    /// partial file.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("Sidecar path has no file name")?;
        let tmp_path = self.dir.join(format!(".{file_name}.tmp"));

        std::fs::write(&tmp_path, bytes)
            .with_context(|| format!("Failed to write sidecar temp file: {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move sidecar into place: {:?}", path))?;
        Ok(())
    }

    /// Load and validate a sidecar file. Invalid sidecars (bad type, schema
    /// mismatch without an upgrade path, vanished backing media) are
    /// deleted rather than silently ignored, and `None` is returned.
    ///
    /// Recording sidecars come back with their segment list filtered to
    /// files still on disk.
    pub fn verify(&self, path: &Path) -> Option<Sidecar> {
        let contents = std::fs::read_to_string(path).ok()?;

        let value: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(err) => {
                warn!("Sidecar {:?} is not valid JSON ({}), deleting", path, err);
                self.discard(path);
                return None;
            }
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("recording") | Some("upload") => {}
            other => {
                warn!("Sidecar {:?} has unsupported type {:?}, deleting", path, other);
                self.discard(path);
                return None;
            }
        }

        let version = value.get("schema_version").and_then(|v| v.as_u64());
        if version != Some(SCHEMA_VERSION as u64) {
            if let Some(upgraded) = upgrade(&value) {
                info!("Sidecar {:?} upgraded from schema {:?}", path, version);
                return self.check_media(path, upgraded);
            }
            warn!(
                "Sidecar {:?} has schema {:?} (supported: {}), no upgrade path, deleting",
                path, version, SCHEMA_VERSION
            );
            self.discard(path);
            return None;
        }

        let sidecar: Sidecar = match serde_json::from_value(value) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                warn!("Sidecar {:?} failed to decode ({}), deleting", path, err);
                self.discard(path);
                return None;
            }
        };

        self.check_media(path, sidecar)
    }

    /// Validate that referenced backing media still exists.
    fn check_media(&self, path: &Path, sidecar: Sidecar) -> Option<Sidecar> {
        match sidecar {
            Sidecar::Recording(mut rec) => {
                rec.segment_files.retain(|file| file.exists());
                if rec.segment_files.is_empty() {
                    warn!("Sidecar {:?} references no surviving segments, deleting", path);
                    self.discard(path);
                    return None;
                }
                Some(Sidecar::Recording(rec))
            }
            Sidecar::Upload(up) => {
                if !up.merged_file.exists() {
                    warn!(
                        "Sidecar {:?} references missing merged file {:?}, deleting",
                        path, up.merged_file
                    );
                    self.discard(path);
                    return None;
                }
                Some(Sidecar::Upload(up))
            }
        }
    }

    /// Load a validated recording sidecar by hash.
    pub fn load_record(&self, hash: &str) -> Option<RecordSidecar> {
        let path = self.record_path(hash);
        if !path.exists() {
            return None;
        }
        match self.verify(&path)? {
            Sidecar::Recording(rec) => Some(rec),
            Sidecar::Upload(_) => None,
        }
    }

    pub fn delete_record(&self, hash: &str) {
        self.discard(&self.record_path(hash));
    }

    pub fn delete_upload(&self, hash: &str) {
        self.discard(&self.upload_path(hash));
    }

    fn discard(&self, path: &Path) {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to delete sidecar {:?}: {}", path, err);
            }
        }
    }
}

/// Upgrade hook for older schema versions. No upgrades are defined for the
/// current schema; mismatched sidecars are discarded.
fn upgrade(_value: &serde_json::Value) -> Option<Sidecar> {
    None
}
