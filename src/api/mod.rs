//! Platform API surface: data model and the injected trait seams.
//!
//! Components never reach for a global client. Each one receives a
//! [`LiveApi`], [`UploadTransport`], or [`CredentialsProvider`] at
//! construction, which keeps the recording/upload logic testable against
//! scripted implementations.

mod client;

pub use client::BiliClient;
pub(crate) use client::{LIVE_REFERER, USER_AGENT};

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform rejected request (code {code}): {message}")]
    Platform { code: i64, message: String },
    #[error("{0}")]
    Other(String),
}

/// Live status of a room, decoded leniently from the platform code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Ended,
    Live,
    Slideshow,
}

impl RoomStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => RoomStatus::Live,
            2 => RoomStatus::Slideshow,
            _ => RoomStatus::Ended,
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoomStatus::Ended => "ended",
            RoomStatus::Live => "live",
            RoomStatus::Slideshow => "slideshow",
        };
        f.write_str(s)
    }
}

/// Room info snapshot as reported by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: u64,
    pub uid: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub live_status: i64,
    /// Platform-formatted live start ("YYYY-MM-DD HH:MM:SS", zeros when idle).
    #[serde(default)]
    pub live_time: String,
    #[serde(default)]
    pub user_cover: String,
    #[serde(default)]
    pub keyframe: String,
}

impl RoomInfo {
    pub fn status(&self) -> RoomStatus {
        RoomStatus::from_code(self.live_status)
    }

    /// Live start as epoch milliseconds. Deterministic for identical input
    /// strings, which is all the session hash needs; returns 0 for the
    /// platform's zeroed placeholder.
    pub fn live_start_ms(&self) -> i64 {
        NaiveDateTime::parse_from_str(&self.live_time, "%Y-%m-%d %H:%M:%S")
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0)
    }
}

/// Cookie-based upload credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub cookie: String,
}

impl Credentials {
    /// Extract the CSRF token (`bili_jct`) from the cookie string.
    pub fn csrf(&self) -> Result<String, ApiError> {
        self.cookie
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("bili_jct="))
            .map(|v| v.to_string())
            .next()
            .ok_or_else(|| ApiError::Other("bili_jct not found in cookie".into()))
    }
}

/// Yields per-upload credentials; implementations may select different
/// accounts per room.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials_for(&self, room_id: u64) -> Result<Credentials, ApiError>;
}

/// Provider backed by a single configured cookie.
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(cookie: String) -> Self {
        Self {
            credentials: Credentials { cookie },
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials_for(&self, _room_id: u64) -> Result<Credentials, ApiError> {
        if self.credentials.cookie.is_empty() {
            return Err(ApiError::Other("no upload cookie configured".into()));
        }
        Ok(self.credentials.clone())
    }
}

/// Read side of the live platform.
#[async_trait]
pub trait LiveApi: Send + Sync {
    async fn room_info(&self, room_id: u64) -> Result<RoomInfo, ApiError>;
    /// Candidate stream URLs in preference order.
    async fn stream_urls(&self, room_id: u64) -> Result<Vec<String>, ApiError>;
    /// Bounded reachability probe for one candidate URL.
    async fn stream_reachable(&self, url: &str) -> bool;
    /// Download an image and return it base64-encoded (cover handling).
    async fn image_base64(&self, url: &str) -> Result<String, ApiError>;
}

/// Storage endpoint returned by the register-storage phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTicket {
    pub upload_url: String,
    pub auth: String,
    pub biz_id: i64,
    /// Platform file key referenced at publish time.
    pub file_key: String,
    /// Platform-provided chunking hints; defaults apply when absent.
    pub chunk_size: Option<u64>,
    pub threads: Option<usize>,
    pub chunk_timeout_secs: Option<u64>,
}

/// One chunk's coordinates within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// 1-based part number.
    pub part_number: u64,
    pub start: u64,
    pub end: u64,
    pub total_chunks: u64,
    pub file_size: u64,
}

impl ChunkSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Video metadata submitted at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMeta {
    pub title: String,
    pub description: String,
    pub tag: String,
    pub tid: u32,
}

/// Everything needed to run one upload task; persisted inside the upload
/// sidecar so a crashed upload can be recreated verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    pub file_path: PathBuf,
    pub video: VideoMeta,
    pub cover_base64: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub aid: u64,
    pub bvid: String,
}

/// Write side: the platform's resumable upload protocol, one method per
/// phase.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn register_storage(
        &self,
        credentials: &Credentials,
        file_name: &str,
        file_size: u64,
    ) -> Result<StorageTicket, ApiError>;

    async fn acquire_upload_id(
        &self,
        credentials: &Credentials,
        ticket: &StorageTicket,
        file_size: u64,
        chunk_size: u64,
    ) -> Result<String, ApiError>;

    async fn upload_chunk(
        &self,
        ticket: &StorageTicket,
        upload_id: &str,
        spec: ChunkSpec,
        data: Vec<u8>,
    ) -> Result<(), ApiError>;

    async fn validate(
        &self,
        credentials: &Credentials,
        ticket: &StorageTicket,
        upload_id: &str,
    ) -> Result<(), ApiError>;

    /// Returns the hosted cover URL.
    async fn upload_cover(
        &self,
        credentials: &Credentials,
        cover_base64: &str,
    ) -> Result<String, ApiError>;

    async fn publish(
        &self,
        credentials: &Credentials,
        video: &VideoMeta,
        cover_url: &str,
        file_key: &str,
    ) -> Result<PublishReceipt, ApiError>;
}
