//! reqwest implementation of the live and upload API traits.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{
    ApiError, ChunkSpec, Credentials, LiveApi, PublishReceipt, RoomInfo, StorageTicket,
    UploadTransport, VideoMeta,
};

pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";
pub(crate) const LIVE_REFERER: &str = "https://live.bilibili.com/";
const MEMBER_ORIGIN: &str = "https://member.bilibili.com";
const MEMBER_REFERER: &str = "https://member.bilibili.com/";
const LIVE_API: &str = "https://api.live.bilibili.com";
const MEMBER_API: &str = "https://member.bilibili.com";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Standard platform response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, ApiError> {
        if self.code != 0 {
            return Err(ApiError::Platform {
                code: self.code,
                message: self.message,
            });
        }
        self.data.ok_or_else(|| ApiError::Other("response carried no data".into()))
    }
}

#[derive(Debug, Deserialize)]
struct PlayInfo {
    #[serde(default)]
    durl: Vec<PlayUrl>,
}

#[derive(Debug, Deserialize)]
struct PlayUrl {
    url: Option<String>,
}

/// The upos storage endpoints answer with `OK: 1` instead of an envelope.
#[derive(Debug, Deserialize)]
struct PreuploadResponse {
    #[serde(rename = "OK")]
    ok: i64,
    upos_uri: String,
    endpoint: String,
    auth: String,
    biz_id: i64,
    #[serde(default)]
    chunk_size: Option<u64>,
    #[serde(default)]
    threads: Option<usize>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UploadIdResponse {
    #[serde(rename = "OK")]
    ok: i64,
    #[serde(default)]
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(rename = "OK")]
    ok: i64,
}

#[derive(Debug, Deserialize)]
struct CoverData {
    url: String,
}

#[derive(Debug, Deserialize)]
struct PublishData {
    aid: u64,
    bvid: String,
}

/// HTTP client for both the live read APIs and the upload protocol.
#[derive(Clone)]
pub struct BiliClient {
    http: Client,
}

impl BiliClient {
    pub fn new() -> Result<Self, ApiError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl LiveApi for BiliClient {
    async fn room_info(&self, room_id: u64) -> Result<RoomInfo, ApiError> {
        let url = format!("{LIVE_API}/room/v1/Room/get_info?room_id={room_id}");
        let envelope: Envelope<RoomInfo> = self
            .http
            .get(url)
            .header(reqwest::header::REFERER, LIVE_REFERER)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        envelope.into_data()
    }

    async fn stream_urls(&self, room_id: u64) -> Result<Vec<String>, ApiError> {
        let url = format!("{LIVE_API}/room/v1/Room/playUrl?cid={room_id}&qn=0&platform=web");
        let envelope: Envelope<PlayInfo> = self
            .http
            .get(url)
            .header(reqwest::header::REFERER, LIVE_REFERER)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let urls: Vec<String> = envelope
            .into_data()?
            .durl
            .into_iter()
            .filter_map(|item| item.url)
            .collect();
        if urls.is_empty() {
            return Err(ApiError::Other("no stream urls in play info".into()));
        }
        Ok(urls)
    }

    async fn stream_reachable(&self, url: &str) -> bool {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::REFERER, LIVE_REFERER)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                // Require at least one body frame; some dead streams still
                // answer the request line.
                matches!(resp.bytes_stream().next().await, Some(Ok(_)))
            }
            _ => false,
        }
    }

    async fn image_base64(&self, url: &str) -> Result<String, ApiError> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(BASE64.encode(&bytes))
    }
}

#[async_trait]
impl UploadTransport for BiliClient {
    async fn register_storage(
        &self,
        credentials: &Credentials,
        file_name: &str,
        file_size: u64,
    ) -> Result<StorageTicket, ApiError> {
        let url = format!(
            "{MEMBER_API}/preupload?name={file_name}&upcdn=bldsa&zone=cs&r=upos\
             &profile=ugcfx%2Fbup&ssl=0&size={file_size}&version=2.14.0.0"
        );
        let resp: PreuploadResponse = self
            .http
            .get(url)
            .header(reqwest::header::REFERER, MEMBER_REFERER)
            .header(reqwest::header::COOKIE, &credentials.cookie)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.ok != 1 {
            return Err(ApiError::Platform {
                code: resp.ok,
                message: "storage registration refused".into(),
            });
        }

        let upos_path = resp.upos_uri.trim_start_matches("upos://");
        let file_key = Path::new(upos_path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.to_string())
            .ok_or_else(|| ApiError::Other(format!("malformed upos uri: {}", resp.upos_uri)))?;

        debug!(endpoint = %resp.endpoint, biz_id = resp.biz_id, "storage registered");

        Ok(StorageTicket {
            upload_url: format!("https:{}/{}", resp.endpoint, upos_path),
            auth: resp.auth,
            biz_id: resp.biz_id,
            file_key,
            chunk_size: resp.chunk_size,
            threads: resp.threads,
            chunk_timeout_secs: resp.timeout,
        })
    }

    async fn acquire_upload_id(
        &self,
        credentials: &Credentials,
        ticket: &StorageTicket,
        file_size: u64,
        chunk_size: u64,
    ) -> Result<String, ApiError> {
        let url = format!(
            "{}?uploads&output=json&profile=ugcfx%2Fbup&filesize={file_size}\
             &partsize={chunk_size}&biz_id={}",
            ticket.upload_url, ticket.biz_id
        );
        let resp: UploadIdResponse = self
            .http
            .post(url)
            .header(reqwest::header::ORIGIN, MEMBER_ORIGIN)
            .header(reqwest::header::REFERER, MEMBER_REFERER)
            .header("X-Upos-Auth", &ticket.auth)
            .header(reqwest::header::COOKIE, &credentials.cookie)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.ok != 1 {
            return Err(ApiError::Platform {
                code: resp.ok,
                message: "upload session refused".into(),
            });
        }
        Ok(resp.upload_id)
    }

    async fn upload_chunk(
        &self,
        ticket: &StorageTicket,
        upload_id: &str,
        spec: ChunkSpec,
        data: Vec<u8>,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}?partNumber={}&uploadId={upload_id}&chunk={}&chunks={}&size={}\
             &start={}&end={}&total={}",
            ticket.upload_url,
            spec.part_number,
            spec.part_number - 1,
            spec.total_chunks,
            spec.len(),
            spec.start,
            spec.end,
            spec.file_size,
        );

        let timeout = ticket
            .chunk_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CHUNK_TIMEOUT);

        self.http
            .put(url)
            .header(reqwest::header::ORIGIN, MEMBER_ORIGIN)
            .header(reqwest::header::REFERER, MEMBER_REFERER)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Upos-Auth", &ticket.auth)
            .timeout(timeout)
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn validate(
        &self,
        credentials: &Credentials,
        ticket: &StorageTicket,
        upload_id: &str,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}?output=json&name={}&profile=ugcfx%2Fbup&uploadId={upload_id}&biz_id={}",
            ticket.upload_url, ticket.file_key, ticket.biz_id
        );
        let resp: ValidateResponse = self
            .http
            .post(url)
            .header(reqwest::header::ORIGIN, MEMBER_ORIGIN)
            .header(reqwest::header::REFERER, MEMBER_REFERER)
            .header("X-Upos-Auth", &ticket.auth)
            .header(reqwest::header::COOKIE, &credentials.cookie)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resp.ok != 1 {
            return Err(ApiError::Platform {
                code: resp.ok,
                message: "chunk validation refused".into(),
            });
        }
        Ok(())
    }

    async fn upload_cover(
        &self,
        credentials: &Credentials,
        cover_base64: &str,
    ) -> Result<String, ApiError> {
        let csrf = credentials.csrf()?;
        let form = [
            ("cover", format!("data:image/jpeg;base64,{cover_base64}")),
            ("csrf", csrf),
        ];
        let envelope: Envelope<CoverData> = self
            .http
            .post(format!("{MEMBER_API}/x/vu/web/cover/up"))
            .header(reqwest::header::REFERER, MEMBER_REFERER)
            .header(reqwest::header::COOKIE, &credentials.cookie)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.into_data()?.url)
    }

    async fn publish(
        &self,
        credentials: &Credentials,
        video: &VideoMeta,
        cover_url: &str,
        file_key: &str,
    ) -> Result<PublishReceipt, ApiError> {
        let csrf = credentials.csrf()?;
        let body = serde_json::json!({
            "csrf": csrf,
            "cover": cover_url,
            "title": video.title,
            "copyright": 1,
            "tid": video.tid,
            "tag": video.tag,
            "desc_format_id": 0,
            "desc": video.description,
            "recreate": -1,
            "dynamic": "",
            "interactive": 0,
            "videos": [{
                "filename": file_key,
                "title": "",
                "desc": "",
                "cid": 0,
            }],
            "no_reprint": 1,
            "web_os": 1,
        });

        let envelope: Envelope<PublishData> = self
            .http
            .post(format!("{MEMBER_API}/x/vu/web/add/v3?csrf={csrf}"))
            .header(reqwest::header::REFERER, MEMBER_REFERER)
            .header(reqwest::header::COOKIE, &credentials.cookie)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let data = envelope.into_data()?;
        Ok(PublishReceipt {
            aid: data.aid,
            bvid: data.bvid,
        })
    }
}
