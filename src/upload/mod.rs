//! Multi-phase resumable upload driver.
//!
//! One task per merged recording. The six protocol phases run strictly in
//! order; within the chunk phase, chunks upload concurrently and each
//! chunk retries without bound until it lands. A task keeps a phase log
//! that collaborator layers can inspect while the upload is running.

pub mod options;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

use crate::api::{
    ApiError, ChunkSpec, CredentialsProvider, PublishReceipt, UploadOptions, UploadTransport,
};

/// Chunk size used when the storage ticket carries no hint.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// Concurrent chunk uploads when the ticket carries no hint.
pub const DEFAULT_CONCURRENCY: usize = 8;

const CHUNK_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RegisterStorage,
    AcquireUploadId,
    UploadChunks,
    Validate,
    Cover,
    Publish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Running,
    Done,
    Failed,
}

/// One entry in a task's phase log.
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub at_ms: i64,
    /// Human-readable progress or failure detail.
    pub detail: String,
}

pub struct UploadTask {
    pub id: u64,
    pub room_id: u64,
    pub options: UploadOptions,
    phases: Mutex<Vec<PhaseRecord>>,
}

impl UploadTask {
    pub fn phases(&self) -> Vec<PhaseRecord> {
        self.phases.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn reset(&self) {
        if let Ok(mut log) = self.phases.lock() {
            log.clear();
        }
    }

    fn begin(&self, phase: Phase) {
        if let Ok(mut log) = self.phases.lock() {
            log.push(PhaseRecord {
                phase,
                status: PhaseStatus::Running,
                at_ms: chrono::Utc::now().timestamp_millis(),
                detail: String::new(),
            });
        }
    }

    fn settle(&self, phase: Phase, status: PhaseStatus, detail: String) {
        if let Ok(mut log) = self.phases.lock() {
            if let Some(record) = log.iter_mut().rev().find(|r| r.phase == phase) {
                record.status = status;
                record.at_ms = chrono::Utc::now().timestamp_millis();
                record.detail = detail;
            }
        }
    }

    fn progress(&self, phase: Phase, detail: String) {
        if let Ok(mut log) = self.phases.lock() {
            if let Some(record) = log.iter_mut().rev().find(|r| r.phase == phase) {
                record.detail = detail;
            }
        }
    }
}

/// Creates and runs upload tasks. Task handles stay registered after
/// completion so their phase logs remain inspectable.
pub struct ChunkUploader {
    transport: Arc<dyn UploadTransport>,
    credentials: Arc<dyn CredentialsProvider>,
    tasks: Mutex<HashMap<u64, Arc<UploadTask>>>,
    next_id: AtomicU64,
}

impl ChunkUploader {
    pub fn new(transport: Arc<dyn UploadTransport>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            transport,
            credentials,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create_task(&self, room_id: u64, options: UploadOptions) -> Arc<UploadTask> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = Arc::new(UploadTask {
            id,
            room_id,
            options,
            phases: Mutex::new(Vec::new()),
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(id, Arc::clone(&task));
        }
        task
    }

    pub fn task(&self, id: u64) -> Option<Arc<UploadTask>> {
        self.tasks.lock().ok().and_then(|tasks| tasks.get(&id).cloned())
    }

    /// Run the task's phases from the top. Idempotent: a rerun resets the
    /// phase log and starts a fresh protocol session.
    pub async fn run(&self, task: &UploadTask) -> Result<PublishReceipt> {
        task.reset();

        let path = task.options.file_path.clone();
        let file_size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat upload file: {:?}", path))?
            .len();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("Upload file has no usable name")?
            .to_string();

        let credentials = self
            .credentials
            .credentials_for(task.room_id)
            .await
            .map_err(|err| anyhow!("no credentials for room {}: {err}", task.room_id))?;

        let ticket = run_phase(task, Phase::RegisterStorage, async {
            self.transport
                .register_storage(&credentials, &file_name, file_size)
                .await
        })
        .await?;

        let chunk_size = ticket.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let concurrency = ticket.threads.unwrap_or(DEFAULT_CONCURRENCY).max(1);
        let total_chunks = file_size.div_ceil(chunk_size).max(1);

        let upload_id = run_phase(task, Phase::AcquireUploadId, async {
            self.transport
                .acquire_upload_id(&credentials, &ticket, file_size, chunk_size)
                .await
        })
        .await?;

        info!(
            task_id = task.id,
            file_size, chunk_size, total_chunks, concurrency, "uploading chunks"
        );

        task.begin(Phase::UploadChunks);
        let completed = AtomicU64::new(0);
        futures::stream::iter(0..total_chunks)
            .map(|index| {
                let spec = chunk_spec(index, chunk_size, file_size, total_chunks);
                let path = &path;
                let ticket = &ticket;
                let upload_id = upload_id.as_str();
                let completed = &completed;
                async move {
                    loop {
                        match read_chunk(path, spec).await {
                            Ok(data) => {
                                match self
                                    .transport
                                    .upload_chunk(ticket, upload_id, spec, data)
                                    .await
                                {
                                    Ok(()) => break,
                                    Err(err) => warn!(
                                        task_id = task.id,
                                        part = spec.part_number,
                                        "chunk upload failed, retrying: {err}"
                                    ),
                                }
                            }
                            Err(err) => warn!(
                                task_id = task.id,
                                part = spec.part_number,
                                "chunk read failed, retrying: {err}"
                            ),
                        }
                        tokio::time::sleep(CHUNK_RETRY_DELAY).await;
                    }
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    task.progress(Phase::UploadChunks, format!("{done}/{total_chunks} chunks"));
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;
        task.settle(
            Phase::UploadChunks,
            PhaseStatus::Done,
            format!("{total_chunks}/{total_chunks} chunks"),
        );

        run_phase(task, Phase::Validate, async {
            self.transport
                .validate(&credentials, &ticket, &upload_id)
                .await
        })
        .await?;

        let cover_url = match &task.options.cover_base64 {
            Some(cover) => {
                run_phase(task, Phase::Cover, async {
                    self.transport.upload_cover(&credentials, cover).await
                })
                .await?
            }
            None => {
                task.begin(Phase::Cover);
                task.settle(Phase::Cover, PhaseStatus::Done, "no cover".into());
                String::new()
            }
        };

        let receipt = run_phase(task, Phase::Publish, async {
            self.transport
                .publish(&credentials, &task.options.video, &cover_url, &ticket.file_key)
                .await
        })
        .await?;

        info!(
            task_id = task.id,
            aid = receipt.aid,
            bvid = %receipt.bvid,
            "upload published"
        );
        Ok(receipt)
    }
}

async fn run_phase<T>(
    task: &UploadTask,
    phase: Phase,
    action: impl std::future::Future<Output = Result<T, ApiError>>,
) -> Result<T> {
    task.begin(phase);
    match action.await {
        Ok(value) => {
            task.settle(phase, PhaseStatus::Done, String::new());
            Ok(value)
        }
        Err(err) => {
            task.settle(phase, PhaseStatus::Failed, err.to_string());
            Err(anyhow!("{phase:?} phase failed: {err}"))
        }
    }
}

fn chunk_spec(index: u64, chunk_size: u64, file_size: u64, total_chunks: u64) -> ChunkSpec {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(file_size);
    ChunkSpec {
        part_number: index + 1,
        start,
        end,
        total_chunks,
        file_size,
    }
}

async fn read_chunk(path: &Path, spec: ChunkSpec) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(spec.start)).await?;
    let mut data = vec![0u8; spec.len() as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Credentials, StaticCredentials, StorageTicket, VideoMeta};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// Scripted transport: per-part failure budgets, plus switches to fail
    /// whole phases.
    #[derive(Default)]
    struct MockTransport {
        chunk_failures: Mutex<HashMap<u64, u32>>,
        chunks_seen: Mutex<Vec<ChunkSpec>>,
        fail_validate: bool,
        published: Mutex<Option<(String, String)>>,
    }

    #[async_trait]
    impl UploadTransport for MockTransport {
        async fn register_storage(
            &self,
            _credentials: &Credentials,
            file_name: &str,
            _file_size: u64,
        ) -> Result<StorageTicket, ApiError> {
            Ok(StorageTicket {
                upload_url: "https://upos.test/bucket/key.flv".into(),
                auth: "auth".into(),
                biz_id: 99,
                file_key: format!("key-{file_name}"),
                chunk_size: Some(5),
                threads: Some(2),
                chunk_timeout_secs: None,
            })
        }

        async fn acquire_upload_id(
            &self,
            _credentials: &Credentials,
            _ticket: &StorageTicket,
            _file_size: u64,
            _chunk_size: u64,
        ) -> Result<String, ApiError> {
            Ok("upload-id-1".into())
        }

        async fn upload_chunk(
            &self,
            _ticket: &StorageTicket,
            _upload_id: &str,
            spec: ChunkSpec,
            data: Vec<u8>,
        ) -> Result<(), ApiError> {
            assert_eq!(data.len() as u64, spec.len());
            let mut failures = self.chunk_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&spec.part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ApiError::Other("injected chunk failure".into()));
                }
            }
            drop(failures);
            self.chunks_seen.lock().unwrap().push(spec);
            Ok(())
        }

        async fn validate(
            &self,
            _credentials: &Credentials,
            _ticket: &StorageTicket,
            _upload_id: &str,
        ) -> Result<(), ApiError> {
            if self.fail_validate {
                return Err(ApiError::Platform {
                    code: -1,
                    message: "validate refused".into(),
                });
            }
            Ok(())
        }

        async fn upload_cover(
            &self,
            _credentials: &Credentials,
            _cover_base64: &str,
        ) -> Result<String, ApiError> {
            Ok("https://img.test/cover.jpg".into())
        }

        async fn publish(
            &self,
            _credentials: &Credentials,
            video: &VideoMeta,
            cover_url: &str,
            _file_key: &str,
        ) -> Result<PublishReceipt, ApiError> {
            *self.published.lock().unwrap() = Some((video.title.clone(), cover_url.to_string()));
            Ok(PublishReceipt {
                aid: 4242,
                bvid: "BV1test".into(),
            })
        }
    }

    fn options(path: PathBuf, cover: Option<String>) -> UploadOptions {
        UploadOptions {
            file_path: path,
            video: VideoMeta {
                title: "title".into(),
                description: "desc".into(),
                tag: "tag".into(),
                tid: 27,
            },
            cover_base64: cover,
        }
    }

    fn uploader(transport: Arc<MockTransport>) -> ChunkUploader {
        ChunkUploader::new(
            transport,
            Arc::new(StaticCredentials::new("bili_jct=tok".into())),
        )
    }

    #[tokio::test]
    async fn splits_file_into_expected_chunks() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("merged.flv");
        std::fs::write(&file, b"0123456789ab").unwrap(); // 12 bytes, chunk 5

        let transport = Arc::new(MockTransport::default());
        let uploader = uploader(Arc::clone(&transport));
        let task = uploader.create_task(1, options(file, None));

        let receipt = uploader.run(&task).await.unwrap();
        assert_eq!(receipt.aid, 4242);

        let mut seen = transport.chunks_seen.lock().unwrap().clone();
        seen.sort_by_key(|spec| spec.part_number);
        assert_eq!(seen.len(), 3);
        assert_eq!((seen[0].start, seen[0].end), (0, 5));
        assert_eq!((seen[1].start, seen[1].end), (5, 10));
        assert_eq!((seen[2].start, seen[2].end), (10, 12));
        assert!(seen.iter().all(|s| s.total_chunks == 3 && s.file_size == 12));
    }

    #[tokio::test]
    async fn chunk_failures_are_retried_until_they_land() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("merged.flv");
        std::fs::write(&file, b"0123456789ab").unwrap();

        let transport = Arc::new(MockTransport::default());
        transport.chunk_failures.lock().unwrap().insert(2, 2);
        let uploader = uploader(Arc::clone(&transport));
        let task = uploader.create_task(1, options(file, None));

        uploader.run(&task).await.unwrap();
        assert_eq!(transport.chunks_seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn phase_log_records_a_full_run() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("merged.flv");
        std::fs::write(&file, b"0123456789ab").unwrap();

        let transport = Arc::new(MockTransport::default());
        let uploader = uploader(transport);
        let task = uploader.create_task(1, options(file, Some("Y292ZXI=".into())));

        uploader.run(&task).await.unwrap();

        let phases = task.phases();
        let order: Vec<Phase> = phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            order,
            vec![
                Phase::RegisterStorage,
                Phase::AcquireUploadId,
                Phase::UploadChunks,
                Phase::Validate,
                Phase::Cover,
                Phase::Publish,
            ]
        );
        assert!(phases.iter().all(|p| p.status == PhaseStatus::Done));
        let chunks = phases.iter().find(|p| p.phase == Phase::UploadChunks).unwrap();
        assert_eq!(chunks.detail, "3/3 chunks");
    }

    #[tokio::test]
    async fn failing_phase_is_marked_and_aborts_the_run() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("merged.flv");
        std::fs::write(&file, b"0123456789ab").unwrap();

        let transport = Arc::new(MockTransport {
            fail_validate: true,
            ..Default::default()
        });
        let uploader = uploader(transport);
        let task = uploader.create_task(1, options(file, None));

        assert!(uploader.run(&task).await.is_err());

        let phases = task.phases();
        let validate = phases.iter().find(|p| p.phase == Phase::Validate).unwrap();
        assert_eq!(validate.status, PhaseStatus::Failed);
        assert!(phases.iter().all(|p| p.phase != Phase::Publish));
    }

    #[tokio::test]
    async fn cover_is_passed_through_to_publish() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("merged.flv");
        std::fs::write(&file, b"0123456789ab").unwrap();

        let transport = Arc::new(MockTransport::default());
        let uploader = uploader(Arc::clone(&transport));

        let with_cover = uploader.create_task(1, options(file.clone(), Some("Y292ZXI=".into())));
        uploader.run(&with_cover).await.unwrap();
        let (_, cover_url) = transport.published.lock().unwrap().clone().unwrap();
        assert_eq!(cover_url, "https://img.test/cover.jpg");

        let without_cover = uploader.create_task(1, options(file, None));
        uploader.run(&without_cover).await.unwrap();
        let (_, cover_url) = transport.published.lock().unwrap().clone().unwrap();
        assert_eq!(cover_url, "");
    }

    #[tokio::test]
    async fn task_ids_are_monotonic_and_resolvable() {
        let transport = Arc::new(MockTransport::default());
        let uploader = uploader(transport);

        let a = uploader.create_task(1, options(PathBuf::from("/tmp/a.flv"), None));
        let b = uploader.create_task(2, options(PathBuf::from("/tmp/b.flv"), None));
        assert!(b.id > a.id);
        assert_eq!(uploader.task(a.id).unwrap().room_id, 1);
        assert!(uploader.task(9999).is_none());
    }
}
