//! One ffmpeg capture subprocess plus its watchdogs.
//!
//! Each capture carries a generation number. The recorder bumps the
//! generation whenever it kills a capture, so exit events from a child
//! that was already abandoned are recognizable and dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use crate::api::{LIVE_REFERER, USER_AGENT};

/// Output file must exist this long after spawn or the capture is dead.
const EXISTENCE_TIMEOUT: Duration = Duration::from_secs(30);
/// File size sampling cadence; a sample with no growth kills the capture.
const STALL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum ExitReason {
    /// ffmpeg ended on its own (stream closed from the far side).
    Natural,
    /// A watchdog or an explicit kill tore the capture down.
    Killed(String),
    /// ffmpeg failed.
    Error(String),
}

#[derive(Debug)]
pub enum CaptureEventKind {
    /// Periodic liveness sample (stall watchdog cadence).
    Progress { out_time_secs: f64, bytes: u64 },
    Exited { out_time_secs: f64, reason: ExitReason },
}

#[derive(Debug)]
pub struct CaptureEvent {
    pub generation: u64,
    pub kind: CaptureEventKind,
}

pub struct CaptureConfig {
    pub ffmpeg_path: PathBuf,
    pub stream_url: String,
    pub output: PathBuf,
}

/// Handle to a running capture. Killing is fire-and-forget; the exit event
/// still arrives on the event channel with this capture's generation.
pub struct CaptureHandle {
    kill: Arc<Notify>,
}

impl CaptureHandle {
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

/// Spawn ffmpeg copying the stream into `output` and a supervision task
/// that feeds `events`. Returns an error only when the process cannot be
/// spawned at all.
pub fn spawn_capture(
    config: CaptureConfig,
    generation: u64,
    events: mpsc::UnboundedSender<CaptureEvent>,
) -> Result<CaptureHandle> {
    let headers = format!("User-Agent: {USER_AGENT}\r\nReferer: {LIVE_REFERER}\r\n");

    let mut child = Command::new(&config.ffmpeg_path)
        .arg("-headers")
        .arg(headers)
        .arg("-i")
        .arg(&config.stream_url)
        .arg("-c")
        .arg("copy")
        .arg("-progress")
        .arg("pipe:1")
        .arg("-nostats")
        .arg("-y")
        .arg(&config.output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn ffmpeg: {:?}", config.ffmpeg_path))?;

    debug!(generation, output = ?config.output, "capture spawned");

    // The progress stream is parsed on its own task; the supervisor only
    // ever reads the latest timestamp.
    let (time_tx, time_rx) = watch::channel(0.0_f64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(secs) = parse_out_time(&line) {
                    let _ = time_tx.send(secs);
                }
            }
        });
    }

    let kill = Arc::new(Notify::new());
    let handle = CaptureHandle {
        kill: Arc::clone(&kill),
    };

    let output = config.output.clone();
    tokio::spawn(async move {
        supervise(child, generation, output, time_rx, kill, events).await;
    });

    Ok(handle)
}

async fn supervise(
    mut child: tokio::process::Child,
    generation: u64,
    output: PathBuf,
    time_rx: watch::Receiver<f64>,
    kill: Arc<Notify>,
    events: mpsc::UnboundedSender<CaptureEvent>,
) {
    let existence = tokio::time::sleep(EXISTENCE_TIMEOUT);
    tokio::pin!(existence);
    let mut existence_armed = true;

    let mut stall = tokio::time::interval_at(
        tokio::time::Instant::now() + STALL_INTERVAL,
        STALL_INTERVAL,
    );
    let mut last_size: Option<u64> = None;
    let mut kill_reason: Option<String> = None;

    let reason = loop {
        tokio::select! {
            status = child.wait() => {
                break match (status, kill_reason.take()) {
                    (_, Some(reason)) => ExitReason::Killed(reason),
                    (Ok(status), None) if status.success() => ExitReason::Natural,
                    (Ok(status), None) => ExitReason::Error(format!("ffmpeg exited with {status}")),
                    (Err(err), None) => ExitReason::Error(format!("wait on ffmpeg failed: {err}")),
                };
            }
            _ = &mut existence, if existence_armed => {
                existence_armed = false;
                if !output.exists() {
                    warn!(generation, "output file never appeared, killing capture");
                    kill_reason = Some("output file never appeared".into());
                    let _ = child.start_kill();
                }
            }
            _ = stall.tick() => {
                let size = file_size(&output);
                if last_size == Some(size) {
                    warn!(generation, size, "output file stopped growing, killing capture");
                    kill_reason = Some("output file stopped growing".into());
                    let _ = child.start_kill();
                } else {
                    last_size = Some(size);
                    let _ = events.send(CaptureEvent {
                        generation,
                        kind: CaptureEventKind::Progress {
                            out_time_secs: *time_rx.borrow(),
                            bytes: size,
                        },
                    });
                }
            }
            _ = kill.notified() => {
                kill_reason = Some("killed by recorder".into());
                let _ = child.start_kill();
            }
        }
    };

    let _ = events.send(CaptureEvent {
        generation,
        kind: CaptureEventKind::Exited {
            out_time_secs: *time_rx.borrow(),
            reason,
        },
    });
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Parse one line of ffmpeg `-progress` output into seconds of captured
/// media, when the line carries a timestamp.
fn parse_out_time(line: &str) -> Option<f64> {
    if let Some(us) = line.strip_prefix("out_time_us=") {
        return us.trim().parse::<i64>().ok().map(|us| us as f64 / 1_000_000.0);
    }
    if let Some(clock) = line.strip_prefix("out_time=") {
        let mut parts = clock.trim().splitn(3, ':');
        let hours: f64 = parts.next()?.parse().ok()?;
        let minutes: f64 = parts.next()?.parse().ok()?;
        let seconds: f64 = parts.next()?.parse().ok()?;
        return Some(hours * 3600.0 + minutes * 60.0 + seconds);
    }
    None
}
