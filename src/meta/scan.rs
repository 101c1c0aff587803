//! Save-directory inventory used by the startup recovery pass.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use super::{MetaStore, RecordSidecar, Sidecar, UploadSidecar};

/// Everything found in the save directory, classified.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Validated recording sidecars (interrupted sessions).
    pub recordings: Vec<RecordSidecar>,
    /// Validated upload sidecars (interrupted uploads).
    pub uploads: Vec<UploadSidecar>,
    /// Media files referenced by some sidecar.
    pub media_files: Vec<PathBuf>,
    /// Subdirectories; nothing in the agent creates these.
    pub unknown_dirs: Vec<PathBuf>,
    /// Files referenced by no sidecar and recognized as no sidecar.
    pub unknown_files: Vec<PathBuf>,
}

/// Walk the sidecar directory once and classify every entry. Invalid
/// sidecars are deleted as a side effect of verification.
pub fn scan(store: &MetaStore) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut candidates: Vec<PathBuf> = Vec::new();

    let entries = std::fs::read_dir(store.dir())
        .with_context(|| format!("Failed to read save directory: {:?}", store.dir()))?;

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            report.unknown_dirs.push(path);
            continue;
        }

        let is_sidecar = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(".meta.json"))
            .unwrap_or(false);

        if !is_sidecar {
            candidates.push(path);
            continue;
        }

        match store.verify(&path) {
            Some(Sidecar::Recording(rec)) => {
                report.media_files.extend(rec.segment_files.iter().cloned());
                report.recordings.push(rec);
            }
            Some(Sidecar::Upload(up)) => {
                report.media_files.push(up.merged_file.clone());
                report.uploads.push(up);
            }
            None => {
                debug!("Discarded invalid sidecar {:?}", path);
            }
        }
    }

    let referenced: HashSet<&PathBuf> = report.media_files.iter().collect();
    report.unknown_files = candidates
        .into_iter()
        .filter(|path| !referenced.contains(path))
        .collect();

    Ok(report)
}
