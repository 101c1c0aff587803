//! Lossless merge of capture segments into one file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

/// Drop segments that no longer exist and delete zero-length leftovers
/// (captures that died before writing a single frame).
pub fn clean_segments(segments: Vec<PathBuf>) -> Vec<PathBuf> {
    segments
        .into_iter()
        .filter(|path| {
            let Ok(meta) = std::fs::metadata(path) else {
                warn!("Segment {:?} is missing, dropping from merge", path);
                return false;
            };
            if meta.len() == 0 {
                warn!("Segment {:?} is empty, deleting", path);
                let _ = std::fs::remove_file(path);
                return false;
            }
            true
        })
        .collect()
}

/// Concat demuxer playlist. Single quotes in paths are closed, escaped,
/// and reopened per ffmpeg's quoting rules.
fn concat_list(segments: &[PathBuf]) -> String {
    let mut list = String::new();
    for segment in segments {
        let escaped = segment.display().to_string().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}

/// Merge the cleaned segments into `output`. One segment is renamed into
/// place (copied when sources are kept); several are concatenated with the
/// stream-copy concat demuxer. Source segments are deleted on success
/// unless `keep_sources` is set.
pub async fn merge_segments(
    ffmpeg_path: &Path,
    segments: Vec<PathBuf>,
    output: &Path,
    keep_sources: bool,
) -> Result<PathBuf> {
    let segments = clean_segments(segments);

    match segments.len() {
        0 => bail!("no usable segments to merge"),
        1 => {
            let only = &segments[0];
            if keep_sources {
                std::fs::copy(only, output)
                    .with_context(|| format!("Failed to copy segment to {:?}", output))?;
            } else {
                std::fs::rename(only, output)
                    .with_context(|| format!("Failed to move segment to {:?}", output))?;
            }
            info!("Single segment promoted to {:?}", output);
            Ok(output.to_path_buf())
        }
        count => {
            let list_path = output.with_extension("list.txt");
            std::fs::write(&list_path, concat_list(&segments))
                .with_context(|| format!("Failed to write concat list: {:?}", list_path))?;

            let status = Command::new(ffmpeg_path)
                .arg("-f")
                .arg("concat")
                .arg("-safe")
                .arg("0")
                .arg("-i")
                .arg(&list_path)
                .arg("-c")
                .arg("copy")
                .arg("-y")
                .arg(output)
                .status()
                .await
                .with_context(|| format!("Failed to run ffmpeg: {:?}", ffmpeg_path))?;

            let _ = std::fs::remove_file(&list_path);

            if !status.success() {
                bail!("ffmpeg concat of {count} segments failed with {status}");
            }
            if !output.exists() {
                bail!("ffmpeg reported success but {:?} is missing", output);
            }

            if !keep_sources {
                for segment in &segments {
                    if let Err(err) = std::fs::remove_file(segment) {
                        warn!("Failed to delete merged segment {:?}: {}", segment, err);
                    }
                }
            }

            info!("Merged {count} segments into {:?}", output);
            Ok(output.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::testing::touch;
    use tempfile::tempdir;

    #[test]
    fn clean_drops_missing_and_deletes_empty() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("a.flv");
        touch(&good, 100);
        let empty = dir.path().join("b.flv");
        touch(&empty, 0);
        let missing = dir.path().join("c.flv");

        let cleaned = clean_segments(vec![good.clone(), empty.clone(), missing]);
        assert_eq!(cleaned, vec![good]);
        assert!(!empty.exists());
    }

    #[test]
    fn concat_list_quotes_paths() {
        let list = concat_list(&[PathBuf::from("/tmp/a.flv"), PathBuf::from("/tmp/it's.flv")]);
        assert_eq!(list, "file '/tmp/a.flv'\nfile '/tmp/it'\\''s.flv'\n");
    }

    #[tokio::test]
    async fn single_segment_is_renamed_into_place() {
        let dir = tempdir().unwrap();
        let seg = dir.path().join("1_part.flv");
        touch(&seg, 100);
        let out = dir.path().join("1_merged.flv");

        let merged = merge_segments(Path::new("ffmpeg"), vec![seg.clone()], &out, false)
            .await
            .unwrap();
        assert_eq!(merged, out);
        assert!(out.exists());
        assert!(!seg.exists());
    }

    #[tokio::test]
    async fn single_segment_is_copied_when_sources_are_kept() {
        let dir = tempdir().unwrap();
        let seg = dir.path().join("1_part.flv");
        touch(&seg, 100);
        let out = dir.path().join("1_merged.flv");

        merge_segments(Path::new("ffmpeg"), vec![seg.clone()], &out, true)
            .await
            .unwrap();
        assert!(out.exists());
        assert!(seg.exists());
    }

    #[tokio::test]
    async fn merging_nothing_is_an_error() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("merged.flv");
        let result = merge_segments(Path::new("ffmpeg"), vec![], &out, false).await;
        assert!(result.is_err());
    }
}
