//! Retention cleanup for rolled log files.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Delete log files in `log_dir` whose modification time is older than
/// `retention_days`. Returns the removed paths.
///
/// Only files whose name starts with `foreman.log` are considered.
pub async fn prune_old_logs(log_dir: impl AsRef<Path>, retention_days: u32) -> Result<Vec<PathBuf>> {
    let log_dir = log_dir.as_ref();
    if !log_dir.exists() {
        return Ok(Vec::new());
    }

    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    let mut removed = Vec::new();
    let mut entries = tokio::fs::read_dir(log_dir)
        .await
        .context("failed to read log directory")?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("foreman.log"));
        if !is_log {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified: DateTime<Utc> = metadata.modified()?.into();
        if modified < cutoff {
            debug!(path = %path.display(), "removing expired log file");
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed.push(path);
        }
    }

    if !removed.is_empty() {
        info!(count = removed.len(), retention_days, "pruned old log files");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let removed = prune_old_logs(dir.path().join("nope"), 1).await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_files_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foreman.log.2026-01-01"), "{}").unwrap();
        std::fs::write(dir.path().join("other.txt"), "x").unwrap();

        let removed = prune_old_logs(dir.path(), 30).await.unwrap();
        assert!(removed.is_empty());
        assert!(dir.path().join("foreman.log.2026-01-01").exists());
    }

    #[tokio::test]
    async fn test_zero_retention_removes_only_log_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foreman.log.old"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let removed = prune_old_logs(dir.path(), 0).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(dir.path().join("notes.txt").exists());
    }
}
