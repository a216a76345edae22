//! Age-based lifecycle over persisted records.
//!
//! Records untouched for `retention_days` are handled according to the
//! strategy table keyed on their last status: live records are skipped,
//! finished ones archived into `archives/YYYY/MM/`, and the rest deleted.
//! Archival optionally compresses with zstd.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use conductor_core::{CleanupStrategy, ConductorError, RetentionConfig, Result, TaskStatus};

use crate::record::TaskState;
use crate::store::StateStore;

/// Totals for the archive tree plus the effective policy.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub archive_path: PathBuf,
    pub total_archives: usize,
    pub total_bytes: u64,
    pub retention_days: u32,
    pub compression_enabled: bool,
}

impl StateStore {
    /// Move one record into the dated archive tree, then remove the source.
    ///
    /// Destination is `<archive_dir>/YYYY/MM/<task_id>.json` (`.json.zst`
    /// when compression is enabled); year and month come from the archival
    /// instant, mirroring when the record left the active set.
    pub async fn archive(&self, task_id: &str, config: &RetentionConfig) -> Result<PathBuf> {
        let state = self
            .load(task_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(task_id.to_string()))?;

        let now = self.clock.now();
        let dest = self.archive_record(&state, config, now)?;

        let source = self.record_path(task_id);
        std::fs::remove_file(&source)
            .map_err(|e| ConductorError::StateIo(format!("remove {}: {}", source.display(), e)))?;

        info!(task_id, dest = %dest.display(), "state record archived");
        Ok(dest)
    }

    fn archive_record(
        &self,
        state: &TaskState,
        config: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let subdir = config
            .archive_dir
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()));
        std::fs::create_dir_all(&subdir).map_err(|e| {
            ConductorError::StateIo(format!("create archive dir {}: {}", subdir.display(), e))
        })?;

        let json = serde_json::to_vec_pretty(state)?;
        let dest = if config.compress {
            let dest = subdir.join(format!("{}.json.zst", state.task_id));
            let compressed = zstd::encode_all(json.as_slice(), 0)
                .map_err(|e| ConductorError::StateIo(format!("zstd encode: {}", e)))?;
            std::fs::write(&dest, compressed)
                .map_err(|e| ConductorError::StateIo(format!("write {}: {}", dest.display(), e)))?;
            dest
        } else {
            let dest = subdir.join(format!("{}.json", state.task_id));
            std::fs::write(&dest, &json)
                .map_err(|e| ConductorError::StateIo(format!("write {}: {}", dest.display(), e)))?;
            dest
        };
        Ok(dest)
    }

    /// Sweep expired records according to the strategy table.
    ///
    /// Returns how many records were archived or deleted. Skipped records
    /// and records that fail to process do not count; failures are logged
    /// and the sweep keeps going.
    pub async fn prune(&self, now: DateTime<Utc>, config: &RetentionConfig) -> Result<usize> {
        let cutoff = now - Duration::days(i64::from(config.retention_days));
        let mut processed = 0usize;

        for summary in self.list().await? {
            if summary.updated_at >= cutoff {
                continue;
            }
            let strategy = strategy_for(summary.status, config);
            match strategy {
                CleanupStrategy::Skip => {
                    debug!(task_id = %summary.task_id, status = %summary.status, "retention: skipping live record");
                }
                CleanupStrategy::Archive => match self.archive(&summary.task_id, config).await {
                    Ok(_) => processed += 1,
                    Err(e) => {
                        warn!(task_id = %summary.task_id, error = %e, "retention: archive failed");
                    }
                },
                CleanupStrategy::Delete => match self.delete(&summary.task_id).await {
                    Ok(()) => {
                        info!(task_id = %summary.task_id, "retention: expired record deleted");
                        processed += 1;
                    }
                    Err(e) => {
                        warn!(task_id = %summary.task_id, error = %e, "retention: delete failed");
                    }
                },
            }
        }

        if processed > 0 {
            info!(processed, "retention sweep finished");
        }
        Ok(processed)
    }

    /// Totals for the archive tree.
    pub fn archive_info(&self, config: &RetentionConfig) -> ArchiveInfo {
        let mut total_archives = 0usize;
        let mut total_bytes = 0u64;
        if config.archive_dir.exists() {
            for entry in WalkDir::new(&config.archive_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                total_archives += 1;
                total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        ArchiveInfo {
            archive_path: config.archive_dir.clone(),
            total_archives,
            total_bytes,
            retention_days: config.retention_days,
            compression_enabled: config.compress,
        }
    }
}

fn strategy_for(status: TaskStatus, config: &RetentionConfig) -> CleanupStrategy {
    let table = &config.cleanup_strategy;
    match status {
        TaskStatus::Running | TaskStatus::Reviewing => table.running_tasks,
        TaskStatus::Completed | TaskStatus::Approved => table.completed_tasks,
        TaskStatus::Failed | TaskStatus::Rejected => table.failed_tasks,
        _ => table.expired_tasks,
    }
}

/// Read an archived record back, transparently decompressing `.json.zst`.
pub fn read_archived(path: &Path) -> Result<TaskState> {
    let bytes = std::fs::read(path)
        .map_err(|e| ConductorError::StateIo(format!("read {}: {}", path.display(), e)))?;
    let json = if path.extension().and_then(|e| e.to_str()) == Some("zst") {
        zstd::decode_all(bytes.as_slice())
            .map_err(|e| ConductorError::StateIo(format!("zstd decode: {}", e)))?
    } else {
        bytes
    };
    Ok(serde_json::from_slice(&json)?)
}

// ── Tests ───────────────────────────────────────────────────────────
