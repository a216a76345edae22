//! File-backed state store: one JSON record per task id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_core::{ConductorError, Result, SharedClock, TaskStatus};

use crate::record::{HistoryEntry, StateDelta, TaskState, TaskStateSummary};

/// Durable per-task records under a single directory.
///
/// Writes go to `<id>.json.tmp` and are renamed into place, so readers never
/// observe a torn record. A per-record async mutex serializes concurrent
/// read-modify-write cycles for the same task.
pub struct StateStore {
    pub(crate) dir: PathBuf,
    pub(crate) clock: SharedClock,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StateStore {
    /// Open (and create if needed) the state directory.
    pub fn new(dir: &Path, clock: SharedClock) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            ConductorError::StateIo(format!("failed to create state dir {}: {}", dir.display(), e))
        })?;
        info!(path = %dir.display(), "state store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn record_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── CRUD ────────────────────────────────────────────────────────

    /// Create a fresh record. Errors if one already exists.
    pub async fn create(
        &self,
        task_id: &str,
        task_type: &str,
        initial: Option<StateDelta>,
    ) -> Result<PathBuf> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(task_id);
        if path.exists() {
            return Err(ConductorError::Duplicate(format!(
                "state record already exists: {}",
                task_id
            )));
        }

        let now = self.clock.now();
        let mut state = TaskState::new(task_id, task_type, now);
        if let Some(delta) = initial {
            delta.apply(&mut state, now);
        }
        self.write_record(&state)?;
        info!(task_id, path = %path.display(), "state record created");
        Ok(path)
    }

    /// Load a record, or create it if absent.
    pub async fn ensure(&self, task_id: &str, task_type: &str) -> Result<TaskState> {
        if let Some(state) = self.load(task_id).await? {
            return Ok(state);
        }
        match self.create(task_id, task_type, None).await {
            Ok(_) => {}
            // Raced with another creator; the record exists now.
            Err(ConductorError::Duplicate(_)) => {}
            Err(e) => return Err(e),
        }
        self.load(task_id)
            .await?
            .ok_or_else(|| ConductorError::StateIo(format!("record vanished after create: {}", task_id)))
    }

    /// Load a record; `None` if it does not exist.
    pub async fn load(&self, task_id: &str) -> Result<Option<TaskState>> {
        let path = self.record_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ConductorError::StateIo(format!("read {}: {}", path.display(), e)))?;
        let state: TaskState = serde_json::from_str(&raw)
            .map_err(|e| ConductorError::StateIo(format!("parse {}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    /// Apply a delta under the record lock, optionally appending a history
    /// entry describing the transition.
    pub async fn update(
        &self,
        task_id: &str,
        delta: StateDelta,
        append_history: bool,
    ) -> Result<TaskState> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let mut state = self
            .load(task_id)
            .await?
            .ok_or_else(|| ConductorError::NotFound(task_id.to_string()))?;

        let now = self.clock.now();
        let previous_status = state.status;
        let changed = delta.apply(&mut state, now);

        if append_history {
            state.history.push(HistoryEntry {
                id: Uuid::new_v4(),
                ts: now,
                previous_status,
                delta: changed,
            });
        }

        self.write_record(&state)?;
        debug!(task_id, status = %state.status, "state updated");
        Ok(state)
    }

    /// Remove a record. Idempotent.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(task_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| ConductorError::StateIo(format!("delete {}: {}", path.display(), e)))?;
            info!(task_id, "state record deleted");
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Summaries of every record, newest update first. Unreadable files are
    /// skipped with a warning.
    pub async fn list(&self) -> Result<Vec<TaskStateSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .map_err(|e| ConductorError::StateIo(format!("read dir {}: {}", self.dir.display(), e)))?
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "unreadable state dir entry, skipping");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<TaskState>(&raw).map_err(|e| e.to_string()))
            {
                Ok(state) => summaries.push(state.summary()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable state record, skipping");
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Ids of records whose last status was running or reviewing.
    pub async fn running_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| matches!(s.status, TaskStatus::Running | TaskStatus::Reviewing))
            .map(|s| s.task_id)
            .collect())
    }

    // ── Internal ────────────────────────────────────────────────────

    /// Atomic write: serialize to `<id>.json.tmp`, then rename into place.
    pub(crate) fn write_record(&self, state: &TaskState) -> Result<()> {
        let path = self.record_path(&state.task_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, json)
            .map_err(|e| ConductorError::StateIo(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| ConductorError::StateIo(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::SystemClock;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path(), Arc::new(SystemClock)).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn create_and_load_roundtrip() {
        let (_tmp, store) = setup();
        let path = store.create("t1", "shell", None).await.unwrap();
        assert!(path.exists());

        let state = store.load("t1").await.unwrap().unwrap();
        assert_eq!(state.task_id, "t1");
        assert_eq!(state.task_type, "shell");
        assert_eq!(state.status, TaskStatus::Pending);
        assert_eq!(state.attempts, 0);
    }

    #[tokio::test]
    async fn create_rejects_existing_record() {
        let (_tmp, store) = setup();
        store.create("t1", "shell", None).await.unwrap();
        let err = store.create("t1", "shell", None).await.unwrap_err();
        assert!(matches!(err, ConductorError::Duplicate(_)));
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let (_tmp, store) = setup();
        assert!(store.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_appends_history_with_previous_status() {
        let (_tmp, store) = setup();
        store.create("t1", "shell", None).await.unwrap();

        let state = store
            .update(
                "t1",
                StateDelta::new().status(TaskStatus::Running).progress(0.0),
                true,
            )
            .await
            .unwrap();
        assert_eq!(state.status, TaskStatus::Running);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].previous_status, TaskStatus::Pending);

        let state = store
            .update("t1", StateDelta::new().status(TaskStatus::Completed), true)
            .await
            .unwrap();
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].previous_status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn update_without_history_leaves_history_untouched() {
        let (_tmp, store) = setup();
        store.create("t1", "shell", None).await.unwrap();
        let state = store
            .update("t1", StateDelta::new().progress(0.5), false)
            .await
            .unwrap();
        assert!(state.history.is_empty());
        assert_eq!(state.progress, 0.5);
    }

    #[tokio::test]
    async fn update_missing_record_errors() {
        let (_tmp, store) = setup();
        let err = store
            .update("ghost", StateDelta::new().progress(0.1), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NotFound(_)));
    }

    #[tokio::test]
    async fn persisted_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = StateStore::new(tmp.path(), Arc::new(SystemClock)).unwrap();
            store.create("t1", "shell", None).await.unwrap();
            store
                .update(
                    "t1",
                    StateDelta::new()
                        .status(TaskStatus::Failed)
                        .error("network unreachable"),
                    true,
                )
                .await
                .unwrap();
        }

        // "restart": a fresh store over the same directory
        let store = StateStore::new(tmp.path(), Arc::new(SystemClock)).unwrap();
        let state = store.load("t1").await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.error_count, 1);
        assert_eq!(
            state.last_error_message.as_deref(),
            Some("network unreachable")
        );
        assert_eq!(state.history.len(), 1);
    }

    #[tokio::test]
    async fn list_sorts_by_updated_at_desc() {
        let (_tmp, store) = setup();
        store.create("old", "shell", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.create("new", "shell", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store
            .update("new", StateDelta::new().progress(0.1), false)
            .await
            .unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].task_id, "new");
    }

    #[tokio::test]
    async fn running_ids_matches_running_and_reviewing() {
        let (_tmp, store) = setup();
        store.create("a", "shell", None).await.unwrap();
        store.create("b", "shell", None).await.unwrap();
        store.create("c", "shell", None).await.unwrap();
        store
            .update("a", StateDelta::new().status(TaskStatus::Running), true)
            .await
            .unwrap();
        store
            .update("b", StateDelta::new().status(TaskStatus::Reviewing), true)
            .await
            .unwrap();

        let mut running = store.running_ids().await.unwrap();
        running.sort();
        assert_eq!(running, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_tmp, store) = setup();
        store.create("t1", "shell", None).await.unwrap();
        store.delete("t1").await.unwrap();
        assert!(store.load("t1").await.unwrap().is_none());
        store.delete("t1").await.unwrap();
    }

    #[tokio::test]
    async fn no_tmp_files_left_behind() {
        let (tmp, store) = setup();
        store.create("t1", "shell", None).await.unwrap();
        store
            .update("t1", StateDelta::new().progress(0.9), false)
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn concurrent_updates_serialize_per_record() {
        let (_tmp, store) = setup();
        let store = Arc::new(store);
        store.create("t1", "shell", None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("t1", StateDelta::new().increment_attempts(), false)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let state = store.load("t1").await.unwrap().unwrap();
        assert_eq!(state.attempts, 20, "no update may be lost");
    }
}
