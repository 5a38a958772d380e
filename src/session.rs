//! Session persistence.
//!
//! The backend never echoes VM selections or analysis flags back, so the
//! local task collection is saved between runs as a JSON snapshot. Writes
//! go to a temp file that is renamed into place while holding an advisory
//! lock on `<snapshot>.lock`, so concurrent CLI invocations never observe a
//! half-written file.
//!
//! An invocation saves by merging into whatever is on disk at that moment,
//! relative to the [`Baseline`] it restored: tasks another invocation added
//! meanwhile are kept, tasks this invocation removed stay removed.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::TaskStore;
use crate::task::{LocalId, Task};

pub const SESSION_SCHEMA_VERSION: &str = "fleetjobs.session.v1";

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub schema_version: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Task ids a session contained when it was restored.
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    ids: HashSet<LocalId>,
}

impl Baseline {
    fn of(tasks: &[Task]) -> Self {
        Self {
            ids: tasks.iter().map(|task| task.id.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &LocalId) -> bool {
        self.ids.contains(id)
    }
}

/// Snapshot file for one task collection.
#[derive(Debug, Clone)]
pub struct Session {
    path: PathBuf,
    lock_timeout: Duration,
}

impl Session {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.lock", self.path.display()))
    }

    /// Saved tasks, most recent first. A missing file is an empty session.
    pub fn load(&self) -> Result<Vec<Task>> {
        let _lock = SessionLock::acquire(&self.lock_path(), self.lock_timeout)?;
        self.read()
    }

    fn read(&self) -> Result<Vec<Task>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Io(err)),
        };
        let file: SessionFile = serde_json::from_str(&content)?;
        if file.schema_version != SESSION_SCHEMA_VERSION {
            return Err(Error::InvalidConfig(format!(
                "session file {} has unsupported schema '{}'",
                self.path.display(),
                file.schema_version
            )));
        }
        debug!(path = %self.path.display(), tasks = file.tasks.len(), "loaded session");
        Ok(file.tasks)
    }

    /// Overwrite the snapshot with exactly `tasks`.
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        let _lock = SessionLock::acquire(&self.lock_path(), self.lock_timeout)?;
        self.write(tasks)
    }

    fn write(&self, tasks: &[Task]) -> Result<()> {
        let file = SessionFile {
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            saved_at: Utc::now(),
            tasks: tasks.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &data)?;
        debug!(path = %self.path.display(), tasks = tasks.len(), "saved session");
        Ok(())
    }

    /// Load the saved tasks into `store`, replacing its collection.
    pub fn restore_into(&self, store: &TaskStore) -> Result<Baseline> {
        let tasks = self.load()?;
        let baseline = Baseline::of(&tasks);
        store.restore(tasks)?;
        Ok(baseline)
    }

    /// Save the collection of `store`, merged with the snapshot currently on
    /// disk relative to `baseline`. Returns the number of tasks written.
    pub fn save_from(&self, store: &TaskStore, baseline: &Baseline) -> Result<usize> {
        let _lock = SessionLock::acquire(&self.lock_path(), self.lock_timeout)?;
        let on_disk = self.read()?;
        let merged = merge_saved(store.list(), on_disk, baseline);
        self.write(&merged)?;
        Ok(merged.len())
    }

    /// Remove the snapshot file.
    pub fn clear(&self) -> Result<()> {
        let _lock = SessionLock::acquire(&self.lock_path(), self.lock_timeout)?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

/// `ours` plus every task on disk that was added after `baseline` was taken
/// and is not already known here, by id or by backend job. Most recent
/// first.
fn merge_saved(ours: Vec<Task>, on_disk: Vec<Task>, baseline: &Baseline) -> Vec<Task> {
    let ids: HashSet<LocalId> = ours.iter().map(|task| task.id.clone()).collect();
    let bound: HashSet<_> = ours.iter().filter_map(|task| task.backend_id).collect();

    let mut merged = ours;
    for task in on_disk {
        if baseline.contains(&task.id) || ids.contains(&task.id) {
            continue;
        }
        if task.backend_id.is_some_and(|backend| bound.contains(&backend)) {
            debug!(task = %task.id, "saved task duplicates a known job; dropping");
            continue;
        }
        merged.push(task);
    }
    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    merged
}

/// Exclusive advisory lock, released on drop.
struct SessionLock {
    file: File,
}

impl SessionLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    let mut temp = File::create(&temp_path)?;
    temp.write_all(data)?;
    temp.sync_all()?;
    drop(temp);
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::store::StoreSettings;
    use crate::task::{BackendId, ConnectionRef, CreateTaskParams, TaskKind};
    use std::sync::Arc;

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryGateway::new()), StoreSettings::default())
    }

    #[test]
    fn missing_file_is_an_empty_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::new(dir.path().join("session.json"));
        assert!(session.load().expect("load").is_empty());
    }

    #[test]
    fn local_fields_and_bindings_survive_a_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::new(dir.path().join("nested/session.json"));

        let first = store();
        let task = first.create_optimistic(
            CreateTaskParams::new(TaskKind::Collection, ConnectionRef::new(7, "dc1"))
                .with_selection(["vm-1", "vm-2"]),
        );
        first.bind_backend_id(&task.id, BackendId(12)).expect("bind");
        session.save_from(&first, &Baseline::default()).expect("save");

        let second = store();
        assert_eq!(session.restore_into(&second).expect("restore").len(), 1);
        let restored = second.find_by_backend_id(BackendId(12)).expect("bound");
        assert_eq!(restored.id, task.id);
        assert_eq!(restored.selection, vec!["vm-1".to_string(), "vm-2".to_string()]);
    }

    fn collection() -> CreateTaskParams {
        CreateTaskParams::new(TaskKind::Collection, ConnectionRef::new(7, "dc1"))
    }

    #[test]
    fn interleaved_invocations_keep_each_others_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::new(dir.path().join("session.json"));

        let (first, second) = (store(), store());
        let first_base = session.restore_into(&first).expect("restore");
        let second_base = session.restore_into(&second).expect("restore");

        let a = first.create_optimistic(collection());
        let b = second.create_optimistic(collection());
        session.save_from(&first, &first_base).expect("save");
        assert_eq!(session.save_from(&second, &second_base).expect("save"), 2);

        let ids: Vec<_> = session.load().expect("load").into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn removed_tasks_stay_removed_after_a_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::new(dir.path().join("session.json"));
        let seed = store();
        let kept = seed.create_optimistic(collection());
        let dropped = seed.create_optimistic(collection());
        session.save(&seed.list()).expect("seed");

        let current = store();
        let base = session.restore_into(&current).expect("restore");
        assert!(current.discard_optimistic(&dropped.id).is_some());
        session.save_from(&current, &base).expect("save");

        let ids: Vec<_> = session.load().expect("load").into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![kept.id]);
    }

    #[test]
    fn merge_skips_saved_tasks_for_jobs_already_known() {
        let ours = store();
        let mine = ours.create_optimistic(collection());
        ours.bind_backend_id(&mine.id, BackendId(5)).expect("bind");

        let theirs = store();
        let other = theirs.create_optimistic(collection());
        theirs.bind_backend_id(&other.id, BackendId(5)).expect("bind");

        let merged = merge_saved(ours.list(), theirs.list(), &Baseline::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, mine.id);
    }

    #[test]
    fn foreign_schema_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        fs::write(
            &path,
            r#"{"schema_version":"other.v9","saved_at":"2024-01-01T00:00:00Z","tasks":[]}"#,
        )
        .expect("write");
        assert!(matches!(
            Session::new(&path).load(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::new(dir.path().join("session.json"))
            .with_lock_timeout(Duration::from_millis(50));
        let _held =
            SessionLock::acquire(&session.lock_path(), Duration::from_secs(1)).expect("lock");
        assert!(matches!(session.save(&[]), Err(Error::LockFailed(_))));
    }

    #[test]
    fn clear_removes_the_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Session::new(dir.path().join("session.json"));
        session.save(&[]).expect("save");
        assert!(session.path().exists());
        session.clear().expect("clear");
        assert!(!session.path().exists());
        session.clear().expect("clear twice");
    }
}
