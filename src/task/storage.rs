#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::QueueError;
use crate::task::model::Task;

/// Durable task records keyed by id. The store layer owns ordering and invariants;
/// implementations only need to persist what they are given.
pub trait TaskPersistence: Send + Sync {
    fn save(&self, task: &Task) -> Result<(), QueueError>;

    /// Writes a batch of tasks. Implementations should make the batch as close to
    /// all-or-nothing as the medium allows.
    fn save_all(&self, tasks: &[Task]) -> Result<(), QueueError> {
        for task in tasks {
            self.save(task)?;
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Task>, QueueError>;
    fn list(&self) -> Result<Vec<Task>, QueueError>;
    fn delete(&self, id: &str) -> Result<(), QueueError>;

    /// File that serializes mutations across processes sharing this storage.
    /// `None` when the medium is private to one process.
    fn lock_path(&self) -> Option<PathBuf> {
        None
    }
}

/// One pretty-printed JSON file per task under the queue directory.
#[derive(Debug, Clone)]
pub struct FileTaskStorage {
    dir: PathBuf,
}

impl FileTaskStorage {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), QueueError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| QueueError::persistence(&self.dir, e))
    }

    fn task_path(&self, id: &str) -> Result<PathBuf, QueueError> {
        validate_task_id(id)?;
        Ok(self.dir.join(format!("task-{id}.json")))
    }

    fn write_tmp(&self, task: &Task) -> Result<(PathBuf, PathBuf), QueueError> {
        let path = self.task_path(&task.id)?;
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(task)
            .map_err(|e| QueueError::Other(format!("failed to encode task {}: {e}", task.id)))?;
        std::fs::write(&tmp, &data).map_err(|e| QueueError::persistence(&tmp, e))?;
        Ok((tmp, path))
    }
}

impl TaskPersistence for FileTaskStorage {
    fn save(&self, task: &Task) -> Result<(), QueueError> {
        self.ensure_dir()?;
        let (tmp, path) = self.write_tmp(task)?;
        std::fs::rename(&tmp, &path).map_err(|e| QueueError::persistence(&path, e))
    }

    fn save_all(&self, tasks: &[Task]) -> Result<(), QueueError> {
        self.ensure_dir()?;
        // Stage every file first so a write failure leaves the originals untouched.
        let mut staged = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.write_tmp(task) {
                Ok(pair) => staged.push(pair),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = std::fs::remove_file(tmp);
                    }
                    return Err(e);
                }
            }
        }
        for (tmp, path) in staged {
            std::fs::rename(&tmp, &path).map_err(|e| QueueError::persistence(&path, e))?;
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let path = self.task_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| QueueError::persistence(&path, e))?;
        let task = serde_json::from_slice(&data).map_err(|e| {
            QueueError::Other(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(task))
    }

    fn list(&self) -> Result<Vec<Task>, QueueError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks: Vec<Task> = Vec::new();
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| QueueError::persistence(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| QueueError::persistence(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task file"),
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn delete(&self, id: &str) -> Result<(), QueueError> {
        let path = self.task_path(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::persistence(&path, e)),
        }
    }

    fn lock_path(&self) -> Option<PathBuf> {
        Some(self.dir.join("queue.lock"))
    }
}

/// In-process storage for tests and embedding. `fail_writes` simulates a store
/// that stops accepting writes mid-operation.
#[derive(Debug, Default)]
pub struct MemoryTaskStorage {
    tasks: Mutex<BTreeMap<String, Task>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryTaskStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), QueueError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(QueueError::persistence(
                "memory",
                std::io::Error::other("writes disabled"),
            ));
        }
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TaskPersistence for MemoryTaskStorage {
    fn save(&self, task: &Task) -> Result<(), QueueError> {
        self.check_writable()?;
        self.guard().insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn save_all(&self, tasks: &[Task]) -> Result<(), QueueError> {
        self.check_writable()?;
        let mut guard = self.guard();
        for task in tasks {
            guard.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Task>, QueueError> {
        Ok(self.guard().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Task>, QueueError> {
        Ok(self.guard().values().cloned().collect())
    }

    fn delete(&self, id: &str) -> Result<(), QueueError> {
        self.check_writable()?;
        self.guard().remove(id);
        Ok(())
    }
}

fn validate_task_id(id: &str) -> Result<(), QueueError> {
    if id.trim().is_empty() {
        return Err(QueueError::Validation("task ID is required".to_owned()));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(QueueError::Validation(format!(
            "invalid task ID '{id}': must not contain path separators"
        )));
    }
    if id.contains("..") {
        return Err(QueueError::Validation(format!(
            "invalid task ID '{id}': must not contain '..'"
        )));
    }
    Ok(())
}
