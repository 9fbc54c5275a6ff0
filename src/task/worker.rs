#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::task::auto_action::AutoActionConfig;
use crate::task::engine::QueueEngine;
use crate::task::execution::ExecutionManager;
use crate::task::model::{Task, TaskStatus, now_rfc3339};
use crate::task::process::pid_alive;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub queue_dir: PathBuf,
    pub poll_interval: Duration,
    /// Keep running after the queue drains and pick up newly queued tasks.
    pub wait: bool,
    /// Execution history older than this is removed at startup.
    pub log_retention_days: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerLock {
    pub pid: u32,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub stop_requested: bool,
    pub current_task: Option<String>,
    pub counts: BTreeMap<String, usize>,
}

#[must_use]
pub fn lock_path(queue_dir: &Path) -> PathBuf {
    queue_dir.join("runner.lock")
}

#[must_use]
pub fn stop_path(queue_dir: &Path) -> PathBuf {
    queue_dir.join("runner.stop")
}

#[must_use]
pub fn cancel_path(queue_dir: &Path) -> PathBuf {
    queue_dir.join("auto_action.cancel")
}

pub fn load_runner_lock(queue_dir: &Path) -> anyhow::Result<Option<RunnerLock>> {
    let path = lock_path(queue_dir);
    if !path.exists() {
        return Ok(None);
    }
    let data =
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let lock: RunnerLock = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(lock))
}

/// The lock of a runner that is still alive. Stale locks read as `None`.
pub fn live_runner(queue_dir: &Path) -> anyhow::Result<Option<RunnerLock>> {
    Ok(load_runner_lock(queue_dir)?.filter(|l| pid_alive(l.pid)))
}

pub fn runner_status(queue_dir: &Path, tasks: &[Task]) -> anyhow::Result<RunnerStatusReport> {
    let lock = live_runner(queue_dir)?;
    let stop_requested = stop_path(queue_dir).exists();

    let mut counts: BTreeMap<String, usize> = TaskStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_owned(), 0))
        .collect();
    for t in tasks {
        *counts.entry(t.status.as_str().to_owned()).or_insert(0) += 1;
    }

    Ok(RunnerStatusReport {
        running: lock.is_some(),
        pid: lock.as_ref().map(|l| l.pid),
        started_at: lock.as_ref().map(|l| l.started_at.clone()),
        stop_requested,
        current_task: tasks
            .iter()
            .find(|t| t.status == TaskStatus::Running)
            .map(|t| t.id.clone()),
        counts,
    })
}

/// Asks a runner in another process to stop and waits for it to let go of its
/// lock. Returns `false` if no runner was running or it did not exit in time.
pub async fn request_stop(queue_dir: &Path, timeout: Duration) -> anyhow::Result<bool> {
    if live_runner(queue_dir)?.is_none() {
        return Ok(false);
    }
    let stop = stop_path(queue_dir);
    std::fs::write(&stop, b"stop\n")
        .with_context(|| format!("failed to write {}", stop.display()))?;

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !lock_path(queue_dir).exists() {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(false)
}

/// Leaves a note for a live runner to cancel its countdown. Returns `false`
/// when there is no runner to receive it.
pub fn request_auto_action_cancel(queue_dir: &Path) -> anyhow::Result<bool> {
    if live_runner(queue_dir)?.is_none() {
        return Ok(false);
    }
    let path = cancel_path(queue_dir);
    std::fs::write(&path, b"cancel\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

/// Takes the runner lock. A lock left behind by a dead process is replaced.
pub fn acquire_lock(queue_dir: &Path) -> anyhow::Result<RunnerGuard> {
    std::fs::create_dir_all(queue_dir)
        .with_context(|| format!("failed to create {}", queue_dir.display()))?;

    let lock_file = lock_path(queue_dir);
    match load_runner_lock(queue_dir) {
        Ok(Some(existing)) if pid_alive(existing.pid) => {
            anyhow::bail!(
                "runner already running (pid {}, since {})",
                existing.pid,
                existing.started_at
            );
        }
        Ok(Some(existing)) => {
            tracing::warn!(pid = existing.pid, "replacing stale runner lock");
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "replacing unreadable runner lock");
        }
    }

    let lock = RunnerLock {
        pid: std::process::id(),
        started_at: now_rfc3339(),
    };
    std::fs::write(&lock_file, serde_json::to_vec_pretty(&lock)?)
        .with_context(|| format!("failed to write {}", lock_file.display()))?;

    let stop_file = stop_path(queue_dir);
    let cancel_file = cancel_path(queue_dir);
    let _ = std::fs::remove_file(&stop_file);
    let _ = std::fs::remove_file(&cancel_file);

    Ok(RunnerGuard {
        lock_file,
        stop_file,
        cancel_file,
    })
}

/// Drives the engine until the queue is done, a stop is requested or the
/// process is interrupted. `reload_auto_action` is polled so settings changed
/// from another shell reach the running countdown logic.
pub async fn run_queue<F>(
    engine: &QueueEngine,
    cfg: &RunnerConfig,
    reload_auto_action: F,
) -> anyhow::Result<()>
where
    F: Fn() -> Option<AutoActionConfig>,
{
    let _guard = acquire_lock(&cfg.queue_dir)?;

    if let Some(days) = cfg.log_retention_days.filter(|d| *d > 0) {
        match ExecutionManager::new(cfg.queue_dir.clone()).cleanup_retention(days) {
            Ok(0) => {}
            Ok(n) => tracing::info!(removed = n, "cleaned up old execution logs"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "execution log cleanup failed"),
        }
    }

    let reconciled = engine.reconcile().await?;
    if !reconciled.is_empty() {
        tracing::warn!(count = reconciled.len(), "recovered tasks from an unclean shutdown");
    }

    let outcome = engine.start().await?;
    if outcome.needs_terminal_choice {
        anyhow::bail!("no launch mode selected; run `promptq terminal set <mode>` or pass --mode");
    }

    let stop_file = stop_path(&cfg.queue_dir);
    let cancel_file = cancel_path(&cfg.queue_dir);
    let mut ticker = tokio::time::interval(cfg.poll_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                engine.stop().await?;
                break;
            }
            _ = ticker.tick() => {}
        }

        if stop_file.exists() {
            let _ = std::fs::remove_file(&stop_file);
            tracing::info!("stop requested");
            engine.stop().await?;
            break;
        }

        if cancel_file.exists() {
            let _ = std::fs::remove_file(&cancel_file);
            engine.cancel_auto_action().await;
        }

        if let Some(latest) = reload_auto_action()
            && latest != engine.auto_action_config().await
        {
            tracing::debug!(?latest, "auto-action settings changed on disk");
            engine.update_auto_action_config(latest).await?;
        }

        if let Err(e) = engine.settle_pending().await {
            tracing::warn!(error = %e, "still cannot save the last task result; retrying");
            continue;
        }

        let status = engine.status().await;
        if cfg.wait && !status.is_running && engine.has_runnable_task().await? {
            engine.start().await?;
            continue;
        }

        if !cfg.wait && engine.is_idle().await {
            break;
        }
    }

    Ok(())
}

/// Removes the lock and marker files on exit, including on error paths.
pub struct RunnerGuard {
    lock_file: PathBuf,
    stop_file: PathBuf,
    cancel_file: PathBuf,
}

impl Drop for RunnerGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_file);
        let _ = std::fs::remove_file(&self.stop_file);
        let _ = std::fs::remove_file(&self.cancel_file);
    }
}
