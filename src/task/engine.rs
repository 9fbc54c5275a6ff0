#![forbid(unsafe_code)]

//! The queue runner.
//!
//! All runner and countdown state lives in one [`EngineState`] behind a single
//! `tokio::sync::Mutex`. Explicit operations, process-exit notifications from the
//! monitor tasks and countdown ticks all go through that lock, so "pick the next
//! task", "the process exited" and "the user pressed stop" never interleave.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{StrandedPolicy, expand_path};
use crate::error::QueueError;
use crate::task::auto_action::{
    AutoActionConfig, AutoActionScheduler, AutoActionState, AutoActionType, CancelReason,
    HostActionInvoker, SystemActionInvoker, TickOutcome,
};
use crate::task::events::{EventBus, QueueEvent};
use crate::task::execution::{ExecutionManager, ExecutionRecord, ExecutionStatus};
use crate::task::launch::{TerminalChoice, TerminalPolicy};
use crate::task::model::{ExecutionResult, NewTask, Task, TaskPatch, TaskStatus, now_rfc3339};
use crate::task::preferences::{MemoryPreferences, PreferenceStore};
use crate::task::process::{AgentCommand, AgentInvocation, AgentProcess, ProcessExit, ProcessSpawner};
use crate::task::state::TransitionOrigin;
use crate::task::store::{DependencyState, Placement, TaskStore, dependency_state};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long `stop` waits for the agent to exit before giving up on it.
    pub stop_timeout: Duration,
    /// Interrupt-to-kill grace period.
    pub stop_grace: Duration,
    pub skip_on_failed_dependency: bool,
    pub stranded_policy: StrandedPolicy,
    /// Countdown resolution. One second outside of tests.
    pub tick_interval: Duration,
    pub agent: AgentCommand,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            skip_on_failed_dependency: true,
            stranded_policy: StrandedPolicy::Requeue,
            tick_interval: Duration::from_secs(1),
            agent: AgentCommand::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub started: bool,
    pub needs_terminal_choice: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub is_running: bool,
    pub current_task_id: Option<String>,
    pub current_execution_id: Option<String>,
    pub launch_mode: Option<String>,
    pub needs_terminal_choice: bool,
    pub auto_action: AutoActionState,
    pub auto_action_config: AutoActionConfig,
}

struct RunningTask {
    task_id: String,
    execution_id: String,
    launch_mode: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    /// Flips to `true` (or closes) once the monitor has let go of the process.
    done: watch::Receiver<bool>,
    monitor: JoinHandle<()>,
    stop_requested: bool,
    record: ExecutionRecord,
    /// The process is gone but its result is not in the store yet. The task
    /// stays current until the write lands.
    unrecorded: Option<Outcome>,
}

struct Outcome {
    status: TaskStatus,
    exec_status: ExecutionStatus,
    result: ExecutionResult,
}

struct EngineState {
    is_running: bool,
    current: Option<RunningTask>,
    policy: TerminalPolicy,
    scheduler: AutoActionScheduler,
    spawn_warning_sent: bool,
}

enum Advance {
    Launched,
    Exhausted { attempted: usize },
}

struct Inner {
    store: TaskStore,
    bus: EventBus,
    spawner: Arc<dyn ProcessSpawner>,
    invoker: Arc<dyn SystemActionInvoker>,
    preferences: Arc<dyn PreferenceStore>,
    executions: Option<ExecutionManager>,
    options: EngineOptions,
    state: Mutex<EngineState>,
}

pub struct QueueEngineBuilder {
    store: TaskStore,
    spawner: Arc<dyn ProcessSpawner>,
    invoker: Option<Arc<dyn SystemActionInvoker>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    executions: Option<ExecutionManager>,
    bus: Option<EventBus>,
    options: EngineOptions,
    policy: TerminalPolicy,
    auto_action: AutoActionConfig,
}

impl QueueEngineBuilder {
    #[must_use]
    pub fn invoker(mut self, invoker: Arc<dyn SystemActionInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    #[must_use]
    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    #[must_use]
    pub fn executions(mut self, executions: ExecutionManager) -> Self {
        self.executions = Some(executions);
        self
    }

    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn terminal_policy(mut self, policy: TerminalPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn auto_action(mut self, config: AutoActionConfig) -> Self {
        self.auto_action = config;
        self
    }

    #[must_use]
    pub fn build(self) -> QueueEngine {
        QueueEngine {
            inner: Arc::new(Inner {
                store: self.store,
                bus: self.bus.unwrap_or_default(),
                spawner: self.spawner,
                invoker: self
                    .invoker
                    .unwrap_or_else(|| Arc::new(HostActionInvoker::default())),
                preferences: self
                    .preferences
                    .unwrap_or_else(|| Arc::new(MemoryPreferences::new())),
                executions: self.executions,
                options: self.options,
                state: Mutex::new(EngineState {
                    is_running: false,
                    current: None,
                    policy: self.policy,
                    scheduler: AutoActionScheduler::new(self.auto_action),
                    spawn_warning_sent: false,
                }),
            }),
        }
    }
}

/// Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine").finish_non_exhaustive()
    }
}

impl QueueEngine {
    #[must_use]
    pub fn builder(store: TaskStore, spawner: Arc<dyn ProcessSpawner>) -> QueueEngineBuilder {
        QueueEngineBuilder {
            store,
            spawner,
            invoker: None,
            preferences: None,
            executions: None,
            bus: None,
            options: EngineOptions::default(),
            policy: TerminalPolicy::default(),
            auto_action: AutoActionConfig::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.bus.subscribe()
    }

    fn publish(&self, event: QueueEvent) {
        self.inner.bus.publish(event);
    }

    // ---- task operations ---------------------------------------------------

    pub async fn create_task(&self, new: NewTask) -> Result<Task, QueueError> {
        let _st = self.inner.state.lock().await;
        let task = self.inner.store.create(new)?;
        self.publish(QueueEvent::TaskCreated {
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, QueueError> {
        let mut st = self.inner.state.lock().await;
        let wants_queue = patch.status == Some(TaskStatus::Queued);
        let task = self.inner.store.update(id, patch)?;
        self.publish(QueueEvent::TaskUpdated {
            task_id: task.id.clone(),
            status: task.status,
        });
        if wants_queue {
            self.cancel_countdown_locked(&mut st, CancelReason::TaskQueued);
        }
        Ok(task)
    }

    pub async fn enqueue(&self, id: &str) -> Result<Task, QueueError> {
        self.update_task(id, TaskPatch::status(TaskStatus::Queued))
            .await
    }

    pub async fn dequeue(&self, id: &str) -> Result<Task, QueueError> {
        self.update_task(id, TaskPatch::status(TaskStatus::Backlog))
            .await
    }

    pub async fn delete_task(&self, id: &str) -> Result<Task, QueueError> {
        let _st = self.inner.state.lock().await;
        let task = self.inner.store.delete(id)?;
        self.publish(QueueEvent::TaskDeleted {
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    pub async fn reorder(&self, status: TaskStatus, ids: &[String]) -> Result<Vec<Task>, QueueError> {
        let _st = self.inner.state.lock().await;
        let tasks = self.inner.store.reorder(status, ids)?;
        self.publish(QueueEvent::PartitionReordered { status });
        Ok(tasks)
    }

    // ---- terminal launch policy --------------------------------------------

    /// Records how tasks get launched; remembered choices are persisted.
    pub async fn select_terminal(&self, choice: TerminalChoice) -> Result<(), QueueError> {
        let mut st = self.inner.state.lock().await;
        let persist = st.policy.select(choice.clone())?;
        if persist {
            self.inner
                .preferences
                .save_terminal_choice(Some(&choice))
                .map_err(|e| QueueError::Config(format!("{e:#}")))?;
        }
        tracing::info!(mode = choice.mode.as_str(), remembered = persist, "terminal launch mode selected");
        Ok(())
    }

    pub async fn forget_terminal(&self) -> Result<(), QueueError> {
        let mut st = self.inner.state.lock().await;
        st.policy.forget();
        self.inner
            .preferences
            .save_terminal_choice(None)
            .map_err(|e| QueueError::Config(format!("{e:#}")))
    }

    // ---- runner ------------------------------------------------------------

    pub async fn start(&self) -> Result<StartOutcome, QueueError> {
        let mut st = self.inner.state.lock().await;
        if st.policy.resolve_launch_mode().is_none() {
            return Ok(StartOutcome {
                started: false,
                needs_terminal_choice: true,
            });
        }
        if st.is_running {
            return Ok(StartOutcome {
                started: false,
                needs_terminal_choice: false,
            });
        }
        self.settle_locked(&mut st)?;
        if st.current.is_some() {
            // A stop is still winding the previous task down.
            return Ok(StartOutcome {
                started: false,
                needs_terminal_choice: false,
            });
        }

        self.cancel_countdown_locked(&mut st, CancelReason::QueueRestarted);
        st.is_running = true;
        st.spawn_warning_sent = false;
        self.publish(QueueEvent::QueueStarted);
        tracing::info!("queue started");

        let started = match self.advance_locked(&mut st) {
            Ok(Advance::Launched) => true,
            Ok(Advance::Exhausted { attempted }) => {
                self.drained_locked(&mut st, attempted > 0);
                false
            }
            Err(e) => {
                st.is_running = false;
                self.publish(QueueEvent::QueueStopped);
                return Err(e);
            }
        };
        Ok(StartOutcome {
            started,
            needs_terminal_choice: false,
        })
    }

    /// Stops the queue. Returns `false` when nothing was running.
    ///
    /// The running task ends up failed even if its process exits cleanly while
    /// being stopped. Waits up to `stop_timeout` for the process to go away, then
    /// kills it and records the task as aborted. Concurrent calls all wait for the
    /// same process.
    pub async fn stop(&self) -> Result<bool, QueueError> {
        let (task_id, execution_id, mut done) = {
            let mut st = self.inner.state.lock().await;
            st.is_running = false;
            let Some(cur) = st.current.as_mut() else {
                return Ok(false);
            };
            if cur.unrecorded.is_some() {
                // Only the result write is outstanding.
                self.settle_locked(&mut st)?;
                self.publish(QueueEvent::QueueStopped);
                return Ok(true);
            }
            cur.stop_requested = true;
            if let Some(tx) = cur.stop_tx.take() {
                let _ = tx.send(());
            }
            (cur.task_id.clone(), cur.execution_id.clone(), cur.done.clone())
        };
        tracing::info!(task_id = %task_id, "stopping queue");

        // A closed channel means the monitor is gone, which counts as exited.
        let exited = tokio::time::timeout(self.inner.options.stop_timeout, done.wait_for(|d| *d))
            .await
            .is_ok();

        let mut st = self.inner.state.lock().await;
        if !exited
            && let Some(cur) = st
                .current
                .as_mut()
                .filter(|c| c.execution_id == execution_id && c.unrecorded.is_none())
        {
            // Dropping the process kills whatever is left of it.
            cur.monitor.abort();
            let _ = (&mut cur.monitor).await;
            tracing::warn!(task_id = %task_id, "agent did not exit in time; killing it");
            cur.unrecorded = Some(Outcome {
                status: TaskStatus::Failed,
                exec_status: ExecutionStatus::Aborted,
                result: ExecutionResult {
                    error: Some(format!(
                        "stopped by user; agent did not exit within {}s",
                        self.inner.options.stop_timeout.as_secs()
                    )),
                    ..ExecutionResult::default()
                },
            });
        }
        self.settle_locked(&mut st)?;
        drop(st);

        self.publish(QueueEvent::QueueStopped);
        Ok(true)
    }

    /// Retries writing a finished task's result that the store refused earlier.
    /// Returns `true` if one was pending and has now landed.
    pub async fn settle_pending(&self) -> Result<bool, QueueError> {
        let mut st = self.inner.state.lock().await;
        if !st.current.as_ref().is_some_and(|c| c.unrecorded.is_some()) {
            return Ok(false);
        }
        self.settle_locked(&mut st)?;
        Ok(true)
    }

    pub async fn status(&self) -> QueueStatus {
        let st = self.inner.state.lock().await;
        QueueStatus {
            is_running: st.is_running,
            current_task_id: st.current.as_ref().map(|c| c.task_id.clone()),
            current_execution_id: st.current.as_ref().map(|c| c.execution_id.clone()),
            launch_mode: st
                .current
                .as_ref()
                .map(|c| c.launch_mode.to_owned())
                .or_else(|| st.policy.resolve_launch_mode().map(|m| m.label().to_owned())),
            needs_terminal_choice: st.policy.resolve_launch_mode().is_none(),
            auto_action: st.scheduler.state(),
            auto_action_config: st.scheduler.config(),
        }
    }

    /// Neither running tasks nor counting down.
    pub async fn is_idle(&self) -> bool {
        let st = self.inner.state.lock().await;
        !st.is_running && st.current.is_none() && !st.scheduler.is_counting()
    }

    /// Whether `start` would find something to do right now.
    pub async fn has_runnable_task(&self) -> Result<bool, QueueError> {
        let _st = self.inner.state.lock().await;
        let all = self.inner.store.list_all()?;
        let skip_failed = self.inner.options.skip_on_failed_dependency;
        Ok(all
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .any(|t| match dependency_state(&all, t) {
                DependencyState::None | DependencyState::Satisfied => true,
                DependencyState::Failed => skip_failed,
                DependencyState::Pending => false,
            }))
    }

    /// Fixes up tasks left `running` by a runner that died. Call once, before
    /// `start`, from the process that owns the queue.
    pub async fn reconcile(&self) -> Result<Vec<Task>, QueueError> {
        let st = self.inner.state.lock().await;
        if st.current.is_some() {
            return Ok(Vec::new());
        }

        let mut stranded = self.inner.store.list_by_status(TaskStatus::Running)?;
        // Front placement one by one; go backwards to keep their relative order.
        stranded.reverse();
        let mut fixed = Vec::with_capacity(stranded.len());
        for task in stranded {
            let repaired = match self.inner.options.stranded_policy {
                StrandedPolicy::Requeue => self.inner.store.transition(
                    &task.id,
                    TaskStatus::Queued,
                    TransitionOrigin::Reconciliation,
                    Placement::Front,
                    |t| {
                        t.started_at = None;
                        t.execution_id = None;
                    },
                )?,
                StrandedPolicy::Fail => self.inner.store.transition(
                    &task.id,
                    TaskStatus::Failed,
                    TransitionOrigin::Reconciliation,
                    Placement::Back,
                    |t| {
                        t.last_error = Some("runner exited while the task was running".to_owned());
                    },
                )?,
            };
            tracing::warn!(task_id = %repaired.id, status = %repaired.status, "reconciled stranded task");
            if let Some(exec_id) = task.execution_id.as_deref() {
                self.abort_execution_record(exec_id);
            }
            self.publish(QueueEvent::TaskReconciled {
                task_id: repaired.id.clone(),
                status: repaired.status,
            });
            fixed.push(repaired);
        }
        fixed.reverse();
        Ok(fixed)
    }

    // ---- auto-action -------------------------------------------------------

    pub async fn auto_action_state(&self) -> AutoActionState {
        self.inner.state.lock().await.scheduler.state()
    }

    pub async fn auto_action_config(&self) -> AutoActionConfig {
        self.inner.state.lock().await.scheduler.config()
    }

    /// Cancels a running countdown, or disarms an idle configuration. Returns
    /// `true` if a countdown was running.
    pub async fn cancel_auto_action(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        if self.cancel_countdown_locked(&mut st, CancelReason::User) {
            return true;
        }
        if st.scheduler.disarm() {
            self.persist_auto_action(&st);
        }
        false
    }

    pub async fn update_auto_action_config(
        &self,
        config: AutoActionConfig,
    ) -> Result<AutoActionConfig, QueueError> {
        if config.enabled && config.delay_minutes == 0 {
            return Err(QueueError::Validation(
                "auto-action delay must be at least one minute".to_owned(),
            ));
        }
        let mut st = self.inner.state.lock().await;
        st.scheduler.set_config(config);
        if !config.is_armed() && st.scheduler.is_counting() {
            self.cancel_countdown_locked(&mut st, CancelReason::User);
        }
        self.persist_auto_action(&st);
        Ok(st.scheduler.config())
    }

    // ---- internals ---------------------------------------------------------

    fn advance_locked(&self, st: &mut EngineState) -> Result<Advance, QueueError> {
        let mut attempted = 0;
        loop {
            if !st.is_running || st.current.is_some() {
                return Ok(Advance::Launched);
            }

            // Re-read on every pass so a reorder since the last selection is honoured.
            let all = self.inner.store.list_all()?;
            let mut queued: Vec<&Task> = all
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .collect();
            queued.sort_by_key(|t| t.sort_order);

            let mut next = None;
            let mut skip = None;
            for task in queued {
                match dependency_state(&all, task) {
                    DependencyState::None | DependencyState::Satisfied => {
                        next = Some(task.clone());
                        break;
                    }
                    DependencyState::Failed if self.inner.options.skip_on_failed_dependency => {
                        skip = Some(task.clone());
                        break;
                    }
                    DependencyState::Failed | DependencyState::Pending => {
                        tracing::debug!(task_id = %task.id, dependency = ?task.depends_on, "dependency not met; leaving queued");
                    }
                }
            }

            if let Some(task) = skip {
                attempted += 1;
                self.skip_locked(&task)?;
                continue;
            }
            let Some(task) = next else {
                return Ok(Advance::Exhausted { attempted });
            };
            attempted += 1;
            if self.launch_locked(st, &task)? {
                return Ok(Advance::Launched);
            }
        }
    }

    fn skip_locked(&self, task: &Task) -> Result<(), QueueError> {
        let dependency = task.depends_on.clone().unwrap_or_default();
        let skipped = self.inner.store.transition(
            &task.id,
            TaskStatus::Skipped,
            TransitionOrigin::Runner,
            Placement::Back,
            |t| t.last_error = Some(format!("dependency {dependency} failed")),
        )?;
        tracing::info!(task_id = %skipped.id, dependency = %dependency, "task skipped");
        self.publish(QueueEvent::TaskSkipped {
            task_id: skipped.id,
            dependency,
        });
        Ok(())
    }

    /// Returns `Ok(false)` when the agent could not be launched; the task is
    /// failed and selection moves on.
    fn launch_locked(&self, st: &mut EngineState, task: &Task) -> Result<bool, QueueError> {
        let Some(mode) = st.policy.resolve_launch_mode() else {
            return Err(QueueError::Conflict(
                "no terminal launch mode selected".to_owned(),
            ));
        };
        let execution_id = ExecutionManager::new_execution_id();
        let running = self.inner.store.transition(
            &task.id,
            TaskStatus::Running,
            TransitionOrigin::Runner,
            Placement::Back,
            |t| {
                t.clear_results();
                t.execution_id = Some(execution_id.clone());
            },
        )?;

        let working_dir = resolve_working_dir(&running);
        let mut record = ExecutionRecord {
            execution_id: execution_id.clone(),
            task_id: running.id.clone(),
            prompt: running.prompt.clone(),
            launch_mode: mode.label().to_owned(),
            working_directory: working_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            status: ExecutionStatus::Running,
            start_time: now_rfc3339(),
            end_time: None,
            exit_code: None,
            tokens: None,
            cost_usd: None,
            error: None,
        };

        let spawned = working_dir.and_then(|dir| {
            let invocation =
                AgentInvocation::for_task(&self.inner.options.agent, &running, &execution_id, dir);
            self.inner.spawner.spawn(&invocation, &mode)
        });

        let process = match spawned {
            Ok(p) => p,
            Err(e) => {
                let msg = e.to_string();
                let failed = self.inner.store.transition(
                    &running.id,
                    TaskStatus::Failed,
                    TransitionOrigin::Runner,
                    Placement::Back,
                    |t| t.last_error = Some(msg.clone()),
                )?;
                if st.spawn_warning_sent {
                    tracing::warn!(task_id = %failed.id, error = %msg, "failed to launch agent");
                } else {
                    st.spawn_warning_sent = true;
                    tracing::error!(task_id = %failed.id, error = %msg, "failed to launch agent");
                    self.publish(QueueEvent::SpawnFailed {
                        task_id: failed.id.clone(),
                        error: msg.clone(),
                    });
                }
                self.publish(QueueEvent::TaskFinished {
                    task_id: failed.id,
                    status: TaskStatus::Failed,
                    exit_code: None,
                });
                record.status = ExecutionStatus::Failed;
                record.end_time = Some(now_rfc3339());
                record.error = Some(msg);
                self.save_execution_record(&record);
                return Ok(false);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done) = watch::channel(false);
        let engine = self.clone();
        let exec_id = execution_id.clone();
        let monitor = tokio::spawn(async move {
            engine.monitor(process, stop_rx, exec_id).await;
            let _ = done_tx.send(true);
        });

        tracing::info!(task_id = %running.id, execution_id = %execution_id, mode = mode.label(), "task started");
        self.save_execution_record(&record);
        st.current = Some(RunningTask {
            task_id: running.id.clone(),
            execution_id,
            launch_mode: mode.label(),
            stop_tx: Some(stop_tx),
            done,
            monitor,
            stop_requested: false,
            record,
            unrecorded: None,
        });
        self.publish(QueueEvent::TaskStarted {
            task_id: running.id,
            launch_mode: mode.label().to_owned(),
        });
        Ok(true)
    }

    async fn monitor(
        self,
        mut process: Box<dyn AgentProcess>,
        mut stop_rx: oneshot::Receiver<()>,
        execution_id: String,
    ) {
        enum Waited {
            Exited(anyhow::Result<ProcessExit>),
            StopRequested,
        }

        let waited = tokio::select! {
            res = process.wait() => Waited::Exited(res),
            Ok(()) = &mut stop_rx => Waited::StopRequested,
        };
        let (result, stopped) = match waited {
            Waited::Exited(res) => (res, false),
            Waited::StopRequested => (process.terminate(self.inner.options.stop_grace).await, true),
        };
        self.finish(execution_id, result, stopped).await;
    }

    async fn finish(&self, execution_id: String, result: anyhow::Result<ProcessExit>, stopped: bool) {
        let mut st = self.inner.state.lock().await;
        let Some(cur) = st
            .current
            .as_mut()
            .filter(|c| c.execution_id == execution_id && c.unrecorded.is_none())
        else {
            // Already settled by a timed-out stop.
            return;
        };
        let stopped = stopped || cur.stop_requested;
        cur.unrecorded = Some(classify(result, stopped));

        if let Err(e) = self.settle_locked(&mut st) {
            if st.is_running {
                tracing::error!(error = %e, "queue halted");
                st.is_running = false;
                self.publish(QueueEvent::QueueStopped);
            }
            return;
        }

        if st.is_running {
            match self.advance_locked(&mut st) {
                Ok(Advance::Launched) => {}
                Ok(Advance::Exhausted { .. }) => self.drained_locked(&mut st, true),
                Err(e) => {
                    tracing::error!(error = %e, "queue halted");
                    st.is_running = false;
                    self.publish(QueueEvent::QueueStopped);
                }
            }
        }
    }

    /// Writes the current task's pending result and releases it. If the store
    /// refuses the write, the task stays current and `running` on disk.
    fn settle_locked(&self, st: &mut EngineState) -> Result<(), QueueError> {
        let Some(cur) = st.current.as_ref() else {
            return Ok(());
        };
        let Some(outcome) = cur.unrecorded.as_ref() else {
            return Ok(());
        };
        let recorded = self.inner.store.transition(
            &cur.task_id,
            outcome.status,
            TransitionOrigin::Runner,
            Placement::Back,
            |t| {
                t.exit_code = outcome.result.exit_code;
                t.output = Some(outcome.result.output.clone());
                t.tokens = outcome.result.tokens;
                t.cost_usd = outcome.result.cost_usd;
                t.last_error = outcome.result.error.clone();
            },
        );
        match recorded {
            Ok(task) => {
                tracing::info!(task_id = %task.id, status = %task.status, exit_code = ?task.exit_code, "task finished");
            }
            Err(e @ (QueueError::NotFound(_) | QueueError::InvalidTransition { .. })) => {
                tracing::error!(task_id = %cur.task_id, error = %e, "task is no longer running; dropping its result");
            }
            Err(e) => {
                tracing::error!(task_id = %cur.task_id, error = %e, "failed to record task result");
                self.publish(QueueEvent::PersistenceFailed {
                    task_id: cur.task_id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }

        if let Some(cur) = st.current.take() {
            self.release(cur);
        }
        Ok(())
    }

    fn release(&self, cur: RunningTask) {
        let Some(outcome) = cur.unrecorded else {
            return;
        };
        let mut record = cur.record;
        record.status = outcome.exec_status;
        record.end_time = Some(now_rfc3339());
        record.exit_code = outcome.result.exit_code;
        record.tokens = outcome.result.tokens;
        record.cost_usd = outcome.result.cost_usd;
        record.error = outcome.result.error;
        self.save_execution_record(&record);

        self.publish(QueueEvent::TaskFinished {
            task_id: cur.task_id,
            status: outcome.status,
            exit_code: outcome.result.exit_code,
        });
    }

    fn drained_locked(&self, st: &mut EngineState, may_arm: bool) {
        st.is_running = false;
        tracing::info!("queue drained");
        self.publish(QueueEvent::QueueDrained);
        if !may_arm {
            return;
        }
        match self.inner.store.count_active() {
            Ok(0) => self.arm_locked(st),
            Ok(n) => tracing::info!(active = n, "tasks still waiting on dependencies; auto-action not armed"),
            Err(e) => tracing::warn!(error = %e, "cannot count active tasks; auto-action not armed"),
        }
    }

    fn arm_locked(&self, st: &mut EngineState) {
        let Some((generation, seconds)) = st.scheduler.arm() else {
            return;
        };
        let action = st.scheduler.state().action_type;
        tracing::info!(%action, seconds, "auto-action countdown started");
        self.publish(QueueEvent::AutoActionArmed {
            action,
            remaining_seconds: seconds,
        });

        let engine = self.clone();
        let period = self.inner.options.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !engine.tick_auto_action(generation).await {
                    break;
                }
            }
        });
    }

    /// One countdown step. Returns `false` once this countdown is over.
    async fn tick_auto_action(&self, generation: u64) -> bool {
        let action = {
            let mut st = self.inner.state.lock().await;
            if st.scheduler.generation() != generation || !st.scheduler.is_counting() {
                return false;
            }
            // Catches tasks queued by another process.
            if let Ok(active) = self.inner.store.count_active()
                && active > 0
            {
                self.cancel_countdown_locked(&mut st, CancelReason::TaskQueued);
                return false;
            }
            match st.scheduler.tick() {
                TickOutcome::Idle => return false,
                TickOutcome::Counting(remaining) => {
                    self.publish(QueueEvent::AutoActionTick {
                        remaining_seconds: remaining,
                    });
                    return true;
                }
                TickOutcome::Fire(action) => {
                    self.persist_auto_action(&st);
                    action
                }
            }
        };

        self.fire(action).await;
        false
    }

    async fn fire(&self, action: AutoActionType) {
        tracing::warn!(%action, "auto-action firing");
        let invoker = self.inner.invoker.clone();
        let result = tokio::task::spawn_blocking(move || invoker.invoke(action)).await;
        match result {
            Ok(Ok(())) => self.publish(QueueEvent::AutoActionFired { action }),
            Ok(Err(e)) => {
                tracing::error!(%action, error = %format!("{e:#}"), "auto-action failed");
                self.publish(QueueEvent::AutoActionFailed {
                    action,
                    error: format!("{e:#}"),
                });
            }
            Err(e) => {
                tracing::error!(%action, error = %e, "auto-action panicked");
                self.publish(QueueEvent::AutoActionFailed {
                    action,
                    error: e.to_string(),
                });
            }
        }
    }

    fn cancel_countdown_locked(&self, st: &mut EngineState, reason: CancelReason) -> bool {
        if !st.scheduler.cancel() {
            return false;
        }
        tracing::info!(?reason, "auto-action countdown cancelled");
        self.publish(QueueEvent::AutoActionCancelled { reason });
        self.persist_auto_action(st);
        true
    }

    fn persist_auto_action(&self, st: &EngineState) {
        if let Err(e) = self
            .inner
            .preferences
            .save_auto_action(&st.scheduler.config())
        {
            tracing::warn!(error = %format!("{e:#}"), "failed to save auto-action settings");
        }
    }

    fn save_execution_record(&self, record: &ExecutionRecord) {
        if let Some(mgr) = &self.inner.executions
            && let Err(e) = mgr.save_record(record)
        {
            tracing::warn!(execution_id = %record.execution_id, error = %format!("{e:#}"), "failed to save execution record");
        }
    }

    fn abort_execution_record(&self, execution_id: &str) {
        let Some(mgr) = &self.inner.executions else {
            return;
        };
        if let Ok(mut record) = mgr.load_record(execution_id)
            && record.status == ExecutionStatus::Running
        {
            record.status = ExecutionStatus::Aborted;
            record.end_time = Some(now_rfc3339());
            record.error = Some("runner exited while the task was running".to_owned());
            self.save_execution_record(&record);
        }
    }
}

fn classify(result: anyhow::Result<ProcessExit>, stopped: bool) -> Outcome {
    match result {
        Ok(exit) => {
            let mut result = ExecutionResult {
                exit_code: exit.exit_code,
                output: exit.output.clone(),
                tokens: exit.tokens,
                cost_usd: exit.cost_usd,
                error: None,
            };
            let (status, exec_status) = if stopped {
                result.error = Some("stopped by user".to_owned());
                (TaskStatus::Failed, ExecutionStatus::Aborted)
            } else if exit.success() {
                (TaskStatus::Completed, ExecutionStatus::Completed)
            } else {
                result.error = Some(match exit.exit_code {
                    Some(code) => format!("agent exited with code {code}"),
                    None => "agent terminated without an exit code".to_owned(),
                });
                (TaskStatus::Failed, ExecutionStatus::Failed)
            };
            Outcome {
                status,
                exec_status,
                result,
            }
        }
        Err(e) => Outcome {
            status: TaskStatus::Failed,
            exec_status: if stopped {
                ExecutionStatus::Aborted
            } else {
                ExecutionStatus::Failed
            },
            result: ExecutionResult {
                error: Some(QueueError::Execution(format!("{e:#}")).to_string()),
                ..ExecutionResult::default()
            },
        },
    }
}

fn resolve_working_dir(task: &Task) -> Result<PathBuf, QueueError> {
    match task.project_path.as_deref() {
        Some(p) => expand_path(p).map_err(|e| QueueError::Spawn(format!("{e:#}"))),
        None => std::env::current_dir()
            .map_err(|e| QueueError::Spawn(format!("failed to get current directory: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::task::launch::{LaunchMode, TerminalMode};
    use crate::task::storage::MemoryTaskStorage;

    /// Launches nothing; the test decides when and how each "process" exits.
    #[derive(Default)]
    struct FakeSpawner {
        exits: std::sync::Mutex<HashMap<String, oneshot::Sender<ProcessExit>>>,
        launched: std::sync::Mutex<Vec<(String, LaunchMode)>>,
        fail_spawns: bool,
        /// Processes ignore interrupts and never exit on their own.
        stubborn: bool,
        dropped: Arc<AtomicUsize>,
    }

    impl FakeSpawner {
        fn failing() -> Self {
            Self {
                fail_spawns: true,
                ..Self::default()
            }
        }

        fn stubborn() -> Self {
            Self {
                stubborn: true,
                ..Self::default()
            }
        }

        fn dropped(&self) -> usize {
            self.dropped.load(Ordering::SeqCst)
        }

        fn exit(&self, task_id: &str, code: i32) {
            let tx = self
                .exits
                .lock()
                .unwrap()
                .remove(task_id)
                .expect("task was launched");
            let _ = tx.send(ProcessExit {
                exit_code: Some(code),
                output: format!("output of {task_id}\n"),
                tokens: Some(42),
                cost_usd: Some(0.25),
                terminated: false,
            });
        }

        fn launched(&self) -> Vec<String> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    struct FakeProcess {
        rx: oneshot::Receiver<ProcessExit>,
        stubborn: bool,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for FakeProcess {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AgentProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> anyhow::Result<ProcessExit> {
            (&mut self.rx)
                .await
                .map_err(|_| anyhow::anyhow!("fake process abandoned"))
        }

        async fn terminate(&mut self, _grace: Duration) -> anyhow::Result<ProcessExit> {
            if self.stubborn {
                std::future::pending::<()>().await;
            }
            // The agent happens to exit cleanly when interrupted.
            Ok(ProcessExit {
                exit_code: Some(0),
                terminated: true,
                ..ProcessExit::default()
            })
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(
            &self,
            invocation: &AgentInvocation,
            mode: &LaunchMode,
        ) -> Result<Box<dyn AgentProcess>, QueueError> {
            if self.fail_spawns {
                return Err(QueueError::Spawn("claude: command not found".to_owned()));
            }
            let (tx, rx) = oneshot::channel();
            self.exits
                .lock()
                .unwrap()
                .insert(invocation.task_id.clone(), tx);
            self.launched
                .lock()
                .unwrap()
                .push((invocation.task_id.clone(), mode.clone()));
            Ok(Box::new(FakeProcess {
                rx,
                stubborn: self.stubborn,
                dropped: self.dropped.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingInvoker {
        calls: std::sync::Mutex<Vec<AutoActionType>>,
    }

    impl SystemActionInvoker for RecordingInvoker {
        fn invoke(&self, action: AutoActionType) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(action);
            Ok(())
        }
    }

    struct Harness {
        engine: QueueEngine,
        spawner: Arc<FakeSpawner>,
        invoker: Arc<RecordingInvoker>,
        prefs: Arc<MemoryPreferences>,
        events: broadcast::Receiver<QueueEvent>,
    }

    fn harness_with(spawner: FakeSpawner, remembered: bool, auto: AutoActionConfig) -> Harness {
        let spawner = Arc::new(spawner);
        let invoker = Arc::new(RecordingInvoker::default());
        let prefs = Arc::new(MemoryPreferences::new());
        let policy = if remembered {
            TerminalPolicy::new(
                Some(TerminalChoice::new(TerminalMode::Headless).remember()),
                None,
            )
        } else {
            TerminalPolicy::default()
        };
        let engine = QueueEngine::builder(
            TaskStore::new(Arc::new(MemoryTaskStorage::new())),
            spawner.clone(),
        )
        .invoker(invoker.clone())
        .preferences(prefs.clone())
        .terminal_policy(policy)
        .auto_action(auto)
        .build();
        let events = engine.subscribe();
        Harness {
            engine,
            spawner,
            invoker,
            prefs,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeSpawner::default(), true, AutoActionConfig::default())
    }

    fn headless_policy() -> TerminalPolicy {
        TerminalPolicy::new(
            Some(TerminalChoice::new(TerminalMode::Headless).remember()),
            None,
        )
    }

    fn stubborn_engine(stop_timeout: Duration) -> (QueueEngine, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner::stubborn());
        let engine = QueueEngine::builder(
            TaskStore::new(Arc::new(MemoryTaskStorage::new())),
            spawner.clone(),
        )
        .terminal_policy(headless_policy())
        .options(EngineOptions {
            stop_timeout,
            ..EngineOptions::default()
        })
        .build();
        (engine, spawner)
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<QueueEvent>,
        pred: impl Fn(&QueueEvent) -> bool,
    ) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if pred(&ev) => return ev,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn queued_task(engine: &QueueEngine, prompt: &str) -> Task {
        let t = engine.create_task(NewTask::prompt(prompt)).await.unwrap();
        engine.enqueue(&t.id).await.unwrap()
    }

    async fn assert_single_running(engine: &QueueEngine) {
        let status = engine.status().await;
        let running = engine
            .store()
            .list_by_status(TaskStatus::Running)
            .unwrap();
        assert!(running.len() <= 1);
        assert_eq!(
            status.current_task_id,
            running.first().map(|t| t.id.clone())
        );
    }

    #[tokio::test]
    async fn runs_in_queue_order_and_advances_on_exit() {
        let mut h = harness();
        let t1 = h
            .engine
            .create_task(NewTask {
                priority: crate::task::model::Priority::High,
                ..NewTask::prompt("first")
            })
            .await
            .unwrap();
        let t2 = h
            .engine
            .create_task(NewTask {
                priority: crate::task::model::Priority::Low,
                ..NewTask::prompt("second")
            })
            .await
            .unwrap();
        h.engine.enqueue(&t1.id).await.unwrap();
        h.engine.enqueue(&t2.id).await.unwrap();

        let out = h.engine.start().await.unwrap();
        assert_eq!(
            out,
            StartOutcome {
                started: true,
                needs_terminal_choice: false
            }
        );
        assert_eq!(
            h.engine.status().await.current_task_id.as_deref(),
            Some(t1.id.as_str())
        );
        assert_single_running(&h.engine).await;

        h.spawner.exit(&t1.id, 0);
        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::TaskStarted { task_id, .. } if *task_id == t2.id)
        })
        .await;

        let done = h.engine.store().get(&t1.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.tokens, Some(42));
        assert_eq!(done.cost_usd, Some(0.25));
        assert!(done.completed_at.is_some());
        assert_eq!(
            h.engine.store().get(&t2.id).unwrap().status,
            TaskStatus::Running
        );
        assert_single_running(&h.engine).await;

        h.spawner.exit(&t2.id, 1);
        wait_for(&mut h.events, |e| matches!(e, QueueEvent::QueueDrained)).await;
        let failed = h.engine.store().get(&t2.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("agent exited with code 1"));
        let status = h.engine.status().await;
        assert!(!status.is_running);
        assert!(status.current_task_id.is_none());
    }

    #[tokio::test]
    async fn start_without_terminal_choice_asks_for_one() {
        let h = harness_with(FakeSpawner::default(), false, AutoActionConfig::default());
        queued_task(&h.engine, "x").await;

        let out = h.engine.start().await.unwrap();
        assert_eq!(
            out,
            StartOutcome {
                started: false,
                needs_terminal_choice: true
            }
        );
        assert!(!h.engine.status().await.is_running);
        assert!(h.spawner.launched().is_empty());

        h.engine
            .select_terminal(TerminalChoice::new(TerminalMode::Headless))
            .await
            .unwrap();
        assert!(h.engine.start().await.unwrap().started);
        // Not remembered, so nothing was persisted.
        assert!(h.prefs.terminal_choice().is_none());
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let h = harness();
        queued_task(&h.engine, "a").await;
        queued_task(&h.engine, "b").await;

        assert!(h.engine.start().await.unwrap().started);
        assert!(!h.engine.start().await.unwrap().started);
        assert_eq!(h.spawner.launched().len(), 1);
    }

    #[tokio::test]
    async fn start_on_empty_queue_reports_not_started() {
        let h = harness();
        h.engine.create_task(NewTask::prompt("stays in backlog")).await.unwrap();
        assert!(!h.engine.start().await.unwrap().started);
        assert!(!h.engine.status().await.is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_fires_once_after_drain() {
        let mut h = harness_with(
            FakeSpawner::default(),
            true,
            AutoActionConfig::armed(AutoActionType::Shutdown, 1),
        );
        let t = queued_task(&h.engine, "only").await;
        h.engine.start().await.unwrap();
        h.spawner.exit(&t.id, 0);

        let armed = wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionArmed { .. })
        })
        .await;
        assert_eq!(
            armed,
            QueueEvent::AutoActionArmed {
                action: AutoActionType::Shutdown,
                remaining_seconds: 60
            }
        );
        assert!(h.engine.auto_action_state().await.timer_active);

        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionFired { .. })
        })
        .await;
        assert_eq!(
            *h.invoker.calls.lock().unwrap(),
            vec![AutoActionType::Shutdown]
        );
        let cfg = h.engine.auto_action_config().await;
        assert!(!cfg.enabled);
        assert_eq!(cfg.action_type, AutoActionType::None);
        assert_eq!(h.prefs.auto_action().map(|c| c.enabled), Some(false));
        assert!(!h.engine.auto_action_state().await.timer_active);

        // Another drain does not fire again.
        let t2 = queued_task(&h.engine, "later").await;
        h.engine.start().await.unwrap();
        h.spawner.exit(&t2.id, 0);
        wait_for(&mut h.events, |e| matches!(e, QueueEvent::QueueDrained)).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.invoker.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_cancels_countdown_and_disarms() {
        let mut h = harness_with(
            FakeSpawner::default(),
            true,
            AutoActionConfig::armed(AutoActionType::Sleep, 5),
        );
        let t = queued_task(&h.engine, "only").await;
        h.engine.start().await.unwrap();
        h.spawner.exit(&t.id, 0);
        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionTick { .. })
        })
        .await;

        queued_task(&h.engine, "new work").await;
        let state = h.engine.auto_action_state().await;
        assert!(!state.timer_active);
        assert_eq!(state.remaining_seconds, 0);
        assert!(!h.engine.auto_action_config().await.is_armed());
        wait_for(&mut h.events, |e| {
            *e == QueueEvent::AutoActionCancelled {
                reason: CancelReason::TaskQueued,
            }
        })
        .await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_notices_tasks_queued_elsewhere() {
        let mut h = harness_with(
            FakeSpawner::default(),
            true,
            AutoActionConfig::armed(AutoActionType::Sleep, 1),
        );
        let t = queued_task(&h.engine, "only").await;
        h.engine.start().await.unwrap();
        h.spawner.exit(&t.id, 0);
        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionArmed { .. })
        })
        .await;

        // Straight to the store, bypassing the engine, as another process would.
        let other = h.engine.store().create(NewTask::prompt("x")).unwrap();
        h.engine
            .store()
            .update(&other.id, TaskPatch::status(TaskStatus::Queued))
            .unwrap();

        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionCancelled { .. })
        })
        .await;
        assert!(h.invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_cancel_and_restart_stop_the_countdown() {
        let mut h = harness_with(
            FakeSpawner::default(),
            true,
            AutoActionConfig::armed(AutoActionType::Sleep, 1),
        );
        let t = queued_task(&h.engine, "only").await;
        h.engine.start().await.unwrap();
        h.spawner.exit(&t.id, 0);
        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionArmed { .. })
        })
        .await;
        assert!(h.engine.cancel_auto_action().await);
        assert!(!h.engine.cancel_auto_action().await);
        assert!(!h.engine.auto_action_config().await.is_armed());

        // Starting an empty queue never arms the countdown.
        h.engine
            .update_auto_action_config(AutoActionConfig::armed(AutoActionType::Sleep, 1))
            .await
            .unwrap();
        assert!(!h.engine.start().await.unwrap().started);
        assert!(!h.engine.auto_action_state().await.timer_active);

        let t2 = queued_task(&h.engine, "again").await;
        assert!(h.engine.start().await.unwrap().started);
        h.spawner.exit(&t2.id, 0);
        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::AutoActionArmed { .. })
        })
        .await;

        h.engine.start().await.unwrap();
        wait_for(&mut h.events, |e| {
            *e == QueueEvent::AutoActionCancelled {
                reason: CancelReason::QueueRestarted,
            }
        })
        .await;
        assert!(!h.engine.auto_action_config().await.is_armed());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_fails_the_running_task_even_on_clean_exit() {
        let mut h = harness();
        let t1 = queued_task(&h.engine, "one").await;
        let t2 = queued_task(&h.engine, "two").await;
        h.engine.start().await.unwrap();

        // The process finishes at the same moment the user hits stop.
        h.spawner.exit(&t1.id, 0);
        assert!(h.engine.stop().await.unwrap());

        let t1 = h.engine.store().get(&t1.id).unwrap();
        assert_eq!(t1.status, TaskStatus::Failed);
        assert_eq!(t1.last_error.as_deref(), Some("stopped by user"));
        let status = h.engine.status().await;
        assert!(!status.is_running);
        assert!(status.current_task_id.is_none());
        // No automatic resume.
        assert_eq!(
            h.engine.store().get(&t2.id).unwrap().status,
            TaskStatus::Queued
        );
        wait_for(&mut h.events, |e| matches!(e, QueueEvent::QueueStopped)).await;

        assert!(!h.engine.stop().await.unwrap());
    }

    #[tokio::test]
    async fn spawn_failures_fail_tasks_and_warn_once() {
        let mut h = harness_with(FakeSpawner::failing(), true, AutoActionConfig::default());
        let t1 = queued_task(&h.engine, "one").await;
        let t2 = queued_task(&h.engine, "two").await;

        let out = h.engine.start().await.unwrap();
        assert!(!out.started);
        for id in [&t1.id, &t2.id] {
            let t = h.engine.store().get(id).unwrap();
            assert_eq!(t.status, TaskStatus::Failed);
            assert!(t.last_error.unwrap().contains("command not found"));
        }

        let mut warnings = 0;
        while let Ok(ev) = h.events.try_recv() {
            if matches!(ev, QueueEvent::SpawnFailed { .. }) {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
        assert!(!h.engine.status().await.is_running);
    }

    #[tokio::test]
    async fn dependencies_gate_selection() {
        let mut h = harness();
        let base = queued_task(&h.engine, "base").await;
        let child = h
            .engine
            .create_task(NewTask {
                depends_on: Some(base.id.clone()),
                ..NewTask::prompt("child")
            })
            .await
            .unwrap();
        // Queue the child ahead of its dependency.
        h.engine.enqueue(&child.id).await.unwrap();
        h.engine
            .reorder(TaskStatus::Queued, &[child.id.clone(), base.id.clone()])
            .await
            .unwrap();
        let free = queued_task(&h.engine, "free").await;

        h.engine.start().await.unwrap();
        assert_eq!(h.spawner.launched(), [base.id.clone()]);

        h.spawner.exit(&base.id, 2);
        let ev = wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::TaskSkipped { .. })
        })
        .await;
        assert_eq!(
            ev,
            QueueEvent::TaskSkipped {
                task_id: child.id.clone(),
                dependency: base.id.clone()
            }
        );
        wait_for(&mut h.events, |e| {
            matches!(e, QueueEvent::TaskStarted { task_id, .. } if *task_id == free.id)
        })
        .await;
        assert_eq!(
            h.engine.store().get(&child.id).unwrap().status,
            TaskStatus::Skipped
        );
    }

    #[tokio::test]
    async fn reconcile_requeues_stranded_task_at_front() {
        let h = harness();
        let a = queued_task(&h.engine, "a").await;
        let stranded = queued_task(&h.engine, "b").await;
        h.engine
            .store()
            .transition(
                &stranded.id,
                TaskStatus::Running,
                TransitionOrigin::Runner,
                Placement::Back,
                |_| {},
            )
            .unwrap();

        let fixed = h.engine.reconcile().await.unwrap();
        assert_eq!(fixed.len(), 1);
        let queue: Vec<String> = h
            .engine
            .store()
            .list_by_status(TaskStatus::Queued)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(queue, [stranded.id.clone(), a.id]);
        let t = h.engine.store().get(&stranded.id).unwrap();
        assert!(t.started_at.is_none());
    }

    #[tokio::test]
    async fn reconcile_can_fail_stranded_tasks() {
        let store = TaskStore::new(Arc::new(MemoryTaskStorage::new()));
        let engine = QueueEngine::builder(store, Arc::new(FakeSpawner::default()))
            .options(EngineOptions {
                stranded_policy: StrandedPolicy::Fail,
                ..EngineOptions::default()
            })
            .build();
        let t = engine.create_task(NewTask::prompt("x")).await.unwrap();
        engine.enqueue(&t.id).await.unwrap();
        engine
            .store()
            .transition(
                &t.id,
                TaskStatus::Running,
                TransitionOrigin::Runner,
                Placement::Back,
                |_| {},
            )
            .unwrap();

        engine.reconcile().await.unwrap();
        let t = engine.store().get(&t.id).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.last_error.is_some());
    }

    #[tokio::test]
    async fn running_task_cannot_be_deleted_or_edited() {
        let h = harness();
        let t = queued_task(&h.engine, "busy").await;
        h.engine.start().await.unwrap();

        assert!(matches!(
            h.engine.delete_task(&t.id).await,
            Err(QueueError::Conflict(_))
        ));
        assert!(matches!(
            h.engine
                .update_task(
                    &t.id,
                    TaskPatch {
                        prompt: Some("changed".to_owned()),
                        ..TaskPatch::default()
                    }
                )
                .await,
            Err(QueueError::Conflict(_))
        ));
        assert!(matches!(
            h.engine.dequeue(&t.id).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_an_agent_that_will_not_exit() {
        let (engine, spawner) = stubborn_engine(Duration::from_secs(3));
        let stuck = queued_task(&engine, "stuck").await;
        let next = queued_task(&engine, "next").await;
        engine.start().await.unwrap();

        // Both callers wait on the same agent; neither walks away early.
        let (first, second) = tokio::join!(engine.stop(), engine.stop());
        assert!(first.unwrap());
        assert!(second.unwrap());

        assert_eq!(spawner.dropped(), 1);
        let stuck = engine.store().get(&stuck.id).unwrap();
        assert_eq!(stuck.status, TaskStatus::Failed);
        assert!(
            stuck
                .last_error
                .unwrap()
                .contains("did not exit within 3s")
        );
        assert_eq!(
            engine.store().get(&next.id).unwrap().status,
            TaskStatus::Queued
        );
        assert!(engine.is_idle().await);
        assert_single_running(&engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_a_stop_is_in_flight_reports_not_started() {
        let (engine, spawner) = stubborn_engine(Duration::from_secs(5));
        let stuck = queued_task(&engine, "stuck").await;
        let next = queued_task(&engine, "next").await;
        engine.start().await.unwrap();

        let stopping = tokio::spawn({
            let engine = engine.clone();
            async move { engine.stop().await }
        });
        while engine.status().await.is_running {
            tokio::task::yield_now().await;
        }

        let out = engine.start().await.unwrap();
        assert!(!out.started);
        assert_eq!(spawner.launched(), [stuck.id.clone()]);

        assert!(stopping.await.unwrap().unwrap());
        assert_eq!(
            engine.store().get(&next.id).unwrap().status,
            TaskStatus::Queued
        );
        assert!(engine.start().await.unwrap().started);
        assert_eq!(spawner.launched(), [stuck.id, next.id]);
    }

    #[tokio::test]
    async fn failed_result_write_keeps_the_task_until_it_lands() {
        let mem = Arc::new(MemoryTaskStorage::new());
        let spawner = Arc::new(FakeSpawner::default());
        let engine = QueueEngine::builder(TaskStore::new(mem.clone()), spawner.clone())
            .terminal_policy(headless_policy())
            .build();
        let mut events = engine.subscribe();
        let first = queued_task(&engine, "first").await;
        let second = queued_task(&engine, "second").await;
        engine.start().await.unwrap();

        mem.set_fail_writes(true);
        spawner.exit(&first.id, 0);
        let ev = wait_for(&mut events, |e| {
            matches!(e, QueueEvent::PersistenceFailed { .. })
        })
        .await;
        assert!(matches!(ev, QueueEvent::PersistenceFailed { ref task_id, .. } if *task_id == first.id));

        // Still owned: the store says running and so does the runner.
        let status = engine.status().await;
        assert!(!status.is_running);
        assert_eq!(status.current_task_id.as_deref(), Some(first.id.as_str()));
        assert_single_running(&engine).await;
        assert!(!engine.is_idle().await);
        assert!(engine.settle_pending().await.is_err());
        assert!(matches!(
            engine.start().await,
            Err(QueueError::Persistence { .. })
        ));
        assert_eq!(spawner.launched(), [first.id.clone()]);

        mem.set_fail_writes(false);
        assert!(engine.start().await.unwrap().started);
        let first = engine.store().get(&first.id).unwrap();
        assert_eq!(first.status, TaskStatus::Completed);
        assert_eq!(first.exit_code, Some(0));
        assert_eq!(
            engine.status().await.current_task_id.as_deref(),
            Some(second.id.as_str())
        );
        assert_single_running(&engine).await;
    }
}
