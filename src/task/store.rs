#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::sync::Arc;

use crate::error::QueueError;
use crate::task::model::{NewTask, Task, TaskPatch, TaskStatus, now_rfc3339};
use crate::task::state::TransitionOrigin;
use crate::task::storage::TaskPersistence;

/// Where a task lands inside its new status partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    None,
    Satisfied,
    Pending,
    Failed,
}

/// Task records and their per-status ordering.
///
/// Every call re-reads the persistence layer, so a failed write never leaves a
/// stale in-memory view behind. `sort_order` is renumbered densely from zero in
/// every partition a mutation touches.
///
/// Mutations hold an exclusive lock on the storage's lock file from the first
/// read to the last write, so a CLI process and a running queue never write back
/// each other's stale snapshots.
#[derive(Clone)]
pub struct TaskStore {
    persistence: Arc<dyn TaskPersistence>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore").finish_non_exhaustive()
    }
}

impl TaskStore {
    #[must_use]
    pub fn new(persistence: Arc<dyn TaskPersistence>) -> Self {
        Self { persistence }
    }

    /// Runs `op` while holding the cross-process mutation lock, if the
    /// persistence layer has one.
    fn exclusive<T>(&self, op: impl FnOnce() -> Result<T, QueueError>) -> Result<T, QueueError> {
        let Some(path) = self.persistence.lock_path() else {
            return op();
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::persistence(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| QueueError::persistence(&path, e))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock.write().map_err(|e| QueueError::persistence(&path, e))?;
        op()
    }

    pub fn create(&self, new: NewTask) -> Result<Task, QueueError> {
        self.exclusive(|| self.create_unlocked(new))
    }

    fn create_unlocked(&self, new: NewTask) -> Result<Task, QueueError> {
        if new.prompt.trim().is_empty() {
            return Err(QueueError::Validation("prompt must not be empty".to_owned()));
        }
        validate_limits(new.max_budget_usd, new.max_turns)?;

        let all = self.list_all()?;
        let id = loop {
            let id = Task::new_id();
            if !all.iter().any(|t| t.id == id) {
                break id;
            }
        };
        if let Some(dep) = new.depends_on.as_deref() {
            validate_dependency(&all, &id, dep)?;
        }

        let sort_order = partition(&all, TaskStatus::Backlog)
            .last()
            .map_or(0, |t| t.sort_order + 1);

        let task = Task {
            id,
            prompt: new.prompt,
            project_path: non_empty(new.project_path),
            system_prompt: non_empty(new.system_prompt),
            allowed_tools: new.allowed_tools,
            max_budget_usd: new.max_budget_usd,
            max_turns: new.max_turns,
            notes: non_empty(new.notes),
            status: TaskStatus::Backlog,
            priority: new.priority,
            sort_order,
            depends_on: non_empty(new.depends_on),
            exit_code: None,
            output: None,
            tokens: None,
            cost_usd: None,
            last_error: None,
            execution_id: None,
            created_at: now_rfc3339(),
            started_at: None,
            completed_at: None,
        };
        self.persistence.save(&task)?;
        tracing::debug!(task_id = %task.id, sort_order, "task created");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task, QueueError> {
        self.persistence
            .load(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_owned()))
    }

    pub fn list_all(&self) -> Result<Vec<Task>, QueueError> {
        self.persistence.list()
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, QueueError> {
        Ok(partition(&self.list_all()?, status))
    }

    /// Tasks that keep the queue from counting as drained.
    pub fn count_active(&self) -> Result<usize, QueueError> {
        Ok(self
            .list_all()?
            .iter()
            .filter(|t| t.status.is_active())
            .count())
    }

    pub fn running(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.list_by_status(TaskStatus::Running)?.into_iter().next())
    }

    /// User-facing partial update.
    pub fn update(&self, id: &str, patch: TaskPatch) -> Result<Task, QueueError> {
        self.exclusive(|| self.update_unlocked(id, &patch))
    }

    fn update_unlocked(&self, id: &str, patch: &TaskPatch) -> Result<Task, QueueError> {
        let all = self.list_all()?;
        let current = find(&all, id)?.clone();
        let target = patch.status.filter(|s| *s != current.status);

        if current.status.is_terminal() || current.status == TaskStatus::Running {
            if let Some(to) = target {
                return Err(QueueError::InvalidTransition {
                    id: id.to_owned(),
                    from: current.status,
                    to,
                });
            }
            if patch.has_content_changes() {
                return Err(QueueError::Conflict(format!(
                    "task {id} is {}; it can no longer be edited",
                    current.status
                )));
            }
            return Ok(current);
        }

        if let Some(to) = target
            && !current.status.can_transition(to, TransitionOrigin::User)
        {
            return Err(QueueError::InvalidTransition {
                id: id.to_owned(),
                from: current.status,
                to,
            });
        }

        let mut edited = current.clone();
        apply_patch(&mut edited, patch, &all)?;

        match target {
            Some(to) => self.commit_move(all, edited, to, Placement::Back),
            None => {
                self.persistence.save(&edited)?;
                Ok(edited)
            }
        }
    }

    /// Status change on behalf of the runner or reconciliation. `edit` runs on the
    /// task before it is written, so results land in the same write as the status.
    pub(crate) fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        origin: TransitionOrigin,
        placement: Placement,
        edit: impl FnOnce(&mut Task),
    ) -> Result<Task, QueueError> {
        self.exclusive(|| self.transition_unlocked(id, to, origin, placement, edit))
    }

    fn transition_unlocked(
        &self,
        id: &str,
        to: TaskStatus,
        origin: TransitionOrigin,
        placement: Placement,
        edit: impl FnOnce(&mut Task),
    ) -> Result<Task, QueueError> {
        let all = self.list_all()?;
        let current = find(&all, id)?.clone();
        if !current.status.can_transition(to, origin) {
            return Err(QueueError::InvalidTransition {
                id: id.to_owned(),
                from: current.status,
                to,
            });
        }
        if to == TaskStatus::Running
            && let Some(other) = all.iter().find(|t| t.status == TaskStatus::Running)
        {
            return Err(QueueError::Conflict(format!(
                "task {} is already running",
                other.id
            )));
        }
        let mut edited = current;
        edit(&mut edited);
        self.commit_move(all, edited, to, placement)
    }

    pub fn delete(&self, id: &str) -> Result<Task, QueueError> {
        self.exclusive(|| self.delete_unlocked(id))
    }

    fn delete_unlocked(&self, id: &str) -> Result<Task, QueueError> {
        let all = self.list_all()?;
        let task = find(&all, id)?.clone();
        if !task.status.is_deletable() {
            return Err(QueueError::Conflict(format!(
                "task {id} is running; stop the queue before deleting it"
            )));
        }

        let mut changed: Vec<Task> = renumber(
            all.iter()
                .filter(|t| t.status == task.status && t.id != task.id)
                .cloned()
                .collect(),
        );
        for t in &all {
            if t.id != task.id && t.depends_on.as_deref() == Some(id) {
                let mut t = changed
                    .iter()
                    .position(|c| c.id == t.id)
                    .map_or_else(|| t.clone(), |i| changed.remove(i));
                tracing::debug!(task_id = %t.id, dependency = %id, "dropping dependency on deleted task");
                t.depends_on = None;
                changed.push(t);
            }
        }

        self.persistence.delete(id)?;
        self.persistence.save_all(&changed)?;
        Ok(task)
    }

    /// Rewrites the order of one partition. `ids` must be exactly its current members.
    pub fn reorder(&self, status: TaskStatus, ids: &[String]) -> Result<Vec<Task>, QueueError> {
        self.exclusive(|| self.reorder_unlocked(status, ids))
    }

    fn reorder_unlocked(&self, status: TaskStatus, ids: &[String]) -> Result<Vec<Task>, QueueError> {
        let members = self.list_by_status(status)?;
        let unique: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        if unique.len() != ids.len() {
            return Err(QueueError::Validation(
                "reorder list contains duplicate ids".to_owned(),
            ));
        }
        let current: BTreeSet<&str> = members.iter().map(|t| t.id.as_str()).collect();
        if unique != current {
            return Err(QueueError::Validation(format!(
                "reorder list must contain exactly the {} {status} tasks",
                current.len()
            )));
        }

        let mut by_id: BTreeMap<&str, Task> =
            members.iter().map(|t| (t.id.as_str(), t.clone())).collect();
        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = by_id.remove(id.as_str()) {
                ordered.push(task);
            }
        }
        let ordered = renumber(ordered);
        self.persistence.save_all(&ordered)?;
        Ok(ordered)
    }

    fn commit_move(
        &self,
        all: Vec<Task>,
        mut task: Task,
        to: TaskStatus,
        placement: Placement,
    ) -> Result<Task, QueueError> {
        let from = task.status;
        apply_status_side_effects(&mut task, to);

        let mut writes = renumber(
            all.iter()
                .filter(|t| t.status == from && t.id != task.id)
                .cloned()
                .collect(),
        );

        let mut dest: Vec<Task> = all
            .iter()
            .filter(|t| t.status == to && t.id != task.id)
            .cloned()
            .collect();
        dest.sort_by(order_key);
        match placement {
            Placement::Front => dest.insert(0, task.clone()),
            Placement::Back => dest.push(task.clone()),
        }
        writes.extend(renumber(dest));

        self.persistence.save_all(&writes)?;
        let moved = writes
            .into_iter()
            .find(|t| t.id == task.id)
            .unwrap_or(task);
        tracing::debug!(task_id = %moved.id, %from, %to, sort_order = moved.sort_order, "task moved");
        Ok(moved)
    }
}

pub(crate) fn dependency_state(all: &[Task], task: &Task) -> DependencyState {
    let Some(dep) = task.depends_on.as_deref() else {
        return DependencyState::None;
    };
    match all.iter().find(|t| t.id == dep).map(|t| t.status) {
        Some(TaskStatus::Completed) => DependencyState::Satisfied,
        Some(TaskStatus::Failed | TaskStatus::Skipped) => DependencyState::Failed,
        _ => DependencyState::Pending,
    }
}

fn partition(all: &[Task], status: TaskStatus) -> Vec<Task> {
    let mut out: Vec<Task> = all.iter().filter(|t| t.status == status).cloned().collect();
    out.sort_by(order_key);
    out
}

fn order_key(a: &Task, b: &Task) -> std::cmp::Ordering {
    a.sort_order
        .cmp(&b.sort_order)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn renumber(mut tasks: Vec<Task>) -> Vec<Task> {
    for (i, task) in tasks.iter_mut().enumerate() {
        task.sort_order = u32::try_from(i).unwrap_or(u32::MAX);
    }
    tasks
}

fn find<'a>(all: &'a [Task], id: &str) -> Result<&'a Task, QueueError> {
    all.iter()
        .find(|t| t.id == id)
        .ok_or_else(|| QueueError::NotFound(id.to_owned()))
}

fn apply_status_side_effects(task: &mut Task, to: TaskStatus) {
    match to {
        TaskStatus::Running => {
            if task.started_at.is_none() {
                task.started_at = Some(now_rfc3339());
            }
            task.completed_at = None;
        }
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped => {
            task.completed_at = Some(now_rfc3339());
        }
        TaskStatus::Backlog | TaskStatus::Queued => {
            task.completed_at = None;
        }
    }
    task.status = to;
}

fn apply_patch(task: &mut Task, patch: &TaskPatch, all: &[Task]) -> Result<(), QueueError> {
    if let Some(prompt) = &patch.prompt {
        if prompt.trim().is_empty() {
            return Err(QueueError::Validation("prompt must not be empty".to_owned()));
        }
        task.prompt.clone_from(prompt);
    }
    let budget = patch.max_budget_usd.unwrap_or(task.max_budget_usd);
    let turns = patch.max_turns.unwrap_or(task.max_turns);
    validate_limits(budget, turns)?;

    if let Some(Some(dep)) = &patch.depends_on {
        validate_dependency(all, &task.id, dep)?;
    }

    if let Some(v) = &patch.project_path {
        task.project_path = non_empty(v.clone());
    }
    if let Some(v) = &patch.system_prompt {
        task.system_prompt = non_empty(v.clone());
    }
    if let Some(v) = &patch.allowed_tools {
        task.allowed_tools.clone_from(v);
    }
    if let Some(v) = &patch.notes {
        task.notes = non_empty(v.clone());
    }
    if let Some(v) = &patch.depends_on {
        task.depends_on = non_empty(v.clone());
    }
    if let Some(p) = patch.priority {
        task.priority = p;
    }
    task.max_budget_usd = budget;
    task.max_turns = turns;
    Ok(())
}

fn validate_limits(budget: Option<f64>, turns: Option<u32>) -> Result<(), QueueError> {
    if let Some(b) = budget
        && !(b.is_finite() && b > 0.0)
    {
        return Err(QueueError::Validation(format!(
            "budget cap must be a positive amount, got {b}"
        )));
    }
    if turns == Some(0) {
        return Err(QueueError::Validation(
            "turn cap must be at least 1".to_owned(),
        ));
    }
    Ok(())
}

fn validate_dependency(all: &[Task], id: &str, dep: &str) -> Result<(), QueueError> {
    if dep == id {
        return Err(QueueError::Validation(format!(
            "task {id} cannot depend on itself"
        )));
    }
    if !all.iter().any(|t| t.id == dep) {
        return Err(QueueError::Validation(format!(
            "dependency {dep} does not exist"
        )));
    }
    // Walk the chain from the new dependency; reaching `id` would close a cycle.
    let mut seen = BTreeSet::new();
    let mut cur = Some(dep.to_owned());
    while let Some(next) = cur {
        if next == id {
            return Err(QueueError::Validation(format!(
                "depending on {dep} would create a cycle"
            )));
        }
        if !seen.insert(next.clone()) {
            break;
        }
        cur = all
            .iter()
            .find(|t| t.id == next)
            .and_then(|t| t.depends_on.clone());
    }
    Ok(())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::Priority;
    use crate::task::storage::{FileTaskStorage, MemoryTaskStorage};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::thread::JoinHandle;
    use std::time::Duration;

    fn store() -> (TaskStore, Arc<MemoryTaskStorage>) {
        let mem = Arc::new(MemoryTaskStorage::new());
        (TaskStore::new(mem.clone()), mem)
    }

    fn orders(store: &TaskStore, status: TaskStatus) -> Vec<(String, u32)> {
        store
            .list_by_status(status)
            .unwrap()
            .into_iter()
            .map(|t| (t.id, t.sort_order))
            .collect()
    }

    fn assert_dense(store: &TaskStore) {
        for status in TaskStatus::ALL {
            let orders: Vec<u32> = store
                .list_by_status(status)
                .unwrap()
                .iter()
                .map(|t| t.sort_order)
                .collect();
            let expected: Vec<u32> = (0..u32::try_from(orders.len()).unwrap()).collect();
            assert_eq!(orders, expected, "{status} partition is not dense");
        }
    }

    #[test]
    fn create_appends_to_backlog() {
        let (store, _) = store();
        let a = store.create(NewTask::prompt("first")).unwrap();
        let b = store
            .create(NewTask {
                priority: Priority::High,
                notes: Some("  ".to_owned()),
                ..NewTask::prompt("second")
            })
            .unwrap();
        assert_eq!(a.status, TaskStatus::Backlog);
        assert_eq!((a.sort_order, b.sort_order), (0, 1));
        assert_eq!(b.priority, Priority::High);
        assert!(b.notes.is_none());
    }

    #[test]
    fn create_rejects_empty_prompt_without_writing() {
        let (store, mem) = store();
        let err = store.create(NewTask::prompt("   ")).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(mem.list().unwrap().is_empty());
    }

    #[test]
    fn enqueue_and_dequeue_keep_partitions_dense() {
        let (store, _) = store();
        let ids: Vec<String> = (0..4)
            .map(|i| store.create(NewTask::prompt(format!("t{i}"))).unwrap().id)
            .collect();

        store
            .update(&ids[1], TaskPatch::status(TaskStatus::Queued))
            .unwrap();
        store
            .update(&ids[3], TaskPatch::status(TaskStatus::Queued))
            .unwrap();
        assert_eq!(
            orders(&store, TaskStatus::Queued),
            [(ids[1].clone(), 0), (ids[3].clone(), 1)]
        );
        assert_eq!(
            orders(&store, TaskStatus::Backlog),
            [(ids[0].clone(), 0), (ids[2].clone(), 1)]
        );

        store
            .update(&ids[1], TaskPatch::status(TaskStatus::Backlog))
            .unwrap();
        assert_eq!(orders(&store, TaskStatus::Queued), [(ids[3].clone(), 0)]);
        assert_eq!(
            orders(&store, TaskStatus::Backlog).last().unwrap(),
            &(ids[1].clone(), 2)
        );
        assert_dense(&store);
    }

    #[test]
    fn update_rejects_illegal_transitions() {
        let (store, _) = store();
        let t = store.create(NewTask::prompt("x")).unwrap();
        let err = store
            .update(&t.id, TaskPatch::status(TaskStatus::Running))
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskStatus::Backlog,
                to: TaskStatus::Running,
                ..
            }
        ));
        assert!(matches!(
            store.update("nope", TaskPatch::default()),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn terminal_tasks_are_frozen() {
        let (store, _) = store();
        let t = store.create(NewTask::prompt("x")).unwrap();
        store
            .update(&t.id, TaskPatch::status(TaskStatus::Queued))
            .unwrap();
        store
            .transition(&t.id, TaskStatus::Running, TransitionOrigin::Runner, Placement::Back, |_| {})
            .unwrap();
        let done = store
            .transition(&t.id, TaskStatus::Completed, TransitionOrigin::Runner, Placement::Back, |t| {
                t.exit_code = Some(0);
            })
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(done.started_at.is_some());

        let err = store
            .update(&t.id, TaskPatch::status(TaskStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        let err = store
            .update(
                &t.id,
                TaskPatch {
                    prompt: Some("new".to_owned()),
                    ..TaskPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
        store.delete(&t.id).unwrap();
    }

    #[test]
    fn only_one_task_may_run() {
        let (store, _) = store();
        let a = store.create(NewTask::prompt("a")).unwrap();
        let b = store.create(NewTask::prompt("b")).unwrap();
        for id in [&a.id, &b.id] {
            store
                .update(id, TaskPatch::status(TaskStatus::Queued))
                .unwrap();
        }
        store
            .transition(&a.id, TaskStatus::Running, TransitionOrigin::Runner, Placement::Back, |_| {})
            .unwrap();
        let err = store
            .transition(&b.id, TaskStatus::Running, TransitionOrigin::Runner, Placement::Back, |_| {})
            .unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
        assert!(matches!(store.delete(&a.id), Err(QueueError::Conflict(_))));
    }

    #[test]
    fn reorder_round_trips_and_validates_membership() {
        let (store, _) = store();
        let ids: Vec<String> = (0..3)
            .map(|i| store.create(NewTask::prompt(format!("t{i}"))).unwrap().id)
            .collect();
        let wanted = vec![ids[2].clone(), ids[0].clone(), ids[1].clone()];
        store.reorder(TaskStatus::Backlog, &wanted).unwrap();
        let listed: Vec<String> = store
            .list_by_status(TaskStatus::Backlog)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(listed, wanted);

        let missing = vec![ids[0].clone(), ids[1].clone()];
        assert!(matches!(
            store.reorder(TaskStatus::Backlog, &missing),
            Err(QueueError::Validation(_))
        ));
        let dup = vec![ids[0].clone(), ids[0].clone(), ids[1].clone()];
        assert!(matches!(
            store.reorder(TaskStatus::Backlog, &dup),
            Err(QueueError::Validation(_))
        ));
        let listed_after: Vec<String> = store
            .list_by_status(TaskStatus::Backlog)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(listed_after, wanted);
    }

    #[test]
    fn delete_renumbers_and_clears_dependents() {
        let (store, _) = store();
        let a = store.create(NewTask::prompt("a")).unwrap();
        let b = store.create(NewTask::prompt("b")).unwrap();
        let c = store
            .create(NewTask {
                depends_on: Some(a.id.clone()),
                ..NewTask::prompt("c")
            })
            .unwrap();
        store.delete(&a.id).unwrap();
        assert_eq!(
            orders(&store, TaskStatus::Backlog),
            [(b.id.clone(), 0), (c.id.clone(), 1)]
        );
        assert!(store.get(&c.id).unwrap().depends_on.is_none());
        assert_dense(&store);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let (store, _) = store();
        let a = store.create(NewTask::prompt("a")).unwrap();
        let b = store
            .create(NewTask {
                depends_on: Some(a.id.clone()),
                ..NewTask::prompt("b")
            })
            .unwrap();
        let err = store
            .update(
                &a.id,
                TaskPatch {
                    depends_on: Some(Some(b.id.clone())),
                    ..TaskPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(matches!(
            store.create(NewTask {
                depends_on: Some("ghost".to_owned()),
                ..NewTask::prompt("c")
            }),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn persistence_failure_is_surfaced() {
        let (store, mem) = store();
        let a = store.create(NewTask::prompt("a")).unwrap();
        mem.set_fail_writes(true);
        let err = store
            .update(&a.id, TaskPatch::status(TaskStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, QueueError::Persistence { .. }));
        mem.set_fail_writes(false);
        assert_eq!(store.get(&a.id).unwrap().status, TaskStatus::Backlog);
    }

    #[test]
    fn front_placement_requeues_ahead_of_others() {
        let (store, _) = store();
        let a = store.create(NewTask::prompt("a")).unwrap();
        let b = store.create(NewTask::prompt("b")).unwrap();
        for id in [&a.id, &b.id] {
            store
                .update(id, TaskPatch::status(TaskStatus::Queued))
                .unwrap();
        }
        store
            .transition(&b.id, TaskStatus::Running, TransitionOrigin::Runner, Placement::Back, |_| {})
            .unwrap();
        store
            .transition(
                &b.id,
                TaskStatus::Queued,
                TransitionOrigin::Reconciliation,
                Placement::Front,
                |t| t.started_at = None,
            )
            .unwrap();
        assert_eq!(
            orders(&store, TaskStatus::Queued),
            [(b.id.clone(), 0), (a.id.clone(), 1)]
        );
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// File storage that runs `hook` once, right after the first full listing.
    struct HookedStorage {
        inner: FileTaskStorage,
        hook: Mutex<Option<Hook>>,
    }

    impl TaskPersistence for HookedStorage {
        fn save(&self, task: &Task) -> Result<(), QueueError> {
            self.inner.save(task)
        }
        fn save_all(&self, tasks: &[Task]) -> Result<(), QueueError> {
            self.inner.save_all(tasks)
        }
        fn load(&self, id: &str) -> Result<Option<Task>, QueueError> {
            self.inner.load(id)
        }
        fn list(&self) -> Result<Vec<Task>, QueueError> {
            let tasks = self.inner.list()?;
            if let Some(hook) = self.hook.lock().unwrap().take() {
                hook();
            }
            Ok(tasks)
        }
        fn delete(&self, id: &str) -> Result<(), QueueError> {
            self.inner.delete(id)
        }
        fn lock_path(&self) -> Option<PathBuf> {
            self.inner.lock_path()
        }
    }

    #[test]
    fn concurrent_stores_on_one_directory_do_not_lose_writes() {
        let td = tempfile::tempdir().unwrap();
        let dir = td.path().join("tasks");
        let runner = TaskStore::new(Arc::new(FileTaskStorage::new(dir.clone())));
        let a = runner.create(NewTask::prompt("a")).unwrap();
        let b = runner.create(NewTask::prompt("b")).unwrap();
        for id in [&a.id, &b.id] {
            runner
                .update(id, TaskPatch::status(TaskStatus::Queued))
                .unwrap();
        }

        // While the CLI-side store holds its snapshot, the runner starts `a`.
        let started: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();
        let slot = started.clone();
        let a_id = a.id.clone();
        let hook: Hook = Box::new(move || {
            let handle = std::thread::spawn(move || {
                runner
                    .transition(&a_id, TaskStatus::Running, TransitionOrigin::Runner, Placement::Back, |_| {})
                    .unwrap();
            });
            *slot.lock().unwrap() = Some(handle);
            std::thread::sleep(Duration::from_millis(200));
        });
        let cli = TaskStore::new(Arc::new(HookedStorage {
            inner: FileTaskStorage::new(dir.clone()),
            hook: Mutex::new(Some(hook)),
        }));

        cli.reorder(TaskStatus::Queued, &[b.id.clone(), a.id.clone()])
            .unwrap();
        started.lock().unwrap().take().unwrap().join().unwrap();

        let check = TaskStore::new(Arc::new(FileTaskStorage::new(dir)));
        assert_eq!(check.get(&a.id).unwrap().status, TaskStatus::Running);
        assert_eq!(orders(&check, TaskStatus::Queued), [(b.id.clone(), 0)]);
        assert_dense(&check);
    }
}
