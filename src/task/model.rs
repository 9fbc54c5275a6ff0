#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Backlog,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [Self; 6] = [
        Self::Backlog,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "queued" | "queue" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" | "done" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub fn icon(self) -> &'static str {
        match self {
            Self::Backlog => "○",
            Self::Queued => "⏳",
            Self::Running => "●",
            Self::Completed => "✓",
            Self::Failed => "✗",
            Self::Skipped => "↷",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,

    pub status: TaskStatus,
    pub priority: Priority,
    pub sort_order: u32,
    #[serde(default)]
    pub depends_on: Option<String>,

    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,

    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Task {
    #[must_use]
    pub fn new_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        id.chars().take(8).collect()
    }

    /// Short label for tables and log lines.
    #[must_use]
    pub fn title(&self, max: usize) -> String {
        let line = self.prompt.lines().next().unwrap_or_default().trim();
        let mut out: String = line.chars().take(max).collect();
        if line.chars().count() > max {
            out.push_str("...");
        }
        out
    }

    pub(crate) fn clear_results(&mut self) {
        self.exit_code = None;
        self.output = None;
        self.tokens = None;
        self.cost_usd = None;
        self.last_error = None;
        self.execution_id = None;
    }
}

/// Input for `TaskStore::create`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub prompt: String,
    pub project_path: Option<String>,
    pub priority: Priority,
    pub notes: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_budget_usd: Option<f64>,
    pub max_turns: Option<u32>,
    pub depends_on: Option<String>,
}

impl NewTask {
    #[must_use]
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Partial update. `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub prompt: Option<String>,
    pub project_path: Option<Option<String>>,
    pub system_prompt: Option<Option<String>>,
    pub allowed_tools: Option<Vec<String>>,
    pub max_budget_usd: Option<Option<f64>>,
    pub max_turns: Option<Option<u32>>,
    pub notes: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub depends_on: Option<Option<String>>,
    pub status: Option<TaskStatus>,
}

impl TaskPatch {
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_content_changes(&self) -> bool {
        self.prompt.is_some()
            || self.project_path.is_some()
            || self.system_prompt.is_some()
            || self.allowed_tools.is_some()
            || self.max_budget_usd.is_some()
            || self.max_turns.is_some()
            || self.notes.is_some()
            || self.priority.is_some()
            || self.depends_on.is_some()
    }
}

/// Outcome of one agent execution, recorded on the task exactly once per attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub output: String,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("Done"), Some(TaskStatus::Completed));
        assert!(TaskStatus::parse("paused").is_none());
    }

    #[test]
    fn title_truncates_first_line() {
        let task = Task {
            id: "abc".to_owned(),
            prompt: "refactor the parser module\nand add tests".to_owned(),
            project_path: None,
            system_prompt: None,
            allowed_tools: Vec::new(),
            max_budget_usd: None,
            max_turns: None,
            notes: None,
            status: TaskStatus::Backlog,
            priority: Priority::High,
            sort_order: 0,
            depends_on: None,
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
        assert_eq!(task.title(8), "refactor...");
        assert_eq!(task.title(80), "refactor the parser module");
    }

    #[test]
    fn legacy_records_without_optional_fields_deserialize() {
        let raw = r#"{
            "id": "t1",
            "prompt": "hi",
            "status": "queued",
            "priority": "low",
            "sort_order": 3,
            "created_at": "2024-01-01T00:00:00Z",
            "started_at": null,
            "completed_at": null
        }"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.allowed_tools.is_empty());
        assert!(task.depends_on.is_none());
    }
}
