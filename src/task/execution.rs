#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::model::now_rfc3339;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// One attempt at running a task. A task re-run after reconciliation gets a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub task_id: String,
    #[serde(default)]
    pub prompt: String,
    pub launch_mode: String,
    pub working_directory: String,
    pub status: ExecutionStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionManager {
    base: PathBuf,
}

impl ExecutionManager {
    #[must_use]
    pub fn new(queue_dir: PathBuf) -> Self {
        Self { base: queue_dir }
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.log_dir().join("metadata")
    }

    #[must_use]
    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.log_dir().join(format!("{execution_id}.jsonl"))
    }

    #[must_use]
    pub fn metadata_path(&self, execution_id: &str) -> PathBuf {
        self.metadata_dir().join(format!("{execution_id}.json"))
    }

    /// Scratch directory for wrapper scripts and exit markers of one attempt.
    #[must_use]
    pub fn run_dir(&self, execution_id: &str) -> PathBuf {
        self.base.join("run").join(execution_id)
    }

    #[must_use]
    pub fn new_execution_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        let short: String = id.chars().take(6).collect();
        format!("exec-{short}")
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.metadata_dir())
            .with_context(|| format!("failed to create {}", self.metadata_dir().display()))?;
        std::fs::create_dir_all(self.log_dir())
            .with_context(|| format!("failed to create {}", self.log_dir().display()))?;
        Ok(())
    }

    pub fn save_record(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        self.ensure_dirs()?;
        let path = self.metadata_path(&record.execution_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn load_record(&self, execution_id: &str) -> anyhow::Result<ExecutionRecord> {
        let path = self.metadata_path(execution_id);
        let data =
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Newest first.
    pub fn list_records(&self) -> anyhow::Result<Vec<ExecutionRecord>> {
        let dir = self.metadata_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records: Vec<ExecutionRecord> = Vec::new();
        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_slice(&data) else {
                continue;
            };
            records.push(record);
        }

        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(records)
    }

    pub async fn open_log(&self, execution_id: &str) -> anyhow::Result<tokio::fs::File> {
        let path = self.log_path(execution_id);
        self.ensure_dirs()?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))
    }

    pub fn read_log_string(&self, execution_id: &str) -> anyhow::Result<String> {
        let path = self.log_path(execution_id);
        std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    pub fn delete_execution(&self, execution_id: &str) {
        let _ = std::fs::remove_file(self.log_path(execution_id));
        let _ = std::fs::remove_file(self.metadata_path(execution_id));
        let _ = std::fs::remove_dir_all(self.run_dir(execution_id));
    }

    /// Removes finished executions that started before `cutoff`. Returns how many were removed.
    pub fn cleanup_older_than(&self, cutoff: time::OffsetDateTime) -> anyhow::Result<usize> {
        let mut removed = 0;
        for record in self.list_records()? {
            if record.status == ExecutionStatus::Running {
                continue;
            }
            let start = time::OffsetDateTime::parse(
                &record.start_time,
                &time::format_description::well_known::Rfc3339,
            )
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            if start < cutoff {
                self.delete_execution(&record.execution_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn cleanup_retention(&self, retention_days: u64) -> anyhow::Result<usize> {
        const MAX_DAYS: i64 = i64::MAX / 86_400;
        let retention_days = i64::try_from(retention_days)
            .unwrap_or(MAX_DAYS)
            .min(MAX_DAYS);
        let cutoff = time::OffsetDateTime::now_utc() - time::Duration::days(retention_days);
        self.cleanup_older_than(cutoff)
    }
}

#[derive(Debug, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub execution_id: String,
    pub task_id: String,
    pub stream: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

#[must_use]
pub fn build_log_entry(execution_id: &str, task_id: &str, stream: &str, line: &str) -> LogEntry {
    let payload: serde_json::Value = match serde_json::from_str(line) {
        Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        _ => serde_json::json!({
            "type": "text",
            "text": line,
        }),
    };

    LogEntry {
        timestamp: now_rfc3339(),
        execution_id: execution_id.to_owned(),
        task_id: task_id.to_owned(),
        stream: stream.to_owned(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, start: &str, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.to_owned(),
            task_id: "t1".to_owned(),
            prompt: "p".to_owned(),
            launch_mode: "headless".to_owned(),
            working_directory: "/tmp".to_owned(),
            status,
            start_time: start.to_owned(),
            end_time: None,
            exit_code: None,
            tokens: None,
            cost_usd: None,
            error: None,
        }
    }

    #[test]
    fn records_are_listed_newest_first_and_cleaned_by_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = ExecutionManager::new(dir.path().to_path_buf());
        mgr.save_record(&record("exec-old", "2020-01-01T00:00:00Z", ExecutionStatus::Completed))
            .unwrap();
        mgr.save_record(&record("exec-live", "2020-01-02T00:00:00Z", ExecutionStatus::Running))
            .unwrap();
        mgr.save_record(&record("exec-new", &now_rfc3339(), ExecutionStatus::Failed))
            .unwrap();

        let ids: Vec<String> = mgr
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.execution_id)
            .collect();
        assert_eq!(ids, ["exec-new", "exec-live", "exec-old"]);

        assert_eq!(mgr.cleanup_retention(30).unwrap(), 1);
        assert!(mgr.load_record("exec-old").is_err());
        assert!(mgr.load_record("exec-live").is_ok());
    }

    #[test]
    fn log_entries_wrap_plain_text_and_flatten_json() {
        let entry = build_log_entry("e", "t", "stdout", r#"{"type":"result","total_cost_usd":0.5}"#);
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], "result");
        assert_eq!(v["stream"], "stdout");

        let entry = build_log_entry("e", "t", "stderr", "plain words");
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["text"], "plain words");
    }
}
