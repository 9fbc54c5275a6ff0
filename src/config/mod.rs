#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::task::auto_action::{AutoActionConfig, AutoActionType};
use crate::task::launch::{TerminalChoice, TerminalMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub agent: AgentConfig,
    pub terminal: TerminalConfig,
    pub auto_action: AutoActionSection,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrandedPolicy {
    #[default]
    Requeue,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub dir: String,
    pub poll_interval_ms: u64,
    pub stop_timeout: String,
    pub stop_grace: String,
    pub skip_on_failed_dependency: bool,
    pub stranded_policy: StrandedPolicy,
    pub max_output_kb: u64,
    pub log_retention_days: u64,
    pub auto_cleanup: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: "~/.config/promptq/queue".to_owned(),
            poll_interval_ms: 1000,
            stop_timeout: "30s".to_owned(),
            stop_grace: "5s".to_owned(),
            skip_on_failed_dependency: true,
            stranded_policy: StrandedPolicy::Requeue,
            max_output_kb: 512,
            log_retention_days: 30,
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub executable: String,
    pub extra_args: Vec<String>,
    pub output_format: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_owned(),
            extra_args: Vec::new(),
            output_format: "json".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    pub remembered: bool,
    pub mode: TerminalMode,
    pub custom_command: String,
    pub terminal_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoActionSection {
    pub enabled: bool,
    pub action: AutoActionType,
    pub delay_minutes: u32,
    pub sleep_command: String,
    pub shutdown_command: String,
}

impl Default for AutoActionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            action: AutoActionType::None,
            delay_minutes: 5,
            sleep_command: String::new(),
            shutdown_command: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    if let Some(p) = std::env::var_os("PROMPTQ_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(ConfigPaths {
            config_file: PathBuf::from(p),
        });
    }

    let unix = home_config_path_unix();
    if !cfg!(windows) {
        return Ok(ConfigPaths { config_file: unix });
    }

    // Windows: prefer the Unix-style path if present for portability.
    if unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("dev", "promptq", "promptq")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("promptq").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if input == "~"
        && let Some(home) = home_dir()
    {
        return home.to_string_lossy().to_string();
    }
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

/// Shortens paths under `$HOME` for display.
#[must_use]
pub fn tilde_path(input: &str) -> String {
    let Some(home) = home_dir() else {
        return input.to_owned();
    };
    let home_str = home.to_string_lossy();
    if let Some(rest) = input.strip_prefix(home_str.as_ref()) {
        if rest.is_empty() {
            return "~".to_owned();
        }
        if rest.starts_with(std::path::MAIN_SEPARATOR) {
            return format!("~{rest}");
        }
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

/// Parses `500ms`, `30s`, `5m`, `2h`, `1d`, `1w`. A bare number means seconds.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .with_context(|| format!("invalid duration: {raw}"))?;
    let secs = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(n)),
        "" | "s" => n,
        "m" => n.saturating_mul(60),
        "h" => n.saturating_mul(60 * 60),
        "d" => n.saturating_mul(24 * 60 * 60),
        "w" => n.saturating_mul(7 * 24 * 60 * 60),
        other => anyhow::bail!("invalid duration unit '{other}' in {raw} (use ms|s|m|h|d|w)"),
    };
    Ok(Duration::from_secs(secs))
}

pub fn load() -> anyhow::Result<(Config, toml_edit::DocumentMut, ConfigPaths)> {
    let paths = default_paths()?;
    let (doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, doc, paths))
}

pub fn list_resolved_toml() -> anyhow::Result<String> {
    let (cfg, _doc, _paths) = load()?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    let paths = default_paths()?;
    get_value_string_at_path(&paths.config_file, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = default_paths()?;
    set_value_string_at_path(&paths.config_file, key, value)
}

pub fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let norm = normalize_key(key);
    let value = lookup_value(&cfg, &norm);
    Ok(value.map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    set_values_at_path(path, &[(key, value)])
}

/// Applies several keys in one write; the file is only touched if the result validates.
pub fn set_values_at_path(path: &Path, pairs: &[(&str, &str)]) -> anyhow::Result<()> {
    let (mut doc, _cfg) = load_from_file(path)?;

    for (key, value) in pairs {
        let (norm_key, value_item) = normalize_key_and_parse_value(key, value)?;
        apply_set(&mut doc, &norm_key, value_item)?;
    }

    // Validate by re-parsing the updated doc into a Config.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;

    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queue.dir.trim().is_empty() {
            return Err(QueueError::Config("queue.dir must not be empty".to_owned()));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(QueueError::Config(
                "queue.poll_interval_ms must be >= 1".to_owned(),
            ));
        }
        for (key, raw) in [
            ("queue.stop_timeout", &self.queue.stop_timeout),
            ("queue.stop_grace", &self.queue.stop_grace),
        ] {
            if let Err(e) = parse_duration(raw) {
                return Err(QueueError::InvalidConfigValue {
                    key: key.to_owned(),
                    msg: e.to_string(),
                });
            }
        }
        if self.queue.max_output_kb == 0 {
            return Err(QueueError::Config(
                "queue.max_output_kb must be >= 1".to_owned(),
            ));
        }
        if self.agent.executable.trim().is_empty() {
            return Err(QueueError::Config(
                "agent.executable must not be empty".to_owned(),
            ));
        }
        if self.auto_action.delay_minutes == 0 {
            return Err(QueueError::Config(
                "auto_action.delay_minutes must be >= 1".to_owned(),
            ));
        }
        if self.terminal.remembered
            && self.terminal.mode == TerminalMode::Custom
            && self.terminal.custom_command.trim().is_empty()
        {
            return Err(QueueError::Config(
                "terminal.custom_command is required when terminal.mode = \"custom\"".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn queue_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.queue.dir)
    }

    pub fn stop_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.queue.stop_timeout)
    }

    pub fn stop_grace(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.queue.stop_grace)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    #[must_use]
    pub fn max_output_bytes(&self) -> usize {
        usize::try_from(self.queue.max_output_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    /// The persisted launch choice, if the user asked for it to be remembered.
    #[must_use]
    pub fn remembered_terminal(&self) -> Option<TerminalChoice> {
        if !self.terminal.remembered {
            return None;
        }
        let mut choice = TerminalChoice::new(self.terminal.mode).remember();
        if !self.terminal.custom_command.trim().is_empty() {
            choice = choice.with_command(self.terminal.custom_command.clone());
        }
        Some(choice)
    }

    #[must_use]
    pub fn terminal_template(&self) -> Option<String> {
        non_empty(&self.terminal.terminal_command)
    }

    #[must_use]
    pub fn auto_action_config(&self) -> AutoActionConfig {
        AutoActionConfig {
            enabled: self.auto_action.enabled,
            action_type: self.auto_action.action,
            delay_minutes: self.auto_action.delay_minutes,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    String,
    Duration,
    StringList,
    Enum(&'static [&'static str]),
}

fn normalize_key(key: &str) -> String {
    match key {
        "queue_dir" | "queue.queue_dir" => "queue.dir",
        "claude.executable" | "agent.claude_executable" => "agent.executable",
        "terminal.command" => "terminal.custom_command",
        "auto_action.type" => "auto_action.action",
        "auto_action.delay" => "auto_action.delay_minutes",
        _ => key,
    }
    .to_owned()
}

fn normalize_key_and_parse_value(key: &str, value: &str) -> anyhow::Result<(String, toml_edit::Item)> {
    let norm = normalize_key(key);
    let key_type = key_type(&norm).ok_or_else(|| QueueError::InvalidConfigKey(key.to_owned()))?;
    let invalid = |msg: String| QueueError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let item = match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(invalid)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
        KeyType::Duration => {
            parse_duration(value).map_err(|e| invalid(e.to_string()))?;
            toml_edit::value(value.trim())
        }
        KeyType::StringList => {
            let parts = shlex::split(value)
                .ok_or_else(|| invalid(format!("cannot split '{value}' into arguments")))?;
            let mut arr = toml_edit::Array::new();
            for p in parts {
                arr.push(p);
            }
            toml_edit::value(arr)
        }
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(invalid(format!("must be one of: {}", allowed.join(", "))).into());
            }
            toml_edit::value(v)
        }
    };

    Ok((norm, item))
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "queue.dir"
        | "agent.executable"
        | "agent.output_format"
        | "terminal.custom_command"
        | "terminal.terminal_command"
        | "auto_action.sleep_command"
        | "auto_action.shutdown_command" => KeyType::String,

        "queue.skip_on_failed_dependency"
        | "queue.auto_cleanup"
        | "terminal.remembered"
        | "auto_action.enabled" => KeyType::Bool,

        "queue.poll_interval_ms"
        | "queue.max_output_kb"
        | "queue.log_retention_days"
        | "auto_action.delay_minutes" => KeyType::Int,

        "queue.stop_timeout" | "queue.stop_grace" => KeyType::Duration,

        "agent.extra_args" => KeyType::StringList,

        "queue.stranded_policy" => KeyType::Enum(&["requeue", "fail"]),
        "terminal.mode" => KeyType::Enum(&["headless", "terminal", "custom"]),
        "auto_action.action" => KeyType::Enum(&["none", "sleep", "shutdown"]),

        _ => return None,
    })
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    let n = s
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))?;
    if n < 0 {
        return Err(format!("expected a non-negative integer, got {n}"));
    }
    Ok(n)
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return Err(QueueError::InvalidConfigKey(key.to_owned()).into());
    }

    let mut cur = doc.as_table_mut();
    for seg in &parts[..parts.len().saturating_sub(1)] {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            QueueError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }

    let leaf = parts[parts.len() - 1];
    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.stop_timeout().unwrap(), Duration::from_secs(30));
        assert!(cfg.remembered_terminal().is_none());
        assert!(!cfg.auto_action_config().is_armed());
    }

    #[test]
    fn config_validation_catches_invalid_values() {
        let mut cfg = Config::default();
        cfg.auto_action.delay_minutes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.queue.stop_grace = "soon".to_owned();
        assert!(matches!(
            cfg.validate(),
            Err(QueueError::InvalidConfigValue { .. })
        ));

        let mut cfg = Config::default();
        cfg.terminal.remembered = true;
        cfg.terminal.mode = TerminalMode::Custom;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(30 * 86_400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3y").is_err());
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        set_value_string_at_path(&path, "auto_action.enabled", "true").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "auto_action.enabled")
                .unwrap()
                .as_deref(),
            Some("true")
        );

        set_value_string_at_path(&path, "auto_action.type", "shutdown").unwrap();
        set_value_string_at_path(&path, "agent.extra_args", "--model 'opus 4'").unwrap();
        set_value_string_at_path(&path, "queue.stop_timeout", "2m").unwrap();

        assert!(set_value_string_at_path(&path, "terminal.mode", "popup").is_err());
        assert!(set_value_string_at_path(&path, "queue.stop_grace", "later").is_err());
        assert!(set_value_string_at_path(&path, "nope.key", "1").is_err());

        let (_doc, cfg) = load_from_file(&path).unwrap();
        cfg.validate().unwrap();
        assert_eq!(
            cfg.auto_action_config(),
            AutoActionConfig::armed(AutoActionType::Shutdown, 5)
        );
        assert_eq!(cfg.agent.extra_args, ["--model", "opus 4"]);
        assert_eq!(cfg.stop_timeout().unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn multi_key_writes_are_validated_together() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        // Custom mode without a template is rejected and nothing is written.
        let err = set_values_at_path(
            &path,
            &[("terminal.remembered", "true"), ("terminal.mode", "custom")],
        );
        assert!(err.is_err());
        assert!(!path.exists());

        set_values_at_path(
            &path,
            &[
                ("terminal.remembered", "true"),
                ("terminal.mode", "custom"),
                ("terminal.custom_command", "tmux new-window sh {{script}}"),
            ],
        )
        .unwrap();
        let (_doc, cfg) = load_from_file(&path).unwrap();
        let choice = cfg.remembered_terminal().unwrap();
        assert_eq!(choice.mode, TerminalMode::Custom);
        assert_eq!(
            choice.custom_command.as_deref(),
            Some("tmux new-window sh {{script}}")
        );
    }
}
