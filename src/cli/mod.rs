#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::IsTerminal as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::config::{self, Config};
use crate::output::table::Table;
use crate::task::auto_action::{AutoActionConfig, AutoActionType, HostActionInvoker};
use crate::task::engine::{EngineOptions, QueueEngine};
use crate::task::events::QueueEvent;
use crate::task::execution::{ExecutionManager, ExecutionRecord, ExecutionStatus};
use crate::task::launch::{TerminalChoice, TerminalMode, TerminalPolicy};
use crate::task::model::{NewTask, Priority, Task, TaskPatch, TaskStatus};
use crate::task::preferences::ConfigFilePreferences;
use crate::task::process::{AgentCommand, CommandSpawner};
use crate::task::storage::FileTaskStorage;
use crate::task::store::TaskStore;
use crate::task::worker::{self, RunnerConfig, RunnerStatusReport};

#[derive(Debug, Parser)]
#[command(
    name = "promptq",
    version,
    about = "Queue prompts for the Claude CLI and run them one at a time"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Task(TaskArgs),
    /// Run queued tasks until the queue drains
    Run(RunArgs),
    /// Stop a runner started from another shell
    Stop(StopArgs),
    Status(StatusArgs),
    Terminal(TerminalArgs),
    AutoAction(AutoActionArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    Add(TaskAddArgs),
    List(TaskListArgs),
    Show(TaskShowArgs),
    Edit(TaskEditArgs),
    Enqueue(TaskIdsArgs),
    Dequeue(TaskIdsArgs),
    Reorder(TaskReorderArgs),
    #[command(alias = "remove")]
    Rm(TaskIdsArgs),
    Import(TaskImportArgs),
    Logs(TaskLogsArgs),
}

#[derive(Debug, Parser)]
pub struct TaskAddArgs {
    pub prompt: String,
    /// Working directory for the agent (default: current directory)
    #[arg(short = 'p', long = "project")]
    pub project: Option<String>,
    #[arg(long = "priority", value_parser = parse_priority, default_value = "medium")]
    pub priority: Priority,
    #[arg(long = "notes")]
    pub notes: Option<String>,
    #[arg(long = "system-prompt")]
    pub system_prompt: Option<String>,
    #[arg(long = "allowed-tools", value_delimiter = ',')]
    pub allowed_tools: Vec<String>,
    #[arg(long = "max-budget")]
    pub max_budget: Option<f64>,
    #[arg(long = "max-turns")]
    pub max_turns: Option<u32>,
    #[arg(long = "depends-on")]
    pub depends_on: Option<String>,
    /// Queue the task right away instead of leaving it in the backlog
    #[arg(short = 'q', long = "enqueue")]
    pub enqueue: bool,
}

#[derive(Debug, Parser)]
pub struct TaskListArgs {
    #[arg(long = "status", value_parser = parse_status)]
    pub status: Option<TaskStatus>,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "json", conflicts_with = "csv")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct TaskShowArgs {
    pub id: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClearField {
    Project,
    Notes,
    SystemPrompt,
    AllowedTools,
    MaxBudget,
    MaxTurns,
    DependsOn,
}

#[derive(Debug, Parser)]
pub struct TaskEditArgs {
    pub id: String,
    #[arg(long = "prompt")]
    pub prompt: Option<String>,
    #[arg(short = 'p', long = "project")]
    pub project: Option<String>,
    #[arg(long = "priority", value_parser = parse_priority)]
    pub priority: Option<Priority>,
    #[arg(long = "notes")]
    pub notes: Option<String>,
    #[arg(long = "system-prompt")]
    pub system_prompt: Option<String>,
    #[arg(long = "allowed-tools", value_delimiter = ',')]
    pub allowed_tools: Option<Vec<String>>,
    #[arg(long = "max-budget")]
    pub max_budget: Option<f64>,
    #[arg(long = "max-turns")]
    pub max_turns: Option<u32>,
    #[arg(long = "depends-on")]
    pub depends_on: Option<String>,
    /// Unset an optional field
    #[arg(long = "clear", value_enum)]
    pub clear: Vec<ClearField>,
}

#[derive(Debug, Parser)]
pub struct TaskIdsArgs {
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct TaskReorderArgs {
    #[arg(value_parser = parse_status)]
    pub status: TaskStatus,
    /// Every task in the partition, in the new order
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Debug, Parser)]
pub struct TaskImportArgs {
    pub file: PathBuf,
    /// Queue every imported task, regardless of per-task settings
    #[arg(short = 'q', long = "enqueue")]
    pub enqueue: bool,
}

#[derive(Debug, Parser)]
pub struct TaskLogsArgs {
    /// Task or execution ID
    pub id: Option<String>,
    #[arg(long = "status", default_value = "")]
    pub status: String,
    #[arg(long = "limit", default_value_t = 20)]
    pub limit: usize,
    #[arg(long = "json")]
    pub json: bool,

    #[command(subcommand)]
    pub cmd: Option<TaskLogsSubcommand>,
}

#[derive(Debug, Subcommand)]
pub enum TaskLogsSubcommand {
    Clean(TaskLogsCleanArgs),
}

#[derive(Debug, Parser)]
pub struct TaskLogsCleanArgs {
    #[arg(long = "older-than", default_value = "30d")]
    pub older_than: String,
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Keep running after the queue drains and pick up new tasks
    #[arg(long = "wait")]
    pub wait: bool,
    #[arg(long = "mode", value_parser = parse_mode)]
    pub mode: Option<TerminalMode>,
    /// Launcher template for --mode custom
    #[arg(long = "command")]
    pub command: Option<String>,
    /// Save --mode as the default for future runs
    #[arg(long = "remember", requires = "mode")]
    pub remember: bool,
}

#[derive(Debug, Parser)]
pub struct StopArgs {
    #[arg(long = "timeout", default_value = "60s")]
    pub timeout: String,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TerminalArgs {
    #[command(subcommand)]
    pub cmd: TerminalCmd,
}

#[derive(Debug, Subcommand)]
pub enum TerminalCmd {
    Show,
    Set(TerminalSetArgs),
    /// Forget the remembered launch mode
    Reset,
}

#[derive(Debug, Parser)]
pub struct TerminalSetArgs {
    #[arg(value_parser = parse_mode)]
    pub mode: TerminalMode,
    #[arg(long = "command")]
    pub command: Option<String>,
}

#[derive(Debug, Parser)]
pub struct AutoActionArgs {
    #[command(subcommand)]
    pub cmd: AutoActionCmd,
}

#[derive(Debug, Subcommand)]
pub enum AutoActionCmd {
    Show,
    Set(AutoActionSetArgs),
    /// Cancel a running countdown, or disarm the pending action
    Cancel,
}

#[derive(Debug, Parser)]
pub struct AutoActionSetArgs {
    #[arg(long = "action", value_parser = parse_action)]
    pub action: AutoActionType,
    /// Minutes to wait after the queue drains
    #[arg(long = "delay")]
    pub delay: Option<u32>,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if matches!(cli.cmd, Some(Commands::Run(_))) {
        "info"
    } else {
        "warn"
    };
    init_tracing(default_level);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = ["PROMPTQ_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        None => cmd_status(StatusArgs { json: false }).await,
        Some(Commands::Completion(args)) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "promptq", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Config(args)) => match args.cmd {
            ConfigCmd::List => {
                print!("{}", config::list_resolved_toml()?);
                Ok(ExitCode::SUCCESS)
            }
            ConfigCmd::Set(set) => {
                config::set_value_string(&set.key, &set.value)?;
                println!("Set {} = {}", set.key, set.value);
                Ok(ExitCode::SUCCESS)
            }
            ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
                Some(v) => {
                    println!("{v}");
                    Ok(ExitCode::SUCCESS)
                }
                None => anyhow::bail!(
                    "configuration key '{}' not found - use 'promptq config list' to see available keys",
                    get.key
                ),
            },
        },
        Some(Commands::Task(args)) => cmd_task(args).await,
        Some(Commands::Run(args)) => cmd_run(args).await,
        Some(Commands::Stop(args)) => cmd_stop(args).await,
        Some(Commands::Status(args)) => cmd_status(args).await,
        Some(Commands::Terminal(args)) => cmd_terminal(args).await,
        Some(Commands::AutoAction(args)) => cmd_auto_action(args).await,
        Some(Commands::Version) => Ok(cmd_version()),
    }
}

/// Everything a command needs to find the queue.
struct Context {
    cfg: Config,
    config_file: PathBuf,
    queue_dir: PathBuf,
}

impl Context {
    async fn load() -> anyhow::Result<Self> {
        tokio::task::spawn_blocking(|| -> anyhow::Result<Self> {
            let (cfg, _doc, paths) = config::load()?;
            let queue_dir = cfg.queue_dir()?;
            Ok(Self {
                cfg,
                config_file: paths.config_file,
                queue_dir,
            })
        })
        .await?
    }

    fn store(&self) -> TaskStore {
        TaskStore::new(Arc::new(FileTaskStorage::new(self.queue_dir.join("tasks"))))
    }

    fn executions(&self) -> ExecutionManager {
        ExecutionManager::new(self.queue_dir.clone())
    }

    fn engine(&self) -> anyhow::Result<QueueEngine> {
        let cfg = &self.cfg;
        let executions = self.executions();
        let spawner = CommandSpawner::new(executions.clone(), cfg.max_output_bytes());
        let invoker = HostActionInvoker::new(
            Some(cfg.auto_action.sleep_command.clone()),
            Some(cfg.auto_action.shutdown_command.clone()),
        );
        let options = EngineOptions {
            stop_timeout: cfg.stop_timeout()?,
            stop_grace: cfg.stop_grace()?,
            skip_on_failed_dependency: cfg.queue.skip_on_failed_dependency,
            stranded_policy: cfg.queue.stranded_policy,
            tick_interval: Duration::from_secs(1),
            agent: AgentCommand {
                executable: cfg.agent.executable.clone(),
                extra_args: cfg.agent.extra_args.clone(),
                output_format: cfg.agent.output_format.clone(),
            },
        };

        Ok(QueueEngine::builder(self.store(), Arc::new(spawner))
            .invoker(Arc::new(invoker))
            .preferences(Arc::new(ConfigFilePreferences::new(self.config_file.clone())))
            .executions(executions)
            .options(options)
            .terminal_policy(TerminalPolicy::new(
                cfg.remembered_terminal(),
                cfg.terminal_template(),
            ))
            .auto_action(cfg.auto_action_config())
            .build())
    }
}

// ---- task -------------------------------------------------------------------

async fn cmd_task(args: TaskArgs) -> anyhow::Result<ExitCode> {
    let ctx = Context::load().await?;
    let engine = ctx.engine()?;

    match args.cmd {
        TaskCmd::Add(add) => task_add(&engine, add).await?,
        TaskCmd::List(list) => task_list(&ctx, engine.store(), &list)?,
        TaskCmd::Show(show) => {
            let task = find_task(engine.store(), &show.id)?;
            if show.json {
                print_json(&task)?;
            } else {
                print_task_details(&task);
            }
        }
        TaskCmd::Edit(edit) => {
            let task = find_task(engine.store(), &edit.id)?;
            let patch = edit_patch(engine.store(), &edit)?;
            let task = engine.update_task(&task.id, patch).await?;
            println!("Updated task {}", task.id);
        }
        TaskCmd::Enqueue(ids) => {
            for id in &ids.ids {
                let task = find_task(engine.store(), id)?;
                let task = engine.enqueue(&task.id).await?;
                println!("Queued {} ({})", task.id, task.title(50));
            }
        }
        TaskCmd::Dequeue(ids) => {
            for id in &ids.ids {
                let task = find_task(engine.store(), id)?;
                let task = engine.dequeue(&task.id).await?;
                println!("Moved {} back to backlog", task.id);
            }
        }
        TaskCmd::Reorder(reorder) => {
            let ids = reorder
                .ids
                .iter()
                .map(|id| find_task(engine.store(), id).map(|t| t.id))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let tasks = engine.reorder(reorder.status, &ids).await?;
            for t in &tasks {
                println!("{:>3}  {}  {}", t.sort_order + 1, t.id, t.title(60));
            }
        }
        TaskCmd::Rm(ids) => {
            for id in &ids.ids {
                let task = find_task(engine.store(), id)?;
                let task = engine.delete_task(&task.id).await?;
                println!("Deleted {}", task.id);
            }
        }
        TaskCmd::Import(import) => {
            let created = task_import(&engine, &import).await?;
            println!("Imported {} task(s)", created.len());
            for t in &created {
                println!("  {} [{}] {}", t.id, t.status, t.title(60));
            }
        }
        TaskCmd::Logs(logs) => task_logs(&ctx, engine.store(), logs)?,
    }

    Ok(ExitCode::SUCCESS)
}

async fn task_add(engine: &QueueEngine, args: TaskAddArgs) -> anyhow::Result<()> {
    let project = match args.project.as_deref() {
        Some(p) => absolute_project(p, None)?,
        None => std::env::current_dir()
            .context("failed to get current directory")?
            .to_string_lossy()
            .to_string(),
    };
    let depends_on = match args.depends_on.as_deref() {
        Some(dep) => Some(find_task(engine.store(), dep)?.id),
        None => None,
    };

    let task = engine
        .create_task(NewTask {
            prompt: args.prompt,
            project_path: Some(project),
            priority: args.priority,
            notes: args.notes,
            system_prompt: args.system_prompt,
            allowed_tools: args.allowed_tools,
            max_budget_usd: args.max_budget,
            max_turns: args.max_turns,
            depends_on,
        })
        .await?;

    let task = if args.enqueue {
        engine.enqueue(&task.id).await?
    } else {
        task
    };
    println!("Added task {} [{}]", task.id, task.status);
    Ok(())
}

fn edit_patch(store: &TaskStore, args: &TaskEditArgs) -> anyhow::Result<TaskPatch> {
    let mut patch = TaskPatch {
        prompt: args.prompt.clone(),
        project_path: match args.project.as_deref() {
            Some(p) => Some(Some(absolute_project(p, None)?)),
            None => None,
        },
        system_prompt: args.system_prompt.clone().map(Some),
        allowed_tools: args.allowed_tools.clone(),
        max_budget_usd: args.max_budget.map(Some),
        max_turns: args.max_turns.map(Some),
        notes: args.notes.clone().map(Some),
        priority: args.priority,
        depends_on: match args.depends_on.as_deref() {
            Some(dep) => Some(Some(find_task(store, dep)?.id)),
            None => None,
        },
        status: None,
    };

    for field in &args.clear {
        match field {
            ClearField::Project => patch.project_path = Some(None),
            ClearField::Notes => patch.notes = Some(None),
            ClearField::SystemPrompt => patch.system_prompt = Some(None),
            ClearField::AllowedTools => patch.allowed_tools = Some(Vec::new()),
            ClearField::MaxBudget => patch.max_budget_usd = Some(None),
            ClearField::MaxTurns => patch.max_turns = Some(None),
            ClearField::DependsOn => patch.depends_on = Some(None),
        }
    }

    if !patch.has_content_changes() {
        anyhow::bail!("nothing to change; pass at least one field flag");
    }
    Ok(patch)
}

fn task_list(ctx: &Context, store: &TaskStore, args: &TaskListArgs) -> anyhow::Result<()> {
    let mut tasks = match args.status {
        Some(s) => store.list_by_status(s)?,
        None => store.list_all()?,
    };
    tasks.sort_by(|a, b| (a.status, a.sort_order).cmp(&(b.status, b.sort_order)));

    if args.json {
        return print_json(&tasks);
    }

    let mut headers = vec!["ID", "STATUS", "#", "PRIORITY", "DEPENDS", "PROMPT"];
    if args.verbose {
        headers.extend(["PROJECT", "DURATION", "COST"]);
    }
    let mut table = Table::new(headers);
    for t in &tasks {
        let status = if args.csv {
            t.status.as_str().to_owned()
        } else {
            format!("{} {}", t.status.icon(), t.status)
        };
        let mut row = vec![
            t.id.clone(),
            status,
            (t.sort_order + 1).to_string(),
            t.priority.to_string(),
            t.depends_on.clone().unwrap_or_else(|| "-".to_owned()),
            if args.csv {
                t.prompt.clone()
            } else {
                t.title(50)
            },
        ];
        if args.verbose {
            let project = t.project_path.as_deref().unwrap_or("-");
            row.extend([
                if args.csv {
                    project.to_owned()
                } else {
                    config::tilde_path(project)
                },
                task_duration_string(t),
                t.cost_usd.map_or_else(|| "-".to_owned(), |c| format!("${c:.2}")),
            ]);
        }
        table.row(row);
    }

    if args.csv {
        table.write_csv()?;
        return Ok(());
    }
    if table.is_empty() {
        println!("No tasks in {}.", ctx.queue_dir.display());
        return Ok(());
    }
    table.print()?;
    Ok(())
}

/// Resolves an exact ID or a unique prefix of one.
fn find_task(store: &TaskStore, pattern: &str) -> anyhow::Result<Task> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        anyhow::bail!("task ID must not be empty");
    }
    let tasks = store.list_all()?;
    if let Some(t) = tasks.iter().find(|t| t.id == pattern) {
        return Ok(t.clone());
    }
    let mut matches: Vec<&Task> = tasks.iter().filter(|t| t.id.starts_with(pattern)).collect();
    match matches.len() {
        0 => anyhow::bail!("task not found: {pattern}"),
        1 => Ok(matches.remove(0).clone()),
        n => {
            let ids: Vec<&str> = matches.iter().map(|t| t.id.as_str()).collect();
            anyhow::bail!("'{pattern}' matches {n} tasks: {}", ids.join(", "))
        }
    }
}

fn absolute_project(raw: &str, base: Option<&Path>) -> anyhow::Result<String> {
    let p = config::expand_path(raw)?;
    let p = match base {
        Some(base) if p.is_relative() => base.join(p),
        _ => std::path::absolute(&p)
            .with_context(|| format!("failed to resolve {}", p.display()))?,
    };
    Ok(p.to_string_lossy().to_string())
}

fn print_task_details(task: &Task) {
    println!("Task: {}", task.id);
    println!("Status: {} {}", task.status.icon(), task.status);
    println!("Priority: {}", task.priority);
    println!("Position: {}", task.sort_order + 1);
    if let Some(p) = task.project_path.as_deref() {
        println!("Project: {}", config::tilde_path(p));
    }
    if let Some(dep) = task.depends_on.as_deref() {
        println!("Depends on: {dep}");
    }
    if !task.allowed_tools.is_empty() {
        println!("Allowed tools: {}", task.allowed_tools.join(", "));
    }
    if let Some(turns) = task.max_turns {
        println!("Max turns: {turns}");
    }
    if let Some(budget) = task.max_budget_usd {
        println!("Max budget: ${budget:.2}");
    }
    println!("Created: {}", task.created_at);
    if let Some(started) = task.started_at.as_deref() {
        println!("Started: {started}");
    }
    if let Some(done) = task.completed_at.as_deref() {
        println!("Completed: {done} ({})", task_duration_string(task));
    }
    if let Some(code) = task.exit_code {
        println!("Exit code: {code}");
    }
    if let Some(tokens) = task.tokens {
        println!("Tokens: {tokens}");
    }
    if let Some(cost) = task.cost_usd {
        println!("Cost: ${cost:.4}");
    }
    if let Some(exec) = task.execution_id.as_deref() {
        println!("Execution: {exec}");
    }

    println!("\nPrompt:\n{}", task.prompt);
    if let Some(sp) = task.system_prompt.as_deref() {
        println!("\nSystem prompt:\n{sp}");
    }
    if let Some(notes) = task.notes.as_deref() {
        println!("\nNotes:\n{notes}");
    }
    if let Some(err) = task.last_error.as_deref()
        && !err.trim().is_empty()
    {
        println!("\nLast error:\n{err}");
    }
    if let Some(out) = task.output.as_deref()
        && !out.trim().is_empty()
    {
        println!("\nOutput:\n{}", out.trim_end());
    }
}

fn task_duration_string(task: &Task) -> String {
    let Some(started) = task.started_at.as_deref() else {
        return "-".to_owned();
    };
    let start = parse_rfc3339(started).ok();
    let end = task
        .completed_at
        .as_deref()
        .and_then(|s| parse_rfc3339(s).ok())
        .or_else(|| Some(time::OffsetDateTime::now_utc()));

    match (start, end) {
        (Some(s), Some(e)) if e >= s => format_duration(e - s),
        _ => "-".to_owned(),
    }
}

fn format_duration(d: time::Duration) -> String {
    if d < time::Duration::minutes(1) {
        return format!("{}s", d.whole_seconds());
    }
    if d < time::Duration::hours(1) {
        return format!("{}m", d.whole_minutes());
    }
    let hours = d.whole_hours();
    let minutes = (d - time::Duration::hours(hours)).whole_minutes();
    format!("{hours}h {minutes}m")
}

fn parse_rfc3339(s: &str) -> anyhow::Result<time::OffsetDateTime> {
    time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
        .map_err(|e| anyhow::anyhow!("invalid time: {e}"))
}

// ---- import -----------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct TaskFile {
    version: String,
    #[serde(default)]
    defaults: TaskFileDefaults,
    tasks: Vec<TaskFileEntry>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TaskFileDefaults {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    enqueue: bool,
}

#[derive(Debug, serde::Deserialize)]
struct TaskFileEntry {
    /// File-local name other entries can depend on.
    #[serde(default)]
    key: Option<String>,
    prompt: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    max_budget_usd: Option<f64>,
    #[serde(default)]
    max_turns: Option<u32>,
    #[serde(default)]
    depends_on: Option<String>,
    #[serde(default)]
    enqueue: Option<bool>,
}

#[derive(Debug)]
enum ImportDependency {
    Key(String),
    Existing(String),
}

#[derive(Debug)]
struct ImportPlan {
    key: Option<String>,
    new: NewTask,
    dependency: Option<ImportDependency>,
    enqueue: bool,
}

/// Reads and checks the whole file before creating anything.
fn plan_import(store: &TaskStore, path: &Path, force_enqueue: bool) -> anyhow::Result<Vec<ImportPlan>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file: {}", path.display()))?;
    let def: TaskFile = serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse YAML: {}", path.display()))?;

    if def.version.trim() != "1.0" {
        anyhow::bail!(
            "unsupported task file version: {} (expected 1.0)",
            def.version
        );
    }
    if def.tasks.is_empty() {
        anyhow::bail!("task file has no tasks");
    }

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(std::env::current_dir, |p| std::path::absolute(p))
        .context("failed to resolve task file directory")?;
    let default_priority = match def.defaults.priority.as_deref() {
        Some(p) => parse_priority(p).map_err(anyhow::Error::msg)?,
        None => Priority::default(),
    };

    let mut seen_keys: Vec<String> = Vec::new();
    let mut plans = Vec::with_capacity(def.tasks.len());
    for (i, entry) in def.tasks.into_iter().enumerate() {
        let n = i + 1;
        if entry.prompt.trim().is_empty() {
            anyhow::bail!("task #{n}: prompt is required");
        }
        let key = entry.key.map(|k| k.trim().to_owned()).filter(|k| !k.is_empty());
        if let Some(k) = key.as_deref()
            && seen_keys.iter().any(|s| s == k)
        {
            anyhow::bail!("task #{n}: duplicate key '{k}'");
        }

        let dependency = match entry.depends_on.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(dep) if seen_keys.iter().any(|s| s == dep) => {
                Some(ImportDependency::Key(dep.to_owned()))
            }
            Some(dep) => match find_task(store, dep) {
                Ok(t) => Some(ImportDependency::Existing(t.id)),
                Err(_) => anyhow::bail!(
                    "task #{n}: depends_on '{dep}' is neither an earlier key nor an existing task"
                ),
            },
        };

        let priority = match entry.priority.as_deref() {
            Some(p) => parse_priority(p).map_err(|e| anyhow::anyhow!("task #{n}: {e}"))?,
            None => default_priority,
        };
        let project = match entry.project.or_else(|| def.defaults.project.clone()) {
            Some(p) => absolute_project(&p, Some(&base))?,
            None => base.to_string_lossy().to_string(),
        };

        if let Some(k) = key.clone() {
            seen_keys.push(k);
        }
        plans.push(ImportPlan {
            key,
            new: NewTask {
                prompt: entry.prompt,
                project_path: Some(project),
                priority,
                notes: entry.notes,
                system_prompt: entry.system_prompt,
                allowed_tools: entry.allowed_tools,
                max_budget_usd: entry.max_budget_usd,
                max_turns: entry.max_turns,
                depends_on: None,
            },
            dependency,
            enqueue: force_enqueue || entry.enqueue.unwrap_or(def.defaults.enqueue),
        });
    }
    Ok(plans)
}

async fn task_import(engine: &QueueEngine, args: &TaskImportArgs) -> anyhow::Result<Vec<Task>> {
    let plans = plan_import(engine.store(), &args.file, args.enqueue)?;

    let mut ids_by_key: HashMap<String, String> = HashMap::new();
    let mut created = Vec::with_capacity(plans.len());
    for plan in plans {
        let mut new = plan.new;
        new.depends_on = match plan.dependency {
            Some(ImportDependency::Key(k)) => ids_by_key.get(&k).cloned(),
            Some(ImportDependency::Existing(id)) => Some(id),
            None => None,
        };
        let mut task = engine.create_task(new).await?;
        if plan.enqueue {
            task = engine.enqueue(&task.id).await?;
        }
        if let Some(k) = plan.key {
            ids_by_key.insert(k, task.id.clone());
        }
        created.push(task);
    }
    Ok(created)
}

// ---- logs -------------------------------------------------------------------

fn task_logs(ctx: &Context, store: &TaskStore, args: TaskLogsArgs) -> anyhow::Result<()> {
    let exec_mgr = ctx.executions();
    if let Some(TaskLogsSubcommand::Clean(clean)) = args.cmd {
        return task_logs_clean(&exec_mgr, &clean);
    }

    if let Some(id) = args.id.as_deref() {
        let record = match exec_mgr.load_record(id) {
            Ok(r) => r,
            Err(_) => {
                let task = find_task(store, id)?;
                exec_mgr
                    .list_records()?
                    .into_iter()
                    .find(|r| r.task_id == task.id)
                    .with_context(|| format!("task {} has not run yet", task.id))?
            }
        };
        return show_execution(&exec_mgr, &record, args.json);
    }

    let mut records = exec_mgr.list_records()?;
    if !args.status.trim().is_empty() {
        let want = args.status.trim();
        records.retain(|r| r.status.as_str() == want);
    }
    records.truncate(args.limit);

    if args.json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    let mut table = Table::new(["EXECUTION", "TASK", "STATUS", "MODE", "STARTED", "EXIT", "COST"]);
    for r in &records {
        table.row([
            r.execution_id.clone(),
            r.task_id.clone(),
            r.status.as_str().to_owned(),
            r.launch_mode.clone(),
            relative_time(&r.start_time),
            r.exit_code.map_or_else(|| "-".to_owned(), |c| c.to_string()),
            r.cost_usd.map_or_else(|| "-".to_owned(), |c| format!("${c:.2}")),
        ]);
    }
    table.print()?;
    Ok(())
}

fn show_execution(exec_mgr: &ExecutionManager, record: &ExecutionRecord, json: bool) -> anyhow::Result<()> {
    let log = exec_mgr.read_log_string(&record.execution_id).ok();
    if json {
        print_json(record)?;
        if let Some(log) = log {
            print!("{log}");
        }
        return Ok(());
    }

    println!(
        "Execution: {} (task {})\nStatus: {} • Mode: {} • Started: {}",
        record.execution_id,
        record.task_id,
        record.status.as_str(),
        record.launch_mode,
        record.start_time,
    );
    println!("Working directory: {}", config::tilde_path(&record.working_directory));
    if let Some(err) = record.error.as_deref() {
        println!("Error: {err}");
    }
    println!();

    match log {
        Some(log) => {
            for line in log.lines() {
                println!("{}", render_log_line(line));
            }
        }
        None if record.launch_mode == "headless" => println!("⊘ log file missing"),
        None => println!("(output was shown in a terminal window)"),
    }
    Ok(())
}

/// Text lines print as-is; structured agent output keeps its JSON.
fn render_log_line(line: &str) -> String {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(line) else {
        return line.to_owned();
    };
    let stream = map.get("stream").and_then(|v| v.as_str()).unwrap_or("stdout");
    let body = match (map.get("type").and_then(|v| v.as_str()), map.get("text")) {
        (Some("text"), Some(serde_json::Value::String(t))) => t.clone(),
        _ => {
            let mut payload = map.clone();
            for k in ["timestamp", "execution_id", "task_id", "stream"] {
                payload.remove(k);
            }
            serde_json::Value::Object(payload).to_string()
        }
    };
    if stream == "stderr" {
        format!("[stderr] {body}")
    } else {
        body
    }
}

fn task_logs_clean(exec_mgr: &ExecutionManager, args: &TaskLogsCleanArgs) -> anyhow::Result<()> {
    let dur = config::parse_duration(&args.older_than)?;
    let secs = i64::try_from(dur.as_secs()).map_err(|_| anyhow::anyhow!("duration too large"))?;
    let cutoff = time::OffsetDateTime::now_utc() - time::Duration::seconds(secs);

    let to_delete: Vec<String> = exec_mgr
        .list_records()?
        .into_iter()
        .filter(|r| r.status != ExecutionStatus::Running)
        .filter(|r| {
            parse_rfc3339(&r.start_time).unwrap_or(time::OffsetDateTime::UNIX_EPOCH) < cutoff
        })
        .map(|r| r.execution_id)
        .collect();

    if to_delete.is_empty() {
        println!("No old logs found to clean.");
        return Ok(());
    }

    if !args.yes {
        if !is_tty() {
            anyhow::bail!("refusing to delete logs without confirmation; pass --yes");
        }
        let prompt = format!(
            "Found {} executions older than {}. Delete them?",
            to_delete.len(),
            args.older_than
        );
        if !confirm(&prompt)? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    for id in &to_delete {
        exec_mgr.delete_execution(id);
    }
    println!("Cleaned {} executions.", to_delete.len());
    Ok(())
}

fn relative_time(rfc3339: &str) -> String {
    let Ok(t) = parse_rfc3339(rfc3339) else {
        return "unknown".to_owned();
    };
    let diff = time::OffsetDateTime::now_utc() - t;
    if diff < time::Duration::minutes(1) {
        "just now".to_owned()
    } else if diff < time::Duration::hours(1) {
        format!("{}m ago", diff.whole_minutes())
    } else if diff < time::Duration::days(1) {
        format!("{}h ago", diff.whole_hours())
    } else {
        format!("{}d ago", diff.whole_days())
    }
}

// ---- runner -----------------------------------------------------------------

async fn cmd_run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let ctx = Context::load().await?;
    let engine = ctx.engine()?;

    if let Some(mode) = args.mode {
        let mut choice = TerminalChoice::new(mode);
        if let Some(cmd) = args.command.clone() {
            choice = choice.with_command(cmd);
        }
        if args.remember {
            choice = choice.remember();
        }
        engine.select_terminal(choice).await?;
    } else if engine.status().await.needs_terminal_choice && is_tty() {
        let choice = prompt_terminal_choice()?;
        engine.select_terminal(choice).await?;
    }

    let observer = spawn_event_logger(engine.subscribe());

    let rcfg = RunnerConfig {
        queue_dir: ctx.queue_dir.clone(),
        poll_interval: ctx.cfg.poll_interval(),
        wait: args.wait,
        log_retention_days: ctx
            .cfg
            .queue
            .auto_cleanup
            .then_some(ctx.cfg.queue.log_retention_days),
    };
    let config_file = ctx.config_file.clone();
    let reload = move || {
        config::load_from_file(&config_file)
            .ok()
            .map(|(_doc, cfg)| cfg.auto_action_config())
    };

    let result = worker::run_queue(&engine, &rcfg, reload).await;
    observer.abort();
    result?;

    let tasks = engine.store().list_all()?;
    let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
    println!(
        "Runner stopped: {} completed, {} failed, {} skipped, {} still queued",
        count(TaskStatus::Completed),
        count(TaskStatus::Failed),
        count(TaskStatus::Skipped),
        count(TaskStatus::Queued),
    );
    Ok(ExitCode::SUCCESS)
}

fn spawn_event_logger(mut rx: broadcast::Receiver<QueueEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::TaskStarted {
            task_id,
            launch_mode,
        } => tracing::info!(task_id = %task_id, mode = %launch_mode, "task started"),
        QueueEvent::TaskFinished {
            task_id,
            status,
            exit_code,
        } => tracing::info!(task_id = %task_id, status = %status, exit_code = ?exit_code, "task finished"),
        QueueEvent::TaskSkipped {
            task_id,
            dependency,
        } => tracing::info!(task_id = %task_id, dependency = %dependency, "task skipped"),
        QueueEvent::SpawnFailed { task_id, error } => {
            tracing::warn!(task_id = %task_id, error = %error, "could not launch the agent; check agent.executable and the launch mode");
        }
        QueueEvent::PersistenceFailed { task_id, error } => {
            tracing::error!(task_id = %task_id, error = %error, "could not save the task result; the queue is halted until it can be written");
        }
        QueueEvent::TaskReconciled { task_id, status } => {
            tracing::info!(task_id = %task_id, status = %status, "task recovered");
        }
        QueueEvent::QueueDrained => tracing::info!("queue drained"),
        QueueEvent::AutoActionArmed {
            action,
            remaining_seconds,
        } => tracing::info!(action = %action, remaining_seconds, "auto-action countdown started; `promptq auto-action cancel` to abort"),
        QueueEvent::AutoActionTick { remaining_seconds } => {
            if *remaining_seconds > 0 && remaining_seconds % 60 == 0 {
                tracing::info!(remaining_seconds, "auto-action pending");
            }
        }
        QueueEvent::AutoActionCancelled { reason } => {
            tracing::info!(reason = ?reason, "auto-action cancelled");
        }
        QueueEvent::AutoActionFired { action } => tracing::info!(action = %action, "auto-action fired"),
        QueueEvent::AutoActionFailed { action, error } => {
            tracing::warn!(action = %action, error = %error, "auto-action failed");
        }
        other => tracing::debug!(event = ?other, "queue event"),
    }
}

fn prompt_terminal_choice() -> anyhow::Result<TerminalChoice> {
    println!("How should queued tasks be launched?");
    println!("  [h] headless  - run in the background, capture output");
    println!("  [t] terminal  - open each task in a new terminal window");
    println!("  [c] custom    - use your own launcher command");
    let mode = loop {
        let answer = read_line("Launch mode [h/t/c]: ")?;
        if let Some(mode) = match answer.trim().to_ascii_lowercase().as_str() {
            "h" => Some(TerminalMode::Headless),
            "t" => Some(TerminalMode::Terminal),
            "c" => Some(TerminalMode::Custom),
            other => TerminalMode::parse(other),
        } {
            break mode;
        }
    };

    let mut choice = TerminalChoice::new(mode);
    if mode == TerminalMode::Custom {
        let template = read_line("Launcher command ({{script}}, {{cwd}}, {{command}}): ")?;
        choice = choice.with_command(template.trim());
    }
    if confirm("Remember this choice?")? {
        choice = choice.remember();
    }
    Ok(choice)
}

async fn cmd_stop(args: StopArgs) -> anyhow::Result<ExitCode> {
    let ctx = Context::load().await?;
    let timeout = config::parse_duration(&args.timeout)?;

    if worker::live_runner(&ctx.queue_dir)?.is_none() {
        println!("No runner running.");
        return Ok(ExitCode::SUCCESS);
    }

    if worker::request_stop(&ctx.queue_dir, timeout).await? {
        println!("Runner stopped.");
        return Ok(ExitCode::SUCCESS);
    }

    anyhow::bail!("timed out waiting for the runner to stop (timeout: {timeout:?})")
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    runner: RunnerStatusReport,
    next_task: Option<String>,
    terminal: Option<TerminalChoice>,
    auto_action: AutoActionConfig,
}

async fn cmd_status(args: StatusArgs) -> anyhow::Result<ExitCode> {
    let ctx = Context::load().await?;
    let store = ctx.store();
    let tasks = store.list_all()?;
    let report = worker::runner_status(&ctx.queue_dir, &tasks)?;
    let next = store
        .list_by_status(TaskStatus::Queued)?
        .into_iter()
        .min_by_key(|t| t.sort_order);

    let view = StatusView {
        runner: report,
        next_task: next.as_ref().map(|t| t.id.clone()),
        terminal: ctx.cfg.remembered_terminal(),
        auto_action: ctx.cfg.auto_action_config(),
    };

    if args.json {
        print_json(&view)?;
        return Ok(ExitCode::SUCCESS);
    }

    match (view.runner.pid, view.runner.started_at.as_deref()) {
        (Some(pid), Some(started)) => println!("Runner: running (pid {pid}, since {started})"),
        _ => println!("Runner: not running"),
    }
    if view.runner.stop_requested {
        println!("Stop requested: yes");
    }
    if let Some(id) = view.runner.current_task.as_deref() {
        let title = tasks
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.title(60))
            .unwrap_or_default();
        println!("Current: {id} {title}");
    }
    if let Some(t) = next.as_ref() {
        println!("Next: {} {}", t.id, t.title(60));
    }
    match view.terminal.as_ref() {
        Some(c) => println!("Launch mode: {} (remembered)", c.mode.as_str()),
        None => println!("Launch mode: ask on `promptq run`"),
    }
    println!("Auto-action: {}", describe_auto_action(&view.auto_action));

    println!();
    for status in TaskStatus::ALL {
        let n = view.runner.counts.get(status.as_str()).copied().unwrap_or(0);
        println!("  {} {:<9} {n}", status.icon(), status.as_str());
    }
    Ok(ExitCode::SUCCESS)
}

// ---- terminal & auto-action -------------------------------------------------

async fn cmd_terminal(args: TerminalArgs) -> anyhow::Result<ExitCode> {
    let ctx = Context::load().await?;
    match args.cmd {
        TerminalCmd::Show => {
            match ctx.cfg.remembered_terminal() {
                Some(choice) => {
                    println!("Launch mode: {}", choice.mode.as_str());
                    if let Some(cmd) = choice.custom_command.as_deref() {
                        println!("Command: {cmd}");
                    }
                }
                None => println!("No launch mode remembered; `promptq run` will ask."),
            }
            if let Some(t) = ctx.cfg.terminal_template() {
                println!("Terminal launcher: {t}");
            }
        }
        TerminalCmd::Set(set) => {
            let mut choice = TerminalChoice::new(set.mode).remember();
            if let Some(cmd) = set.command {
                choice = choice.with_command(cmd);
            }
            ctx.engine()?.select_terminal(choice).await?;
            println!("Launch mode set to {}", set.mode.as_str());
        }
        TerminalCmd::Reset => {
            ctx.engine()?.forget_terminal().await?;
            println!("Launch mode forgotten.");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_auto_action(args: AutoActionArgs) -> anyhow::Result<ExitCode> {
    let ctx = Context::load().await?;
    match args.cmd {
        AutoActionCmd::Show => {
            println!("{}", describe_auto_action(&ctx.cfg.auto_action_config()));
            if worker::live_runner(&ctx.queue_dir)?.is_some() {
                println!("A runner is active; changes apply to it within a poll interval.");
            }
        }
        AutoActionCmd::Set(set) => {
            let current = ctx.cfg.auto_action_config();
            let delay = set.delay.unwrap_or(current.delay_minutes);
            let next = if set.action == AutoActionType::None {
                AutoActionConfig {
                    delay_minutes: delay,
                    ..current.disarmed()
                }
            } else {
                AutoActionConfig::armed(set.action, delay)
            };
            let saved = ctx.engine()?.update_auto_action_config(next).await?;
            println!("{}", describe_auto_action(&saved));
        }
        AutoActionCmd::Cancel => {
            if worker::request_auto_action_cancel(&ctx.queue_dir)? {
                println!("Cancel sent to the running runner.");
            } else {
                ctx.engine()?.cancel_auto_action().await;
                println!("Auto-action disarmed.");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn describe_auto_action(cfg: &AutoActionConfig) -> String {
    if cfg.is_armed() {
        format!(
            "{} {} minute(s) after the queue drains",
            cfg.action_type, cfg.delay_minutes
        )
    } else {
        "off".to_owned()
    }
}

// ---- helpers ----------------------------------------------------------------

fn cmd_version() -> ExitCode {
    println!("promptq version {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("PROMPTQ_GIT_COMMIT") {
        println!("  commit: {commit}");
    }
    if let Some(date) = option_env!("PROMPTQ_BUILD_DATE") {
        println!("  built: {date}");
    }
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let mut s = serde_json::to_string_pretty(value)?;
    s.push('\n');
    print!("{s}");
    Ok(())
}

fn is_tty() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn read_line(prompt: &str) -> anyhow::Result<String> {
    print!("{prompt}");
    std::io::Write::flush(&mut std::io::stdout())?;
    let mut resp = String::new();
    std::io::stdin()
        .read_line(&mut resp)
        .context("failed to read from stdin")?;
    Ok(resp)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let resp = read_line(&format!("{prompt} [y/N]: "))?;
    Ok(matches!(resp.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    Priority::parse(raw).ok_or_else(|| format!("invalid priority '{raw}' (low, medium, high)"))
}

fn parse_status(raw: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(raw).ok_or_else(|| {
        format!("invalid status '{raw}' (backlog, queued, running, completed, failed, skipped)")
    })
}

fn parse_mode(raw: &str) -> Result<TerminalMode, String> {
    TerminalMode::parse(raw).ok_or_else(|| format!("invalid mode '{raw}' (headless, terminal, custom)"))
}

fn parse_action(raw: &str) -> Result<AutoActionType, String> {
    AutoActionType::parse(raw).ok_or_else(|| format!("invalid action '{raw}' (none, sleep, shutdown)"))
}
