#![forbid(unsafe_code)]

//! Launching and supervising the agent process.
//!
//! Headless runs pipe stdout/stderr into a bounded buffer and the execution log.
//! Visible-terminal and custom-command runs go through a small wrapper script
//! that records the agent's pid, tees its output to a file and writes the exit
//! code when it finishes; the supervisor polls those files.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
use tokio::task::JoinHandle;

use crate::error::QueueError;
use crate::task::execution::{ExecutionManager, build_log_entry};
use crate::task::launch::LaunchMode;
use crate::task::model::Task;

/// How to call the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub executable: String,
    pub extra_args: Vec<String>,
    pub output_format: String,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            executable: "claude".to_owned(),
            extra_args: Vec::new(),
            output_format: "json".to_owned(),
        }
    }
}

/// A fully resolved command line for one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub task_id: String,
    pub execution_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl AgentInvocation {
    #[must_use]
    pub fn for_task(
        agent: &AgentCommand,
        task: &Task,
        execution_id: &str,
        working_dir: PathBuf,
    ) -> Self {
        let mut args = agent.extra_args.clone();
        args.push("-p".to_owned());
        args.push(task.prompt.clone());
        if !agent.output_format.trim().is_empty() {
            args.push("--output-format".to_owned());
            args.push(agent.output_format.clone());
            if agent.output_format == "stream-json" {
                args.push("--verbose".to_owned());
            }
        }
        if let Some(sp) = task.system_prompt.as_deref() {
            args.push("--append-system-prompt".to_owned());
            args.push(sp.to_owned());
        }
        if !task.allowed_tools.is_empty() {
            args.push("--allowedTools".to_owned());
            args.push(task.allowed_tools.join(","));
        }
        if let Some(turns) = task.max_turns {
            args.push("--max-turns".to_owned());
            args.push(turns.to_string());
        }
        if let Some(budget) = task.max_budget_usd {
            args.push("--max-budget-usd".to_owned());
            args.push(format!("{budget}"));
        }

        Self {
            task_id: task.id.clone(),
            execution_id: execution_id.to_owned(),
            program: agent.executable.clone(),
            args,
            working_dir,
            env: vec![
                ("PROMPTQ_TASK_ID".to_owned(), task.id.clone()),
                ("PROMPTQ_EXECUTION_ID".to_owned(), execution_id.to_owned()),
            ],
        }
    }

    /// The invocation as a single POSIX shell command line.
    #[must_use]
    pub fn shell_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessExit {
    pub exit_code: Option<i32>,
    pub output: String,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    /// Set when the process ended because `terminate` was called.
    pub terminated: bool,
}

impl ProcessExit {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.terminated && self.exit_code == Some(0)
    }
}

/// A launched agent. `wait` must be cancel-safe: the supervisor races it
/// against a stop request and calls `terminate` if the stop wins.
#[async_trait]
pub trait AgentProcess: Send {
    fn pid(&self) -> Option<u32>;
    async fn wait(&mut self) -> anyhow::Result<ProcessExit>;
    /// Interrupt, wait up to `grace`, then kill.
    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<ProcessExit>;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        invocation: &AgentInvocation,
        mode: &LaunchMode,
    ) -> Result<Box<dyn AgentProcess>, QueueError>;
}

/// Spawns the agent for real.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    executions: ExecutionManager,
    max_output_bytes: usize,
    poll_interval: Duration,
}

impl CommandSpawner {
    #[must_use]
    pub fn new(executions: ExecutionManager, max_output_bytes: usize) -> Self {
        Self {
            executions,
            max_output_bytes: max_output_bytes.max(1024),
            poll_interval: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn spawn_headless(&self, inv: &AgentInvocation) -> anyhow::Result<HeadlessProcess> {
        self.executions.ensure_dirs()?;
        let log_path = self.executions.log_path(&inv.execution_id);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;

        let mut cmd = tokio::process::Command::new(&inv.program);
        cmd.args(&inv.args);
        cmd.current_dir(&inv.working_dir);
        cmd.envs(inv.env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", inv.program))?;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.max_output_bytes)));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let log = tokio::fs::File::from_std(log.try_clone()?);
            readers.push(spawn_reader(out, log, buffer.clone(), inv, "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            let log = tokio::fs::File::from_std(log);
            readers.push(spawn_reader(err, log, buffer.clone(), inv, "stderr"));
        }

        Ok(HeadlessProcess {
            pid: child.id(),
            exited: false,
            child,
            readers,
            buffer,
        })
    }

    fn spawn_script(
        &self,
        inv: &AgentInvocation,
        template: &str,
    ) -> anyhow::Result<ScriptProcess> {
        let run_dir = self.executions.run_dir(&inv.execution_id);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let files = ScriptFiles::new(&run_dir);
        let script = render_wrapper_script(inv, &files);
        std::fs::write(&files.script, script)
            .with_context(|| format!("failed to write {}", files.script.display()))?;

        let argv = render_launcher(template, &files.script, inv)?;
        tracing::debug!(task_id = %inv.task_id, launcher = ?argv, "launching agent via wrapper script");
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&inv.working_dir)
            .envs(inv.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // A launcher that runs the script itself becomes the group leader, so the
        // recorded pid addresses the whole agent pipeline.
        #[cfg(unix)]
        cmd.process_group(0);
        let launcher = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", argv[0]))?;

        Ok(ScriptProcess {
            files,
            launcher: Some(launcher),
            launcher_failed: None,
            settled: false,
            poll_interval: self.poll_interval,
            max_output_bytes: self.max_output_bytes,
        })
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(
        &self,
        invocation: &AgentInvocation,
        mode: &LaunchMode,
    ) -> Result<Box<dyn AgentProcess>, QueueError> {
        if !invocation.working_dir.is_dir() {
            return Err(QueueError::Spawn(format!(
                "project directory {} does not exist",
                invocation.working_dir.display()
            )));
        }
        let spawned: anyhow::Result<Box<dyn AgentProcess>> = match mode {
            LaunchMode::Headless => self
                .spawn_headless(invocation)
                .map(|p| Box::new(p) as Box<dyn AgentProcess>),
            LaunchMode::VisibleTerminal { template } => {
                let template = template
                    .clone()
                    .or_else(|| default_terminal_template().map(str::to_owned));
                match template {
                    Some(t) => self
                        .spawn_script(invocation, &t)
                        .map(|p| Box::new(p) as Box<dyn AgentProcess>),
                    None => Err(anyhow::anyhow!(
                        "no terminal launcher known for this platform; set terminal.terminal_command"
                    )),
                }
            }
            LaunchMode::CustomCommand { template } => self
                .spawn_script(invocation, template)
                .map(|p| Box::new(p) as Box<dyn AgentProcess>),
        };
        spawned.map_err(|e| QueueError::Spawn(format!("{e:#}")))
    }
}

struct HeadlessProcess {
    pid: Option<u32>,
    /// Set once the child has been reaped.
    exited: bool,
    child: tokio::process::Child,
    readers: Vec<JoinHandle<()>>,
    buffer: Arc<Mutex<OutputBuffer>>,
}

impl HeadlessProcess {
    async fn drain_readers(&mut self) {
        while let Some(handle) = self.readers.last_mut() {
            let _ = handle.await;
            self.readers.pop();
        }
    }

    fn finish(&self, exit_code: Option<i32>, terminated: bool) -> ProcessExit {
        let buffer = lock(&self.buffer);
        let (tokens, cost_usd) = buffer
            .result_line
            .as_deref()
            .and_then(parse_agent_result)
            .unwrap_or((None, None));
        ProcessExit {
            exit_code,
            output: buffer.text(),
            tokens,
            cost_usd,
            terminated,
        }
    }
}

#[async_trait]
impl AgentProcess for HeadlessProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> anyhow::Result<ProcessExit> {
        let status = self.child.wait().await?;
        self.exited = true;
        self.drain_readers().await;
        Ok(self.finish(status.code(), false))
    }

    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<ProcessExit> {
        if let Some(pid) = self.pid {
            signal(pid, Signal::Interrupt);
        }
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(res) => res?,
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "agent ignored interrupt; killing");
                if let Some(pid) = self.pid {
                    signal(pid, Signal::Kill);
                }
                let _ = self.child.kill().await;
                self.child.wait().await?
            }
        };
        self.exited = true;
        self.drain_readers().await;
        Ok(self.finish(status.code(), true))
    }
}

impl Drop for HeadlessProcess {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the child; take its process group too.
        if !self.exited
            && let Some(pid) = self.pid
        {
            signal(pid, Signal::Kill);
        }
    }
}

fn spawn_reader<R>(
    stream: R,
    mut log: tokio::fs::File,
    buffer: Arc<Mutex<OutputBuffer>>,
    inv: &AgentInvocation,
    stream_name: &'static str,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let exec_id = inv.execution_id.clone();
    let task_id = inv.task_id.clone();
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lock(&buffer).push_line(&line, stream_name == "stdout");
            if line.trim().is_empty() {
                continue;
            }
            let entry = build_log_entry(&exec_id, &task_id, stream_name, &line);
            let mut s = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_owned());
            s.push('\n');
            let _ = log.write_all(s.as_bytes()).await;
        }
        let _ = log.flush().await;
    })
}

#[derive(Debug, Clone)]
struct ScriptFiles {
    script: PathBuf,
    pid: PathBuf,
    exit: PathBuf,
    output: PathBuf,
}

impl ScriptFiles {
    fn new(run_dir: &Path) -> Self {
        Self {
            script: run_dir.join("run.sh"),
            pid: run_dir.join("pid"),
            exit: run_dir.join("exit"),
            output: run_dir.join("output.log"),
        }
    }

    fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid).ok()?.trim().parse().ok()
    }

    fn read_exit(&self) -> Option<i32> {
        std::fs::read_to_string(&self.exit).ok()?.trim().parse().ok()
    }
}

struct ScriptProcess {
    files: ScriptFiles,
    launcher: Option<tokio::process::Child>,
    launcher_failed: Option<i32>,
    /// Set once the wrapper is known to be gone.
    settled: bool,
    poll_interval: Duration,
    max_output_bytes: usize,
}

impl ScriptProcess {
    /// Non-blocking look at the wrapper's state.
    fn poll(&mut self) -> anyhow::Result<Option<ProcessExit>> {
        if let Some(code) = self.files.read_exit() {
            self.settled = true;
            return Ok(Some(self.finish(Some(code), false)));
        }
        self.reap_launcher()?;
        match self.files.read_pid() {
            Some(pid) if !pid_alive(pid) => {
                // The wrapper is gone without writing an exit code: it was killed
                // or its window was closed.
                self.settled = true;
                Ok(Some(self.finish(self.files.read_exit(), false)))
            }
            Some(_) => Ok(None),
            None => match self.launcher_failed {
                Some(code) => anyhow::bail!("terminal launcher exited with code {code}"),
                None => Ok(None),
            },
        }
    }

    /// Collects the launcher if it has exited, so a wrapper that is the launcher
    /// itself does not linger as a zombie and read as alive.
    fn reap_launcher(&mut self) -> std::io::Result<()> {
        if let Some(launcher) = self.launcher.as_mut()
            && let Some(status) = launcher.try_wait()?
        {
            self.launcher = None;
            if !status.success() {
                self.launcher_failed = Some(status.code().unwrap_or(1));
            }
        }
        Ok(())
    }

    fn wrapper_alive(&mut self, pid: u32) -> bool {
        let _ = self.reap_launcher();
        pid_alive(pid)
    }

    fn finish(&self, exit_code: Option<i32>, terminated: bool) -> ProcessExit {
        let raw = std::fs::read_to_string(&self.files.output).unwrap_or_default();
        let mut buffer = OutputBuffer::new(self.max_output_bytes);
        for line in raw.lines() {
            buffer.push_line(line, true);
        }
        let (tokens, cost_usd) = buffer
            .result_line
            .as_deref()
            .and_then(parse_agent_result)
            .unwrap_or((None, None));
        ProcessExit {
            exit_code,
            output: buffer.text(),
            tokens,
            cost_usd,
            terminated,
        }
    }
}

#[async_trait]
impl AgentProcess for ScriptProcess {
    fn pid(&self) -> Option<u32> {
        self.files.read_pid()
    }

    async fn wait(&mut self) -> anyhow::Result<ProcessExit> {
        loop {
            if let Some(exit) = self.poll()? {
                return Ok(exit);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<ProcessExit> {
        let Some(pid) = self.files.read_pid() else {
            if let Some(launcher) = self.launcher.as_mut() {
                let _ = launcher.kill().await;
            }
            self.settled = true;
            return Ok(self.finish(None, true));
        };
        signal(pid, Signal::Interrupt);
        let deadline = tokio::time::Instant::now() + grace;
        while self.wrapper_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval.min(grace)).await;
        }
        if self.wrapper_alive(pid) {
            tracing::warn!(pid, "wrapper ignored interrupt; killing");
            signal(pid, Signal::Kill);
        }
        self.settled = true;
        Ok(self.finish(self.files.read_exit(), true))
    }
}

impl Drop for ScriptProcess {
    fn drop(&mut self) {
        if self.settled || self.files.read_exit().is_some() {
            return;
        }
        if let Some(pid) = self.files.read_pid()
            && self.wrapper_alive(pid)
        {
            tracing::warn!(pid, "abandoning wrapper; killing its process group");
            signal(pid, Signal::Kill);
        }
    }
}

fn render_wrapper_script(inv: &AgentInvocation, files: &ScriptFiles) -> String {
    let exit = files.exit.to_string_lossy();
    let exit_tmp = format!("{exit}.tmp");
    let mut s = String::from("#!/bin/sh\n");
    s.push_str(&format!("echo $$ > {}\n", quote(&files.pid.to_string_lossy())));
    for (k, v) in &inv.env {
        s.push_str(&format!("export {k}={}\n", quote(v)));
    }
    s.push_str(&format!(
        "cd {} || {{ echo 127 > {}; exit 127; }}\n",
        quote(&inv.working_dir.to_string_lossy()),
        quote(&exit)
    ));
    s.push_str(&format!(
        "( {}; echo $? > {} ) 2>&1 | tee {}\n",
        inv.shell_line(),
        quote(&exit_tmp),
        quote(&files.output.to_string_lossy())
    ));
    s.push_str(&format!("mv {} {}\n", quote(&exit_tmp), quote(&exit)));
    s
}

/// Substitutes `{{script}}`, `{{cwd}}` and `{{command}}` and splits the result
/// into argv without going through a shell.
pub fn render_launcher(
    template: &str,
    script: &Path,
    inv: &AgentInvocation,
) -> anyhow::Result<Vec<String>> {
    if !template.contains("{{script}}") && !template.contains("{{command}}") {
        anyhow::bail!("launch template must contain {{{{script}}}} or {{{{command}}}}: {template}");
    }
    let rendered = template
        .replace("{{script}}", &quote(&script.to_string_lossy()))
        .replace("{{cwd}}", &quote(&inv.working_dir.to_string_lossy()))
        .replace("{{command}}", &quote(&inv.shell_line()));
    shlex::split(&rendered)
        .filter(|argv| !argv.is_empty())
        .ok_or_else(|| anyhow::anyhow!("cannot parse launch template: {template}"))
}

fn default_terminal_template() -> Option<&'static str> {
    if cfg!(target_os = "macos") {
        Some("osascript -e 'tell application \"Terminal\" to do script \"sh '{{script}}'\"'")
    } else if cfg!(unix) {
        Some("x-terminal-emulator -e sh {{script}}")
    } else {
        None
    }
}

fn quote(s: &str) -> String {
    shlex::try_quote(s).map_or_else(|_| format!("'{}'", s.replace('\'', "'\\''")), Into::into)
}

/// Keeps the tail of the combined output within `max_bytes`.
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
    result_line: Option<String>,
}

impl OutputBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
            result_line: None,
        }
    }

    fn push_line(&mut self, line: &str, is_stdout: bool) {
        if is_stdout && looks_like_result(line) {
            self.result_line = Some(line.to_owned());
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_owned());
        while self.bytes > self.max_bytes && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
                self.truncated = true;
            }
        }
    }

    fn text(&self) -> String {
        let mut out = String::with_capacity(self.bytes + 32);
        if self.truncated {
            out.push_str("[output truncated]\n");
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

fn looks_like_result(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('{') && (t.contains("\"total_cost_usd\"") || t.contains("\"type\":\"result\""))
}

/// Pulls token usage and cost out of the agent's final JSON result.
pub fn parse_agent_result(line: &str) -> Option<(Option<u64>, Option<f64>)> {
    let v: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let obj = v.as_object()?;
    let cost = obj
        .get("total_cost_usd")
        .or_else(|| obj.get("cost_usd"))
        .and_then(serde_json::Value::as_f64);
    let tokens = obj.get("usage").and_then(|u| {
        let input = u.get("input_tokens").and_then(serde_json::Value::as_u64);
        let output = u.get("output_tokens").and_then(serde_json::Value::as_u64);
        match (input, output) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
        }
    });
    if cost.is_none() && tokens.is_none() {
        return None;
    }
    Some((tokens, cost))
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Kill,
}

/// Signals the process group first, then the pid itself. Best-effort.
#[cfg(unix)]
fn signal(pid: u32, sig: Signal) {
    use nix::sys::signal::{self as nix_signal, Signal as NixSignal};

    let Some(pid) = unix_pid(pid) else {
        return;
    };
    let sig = match sig {
        Signal::Interrupt => NixSignal::SIGINT,
        Signal::Kill => NixSignal::SIGKILL,
    };
    if nix_signal::killpg(pid, sig).is_err() {
        let _ = nix_signal::kill(pid, sig);
    }
}

#[cfg(windows)]
fn signal(pid: u32, _sig: Signal) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", pid.to_string().as_str(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Some(pid) = unix_pid(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to someone else.
    matches!(
        nix::sys::signal::kill(pid, None),
        Ok(()) | Err(nix::errno::Errno::EPERM)
    )
}

#[cfg(windows)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", format!("PID eq {pid}").as_str(), "/NH"])
        .output()
        .is_ok_and(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
}

/// Pids 0 and 1 would address our own group or init; never signal those.
#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 1)
        .map(nix::unistd::Pid::from_raw)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
