#![forbid(unsafe_code)]

//! One-shot "when the queue drains, put the machine to sleep / shut it down".
//!
//! The scheduler is a plain state machine (`Idle` / `CountingDown`); the engine
//! owns the clock and calls [`AutoActionScheduler::tick`] once per second. Firing
//! and cancelling both disarm the configuration, so an old setting never re-arms
//! itself on some later, unrelated drain.

use std::process::Command;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutoActionType {
    #[default]
    None,
    Sleep,
    Shutdown,
}

impl AutoActionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sleep => "sleep",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "sleep" | "suspend" => Some(Self::Sleep),
            "shutdown" | "poweroff" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for AutoActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoActionConfig {
    pub enabled: bool,
    pub action_type: AutoActionType,
    pub delay_minutes: u32,
}

impl Default for AutoActionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            action_type: AutoActionType::None,
            delay_minutes: 5,
        }
    }
}

impl AutoActionConfig {
    #[must_use]
    pub fn armed(action_type: AutoActionType, delay_minutes: u32) -> Self {
        Self {
            enabled: true,
            action_type,
            delay_minutes,
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.enabled && self.action_type != AutoActionType::None && self.delay_minutes > 0
    }

    #[must_use]
    pub fn disarmed(self) -> Self {
        Self {
            enabled: false,
            action_type: AutoActionType::None,
            delay_minutes: self.delay_minutes,
        }
    }
}

/// Observer-facing snapshot.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AutoActionState {
    pub timer_active: bool,
    pub remaining_seconds: u64,
    pub action_type: AutoActionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Idle,
    CountingDown {
        remaining_seconds: u64,
        action: AutoActionType,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    TaskQueued,
    QueueRestarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Counting(u64),
    Fire(AutoActionType),
}

#[derive(Debug, Clone)]
pub struct AutoActionScheduler {
    config: AutoActionConfig,
    timer: Timer,
    generation: u64,
}

impl AutoActionScheduler {
    #[must_use]
    pub fn new(config: AutoActionConfig) -> Self {
        Self {
            config,
            timer: Timer::Idle,
            generation: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> AutoActionConfig {
        self.config
    }

    /// Replaces the configuration. A countdown already in progress keeps the
    /// action it was started with.
    pub fn set_config(&mut self, config: AutoActionConfig) {
        self.config = config;
    }

    #[must_use]
    pub fn is_counting(&self) -> bool {
        matches!(self.timer, Timer::CountingDown { .. })
    }

    /// Identifies the current countdown so a ticker left over from a cancelled
    /// one can tell it is stale.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn state(&self) -> AutoActionState {
        match self.timer {
            Timer::Idle => AutoActionState {
                timer_active: false,
                remaining_seconds: 0,
                action_type: self.config.action_type,
            },
            Timer::CountingDown {
                remaining_seconds,
                action,
            } => AutoActionState {
                timer_active: true,
                remaining_seconds,
                action_type: action,
            },
        }
    }

    /// Starts the countdown if the configuration asks for one. Returns the new
    /// generation and the starting number of seconds.
    pub fn arm(&mut self) -> Option<(u64, u64)> {
        if self.is_counting() || !self.config.is_armed() {
            return None;
        }
        let seconds = u64::from(self.config.delay_minutes) * 60;
        self.timer = Timer::CountingDown {
            remaining_seconds: seconds,
            action: self.config.action_type,
        };
        self.generation += 1;
        Some((self.generation, seconds))
    }

    pub fn tick(&mut self) -> TickOutcome {
        let Timer::CountingDown {
            remaining_seconds,
            action,
        } = self.timer
        else {
            return TickOutcome::Idle;
        };
        let remaining = remaining_seconds.saturating_sub(1);
        if remaining == 0 {
            self.timer = Timer::Idle;
            self.config = self.config.disarmed();
            return TickOutcome::Fire(action);
        }
        self.timer = Timer::CountingDown {
            remaining_seconds: remaining,
            action,
        };
        TickOutcome::Counting(remaining)
    }

    /// Stops a running countdown and disarms. Returns `false` if nothing was counting.
    pub fn cancel(&mut self) -> bool {
        if !self.is_counting() {
            return false;
        }
        self.timer = Timer::Idle;
        self.config = self.config.disarmed();
        true
    }

    /// Disarms without a countdown in progress (explicit user cancel while idle).
    pub fn disarm(&mut self) -> bool {
        let was_armed = self.config.enabled || self.config.action_type != AutoActionType::None;
        self.timer = Timer::Idle;
        self.config = self.config.disarmed();
        was_armed
    }
}

/// Performs the host-level action.
pub trait SystemActionInvoker: Send + Sync {
    fn invoke(&self, action: AutoActionType) -> anyhow::Result<()>;
}

/// Runs the platform's sleep/shutdown command, or a configured override.
#[derive(Debug, Clone, Default)]
pub struct HostActionInvoker {
    pub sleep_command: Option<String>,
    pub shutdown_command: Option<String>,
}

impl HostActionInvoker {
    #[must_use]
    pub fn new(sleep_command: Option<String>, shutdown_command: Option<String>) -> Self {
        Self {
            sleep_command: sleep_command.filter(|s| !s.trim().is_empty()),
            shutdown_command: shutdown_command.filter(|s| !s.trim().is_empty()),
        }
    }

    /// The argv that `invoke` would run for `action`.
    pub fn command_for(&self, action: AutoActionType) -> anyhow::Result<Vec<String>> {
        let line = match action {
            AutoActionType::None => anyhow::bail!("no system action configured"),
            AutoActionType::Sleep => self
                .sleep_command
                .clone()
                .unwrap_or_else(|| default_sleep_command().to_owned()),
            AutoActionType::Shutdown => self
                .shutdown_command
                .clone()
                .unwrap_or_else(|| default_shutdown_command().to_owned()),
        };
        let argv = shlex::split(&line)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("cannot parse {action} command: {line}"))?;
        Ok(argv)
    }
}

impl SystemActionInvoker for HostActionInvoker {
    fn invoke(&self, action: AutoActionType) -> anyhow::Result<()> {
        let argv = self.command_for(action)?;
        tracing::info!(%action, command = ?argv, "running system action");
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .status()
            .map_err(|e| anyhow::anyhow!("failed to run {}: {e}", argv[0]))?;
        if !status.success() {
            anyhow::bail!(
                "{action} command exited with code {}",
                status.code().unwrap_or(1)
            );
        }
        Ok(())
    }
}

fn default_sleep_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "pmset sleepnow"
    } else if cfg!(windows) {
        "rundll32.exe powrprof.dll,SetSuspendState 0,1,0"
    } else {
        "systemctl suspend"
    }
}

fn default_shutdown_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "osascript -e 'tell application \"System Events\" to shut down'"
    } else if cfg!(windows) {
        "shutdown /s /t 0"
    } else {
        "systemctl poweroff"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_and_fires_once() {
        let mut s = AutoActionScheduler::new(AutoActionConfig::armed(AutoActionType::Shutdown, 1));
        assert_eq!(s.arm(), Some((1, 60)));
        assert!(s.arm().is_none());

        for expected in (1..60).rev() {
            assert_eq!(s.tick(), TickOutcome::Counting(expected));
        }
        assert_eq!(s.tick(), TickOutcome::Fire(AutoActionType::Shutdown));
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert!(!s.config().enabled);
        assert_eq!(s.config().action_type, AutoActionType::None);
        assert!(s.arm().is_none());
    }

    #[test]
    fn config_edits_do_not_change_pending_action() {
        let mut s = AutoActionScheduler::new(AutoActionConfig::armed(AutoActionType::Sleep, 1));
        s.arm().unwrap();
        s.set_config(AutoActionConfig::armed(AutoActionType::Shutdown, 10));
        assert_eq!(s.state().action_type, AutoActionType::Sleep);
        for _ in 0..59 {
            s.tick();
        }
        assert_eq!(s.tick(), TickOutcome::Fire(AutoActionType::Sleep));
    }

    #[test]
    fn cancel_disarms() {
        let mut s = AutoActionScheduler::new(AutoActionConfig::armed(AutoActionType::Sleep, 2));
        assert!(!s.cancel());
        s.arm().unwrap();
        s.tick();
        assert!(s.cancel());
        let state = s.state();
        assert!(!state.timer_active);
        assert_eq!(state.remaining_seconds, 0);
        assert!(!s.config().is_armed());
        assert_eq!(s.tick(), TickOutcome::Idle);
    }

    #[test]
    fn disabled_or_none_never_arms() {
        let mut s = AutoActionScheduler::new(AutoActionConfig::default());
        assert!(s.arm().is_none());
        s.set_config(AutoActionConfig {
            enabled: true,
            action_type: AutoActionType::None,
            delay_minutes: 1,
        });
        assert!(s.arm().is_none());
    }

    #[test]
    fn host_invoker_uses_overrides() {
        let inv = HostActionInvoker::new(Some("echo 'going to sleep'".to_owned()), None);
        assert_eq!(
            inv.command_for(AutoActionType::Sleep).unwrap(),
            ["echo", "going to sleep"]
        );
        assert!(!inv.command_for(AutoActionType::Shutdown).unwrap().is_empty());
        assert!(inv.command_for(AutoActionType::None).is_err());
    }
}
