#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Mutex;

use crate::config;
use crate::task::auto_action::AutoActionConfig;
use crate::task::launch::TerminalChoice;

/// Where user preferences that outlive one run get written.
pub trait PreferenceStore: Send + Sync {
    /// `None` clears the remembered choice.
    fn save_terminal_choice(&self, choice: Option<&TerminalChoice>) -> anyhow::Result<()>;
    fn save_auto_action(&self, config: &AutoActionConfig) -> anyhow::Result<()>;
}

/// Writes the `[terminal]` and `[auto_action]` sections of the config file.
#[derive(Debug, Clone)]
pub struct ConfigFilePreferences {
    path: PathBuf,
}

impl ConfigFilePreferences {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PreferenceStore for ConfigFilePreferences {
    fn save_terminal_choice(&self, choice: Option<&TerminalChoice>) -> anyhow::Result<()> {
        match choice {
            Some(c) => {
                let command = c.custom_command.clone().unwrap_or_default();
                config::set_values_at_path(
                    &self.path,
                    &[
                        ("terminal.remembered", "true"),
                        ("terminal.mode", c.mode.as_str()),
                        ("terminal.custom_command", command.as_str()),
                    ],
                )
            }
            None => config::set_values_at_path(&self.path, &[("terminal.remembered", "false")]),
        }
    }

    fn save_auto_action(&self, cfg: &AutoActionConfig) -> anyhow::Result<()> {
        let delay = cfg.delay_minutes.max(1).to_string();
        config::set_values_at_path(
            &self.path,
            &[
                ("auto_action.enabled", if cfg.enabled { "true" } else { "false" }),
                ("auto_action.action", cfg.action_type.as_str()),
                ("auto_action.delay_minutes", delay.as_str()),
            ],
        )
    }
}

/// Keeps preferences in memory. Used by tests and embedders without a config file.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    terminal: Mutex<Option<TerminalChoice>>,
    auto_action: Mutex<Option<AutoActionConfig>>,
}

impl MemoryPreferences {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn terminal_choice(&self) -> Option<TerminalChoice> {
        self.terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn auto_action(&self) -> Option<AutoActionConfig> {
        *self
            .auto_action
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PreferenceStore for MemoryPreferences {
    fn save_terminal_choice(&self, choice: Option<&TerminalChoice>) -> anyhow::Result<()> {
        *self
            .terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = choice.cloned();
        Ok(())
    }

    fn save_auto_action(&self, config: &AutoActionConfig) -> anyhow::Result<()> {
        *self
            .auto_action
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(*config);
        Ok(())
    }
}
