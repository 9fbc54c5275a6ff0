#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    #[default]
    Headless,
    Terminal,
    Custom,
}

impl TerminalMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::Terminal => "terminal",
            Self::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "headless" | "background" => Some(Self::Headless),
            "terminal" | "visible" | "window" => Some(Self::Terminal),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// How the agent process for one task gets launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Output captured into a buffer, no window.
    Headless,
    /// A new terminal window. `template` overrides the platform launcher.
    VisibleTerminal { template: Option<String> },
    /// User template; `{{script}}`, `{{cwd}}` and `{{command}}` are substituted.
    CustomCommand { template: String },
}

impl LaunchMode {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::VisibleTerminal { .. } => "terminal",
            Self::CustomCommand { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalChoice {
    pub mode: TerminalMode,
    pub custom_command: Option<String>,
    pub remembered: bool,
}

impl TerminalChoice {
    #[must_use]
    pub fn new(mode: TerminalMode) -> Self {
        Self {
            mode,
            custom_command: None,
            remembered: false,
        }
    }

    #[must_use]
    pub fn remember(mut self) -> Self {
        self.remembered = true;
        self
    }

    #[must_use]
    pub fn with_command(mut self, template: impl Into<String>) -> Self {
        self.custom_command = Some(template.into());
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.mode == TerminalMode::Custom
            && self
                .custom_command
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(QueueError::Validation(
                "custom launch mode needs a command template".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Decides how the runner launches the agent. A choice made for this session
/// wins over the remembered one; without either, the runner asks the caller.
#[derive(Debug, Clone, Default)]
pub struct TerminalPolicy {
    session: Option<TerminalChoice>,
    remembered: Option<TerminalChoice>,
    terminal_template: Option<String>,
}

impl TerminalPolicy {
    #[must_use]
    pub fn new(remembered: Option<TerminalChoice>, terminal_template: Option<String>) -> Self {
        Self {
            session: None,
            remembered: remembered.filter(|c| c.remembered && c.validate().is_ok()),
            terminal_template: terminal_template.filter(|t| !t.trim().is_empty()),
        }
    }

    #[must_use]
    pub fn remembered(&self) -> Option<&TerminalChoice> {
        self.remembered.as_ref()
    }

    #[must_use]
    pub fn current_choice(&self) -> Option<&TerminalChoice> {
        self.session.as_ref().or(self.remembered.as_ref())
    }

    #[must_use]
    pub fn resolve_launch_mode(&self) -> Option<LaunchMode> {
        let choice = self.current_choice()?;
        Some(match choice.mode {
            TerminalMode::Headless => LaunchMode::Headless,
            TerminalMode::Terminal => LaunchMode::VisibleTerminal {
                template: self.terminal_template.clone(),
            },
            TerminalMode::Custom => LaunchMode::CustomCommand {
                template: choice.custom_command.clone().unwrap_or_default(),
            },
        })
    }

    /// Records a choice. Returns `true` when it should be persisted as remembered.
    pub fn select(&mut self, choice: TerminalChoice) -> Result<bool, QueueError> {
        choice.validate()?;
        let persist = choice.remembered;
        if persist {
            self.remembered = Some(choice.clone());
        }
        self.session = Some(choice);
        Ok(persist)
    }

    pub fn forget(&mut self) {
        self.session = None;
        self.remembered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_choice_means_no_launch_mode() {
        let policy = TerminalPolicy::default();
        assert!(policy.resolve_launch_mode().is_none());

        // A stored choice that was never marked remembered does not count.
        let policy = TerminalPolicy::new(Some(TerminalChoice::new(TerminalMode::Headless)), None);
        assert!(policy.resolve_launch_mode().is_none());
    }

    #[test]
    fn session_choice_overrides_remembered() {
        let mut policy = TerminalPolicy::new(
            Some(TerminalChoice::new(TerminalMode::Headless).remember()),
            Some("wezterm start -- sh {{script}}".to_owned()),
        );
        assert_eq!(policy.resolve_launch_mode(), Some(LaunchMode::Headless));

        let persist = policy
            .select(TerminalChoice::new(TerminalMode::Terminal))
            .unwrap();
        assert!(!persist);
        assert_eq!(
            policy.resolve_launch_mode(),
            Some(LaunchMode::VisibleTerminal {
                template: Some("wezterm start -- sh {{script}}".to_owned())
            })
        );
        assert_eq!(policy.remembered().unwrap().mode, TerminalMode::Headless);
    }

    #[test]
    fn custom_mode_requires_template() {
        let mut policy = TerminalPolicy::default();
        assert!(policy.select(TerminalChoice::new(TerminalMode::Custom)).is_err());
        let persist = policy
            .select(
                TerminalChoice::new(TerminalMode::Custom)
                    .with_command("tmux new-window sh {{script}}")
                    .remember(),
            )
            .unwrap();
        assert!(persist);
        assert!(matches!(
            policy.resolve_launch_mode(),
            Some(LaunchMode::CustomCommand { .. })
        ));
        policy.forget();
        assert!(policy.resolve_launch_mode().is_none());
    }
}
