#![forbid(unsafe_code)]

//! Task lifecycle rules.
//!
//! ```text
//! backlog <-> queued -> running -> completed | failed
//!               |  ^         |
//!               |  +---------+  (startup reconciliation only)
//!               +-> skipped     (runner, failed dependency)
//! ```

use crate::task::model::TaskStatus;

/// Who is asking for a status change. Users only move tasks between backlog and queue;
/// everything touching `running` belongs to the runner or to startup reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOrigin {
    User,
    Runner,
    Reconciliation,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Queued or running: the states that keep the queue from being drained.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    #[must_use]
    pub fn can_transition(self, to: Self, origin: TransitionOrigin) -> bool {
        use TaskStatus::{Backlog, Completed, Failed, Queued, Running, Skipped};
        use TransitionOrigin::{Reconciliation, Runner, User};

        match (self, to, origin) {
            (Backlog, Queued, User) | (Queued, Backlog, User) => true,
            (Queued, Running | Skipped, Runner) => true,
            (Running, Completed | Failed, Runner) => true,
            (Running, Queued | Failed, Reconciliation) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_deletable(self) -> bool {
        self != Self::Running
    }
}
