#![forbid(unsafe_code)]

use serde::Serialize;
use tokio::sync::broadcast;

use crate::task::auto_action::{AutoActionType, CancelReason};
use crate::task::model::TaskStatus;

/// State changes published by the engine. Observers only read these; nothing
/// they do flows back into engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskCreated {
        task_id: String,
    },
    TaskUpdated {
        task_id: String,
        status: TaskStatus,
    },
    TaskDeleted {
        task_id: String,
    },
    PartitionReordered {
        status: TaskStatus,
    },
    TaskReconciled {
        task_id: String,
        status: TaskStatus,
    },
    QueueStarted,
    TaskStarted {
        task_id: String,
        launch_mode: String,
    },
    TaskFinished {
        task_id: String,
        status: TaskStatus,
        exit_code: Option<i32>,
    },
    TaskSkipped {
        task_id: String,
        dependency: String,
    },
    /// A launch failure. Sent once per queue run; it usually means the agent
    /// binary or terminal launcher is misconfigured.
    SpawnFailed {
        task_id: String,
        error: String,
    },
    /// A finished task's result could not be written. The runner keeps the
    /// task and halts until a retry succeeds.
    PersistenceFailed {
        task_id: String,
        error: String,
    },
    QueueStopped,
    QueueDrained,
    AutoActionArmed {
        action: AutoActionType,
        remaining_seconds: u64,
    },
    AutoActionTick {
        remaining_seconds: u64,
    },
    AutoActionCancelled {
        reason: CancelReason,
    },
    AutoActionFired {
        action: AutoActionType,
    },
    AutoActionFailed {
        action: AutoActionType,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn publish(&self, event: QueueEvent) {
        tracing::trace!(?event, "queue event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        bus.publish(QueueEvent::QueueStarted);
        let mut rx = bus.subscribe();
        bus.publish(QueueEvent::QueueDrained);
        assert_eq!(rx.recv().await.unwrap(), QueueEvent::QueueDrained);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let v = serde_json::to_value(QueueEvent::TaskFinished {
            task_id: "t1".to_owned(),
            status: TaskStatus::Failed,
            exit_code: Some(2),
        })
        .unwrap();
        assert_eq!(v["event"], "task_finished");
        assert_eq!(v["status"], "failed");
    }
}
