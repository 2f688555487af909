use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Outcome of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The executor returned a result.
    Success,
    /// The executor returned an error.
    Failure,
    /// Dispatch was refused because the agent's circuit is open.
    CircuitOpen,
    /// The attempt exceeded the task's latency budget.
    Timeout,
}

/// A status event pushed to subscribers.
///
/// Delivery is at-most-once per subscriber with no replay: slow subscribers
/// may miss events, and publishing with zero subscribers is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A dispatch attempt completed (success or failure).
    Dispatch {
        /// Agent the task was dispatched to.
        agent: String,
        /// Capability name of the task.
        task: String,
        /// How the attempt ended.
        outcome: DispatchOutcome,
        /// Measured attempt latency in milliseconds.
        latency_ms: u64,
        /// UTC time the outcome was recorded.
        timestamp: DateTime<Utc>,
    },
    /// A workflow step changed status.
    WorkflowStep {
        /// The workflow instance.
        workflow_id: Uuid,
        /// Step name within the workflow.
        step: String,
        /// New status, e.g. "running", "completed", "failed".
        status: String,
    },
    /// An agent's health status changed.
    AgentHealthChanged {
        /// The agent whose health changed.
        agent: String,
        /// Previous health status.
        from: String,
        /// New health status.
        to: String,
        /// UTC time of the transition.
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`StatusEvent`]s.
///
/// Thin wrapper over [`tokio::sync::broadcast`]; cheap to clone and share.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// A send error only means there are no subscribers; it is ignored.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
