use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Health status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// Registered and dispatchable.
    Active,
    /// Currently executing a task.
    Processing,
    /// Demoted after a period of inactivity; still dispatchable.
    Idle,
    /// Last dispatch ended in an error.
    Error,
    /// Circuit breaker is open; dispatch refused until cool-down.
    CircuitOpen,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentHealth::Active => write!(f, "active"),
            AgentHealth::Processing => write!(f, "processing"),
            AgentHealth::Idle => write!(f, "idle"),
            AgentHealth::Error => write!(f, "error"),
            AgentHealth::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// Rolling performance metrics for one agent.
///
/// `avg_latency_ms` is an exponential moving average with alpha 0.2; the
/// first sample seeds the average directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Total dispatches recorded, successes and failures.
    pub requests: u64,
    /// Total failed dispatches.
    pub errors: u64,
    /// Exponential moving average of dispatch latency.
    pub avg_latency_ms: f64,
    /// UTC time of the most recent recorded outcome.
    pub last_active: Option<DateTime<Utc>>,
}

const LATENCY_EMA_ALPHA: f64 = 0.2;

impl AgentMetrics {
    /// Record one dispatch outcome into the rolling metrics.
    pub fn record(&mut self, latency_ms: u64, success: bool) {
        if self.requests == 0 {
            self.avg_latency_ms = latency_ms as f64;
        } else {
            self.avg_latency_ms = LATENCY_EMA_ALPHA * latency_ms as f64
                + (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms;
        }
        self.requests += 1;
        if !success {
            self.errors += 1;
        }
        self.last_active = Some(Utc::now());
    }

    /// Fraction of recorded dispatches that succeeded. 1.0 when untried.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 1.0;
        }
        (self.requests - self.errors) as f64 / self.requests as f64
    }
}

/// Read-only snapshot of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Unique agent name.
    pub name: String,
    /// Task names this agent can serve.
    pub capabilities: Vec<String>,
    /// Optional specialization tag matched by selection requirements.
    pub specialization: Option<String>,
    /// Current health status.
    pub health: AgentHealth,
    /// Rolling performance metrics.
    pub metrics: AgentMetrics,
    /// Zero-based registration order, used as the selection tiebreak.
    pub registration_order: usize,
}

/// A unit of work submitted to the dispatcher. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Generated task id.
    pub id: Uuid,
    /// Target capability name.
    pub capability: String,
    /// Opaque structured input payload.
    pub input: Value,
    /// Optional latency budget; exceeding it counts as a failure.
    pub max_latency_ms: Option<u64>,
    /// Optional required specialization tag.
    pub specialization: Option<String>,
    /// UTC creation time.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task targeting the given capability.
    pub fn new(capability: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability: capability.into(),
            input,
            max_latency_ms: None,
            specialization: None,
            created_at: Utc::now(),
        }
    }

    /// Set a latency budget in milliseconds.
    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    /// Require a specialization tag.
    pub fn with_specialization(mut self, tag: impl Into<String>) -> Self {
        self.specialization = Some(tag.into());
        self
    }
}

/// The output of a successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Agent that produced the output.
    pub agent: String,
    /// Structured output payload.
    pub output: Value,
    /// Measured latency of the winning attempt.
    pub latency_ms: u64,
}

/// A completed step within a workflow, in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name from the workflow definition.
    pub step: String,
    /// The step's dispatch result.
    pub result: TaskResult,
}

/// An error recorded against a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Step name, or a synthetic name for workflow-level errors.
    pub step: String,
    /// Error message.
    pub message: String,
    /// UTC time the error was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Status of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet executing.
    Pending,
    /// At least one step is executing or awaited.
    Running,
    /// All steps finished successfully.
    Completed,
    /// Terminal failure; `reason` explains why (step errors, timeout,
    /// or "cancelled").
    Failed {
        /// Why the workflow failed.
        reason: String,
    },
}

impl WorkflowStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed { .. })
    }
}

/// Mutable state of one workflow instance.
///
/// Owned by the workflow engine for the duration of the run; external
/// callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Generated workflow id.
    pub id: Uuid,
    /// The workflow definition this instance was started from.
    pub kind: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Completed step results, in completion order.
    pub steps: Vec<StepRecord>,
    /// Errors recorded against steps.
    pub errors: Vec<WorkflowError>,
    /// UTC start time.
    pub started_at: DateTime<Utc>,
    /// UTC finish time, set when the status becomes terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create a pending workflow state for the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            status: WorkflowStatus::Pending,
            steps: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Look up a completed step's output by step name.
    pub fn step_output(&self, step: &str) -> Option<&Value> {
        self.steps
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.result.output)
    }

    /// Record an error against a step.
    pub fn record_error(&mut self, step: impl Into<String>, message: impl Into<String>) {
        self.errors.push(WorkflowError {
            step: step.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

/// Requirements a caller attaches to agent selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionRequirements {
    /// Preferred specialization tag; matching agents score a bonus.
    pub specialization: Option<String>,
}

/// An aggregated, read-only combination of a workflow's step outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AggregatedResult {
    /// Keyed union of step outputs; keys are step names.
    Merge {
        /// step name → step output.
        merged: serde_json::Map<String, Value>,
    },
    /// Majority value across step outputs.
    Consensus {
        /// The majority value.
        value: Value,
        /// Fraction of steps agreeing with the majority.
        confidence: f64,
        /// Step outputs that did not match the majority.
        disagreements: Vec<Value>,
    },
    /// Weighted combination of step outputs.
    Weighted {
        /// field name → weighted-average number or weight-vote category.
        combined: serde_json::Map<String, Value>,
    },
}
