//! Agent-orchestration supervisor: registry, dispatch, workflows, scheduling.
//!
//! Coordinates a fleet of heterogeneous agents behind one handle. Tasks are
//! dispatched with retry, failover, and a per-agent circuit breaker; multi-step
//! workflows run as fan-out/fan-in or sequential pipelines with conditional
//! routing; step outputs are combined by pluggable aggregation strategies.
//!
//! # Main types
//!
//! - [`Supervisor`] — Front door owning every subsystem; one handle per deployment.
//! - [`AgentRegistry`] — Named agents with capabilities, health, and metrics.
//! - [`TaskDispatcher`] — Retry/failover dispatch guarded by circuit breakers.
//! - [`AgentSelector`] — Scores capable agents and breaks ties deterministically.
//! - [`WorkflowEngine`] — Runs registered [`WorkflowDefinition`]s with cancellation.
//! - [`Scheduler`] — Interval-based recurring workflows and the health sweep.

/// Aggregation strategies for combining step outputs.
pub mod aggregator;
/// Per-agent circuit breaker state machine.
pub mod breaker;
/// Task dispatch with retry, failover, and timeouts.
pub mod dispatcher;
/// Append-only JSONL record of finished workflows.
pub mod history;
/// Agent registration, health, and metrics.
pub mod registry;
/// Recurring workflow launches and the agent health sweep.
pub mod scheduler;
/// Capability-based agent selection.
pub mod selector;
/// The top-level supervisor facade.
pub mod supervisor;
/// Shared task, agent, and workflow types.
pub mod types;
/// Workflow execution engine.
pub mod workflow;

pub use aggregator::{aggregate, AggregationStrategy};
pub use breaker::{BreakerState, CircuitBreaker};
pub use dispatcher::TaskDispatcher;
pub use history::WorkflowHistory;
pub use registry::{AgentExecutor, AgentRegistry};
pub use scheduler::{RecurringWorkflow, Scheduler};
pub use selector::AgentSelector;
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use types::{
    AgentHealth, AgentMetrics, AgentSnapshot, AggregatedResult, SelectionRequirements, StepRecord,
    Task, TaskResult, WorkflowError, WorkflowState, WorkflowStatus,
};
pub use workflow::{
    FailurePolicy, RouteRule, SeqStep, StepDef, WorkflowDefinition, WorkflowEngine,
};
