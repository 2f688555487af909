//! Core types shared across the Overseer supervisor crates.
//!
//! This crate provides the foundational pieces every other Overseer crate
//! builds on: the unified error enum, the status-event bus, and the
//! supervisor configuration.
//!
//! # Main types
//!
//! - [`SupervisorError`] — Unified error enum for all supervisor subsystems.
//! - [`SupervisorResult`] — Convenience alias for `Result<T, SupervisorError>`.
//! - [`StatusEvent`] / [`EventBus`] — Push-based status stream for observers.
//! - [`SupervisorConfig`] — Retry, circuit-breaker, and scheduler settings.

/// Supervisor configuration with TOML loading.
pub mod config;
/// Status events and the broadcast bus.
pub mod event;

pub use config::{BreakerConfig, RetryPolicy, SchedulerConfig, SupervisorConfig};
pub use event::{DispatchOutcome, EventBus, StatusEvent};

/// Top-level error type for the Overseer supervisor.
///
/// Variants mirror the supervisor's error taxonomy: lookup failures surface
/// synchronously, per-task failures are retried locally and only surface as
/// [`SupervisorError::TaskFailed`] once remediation is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No agent is registered under the given name.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// An agent with the given name is already registered.
    #[error("duplicate agent: {0}")]
    DuplicateAgent(String),

    /// The agent's circuit breaker is open; dispatch refused without
    /// invoking the executor.
    #[error("circuit open for agent: {0}")]
    CircuitOpen(String),

    /// All dispatch attempts (retries and failover included) failed.
    #[error("task failed after {attempts} attempt(s): {last_error}")]
    TaskFailed {
        /// The error produced by the final attempt.
        last_error: String,
        /// Total number of attempts made.
        attempts: u32,
    },

    /// No dispatchable agent declares the requested capability.
    #[error("no available agent for capability: {0}")]
    NoAvailableAgent(String),

    /// The aggregation strategy name is not recognized.
    #[error("unknown aggregation strategy: {0}")]
    UnknownStrategy(String),

    /// The strategy cannot be applied to the workflow's step results.
    #[error("aggregation error: {0}")]
    Aggregation(String),

    /// No workflow definition or instance matches the given kind or id.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The workflow was cancelled by the caller. Also the source of the
    /// `Failed` reason string a cancelled workflow carries.
    #[error("cancelled")]
    Cancelled,

    /// A task or workflow exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An error from an agent executor.
    #[error("agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`SupervisorError`].
pub type SupervisorResult<T> = Result<T, SupervisorError>;
