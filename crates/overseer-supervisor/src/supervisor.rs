use crate::aggregator::{aggregate, AggregationStrategy};
use crate::dispatcher::TaskDispatcher;
use crate::history::WorkflowHistory;
use crate::registry::{AgentExecutor, AgentRegistry};
use crate::scheduler::{RecurringWorkflow, Scheduler};
use crate::types::{
    AgentSnapshot, AggregatedResult, SelectionRequirements, Task, TaskResult, WorkflowState,
};
use crate::workflow::{WorkflowDefinition, WorkflowEngine};
use overseer_core::{EventBus, StatusEvent, SupervisorConfig, SupervisorResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Builds a [`Supervisor`] with optional history and recurring jobs.
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    history_dir: Option<PathBuf>,
    jobs: Vec<RecurringWorkflow>,
}

impl SupervisorBuilder {
    /// Start a builder from a configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            history_dir: None,
            jobs: Vec::new(),
        }
    }

    /// Persist finished workflows as JSON lines under this directory.
    pub fn history_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history_dir = Some(dir.into());
        self
    }

    /// Add a recurring workflow job.
    pub fn recurring(mut self, job: RecurringWorkflow) -> Self {
        self.jobs.push(job);
        self
    }

    /// Wire up the supervisor. Must run inside a tokio runtime when a
    /// history directory is set.
    pub fn build(self) -> Supervisor {
        let events = EventBus::new(self.config.event_capacity);
        let registry = Arc::new(AgentRegistry::new(
            self.config.breaker.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            registry.clone(),
            self.config.retry.clone(),
            self.config.default_task_timeout_ms,
            events.clone(),
        ));
        let history = self
            .history_dir
            .map(|dir| Arc::new(WorkflowHistory::new(dir)));
        let engine = Arc::new(WorkflowEngine::new(
            dispatcher.clone(),
            events.clone(),
            history,
            self.config.default_workflow_timeout_ms,
        ));
        let scheduler = Scheduler::new(self.jobs, self.config.scheduler.clone());

        Supervisor {
            events,
            registry,
            dispatcher,
            engine,
            scheduler,
        }
    }
}

/// Front door of the orchestration layer: one handle owning the registry,
/// dispatcher, workflow engine, scheduler, and event bus.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Supervisor {
    events: EventBus,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    engine: Arc<WorkflowEngine>,
    scheduler: Scheduler,
}

impl Supervisor {
    /// Builder entry point.
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    /// Supervisor with default configuration and no history or jobs.
    pub fn new(config: SupervisorConfig) -> Self {
        SupervisorBuilder::new(config).build()
    }

    /// Register an agent under a unique name.
    pub fn register_agent(
        &self,
        name: impl Into<String>,
        capabilities: Vec<String>,
        specialization: Option<String>,
        executor: Arc<dyn AgentExecutor>,
    ) -> SupervisorResult<()> {
        self.registry
            .register(name, capabilities, specialization, executor)
    }

    /// Register a workflow definition under a kind name.
    pub fn register_workflow(&self, kind: impl Into<String>, definition: WorkflowDefinition) {
        self.engine.register_workflow(kind, definition);
    }

    /// Dispatch a task to a named agent, with retry and failover.
    pub async fn dispatch(&self, agent_name: &str, task: &Task) -> SupervisorResult<TaskResult> {
        self.dispatcher.dispatch(agent_name, task).await
    }

    /// Dispatch a task to the best-scoring agent for its capability.
    pub async fn dispatch_selected(&self, task: &Task) -> SupervisorResult<TaskResult> {
        let requirements = SelectionRequirements {
            specialization: task.specialization.clone(),
        };
        let agent = self
            .dispatcher
            .selector()
            .select(&task.capability, &requirements)?;
        self.dispatcher.dispatch(&agent, task).await
    }

    /// Start a workflow asynchronously and return its id.
    pub fn run_workflow(&self, kind: &str, input: serde_json::Value) -> SupervisorResult<Uuid> {
        self.engine.run_workflow(kind, input)
    }

    /// Read-only snapshot of a workflow.
    pub fn get_workflow(&self, id: Uuid) -> SupervisorResult<WorkflowState> {
        self.engine.get_workflow(id)
    }

    /// Cancel a running workflow; a no-op once it has finished.
    pub fn cancel_workflow(&self, id: Uuid) -> SupervisorResult<()> {
        self.engine.cancel_workflow(id)
    }

    /// Combine a workflow's step outputs with the given strategy.
    pub fn aggregate_workflow(
        &self,
        id: Uuid,
        strategy: &AggregationStrategy,
    ) -> SupervisorResult<AggregatedResult> {
        let state = self.engine.get_workflow(id)?;
        aggregate(&state, strategy)
    }

    /// Snapshot of one agent's health and metrics.
    pub fn agent(&self, name: &str) -> SupervisorResult<AgentSnapshot> {
        self.registry.snapshot(name)
    }

    /// Snapshots of every registered agent, keyed by name.
    pub fn agent_status(&self) -> HashMap<String, AgentSnapshot> {
        self.registry.all_snapshots()
    }

    /// Subscribe to the status event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Start the scheduler loops (recurring jobs and the health sweep).
    pub fn start(&self) {
        info!(agents = self.registry.agent_count(), "Supervisor started");
        self.scheduler.start(self.engine.clone(), self.registry.clone());
    }

    /// Stop the scheduler and wait for running workflows to finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.engine.drain().await;
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn execute(&self, task: &Task) -> SupervisorResult<Value> {
            Ok(json!({"echo": task.input}))
        }
    }

    #[tokio::test]
    async fn register_and_dispatch() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        supervisor
            .register_agent("echo", vec!["generate".into()], None, Arc::new(EchoExecutor))
            .unwrap();

        let task = Task::new("generate", json!({"prompt": "hi"}));
        let result = supervisor.dispatch("echo", &task).await.unwrap();
        assert_eq!(result.agent, "echo");
        assert_eq!(result.output["echo"]["prompt"], "hi");

        let snapshot = supervisor.agent("echo").unwrap();
        assert_eq!(snapshot.metrics.requests, 1);
        assert_eq!(snapshot.metrics.errors, 0);
    }

    #[tokio::test]
    async fn dispatch_selected_picks_capable_agent() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        supervisor
            .register_agent("echo", vec!["generate".into()], None, Arc::new(EchoExecutor))
            .unwrap();

        let task = Task::new("generate", json!({}));
        let result = supervisor.dispatch_selected(&task).await.unwrap();
        assert_eq!(result.agent, "echo");
    }

    #[tokio::test]
    async fn events_are_observable_through_facade() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        supervisor
            .register_agent("echo", vec!["generate".into()], None, Arc::new(EchoExecutor))
            .unwrap();

        let mut events = supervisor.subscribe();
        let task = Task::new("generate", json!({}));
        supervisor.dispatch("echo", &task).await.unwrap();

        let event = events.try_recv().unwrap();
        assert!(matches!(event, StatusEvent::Dispatch { .. }));
    }
}
