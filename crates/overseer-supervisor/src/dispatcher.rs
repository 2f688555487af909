use crate::registry::AgentRegistry;
use crate::selector::AgentSelector;
use crate::types::{SelectionRequirements, Task, TaskResult};
use chrono::Utc;
use overseer_core::{
    DispatchOutcome, EventBus, RetryPolicy, StatusEvent, SupervisorError, SupervisorResult,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Executes a single task against a chosen agent, with timing, retry,
/// and failover.
///
/// Per-task failures are remediated locally (bounded exponential-backoff
/// retries, selector failover from the second attempt on) and only surface
/// as [`SupervisorError::TaskFailed`] once remediation is exhausted. Every
/// attempt, success or failure, publishes a [`StatusEvent::Dispatch`].
pub struct TaskDispatcher {
    registry: Arc<AgentRegistry>,
    selector: AgentSelector,
    retry: RetryPolicy,
    default_timeout_ms: Option<u64>,
    events: EventBus,
}

impl TaskDispatcher {
    /// Create a dispatcher over the given registry.
    pub fn new(
        registry: Arc<AgentRegistry>,
        retry: RetryPolicy,
        default_timeout_ms: Option<u64>,
        events: EventBus,
    ) -> Self {
        let selector = AgentSelector::new(registry.clone());
        Self {
            registry,
            selector,
            retry,
            default_timeout_ms,
            events,
        }
    }

    /// Dispatch a task to the named agent.
    ///
    /// Fails synchronously with [`SupervisorError::UnknownAgent`] for an
    /// unregistered name and [`SupervisorError::CircuitOpen`] when the
    /// agent's circuit refuses the first attempt.
    pub async fn dispatch(&self, agent_name: &str, task: &Task) -> SupervisorResult<TaskResult> {
        let mut current = agent_name.to_string();
        let mut last_error: Option<SupervisorError> = None;
        let mut attempts: u32 = 0;

        for attempt in 0..self.retry.max_attempts {
            attempts += 1;

            match self.attempt(&current, task, attempt == 0).await? {
                AttemptOutcome::Success(result) => return Ok(result),
                AttemptOutcome::Failure(err) => last_error = Some(err),
            }

            if attempt + 1 < self.retry.max_attempts {
                // From the second attempt on, fail over to another agent with
                // the same capability rather than retrying the same one.
                let requirements = SelectionRequirements {
                    specialization: task.specialization.clone(),
                };
                match self.selector.select_excluding(
                    &task.capability,
                    &requirements,
                    Some(&current),
                ) {
                    Ok(fallback) => {
                        info!(
                            from = %current,
                            to = %fallback,
                            task = %task.capability,
                            "Failing over to fallback agent"
                        );
                        current = fallback;
                    }
                    Err(_) => {
                        // No alternative: retry the same agent after backoff.
                    }
                }

                let delay = self.retry.backoff_ms(attempt);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no dispatch attempts permitted".to_string());
        Err(SupervisorError::TaskFailed {
            last_error,
            attempts,
        })
    }

    /// One dispatch attempt against one agent.
    ///
    /// The outer `Result` carries errors that abort the whole dispatch
    /// (unknown agent, first-attempt circuit refusal); the inner outcome
    /// feeds the retry loop.
    async fn attempt(
        &self,
        agent: &str,
        task: &Task,
        first_attempt: bool,
    ) -> SupervisorResult<AttemptOutcome> {
        let entry = self.registry.entry(agent)?;

        // The permit is held across the executor await: if this future is
        // dropped mid-flight (workflow cancellation or timeout), its drop
        // releases the half-open probe slot and the transient health.
        let Some(permit) = entry.try_acquire() else {
            self.publish(agent, task, DispatchOutcome::CircuitOpen, 0);
            if first_attempt {
                return Err(SupervisorError::CircuitOpen(agent.to_string()));
            }
            return Ok(AttemptOutcome::Failure(SupervisorError::CircuitOpen(
                agent.to_string(),
            )));
        };

        self.registry.mark_processing(agent)?;
        let timeout_ms = task.max_latency_ms.or(self.default_timeout_ms);
        let start = Instant::now();

        let result = match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    entry.executor().execute(task),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(SupervisorError::Timeout(format!(
                        "task {} on agent {agent} exceeded {ms}ms",
                        task.id
                    ))),
                }
            }
            None => entry.executor().execute(task).await,
        };

        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.registry.record_outcome(agent, latency_ms, true)?;
                permit.complete();
                self.publish(agent, task, DispatchOutcome::Success, latency_ms);
                info!(agent = %agent, task = %task.capability, latency_ms, "Dispatch succeeded");
                Ok(AttemptOutcome::Success(TaskResult {
                    agent: agent.to_string(),
                    output,
                    latency_ms,
                }))
            }
            Err(e) => {
                self.registry.record_outcome(agent, latency_ms, false)?;
                permit.complete();
                let outcome = match &e {
                    SupervisorError::Timeout(_) => DispatchOutcome::Timeout,
                    _ => DispatchOutcome::Failure,
                };
                self.publish(agent, task, outcome, latency_ms);
                warn!(agent = %agent, task = %task.capability, error = %e, "Dispatch attempt failed");
                Ok(AttemptOutcome::Failure(e))
            }
        }
    }

    fn publish(&self, agent: &str, task: &Task, outcome: DispatchOutcome, latency_ms: u64) {
        self.events.publish(StatusEvent::Dispatch {
            agent: agent.to_string(),
            task: task.capability.clone(),
            outcome,
            latency_ms,
            timestamp: Utc::now(),
        });
    }

    /// The selector used for failover and capability-based routing.
    pub fn selector(&self) -> &AgentSelector {
        &self.selector
    }
}

enum AttemptOutcome {
    Success(TaskResult),
    Failure(SupervisorError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::AgentExecutor;
    use async_trait::async_trait;
    use overseer_core::BreakerConfig;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` calls, then succeeds.
    struct FlakyExecutor {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentExecutor for FlakyExecutor {
        async fn execute(&self, _task: &Task) -> SupervisorResult<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(SupervisorError::Agent("executor unavailable".into()))
            } else {
                Ok(json!({"status": "done"}))
            }
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn execute(&self, _task: &Task) -> SupervisorResult<Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({"status": "late"}))
        }
    }

    /// Counts invocations so tests can assert the executor was never called.
    struct CountingExecutor {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl AgentExecutor for CountingExecutor {
        async fn execute(&self, _task: &Task) -> SupervisorResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SupervisorError::Agent("boom".into()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn instant_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    fn setup(threshold: u32) -> (Arc<AgentRegistry>, EventBus) {
        let events = EventBus::new(64);
        let registry = Arc::new(AgentRegistry::new(
            BreakerConfig {
                failure_threshold: threshold,
                cooldown_ms: 60_000,
            },
            events.clone(),
        ));
        (registry, events)
    }

    #[tokio::test]
    async fn dispatch_success_records_metrics() {
        let (registry, events) = setup(5);
        registry
            .register(
                "policy",
                vec!["generate".into()],
                None,
                Arc::new(FlakyExecutor::new(0)),
            )
            .unwrap();
        let dispatcher =
            TaskDispatcher::new(registry.clone(), instant_retry(3), None, events);

        let result = dispatcher
            .dispatch("policy", &Task::new("generate", json!({})))
            .await
            .unwrap();
        assert_eq!(result.agent, "policy");
        assert_eq!(result.output["status"], "done");

        let snap = registry.snapshot("policy").unwrap();
        assert_eq!(snap.metrics.requests, 1);
        assert_eq!(snap.metrics.errors, 0);
    }

    #[tokio::test]
    async fn unknown_agent_fails_synchronously() {
        let (registry, events) = setup(5);
        let dispatcher = TaskDispatcher::new(registry, instant_retry(3), None, events);

        let err = dispatcher
            .dispatch("ghost", &Task::new("generate", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn retries_same_agent_when_no_fallback_exists() {
        let (registry, events) = setup(10);
        registry
            .register(
                "policy",
                vec!["generate".into()],
                None,
                Arc::new(FlakyExecutor::new(1)),
            )
            .unwrap();
        let dispatcher = TaskDispatcher::new(registry, instant_retry(3), None, events);

        let result = dispatcher
            .dispatch("policy", &Task::new("generate", json!({})))
            .await
            .unwrap();
        assert_eq!(result.agent, "policy");
    }

    #[tokio::test]
    async fn second_attempt_fails_over_to_capable_agent() {
        let (registry, events) = setup(10);
        registry
            .register(
                "policy",
                vec!["generate".into()],
                None,
                Arc::new(FlakyExecutor::new(u32::MAX)),
            )
            .unwrap();
        registry
            .register(
                "policy-backup",
                vec!["generate".into()],
                None,
                Arc::new(FlakyExecutor::new(0)),
            )
            .unwrap();
        let dispatcher = TaskDispatcher::new(registry, instant_retry(3), None, events);

        let result = dispatcher
            .dispatch("policy", &Task::new("generate", json!({})))
            .await
            .unwrap();
        assert_eq!(result.agent, "policy-backup");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_last_error() {
        let (registry, events) = setup(10);
        registry
            .register(
                "policy",
                vec!["generate".into()],
                None,
                Arc::new(FlakyExecutor::new(u32::MAX)),
            )
            .unwrap();
        let dispatcher = TaskDispatcher::new(registry, instant_retry(3), None, events);

        let err = dispatcher
            .dispatch("policy", &Task::new("generate", json!({})))
            .await
            .unwrap_err();
        match err {
            SupervisorError::TaskFailed {
                last_error,
                attempts,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("executor unavailable"));
            }
            other => panic!("expected TaskFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn open_circuit_refuses_without_invoking_executor() {
        let (registry, events) = setup(2);
        let calls = Arc::new(AtomicU32::new(0));
        registry
            .register(
                "policy",
                vec!["generate".into()],
                None,
                Arc::new(CountingExecutor {
                    calls: calls.clone(),
                    fail: true,
                }),
            )
            .unwrap();
        let dispatcher =
            TaskDispatcher::new(registry.clone(), instant_retry(1), None, events);

        let task = Task::new("generate", json!({}));
        // Two failing dispatches trip the threshold-2 breaker.
        for _ in 0..2 {
            let _ = dispatcher.dispatch("policy", &task).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = dispatcher.dispatch("policy", &task).await.unwrap_err();
        assert!(matches!(err, SupervisorError::CircuitOpen(_)));
        // Executor was not invoked for the refused dispatch.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (registry, events) = setup(1);
        registry
            .register("slow", vec!["scan".into()], None, Arc::new(SlowExecutor))
            .unwrap();
        let dispatcher = TaskDispatcher::new(registry.clone(), instant_retry(1), None, events);

        let task = Task::new("scan", json!({})).with_max_latency_ms(20);
        let err = dispatcher.dispatch("slow", &task).await.unwrap_err();
        match err {
            SupervisorError::TaskFailed { last_error, .. } => {
                assert!(last_error.contains("timed out") || last_error.contains("exceeded"));
            }
            other => panic!("expected TaskFailed, got {other}"),
        }

        // The timeout fed the breaker (threshold 1 ⇒ open).
        let snap = registry.snapshot("slow").unwrap();
        assert_eq!(snap.metrics.errors, 1);
        assert_eq!(snap.health, crate::types::AgentHealth::CircuitOpen);
    }

    #[tokio::test]
    async fn every_attempt_emits_a_dispatch_event() {
        let (registry, events) = setup(10);
        registry
            .register(
                "policy",
                vec!["generate".into()],
                None,
                Arc::new(FlakyExecutor::new(1)),
            )
            .unwrap();
        let mut rx = events.subscribe();
        let dispatcher = TaskDispatcher::new(registry, instant_retry(3), None, events);

        dispatcher
            .dispatch("policy", &Task::new("generate", json!({})))
            .await
            .unwrap();

        // Health-changed events interleave with dispatch events; only the
        // dispatch outcomes matter here.
        let mut outcomes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StatusEvent::Dispatch { outcome, .. } = event {
                outcomes.push(outcome);
            }
        }
        assert_eq!(
            outcomes,
            vec![DispatchOutcome::Failure, DispatchOutcome::Success]
        );
    }
}
