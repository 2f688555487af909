use crate::breaker::{BreakerState, CircuitBreaker};
use crate::types::{AgentHealth, AgentMetrics, AgentSnapshot, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{BreakerConfig, EventBus, StatusEvent, SupervisorError, SupervisorResult};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// An opaque task executor registered under one or more capability names.
///
/// Implementations are external services as far as the supervisor is
/// concerned; their internal logic is irrelevant to the dispatch contract.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute a task and return its structured output.
    async fn execute(&self, task: &Task) -> SupervisorResult<Value>;
}

/// Internal mutable record for one agent.
#[derive(Debug)]
struct AgentRecord {
    name: String,
    capabilities: Vec<String>,
    specialization: Option<String>,
    health: AgentHealth,
    /// Last health value announced on the event bus. `Processing` is a
    /// transient state and never reported, so outcome events compare
    /// against this rather than `health`.
    last_reported_health: AgentHealth,
    metrics: AgentMetrics,
    registration_order: usize,
    registered_at: DateTime<Utc>,
}

impl AgentRecord {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            specialization: self.specialization.clone(),
            health: self.health,
            metrics: self.metrics.clone(),
            registration_order: self.registration_order,
        }
    }
}

/// One registered agent: its record, breaker, and executor.
///
/// The record and breaker each sit behind their own lock so unrelated
/// agents never contend with each other.
pub struct AgentEntry {
    record: Mutex<AgentRecord>,
    breaker: Mutex<CircuitBreaker>,
    executor: Arc<dyn AgentExecutor>,
}

impl AgentEntry {
    /// The agent's executor.
    pub fn executor(&self) -> Arc<dyn AgentExecutor> {
        self.executor.clone()
    }

    /// Request breaker permission for one dispatch.
    ///
    /// Returns `None` when the circuit refuses. The permit must be
    /// completed once an outcome has been recorded; a permit dropped
    /// first (the dispatch future was cancelled mid-flight) hands the
    /// half-open probe slot back and restores the agent's reported
    /// health, so an aborted dispatch cannot leave the agent wedged.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<DispatchPermit> {
        let took_probe = {
            let mut breaker = self.breaker.lock();
            if !breaker.try_acquire() {
                return None;
            }
            breaker.state() == (BreakerState::HalfOpen { probing: true })
        };
        Some(DispatchPermit {
            entry: self.clone(),
            took_probe,
            completed: false,
        })
    }

    pub(crate) fn breaker_is_open(&self) -> bool {
        self.breaker.lock().is_open()
    }

    pub(crate) fn snapshot(&self) -> AgentSnapshot {
        self.record.lock().snapshot()
    }
}

/// Permission for one in-flight dispatch attempt against one agent.
///
/// Dispatch futures can be dropped at any await point (workflow
/// cancellation, fan-out abort, timeout), so the acquire side effects
/// are rolled back in `Drop` unless an outcome was recorded.
pub(crate) struct DispatchPermit {
    entry: Arc<AgentEntry>,
    took_probe: bool,
    completed: bool,
}

impl DispatchPermit {
    /// Mark the attempt as settled. `record_outcome` has already driven
    /// the breaker and health, so the drop path becomes inert.
    pub(crate) fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.took_probe {
            self.entry.breaker.lock().release_probe();
        }
        let mut record = self.entry.record.lock();
        if record.health == AgentHealth::Processing {
            record.health = record.last_reported_health;
        }
    }
}

/// Holds every registered agent, keyed by name.
///
/// The map lock is only held for lookups and inserts; all per-agent state
/// lives behind per-agent locks. Entries are never removed during the
/// process lifetime.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    next_order: Mutex<usize>,
    breaker_config: BreakerConfig,
    events: EventBus,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new(breaker_config: BreakerConfig, events: EventBus) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_order: Mutex::new(0),
            breaker_config,
            events,
        }
    }

    /// Register an agent under a unique name with its capability set.
    pub fn register(
        &self,
        name: impl Into<String>,
        capabilities: Vec<String>,
        specialization: Option<String>,
        executor: Arc<dyn AgentExecutor>,
    ) -> SupervisorResult<()> {
        let name = name.into();
        let mut agents = self.agents.write();
        if agents.contains_key(&name) {
            return Err(SupervisorError::DuplicateAgent(name));
        }

        let order = {
            let mut next = self.next_order.lock();
            let order = *next;
            *next += 1;
            order
        };

        info!(agent = %name, capabilities = ?capabilities, "Agent registered");
        agents.insert(
            name.clone(),
            Arc::new(AgentEntry {
                record: Mutex::new(AgentRecord {
                    name,
                    capabilities,
                    specialization,
                    health: AgentHealth::Active,
                    last_reported_health: AgentHealth::Active,
                    metrics: AgentMetrics::default(),
                    registration_order: order,
                    registered_at: Utc::now(),
                }),
                breaker: Mutex::new(CircuitBreaker::new(&self.breaker_config)),
                executor,
            }),
        );
        Ok(())
    }

    /// Look up an agent's entry.
    pub(crate) fn entry(&self, name: &str) -> SupervisorResult<Arc<AgentEntry>> {
        self.agents
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownAgent(name.to_string()))
    }

    /// Read-only snapshot of one agent.
    pub fn snapshot(&self, name: &str) -> SupervisorResult<AgentSnapshot> {
        Ok(self.entry(name)?.snapshot())
    }

    /// Snapshots of every registered agent, keyed by name.
    pub fn all_snapshots(&self) -> HashMap<String, AgentSnapshot> {
        let agents = self.agents.read();
        agents
            .iter()
            .map(|(name, entry)| (name.clone(), entry.snapshot()))
            .collect()
    }

    /// All agents in a dispatchable state that declare the capability.
    ///
    /// No particular order is guaranteed; callers that need determinism
    /// sort by `registration_order`.
    pub fn list_by_capability(&self, capability: &str) -> Vec<AgentSnapshot> {
        let agents = self.agents.read();
        agents
            .values()
            .filter(|entry| !entry.breaker_is_open())
            .map(|entry| entry.snapshot())
            .filter(|snap| snap.capabilities.iter().any(|c| c == capability))
            .collect()
    }

    /// Mark an agent as processing a task.
    pub fn mark_processing(&self, name: &str) -> SupervisorResult<()> {
        let entry = self.entry(name)?;
        entry.record.lock().health = AgentHealth::Processing;
        Ok(())
    }

    /// Record a dispatch outcome: update rolling metrics and drive the
    /// circuit breaker. May transition the agent's health.
    pub fn record_outcome(
        &self,
        name: &str,
        latency_ms: u64,
        success: bool,
    ) -> SupervisorResult<()> {
        let entry = self.entry(name)?;

        let breaker_open = {
            let mut breaker = entry.breaker.lock();
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            breaker.is_open()
        };

        let mut record = entry.record.lock();
        record.metrics.record(latency_ms, success);
        let from = record.last_reported_health;
        record.health = if breaker_open {
            AgentHealth::CircuitOpen
        } else if success {
            AgentHealth::Active
        } else {
            AgentHealth::Error
        };
        let to = record.health;
        record.last_reported_health = to;
        let agent = record.name.clone();
        drop(record);

        if from != to {
            self.events.publish(StatusEvent::AgentHealthChanged {
                agent,
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Demote active agents with no recorded activity within `threshold`
    /// to idle, emitting a health-changed event per demotion.
    ///
    /// Returns the names of demoted agents.
    pub fn sweep_inactive(&self, threshold: Duration) -> Vec<String> {
        let entries: Vec<Arc<AgentEntry>> = {
            let agents = self.agents.read();
            agents.values().cloned().collect()
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
        let mut demoted = Vec::new();

        for entry in entries {
            let mut record = entry.record.lock();
            if record.health != AgentHealth::Active {
                continue;
            }
            // Registration counts as activity so new agents get a grace period.
            let last_seen = record.metrics.last_active.unwrap_or(record.registered_at);
            let quiet = last_seen < cutoff;
            if quiet {
                record.health = AgentHealth::Idle;
                record.last_reported_health = AgentHealth::Idle;
                let agent = record.name.clone();
                drop(record);
                info!(agent = %agent, "Agent demoted to idle after inactivity");
                self.events.publish(StatusEvent::AgentHealthChanged {
                    agent: agent.clone(),
                    from: AgentHealth::Active.to_string(),
                    to: AgentHealth::Idle.to_string(),
                    timestamp: Utc::now(),
                });
                demoted.push(agent);
            }
        }
        demoted
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }
}
