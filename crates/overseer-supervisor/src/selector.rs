use crate::registry::AgentRegistry;
use crate::types::{AgentSnapshot, SelectionRequirements};
use overseer_core::{SupervisorError, SupervisorResult};
use std::sync::Arc;
use tracing::debug;

/// Scoring weights for candidate ranking.
const WEIGHT_CAPABILITY: f64 = 0.40;
const WEIGHT_SUCCESS_RATE: f64 = 0.30;
const WEIGHT_LATENCY: f64 = 0.20;
const WEIGHT_SPECIALIZATION: f64 = 0.10;

/// Chooses among capable agents when a task can be served by more than one.
pub struct AgentSelector {
    registry: Arc<AgentRegistry>,
}

impl AgentSelector {
    /// Create a selector over the given registry.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Select the highest-scoring dispatchable agent for a capability.
    ///
    /// Candidates are scored as a weighted sum of capability match, success
    /// rate, inverse average latency, and a specialization bonus. Ties are
    /// broken by registration order, so repeated calls over identical
    /// metrics are deterministic.
    pub fn select(
        &self,
        capability: &str,
        requirements: &SelectionRequirements,
    ) -> SupervisorResult<String> {
        self.select_excluding(capability, requirements, None)
    }

    /// Like [`select`](Self::select), but skips one agent by name.
    ///
    /// Used by dispatch failover so a failing agent is not chosen as its
    /// own fallback.
    pub fn select_excluding(
        &self,
        capability: &str,
        requirements: &SelectionRequirements,
        exclude: Option<&str>,
    ) -> SupervisorResult<String> {
        let mut candidates: Vec<AgentSnapshot> = self
            .registry
            .list_by_capability(capability)
            .into_iter()
            .filter(|snap| Some(snap.name.as_str()) != exclude)
            .collect();

        if candidates.is_empty() {
            return Err(SupervisorError::NoAvailableAgent(capability.to_string()));
        }

        // Registration order first, then a strictly-greater score comparison,
        // so equal scores resolve to the earliest-registered agent.
        candidates.sort_by_key(|snap| snap.registration_order);

        let mut best: Option<(f64, &AgentSnapshot)> = None;
        for snap in &candidates {
            let score = score(snap, requirements);
            debug!(agent = %snap.name, score, "Selector candidate");
            match best {
                Some((best_score, _)) if score <= best_score => {}
                _ => best = Some((score, snap)),
            }
        }

        // Candidates is non-empty, so best is always set.
        best.map(|(_, snap)| snap.name.clone())
            .ok_or_else(|| SupervisorError::NoAvailableAgent(capability.to_string()))
    }
}

fn score(snap: &AgentSnapshot, requirements: &SelectionRequirements) -> f64 {
    let mut score = WEIGHT_CAPABILITY;
    score += WEIGHT_SUCCESS_RATE * snap.metrics.success_rate();
    score += WEIGHT_LATENCY / (1.0 + snap.metrics.avg_latency_ms / 1000.0);
    if let (Some(wanted), Some(tag)) = (&requirements.specialization, &snap.specialization) {
        if wanted == tag {
            score += WEIGHT_SPECIALIZATION;
        }
    }
    score
}
