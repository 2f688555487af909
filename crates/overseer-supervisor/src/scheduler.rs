use crate::registry::AgentRegistry;
use crate::workflow::WorkflowEngine;
use overseer_core::SchedulerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A workflow launched on a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringWorkflow {
    /// Job name, for logs.
    pub name: String,
    /// Workflow kind to launch.
    pub kind: String,
    /// Launch interval in milliseconds.
    pub interval_ms: u64,
    /// Input passed to every launch.
    pub input: Value,
    /// Disabled jobs are kept but never launched.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Interval-based scheduler that launches recurring workflows and runs the
/// agent health sweep.
///
/// Each enabled job gets its own tokio interval loop; the health sweep runs
/// on a separate loop. All loops stop when [`Scheduler::shutdown`] flips the
/// shutdown flag.
pub struct Scheduler {
    jobs: Vec<RecurringWorkflow>,
    config: SchedulerConfig,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a scheduler with the given jobs.
    pub fn new(jobs: Vec<RecurringWorkflow>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs,
            config,
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Return references to only the enabled jobs.
    pub fn enabled_jobs(&self) -> Vec<&RecurringWorkflow> {
        self.jobs.iter().filter(|j| j.enabled).collect()
    }

    /// Return the total number of jobs (enabled and disabled).
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Start one interval loop per enabled job plus the health sweep loop.
    ///
    /// Missed ticks are skipped rather than bursted, so a launch that
    /// outlasts its interval does not pile up extra launches.
    pub fn start(&self, engine: Arc<WorkflowEngine>, registry: Arc<AgentRegistry>) {
        let mut handles = self.handles.lock();

        for job in self.enabled_jobs() {
            let job = job.clone();
            let engine = engine.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(job.interval_ms.max(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; skip it so jobs start
                // one interval after startup.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match engine.run_workflow(&job.kind, job.input.clone()) {
                                Ok(id) => {
                                    info!(job = %job.name, workflow_id = %id, "Scheduled workflow launched");
                                }
                                Err(e) => {
                                    warn!(job = %job.name, error = %e, "Scheduled workflow launch failed");
                                }
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        let sweep_interval = Duration::from_millis(self.config.health_sweep_interval_ms.max(1));
        let inactivity = Duration::from_millis(self.config.inactivity_threshold_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let demoted = registry.sweep_inactive(inactivity);
                        if !demoted.is_empty() {
                            info!(agents = ?demoted, "Health sweep demoted inactive agents");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Signal all loops to stop and await them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }
}
