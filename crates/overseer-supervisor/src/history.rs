use crate::types::WorkflowState;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;

/// Append-only record of finished workflows, one JSON line per workflow.
///
/// Writes happen on a background task so recording never blocks workflow
/// completion. Entries are appended in the order they were recorded.
pub struct WorkflowHistory {
    tx: mpsc::UnboundedSender<WorkflowState>,
}

impl WorkflowHistory {
    /// Create a history log. Spawns a background task that appends
    /// terminal workflow states to `<log_dir>/workflows.jsonl`.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkflowState>();

        tokio::spawn(async move {
            let _ = tokio::fs::create_dir_all(&log_dir).await;
            let log_file = log_dir.join("workflows.jsonl");

            while let Some(state) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&state) {
                    use tokio::io::AsyncWriteExt;
                    if let Ok(mut file) = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&log_file)
                        .await
                    {
                        let line = format!("{line}\n");
                        let _ = file.write_all(line.as_bytes()).await;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Record a workflow's final state.
    pub fn append(&self, state: WorkflowState) {
        info!(
            workflow_id = %state.id,
            kind = %state.kind,
            status = ?state.status,
            "Workflow recorded"
        );
        let _ = self.tx.send(state);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::WorkflowStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn appends_one_json_line_per_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let history = WorkflowHistory::new(dir.path().to_path_buf());

        let mut first = WorkflowState::new("scan");
        first.status = WorkflowStatus::Completed;
        let mut second = WorkflowState::new("triage");
        second.status = WorkflowStatus::Failed {
            reason: "cancelled".into(),
        };
        history.append(first.clone());
        history.append(second.clone());

        // Writes happen on a background task.
        let log_file = dir.path().join("workflows.jsonl");
        let mut contents = String::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            contents = tokio::fs::read_to_string(&log_file)
                .await
                .unwrap_or_default();
            if contents.lines().count() == 2 {
                break;
            }
        }

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let replayed: WorkflowState = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(replayed.id, first.id);
        assert_eq!(replayed.kind, "scan");
        let replayed: WorkflowState = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(replayed.id, second.id);
        assert!(matches!(replayed.status, WorkflowStatus::Failed { .. }));
    }
}
