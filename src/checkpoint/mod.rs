//! Append-only checkpoints keyed by run id.
//!
//! One checkpoint is written per engine step and per suspension. Checkpoints
//! are never mutated; resuming a run reads the entry with the highest `seq`.

use crate::gates::InterruptPayload;
use crate::orchestrator::graph::GraphPosition;
use crate::orchestrator::state::RunState;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Durable snapshot of run state plus graph position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Position in the run's checkpoint history, starting at 1.
    pub seq: u64,
    pub position: GraphPosition,
    pub state: RunState,
    /// Present when the run is suspended at `position`.
    pub interrupt: Option<InterruptPayload>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a new checkpoint for `run_id`, assigning the next sequence number.
    async fn append(
        &self,
        run_id: &str,
        position: GraphPosition,
        state: &RunState,
        interrupt: Option<&InterruptPayload>,
    ) -> Result<Checkpoint>;

    async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    /// Every checkpoint of `run_id`, oldest first.
    async fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(
        &self,
        run_id: &str,
        position: GraphPosition,
        state: &RunState,
        interrupt: Option<&InterruptPayload>,
    ) -> Result<Checkpoint> {
        let mut runs = self.runs.lock().await;
        let history = runs.entry(run_id.to_string()).or_default();
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            seq: history.last().map(|c| c.seq + 1).unwrap_or(1),
            position,
            state: state.clone(),
            interrupt: interrupt.cloned(),
            created_at: Utc::now(),
        };
        history.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let runs = self.runs.lock().await;
        Ok(runs.get(run_id).and_then(|h| h.last().cloned()))
    }

    async fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let runs = self.runs.lock().await;
        Ok(runs.get(run_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    #[tokio::test]
    async fn test_latest_wins_and_history_is_ordered() {
        let store = MemoryCheckpointStore::new();
        let state = RunState::new("f", "/r", "/w", "/s");
        store
            .append("run-1", GraphPosition::Node(Phase::Analyze), &state, None)
            .await
            .unwrap();
        let second = store
            .append("run-1", GraphPosition::Node(Phase::Requirements), &state, None)
            .await
            .unwrap();
        assert_eq!(second.seq, 2);

        let latest = store.latest("run-1").await.unwrap().unwrap();
        assert_eq!(latest.position, GraphPosition::Node(Phase::Requirements));
        let seqs: Vec<u64> = store.history("run-1").await.unwrap().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_runs_are_independent() {
        let store = MemoryCheckpointStore::new();
        let state = RunState::default();
        store.append("a", GraphPosition::Done, &state, None).await.unwrap();
        assert!(store.latest("b").await.unwrap().is_none());
        let first_b = store.append("b", GraphPosition::Done, &state, None).await.unwrap();
        assert_eq!(first_b.seq, 1);
    }
}
