use super::WatchCycle;
use crate::notify::{NotificationEvent, NotificationEventType, Severity};
use crate::phase::Phase;
use crate::store::{AgentRun, AgentRunRepository, AgentRunStatus, FeatureRepository};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Reports agent run status transitions and completed phases.
pub struct StatusWatcher {
    runs: Arc<dyn AgentRunRepository>,
    features: Arc<dyn FeatureRepository>,
    tracked: HashMap<String, (AgentRunStatus, Option<Phase>)>,
}

impl StatusWatcher {
    pub fn new(runs: Arc<dyn AgentRunRepository>, features: Arc<dyn FeatureRepository>) -> Self {
        Self {
            runs,
            features,
            tracked: HashMap::new(),
        }
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    async fn feature_names(&self) -> HashMap<String, String> {
        match self.features.list().await {
            Ok(features) => features.into_iter().map(|f| (f.id, f.name)).collect(),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "failed to list features; using ids as names");
                HashMap::new()
            }
        }
    }
}

fn status_event(run: &AgentRun, name: &str) -> Option<NotificationEvent> {
    let phase = run.current_phase.map(|p| p.title()).unwrap_or("run");
    let (event_type, message, severity) = match run.status {
        AgentRunStatus::Pending => return None,
        AgentRunStatus::Running => (
            NotificationEventType::AgentStarted,
            format!("Agent started {}", phase),
            Severity::Info,
        ),
        AgentRunStatus::WaitingApproval => (
            NotificationEventType::WaitingApproval,
            format!("{} is waiting for approval", phase),
            Severity::Warning,
        ),
        AgentRunStatus::Completed => (
            NotificationEventType::AgentCompleted,
            "Agent completed".to_string(),
            Severity::Success,
        ),
        AgentRunStatus::Failed => (
            NotificationEventType::AgentFailed,
            match &run.error {
                Some(error) => format!("Agent failed: {}", error),
                None => "Agent failed".to_string(),
            },
            Severity::Error,
        ),
    };
    let mut event = NotificationEvent::new(event_type, &run.feature_id, name, message, severity).with_run(&run.id);
    if let Some(p) = run.current_phase {
        event = event.with_phase(p.as_str());
    }
    Some(event)
}

#[async_trait]
impl WatchCycle for StatusWatcher {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn run_cycle(&mut self, seeding: bool) -> Result<Vec<NotificationEvent>> {
        let runs = self.runs.list().await?;
        let names = if seeding { HashMap::new() } else { self.feature_names().await };
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for run in runs {
            seen.insert(run.id.clone());
            let current = (run.status, run.current_phase);
            let previous = self.tracked.insert(run.id.clone(), current);
            if seeding || previous == Some(current) {
                continue;
            }
            let name = names.get(&run.feature_id).map(String::as_str).unwrap_or(&run.feature_id);

            // A tick can cover both a phase change and a status change; the
            // finished phase is reported before the new status.
            if let Some((_, Some(done))) = previous
                && run.current_phase != Some(done)
            {
                events.push(
                    NotificationEvent::new(
                        NotificationEventType::PhaseCompleted,
                        &run.feature_id,
                        name,
                        format!("{} completed", done.title()),
                        Severity::Success,
                    )
                    .with_run(&run.id)
                    .with_phase(done.as_str()),
                );
            }
            if previous.is_none_or(|(status, _)| status != run.status) {
                events.extend(status_event(&run, name));
            }
        }

        self.tracked.retain(|id, _| seen.contains(id));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Feature, MemoryAgentRunRepository, MemoryFeatureRepository};

    struct Fixture {
        runs: Arc<MemoryAgentRunRepository>,
        watcher: StatusWatcher,
    }

    async fn fixture() -> Fixture {
        let runs = Arc::new(MemoryAgentRunRepository::new());
        let features = Arc::new(MemoryFeatureRepository::new());
        features.update(&Feature::new("f-1", "Login", "/repo")).await.unwrap();
        let watcher = StatusWatcher::new(runs.clone(), features);
        Fixture { runs, watcher }
    }

    fn run(status: AgentRunStatus, phase: Option<Phase>) -> AgentRun {
        let mut run = AgentRun::new("run-1", "f-1");
        run.status = status;
        run.current_phase = phase;
        run
    }

    #[tokio::test]
    async fn test_seed_emits_nothing() {
        let mut fx = fixture().await;
        fx.runs.upsert(&run(AgentRunStatus::Failed, Some(Phase::Plan))).await.unwrap();
        assert!(fx.watcher.run_cycle(true).await.unwrap().is_empty());
        assert_eq!(fx.watcher.tracked_len(), 1);
        assert!(fx.watcher.run_cycle(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_transition_emits_one_event() {
        let mut fx = fixture().await;
        fx.runs.upsert(&run(AgentRunStatus::Running, Some(Phase::Requirements))).await.unwrap();
        fx.watcher.run_cycle(true).await.unwrap();

        fx.runs
            .upsert(&run(AgentRunStatus::WaitingApproval, Some(Phase::Requirements)))
            .await
            .unwrap();
        let events = fx.watcher.run_cycle(false).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, NotificationEventType::WaitingApproval);
        assert_eq!(events[0].feature_name, "Login");
        assert_eq!(events[0].agent_run_id.as_deref(), Some("run-1"));
        assert!(fx.watcher.run_cycle(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_phase_change_reports_previous_phase() {
        let mut fx = fixture().await;
        fx.runs.upsert(&run(AgentRunStatus::Running, Some(Phase::Analyze))).await.unwrap();
        fx.watcher.run_cycle(true).await.unwrap();

        fx.runs.upsert(&run(AgentRunStatus::Running, Some(Phase::Requirements))).await.unwrap();
        let events = fx.watcher.run_cycle(false).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, NotificationEventType::PhaseCompleted);
        assert_eq!(events[0].phase_name.as_deref(), Some("analyze"));
    }

    #[tokio::test]
    async fn test_phase_and_status_change_in_one_tick_reports_both() {
        let mut fx = fixture().await;
        fx.runs.upsert(&run(AgentRunStatus::Running, Some(Phase::Analyze))).await.unwrap();
        fx.watcher.run_cycle(true).await.unwrap();

        fx.runs
            .upsert(&run(AgentRunStatus::WaitingApproval, Some(Phase::Requirements)))
            .await
            .unwrap();
        let events = fx.watcher.run_cycle(false).await.unwrap();
        let kinds: Vec<NotificationEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![NotificationEventType::PhaseCompleted, NotificationEventType::WaitingApproval]
        );
        assert_eq!(events[0].phase_name.as_deref(), Some("analyze"));
        assert_eq!(events[1].phase_name.as_deref(), Some("requirements"));
    }

    #[tokio::test]
    async fn test_removed_runs_are_pruned() {
        let mut fx = fixture().await;
        fx.runs.upsert(&run(AgentRunStatus::Running, None)).await.unwrap();
        fx.watcher.run_cycle(true).await.unwrap();
        fx.runs.remove("run-1").await;
        fx.watcher.run_cycle(false).await.unwrap();
        assert_eq!(fx.watcher.tracked_len(), 0);
    }
}
