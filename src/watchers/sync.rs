use super::WatchCycle;
use crate::git::{CiStatus, GitPrService, PrState, PrStatusInfo};
use crate::notify::{NotificationEvent, NotificationEventType, Severity};
use crate::store::{Feature, FeatureRepository, Lifecycle};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

type PrSnapshot = (PrState, Option<CiStatus>);

/// Mirrors remote PR state and CI checks onto feature records.
///
/// Features are grouped by repository so each repository costs one
/// `list_pr_statuses` call per cycle.
pub struct ExternalSyncWatcher {
    features: Arc<dyn FeatureRepository>,
    git: Arc<dyn GitPrService>,
    tracked: HashMap<String, PrSnapshot>,
}

impl ExternalSyncWatcher {
    pub fn new(features: Arc<dyn FeatureRepository>, git: Arc<dyn GitPrService>) -> Self {
        Self {
            features,
            git,
            tracked: HashMap::new(),
        }
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }
}

/// Features with an open (or not yet known) PR and something to match it by.
fn watchable(feature: &Feature) -> bool {
    let open = feature.pr.as_ref().is_none_or(|pr| pr.status == PrState::Open);
    let matchable = feature.pr.as_ref().and_then(|pr| pr.number).is_some() || feature.branch.is_some();
    open && matchable
}

fn find_pr<'a>(feature: &Feature, statuses: &'a [PrStatusInfo]) -> Option<&'a PrStatusInfo> {
    match feature.pr.as_ref().and_then(|pr| pr.number) {
        Some(number) => statuses.iter().find(|s| s.number == number),
        None => {
            let branch = feature.branch.as_deref()?;
            statuses.iter().find(|s| s.head_branch == branch)
        }
    }
}

fn transition_event(feature: &Feature, info: &PrStatusInfo, previous: PrSnapshot) -> Option<NotificationEvent> {
    let (event_type, message, severity) = if previous.0 != info.state {
        match info.state {
            PrState::Merged => (
                NotificationEventType::PrMerged,
                format!("PR #{} merged", info.number),
                Severity::Success,
            ),
            PrState::Closed => (
                NotificationEventType::PrClosed,
                format!("PR #{} closed without merging", info.number),
                Severity::Warning,
            ),
            PrState::Open => return None,
        }
    } else {
        match info.ci_status {
            Some(CiStatus::Success) => (
                NotificationEventType::PrChecksPassed,
                format!("Checks passed on PR #{}", info.number),
                Severity::Success,
            ),
            Some(CiStatus::Failure) => (
                NotificationEventType::PrChecksFailed,
                format!("Checks failed on PR #{}", info.number),
                Severity::Error,
            ),
            Some(CiStatus::Pending) | None => return None,
        }
    };
    Some(NotificationEvent::new(event_type, &feature.id, &feature.name, message, severity))
}

#[async_trait]
impl WatchCycle for ExternalSyncWatcher {
    fn name(&self) -> &'static str {
        "external-sync"
    }

    async fn run_cycle(&mut self, seeding: bool) -> Result<Vec<NotificationEvent>> {
        let mut groups: BTreeMap<PathBuf, Vec<Feature>> = BTreeMap::new();
        for feature in self.features.list().await? {
            if watchable(&feature) {
                groups.entry(feature.repository_path.clone()).or_default().push(feature);
            }
        }

        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for (repo, group) in groups {
            let statuses = match self.git.list_pr_statuses(&repo).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    warn!(repo = %repo.display(), error = %e, "failed to list PR statuses");
                    // Keep tracking; an API hiccup is not a disappearance.
                    seen.extend(group.into_iter().map(|f| f.id));
                    continue;
                }
            };

            for mut feature in group {
                let Some(info) = find_pr(&feature, &statuses) else {
                    continue;
                };
                seen.insert(feature.id.clone());
                let mut dirty = false;

                if feature.pr.as_ref().and_then(|pr| pr.number).is_none() {
                    info!(feature_id = %feature.id, pr = info.number, branch = %info.head_branch, "discovered PR by branch");
                    let pr = feature.pr_mut();
                    pr.number = Some(info.number);
                    pr.url = Some(info.url.clone());
                    dirty = true;
                }

                let current = (info.state, info.ci_status);
                let previous = self.tracked.insert(feature.id.clone(), current);
                if !seeding
                    && let Some(previous) = previous
                    && previous != current
                {
                    events.extend(transition_event(&feature, info, previous));
                    let pr = feature.pr_mut();
                    pr.status = info.state;
                    pr.ci_status = info.ci_status;
                    if info.state == PrState::Merged {
                        feature.lifecycle = Lifecycle::Maintain;
                    }
                    dirty = true;
                }

                if dirty {
                    feature.updated_at = Utc::now();
                    if let Err(e) = self.features.update(&feature).await {
                        warn!(feature_id = %feature.id, error = %format!("{:#}", e), "failed to persist PR sync");
                    }
                }
            }
        }

        self.tracked.retain(|id, _| seen.contains(id));
        Ok(events)
    }
}
