//! The merge phase: commit, push, open a PR, drive CI green, then merge
//! after approval.
//!
//! `execute` does everything up to a reviewable PR. `finalize` runs after
//! the merge gate and performs the actual merge in the main repository.

pub mod ci;
mod extract;

pub use ci::{CiFixLoop, CiLoopOutcome, truncate_logs};
pub use extract::{extract_commit_hash, extract_pr};

use crate::agent::{AgentExecutor, AgentOptions};
use crate::config::CiConfig;
use crate::errors::MergeError;
use crate::gates::GateContext;
use crate::git::{GitPrService, PrState};
use crate::orchestrator::nodes::PhaseNode;
use crate::orchestrator::prompts;
use crate::orchestrator::state::{RunState, StateUpdate};
use crate::phase::Phase;
use crate::store::{Feature, FeatureRepository, Lifecycle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

const FALLBACK_BASE_BRANCH: &str = "main";

/// Load the feature for `state` (creating a record if none exists yet),
/// apply `edit` and write it back.
///
/// Repository failures surface as `MergeError::FeatureStore` so they are
/// never handed to the agent as something to fix.
pub(crate) async fn persist_feature(
    features: &dyn FeatureRepository,
    state: &RunState,
    edit: impl FnOnce(&mut Feature),
) -> Result<Feature> {
    let store_error = |e: anyhow::Error| MergeError::FeatureStore {
        feature_id: state.feature_id.clone(),
        message: format!("{:#}", e),
    };
    let mut feature = features
        .find_by_id(&state.feature_id)
        .await
        .map_err(store_error)?
        .unwrap_or_else(|| Feature::new(&state.feature_id, &state.feature_id, &state.repository_path));
    edit(&mut feature);
    feature.updated_at = Utc::now();
    features.update(&feature).await.map_err(store_error)?;
    Ok(feature)
}

pub struct MergeNode {
    agent: Arc<dyn AgentExecutor>,
    git: Arc<dyn GitPrService>,
    features: Arc<dyn FeatureRepository>,
    ci: CiConfig,
}

impl MergeNode {
    pub fn new(
        agent: Arc<dyn AgentExecutor>,
        git: Arc<dyn GitPrService>,
        features: Arc<dyn FeatureRepository>,
        ci: CiConfig,
    ) -> Self {
        Self {
            agent,
            git,
            features,
            ci,
        }
    }

    /// Branch from state, then from the feature record, then `feat/<id>`.
    async fn resolve_branch(&self, state: &RunState) -> String {
        if let Some(branch) = &state.branch {
            return branch.clone();
        }
        match self.features.find_by_id(&state.feature_id).await {
            Ok(Some(Feature {
                branch: Some(branch), ..
            })) => branch,
            Ok(_) => format!("feat/{}", state.feature_id),
            Err(e) => {
                warn!(feature_id = %state.feature_id, error = %format!("{:#}", e), "failed to load feature; using default branch name");
                format!("feat/{}", state.feature_id)
            }
        }
    }

    async fn resolve_base(&self, state: &RunState) -> String {
        match self.git.default_branch(&state.repository_path).await {
            Ok(base) => base,
            Err(e) => {
                warn!(error = %e, "could not determine default branch; assuming {}", FALLBACK_BASE_BRANCH);
                FALLBACK_BASE_BRANCH.to_string()
            }
        }
    }
}

#[async_trait]
impl PhaseNode for MergeNode {
    fn phase(&self) -> Phase {
        Phase::Merge
    }

    async fn execute(&self, state: &RunState) -> Result<StateUpdate> {
        let branch = self.resolve_branch(state).await;
        let base = self.resolve_base(state).await;

        let prompt = prompts::commit_prompt(state, &branch, &base);
        let output = self
            .agent
            .execute(&prompt, &AgentOptions::new(&state.worktree_path, "merge:commit"))
            .await
            .context("Commit agent invocation failed")?;
        if !output.success() {
            anyhow::bail!(
                "Commit agent exited with code {}: {}",
                output.exit_code,
                output.result.trim()
            );
        }

        let commit_hash = extract_commit_hash(&output.result).or_else(|| state.commit_hash.clone());
        let (pr_url, pr_number) = match extract_pr(&output.result) {
            Some((url, number)) => (Some(url), Some(number)),
            None => (state.pr_url.clone(), state.pr_number),
        };
        info!(branch = %branch, commit = ?commit_hash, pr = ?pr_number, "changes committed");

        persist_feature(self.features.as_ref(), state, |feature| {
            feature.branch = Some(branch.clone());
            if pr_url.is_some() || pr_number.is_some() || commit_hash.is_some() {
                let pr = feature.pr_mut();
                pr.url = pr_url.clone();
                pr.number = pr_number;
                pr.commit_hash = commit_hash.clone();
            }
        })
        .await?;

        let mut update = StateUpdate::default()
            .branch(Some(branch.clone()))
            .commit_hash(commit_hash.clone())
            .pr_url(pr_url.clone())
            .pr_number(pr_number)
            .messages(match &pr_url {
                Some(url) => format!("Opened {}", url),
                None => format!("Committed changes on {}", branch),
            });

        if state.push || state.open_pr {
            // The loop persists its own failure; it needs the fresh PR fields.
            let mut delivered = state.clone();
            delivered.apply(update.clone());
            let outcome = CiFixLoop {
                git: self.git.as_ref(),
                agent: self.agent.as_ref(),
                features: self.features.as_ref(),
                config: &self.ci,
            }
            .run(&delivered, &branch)
            .await?;

            if let Some(ci_status) = outcome.ci_status {
                persist_feature(self.features.as_ref(), &delivered, |feature| {
                    feature.pr_mut().ci_status = Some(ci_status);
                })
                .await?;
            }
            update.merge(outcome.into_update());
        }

        Ok(update)
    }

    async fn gate_context(&self, state: &RunState) -> Result<GateContext> {
        let base = self.resolve_base(state).await;
        let diff = match self.git.diff_summary(&state.worktree_path, &base).await {
            Ok(diff) => Some(diff),
            Err(e) => {
                warn!(error = %e, "diff summary unavailable");
                None
            }
        };
        Ok(GateContext::Merge {
            diff,
            pr_url: state.pr_url.clone(),
            pr_number: state.pr_number,
            ci_status: state.ci_status,
            commit_hash: state.commit_hash.clone(),
        })
    }

    fn has_finalize(&self) -> bool {
        true
    }

    async fn finalize(&self, state: &RunState) -> Result<StateUpdate> {
        let branch = self.resolve_branch(state).await;
        let base = self.resolve_base(state).await;

        if !state.merge_enabled {
            persist_feature(self.features.as_ref(), state, |feature| {
                feature.lifecycle = Lifecycle::Review;
                feature.branch = Some(branch.clone());
            })
            .await?;
            return Ok(StateUpdate::default().messages("Merge disabled; feature left for review".to_string()));
        }

        let prompt = prompts::merge_prompt(state, &branch, &base);
        let output = self
            .agent
            .execute(&prompt, &AgentOptions::new(&state.repository_path, "merge:merge"))
            .await
            .context("Merge agent invocation failed")?;
        if !output.success() {
            anyhow::bail!(
                "Merge agent exited with code {}: {}",
                output.exit_code,
                output.result.trim()
            );
        }

        if state.pr_number.is_none() {
            let merged = self
                .git
                .verify_merge(&state.repository_path, &branch, &base)
                .await?;
            if !merged {
                return Err(MergeError::VerificationFailed {
                    branch,
                    base,
                    repository: state.repository_path.display().to_string(),
                }
                .into());
            }
        }

        persist_feature(self.features.as_ref(), state, |feature| {
            feature.lifecycle = Lifecycle::Maintain;
            feature.branch = Some(branch.clone());
            if state.pr_number.is_some() || state.pr_url.is_some() {
                let pr = feature.pr_mut();
                pr.status = PrState::Merged;
                pr.url = state.pr_url.clone();
                pr.number = state.pr_number;
                pr.commit_hash = state.commit_hash.clone();
                pr.ci_status = state.ci_status;
            }
        })
        .await?;

        info!(branch = %branch, base = %base, "feature merged");
        Ok(StateUpdate::default().messages(format!("Merged {} into {}", branch, base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::autofix::{ErrorClass, classify_error};

    struct ReadOnlyFeatures;

    #[async_trait]
    impl FeatureRepository for ReadOnlyFeatures {
        async fn find_by_id(&self, _id: &str) -> Result<Option<Feature>> {
            Ok(None)
        }

        async fn update(&self, _feature: &Feature) -> Result<()> {
            anyhow::bail!("attempt to write a readonly database")
        }

        async fn list(&self) -> Result<Vec<Feature>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_feature_store_failure_is_typed_and_not_fixable() {
        let state = RunState::new("login", "/repo", "/repo/.worktrees/login", "/repo/specs/login");
        let err = persist_feature(&ReadOnlyFeatures, &state, |feature| {
            feature.lifecycle = Lifecycle::Review;
        })
        .await
        .unwrap_err();

        match err.downcast_ref::<MergeError>() {
            Some(MergeError::FeatureStore { feature_id, message }) => {
                assert_eq!(feature_id, "login");
                assert!(message.contains("readonly database"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(classify_error(&err), ErrorClass::NonFixable);
    }
}
