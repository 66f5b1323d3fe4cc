//! Scripted fakes of the engine's external collaborators.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use forge_flow::agent::{AgentExecutor, AgentOptions, AgentOutput};
use forge_flow::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use forge_flow::config::{AutoFixConfig, CiConfig};
use forge_flow::errors::{GitPrError, GitPrErrorCode};
use forge_flow::git::{CiRun, CiStatus, DiffSummary, GitPrService, MergeStrategy, PrInfo, PrStatusInfo};
use forge_flow::ledger::MemoryDocStore;
use forge_flow::merge::MergeNode;
use forge_flow::orchestrator::{ExecutionEngine, NodeAutoFixWrapper, PhaseGraph, PhaseNode};
use forge_flow::store::{MemoryAgentRunRepository, MemoryFeatureRepository};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const REPO: &str = "/repo";
pub const WORKTREE: &str = "/repo/.worktrees/login";
pub const SPEC_DIR: &str = "/repo/specs/login";

#[derive(Debug, Clone)]
pub struct AgentCall {
    pub label: String,
    pub prompt: String,
    pub cwd: PathBuf,
}

type Responder = Box<dyn Fn(&AgentCall) -> Result<AgentOutput> + Send + Sync>;

/// Records every invocation and answers through a closure.
pub struct ScriptedAgent {
    calls: Mutex<Vec<AgentCall>>,
    respond: Responder,
}

impl ScriptedAgent {
    pub fn new(respond: impl Fn(&AgentCall) -> Result<AgentOutput> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    /// Succeeds everywhere; the commit step reports a commit and a PR.
    pub fn happy() -> Arc<Self> {
        Self::new(default_reply)
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.label).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls().iter().filter(|c| c.label == label).count()
    }

    pub fn prompts_for(&self, label: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.label == label)
            .map(|c| c.prompt)
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

pub fn default_reply(call: &AgentCall) -> Result<AgentOutput> {
    Ok(match call.label.as_str() {
        "merge:commit" => AgentOutput::ok(
            "Committed and pushed.\nCommit: 3f2a9c1d\nPR: https://github.com/acme/app/pull/7",
        ),
        other => AgentOutput::ok(format!("{} output", other)),
    })
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(&self, prompt: &str, options: &AgentOptions) -> Result<AgentOutput> {
        let call = AgentCall {
            label: options.label.clone(),
            prompt: prompt.to_string(),
            cwd: options.cwd.clone(),
        };
        self.calls.lock().unwrap().push(call.clone());
        (self.respond)(&call)
    }

    fn supports_feature(&self, _name: &str) -> bool {
        false
    }
}

/// Mutable script behind [`FakeGitPr`].
#[derive(Default)]
pub struct FakeGitState {
    /// When false `ci_status` reports no CI run.
    pub ci_enabled: bool,
    pub ci_polls: u32,
    /// Consumed front to back by `watch_ci`; empty means success.
    pub watch_script: VecDeque<Result<CiStatus, GitPrErrorCode>>,
    /// Returned by `watch_ci` once the script is exhausted.
    pub watch_fallback: Option<CiStatus>,
    pub verify_merge: bool,
    pub verify_calls: Vec<(PathBuf, String, String)>,
    pub pr_statuses: HashMap<PathBuf, Vec<PrStatusInfo>>,
    pub failing_repos: HashSet<PathBuf>,
    pub list_calls: Vec<PathBuf>,
}

#[derive(Default)]
pub struct FakeGitPr {
    state: Mutex<FakeGitState>,
}

impl FakeGitPr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeGitState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl GitPrService for FakeGitPr {
    async fn has_remote(&self, _repo: &Path) -> Result<bool, GitPrError> {
        Ok(true)
    }

    async fn default_branch(&self, _repo: &Path) -> Result<String, GitPrError> {
        Ok("main".to_string())
    }

    async fn commit_all(&self, _cwd: &Path, _message: &str) -> Result<String, GitPrError> {
        Ok("3f2a9c1d".to_string())
    }

    async fn push(&self, _cwd: &Path, _branch: &str, _set_upstream: bool) -> Result<(), GitPrError> {
        Ok(())
    }

    async fn create_pr(&self, _cwd: &Path, _title: &str, _body: &str, _base: &str) -> Result<PrInfo, GitPrError> {
        Ok(PrInfo {
            number: 7,
            url: "https://github.com/acme/app/pull/7".to_string(),
        })
    }

    async fn merge_pr(&self, _cwd: &Path, _pr_number: u64, _strategy: MergeStrategy) -> Result<(), GitPrError> {
        Ok(())
    }

    async fn merge_branch(&self, _repo: &Path, _source: &str, _target: &str) -> Result<(), GitPrError> {
        Ok(())
    }

    async fn ci_status(&self, _cwd: &Path, _branch: &str) -> Result<Option<CiRun>, GitPrError> {
        self.with(|s| {
            if !s.ci_enabled {
                return Ok(None);
            }
            s.ci_polls += 1;
            Ok(Some(CiRun {
                id: format!("ci-{}", s.ci_polls),
                status: CiStatus::Pending,
                url: None,
            }))
        })
    }

    async fn watch_ci(&self, _cwd: &Path, run_id: &str, _timeout: std::time::Duration) -> Result<CiStatus, GitPrError> {
        self.with(|s| match s.watch_script.pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(code)) => Err(GitPrError::new(code, format!("watch of {} failed", run_id))),
            None => Ok(s.watch_fallback.unwrap_or(CiStatus::Success)),
        })
    }

    async fn failure_logs(&self, _cwd: &Path, run_id: &str, _max_chars: usize) -> Result<String, GitPrError> {
        Ok(format!("error[E0308]: mismatched types in {}\n{}", run_id, "x".repeat(200)))
    }

    async fn verify_merge(&self, repo: &Path, branch: &str, base: &str) -> Result<bool, GitPrError> {
        self.with(|s| {
            s.verify_calls
                .push((repo.to_path_buf(), branch.to_string(), base.to_string()));
            Ok(s.verify_merge)
        })
    }

    async fn diff_summary(&self, _cwd: &Path, _base: &str) -> Result<DiffSummary, GitPrError> {
        Ok(DiffSummary {
            files_changed: 3,
            insertions: 42,
            deletions: 7,
        })
    }

    async fn list_pr_statuses(&self, repo: &Path) -> Result<Vec<PrStatusInfo>, GitPrError> {
        self.with(|s| {
            s.list_calls.push(repo.to_path_buf());
            if s.failing_repos.contains(repo) {
                return Err(GitPrError::new(GitPrErrorCode::AuthFailure, "gh auth expired"));
            }
            Ok(s.pr_statuses.get(repo).cloned().unwrap_or_default())
        })
    }
}

pub fn fast_ci(max_fix_attempts: u32) -> CiConfig {
    CiConfig {
        max_fix_attempts,
        poll_interval_secs: 0,
        repoll_attempts: 2,
        ..CiConfig::default()
    }
}

/// An engine wired to in-memory stores and the given fakes.
pub struct Harness {
    pub engine: ExecutionEngine,
    pub agent: Arc<ScriptedAgent>,
    pub git: Arc<FakeGitPr>,
    pub features: Arc<MemoryFeatureRepository>,
    pub runs: Arc<MemoryAgentRunRepository>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

pub struct HarnessBuilder {
    agent: Arc<ScriptedAgent>,
    git: Arc<FakeGitPr>,
    checkpoints: Arc<dyn CheckpointStore>,
    autofix: AutoFixConfig,
    ci: CiConfig,
    max_rejections: Option<u32>,
    nodes: Vec<Arc<dyn PhaseNode>>,
    executor: Option<Arc<dyn AgentExecutor>>,
}

impl HarnessBuilder {
    pub fn new(agent: Arc<ScriptedAgent>) -> Self {
        Self {
            agent,
            git: FakeGitPr::new(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            autofix: AutoFixConfig::default(),
            ci: fast_ci(3),
            max_rejections: None,
            nodes: Vec::new(),
            executor: None,
        }
    }

    /// Replace the standard node of the node's phase.
    pub fn node(mut self, node: Arc<dyn PhaseNode>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Drive the engine with a different executor; `Harness::agent` then
    /// records nothing.
    pub fn executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn git(mut self, git: Arc<FakeGitPr>) -> Self {
        self.git = git;
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn autofix(mut self, autofix: AutoFixConfig) -> Self {
        self.autofix = autofix;
        self
    }

    pub fn ci(mut self, ci: CiConfig) -> Self {
        self.ci = ci;
        self
    }

    pub fn max_rejections(mut self, limit: u32) -> Self {
        self.max_rejections = Some(limit);
        self
    }

    pub fn build(self) -> Harness {
        let docs = Arc::new(MemoryDocStore::new());
        let features = Arc::new(MemoryFeatureRepository::new());
        let runs = Arc::new(MemoryAgentRunRepository::new());
        let feedback = forge_flow::ledger::RejectionFeedbackLog::new(docs.clone());

        let executor: Arc<dyn AgentExecutor> = match self.executor {
            Some(executor) => executor,
            None => self.agent.clone(),
        };

        let merge = Arc::new(MergeNode::new(
            executor.clone(),
            self.git.clone(),
            features.clone(),
            self.ci,
        ));
        let mut graph = PhaseGraph::standard(executor.clone(), feedback, merge);
        for node in self.nodes {
            graph = graph.with_node(node);
        }
        let autofix = NodeAutoFixWrapper::new(executor, &self.autofix);
        let engine = ExecutionEngine::new(
            graph,
            self.checkpoints.clone(),
            docs,
            autofix,
            features.clone(),
            runs.clone(),
        )
        .with_max_rejections(self.max_rejections);

        Harness {
            engine,
            agent: self.agent,
            git: self.git,
            features,
            runs,
            checkpoints: self.checkpoints,
        }
    }
}
