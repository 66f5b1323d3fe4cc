//! Per-feature spec document: the phase ledger and rejection feedback.
//!
//! The document lives at `<spec_dir>/feature.yaml`, next to (not inside) the
//! run checkpoints. It is the second source of truth for resumability: a
//! phase listed in `completed_phases` has finished its primary work and has
//! not been rejected since.

mod feedback;

pub use feedback::{RejectionFeedbackEntry, RejectionFeedbackLog, render_feedback};

use crate::phase::Phase;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const FEATURE_DOC_FILE: &str = "feature.yaml";

/// Structured content of the per-feature document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureDoc {
    #[serde(default)]
    pub completed_phases: Vec<Phase>,
    #[serde(default)]
    pub rejection_feedback: Vec<RejectionFeedbackEntry>,
    /// Keys written by other tools are preserved across saves.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Load/save access to feature documents, keyed by spec directory.
pub trait FeatureDocStore: Send + Sync {
    /// Load the document; a missing document is empty.
    fn load(&self, spec_dir: &Path) -> Result<FeatureDoc>;

    fn save(&self, spec_dir: &Path, doc: &FeatureDoc) -> Result<()>;

    /// Load, modify and save under the store's write lock.
    fn update(&self, spec_dir: &Path, f: &mut dyn FnMut(&mut FeatureDoc)) -> Result<FeatureDoc>;
}

/// YAML files on disk, replaced atomically via a temp file and rename.
#[derive(Default)]
pub struct YamlDocStore {
    write_lock: Mutex<()>,
}

impl YamlDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc_path(spec_dir: &Path) -> PathBuf {
        spec_dir.join(FEATURE_DOC_FILE)
    }

    fn write(spec_dir: &Path, doc: &FeatureDoc) -> Result<()> {
        fs::create_dir_all(spec_dir)
            .with_context(|| format!("Failed to create spec directory: {}", spec_dir.display()))?;
        let path = Self::doc_path(spec_dir);
        let tmp = path.with_extension("yaml.tmp");
        let content = serde_yaml::to_string(doc).context("Failed to serialize feature document")?;
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl FeatureDocStore for YamlDocStore {
    fn load(&self, spec_dir: &Path) -> Result<FeatureDoc> {
        let path = Self::doc_path(spec_dir);
        if !path.exists() {
            return Ok(FeatureDoc::default());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(FeatureDoc::default());
        }
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn save(&self, spec_dir: &Path, doc: &FeatureDoc) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("feature document lock poisoned"))?;
        Self::write(spec_dir, doc)
    }

    fn update(&self, spec_dir: &Path, f: &mut dyn FnMut(&mut FeatureDoc)) -> Result<FeatureDoc> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("feature document lock poisoned"))?;
        let mut doc = self.load(spec_dir)?;
        f(&mut doc);
        Self::write(spec_dir, &doc)?;
        Ok(doc)
    }
}

/// In-memory documents for tests and embedding.
#[derive(Default)]
pub struct MemoryDocStore {
    docs: Mutex<HashMap<PathBuf, FeatureDoc>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureDocStore for MemoryDocStore {
    fn load(&self, spec_dir: &Path) -> Result<FeatureDoc> {
        let docs = self
            .docs
            .lock()
            .map_err(|_| anyhow::anyhow!("feature document lock poisoned"))?;
        Ok(docs.get(spec_dir).cloned().unwrap_or_default())
    }

    fn save(&self, spec_dir: &Path, doc: &FeatureDoc) -> Result<()> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| anyhow::anyhow!("feature document lock poisoned"))?;
        docs.insert(spec_dir.to_path_buf(), doc.clone());
        Ok(())
    }

    fn update(&self, spec_dir: &Path, f: &mut dyn FnMut(&mut FeatureDoc)) -> Result<FeatureDoc> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| anyhow::anyhow!("feature document lock poisoned"))?;
        let doc = docs.entry(spec_dir.to_path_buf()).or_default();
        f(doc);
        Ok(doc.clone())
    }
}

/// Record of which phases have completed for a feature.
///
/// Every mutation writes the document first and returns the new list so the
/// caller can mirror it into `RunState::completed_phases` in the same step.
#[derive(Clone)]
pub struct PhaseLedger {
    store: Arc<dyn FeatureDocStore>,
}

impl PhaseLedger {
    pub fn new(store: Arc<dyn FeatureDocStore>) -> Self {
        Self { store }
    }

    pub fn is_complete(&self, spec_dir: &Path, phase: Phase) -> Result<bool> {
        Ok(self.store.load(spec_dir)?.completed_phases.contains(&phase))
    }

    pub fn completed(&self, spec_dir: &Path) -> Result<Vec<Phase>> {
        Ok(self.store.load(spec_dir)?.completed_phases)
    }

    pub fn record_complete(&self, spec_dir: &Path, phase: Phase) -> Result<Vec<Phase>> {
        let doc = self
            .store
            .update(spec_dir, &mut |doc: &mut FeatureDoc| {
                if !doc.completed_phases.contains(&phase) {
                    doc.completed_phases.push(phase);
                }
            })
            .with_context(|| format!("Failed to record {} as complete", phase))?;
        Ok(doc.completed_phases)
    }

    pub fn clear(&self, spec_dir: &Path, phase: Phase) -> Result<Vec<Phase>> {
        let doc = self
            .store
            .update(spec_dir, &mut |doc: &mut FeatureDoc| doc.completed_phases.retain(|p| *p != phase))
            .with_context(|| format!("Failed to clear {} from the ledger", phase))?;
        Ok(doc.completed_phases)
    }
}
