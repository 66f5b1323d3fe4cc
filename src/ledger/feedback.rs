use super::{FeatureDoc, FeatureDocStore};
use crate::phase::Phase;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One human rejection, tagged with the phase it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionFeedbackEntry {
    /// Global across all phases of the feature, starting at 1.
    pub iteration: u32,
    pub phase: Phase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Suspension this rejection answered, as `<run_id>:<checkpoint seq>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<String>,
}

/// Append-only log of rejection feedback stored in the feature document.
#[derive(Clone)]
pub struct RejectionFeedbackLog {
    store: Arc<dyn FeatureDocStore>,
}

impl RejectionFeedbackLog {
    pub fn new(store: Arc<dyn FeatureDocStore>) -> Self {
        Self { store }
    }

    /// Append feedback for `phase` and return its iteration number.
    pub fn append(&self, spec_dir: &Path, phase: Phase, message: &str) -> Result<u32> {
        self.push(spec_dir, phase, message, None)
    }

    /// Append feedback answering `suspension`, at most once.
    ///
    /// A repeated answer to the same suspension returns the iteration that
    /// was recorded first and leaves the log untouched.
    pub fn append_once(&self, spec_dir: &Path, phase: Phase, message: &str, suspension: &str) -> Result<u32> {
        self.push(spec_dir, phase, message, Some(suspension))
    }

    /// Iteration already recorded for `suspension`, if any.
    pub fn iteration_for(&self, spec_dir: &Path, suspension: &str) -> Result<Option<u32>> {
        Ok(self
            .entries(spec_dir)?
            .iter()
            .find(|e| e.suspension.as_deref() == Some(suspension))
            .map(|e| e.iteration))
    }

    fn push(&self, spec_dir: &Path, phase: Phase, message: &str, suspension: Option<&str>) -> Result<u32> {
        let mut iteration = 0;
        self.store
            .update(spec_dir, &mut |doc: &mut FeatureDoc| {
                if let Some(key) = suspension
                    && let Some(existing) = doc
                        .rejection_feedback
                        .iter()
                        .find(|e| e.suspension.as_deref() == Some(key))
                {
                    iteration = existing.iteration;
                    return;
                }
                iteration = doc
                    .rejection_feedback
                    .iter()
                    .map(|e| e.iteration)
                    .max()
                    .unwrap_or(0)
                    + 1;
                doc.rejection_feedback.push(RejectionFeedbackEntry {
                    iteration,
                    phase,
                    message: message.to_string(),
                    timestamp: Utc::now(),
                    suspension: suspension.map(str::to_string),
                });
            })
            .with_context(|| format!("Failed to append rejection feedback for {}", phase))?;
        Ok(iteration)
    }

    pub fn entries(&self, spec_dir: &Path) -> Result<Vec<RejectionFeedbackEntry>> {
        Ok(self.store.load(spec_dir)?.rejection_feedback)
    }

    pub fn entries_for(&self, spec_dir: &Path, phase: Phase) -> Result<Vec<RejectionFeedbackEntry>> {
        Ok(self
            .entries(spec_dir)?
            .into_iter()
            .filter(|e| e.phase == phase)
            .collect())
    }

    pub fn render(&self, spec_dir: &Path, phase: Phase) -> Result<String> {
        Ok(render_feedback(&self.entries(spec_dir)?, phase))
    }
}

/// Format the entries for `phase` as a prompt block, oldest first.
/// Entries of other phases are ignored; no entries renders as "".
pub fn render_feedback(entries: &[RejectionFeedbackEntry], phase: Phase) -> String {
    let matching: Vec<&RejectionFeedbackEntry> = entries.iter().filter(|e| e.phase == phase).collect();
    if matching.is_empty() {
        return String::new();
    }

    let mut out = format!(
        "## Reviewer feedback on the {} phase\n\n\
         Earlier versions of this phase were rejected. Address every point below; \
         later feedback takes precedence when points conflict.\n",
        phase.title().to_lowercase()
    );
    for entry in matching {
        out.push_str(&format!(
            "\n### Iteration {} ({})\n{}\n",
            entry.iteration,
            entry.timestamp.format("%Y-%m-%d %H:%M UTC"),
            entry.message.trim()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryDocStore, YamlDocStore};

    fn log() -> RejectionFeedbackLog {
        RejectionFeedbackLog::new(Arc::new(MemoryDocStore::new()))
    }

    #[test]
    fn test_iterations_are_global_across_phases() {
        let log = log();
        let dir = Path::new("/specs/f");
        let mut seen = Vec::new();
        for round in 0..10 {
            for phase in [Phase::Requirements, Phase::Plan, Phase::Merge] {
                seen.push(log.append(dir, phase, &format!("{} round {}", phase, round)).unwrap());
            }
        }
        assert_eq!(seen, (1..=30).collect::<Vec<u32>>());
        let plan = log.entries_for(dir, Phase::Plan).unwrap();
        assert_eq!(plan.len(), 10);
        assert_eq!(plan[0].iteration, 2);
    }

    #[test]
    fn test_render_is_phase_isolated_and_ordered() {
        let log = log();
        let dir = Path::new("/specs/f");
        log.append(dir, Phase::Plan, "split the migration").unwrap();
        log.append(dir, Phase::Requirements, "REQ-ONLY").unwrap();
        log.append(dir, Phase::Plan, "add rollback steps").unwrap();

        let block = log.render(dir, Phase::Plan).unwrap();
        assert!(block.contains("plan phase"));
        assert!(!block.contains("REQ-ONLY"));
        let first = block.find("split the migration").unwrap();
        let second = block.find("add rollback steps").unwrap();
        assert!(first < second);
        assert!(block.contains("Iteration 1"));
        assert!(block.contains("Iteration 3"));
    }

    #[test]
    fn test_repeated_answer_to_one_suspension_is_recorded_once() {
        let log = log();
        let dir = Path::new("/specs/f");
        assert_eq!(log.append_once(dir, Phase::Requirements, "add criteria", "run-1:3").unwrap(), 1);
        assert_eq!(log.append_once(dir, Phase::Requirements, "add criteria", "run-1:3").unwrap(), 1);
        assert_eq!(log.iteration_for(dir, "run-1:3").unwrap(), Some(1));
        assert_eq!(log.iteration_for(dir, "run-1:7").unwrap(), None);
        assert_eq!(log.append_once(dir, Phase::Requirements, "add criteria", "run-1:7").unwrap(), 2);
        assert_eq!(log.entries(dir).unwrap().len(), 2);
    }

    #[test]
    fn test_render_without_entries_is_empty() {
        assert_eq!(log().render(Path::new("/x"), Phase::Plan).unwrap(), "");
    }

    #[test]
    fn test_feedback_persists_in_yaml_document() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn FeatureDocStore> = Arc::new(YamlDocStore::new());
        RejectionFeedbackLog::new(store.clone())
            .append(dir.path(), Phase::Requirements, "needs acceptance criteria")
            .unwrap();
        let reopened = RejectionFeedbackLog::new(Arc::new(YamlDocStore::new()));
        let entries = reopened.entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "needs acceptance criteria");
        assert_eq!(reopened.append(dir.path(), Phase::Plan, "x").unwrap(), 2);
    }
}
