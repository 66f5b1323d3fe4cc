//! Prompt construction for agent invocations.

use super::state::RunState;
use crate::agent::UNFIXABLE_SENTINEL;
use crate::phase::Phase;

fn task_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Analyze => {
            "Analyze the repository and the feature request. Summarize the relevant modules, \
             existing conventions, and the risks of this change."
        }
        Phase::Requirements => {
            "Write a product requirements document for the feature: goals, non-goals, \
             user-facing behavior, and testable acceptance criteria."
        }
        Phase::Research => {
            "Research how the requirements can be met in this codebase. Identify the files, \
             APIs and libraries involved and note any open technical questions."
        }
        Phase::Plan => {
            "Produce a step-by-step implementation plan. Each step names the files it touches \
             and how it will be verified."
        }
        Phase::Implement => {
            "Implement the plan in the working tree. Run the project's tests and fix failures \
             before finishing. Do not commit."
        }
        Phase::Merge => "Deliver the implemented change.",
    }
}

/// Prompt for a phase's primary work, including prior artifacts and any
/// rejection feedback recorded for this phase.
pub fn phase_prompt(phase: Phase, state: &RunState, feedback: &str) -> String {
    let mut prompt = format!(
        "You are working on feature `{}` in {}.\n\n## FEATURE\n{}\n",
        state.feature_id,
        state.worktree_path.display(),
        if state.description.trim().is_empty() {
            "(no description provided)"
        } else {
            state.description.trim()
        }
    );

    for prior in Phase::ALL.iter().copied().filter(|p| *p < phase) {
        if let Some(artifact) = state.artifact(prior) {
            prompt.push_str(&format!("\n## {} OUTPUT\n{}\n", prior.title().to_uppercase(), artifact.trim()));
        }
    }

    if !feedback.is_empty() {
        prompt.push('\n');
        prompt.push_str(feedback);
    }

    prompt.push_str(&format!("\n## TASK ({})\n{}\n", phase.title(), task_for(phase)));
    prompt
}

/// Commit, push and optionally open a PR from the worktree.
pub fn commit_prompt(state: &RunState, branch: &str, base: &str) -> String {
    let mut steps = vec![format!(
        "1. Stage and commit all changes on branch `{}` with a descriptive message.",
        branch
    )];
    if state.push || state.open_pr {
        steps.push(format!("2. Push `{}` to the remote, setting upstream.", branch));
    }
    if state.open_pr {
        steps.push(format!(
            "3. Open a pull request from `{}` into `{}` summarizing the change.",
            branch, base
        ));
    }

    format!(
        "Deliver feature `{}`.\n\n## STEPS\n{}\n\n## REPORT\n\
         End your reply with one line per item you produced:\n\
         Commit: <full commit sha>\n\
         PR: <pull request url>\n",
        state.feature_id,
        steps.join("\n")
    )
}

pub fn ci_fix_prompt(branch: &str, attempt: u32, max_attempts: u32, logs: &str) -> String {
    format!(
        "CI failed on branch `{}` (fix attempt {} of {}).\n\n\
         ## FAILURE LOGS\n```\n{}\n```\n\n\
         ## TASK\nFix the cause of the failure, commit, and push to the same branch. \
         Do not disable or skip failing checks.\n",
        branch, attempt, max_attempts, logs
    )
}

pub fn merge_prompt(state: &RunState, branch: &str, base: &str) -> String {
    match state.pr_number {
        Some(number) => format!(
            "Merge pull request #{} (branch `{}`) into `{}` using a squash merge, \
             then confirm the merge succeeded.\n",
            number, branch, base
        ),
        None => format!(
            "Merge branch `{}` into `{}` in this repository (squash if possible) \
             and confirm the merge succeeded. Do not modify any worktree.\n",
            branch, base
        ),
    }
}

/// Ask the agent to repair whatever made `phase` fail.
pub fn node_fix_prompt(phase: Phase, attempt: u32, max_attempts: u32, error: &str) -> String {
    format!(
        "The `{}` phase failed (fix attempt {} of {}).\n\n## ERROR\n```\n{}\n```\n\n\
         ## TASK\nFix the underlying problem so the phase can be retried. \
         If the problem cannot be fixed by changing files in this repository, \
         reply with `{} <reason>` and nothing else.\n",
        phase, attempt, max_attempts, error, UNFIXABLE_SENTINEL
    )
}
