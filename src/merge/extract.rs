//! Pull delivery facts out of the agent's free-text reply.
//!
//! Missing or malformed values yield `None`; extraction never fails the phase.

use regex::Regex;
use std::sync::LazyLock;

static COMMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:commit)(?:\s+(?i:hash|sha))?\s*[:=#]?\s*`?([0-9a-f]{7,40})\b").unwrap()
});

static BARE_SHA_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([0-9a-f]{40})\b").unwrap());

static PR_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://github\.com/[\w.-]+/[\w.-]+/pull/(\d+)").unwrap());

/// Commit hash from a "Commit: <sha>" line, falling back to any full-length sha.
pub fn extract_commit_hash(text: &str) -> Option<String> {
    COMMIT_REGEX
        .captures(text)
        .or_else(|| BARE_SHA_REGEX.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// First GitHub pull request URL and its number.
pub fn extract_pr(text: &str) -> Option<(String, u64)> {
    let caps = PR_URL_REGEX.captures(text)?;
    let url = caps.get(0)?.as_str().to_string();
    let number = caps.get(1)?.as_str().parse().ok()?;
    Some((url, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_from_report_line() {
        let text = "Pushed the branch.\nCommit: 3f2a9c1\nPR: https://github.com/acme/app/pull/42";
        assert_eq!(extract_commit_hash(text).as_deref(), Some("3f2a9c1"));
        assert_eq!(
            extract_pr(text),
            Some(("https://github.com/acme/app/pull/42".to_string(), 42))
        );
    }

    #[test]
    fn test_commit_variants() {
        assert_eq!(
            extract_commit_hash("Created commit hash: `abcdef1234`").as_deref(),
            Some("abcdef1234")
        );
        let full = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(extract_commit_hash(&format!("HEAD is now {}", full)).as_deref(), Some(full));
    }

    #[test]
    fn test_missing_values_are_none() {
        assert_eq!(extract_commit_hash("I committed the changes."), None);
        assert_eq!(extract_pr("PR: pending, see https://gitlab.com/a/b/merge_requests/3"), None);
        assert_eq!(extract_pr(""), None);
    }
}
