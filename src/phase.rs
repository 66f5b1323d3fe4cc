//! Phase definitions for the feature lifecycle.
//!
//! A feature moves through a fixed, ordered set of phases:
//! `analyze → requirements → research → plan → implement → merge`.
//! The order is total, so phases compare by position in the lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of the feature lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyze,
    Requirements,
    Research,
    Plan,
    Implement,
    Merge,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 6] = [
        Phase::Analyze,
        Phase::Requirements,
        Phase::Research,
        Phase::Plan,
        Phase::Implement,
        Phase::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Requirements => "requirements",
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Merge => "merge",
        }
    }

    /// Human-readable title used in prompts and feedback headings.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Analyze => "Analysis",
            Self::Requirements => "Requirements",
            Self::Research => "Research",
            Self::Plan => "Plan",
            Self::Implement => "Implementation",
            Self::Merge => "Merge",
        }
    }

    /// The phase that follows this one in the lifecycle, ignoring routing rules.
    pub fn successor(&self) -> Option<Phase> {
        let idx = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "analyze" => Ok(Self::Analyze),
            "requirements" => Ok(Self::Requirements),
            "research" => Ok(Self::Research),
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "merge" => Ok(Self::Merge),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: analyze, requirements, research, plan, implement, merge",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_lifecycle_order() {
        assert!(Phase::Analyze < Phase::Requirements);
        assert!(Phase::Implement < Phase::Merge);
        let mut shuffled = vec![Phase::Merge, Phase::Analyze, Phase::Plan];
        shuffled.sort();
        assert_eq!(shuffled, vec![Phase::Analyze, Phase::Plan, Phase::Merge]);
    }

    #[test]
    fn test_successor_chain_ends_at_merge() {
        assert_eq!(Phase::Analyze.successor(), Some(Phase::Requirements));
        assert_eq!(Phase::Implement.successor(), Some(Phase::Merge));
        assert_eq!(Phase::Merge.successor(), None);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("PLAN".parse::<Phase>().unwrap(), Phase::Plan);
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Phase::Requirements).unwrap();
        assert_eq!(json, "\"requirements\"");
    }
}
