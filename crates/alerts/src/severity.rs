use policy_agent::Action;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One step up; used when a rule outcome (failed apply, permanent
    /// adapter failure) escalates the underlying decision's alert.
    pub fn escalate(&self) -> Severity {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

pub fn severity_for_action(action: &Action) -> Severity {
    match action {
        Action::Quarantine(_) => Severity::Critical,
        Action::Deny => Severity::High,
        Action::RateLimit(_) => Severity::Medium,
        Action::Allow | Action::Monitor => Severity::Low,
    }
}
