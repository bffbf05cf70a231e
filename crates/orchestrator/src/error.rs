use std::fmt;

use adapters::Cidr;

/// Why a synthesized rule was refused before touching any adapter.
#[derive(Debug, Clone)]
pub enum ValidationError {
    ProtectedAsset { rule_id: String, asset: Cidr },
    ScopeTooBroad { rule_id: String, prefix_len: u8, min_prefix_len: u8 },
    MissingSource { rule_id: String },
    ContradictsPinnedAllow { rule_id: String },
}

impl ValidationError {
    pub fn rule_id(&self) -> &str {
        match self {
            Self::ProtectedAsset { rule_id, .. } => rule_id,
            Self::ScopeTooBroad { rule_id, .. } => rule_id,
            Self::MissingSource { rule_id } => rule_id,
            Self::ContradictsPinnedAllow { rule_id } => rule_id,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::ProtectedAsset { .. } => "protected_asset",
            Self::ScopeTooBroad { .. } => "scope_too_broad",
            Self::MissingSource { .. } => "missing_source",
            Self::ContradictsPinnedAllow { .. } => "contradicts_pinned_allow",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtectedAsset { rule_id, asset } => {
                write!(f, "rule {} targets protected asset {}", rule_id, asset)
            }
            Self::ScopeTooBroad { rule_id, prefix_len, min_prefix_len } => write!(
                f,
                "rule {} scope /{} broader than allowed /{}",
                rule_id, prefix_len, min_prefix_len
            ),
            Self::MissingSource { rule_id } => {
                write!(f, "rule {} has no source match for an enforcing action", rule_id)
            }
            Self::ContradictsPinnedAllow { rule_id } => {
                write!(f, "rule {} contradicts a pinned allow entry", rule_id)
            }
        }
    }
}

impl std::error::Error for ValidationError {}
