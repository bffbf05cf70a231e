use adapters::{Cidr, RuleActionKind, RuleMatch, UniversalRule};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Narrowest prefix an enforcing rule may carry, per address family.
/// A smaller prefix length means a broader block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScopeLimit {
    pub min_prefix_v4: u8,
    pub min_prefix_v6: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Assets that enforcement must never match, pinned by operators.
    pub protected_assets: Vec<Cidr>,
    /// Matches that must stay reachable; enforcing rules intersecting one
    /// are refused.
    pub pinned_allows: Vec<RuleMatch>,
    pub deny_scope: ScopeLimit,
    pub rate_limit_scope: ScopeLimit,
    pub quarantine_scope: ScopeLimit,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            protected_assets: Vec::new(),
            pinned_allows: Vec::new(),
            deny_scope: ScopeLimit {
                min_prefix_v4: 24,
                min_prefix_v6: 56,
            },
            rate_limit_scope: ScopeLimit {
                min_prefix_v4: 16,
                min_prefix_v6: 48,
            },
            quarantine_scope: ScopeLimit {
                min_prefix_v4: 32,
                min_prefix_v6: 128,
            },
        }
    }
}

pub struct RuleValidator {
    config: ValidatorConfig,
}

impl RuleValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Gate every rule before it reaches an adapter. Only enforcing
    /// actions are constrained; monitor/allow rules pass through.
    pub fn validate(&self, rule: &UniversalRule) -> Result<(), ValidationError> {
        let kind = rule.action.kind();
        if !matches!(
            kind,
            RuleActionKind::Deny | RuleActionKind::RateLimit | RuleActionKind::Quarantine
        ) {
            return Ok(());
        }

        let Some(src) = rule.matcher.src_cidr else {
            return Err(ValidationError::MissingSource {
                rule_id: rule.rule_id.clone(),
            });
        };

        for asset in &self.config.protected_assets {
            let hits_asset = src.intersects(asset)
                || rule
                    .matcher
                    .dst_cidr
                    .map(|dst| dst.intersects(asset))
                    .unwrap_or(false);
            if hits_asset {
                return Err(ValidationError::ProtectedAsset {
                    rule_id: rule.rule_id.clone(),
                    asset: *asset,
                });
            }
        }

        let limit = match kind {
            RuleActionKind::Deny => self.config.deny_scope,
            RuleActionKind::RateLimit => self.config.rate_limit_scope,
            _ => self.config.quarantine_scope,
        };
        let min_prefix_len = if src.addr().is_ipv4() {
            limit.min_prefix_v4
        } else {
            limit.min_prefix_v6
        };
        if src.prefix_len() < min_prefix_len {
            return Err(ValidationError::ScopeTooBroad {
                rule_id: rule.rule_id.clone(),
                prefix_len: src.prefix_len(),
                min_prefix_len,
            });
        }

        for pinned in &self.config.pinned_allows {
            if rule.matcher.intersects(pinned) {
                return Err(ValidationError::ContradictsPinnedAllow {
                    rule_id: rule.rule_id.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::{PortRange, RuleAction};
    use ingest::Protocol;

    fn deny(src: &str) -> UniversalRule {
        UniversalRule {
            rule_id: "rule_v".to_string(),
            matcher: RuleMatch::from_src(src.parse().expect("cidr")),
            action: RuleAction::Deny,
            priority: 10,
            ttl_secs: Some(3_600),
            origin_decision_id: None,
            created_at_unix: 0,
        }
    }

    #[test]
    fn host_deny_passes_default_scope() {
        let validator = RuleValidator::new(ValidatorConfig::default());
        validator.validate(&deny("203.0.113.7/32")).expect("valid");
    }

    #[test]
    fn overly_broad_deny_is_rejected() {
        let validator = RuleValidator::new(ValidatorConfig::default());
        let err = validator.validate(&deny("203.0.0.0/16")).expect_err("rejected");
        assert!(matches!(err, ValidationError::ScopeTooBroad { min_prefix_len: 24, .. }));
    }

    #[test]
    fn wildcard_source_is_rejected_for_enforcement() {
        let validator = RuleValidator::new(ValidatorConfig::default());
        let mut rule = deny("203.0.113.7/32");
        rule.matcher.src_cidr = None;
        assert!(matches!(
            validator.validate(&rule),
            Err(ValidationError::MissingSource { .. })
        ));
    }

    #[test]
    fn protected_asset_is_untouchable() {
        let validator = RuleValidator::new(ValidatorConfig {
            protected_assets: vec!["10.0.0.5/32".parse().expect("cidr")],
            ..ValidatorConfig::default()
        });
        let err = validator.validate(&deny("10.0.0.5/32")).expect_err("rejected");
        assert!(matches!(err, ValidationError::ProtectedAsset { .. }));
    }

    #[test]
    fn pinned_allow_blocks_contradicting_deny() {
        let validator = RuleValidator::new(ValidatorConfig {
            pinned_allows: vec![RuleMatch {
                src_cidr: Some("203.0.113.0/24".parse().expect("cidr")),
                dst_cidr: None,
                protocol: Some(Protocol::Tcp),
                dst_ports: Some(PortRange::single(443)),
                src_ports: None,
            }],
            ..ValidatorConfig::default()
        });

        let mut rule = deny("203.0.113.7/32");
        rule.matcher.protocol = Some(Protocol::Tcp);
        rule.matcher.dst_ports = Some(PortRange::single(443));
        assert!(matches!(
            validator.validate(&rule),
            Err(ValidationError::ContradictsPinnedAllow { .. })
        ));

        // A different service on the same host is fair game.
        rule.matcher.dst_ports = Some(PortRange::single(22));
        validator.validate(&rule).expect("valid");
    }

    #[test]
    fn monitor_rules_are_not_scope_checked() {
        let validator = RuleValidator::new(ValidatorConfig::default());
        let mut rule = deny("0.0.0.0/0");
        rule.action = RuleAction::Monitor;
        validator.validate(&rule).expect("monitor passes");
    }
}
