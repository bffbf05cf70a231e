use adapters::{Cidr, PortRange, RuleAction, RuleMatch, UniversalRule};
use policy_agent::{Action, Decision, QuarantineSpan};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Base priorities per action family; lower wins. Quarantine outranks deny
/// outranks rate limiting, with pinned allows configured above them all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub quarantine: u16,
    pub deny: u16,
    pub rate_limit: u16,
    pub allow: u16,
    pub monitor: u16,
    /// Width of the deterministic jitter added to the base so same-family
    /// rules created together don't all collide on one priority.
    pub jitter_span: u16,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            quarantine: 5,
            deny: 10,
            rate_limit: 30,
            allow: 50,
            monitor: 60,
            jitter_span: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    pub deny_secs: u64,
    pub rate_limit_secs: u64,
    pub monitor_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            deny_secs: 3_600,
            rate_limit_secs: 1_800,
            monitor_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub priority: PriorityConfig,
    pub ttl: TtlConfig,
}

/// Map a decision onto a universal rule.
///
/// Deny narrows to the offending source host on the targeted service;
/// rate limiting carries the tier's packet budget; quarantine drops the
/// port match and isolates the whole host. Allow and monitor decisions
/// produce no enforcement rule here; explicit allow rules enter through
/// the operator surface, not the hot path.
pub fn synthesize(decision: &Decision, config: &SynthesisConfig, now_unix: i64) -> Option<UniversalRule> {
    let src = Cidr::host(decision.src_addr);

    let (matcher, action, base_priority, ttl_secs) = match decision.action {
        Action::Allow | Action::Monitor => return None,
        Action::Deny => (
            RuleMatch {
                src_cidr: Some(src),
                dst_cidr: None,
                protocol: Some(decision.protocol),
                dst_ports: Some(PortRange::single(decision.dst_port)),
                src_ports: None,
            },
            RuleAction::Deny,
            config.priority.deny,
            config.ttl.deny_secs,
        ),
        Action::RateLimit(tier) => {
            let (pps, burst) = tier.limits();
            (
                RuleMatch {
                    src_cidr: Some(src),
                    dst_cidr: None,
                    protocol: Some(decision.protocol),
                    dst_ports: Some(PortRange::single(decision.dst_port)),
                    src_ports: None,
                },
                RuleAction::RateLimit { pps, burst },
                config.priority.rate_limit,
                config.ttl.rate_limit_secs,
            )
        }
        Action::Quarantine(span) => (
            RuleMatch::from_src(src),
            RuleAction::Quarantine {
                duration_secs: span.duration_secs(),
            },
            config.priority.quarantine,
            quarantine_ttl(span),
        ),
    };

    let priority = base_priority.saturating_add(jitter(&decision.decision_id, config.priority.jitter_span));

    Some(UniversalRule {
        rule_id: new_rule_id(),
        matcher,
        action,
        priority,
        ttl_secs: Some(ttl_secs),
        origin_decision_id: Some(decision.decision_id.clone()),
        created_at_unix: now_unix,
    })
}

fn quarantine_ttl(span: QuarantineSpan) -> u64 {
    span.duration_secs()
}

/// Deterministic jitter from the decision id: replaying the same decision
/// synthesizes the same priority.
fn jitter(decision_id: &str, span: u16) -> u16 {
    if span == 0 {
        return 0;
    }
    let digest = Sha256::digest(decision_id.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]]) % span
}

fn new_rule_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("rule_{}", &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::Protocol;
    use policy_agent::RateTier;

    fn decision(action: Action) -> Decision {
        Decision {
            decision_id: "dec_fixed".to_string(),
            detection_id: "det_fixed".to_string(),
            action,
            confidence: 0.9,
            agent_id: "agent".to_string(),
            fallback_used: false,
            decided_at_unix_ms: 1_700_000_000_000,
            src_addr: "203.0.113.7".parse().expect("addr"),
            dst_port: 80,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn deny_narrows_to_source_host_and_service() {
        let rule = synthesize(&decision(Action::Deny), &SynthesisConfig::default(), 100)
            .expect("rule");
        assert_eq!(
            rule.matcher.src_cidr.expect("src").to_string(),
            "203.0.113.7/32"
        );
        assert_eq!(rule.matcher.dst_ports.expect("ports").start, 80);
        assert_eq!(rule.action, RuleAction::Deny);
        assert_eq!(rule.ttl_secs, Some(3_600));
        assert!(rule.priority >= 10 && rule.priority < 26);
    }

    #[test]
    fn quarantine_expands_to_whole_host() {
        let rule = synthesize(
            &decision(Action::Quarantine(QuarantineSpan::Long)),
            &SynthesisConfig::default(),
            100,
        )
        .expect("rule");
        assert!(rule.matcher.dst_ports.is_none());
        assert!(rule.matcher.protocol.is_none());
        assert_eq!(rule.ttl_secs, Some(86_400));
        assert!(rule.priority < 25);
    }

    #[test]
    fn rate_limit_carries_tier_budget() {
        let rule = synthesize(
            &decision(Action::RateLimit(RateTier::High)),
            &SynthesisConfig::default(),
            100,
        )
        .expect("rule");
        assert_eq!(rule.action, RuleAction::RateLimit { pps: 10, burst: 5 });
    }

    #[test]
    fn passive_actions_synthesize_nothing() {
        assert!(synthesize(&decision(Action::Monitor), &SynthesisConfig::default(), 100).is_none());
        assert!(synthesize(&decision(Action::Allow), &SynthesisConfig::default(), 100).is_none());
    }

    #[test]
    fn jitter_is_deterministic_per_decision() {
        let a = synthesize(&decision(Action::Deny), &SynthesisConfig::default(), 100)
            .expect("rule");
        let b = synthesize(&decision(Action::Deny), &SynthesisConfig::default(), 100)
            .expect("rule");
        assert_eq!(a.priority, b.priority);
        assert_ne!(a.rule_id, b.rule_id);
    }
}
