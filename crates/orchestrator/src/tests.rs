use std::sync::Arc;

use adapters::{
    AdapterError, Cidr, FirewallAdapter, MemoryAdapter, PortRange, RuleAction, RuleMatch,
    UniversalRule,
};
use ingest::Protocol;
use policy_agent::{Action, Decision, RateTier};

use crate::engine::{DecisionOutcome, Orchestrator, OrchestratorConfig};
use crate::retry::RetryConfig;
use crate::state::RuleLifecycle;
use crate::validate::ValidatorConfig;

fn decision(id: &str, action: Action, src: &str, dst_port: u16) -> Decision {
    Decision {
        decision_id: id.to_string(),
        detection_id: format!("det_{}", id),
        action,
        confidence: 0.9,
        agent_id: "agent".to_string(),
        fallback_used: false,
        decided_at_unix_ms: 1_700_000_000_000,
        src_addr: src.parse().expect("addr"),
        dst_port,
        protocol: Protocol::Tcp,
    }
}

fn orchestrator_with(adapters: Vec<Arc<dyn FirewallAdapter>>) -> Orchestrator {
    Orchestrator::new(
        OrchestratorConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_ms: 1_000,
                max_ms: 4_000,
            },
            ..OrchestratorConfig::default()
        },
        adapters,
    )
}

#[tokio::test]
async fn deny_decision_becomes_active_rule() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;

    let DecisionOutcome::Applied { rule, report, displaced } = outcome else {
        panic!("expected Applied, got {:?}", outcome);
    };
    assert!(displaced.is_empty());
    assert_eq!(report.lifecycle, RuleLifecycle::Active);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome.wire_value(), "OK");
    assert!(memory.installed_rule(&rule.rule_id).is_some());

    let record = orchestrator.rule(&rule.rule_id).expect("record");
    assert_eq!(record.lifecycle, RuleLifecycle::Active);
    assert_eq!(record.expires_at_unix, Some(100 + 3_600));
}

#[tokio::test]
async fn monitor_decision_applies_no_rule() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Monitor, "203.0.113.7", 80), 100)
        .await;
    assert!(matches!(outcome, DecisionOutcome::NoRule { .. }));
    assert_eq!(memory.installed_count(), 0);
}

#[tokio::test]
async fn replayed_decision_is_idempotent() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let d = decision("d1", Action::Deny, "203.0.113.7", 80);
    let first = orchestrator.handle_decision(&d, 100).await;
    let DecisionOutcome::Applied { rule, .. } = first else {
        panic!("expected Applied");
    };

    let second = orchestrator.handle_decision(&d, 101).await;
    let DecisionOutcome::DuplicateDecision { rule_id, .. } = second else {
        panic!("expected DuplicateDecision, got {:?}", second);
    };
    assert_eq!(rule_id, rule.rule_id);
    assert_eq!(memory.installed_count(), 1);
    assert_eq!(
        orchestrator.list_rules(Some(RuleLifecycle::Active)).len(),
        1
    );
}

#[tokio::test]
async fn identical_match_same_family_dedupes_and_bumps_ttl() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let first = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, .. } = first else {
        panic!("expected Applied");
    };
    let before = orchestrator.rule(&rule.rule_id).expect("record").expires_at_unix;

    let second = orchestrator
        .handle_decision(&decision("d2", Action::Deny, "203.0.113.7", 80), 2_000)
        .await;
    let DecisionOutcome::Deduped { existing_rule_id, .. } = second else {
        panic!("expected Deduped, got {:?}", second);
    };
    assert_eq!(existing_rule_id, rule.rule_id);
    let after = orchestrator.rule(&rule.rule_id).expect("record").expires_at_unix;
    assert!(after > before);
    assert_eq!(memory.installed_count(), 1);
}

#[tokio::test]
async fn conflicting_action_lower_priority_wins_and_displaces() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    // Standing allow on (10.0.0.5, 443) at priority 50, as an operator
    // pinned rule entering through the rule surface.
    let allow = UniversalRule {
        rule_id: "rule_allow".to_string(),
        matcher: RuleMatch {
            src_cidr: Some("10.0.0.5/32".parse::<Cidr>().expect("cidr")),
            dst_cidr: None,
            protocol: Some(Protocol::Tcp),
            dst_ports: Some(PortRange::single(443)),
            src_ports: None,
        },
        action: RuleAction::Allow,
        priority: 50,
        ttl_secs: None,
        origin_decision_id: None,
        created_at_unix: 0,
    };
    let outcome = orchestrator
        .apply_rule(allow.clone(), "op_1".to_string(), 10)
        .await;
    assert!(matches!(outcome, DecisionOutcome::Applied { .. }));

    // A deny on the identical match with a stronger (lower) priority.
    let deny = UniversalRule {
        rule_id: "rule_deny".to_string(),
        matcher: allow.matcher.clone(),
        action: RuleAction::Deny,
        priority: 10,
        ttl_secs: Some(3_600),
        origin_decision_id: Some("dec_x".to_string()),
        created_at_unix: 20,
    };
    let outcome = orchestrator.apply_rule(deny, "dec_x".to_string(), 20).await;

    let DecisionOutcome::Applied { rule, displaced, .. } = outcome else {
        panic!("expected Applied, got {:?}", outcome);
    };
    assert_eq!(displaced, vec!["rule_allow".to_string()]);
    assert_eq!(
        orchestrator.rule("rule_allow").expect("record").lifecycle,
        RuleLifecycle::RolledBack
    );
    assert_eq!(
        orchestrator.rule(&rule.rule_id).expect("record").lifecycle,
        RuleLifecycle::Active
    );

    // The adapter saw the loser removed before the winner added.
    let log = memory.op_log();
    let remove_index = log
        .iter()
        .position(|op| op == "remove:rule_allow")
        .expect("remove logged");
    let add_index = log
        .iter()
        .position(|op| op == "apply:rule_deny")
        .expect("add logged");
    assert!(remove_index < add_index, "log order: {:?}", log);
}

#[tokio::test]
async fn higher_priority_incumbent_rejects_newcomer() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let deny = UniversalRule {
        rule_id: "rule_deny".to_string(),
        matcher: RuleMatch::from_src("203.0.113.7/32".parse().expect("cidr")),
        action: RuleAction::Deny,
        priority: 5,
        ttl_secs: Some(3_600),
        origin_decision_id: None,
        created_at_unix: 0,
    };
    orchestrator.apply_rule(deny, "op_1".to_string(), 10).await;

    let allow = UniversalRule {
        rule_id: "rule_allow".to_string(),
        matcher: RuleMatch::from_src("203.0.113.7/32".parse().expect("cidr")),
        action: RuleAction::Allow,
        priority: 50,
        ttl_secs: None,
        origin_decision_id: None,
        created_at_unix: 20,
    };
    let outcome = orchestrator.apply_rule(allow, "op_2".to_string(), 20).await;
    assert!(matches!(
        outcome,
        DecisionOutcome::LostConflict { ref winner_rule_id, .. } if winner_rule_id == "rule_deny"
    ));
    assert_eq!(memory.installed_count(), 1);
}

#[tokio::test]
async fn partial_adapter_success_is_active_with_tracked_outcomes() {
    let healthy = Arc::new(MemoryAdapter::new("mem-a"));
    let flaky = Arc::new(MemoryAdapter::new("mem-b"));
    flaky.fail_next_apply(AdapterError::Transient("busy".to_string()));
    let mut orchestrator = orchestrator_with(vec![healthy.clone(), flaky.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, report, .. } = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(report.lifecycle, RuleLifecycle::Active);

    let record = orchestrator.rule(&rule.rule_id).expect("record");
    assert_eq!(
        record.adapter_outcomes.get("mem-a").map(|o| o.wire_value()),
        Some("OK")
    );
    assert_eq!(
        record.adapter_outcomes.get("mem-b").map(|o| o.wire_value()),
        Some("TRANSIENT")
    );
}

#[tokio::test]
async fn partial_failure_retries_straggler_until_ok() {
    let healthy = Arc::new(MemoryAdapter::new("mem-a"));
    let flaky = Arc::new(MemoryAdapter::new("mem-b"));
    flaky.fail_next_apply(AdapterError::Transient("busy".to_string()));
    flaky.fail_next_apply(AdapterError::Transient("busy".to_string()));
    let mut orchestrator = orchestrator_with(vec![healthy.clone(), flaky.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, report, .. } = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(report.lifecycle, RuleLifecycle::Active);
    assert!(report.will_retry, "straggler adapter should be retried");

    // Two more dispatches: the flaky adapter fails once more, then lands.
    let due = orchestrator.rule(&rule.rule_id).expect("record").next_retry_unix.expect("scheduled");
    orchestrator.retry_due(due).await;
    let due = orchestrator.rule(&rule.rule_id).expect("record").next_retry_unix.expect("scheduled");
    orchestrator.retry_due(due).await;

    let record = orchestrator.rule(&rule.rule_id).expect("record");
    assert_eq!(record.lifecycle, RuleLifecycle::Active);
    assert!(record.next_retry_unix.is_none());
    assert_eq!(flaky.installed_count(), 1);

    // The history keeps both failures alongside the eventual success.
    let flaky_outcomes: Vec<&str> = record
        .outcome_history
        .iter()
        .filter(|event| event.adapter_id == "mem-b")
        .map(|event| event.outcome.wire_value())
        .collect();
    assert_eq!(flaky_outcomes, vec!["TRANSIENT", "TRANSIENT", "OK"]);
}

#[tokio::test]
async fn all_adapters_failing_schedules_bounded_retries() {
    let flaky = Arc::new(MemoryAdapter::new("mem-a"));
    flaky.fail_next_apply(AdapterError::Transient("busy".to_string()));
    flaky.fail_next_apply(AdapterError::Transient("busy".to_string()));
    let mut orchestrator = orchestrator_with(vec![flaky.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, report, .. } = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(report.lifecycle, RuleLifecycle::Failed);
    assert!(report.will_retry);

    // First retry still fails.
    let record = orchestrator.rule(&rule.rule_id).expect("record");
    let due_at = record.next_retry_unix.expect("retry scheduled");
    let reports = orchestrator.retry_due(due_at).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].lifecycle, RuleLifecycle::Failed);

    // Second retry succeeds and the rule goes active.
    let record = orchestrator.rule(&rule.rule_id).expect("record");
    let due_at = record.next_retry_unix.expect("retry scheduled");
    let reports = orchestrator.retry_due(due_at).await;
    assert_eq!(reports[0].lifecycle, RuleLifecycle::Active);
    assert_eq!(flaky.installed_count(), 1);
}

#[tokio::test]
async fn retries_give_up_after_max_attempts() {
    let dead = Arc::new(MemoryAdapter::new("mem-a"));
    for _ in 0..10 {
        dead.fail_next_apply(AdapterError::Transient("busy".to_string()));
    }
    let mut orchestrator = orchestrator_with(vec![dead.clone()]);

    orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    // Drain every scheduled retry.
    for now in [200, 400, 800, 1_600, 3_200] {
        orchestrator.retry_due(now).await;
    }

    assert_eq!(orchestrator.counters().permanent_failures, 1);
    let rules = orchestrator.list_rules(Some(RuleLifecycle::Failed));
    assert_eq!(rules.len(), 1);
    assert!(rules[0].next_retry_unix.is_none());
}

#[tokio::test]
async fn unreachable_adapter_pauses_and_probe_resumes() {
    let shaky = Arc::new(MemoryAdapter::new("mem-a"));
    shaky.fail_next_apply(AdapterError::Unreachable("down".to_string()));
    let mut orchestrator = orchestrator_with(vec![shaky.clone()]);

    orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    assert_eq!(orchestrator.counters().adapters_paused, 1);

    // Probe after the interval brings it back (list succeeds).
    orchestrator.probe_paused_adapters(200).await;
    assert_eq!(orchestrator.counters().adapters_resumed, 1);

    // Next dispatch reaches the adapter again.
    let outcome = orchestrator
        .handle_decision(&decision("d2", Action::Deny, "198.51.100.9", 22), 300)
        .await;
    let DecisionOutcome::Applied { report, .. } = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(report.lifecycle, RuleLifecycle::Active);
}

#[tokio::test]
async fn expiry_removes_rule_from_adapters() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::RateLimit(RateTier::Med), "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, .. } = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(memory.installed_count(), 1);

    // Rate-limit default ttl is 30 minutes.
    let reports = orchestrator.expire_due(100 + 1_800).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].lifecycle, RuleLifecycle::Expired);
    assert_eq!(memory.installed_count(), 0);
    // Still queryable for audit.
    assert_eq!(
        orchestrator.rule(&rule.rule_id).expect("record").lifecycle,
        RuleLifecycle::Expired
    );
}

#[tokio::test]
async fn rollback_restores_adapter_state() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, .. } = outcome else {
        panic!("expected Applied");
    };
    assert_eq!(memory.installed_count(), 1);

    let report = orchestrator
        .rollback_by_decision("d1", 200)
        .await
        .expect("rollback");
    assert_eq!(report.rule_id, rule.rule_id);
    assert_eq!(memory.installed_count(), 0);

    // Rolling back twice is a no-op.
    assert!(orchestrator.rollback(&rule.rule_id, 201).await.is_none());
}

#[tokio::test]
async fn hit_counters_flow_from_adapters() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = orchestrator_with(vec![memory.clone()]);

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Applied { rule, .. } = outcome else {
        panic!("expected Applied");
    };

    memory.record_hits(&rule.rule_id, 42);
    orchestrator.poll_hit_counters().await;
    assert_eq!(orchestrator.rule(&rule.rule_id).expect("record").hit_count, 42);

    // A lower poll never decreases the counter.
    orchestrator.poll_hit_counters().await;
    assert_eq!(orchestrator.rule(&rule.rule_id).expect("record").hit_count, 42);
}

#[tokio::test]
async fn validation_reject_is_reported() {
    let memory = Arc::new(MemoryAdapter::new("mem-a"));
    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig {
            validator: ValidatorConfig {
                protected_assets: vec!["203.0.113.7/32".parse().expect("cidr")],
                ..ValidatorConfig::default()
            },
            ..OrchestratorConfig::default()
        },
        vec![memory.clone()],
    );

    let outcome = orchestrator
        .handle_decision(&decision("d1", Action::Deny, "203.0.113.7", 80), 100)
        .await;
    let DecisionOutcome::Rejected { reason, .. } = outcome else {
        panic!("expected Rejected");
    };
    assert!(reason.contains("protected asset"));
    assert_eq!(memory.installed_count(), 0);
    assert_eq!(orchestrator.counters().validation_rejects, 1);
}
