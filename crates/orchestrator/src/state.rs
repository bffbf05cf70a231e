use std::collections::HashMap;

use adapters::{AdapterHandle, AdapterOutcome, RuleActionKind, RuleMatch, UniversalRule};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Rule lifecycle. Legal transitions:
/// `Pending → Applying → Active → Expired`;
/// `Applying → Failed → Applying` (retry) until attempts run out;
/// anything except `Expired` can be rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleLifecycle {
    Pending,
    Applying,
    Active,
    Failed,
    Expired,
    RolledBack,
}

impl RuleLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::RolledBack => "rolled_back",
        }
    }

    fn can_move_to(&self, to: RuleLifecycle) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Applying)
                | (Self::Applying, Self::Active)
                | (Self::Applying, Self::Failed)
                | (Self::Failed, Self::Applying)
                | (Self::Active, Self::Expired)
                | (Self::Pending, Self::RolledBack)
                | (Self::Applying, Self::RolledBack)
                | (Self::Active, Self::RolledBack)
                | (Self::Failed, Self::RolledBack)
        )
    }
}

/// One adapter outcome as observed at a point in time; the per-rule
/// history of these is the enforcement-side audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub adapter_id: String,
    pub outcome: AdapterOutcome,
    pub at_unix: i64,
}

/// Mutable per-rule tracking. The rule itself is immutable; everything
/// that changes lives here, and only the orchestrator writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule: UniversalRule,
    pub lifecycle: RuleLifecycle,
    pub adapter_outcomes: HashMap<String, AdapterOutcome>,
    /// Every adapter attempt in order, failures included.
    pub outcome_history: Vec<OutcomeEvent>,
    pub handles: HashMap<String, AdapterHandle>,
    /// Monotonically non-decreasing across adapter polls.
    pub hit_count: u64,
    pub attempts: u32,
    pub next_retry_unix: Option<i64>,
    pub expires_at_unix: Option<i64>,
    pub applied_at_unix: Option<i64>,
    pub expired_at_unix: Option<i64>,
    pub rolled_back_at_unix: Option<i64>,
}

impl RuleRecord {
    fn new(rule: UniversalRule) -> Self {
        Self {
            rule,
            lifecycle: RuleLifecycle::Pending,
            adapter_outcomes: HashMap::new(),
            outcome_history: Vec::new(),
            handles: HashMap::new(),
            hit_count: 0,
            attempts: 0,
            next_retry_unix: None,
            expires_at_unix: None,
            applied_at_unix: None,
            expired_at_unix: None,
            rolled_back_at_unix: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == RuleLifecycle::Active
    }

    /// Record polled hit counts; counters only move forward.
    pub fn observe_hits(&mut self, polled: u64) {
        if polled > self.hit_count {
            self.hit_count = polled;
        }
    }
}

/// Single-writer table of every rule the orchestrator has accepted.
/// Expired and rolled-back rules stay queryable for the audit horizon;
/// they just never match new conflict checks.
#[derive(Default)]
pub struct RuleTable {
    records: HashMap<String, RuleRecord>,
    by_decision: HashMap<String, String>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: UniversalRule) -> &mut RuleRecord {
        let rule_id = rule.rule_id.clone();
        if let Some(decision_id) = &rule.origin_decision_id {
            self.by_decision.insert(decision_id.clone(), rule_id.clone());
        }
        self.records.entry(rule_id).or_insert_with(|| RuleRecord::new(rule))
    }

    pub fn get(&self, rule_id: &str) -> Option<&RuleRecord> {
        self.records.get(rule_id)
    }

    pub fn get_mut(&mut self, rule_id: &str) -> Option<&mut RuleRecord> {
        self.records.get_mut(rule_id)
    }

    pub fn rule_for_decision(&self, decision_id: &str) -> Option<&RuleRecord> {
        self.by_decision
            .get(decision_id)
            .and_then(|rule_id| self.records.get(rule_id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Transition with legality checking. Illegal transitions are refused
    /// and logged rather than corrupting the table.
    pub fn transition(&mut self, rule_id: &str, to: RuleLifecycle, now_unix: i64) -> bool {
        let Some(record) = self.records.get_mut(rule_id) else {
            return false;
        };
        if !record.lifecycle.can_move_to(to) {
            warn!(
                rule_id = rule_id,
                from = record.lifecycle.as_str(),
                to = to.as_str(),
                "refusing illegal lifecycle transition"
            );
            return false;
        }
        record.lifecycle = to;
        match to {
            RuleLifecycle::Active => {
                record.applied_at_unix = Some(now_unix);
                record.next_retry_unix = None;
                record.expires_at_unix = record
                    .rule
                    .ttl_secs
                    .map(|ttl| now_unix.saturating_add(ttl as i64));
            }
            RuleLifecycle::Expired => record.expired_at_unix = Some(now_unix),
            RuleLifecycle::RolledBack => record.rolled_back_at_unix = Some(now_unix),
            _ => {}
        }
        true
    }

    pub fn active(&self) -> impl Iterator<Item = &RuleRecord> {
        self.records.values().filter(|r| r.is_active())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleRecord> {
        self.records.values()
    }

    /// Active rules whose match sets intersect the candidate, split into
    /// identical-match and merely-overlapping buckets.
    pub fn conflicts_with(&self, matcher: &RuleMatch) -> ConflictSet<'_> {
        let mut identical = Vec::new();
        let mut overlapping = Vec::new();
        for record in self.active() {
            if &record.rule.matcher == matcher {
                identical.push(record);
            } else if record.rule.matcher.intersects(matcher) {
                overlapping.push(record);
            }
        }
        ConflictSet {
            identical,
            overlapping,
        }
    }

    /// Any active rule sharing the identical match and action family.
    pub fn active_duplicate(&self, matcher: &RuleMatch, kind: RuleActionKind) -> Option<&RuleRecord> {
        self.active()
            .find(|record| &record.rule.matcher == matcher && record.rule.action.kind() == kind)
    }

    pub fn expired_due(&self, now_unix: i64) -> Vec<String> {
        self.active()
            .filter(|record| {
                record
                    .expires_at_unix
                    .map(|at| at <= now_unix)
                    .unwrap_or(false)
            })
            .map(|record| record.rule.rule_id.clone())
            .collect()
    }

    /// Rules due for re-dispatch: failed applies, plus active rules with
    /// adapters still outstanding after a partial success.
    pub fn retry_due(&self, now_unix: i64) -> Vec<String> {
        self.records
            .values()
            .filter(|record| {
                matches!(
                    record.lifecycle,
                    RuleLifecycle::Failed | RuleLifecycle::Active
                ) && record
                    .next_retry_unix
                    .map(|at| at <= now_unix)
                    .unwrap_or(false)
            })
            .map(|record| record.rule.rule_id.clone())
            .collect()
    }

    /// Drop terminal records older than the retention horizon.
    pub fn purge_terminal_before(&mut self, cutoff_unix: i64) -> usize {
        let doomed: Vec<String> = self
            .records
            .values()
            .filter(|record| {
                let terminal_at = match record.lifecycle {
                    RuleLifecycle::Expired => record.expired_at_unix,
                    RuleLifecycle::RolledBack => record.rolled_back_at_unix,
                    _ => None,
                };
                terminal_at.map(|at| at < cutoff_unix).unwrap_or(false)
            })
            .map(|record| record.rule.rule_id.clone())
            .collect();

        for rule_id in &doomed {
            if let Some(record) = self.records.remove(rule_id) {
                if let Some(decision_id) = &record.rule.origin_decision_id {
                    self.by_decision.remove(decision_id);
                }
            }
        }
        doomed.len()
    }
}

pub struct ConflictSet<'a> {
    pub identical: Vec<&'a RuleRecord>,
    pub overlapping: Vec<&'a RuleRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::RuleAction;

    fn rule(id: &str, src: &str, action: RuleAction, priority: u16) -> UniversalRule {
        UniversalRule {
            rule_id: id.to_string(),
            matcher: RuleMatch::from_src(src.parse().expect("cidr")),
            action,
            priority,
            ttl_secs: Some(60),
            origin_decision_id: Some(format!("dec_{}", id)),
            created_at_unix: 0,
        }
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut table = RuleTable::new();
        table.insert(rule("r1", "203.0.113.7/32", RuleAction::Deny, 10));

        assert!(table.transition("r1", RuleLifecycle::Applying, 1));
        assert!(table.transition("r1", RuleLifecycle::Active, 2));
        let record = table.get("r1").expect("record");
        assert_eq!(record.expires_at_unix, Some(62));

        assert!(table.transition("r1", RuleLifecycle::Expired, 70));
        assert_eq!(table.get("r1").expect("record").expired_at_unix, Some(70));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut table = RuleTable::new();
        table.insert(rule("r1", "203.0.113.7/32", RuleAction::Deny, 10));

        assert!(!table.transition("r1", RuleLifecycle::Active, 1));
        table.transition("r1", RuleLifecycle::Applying, 1);
        table.transition("r1", RuleLifecycle::Active, 2);
        table.transition("r1", RuleLifecycle::Expired, 70);
        // Expired is terminal even for rollback.
        assert!(!table.transition("r1", RuleLifecycle::RolledBack, 71));
    }

    #[test]
    fn hit_counters_are_monotonic() {
        let mut table = RuleTable::new();
        table.insert(rule("r1", "203.0.113.7/32", RuleAction::Deny, 10));
        let record = table.get_mut("r1").expect("record");
        record.observe_hits(10);
        record.observe_hits(7);
        record.observe_hits(12);
        assert_eq!(record.hit_count, 12);
    }

    #[test]
    fn conflict_buckets_split_identical_and_overlapping() {
        let mut table = RuleTable::new();
        table.insert(rule("exact", "203.0.113.7/32", RuleAction::Allow, 50));
        table.insert(rule("wide", "203.0.113.0/24", RuleAction::Deny, 10));
        table.insert(rule("other", "198.51.100.1/32", RuleAction::Deny, 10));
        for id in ["exact", "wide", "other"] {
            table.transition(id, RuleLifecycle::Applying, 1);
            table.transition(id, RuleLifecycle::Active, 2);
        }

        let candidate = RuleMatch::from_src("203.0.113.7/32".parse().expect("cidr"));
        let conflicts = table.conflicts_with(&candidate);
        assert_eq!(conflicts.identical.len(), 1);
        assert_eq!(conflicts.identical[0].rule.rule_id, "exact");
        assert_eq!(conflicts.overlapping.len(), 1);
        assert_eq!(conflicts.overlapping[0].rule.rule_id, "wide");
    }

    #[test]
    fn expiry_and_retry_scans() {
        let mut table = RuleTable::new();
        table.insert(rule("r1", "203.0.113.7/32", RuleAction::Deny, 10));
        table.transition("r1", RuleLifecycle::Applying, 1);
        table.transition("r1", RuleLifecycle::Active, 2);
        assert!(table.expired_due(50).is_empty());
        assert_eq!(table.expired_due(62), vec!["r1".to_string()]);

        table.insert(rule("r2", "198.51.100.1/32", RuleAction::Deny, 10));
        table.transition("r2", RuleLifecycle::Applying, 3);
        table.transition("r2", RuleLifecycle::Failed, 4);
        table.get_mut("r2").expect("record").next_retry_unix = Some(30);
        assert!(table.retry_due(20).is_empty());
        assert_eq!(table.retry_due(30), vec!["r2".to_string()]);
    }

    #[test]
    fn purge_drops_only_old_terminal_records() {
        let mut table = RuleTable::new();
        table.insert(rule("done", "203.0.113.7/32", RuleAction::Deny, 10));
        table.transition("done", RuleLifecycle::Applying, 1);
        table.transition("done", RuleLifecycle::Active, 2);
        table.transition("done", RuleLifecycle::Expired, 70);

        table.insert(rule("live", "198.51.100.1/32", RuleAction::Deny, 10));
        table.transition("live", RuleLifecycle::Applying, 1);
        table.transition("live", RuleLifecycle::Active, 2);

        assert_eq!(table.purge_terminal_before(100), 1);
        assert!(table.get("done").is_none());
        assert!(table.get("live").is_some());
        // Decision index is cleaned alongside.
        assert!(table.rule_for_decision("dec_done").is_none());
    }
}
