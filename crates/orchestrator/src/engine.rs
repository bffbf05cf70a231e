use std::sync::Arc;
use std::time::Duration;

use adapters::{AdapterError, AdapterHandle, AdapterOutcome, FirewallAdapter, UniversalRule};
use policy_agent::Decision;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::retry::{backoff_delay_ms, RetryConfig};
use crate::state::{RuleLifecycle, RuleRecord, RuleTable};
use crate::synth::{synthesize, SynthesisConfig};
use crate::validate::{RuleValidator, ValidatorConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub synthesis: SynthesisConfig,
    pub validator: ValidatorConfig,
    pub retry: RetryConfig,
    pub adapter_call_timeout_ms: u64,
    pub health_probe_interval_secs: u64,
    /// How long expired/rolled-back rules stay queryable.
    pub terminal_retention_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            synthesis: SynthesisConfig::default(),
            validator: ValidatorConfig::default(),
            retry: RetryConfig::default(),
            adapter_call_timeout_ms: 10_000,
            health_probe_interval_secs: 30,
            terminal_retention_secs: 7 * 86_400,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorCounters {
    pub decisions: u64,
    pub duplicate_decisions: u64,
    pub rules_synthesized: u64,
    pub rules_deduped: u64,
    pub validation_rejects: u64,
    pub conflicts_won: u64,
    pub conflicts_lost: u64,
    pub overlaps_coexisting: u64,
    pub applies: u64,
    pub apply_failures: u64,
    pub retries_scheduled: u64,
    pub permanent_failures: u64,
    pub expired: u64,
    pub rolled_back: u64,
    pub adapter_timeouts: u64,
    pub adapters_paused: u64,
    pub adapters_resumed: u64,
}

/// One adapter's result for one operation on one rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterAttempt {
    pub adapter_id: String,
    pub outcome: AdapterOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub rule_id: String,
    pub attempts: Vec<AdapterAttempt>,
    pub lifecycle: RuleLifecycle,
    pub attempt_number: u32,
    pub will_retry: bool,
}

/// What became of one consumed decision; the wiring forwards these to
/// audit and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DecisionOutcome {
    /// Passive action: nothing to enforce.
    NoRule { decision_id: String },
    Applied {
        rule: UniversalRule,
        report: ApplyReport,
        /// Rules rolled back because this one won an identical-match
        /// conflict.
        displaced: Vec<String>,
    },
    Deduped {
        decision_id: String,
        existing_rule_id: String,
    },
    Rejected {
        decision_id: String,
        rule: UniversalRule,
        reason: String,
    },
    LostConflict {
        decision_id: String,
        winner_rule_id: String,
    },
    /// At-least-once replay of a decision already materialized.
    DuplicateDecision { decision_id: String, rule_id: String },
}

struct AdapterSlot {
    adapter: Arc<dyn FirewallAdapter>,
    paused: bool,
    last_probe_unix: i64,
}

/// Converts decisions into universal rules and drives the adapters.
/// Owns the rule table outright: one task runs the orchestrator, so every
/// `RuleRecord` mutation is serialized by construction.
pub struct Orchestrator {
    config: OrchestratorConfig,
    validator: RuleValidator,
    table: RuleTable,
    adapters: Vec<AdapterSlot>,
    counters: OrchestratorCounters,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, adapters: Vec<Arc<dyn FirewallAdapter>>) -> Self {
        let validator = RuleValidator::new(config.validator.clone());
        Self {
            config,
            validator,
            table: RuleTable::new(),
            adapters: adapters
                .into_iter()
                .map(|adapter| AdapterSlot {
                    adapter,
                    paused: false,
                    last_probe_unix: 0,
                })
                .collect(),
            counters: OrchestratorCounters::default(),
        }
    }

    pub fn counters(&self) -> &OrchestratorCounters {
        &self.counters
    }

    pub fn rule(&self, rule_id: &str) -> Option<&RuleRecord> {
        self.table.get(rule_id)
    }

    pub fn rule_for_decision(&self, decision_id: &str) -> Option<&RuleRecord> {
        self.table.rule_for_decision(decision_id)
    }

    pub fn list_rules(&self, lifecycle: Option<RuleLifecycle>) -> Vec<RuleRecord> {
        self.table
            .iter()
            .filter(|record| lifecycle.map(|l| record.lifecycle == l).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Consume one decision end to end: synthesize, validate, resolve
    /// conflicts, dispatch.
    pub async fn handle_decision(&mut self, decision: &Decision, now_unix: i64) -> DecisionOutcome {
        self.counters.decisions = self.counters.decisions.saturating_add(1);

        // At-least-once upstream: a replayed decision must not produce a
        // second active rule.
        if let Some(existing) = self.table.rule_for_decision(&decision.decision_id) {
            if !matches!(
                existing.lifecycle,
                RuleLifecycle::Expired | RuleLifecycle::RolledBack
            ) {
                self.counters.duplicate_decisions =
                    self.counters.duplicate_decisions.saturating_add(1);
                return DecisionOutcome::DuplicateDecision {
                    decision_id: decision.decision_id.clone(),
                    rule_id: existing.rule.rule_id.clone(),
                };
            }
        }

        let Some(rule) = synthesize(decision, &self.config.synthesis, now_unix) else {
            return DecisionOutcome::NoRule {
                decision_id: decision.decision_id.clone(),
            };
        };
        self.counters.rules_synthesized = self.counters.rules_synthesized.saturating_add(1);

        if let Err(error) = self.validator.validate(&rule) {
            self.counters.validation_rejects = self.counters.validation_rejects.saturating_add(1);
            warn!(rule_id = %rule.rule_id, error = %error, "rule rejected by validation");
            return DecisionOutcome::Rejected {
                decision_id: decision.decision_id.clone(),
                rule,
                reason: error.to_string(),
            };
        }

        self.apply_rule(rule, decision.decision_id.clone(), now_unix).await
    }

    /// Conflict-check and apply a validated rule. Also the entry point for
    /// operator-submitted rules (pinned allows, manual monitors).
    pub async fn apply_rule(
        &mut self,
        rule: UniversalRule,
        decision_id: String,
        now_unix: i64,
    ) -> DecisionOutcome {
        // Identical match + identical action family: refresh the standing
        // rule instead of stacking a twin.
        if let Some(existing) = self
            .table
            .active_duplicate(&rule.matcher, rule.action.kind())
        {
            let existing_rule_id = existing.rule.rule_id.clone();
            let bumped = now_unix.saturating_add(rule.ttl_secs.unwrap_or(0) as i64);
            if let Some(record) = self.table.get_mut(&existing_rule_id) {
                record.expires_at_unix = Some(
                    record
                        .expires_at_unix
                        .map(|at| at.max(bumped))
                        .unwrap_or(bumped),
                );
            }
            self.counters.rules_deduped = self.counters.rules_deduped.saturating_add(1);
            debug!(rule_id = %existing_rule_id, "identical rule already active; ttl bumped");
            return DecisionOutcome::Deduped {
                decision_id,
                existing_rule_id,
            };
        }

        // Identical match, conflicting action: strictly one survivor, and
        // the lower priority number wins. Ties keep the incumbent.
        let mut displaced: Vec<String> = Vec::new();
        {
            let conflicts = self.table.conflicts_with(&rule.matcher);
            self.counters.overlaps_coexisting = self
                .counters
                .overlaps_coexisting
                .saturating_add(conflicts.overlapping.len() as u64);

            for incumbent in conflicts.identical {
                if incumbent.rule.action.kind() == rule.action.kind() {
                    continue;
                }
                if incumbent.rule.priority <= rule.priority {
                    self.counters.conflicts_lost = self.counters.conflicts_lost.saturating_add(1);
                    return DecisionOutcome::LostConflict {
                        decision_id,
                        winner_rule_id: incumbent.rule.rule_id.clone(),
                    };
                }
                displaced.push(incumbent.rule.rule_id.clone());
            }
        }

        // The loser's native rules come out before the winner's go in.
        for loser in &displaced {
            self.counters.conflicts_won = self.counters.conflicts_won.saturating_add(1);
            self.rollback(loser, now_unix).await;
        }

        let rule_id = rule.rule_id.clone();
        self.table.insert(rule.clone());
        let report = self.dispatch_apply(&rule_id, now_unix).await;

        DecisionOutcome::Applied {
            rule,
            report,
            displaced,
        }
    }

    /// Push one pending/failed rule to every live adapter in parallel.
    async fn dispatch_apply(&mut self, rule_id: &str, now_unix: i64) -> ApplyReport {
        let Some(record) = self.table.get_mut(rule_id) else {
            return ApplyReport {
                rule_id: rule_id.to_string(),
                attempts: Vec::new(),
                lifecycle: RuleLifecycle::Failed,
                attempt_number: 0,
                will_retry: false,
            };
        };
        let rule = record.rule.clone();
        record.attempts = record.attempts.saturating_add(1);
        let attempt_number = record.attempts;
        let was_active = record.lifecycle == RuleLifecycle::Active;
        if !was_active {
            self.table.transition(rule_id, RuleLifecycle::Applying, now_unix);
        }
        self.counters.applies = self.counters.applies.saturating_add(1);

        let call_timeout = Duration::from_millis(self.config.adapter_call_timeout_ms);
        let mut join_set: JoinSet<(String, Result<Result<AdapterHandle, AdapterError>, ()>)> =
            JoinSet::new();
        for slot in self.adapters.iter().filter(|slot| !slot.paused) {
            let adapter = Arc::clone(&slot.adapter);
            let rule = rule.clone();
            join_set.spawn(async move {
                let adapter_id = adapter.adapter_id().to_string();
                match timeout(call_timeout, adapter.apply(&rule)).await {
                    Ok(result) => (adapter_id, Ok(result)),
                    Err(_) => (adapter_id, Err(())),
                }
            });
        }

        let mut attempts = Vec::new();
        let mut any_ok = false;
        while let Some(joined) = join_set.join_next().await {
            let Ok((adapter_id, result)) = joined else {
                continue;
            };
            let attempt = match result {
                Ok(Ok(handle)) => {
                    any_ok = true;
                    if let Some(record) = self.table.get_mut(rule_id) {
                        record.handles.insert(adapter_id.clone(), handle);
                        record
                            .adapter_outcomes
                            .insert(adapter_id.clone(), AdapterOutcome::Ok);
                    }
                    AdapterAttempt {
                        adapter_id,
                        outcome: AdapterOutcome::Ok,
                        detail: None,
                    }
                }
                Ok(Err(error)) => {
                    let outcome = error.outcome();
                    if matches!(error, AdapterError::Unreachable(_)) {
                        self.pause_adapter(&adapter_id, now_unix);
                    }
                    if let Some(record) = self.table.get_mut(rule_id) {
                        record.adapter_outcomes.insert(adapter_id.clone(), outcome);
                    }
                    AdapterAttempt {
                        adapter_id,
                        outcome,
                        detail: Some(error.to_string()),
                    }
                }
                // Timed out: result discarded, counted as transient.
                Err(()) => {
                    self.counters.adapter_timeouts =
                        self.counters.adapter_timeouts.saturating_add(1);
                    if let Some(record) = self.table.get_mut(rule_id) {
                        record
                            .adapter_outcomes
                            .insert(adapter_id.clone(), AdapterOutcome::Transient);
                    }
                    AdapterAttempt {
                        adapter_id,
                        outcome: AdapterOutcome::Transient,
                        detail: Some("call timed out".to_string()),
                    }
                }
            };
            attempts.push(attempt);
        }

        if let Some(record) = self.table.get_mut(rule_id) {
            for attempt in &attempts {
                record.outcome_history.push(crate::state::OutcomeEvent {
                    adapter_id: attempt.adapter_id.clone(),
                    outcome: attempt.outcome,
                    at_unix: now_unix,
                });
            }
        }

        let (lifecycle, will_retry) = if any_ok {
            if !was_active {
                self.table.transition(rule_id, RuleLifecycle::Active, now_unix);
            }
            // Partial success: the rule enforces where it landed, and the
            // straggler adapters are retried on the same backoff schedule.
            let all_ok = attempts
                .iter()
                .all(|attempt| attempt.outcome == AdapterOutcome::Ok);
            let will_retry = !all_ok && attempt_number < self.config.retry.max_attempts;
            if let Some(record) = self.table.get_mut(rule_id) {
                record.next_retry_unix = if will_retry {
                    let delay_ms = backoff_delay_ms(attempt_number, &self.config.retry);
                    self.counters.retries_scheduled =
                        self.counters.retries_scheduled.saturating_add(1);
                    Some(now_unix.saturating_add((delay_ms / 1_000).max(1) as i64))
                } else {
                    None
                };
            }
            (RuleLifecycle::Active, will_retry)
        } else {
            self.counters.apply_failures = self.counters.apply_failures.saturating_add(1);
            self.table.transition(rule_id, RuleLifecycle::Failed, now_unix);
            let will_retry = attempt_number < self.config.retry.max_attempts;
            if will_retry {
                let delay_ms = backoff_delay_ms(attempt_number, &self.config.retry);
                if let Some(record) = self.table.get_mut(rule_id) {
                    record.next_retry_unix =
                        Some(now_unix.saturating_add((delay_ms / 1_000).max(1) as i64));
                }
                self.counters.retries_scheduled =
                    self.counters.retries_scheduled.saturating_add(1);
            } else {
                if let Some(record) = self.table.get_mut(rule_id) {
                    record.next_retry_unix = None;
                }
                self.counters.permanent_failures =
                    self.counters.permanent_failures.saturating_add(1);
                warn!(rule_id = rule_id, attempts = attempt_number, "rule apply permanently failed");
            }
            (RuleLifecycle::Failed, will_retry)
        };

        ApplyReport {
            rule_id: rule_id.to_string(),
            attempts,
            lifecycle,
            attempt_number,
            will_retry,
        }
    }

    /// Re-dispatch every failed rule whose backoff has elapsed.
    pub async fn retry_due(&mut self, now_unix: i64) -> Vec<ApplyReport> {
        let due = self.table.retry_due(now_unix);
        let mut reports = Vec::with_capacity(due.len());
        for rule_id in due {
            reports.push(self.dispatch_apply(&rule_id, now_unix).await);
        }
        reports
    }

    /// Expire active rules whose ttl has elapsed and remove them from the
    /// adapters. Expired rules stay in the table for audit queries.
    pub async fn expire_due(&mut self, now_unix: i64) -> Vec<ApplyReport> {
        let due = self.table.expired_due(now_unix);
        let mut reports = Vec::with_capacity(due.len());
        for rule_id in due {
            self.counters.expired = self.counters.expired.saturating_add(1);
            self.table.transition(&rule_id, RuleLifecycle::Expired, now_unix);
            let attempts = self.dispatch_remove(&rule_id).await;
            info!(rule_id = %rule_id, "rule expired and removed");
            reports.push(ApplyReport {
                rule_id,
                attempts,
                lifecycle: RuleLifecycle::Expired,
                attempt_number: 0,
                will_retry: false,
            });
        }
        reports
    }

    /// Operator rollback by rule id. Always honored except for rules that
    /// already expired.
    pub async fn rollback(&mut self, rule_id: &str, now_unix: i64) -> Option<ApplyReport> {
        let record = self.table.get(rule_id)?;
        if matches!(
            record.lifecycle,
            RuleLifecycle::Expired | RuleLifecycle::RolledBack
        ) {
            return None;
        }

        let attempts = self.dispatch_remove(rule_id).await;
        self.table
            .transition(rule_id, RuleLifecycle::RolledBack, now_unix);
        self.counters.rolled_back = self.counters.rolled_back.saturating_add(1);
        info!(rule_id = rule_id, "rule rolled back");
        Some(ApplyReport {
            rule_id: rule_id.to_string(),
            attempts,
            lifecycle: RuleLifecycle::RolledBack,
            attempt_number: 0,
            will_retry: false,
        })
    }

    pub async fn rollback_by_decision(
        &mut self,
        decision_id: &str,
        now_unix: i64,
    ) -> Option<ApplyReport> {
        let rule_id = self
            .table
            .rule_for_decision(decision_id)?
            .rule
            .rule_id
            .clone();
        self.rollback(&rule_id, now_unix).await
    }

    async fn dispatch_remove(&mut self, rule_id: &str) -> Vec<AdapterAttempt> {
        let Some(record) = self.table.get(rule_id) else {
            return Vec::new();
        };
        let handles: Vec<AdapterHandle> = record.handles.values().cloned().collect();
        let call_timeout = Duration::from_millis(self.config.adapter_call_timeout_ms);

        let mut join_set: JoinSet<(String, Result<Result<(), AdapterError>, ()>)> = JoinSet::new();
        for handle in handles {
            let Some(slot) = self
                .adapters
                .iter()
                .find(|slot| slot.adapter.adapter_id() == handle.adapter_id)
            else {
                continue;
            };
            let adapter = Arc::clone(&slot.adapter);
            join_set.spawn(async move {
                let adapter_id = adapter.adapter_id().to_string();
                match timeout(call_timeout, adapter.remove(&handle)).await {
                    Ok(result) => (adapter_id, Ok(result)),
                    Err(_) => (adapter_id, Err(())),
                }
            });
        }

        let mut attempts = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((adapter_id, result)) = joined else {
                continue;
            };
            let attempt = match result {
                Ok(Ok(())) => AdapterAttempt {
                    adapter_id,
                    outcome: AdapterOutcome::Ok,
                    detail: None,
                },
                Ok(Err(error)) => AdapterAttempt {
                    adapter_id,
                    outcome: error.outcome(),
                    detail: Some(error.to_string()),
                },
                Err(()) => AdapterAttempt {
                    adapter_id,
                    outcome: AdapterOutcome::Transient,
                    detail: Some("call timed out".to_string()),
                },
            };
            if attempt.outcome != AdapterOutcome::Ok {
                warn!(rule_id = rule_id, adapter = %attempt.adapter_id, "remove failed");
            }
            attempts.push(attempt);
        }
        attempts
    }

    /// Pull hit counters from adapters into the table, monotonically.
    pub async fn poll_hit_counters(&mut self) {
        let active: Vec<(String, Vec<AdapterHandle>)> = self
            .table
            .active()
            .map(|record| {
                (
                    record.rule.rule_id.clone(),
                    record.handles.values().cloned().collect(),
                )
            })
            .collect();

        for (rule_id, handles) in active {
            let mut total = 0u64;
            for handle in handles {
                let Some(slot) = self
                    .adapters
                    .iter()
                    .find(|slot| slot.adapter.adapter_id() == handle.adapter_id && !slot.paused)
                else {
                    continue;
                };
                if let Ok(state) = slot.adapter.query(&handle).await {
                    total = total.saturating_add(state.hit_count);
                }
            }
            if let Some(record) = self.table.get_mut(&rule_id) {
                record.observe_hits(total);
            }
        }
    }

    /// Health-probe paused adapters; a successful list resumes them.
    pub async fn probe_paused_adapters(&mut self, now_unix: i64) {
        let interval = self.config.health_probe_interval_secs as i64;
        for index in 0..self.adapters.len() {
            let (paused, last_probe, adapter) = {
                let slot = &self.adapters[index];
                (slot.paused, slot.last_probe_unix, Arc::clone(&slot.adapter))
            };
            if !paused || now_unix.saturating_sub(last_probe) < interval {
                continue;
            }
            self.adapters[index].last_probe_unix = now_unix;
            match adapter.list().await {
                Ok(_) => {
                    self.adapters[index].paused = false;
                    self.counters.adapters_resumed =
                        self.counters.adapters_resumed.saturating_add(1);
                    info!(adapter = adapter.adapter_id(), "adapter recovered; resuming");
                }
                Err(error) => {
                    debug!(adapter = adapter.adapter_id(), error = %error, "adapter still unreachable");
                }
            }
        }
    }

    /// Drop terminal rules past the retention horizon.
    pub fn purge_terminal(&mut self, now_unix: i64) -> usize {
        let cutoff = now_unix.saturating_sub(self.config.terminal_retention_secs as i64);
        self.table.purge_terminal_before(cutoff)
    }

    fn pause_adapter(&mut self, adapter_id: &str, now_unix: i64) {
        for slot in &mut self.adapters {
            if slot.adapter.adapter_id() == adapter_id && !slot.paused {
                slot.paused = true;
                slot.last_probe_unix = now_unix;
                self.counters.adapters_paused = self.counters.adapters_paused.saturating_add(1);
                warn!(adapter = adapter_id, "adapter unreachable; pausing");
            }
        }
    }
}
