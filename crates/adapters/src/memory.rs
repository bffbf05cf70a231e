use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::rule::{AdapterHandle, AdapterRuleState, UniversalRule};
use crate::FirewallAdapter;

#[derive(Debug, Clone)]
struct StoredRule {
    rule: UniversalRule,
    hit_count: u64,
}

#[derive(Default)]
struct MemoryInner {
    rules: HashMap<String, StoredRule>,
    /// Scripted failures, consumed one per apply in order.
    apply_script: VecDeque<AdapterError>,
    /// Operation log for ordering assertions in tests.
    op_log: Vec<String>,
}

/// In-memory adapter for tests and acceptance scenarios. Behaves like a
/// well-behaved backend (idempotent, removable, queryable) and can be
/// scripted to fail.
pub struct MemoryAdapter {
    adapter_id: String,
    inner: Mutex<MemoryInner>,
}

impl MemoryAdapter {
    pub fn new(adapter_id: &str) -> Self {
        Self {
            adapter_id: adapter_id.to_string(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    /// Queue a failure for the next apply call. Queue several to script a
    /// transient-then-success sequence.
    pub fn fail_next_apply(&self, error: AdapterError) {
        self.inner
            .lock()
            .expect("memory adapter lock")
            .apply_script
            .push_back(error);
    }

    /// Simulate traffic hitting an installed rule.
    pub fn record_hits(&self, rule_id: &str, hits: u64) {
        let mut inner = self.inner.lock().expect("memory adapter lock");
        if let Some(stored) = inner.rules.get_mut(rule_id) {
            stored.hit_count = stored.hit_count.saturating_add(hits);
        }
    }

    pub fn installed_rule(&self, rule_id: &str) -> Option<UniversalRule> {
        self.inner
            .lock()
            .expect("memory adapter lock")
            .rules
            .get(rule_id)
            .map(|stored| stored.rule.clone())
    }

    pub fn installed_count(&self) -> usize {
        self.inner.lock().expect("memory adapter lock").rules.len()
    }

    pub fn op_log(&self) -> Vec<String> {
        self.inner.lock().expect("memory adapter lock").op_log.clone()
    }
}

#[async_trait]
impl FirewallAdapter for MemoryAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    async fn apply(&self, rule: &UniversalRule) -> Result<AdapterHandle, AdapterError> {
        let mut inner = self.inner.lock().expect("memory adapter lock");
        if let Some(error) = inner.apply_script.pop_front() {
            inner.op_log.push(format!("apply_failed:{}", rule.rule_id));
            return Err(error);
        }

        inner.op_log.push(format!("apply:{}", rule.rule_id));
        inner
            .rules
            .entry(rule.rule_id.clone())
            .or_insert_with(|| StoredRule {
                rule: rule.clone(),
                hit_count: 0,
            });

        Ok(AdapterHandle {
            adapter_id: self.adapter_id.clone(),
            rule_id: rule.rule_id.clone(),
            native_ids: vec![format!("mem-{}", rule.rule_id)],
        })
    }

    async fn remove(&self, handle: &AdapterHandle) -> Result<(), AdapterError> {
        let mut inner = self.inner.lock().expect("memory adapter lock");
        inner.op_log.push(format!("remove:{}", handle.rule_id));
        inner.rules.remove(&handle.rule_id);
        Ok(())
    }

    async fn query(&self, handle: &AdapterHandle) -> Result<AdapterRuleState, AdapterError> {
        let inner = self.inner.lock().expect("memory adapter lock");
        match inner.rules.get(&handle.rule_id) {
            Some(stored) => Ok(AdapterRuleState {
                present: true,
                hit_count: stored.hit_count,
            }),
            None => Ok(AdapterRuleState {
                present: false,
                hit_count: 0,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<AdapterHandle>, AdapterError> {
        let inner = self.inner.lock().expect("memory adapter lock");
        Ok(inner
            .rules
            .keys()
            .map(|rule_id| AdapterHandle {
                adapter_id: self.adapter_id.clone(),
                rule_id: rule_id.clone(),
                native_ids: vec![format!("mem-{}", rule_id)],
            })
            .collect())
    }
}
