//! Vendor adapters: realize a `UniversalRule` on a concrete enforcement
//! target. Adapters hold connection resources only (rule state lives in
//! the target itself) and every operation is idempotent on `rule_id` so
//! orchestrator retries are safe.

mod cloud_group;
mod error;
mod memory;
mod packet_filter;
mod rule;

use async_trait::async_trait;

pub use cloud_group::{CloudGroupAdapter, CloudGroupConfig};
pub use error::AdapterError;
pub use memory::MemoryAdapter;
pub use packet_filter::{CommandRunner, PacketFilterAdapter, ProcessRunner, RecordingRunner};
pub use rule::{
    AdapterHandle, AdapterOutcome, AdapterRuleState, BadCidr, Cidr, PortRange, RuleAction,
    RuleActionKind, RuleMatch, UniversalRule,
};

/// The adapter capability set. Every backend implements exactly these four
/// operations plus the stable failure taxonomy in `AdapterError`; new
/// adapters are additive and never touch the core.
#[async_trait]
pub trait FirewallAdapter: Send + Sync {
    fn adapter_id(&self) -> &str;

    /// Realize the rule. Applying the same `rule_id` twice returns the
    /// original handle instead of duplicating native rules.
    async fn apply(&self, rule: &UniversalRule) -> Result<AdapterHandle, AdapterError>;

    /// Tear down everything behind a handle. Removing an already-removed
    /// handle succeeds.
    async fn remove(&self, handle: &AdapterHandle) -> Result<(), AdapterError>;

    async fn query(&self, handle: &AdapterHandle) -> Result<AdapterRuleState, AdapterError>;

    async fn list(&self) -> Result<Vec<AdapterHandle>, AdapterError>;
}
