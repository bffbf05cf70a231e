//! Policy orchestrator: turns decisions into universal firewall rules,
//! validates them, resolves conflicts against the active set, drives the
//! vendor adapters with bounded retries, and owns the rule lifecycle
//! (pending → applying → active → expired, with failure and rollback
//! branches).

mod engine;
mod error;
mod retry;
mod state;
mod synth;
mod validate;

#[cfg(test)]
mod tests;

pub use engine::{
    AdapterAttempt, ApplyReport, DecisionOutcome, Orchestrator, OrchestratorConfig,
    OrchestratorCounters,
};
pub use error::ValidationError;
pub use retry::{backoff_delay_ms, RetryConfig};
pub use state::{OutcomeEvent, RuleLifecycle, RuleRecord, RuleTable};
pub use synth::{synthesize, PriorityConfig, SynthesisConfig, TtlConfig};
pub use validate::{RuleValidator, ScopeLimit, ValidatorConfig};
