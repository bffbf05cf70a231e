//! Policy agent: maps a detection plus context onto one action from the
//! fixed enforcement action set. The mapping is a learned head loaded from
//! an artifact; with no artifact (or an unknown detection) a static rule
//! table takes over.

mod action;
mod agent;
mod artifact;
mod error;
mod state;

pub use action::{Action, ActionFamily, QuarantineSpan, RateTier, ACTION_SET};
pub use agent::{AgentCounters, Decision, FallbackThresholds, PolicyAgent};
pub use artifact::{action_mask, PolicyArtifact};
pub use error::AgentError;
pub use state::{
    build_state, is_internal, DecisionContext, StateVector, STATE_SLOT_COUNT, STATE_SLOT_DOCS,
};
