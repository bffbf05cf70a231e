//! Sliding-window feature engine: normalized flow records in, fixed-layout
//! feature vectors out on the features topic.

mod aggregates;
mod engine;
pub mod layout;
mod vector;
mod window;

pub use aggregates::{CategoricalCounter, Moments, WindowAggregates};
pub use engine::{FeatureConfig, FeatureCounters, FeatureEngine};
pub use layout::FEATURE_SLOT_COUNT;
pub use vector::{FeatureContext, FeatureFrame, FeatureVector};
pub use window::{KeyProjection, WindowKey, WindowKind, WindowSpec};
