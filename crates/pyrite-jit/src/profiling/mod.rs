//! Tier-up profiling
//!
//! Counters the generated code bumps on calls and loop back-edges, and the
//! policy that turns their values into reoptimization and OSR decisions.

pub mod counters;
pub mod policy;

pub use counters::{CallCounter, VersionProfile};
pub use policy::{EffortLevel, TierPolicy};
