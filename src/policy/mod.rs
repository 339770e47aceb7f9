//! Incremental Datalog policy engine.
//!
//! A policy is a namespace of tables and rules. Base tables are fed by
//! events and data-source snapshots; derived tables are kept equal to the
//! least fixpoint of the rules over the base tables at every steady state.
//!
//! - [`store`]: per-policy state and bookkeeping types
//! - [`incremental`]: the [`Runtime`] that owns all policies and maintains
//!   derived tables incrementally
//! - [`service`]: [`PolicyEngine`], the runtime hosted as a bus service
//!
//! Rules are positive: no negation, no builtins.

pub mod error;
mod eval;
pub mod incremental;
pub mod service;
pub mod store;

pub use error::{PolicyError, PolicyResult, RuleViolation};
pub use incremental::{DEFAULT_POLICY, Runtime};
pub use service::{PolicyChange, PolicyEngine};
pub use store::{Policy, PolicyState, Rejection, Relation, TableId, UpdateReport};
