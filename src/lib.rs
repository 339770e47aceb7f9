// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # policy-cage
//!
//! An in-process service bus with an incremental Datalog policy engine.
//!
//! ## Architecture
//!
//! - **Bus** (`bus`): named services exchanging messages over
//!   `(publisher, table)` channels, one task per service
//! - **Policy engine** (`policy`): positive Datalog over named policies,
//!   with derived tables kept current incrementally as data changes
//! - **Data sources** (`datasource`): drivers that poll external systems and
//!   publish full table snapshots, plus translator trees for nested JSON
//! - **Reader** (`compile`): text syntax for atoms, rules and queries
//! - **Configuration** (`config`): TOML deployments for the `cage` binary
//!
//! ## Library usage
//!
//! ```no_run
//! use policy_cage::bus::{Bus, ServiceArgs};
//! use policy_cage::compile::{parse_atom, parse_rule};
//! use policy_cage::formula::Event;
//! use policy_cage::policy::{DEFAULT_POLICY, PolicyEngine};
//!
//! # async fn demo() -> policy_cage::error::CageResult<()> {
//! let bus = Bus::new();
//! let engine = bus
//!     .register("policy", PolicyEngine::factory(), &ServiceArgs::new())?
//!     .downcast::<PolicyEngine>()
//!     .expect("registered as a policy engine");
//! engine.apply_event(&Event::insert(parse_rule("p(x) :- q(x)")?))?;
//! engine.apply_event(&Event::insert(parse_atom("q(1)")?))?;
//! let rows = engine.select_text(DEFAULT_POLICY, "p(x)")?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod compile;
pub mod config;
pub mod convergence;
pub mod datasource;
pub mod error;
pub mod formula;
pub mod message;
pub mod policy;
pub mod schema;
pub mod value;
