//! Policy engine error types.

use miette::Diagnostic;
use thiserror::Error;

use crate::compile::CompileError;
use crate::error::SchemaError;

/// Why a rule was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    #[error("rule has an empty body")]
    EmptyBody,

    #[error("head variables {variables:?} do not appear in the body")]
    UnsafeHead { variables: Vec<String> },

    #[error("head names a table of policy \"{policy}\"; rules may only define their own tables")]
    ForeignHead { policy: String },

    #[error("reference to unknown policy \"{policy}\"")]
    UnknownPolicy { policy: String },

    #[error("table \"{policy}:{table}\" is not declared")]
    UndeclaredTable { policy: String, table: String },

    #[error("table \"{policy}:{table}\" has arity {declared}, used with {used} arguments")]
    ArityMismatch {
        policy: String,
        table: String,
        declared: usize,
        used: usize,
    },

    #[error("head names base table \"{table}\"")]
    BaseTableHead { table: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum PolicyError {
    #[error("policy already exists: \"{name}\"")]
    #[diagnostic(
        code(cage::policy::duplicate),
        help("Policy names are unique within an engine. Delete the old policy first.")
    )]
    DuplicatePolicy { name: String },

    #[error("unknown policy: \"{name}\"")]
    #[diagnostic(
        code(cage::policy::unknown),
        help("Create the policy with `create_policy` or subscribe to a publisher of that name.")
    )]
    UnknownPolicy { name: String },

    #[error("rule rejected: {rule}: {reason}")]
    #[diagnostic(
        code(cage::policy::rule_validation),
        help(
            "Rules must be range-restricted (every head variable bound by a body \
             literal), define a table of their own policy, and only reference \
             declared tables with matching arity. The policy was left unchanged."
        )
    )]
    RuleValidation { rule: String, reason: RuleViolation },

    #[error("cannot write facts into derived table \"{policy}:{table}\"")]
    #[diagnostic(
        code(cage::policy::derived_write),
        help("Derived tables are computed from rules; insert into the base tables they read.")
    )]
    DerivedTableWrite { policy: String, table: String },

    #[error("fact is not ground: {fact}")]
    #[diagnostic(
        code(cage::policy::non_ground),
        help("Facts may only contain constants. Use a rule to express a pattern.")
    )]
    NonGroundFact { fact: String },

    #[error("table \"{policy}:{table}\" has arity {expected}, got a tuple of {actual}")]
    #[diagnostic(
        code(cage::policy::arity),
        help("The tuple was rejected and the table is unchanged.")
    )]
    ArityMismatch {
        policy: String,
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("table \"{policy}:{table}\" is not declared in the policy schema")]
    #[diagnostic(
        code(cage::policy::undeclared_table),
        help("The policy has a bound schema; declare the table with `set_schema` first.")
    )]
    UndeclaredTable { policy: String, table: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),
}

/// Result type for policy operations.
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
