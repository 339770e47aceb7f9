//! Per-policy state: schema, rules, materialized tables and snapshots.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::formula::Rule;
use crate::schema::{SchemaRegistry, TableKind};
use crate::value::Tuple;

/// Rows of one table.
pub type Relation = BTreeSet<Tuple>;

/// Rejections kept per policy; older entries are discarded first.
const REJECTION_LOG_CAPACITY: usize = 1024;

/// A table qualified by its owning policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub policy: String,
    pub table: String,
}

impl TableId {
    pub fn new(policy: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.policy, self.table)
    }
}

/// Lifecycle of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyState {
    /// Created; no schema recorded and no snapshot received.
    Unconfigured,
    /// External table schemas recorded.
    SchemaBound,
    /// At least one full snapshot received and diffed.
    Active,
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => write!(f, "unconfigured"),
            Self::SchemaBound => write!(f, "schema-bound"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// A tuple that was refused on its way into a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub policy: String,
    pub table: String,
    pub tuple: Tuple,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{} rejected: {}",
            self.policy, self.table, self.tuple, self.reason
        )
    }
}

/// Outcome of diffing one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub inserted: usize,
    pub deleted: usize,
    pub rejected: usize,
}

impl UpdateReport {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.deleted == 0
    }
}

/// One policy namespace.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    pub(super) state: PolicyState,
    pub(super) schema: SchemaRegistry,
    /// Whether a schema was bound explicitly; if so, undeclared tables are
    /// refused instead of being declared on first use.
    pub(super) schema_bound: bool,
    pub(super) rules: BTreeSet<Rule>,
    pub(super) tables: BTreeMap<String, Relation>,
    pub(super) snapshots: BTreeMap<String, Relation>,
    rejections: VecDeque<Rejection>,
    pub(super) version: u64,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: PolicyState::Unconfigured,
            schema: SchemaRegistry::new(),
            schema_bound: false,
            rules: BTreeSet::new(),
            tables: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            rejections: VecDeque::new(),
            version: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn is_schema_bound(&self) -> bool {
        self.schema_bound
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Bumped once per applied change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Materialized rows of `table`; `None` if it was never populated.
    pub fn table(&self, table: &str) -> Option<&Relation> {
        self.tables.get(table)
    }

    /// Names of tables holding at least one row.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Last accepted snapshot of an external table.
    pub fn snapshot(&self, table: &str) -> Option<&Relation> {
        self.snapshots.get(table)
    }

    pub fn rejections(&self) -> impl Iterator<Item = &Rejection> {
        self.rejections.iter()
    }

    pub fn is_derived(&self, table: &str) -> bool {
        self.schema.kind(table) == Some(TableKind::Derived)
    }

    pub(super) fn reject(&mut self, table: &str, tuple: Tuple, reason: impl Into<String>) {
        let rejection = Rejection {
            policy: self.name.clone(),
            table: table.to_string(),
            tuple,
            reason: reason.into(),
        };
        tracing::warn!(
            policy = %rejection.policy,
            table = %rejection.table,
            tuple = %rejection.tuple,
            reason = %rejection.reason,
            "tuple rejected"
        );
        if self.rejections.len() == REJECTION_LOG_CAPACITY {
            self.rejections.pop_front();
        }
        self.rejections.push_back(rejection);
    }

    pub(super) fn touch(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn new_policy_is_unconfigured() {
        let p = Policy::new("data");
        assert_eq!(p.state(), PolicyState::Unconfigured);
        assert_eq!(p.version(), 0);
        assert!(p.table("q").is_none());
        assert!(!p.is_schema_bound());
    }

    #[test]
    fn rejection_log_is_bounded() {
        let mut p = Policy::new("data");
        for i in 0..(REJECTION_LOG_CAPACITY as i64 + 5) {
            p.reject("q", tuple![i], "arity");
        }
        assert_eq!(p.rejections().count(), REJECTION_LOG_CAPACITY);
        assert_eq!(p.rejections().next().unwrap().tuple, tuple![5]);
    }

    #[test]
    fn table_id_display() {
        assert_eq!(TableId::new("data", "q").to_string(), "data:q");
    }
}
