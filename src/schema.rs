//! Table shape declarations and arity validation.
//!
//! A [`SchemaRegistry`] is local to one policy: the same table name can carry
//! different arities in different policies. Validation checks shape only;
//! column values are never type-checked.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SchemaError, SchemaResult};
use crate::value::Tuple;

/// Whether a table is populated by events or computed by rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Base,
    Derived,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Derived => write!(f, "derived"),
        }
    }
}

/// Declared shape of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub arity: usize,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    pub kind: TableKind,
}

impl TableSchema {
    /// A base table of the given arity, columns unnamed.
    pub fn base(arity: usize) -> Self {
        Self {
            arity,
            columns: None,
            kind: TableKind::Base,
        }
    }

    pub fn derived(arity: usize) -> Self {
        Self {
            arity,
            columns: None,
            kind: TableKind::Derived,
        }
    }

    /// A base table whose arity is the number of named columns.
    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = names.into_iter().map(Into::into).collect();
        Self {
            arity: columns.len(),
            columns: Some(columns),
            kind: TableKind::Base,
        }
    }

    /// Two declarations agree if arity and kind match. Column names are
    /// informational and do not conflict.
    fn agrees_with(&self, other: &Self) -> bool {
        self.arity == other.arity && self.kind == other.kind
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} table of arity {}", self.kind, self.arity)
    }
}

/// A named set of table declarations, as exported by a data source.
pub type Schema = BTreeMap<String, TableSchema>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Per-policy table declarations. First declaration wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a base table with the given arity.
    pub fn declare(&mut self, table: &str, arity: usize) -> SchemaResult<()> {
        self.declare_schema(table, TableSchema::base(arity))
    }

    /// Declare a table with a full schema.
    ///
    /// Re-declaring with the same arity and kind is a no-op; anything else
    /// fails with [`SchemaError::Conflict`] and leaves the first declaration
    /// in place.
    pub fn declare_schema(&mut self, table: &str, schema: TableSchema) -> SchemaResult<()> {
        if let Some(cols) = &schema.columns {
            if cols.len() != schema.arity {
                return Err(SchemaError::ColumnCount {
                    table: table.to_string(),
                    arity: schema.arity,
                    columns: cols.len(),
                });
            }
        }
        match self.tables.get_mut(table) {
            Some(existing) if existing.agrees_with(&schema) => {
                if existing.columns.is_none() {
                    existing.columns = schema.columns;
                }
                Ok(())
            }
            Some(existing) => Err(SchemaError::Conflict {
                table: table.to_string(),
                existing: existing.to_string(),
                requested: schema.to_string(),
            }),
            None => {
                self.tables.insert(table.to_string(), schema);
                Ok(())
            }
        }
    }

    /// Whether `tuple` may enter `table`. Unknown tables reject everything.
    pub fn validate(&self, table: &str, tuple: &Tuple) -> bool {
        self.tables
            .get(table)
            .is_some_and(|s| s.arity == tuple.arity())
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn arity(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|s| s.arity)
    }

    pub fn kind(&self, table: &str) -> Option<TableKind> {
        self.tables.get(table).map(|s| s.kind)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableSchema)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Whether any base table has been declared.
    pub fn has_base_tables(&self) -> bool {
        self.tables.values().any(|s| s.kind == TableKind::Base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn validate_checks_arity_only() {
        let mut reg = SchemaRegistry::new();
        reg.declare("servers", 2).unwrap();
        assert!(reg.validate("servers", &tuple!["a", 1]));
        assert!(reg.validate("servers", &tuple![1.5, "b"]));
        assert!(!reg.validate("servers", &tuple!["a"]));
        assert!(!reg.validate("servers", &tuple!["a", 1, 2]));
    }

    #[test]
    fn unknown_table_rejects() {
        let reg = SchemaRegistry::new();
        assert!(!reg.validate("nope", &tuple![1]));
    }

    #[test]
    fn first_declaration_wins() {
        let mut reg = SchemaRegistry::new();
        reg.declare("p", 1).unwrap();
        reg.declare("p", 1).unwrap();
        let err = reg.declare("p", 3).unwrap_err();
        assert!(matches!(err, SchemaError::Conflict { .. }));
        assert_eq!(reg.arity("p"), Some(1));
    }

    #[test]
    fn kind_mismatch_conflicts() {
        let mut reg = SchemaRegistry::new();
        reg.declare_schema("p", TableSchema::derived(1)).unwrap();
        assert!(reg.declare("p", 1).is_err());
        assert_eq!(reg.kind("p"), Some(TableKind::Derived));
    }

    #[test]
    fn named_columns_set_arity() {
        let mut reg = SchemaRegistry::new();
        reg.declare_schema("stacks_links", TableSchema::columns(["href", "rel"]))
            .unwrap();
        assert_eq!(reg.arity("stacks_links"), Some(2));
        assert_eq!(
            reg.get("stacks_links").unwrap().columns.as_deref(),
            Some(&["href".to_string(), "rel".to_string()][..])
        );
    }

    #[test]
    fn column_count_must_match_arity() {
        let mut reg = SchemaRegistry::new();
        let schema = TableSchema {
            arity: 3,
            columns: Some(vec!["a".into()]),
            kind: TableKind::Base,
        };
        assert!(matches!(
            reg.declare_schema("t", schema),
            Err(SchemaError::ColumnCount { .. })
        ));
        assert!(reg.is_empty());
    }
}
