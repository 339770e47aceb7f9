//! Declarative translation of nested JSON objects into flat tables.
//!
//! A translator tree describes one top-level table and, through nested
//! field translators, any number of linked child tables:
//!
//! - `VALUE` copies a scalar field into a column of the enclosing row.
//! - `HDICT` turns a dictionary (or, with `in-list`, a list of them) into
//!   rows of its own table.
//! - `LIST` turns a list of scalars into rows of a link table.
//!
//! A nested table with a `parent-key` gets the parent's value of that field
//! as its first column and adds nothing to the parent row. Without one,
//! child rows are prefixed by an id computed from their content and the
//! parent row carries that id as the column for the field.
//!
//! Missing fields translate to the string `"None"`.

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::schema::{Schema, TableSchema};
use crate::value::{Tuple, Value};

use super::error::{TranslatorError, TranslatorResult};

/// How to reach the fields of a dictionary-shaped object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    #[default]
    #[serde(rename = "DICT_SELECTOR")]
    Dict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "translation-type")]
pub enum Translator {
    #[serde(rename = "VALUE")]
    Value,
    #[serde(rename = "HDICT")]
    HDict(HDictTranslator),
    #[serde(rename = "LIST")]
    List(ListTranslator),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTranslator {
    pub fieldname: String,
    pub translator: Translator,
}

impl FieldTranslator {
    pub fn new(fieldname: impl Into<String>, translator: Translator) -> Self {
        Self {
            fieldname: fieldname.into(),
            translator,
        }
    }

    pub fn value(fieldname: impl Into<String>) -> Self {
        Self::new(fieldname, Translator::Value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HDictTranslator {
    #[serde(rename = "table-name")]
    pub table: String,
    #[serde(default)]
    pub parent_key: Option<String>,
    #[serde(default)]
    pub in_list: bool,
    #[serde(default, rename = "selector-type")]
    pub selector: Selector,
    #[serde(rename = "field-translators")]
    pub fields: Vec<FieldTranslator>,
}

impl HDictTranslator {
    pub fn new(table: impl Into<String>, fields: Vec<FieldTranslator>) -> Self {
        Self {
            table: table.into(),
            parent_key: None,
            in_list: false,
            selector: Selector::Dict,
            fields,
        }
    }

    pub fn parent_key(mut self, key: impl Into<String>) -> Self {
        self.parent_key = Some(key.into());
        self
    }

    pub fn in_list(mut self) -> Self {
        self.in_list = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListTranslator {
    #[serde(rename = "table-name")]
    pub table: String,
    #[serde(default)]
    pub parent_key: Option<String>,
    #[serde(default = "default_val_col")]
    pub val_col: String,
}

fn default_val_col() -> String {
    "value".to_string()
}

impl ListTranslator {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            parent_key: None,
            val_col: default_val_col(),
        }
    }

    pub fn parent_key(mut self, key: impl Into<String>) -> Self {
        self.parent_key = Some(key.into());
        self
    }
}

impl Translator {
    fn parent_key(&self) -> Option<&str> {
        match self {
            Self::Value => None,
            Self::HDict(t) => t.parent_key.as_deref(),
            Self::List(t) => t.parent_key.as_deref(),
        }
    }

    /// Tables this tree produces, with column names.
    pub fn schema(&self) -> TranslatorResult<Schema> {
        let mut schema = Schema::new();
        match self {
            Self::Value => return Err(TranslatorError::TopLevelValue),
            Self::HDict(t) => {
                let columns = hdict_columns(t, &mut schema)?;
                declare(&mut schema, &t.table, columns)?;
            }
            Self::List(t) => {
                declare(&mut schema, &t.table, vec![t.val_col.clone()])?;
            }
        }
        Ok(schema)
    }

    /// Translate a list of top-level objects into `(table, row)` pairs.
    pub fn convert_objs(&self, objs: &[Json]) -> TranslatorResult<Vec<(String, Tuple)>> {
        let mut out = Vec::new();
        match self {
            Self::Value => return Err(TranslatorError::TopLevelValue),
            Self::HDict(t) => {
                for obj in objs {
                    let row = hdict_row(obj, t, &mut out)?;
                    out.push((t.table.clone(), Tuple::new(row)));
                }
            }
            Self::List(t) => {
                for item in objs {
                    out.push((t.table.clone(), Tuple::new(vec![Value::from_json(item)])));
                }
            }
        }
        Ok(out)
    }
}

/// Combined schema of several translator trees.
pub fn schema_of(translators: &[Translator]) -> TranslatorResult<Schema> {
    let mut schema = Schema::new();
    for t in translators {
        for (table, decl) in t.schema()? {
            if schema.insert(table.clone(), decl).is_some() {
                return Err(TranslatorError::DuplicateTable { table });
            }
        }
    }
    Ok(schema)
}

fn declare(schema: &mut Schema, table: &str, columns: Vec<String>) -> TranslatorResult<()> {
    if schema.contains_key(table) {
        return Err(TranslatorError::DuplicateTable {
            table: table.to_string(),
        });
    }
    schema.insert(table.to_string(), TableSchema::columns(columns));
    Ok(())
}

fn hdict_columns(t: &HDictTranslator, schema: &mut Schema) -> TranslatorResult<Vec<String>> {
    let mut columns = Vec::new();
    for field in &t.fields {
        let key_column = field
            .translator
            .parent_key()
            .map(str::to_string)
            .unwrap_or_else(|| "id".to_string());
        match &field.translator {
            Translator::Value => columns.push(field.fieldname.clone()),
            Translator::HDict(child) => {
                let mut child_columns = vec![key_column];
                child_columns.extend(hdict_columns(child, schema)?);
                declare(schema, &child.table, child_columns)?;
                if child.parent_key.is_none() {
                    columns.push(field.fieldname.clone());
                }
            }
            Translator::List(child) => {
                declare(schema, &child.table, vec![key_column, child.val_col.clone()])?;
                if child.parent_key.is_none() {
                    columns.push(field.fieldname.clone());
                }
            }
        }
    }
    Ok(columns)
}

fn missing() -> Value {
    Value::Str("None".to_string())
}

fn describe(json: &Json) -> String {
    match json {
        Json::Null => "null".into(),
        Json::Bool(_) => "a boolean".into(),
        Json::Number(_) => "a number".into(),
        Json::String(_) => "a string".into(),
        Json::Array(_) => "a list".into(),
        Json::Object(_) => "an object".into(),
    }
}

/// Columns of one HDICT row. Child rows are appended to `out`.
fn hdict_row(
    obj: &Json,
    t: &HDictTranslator,
    out: &mut Vec<(String, Tuple)>,
) -> TranslatorResult<Vec<Value>> {
    let Json::Object(map) = obj else {
        return Err(TranslatorError::NotAnObject {
            table: t.table.clone(),
            found: describe(obj),
        });
    };
    let mut row = Vec::with_capacity(t.fields.len());
    for field in &t.fields {
        let raw = map.get(&field.fieldname).filter(|v| !v.is_null());
        match &field.translator {
            Translator::Value => row.push(raw.map(Value::from_json).unwrap_or_else(missing)),
            nested => {
                let parent = nested
                    .parent_key()
                    .map(|key| map.get(key).map(Value::from_json).unwrap_or_else(missing));
                let id = child_rows(raw, nested, parent.clone(), out)?;
                if parent.is_none() {
                    row.push(id);
                }
            }
        }
    }
    Ok(row)
}

/// Emit the rows of a nested table and return the id linking them to the
/// parent row.
fn child_rows(
    raw: Option<&Json>,
    t: &Translator,
    parent: Option<Value>,
    out: &mut Vec<(String, Tuple)>,
) -> TranslatorResult<Value> {
    let (table, rows) = match t {
        Translator::Value => return Err(TranslatorError::TopLevelValue),
        Translator::HDict(child) => {
            let items: Vec<&Json> = match raw {
                None => Vec::new(),
                Some(json) if child.in_list => list_items(json, &child.table)?,
                Some(json) => vec![json],
            };
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                rows.push(hdict_row(item, child, out)?);
            }
            (&child.table, rows)
        }
        Translator::List(child) => {
            let items = match raw {
                None => Vec::new(),
                Some(json) => list_items(json, &child.table)?,
            };
            let rows: Vec<Vec<Value>> = items
                .into_iter()
                .map(|item| vec![Value::from_json(item)])
                .collect();
            (&child.table, rows)
        }
    };

    let key = match parent {
        Some(value) => value,
        None => content_id(&rows),
    };
    for columns in rows {
        let mut full = Vec::with_capacity(columns.len() + 1);
        full.push(key.clone());
        full.extend(columns);
        out.push((table.clone(), Tuple::new(full)));
    }
    Ok(key)
}

fn list_items<'a>(json: &'a Json, table: &str) -> TranslatorResult<Vec<&'a Json>> {
    match json {
        Json::Array(items) => Ok(items.iter().collect()),
        other => Err(TranslatorError::NotAList {
            table: table.to_string(),
            found: describe(other),
        }),
    }
}

/// Stable id for a group of child rows, independent of their order.
fn content_id(rows: &[Vec<Value>]) -> Value {
    let sorted: BTreeSet<&Vec<Value>> = rows.iter().collect();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    Value::Str(format!("{:016x}", hasher.finish()))
}
