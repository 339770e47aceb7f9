//! File-backed driver.
//!
//! Reads a JSON document on every poll. Each configured translator is run
//! over the array stored under its `source` key. Any other top-level key
//! holding an array of arrays is exported as a raw table, one row per inner
//! array.
//!
//! ```json
//! { "servers": [{"id": "vm1", "tenant": "t1"}],
//!   "links":   [["n1", "s1"], ["n2", "s1"]] }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::bus::ServiceArgs;
use crate::value::{Tuple, Value};

use super::error::{DriverError, DriverResult};
use super::translator::Translator;
use super::{DatasourceInfo, Driver, State};

const DRIVER: &str = "fixture";

/// A translator bound to the document key it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedTranslator {
    pub source: String,
    pub translator: Translator,
}

#[derive(Debug)]
pub struct FixtureDriver {
    path: PathBuf,
    sources: Vec<String>,
    translators: Vec<Translator>,
}

impl FixtureDriver {
    pub fn new(path: impl Into<PathBuf>, translators: Vec<SourcedTranslator>) -> Self {
        let (sources, translators) = translators
            .into_iter()
            .map(|t| (t.source, t.translator))
            .unzip();
        Self {
            path: path.into(),
            sources,
            translators,
        }
    }

    /// Build from service arguments: `path` (required) and `translators`
    /// (optional array of `{source, translator}`).
    pub fn from_args(args: &ServiceArgs) -> DriverResult<Self> {
        let path = args
            .get("path")
            .ok_or_else(|| DriverError::MissingConfig {
                driver: DRIVER.into(),
                option: "path".into(),
            })?
            .as_str()
            .ok_or_else(|| invalid("path", "expected a string"))?;
        let translators = match args.get("translators") {
            Some(json) => serde_json::from_value(json.clone())
                .map_err(|e| invalid("translators", &e.to_string()))?,
            None => Vec::new(),
        };
        Ok(Self::new(path, translators))
    }

    fn read(&self) -> DriverResult<serde_json::Map<String, Json>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| DriverError::Source {
            driver: DRIVER.into(),
            message: format!("{}: {e}", self.path.display()),
        })?;
        match serde_json::from_str(&text) {
            Ok(Json::Object(doc)) => Ok(doc),
            Ok(_) => Err(DriverError::Source {
                driver: DRIVER.into(),
                message: format!("{}: top level is not an object", self.path.display()),
            }),
            Err(e) => Err(DriverError::Source {
                driver: DRIVER.into(),
                message: format!("{}: {e}", self.path.display()),
            }),
        }
    }
}

impl Driver for FixtureDriver {
    fn info(&self) -> DatasourceInfo {
        DatasourceInfo {
            id: DRIVER.into(),
            description: "tables read from a local JSON document".into(),
            config: vec!["path".into()],
            secret: Vec::new(),
        }
    }

    fn translators(&self) -> &[Translator] {
        &self.translators
    }

    fn update_from_datasource(&mut self) -> DriverResult<State> {
        let doc = self.read()?;
        let mut state = State::new();

        for (source, translator) in self.sources.iter().zip(&self.translators) {
            let objs = match doc.get(source) {
                Some(Json::Array(items)) => items.as_slice(),
                Some(_) => {
                    return Err(DriverError::Source {
                        driver: DRIVER.into(),
                        message: format!("\"{source}\" is not an array"),
                    });
                }
                None => &[],
            };
            for (table, row) in translator.convert_objs(objs)? {
                state.entry(table).or_default().insert(row);
            }
        }

        for (key, json) in &doc {
            if self.sources.contains(key) {
                continue;
            }
            if let Some(rows) = raw_rows(json) {
                state.entry(key.clone()).or_default().extend(rows);
            }
        }

        tracing::debug!(path = %self.path.display(), tables = state.len(), "read fixture");
        Ok(state)
    }
}

/// Rows of an array-of-arrays, or `None` if `json` has another shape.
fn raw_rows(json: &Json) -> Option<Vec<Tuple>> {
    json.as_array()?
        .iter()
        .map(|row| {
            row.as_array()
                .map(|cells| Tuple::new(cells.iter().map(Value::from_json).collect()))
        })
        .collect()
}

fn invalid(option: &str, message: &str) -> DriverError {
    DriverError::InvalidConfig {
        driver: DRIVER.into(),
        option: option.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::translator::{FieldTranslator, HDictTranslator, ListTranslator};
    use crate::tuple;
    use std::io::Write;

    fn servers() -> SourcedTranslator {
        SourcedTranslator {
            source: "servers".into(),
            translator: Translator::HDict(HDictTranslator::new(
                "servers",
                vec![
                    FieldTranslator::value("id"),
                    FieldTranslator::value("tenant"),
                    FieldTranslator::new(
                        "networks",
                        Translator::List(ListTranslator::new("server_networks").parent_key("id")),
                    ),
                ],
            )),
        }
    }

    fn write(doc: &Json) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{doc}").unwrap();
        file
    }

    #[test]
    fn translates_and_passes_raw_tables_through() {
        let file = write(&serde_json::json!({
            "servers": [
                {"id": "vm1", "tenant": "t1", "networks": ["n1", "n2"]},
                {"id": "vm2", "networks": []},
            ],
            "links": [["n1", "s1"], ["n2", 7]],
            "version": 3,
        }));
        let mut driver = FixtureDriver::new(file.path(), vec![servers()]);
        let state = driver.update_from_datasource().unwrap();

        assert_eq!(
            state["servers"],
            [tuple!["vm1", "t1"], tuple!["vm2", "None"]].into_iter().collect()
        );
        assert_eq!(
            state["server_networks"],
            [tuple!["vm1", "n1"], tuple!["vm1", "n2"]].into_iter().collect()
        );
        assert_eq!(
            state["links"],
            [tuple!["n1", "s1"], tuple!["n2", 7]].into_iter().collect()
        );
        assert!(!state.contains_key("version"));
    }

    #[test]
    fn rereads_on_every_poll() {
        let file = write(&serde_json::json!({"p": [[1]]}));
        let mut driver = FixtureDriver::new(file.path(), Vec::new());
        assert_eq!(driver.update_from_datasource().unwrap()["p"].len(), 1);

        std::fs::write(file.path(), r#"{"p": [[1], [2]]}"#).unwrap();
        assert_eq!(driver.update_from_datasource().unwrap()["p"].len(), 2);
    }

    #[test]
    fn missing_file_is_a_source_error() {
        let mut driver = FixtureDriver::new("/nonexistent/cage-fixture.json", Vec::new());
        assert!(matches!(
            driver.update_from_datasource(),
            Err(DriverError::Source { .. })
        ));
    }

    #[test]
    fn from_args_reads_translators() {
        let mut args = ServiceArgs::new();
        assert!(matches!(
            FixtureDriver::from_args(&args),
            Err(DriverError::MissingConfig { .. })
        ));

        args.insert("path".into(), serde_json::json!("/tmp/x.json"));
        args.insert(
            "translators".into(),
            serde_json::to_value(vec![servers()]).unwrap(),
        );
        let driver = FixtureDriver::from_args(&args).unwrap();
        let schema = driver.schema().unwrap();
        assert_eq!(
            schema.keys().collect::<Vec<_>>(),
            ["server_networks", "servers"]
        );
    }
}
