//! TOML description of a bus deployment.
//!
//! ```toml
//! [engine]
//! name = "policy"
//! default_policy = "classification"
//!
//! [[service]]
//! name = "nova"
//! module = "fixture"
//! poll_time_ms = 1000
//! [service.args]
//! path = "nova.json"
//!
//! [[policy]]
//! name = "nova"
//! subscribe = ["servers"]
//! schema = { servers = ["id", "name"] }
//!
//! [[rule]]
//! text = "active(x) :- nova:servers(x, \"ACTIVE\")"
//! ```
//!
//! A `[[policy]]` named after a service receives that service's tables;
//! `subscribe` lists which ones. Relative `path` arguments are resolved
//! against the directory of the configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Bus, FactoryRegistry, ServiceArgs};
use crate::compile::parse_rule;
use crate::datasource::DataSourceService;
use crate::datasource::fixture::{FixtureDriver, SourcedTranslator};
use crate::error::CageResult;
use crate::formula::Event;
use crate::policy::{DEFAULT_POLICY, PolicyEngine};
use crate::schema::TableSchema;

/// Module name of the policy engine factory.
pub const ENGINE_MODULE: &str = "policy";
/// Module name of the file-backed data source.
pub const FIXTURE_MODULE: &str = "fixture";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    #[diagnostic(
        code(cage::config::read),
        help("Check that the file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(cage::config::parse),
        help("The file must be valid TOML with [engine], [[service]], [[policy]] and [[rule]] tables.")
    )]
    Parse { path: String, message: String },

    #[error("service \"{service}\" names unknown module \"{module}\"")]
    #[diagnostic(
        code(cage::config::unknown_module),
        help("Known modules are registered at startup; `fixture` and `policy` are built in.")
    )]
    UnknownModule { service: String, module: String },

    #[error("invalid rule \"{text}\": {message}")]
    #[diagnostic(
        code(cage::config::invalid_rule),
        help("Rules look like `head(x) :- body(x, y), other:table(y)` and target an existing policy.")
    )]
    InvalidRule { text: String, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CageConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyConfig>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_name")]
    pub name: String,
    #[serde(default = "default_policy_name")]
    pub default_policy: String,
    /// Services whose `policy-update` channel the engine consumes.
    #[serde(default)]
    pub policy_updates: Vec<String>,
}

fn default_engine_name() -> String {
    "policy".to_string()
}

fn default_policy_name() -> String {
    DEFAULT_POLICY.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            default_policy: default_policy_name(),
            policy_updates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub poll_time_ms: Option<u64>,
    #[serde(default)]
    pub args: ServiceArgs,
    #[serde(default)]
    pub translator: Vec<SourcedTranslator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub subscribe: Vec<String>,
    /// Table name → column names.
    #[serde(default)]
    pub schema: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Target policy; the engine's default policy when absent.
    #[serde(default)]
    pub policy: Option<String>,
    pub text: String,
}

/// Factory registry with the modules this crate ships.
pub fn builtin_modules() -> FactoryRegistry {
    let registry = FactoryRegistry::new();
    registry.register(ENGINE_MODULE, PolicyEngine::factory());
    registry.register(
        FIXTURE_MODULE,
        DataSourceService::factory(FixtureDriver::from_args),
    );
    registry
}

impl CageConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config = Self::parse(&content, &path.display().to_string())?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, origin: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Static checks that need no running bus: every module is known and
    /// every rule parses and targets a policy that will exist.
    pub fn validate(&self, modules: &FactoryRegistry) -> ConfigResult<()> {
        for svc in &self.services {
            if !modules.contains(&svc.module) {
                return Err(ConfigError::UnknownModule {
                    service: svc.name.clone(),
                    module: svc.module.clone(),
                });
            }
        }
        for rule in &self.rules {
            self.rule_event(rule)?;
        }
        Ok(())
    }

    /// Names of all policies the deployment creates.
    pub fn policy_names(&self) -> Vec<&str> {
        let mut names = vec![self.engine.default_policy.as_str()];
        names.extend(self.policies.iter().map(|p| p.name.as_str()));
        names.sort_unstable();
        names.dedup();
        names
    }

    fn rule_event(&self, rule: &RuleConfig) -> ConfigResult<Event> {
        let invalid = |message: String| ConfigError::InvalidRule {
            text: rule.text.clone(),
            message,
        };
        let parsed = parse_rule(&rule.text).map_err(|e| invalid(e.to_string()))?;
        let policy = rule
            .policy
            .clone()
            .unwrap_or_else(|| self.engine.default_policy.clone());
        if !self.policy_names().contains(&policy.as_str()) {
            return Err(invalid(format!("unknown policy \"{policy}\"")));
        }
        Ok(Event::insert(parsed).for_policy(policy))
    }

    /// Construction arguments of a service with the config-level options
    /// folded in.
    pub fn service_args(&self, svc: &ServiceConfig) -> ServiceArgs {
        let mut args = svc.args.clone();
        if let Some(ms) = svc.poll_time_ms {
            args.insert("poll_time_ms".into(), serde_json::json!(ms));
        }
        if !svc.translator.is_empty() {
            if let Ok(json) = serde_json::to_value(&svc.translator) {
                args.insert("translators".into(), json);
            }
        }
        if let (Some(base), Some(serde_json::Value::String(path))) =
            (&self.base_dir, args.get("path"))
        {
            if Path::new(path).is_relative() {
                let joined = base.join(path).display().to_string();
                args.insert("path".into(), serde_json::Value::String(joined));
            }
        }
        args
    }

    /// Register the engine and every service on `bus`, wire subscriptions
    /// and insert the configured rules.
    ///
    /// The bus must have been built with a registry containing every
    /// module the configuration names (see [`builtin_modules`]).
    pub fn start(&self, bus: &Bus) -> CageResult<PolicyEngine> {
        self.validate(bus.factories())?;

        let mut engine_args = ServiceArgs::new();
        engine_args.insert(
            "default_policy".into(),
            serde_json::json!(self.engine.default_policy),
        );
        let engine = bus
            .register(&self.engine.name, PolicyEngine::factory(), &engine_args)?
            .downcast::<PolicyEngine>()
            .ok_or_else(|| crate::error::BusError::UnknownService {
                name: self.engine.name.clone(),
            })?;

        for svc in &self.services {
            bus.create_service(&svc.name, &svc.module, &self.service_args(svc))?;
        }

        // Sources may already be polling: every table must be declared
        // before the first subscription can deliver rows into it.
        for policy in &self.policies {
            if !engine.policies().contains(&policy.name) {
                engine.create_policy(&policy.name)?;
            }
            for (table, columns) in &policy.schema {
                engine.set_schema(&policy.name, table, TableSchema::columns(columns))?;
            }
        }

        let events = self
            .rules
            .iter()
            .map(|r| self.rule_event(r))
            .collect::<ConfigResult<Vec<_>>>()?;
        let change = engine.apply_batch(&events);
        if let Some((event, reason)) = change.rejected.into_iter().next() {
            return Err(ConfigError::InvalidRule {
                text: event.formula.to_string(),
                message: reason,
            }
            .into());
        }

        for policy in &self.policies {
            for table in &policy.subscribe {
                engine.subscribe(&policy.name, table)?;
            }
        }
        for publisher in &self.engine.policy_updates {
            engine.subscribe_policy_updates(publisher)?;
        }

        tracing::info!(
            engine = %self.engine.name,
            services = self.services.len(),
            policies = self.policies.len(),
            rules = self.rules.len(),
            "deployment started"
        );
        Ok(engine)
    }

    /// Run one poll of every configured service.
    pub fn poll_services(&self, bus: &Bus) -> CageResult<()> {
        for svc in &self.services {
            let handle = bus.lookup(&svc.name)?;
            handle
                .service()
                .poll()
                .map_err(crate::error::BusError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[engine]
default_policy = "main"

[[service]]
name = "nova"
module = "fixture"
poll_time_ms = 0
[service.args]
path = "nova.json"

[[service.translator]]
source = "servers"
[service.translator.translator]
translation-type = "HDICT"
table-name = "servers"
field-translators = [
    { fieldname = "id", translator = { translation-type = "VALUE" } },
    { fieldname = "status", translator = { translation-type = "VALUE" } },
]

[[policy]]
name = "nova"
subscribe = ["servers"]

[[rule]]
text = 'active(x) :- nova:servers(x, "ACTIVE")'
"#;

    #[test]
    fn parses_sample() {
        let config = CageConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.engine.name, "policy");
        assert_eq!(config.engine.default_policy, "main");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].translator.len(), 1);
        assert_eq!(config.policies[0].subscribe, ["servers"]);
        assert_eq!(config.policy_names(), ["main", "nova"]);
        config.validate(&builtin_modules()).unwrap();
    }

    #[test]
    fn empty_config_has_defaults() {
        let config = CageConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.services.is_empty());
    }

    #[test]
    fn unknown_module_rejected() {
        let config = CageConfig::from_toml_str(
            r#"
[[service]]
name = "x"
module = "ldap"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(&builtin_modules()),
            Err(ConfigError::UnknownModule { .. })
        ));
    }

    #[test]
    fn rule_must_target_known_policy() {
        let config = CageConfig::from_toml_str(
            r#"
[[rule]]
policy = "elsewhere"
text = "p(x) :- q(x)"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(&builtin_modules()),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            CageConfig::from_toml_str("[[service]\nname ="),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cage.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CageConfig::load(&path).unwrap();
        let args = config.service_args(&config.services[0]);
        assert_eq!(
            args["path"],
            serde_json::json!(dir.path().join("nova.json").display().to_string())
        );
        assert_eq!(args["poll_time_ms"], serde_json::json!(0));
        assert!(args.contains_key("translators"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            CageConfig::load(Path::new("/nonexistent/cage.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn start_wires_sources_into_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("nova.json"),
            r#"{"servers": [{"id": "vm1", "status": "ACTIVE"}, {"id": "vm2", "status": "SHUTOFF"}]}"#,
        )
        .unwrap();
        let path = dir.path().join("cage.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = CageConfig::load(&path).unwrap();
        let bus = Bus::with_factories(builtin_modules());
        let engine = config.start(&bus).unwrap();
        assert_eq!(bus.services(), ["nova", "policy"]);

        config.poll_services(&bus).unwrap();
        let policy = crate::convergence::RetryPolicy::new(100, std::time::Duration::from_millis(10));
        crate::convergence::retry_until(policy, || {
            engine
                .select_text("main", "active(x)")
                .is_ok_and(|rows| rows.len() == 1)
        })
        .await
        .unwrap();
        bus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn configured_schema_binds_before_polling_source_delivers() {
        let dir = tempfile::tempdir().unwrap();
        // Inferring from these rows alone would pick arity 1.
        std::fs::write(
            dir.path().join("heat.json"),
            r#"{"links": [["a"], ["b"], ["http://c", "self"]]}"#,
        )
        .unwrap();
        let path = dir.path().join("cage.toml");
        std::fs::write(
            &path,
            r#"
[[service]]
name = "heat"
module = "fixture"
poll_time_ms = 1
[service.args]
path = "heat.json"

[[policy]]
name = "heat"
subscribe = ["links"]
[policy.schema]
links = ["href", "rel"]
"#,
        )
        .unwrap();

        for _ in 0..20 {
            let config = CageConfig::load(&path).unwrap();
            let bus = Bus::with_factories(builtin_modules());
            let engine = config.start(&bus).unwrap();
            let policy = crate::convergence::RetryPolicy::new(100, std::time::Duration::from_millis(10));
            crate::convergence::retry_until(policy, || engine.snapshot("heat", "links").is_some())
                .await
                .unwrap();
            assert_eq!(
                engine.snapshot("heat", "links").unwrap(),
                [crate::tuple!["http://c", "self"]].into_iter().collect()
            );
            assert!(!engine.rejections("heat").is_empty());
            bus.shutdown().await;
        }
    }
}
