//! Data sources: drivers that snapshot external systems into tables.
//!
//! A [`Driver`] knows how to fetch the current state of one external system
//! and turn it into `table -> rows`. [`DataSourceService`] hosts a driver on
//! the bus, polls it on its own schedule and publishes every table as a full
//! snapshot. Diffing is the consumer's job.

pub mod error;
pub mod fixture;
pub mod translator;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{ActionTable, Service, ServiceArgs, ServiceContext};
use crate::error::{ServiceError, ServiceResult};
use crate::message::Payload;
use crate::schema::Schema;
use crate::value::Tuple;

pub use error::{DriverError, DriverResult, TranslatorError, TranslatorResult};
pub use fixture::FixtureDriver;
pub use translator::{
    FieldTranslator, HDictTranslator, ListTranslator, Selector, Translator, schema_of,
};

/// Full content of every table a driver exports.
pub type State = BTreeMap<String, BTreeSet<Tuple>>;

/// Replacement for secret option values in anything displayed or logged.
pub const HIDDEN: &str = "<hidden>";

/// Poll period when the arguments name none.
const DEFAULT_POLL_TIME: Duration = Duration::from_secs(10);

/// Identification record of a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceInfo {
    pub id: String,
    pub description: String,
    /// Options the driver requires.
    pub config: Vec<String>,
    /// Options whose values must never be shown.
    pub secret: Vec<String>,
}

impl DatasourceInfo {
    /// Copy of `args` with secret option values masked.
    pub fn redact(&self, args: &ServiceArgs) -> ServiceArgs {
        args.iter()
            .map(|(k, v)| {
                if self.secret.contains(k) {
                    (k.clone(), serde_json::Value::String(HIDDEN.to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// Fail on the first required option missing from `args`.
    pub fn check_config(&self, args: &ServiceArgs) -> DriverResult<()> {
        match self.config.iter().find(|opt| !args.contains_key(*opt)) {
            Some(option) => Err(DriverError::MissingConfig {
                driver: self.id.clone(),
                option: option.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Adapter to one external system.
pub trait Driver: Send + 'static {
    fn info(&self) -> DatasourceInfo;

    /// Translator trees describing the exported tables.
    fn translators(&self) -> &[Translator];

    /// Exported tables. Derived from the translators unless overridden.
    fn schema(&self) -> DriverResult<Schema> {
        Ok(schema_of(self.translators())?)
    }

    /// Fetch the current state of every exported table.
    fn update_from_datasource(&mut self) -> DriverResult<State>;

    /// Locally implemented actions.
    fn actions(&self) -> ActionTable {
        ActionTable::new()
    }

    /// Forward an action to the external API.
    fn execute_api(&mut self, action: &str, _args: &ServiceArgs) -> DriverResult<serde_json::Value> {
        Err(DriverError::UnknownAction {
            driver: self.info().id,
            action: action.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct SourceInner<D> {
    ctx: ServiceContext,
    info: DatasourceInfo,
    driver: Mutex<D>,
    schema: Schema,
    state: Mutex<State>,
    poll_time: Option<Duration>,
    args: ServiceArgs,
    actions: ActionTable,
}

/// A driver hosted as a producer service.
pub struct DataSourceService<D: Driver> {
    inner: Arc<SourceInner<D>>,
}

impl<D: Driver> Clone for DataSourceService<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> DataSourceService<D> {
    /// Wrap `driver`. Fails if a required option is missing, the poll time
    /// is malformed, or the translators do not describe a valid schema.
    pub fn new(ctx: ServiceContext, driver: D, args: &ServiceArgs) -> DriverResult<Self> {
        let info = driver.info();
        info.check_config(args)?;
        let poll_time = poll_time(&info.id, args)?;
        let schema = driver.schema()?;
        let actions = driver.actions();
        tracing::info!(
            service = ctx.name(),
            driver = %info.id,
            tables = schema.len(),
            ?poll_time,
            args = ?info.redact(args),
            "data source ready"
        );
        Ok(Self {
            inner: Arc::new(SourceInner {
                ctx,
                args: info.redact(args),
                info,
                driver: Mutex::new(driver),
                schema,
                state: Mutex::new(State::new()),
                poll_time,
                actions,
            }),
        })
    }

    /// Factory for the bus registry; `make` builds the driver from the
    /// service arguments.
    pub fn factory<F>(
        make: F,
    ) -> impl Fn(ServiceContext, &ServiceArgs) -> Result<Arc<dyn Service>, String> + Send + Sync + 'static
    where
        F: Fn(&ServiceArgs) -> DriverResult<D> + Send + Sync + 'static,
    {
        move |ctx, args| {
            let driver = make(args).map_err(|e| e.to_string())?;
            let service = Self::new(ctx, driver, args).map_err(|e| e.to_string())?;
            Ok(Arc::new(service) as Arc<dyn Service>)
        }
    }

    pub fn info(&self) -> &DatasourceInfo {
        &self.inner.info
    }

    /// Construction arguments with secrets masked.
    pub fn args(&self) -> &ServiceArgs {
        &self.inner.args
    }

    pub fn exported_schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// State captured by the last successful poll.
    pub fn state(&self) -> State {
        self.inner.state.lock().expect("state lock poisoned").clone()
    }

    /// Fetch from the driver and publish every table as a snapshot.
    /// Returns the number of tables published.
    ///
    /// Tables in the schema or the previous poll that the driver did not
    /// report are published empty, so consumers see their rows go away.
    ///
    /// The driver lock is held until every snapshot is enqueued, so
    /// concurrent polls publish in the order their state was recorded.
    pub fn poll_now(&self) -> DriverResult<usize> {
        let mut driver = self.inner.driver.lock().expect("driver lock poisoned");
        let fetched = driver.update_from_datasource()?;

        let previous = std::mem::replace(
            &mut *self.inner.state.lock().expect("state lock poisoned"),
            fetched.clone(),
        );
        let mut tables: BTreeSet<&String> = self.inner.schema.keys().collect();
        tables.extend(previous.keys());
        tables.extend(fetched.keys());
        for table in &tables {
            let rows = fetched.get(*table).cloned().unwrap_or_default();
            let reached = self.inner.ctx.publish(table, Payload::Snapshot(rows));
            tracing::trace!(service = self.inner.ctx.name(), table = %table, reached, "published snapshot");
        }
        drop(driver);
        Ok(tables.len())
    }
}

impl<D: Driver> Service for DataSourceService<D> {
    fn name(&self) -> &str {
        self.inner.ctx.name()
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.inner.poll_time
    }

    fn poll(&self) -> ServiceResult<()> {
        self.poll_now()
            .map(|_| ())
            .map_err(|e| ServiceError::PollFailed {
                service: self.name().to_string(),
                message: e.to_string(),
            })
    }

    fn schema(&self) -> Option<Schema> {
        Some(self.inner.schema.clone())
    }

    fn actions(&self) -> &ActionTable {
        &self.inner.actions
    }

    fn proxy_api(&self, action: &str, args: &ServiceArgs) -> ServiceResult<serde_json::Value> {
        let mut driver = self.inner.driver.lock().expect("driver lock poisoned");
        driver.execute_api(action, args).map_err(|e| match e {
            DriverError::UnknownAction { .. } => ServiceError::UnknownAction {
                service: self.name().to_string(),
                action: action.to_string(),
            },
            other => ServiceError::ActionFailed {
                service: self.name().to_string(),
                action: action.to_string(),
                message: other.to_string(),
            },
        })
    }
}

impl<D: Driver> fmt::Debug for DataSourceService<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceService")
            .field("name", &self.inner.ctx.name())
            .field("driver", &self.inner.info.id)
            .field("args", &self.inner.args)
            .finish()
    }
}

/// `poll_time_ms` (integer milliseconds) wins over `poll_time` (seconds).
/// Zero disables the schedule.
fn poll_time(driver: &str, args: &ServiceArgs) -> DriverResult<Option<Duration>> {
    let invalid = |option: &str, message: &str| DriverError::InvalidConfig {
        driver: driver.to_string(),
        option: option.to_string(),
        message: message.to_string(),
    };
    let period = if let Some(v) = args.get("poll_time_ms") {
        let ms = v
            .as_u64()
            .ok_or_else(|| invalid("poll_time_ms", "expected a non-negative integer"))?;
        Duration::from_millis(ms)
    } else if let Some(v) = args.get("poll_time") {
        let secs = v
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| invalid("poll_time", "expected a non-negative number of seconds"))?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| invalid("poll_time", &e.to_string()))?
    } else {
        DEFAULT_POLL_TIME
    };
    Ok((!period.is_zero()).then_some(period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::tuple;

    /// Driver over an in-memory state that tests can swap.
    struct Canned {
        state: Arc<Mutex<State>>,
        translators: Vec<Translator>,
        actions_run: Arc<Mutex<Vec<String>>>,
    }

    impl Driver for Canned {
        fn info(&self) -> DatasourceInfo {
            DatasourceInfo {
                id: "canned".into(),
                description: "in-memory test driver".into(),
                config: vec!["username".into(), "password".into()],
                secret: vec!["password".into()],
            }
        }

        fn translators(&self) -> &[Translator] {
            &self.translators
        }

        fn update_from_datasource(&mut self) -> DriverResult<State> {
            Ok(self.state.lock().unwrap().clone())
        }

        fn execute_api(&mut self, action: &str, _args: &ServiceArgs) -> DriverResult<serde_json::Value> {
            if action == "servers.list" {
                self.actions_run.lock().unwrap().push(action.to_string());
                Ok(serde_json::json!([]))
            } else {
                Err(DriverError::UnknownAction {
                    driver: "canned".into(),
                    action: action.into(),
                })
            }
        }
    }

    fn creds() -> ServiceArgs {
        let mut args = ServiceArgs::new();
        args.insert("username".into(), serde_json::json!("admin"));
        args.insert("password".into(), serde_json::json!("s3cret"));
        args.insert("poll_time".into(), serde_json::json!(0));
        args
    }

    fn canned() -> (Canned, Arc<Mutex<State>>) {
        let state = Arc::new(Mutex::new(State::new()));
        let driver = Canned {
            state: Arc::clone(&state),
            translators: Vec::new(),
            actions_run: Arc::default(),
        };
        (driver, state)
    }

    #[test]
    fn redact_masks_secrets() {
        let (driver, _) = canned();
        let redacted = driver.info().redact(&creds());
        assert_eq!(redacted["password"], serde_json::json!(HIDDEN));
        assert_eq!(redacted["username"], serde_json::json!("admin"));
    }

    #[test]
    fn poll_time_parsing() {
        let mut args = ServiceArgs::new();
        assert_eq!(poll_time("d", &args).unwrap(), Some(DEFAULT_POLL_TIME));
        args.insert("poll_time".into(), serde_json::json!(0));
        assert_eq!(poll_time("d", &args).unwrap(), None);
        args.insert("poll_time_ms".into(), serde_json::json!(250));
        assert_eq!(
            poll_time("d", &args).unwrap(),
            Some(Duration::from_millis(250))
        );
        args.insert("poll_time_ms".into(), serde_json::json!("soon"));
        assert!(poll_time("d", &args).is_err());

        let mut args = ServiceArgs::new();
        args.insert("poll_time".into(), serde_json::json!(1e20));
        assert!(matches!(
            poll_time("d", &args),
            Err(DriverError::InvalidConfig { .. })
        ));
        args.insert("poll_time".into(), serde_json::json!(-1.0));
        assert!(poll_time("d", &args).is_err());
    }

    #[tokio::test]
    async fn oversized_poll_time_fails_registration() {
        let bus = Bus::new();
        let mut args = creds();
        args.insert("poll_time".into(), serde_json::json!(1e20));
        let err = bus
            .register(
                "nova",
                DataSourceService::factory(|_| Ok(canned().0)),
                &args,
            )
            .unwrap_err();
        assert!(err.to_string().contains("poll_time"));
        assert!(bus.services().is_empty());
    }

    #[tokio::test]
    async fn missing_credentials_fail_registration() {
        let bus = Bus::new();
        let mut args = creds();
        args.remove("password");
        let err = bus
            .register(
                "nova",
                DataSourceService::factory(|_| Ok(canned().0)),
                &args,
            )
            .unwrap_err();
        assert!(err.to_string().contains("password"));
        assert!(bus.services().is_empty());
    }

    #[test]
    fn poll_records_state() {
        let (driver, state) = canned();
        state
            .lock()
            .unwrap()
            .insert("servers".into(), [tuple!["vm1"]].into_iter().collect());
        let source =
            DataSourceService::new(ServiceContext::detached("nova"), driver, &creds()).unwrap();
        assert_eq!(source.poll_interval(), None);
        assert_eq!(source.poll_now().unwrap(), 1);
        assert_eq!(source.state()["servers"].len(), 1);
        assert_eq!(source.args()["password"], serde_json::json!(HIDDEN));
    }

    struct Sink {
        actions: ActionTable,
    }

    impl Service for Sink {
        fn name(&self) -> &str {
            "sink"
        }
        fn actions(&self) -> &ActionTable {
            &self.actions
        }
    }

    #[tokio::test]
    async fn emptied_table_is_still_published() {
        use crate::convergence::{RetryPolicy, retry_until};

        let bus = Bus::new();
        let (driver, state) = canned();
        state
            .lock()
            .unwrap()
            .insert("servers".into(), [tuple!["vm1"]].into_iter().collect());
        let driver = Mutex::new(Some(driver));
        let handle = bus
            .register(
                "nova",
                DataSourceService::factory(move |_| {
                    driver.lock().unwrap().take().ok_or(DriverError::Source {
                        driver: "canned".into(),
                        message: "already built".into(),
                    })
                }),
                &creds(),
            )
            .unwrap();
        bus.register(
            "sink",
            |_, _| {
                Ok(Arc::new(Sink {
                    actions: ActionTable::new(),
                }) as Arc<dyn Service>)
            },
            &ServiceArgs::new(),
        )
        .unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "sink",
            "nova",
            "servers",
            Arc::new(move |msg| {
                if let Payload::Snapshot(rows) = &msg.body {
                    sink.lock().unwrap().push(rows.len());
                }
            }),
        )
        .unwrap();

        let source = handle.downcast_ref::<DataSourceService<Canned>>().unwrap();
        source.poll_now().unwrap();
        state.lock().unwrap().clear();
        // The table is gone from the driver but still in the published set.
        assert_eq!(source.poll_now().unwrap(), 1);

        let policy = RetryPolicy::new(50, Duration::from_millis(10));
        retry_until(policy, || seen.lock().unwrap().len() == 2)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [1, 0]);
        bus.shutdown().await;
    }

    /// Reports a fresh single-row table on every fetch.
    struct Ticker {
        next: i64,
    }

    impl Driver for Ticker {
        fn info(&self) -> DatasourceInfo {
            DatasourceInfo {
                id: "ticker".into(),
                description: "counts fetches".into(),
                config: Vec::new(),
                secret: Vec::new(),
            }
        }

        fn translators(&self) -> &[Translator] {
            &[]
        }

        fn update_from_datasource(&mut self) -> DriverResult<State> {
            self.next += 1;
            Ok(State::from([(
                "ticks".to_string(),
                [tuple![self.next]].into_iter().collect(),
            )]))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_polls_publish_in_state_order() {
        use crate::convergence::{RetryPolicy, retry_until};

        let bus = Bus::new();
        let mut args = ServiceArgs::new();
        args.insert("poll_time".into(), serde_json::json!(0));
        let handle = bus
            .register(
                "ticker",
                DataSourceService::factory(|_| Ok(Ticker { next: 0 })),
                &args,
            )
            .unwrap();
        bus.register(
            "sink",
            |_, _| {
                Ok(Arc::new(Sink {
                    actions: ActionTable::new(),
                }) as Arc<dyn Service>)
            },
            &ServiceArgs::new(),
        )
        .unwrap();

        let seen: Arc<Mutex<Vec<BTreeSet<Tuple>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "sink",
            "ticker",
            "ticks",
            Arc::new(move |msg| {
                if let Payload::Snapshot(rows) = msg.body {
                    sink.lock().unwrap().push(rows);
                }
            }),
        )
        .unwrap();

        let source = handle
            .downcast::<DataSourceService<Ticker>>()
            .unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let source = source.clone();
                scope.spawn(move || {
                    for _ in 0..25 {
                        source.poll_now().unwrap();
                    }
                });
            }
        });

        let policy = RetryPolicy::new(200, Duration::from_millis(10));
        retry_until(policy, || seen.lock().unwrap().len() == 100)
            .await
            .unwrap();
        let expected: Vec<BTreeSet<Tuple>> = (1..=100_i64)
            .map(|i| BTreeSet::from([tuple![i]]))
            .collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(source.state()["ticks"], expected[99]);
        bus.shutdown().await;
    }

    #[test]
    fn execute_prefers_local_then_proxies() {
        let (driver, _) = canned();
        let run = Arc::clone(&driver.actions_run);
        let source =
            DataSourceService::new(ServiceContext::detached("nova"), driver, &creds()).unwrap();
        assert!(!source.is_executable("servers.list"));
        assert_eq!(
            source.execute("servers.list", &ServiceArgs::new()).unwrap(),
            serde_json::json!([])
        );
        assert_eq!(run.lock().unwrap().as_slice(), ["servers.list"]);
        assert!(matches!(
            source.execute("reboot", &ServiceArgs::new()),
            Err(ServiceError::UnknownAction { .. })
        ));
    }
}
