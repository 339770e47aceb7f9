//! The service abstraction shared by data producers and the policy engine.
//!
//! Services never reference each other directly. A service receives a
//! [`ServiceContext`] at construction and talks to the rest of the process
//! only through it: publish on its own channels, subscribe to others'.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{BusError, BusResult, ServiceError, ServiceResult};
use crate::message::{Channel, Message, Payload};
use crate::schema::Schema;

use super::{BusInner, ServiceHandle};

/// Keyword-style construction and action arguments.
pub type ServiceArgs = BTreeMap<String, serde_json::Value>;

/// Handler invoked by the inbox task for each message on a subscribed channel.
pub type Callback = Arc<dyn Fn(Message) + Send + Sync>;

/// A local action handler.
pub type ActionHandler =
    Box<dyn Fn(&ServiceArgs) -> Result<serde_json::Value, String> + Send + Sync>;

// ── AsAny ───────────────────────────────────────────────────────────────

/// Upcast to `Any` so handles can recover a concrete service type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Service trait ───────────────────────────────────────────────────────

/// A named, independently scheduled unit hosted on the bus.
///
/// Producers return a [`poll_interval`](Service::poll_interval) and do their
/// work in [`poll`](Service::poll); consumers are driven purely by their
/// inbox. Both run on the service's own task.
pub trait Service: AsAny + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Period of the producer schedule. `None` means inbox-driven only.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// One round of periodic work.
    fn poll(&self) -> ServiceResult<()> {
        Ok(())
    }

    /// Tables this service publishes, if it can describe them.
    fn schema(&self) -> Option<Schema> {
        None
    }

    /// Local actions registered at construction.
    fn actions(&self) -> &ActionTable;

    /// Whether `action` is a registered local action.
    fn is_executable(&self, action: &str) -> bool {
        self.actions().contains(action)
    }

    /// Forward an action to the service's external API client.
    fn proxy_api(&self, action: &str, _args: &ServiceArgs) -> ServiceResult<serde_json::Value> {
        Err(ServiceError::UnknownAction {
            service: self.name().to_string(),
            action: action.to_string(),
        })
    }

    /// Run an action: local handler if one is registered, proxy otherwise.
    fn execute(&self, action: &str, args: &ServiceArgs) -> ServiceResult<serde_json::Value> {
        if self.is_executable(action) {
            self.actions().call(self.name(), action, args)
        } else {
            self.proxy_api(action, args)
        }
    }
}

// ── ActionTable ─────────────────────────────────────────────────────────

/// Explicit name → handler table, populated when a service is built.
#[derive(Default)]
pub struct ActionTable {
    handlers: HashMap<String, ActionHandler>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action, replacing any handler of the same name.
    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ServiceArgs) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn call(
        &self,
        service: &str,
        action: &str,
        args: &ServiceArgs,
    ) -> ServiceResult<serde_json::Value> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| ServiceError::UnknownAction {
                service: service.to_string(),
                action: action.to_string(),
            })?;
        handler(args).map_err(|message| ServiceError::ActionFailed {
            service: service.to_string(),
            action: action.to_string(),
            message,
        })
    }
}

impl fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTable")
            .field("actions", &self.names())
            .finish()
    }
}

// ── ServiceContext ──────────────────────────────────────────────────────

/// A service's view of the bus.
///
/// Holds the bus weakly: a service outliving its bus simply stops
/// publishing.
#[derive(Clone)]
pub struct ServiceContext {
    name: String,
    bus: Weak<BusInner>,
}

impl ServiceContext {
    pub(super) fn new(name: &str, bus: Weak<BusInner>) -> Self {
        Self {
            name: name.to_string(),
            bus,
        }
    }

    /// A context attached to no bus. Publishing reaches nobody.
    pub fn detached(name: &str) -> Self {
        Self::new(name, Weak::new())
    }

    /// Name the service was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish on `(self, table)`. Returns the number of inboxes reached.
    pub fn publish(&self, table: &str, payload: impl Into<Payload>) -> usize {
        match self.bus.upgrade() {
            Some(bus) => bus.publish(&self.name, table, payload.into()),
            None => 0,
        }
    }

    /// Look up another service by name.
    pub fn lookup(&self, name: &str) -> BusResult<ServiceHandle> {
        let bus = self.bus.upgrade().ok_or_else(|| BusError::UnknownService {
            name: name.to_string(),
        })?;
        bus.lookup(name)
    }

    /// Subscribe this service to `(publisher, table)`.
    pub fn subscribe(&self, publisher: &str, table: &str, callback: Callback) -> BusResult<bool> {
        let bus = self.bus.upgrade().ok_or_else(|| BusError::UnknownService {
            name: self.name.clone(),
        })?;
        bus.subscribe(&self.name, Channel::new(publisher, table), callback)
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .field("attached", &(self.bus.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_table_dispatch() {
        let table = ActionTable::new()
            .with("echo", |args| Ok(args.get("v").cloned().unwrap_or_default()))
            .with("fail", |_| Err("boom".into()));

        assert!(table.contains("echo"));
        assert!(!table.contains("reboot"));
        assert_eq!(table.names(), vec!["echo", "fail"]);

        let mut args = ServiceArgs::new();
        args.insert("v".into(), serde_json::json!(3));
        assert_eq!(table.call("svc", "echo", &args).unwrap(), serde_json::json!(3));

        assert!(matches!(
            table.call("svc", "fail", &args),
            Err(ServiceError::ActionFailed { .. })
        ));
        assert!(matches!(
            table.call("svc", "reboot", &args),
            Err(ServiceError::UnknownAction { .. })
        ));
    }

    struct Plain {
        actions: ActionTable,
    }

    impl Service for Plain {
        fn name(&self) -> &str {
            "plain"
        }
        fn actions(&self) -> &ActionTable {
            &self.actions
        }
    }

    #[test]
    fn execute_falls_back_to_proxy() {
        let svc = Plain {
            actions: ActionTable::new().with("local", |_| Ok(serde_json::json!("ok"))),
        };
        assert!(svc.is_executable("local"));
        assert_eq!(
            svc.execute("local", &ServiceArgs::new()).unwrap(),
            serde_json::json!("ok")
        );
        // Default proxy has no external client.
        assert!(matches!(
            svc.execute("servers.list", &ServiceArgs::new()),
            Err(ServiceError::UnknownAction { .. })
        ));
    }

    #[test]
    fn detached_context_publishes_nowhere() {
        let ctx = ServiceContext::detached("orphan");
        assert_eq!(ctx.publish("p", serde_json::json!(1)), 0);
        assert!(ctx.subscribe("x", "p", Arc::new(|_| {})).is_err());
        assert!(ctx.lookup("x").is_err());
    }
}
