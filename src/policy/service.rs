//! The policy engine as a bus service.
//!
//! [`PolicyEngine`] owns a [`Runtime`] behind a read/write lock. Data and
//! policy updates arrive on the engine's inbox task and are applied under
//! the write lock, one message at a time; `select` takes the read lock, so
//! a query never observes a half-applied event.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::bus::{ActionTable, Callback, Service, ServiceArgs, ServiceContext};
use crate::compile::{parse_formula, parse_query};
use crate::error::{BusResult, CageResult};
use crate::formula::{Action, Event, Formula, Query};
use crate::message::{Message, POLICY_UPDATE, Payload};
use crate::schema::{Schema, TableSchema};
use crate::value::Tuple;

use super::error::PolicyResult;
use super::incremental::{DEFAULT_POLICY, Runtime};
use super::store::{PolicyState, Rejection, Relation, UpdateReport};

/// Outcome of the most recent policy-update batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChange {
    /// Events that changed a policy, in application order.
    pub applied: Vec<Event>,
    /// Events refused, with the reason.
    pub rejected: Vec<(Event, String)>,
}

impl PolicyChange {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.rejected.is_empty()
    }
}

struct EngineInner {
    ctx: ServiceContext,
    runtime: RwLock<Runtime>,
    last_change: Mutex<Option<PolicyChange>>,
    last_message: Mutex<Option<Message>>,
    actions: ActionTable,
}

/// Incremental policy engine service. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PolicyEngine {
    inner: Arc<EngineInner>,
}

impl PolicyEngine {
    pub fn new(ctx: ServiceContext) -> Self {
        Self::with_default_policy(ctx, DEFAULT_POLICY)
    }

    pub fn with_default_policy(ctx: ServiceContext, default_policy: &str) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| EngineInner {
            ctx,
            runtime: RwLock::new(Runtime::with_default_policy(default_policy)),
            last_change: Mutex::new(None),
            last_message: Mutex::new(None),
            actions: build_actions(weak.clone()),
        });
        Self { inner }
    }

    /// Factory for the bus registry. Accepts an optional `default_policy`
    /// string argument.
    pub fn factory()
    -> impl Fn(ServiceContext, &ServiceArgs) -> Result<Arc<dyn Service>, String> + Send + Sync + 'static
    {
        |ctx, args| {
            let default_policy = match args.get("default_policy") {
                None => DEFAULT_POLICY,
                Some(serde_json::Value::String(name)) => name.as_str(),
                Some(other) => return Err(format!("default_policy must be a string, got {other}")),
            };
            Ok(Arc::new(Self::with_default_policy(ctx, default_policy)) as Arc<dyn Service>)
        }
    }

    fn from_weak(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn read<R>(&self, f: impl FnOnce(&Runtime) -> R) -> R {
        let runtime = self.inner.runtime.read().expect("runtime lock poisoned");
        f(&runtime)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Runtime) -> R) -> R {
        let mut runtime = self.inner.runtime.write().expect("runtime lock poisoned");
        f(&mut runtime)
    }

    /// Run `f` against a consistent view of every policy.
    pub fn inspect<R>(&self, f: impl FnOnce(&Runtime) -> R) -> R {
        self.read(f)
    }

    pub fn default_policy(&self) -> String {
        self.read(|rt| rt.default_policy().to_string())
    }

    // ── Policies and schemas ──────────────────────────────────────────────

    pub fn create_policy(&self, name: &str) -> PolicyResult<()> {
        self.write(|rt| rt.create_policy(name))
    }

    pub fn delete_policy(&self, name: &str) -> PolicyResult<()> {
        self.write(|rt| rt.delete_policy(name))
    }

    pub fn policies(&self) -> Vec<String> {
        self.read(|rt| rt.policy_names().map(str::to_string).collect())
    }

    pub fn set_schema(&self, policy: &str, table: &str, schema: TableSchema) -> PolicyResult<()> {
        self.write(|rt| rt.set_schema(policy, table, schema))
    }

    pub fn bind_schema(&self, policy: &str, schema: &Schema) -> PolicyResult<()> {
        self.write(|rt| rt.bind_schema(policy, schema))
    }

    pub fn policy_state(&self, policy: &str) -> Option<PolicyState> {
        self.read(|rt| rt.policy(policy).map(|p| p.state()))
    }

    pub fn rejections(&self, policy: &str) -> Vec<Rejection> {
        self.read(|rt| {
            rt.policy(policy)
                .map(|p| p.rejections().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Last accepted snapshot of an external table.
    pub fn snapshot(&self, policy: &str, table: &str) -> Option<Relation> {
        self.read(|rt| rt.policy(policy).and_then(|p| p.snapshot(table).cloned()))
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Consume `publisher`'s `table` into the policy named after the
    /// publisher, creating that policy if needed. If the publisher exports
    /// a schema for the table, it is bound before any data arrives.
    pub fn subscribe(&self, publisher: &str, table: &str) -> CageResult<bool> {
        self.bind_source(publisher, table)?;

        let weak = Arc::downgrade(&self.inner);
        let callback: Callback = Arc::new(move |msg| {
            if let Some(engine) = Self::from_weak(&weak) {
                engine.receive_data(msg);
            }
        });
        Ok(self.inner.ctx.subscribe(publisher, table, callback)?)
    }

    /// Create the publisher's policy and bind the table's exported schema,
    /// without routing any data yet.
    fn bind_source(&self, publisher: &str, table: &str) -> PolicyResult<()> {
        let exported = self
            .inner
            .ctx
            .lookup(publisher)
            .ok()
            .and_then(|handle| handle.service().schema())
            .and_then(|schema| schema.get(table).cloned());

        self.write(|rt| -> PolicyResult<()> {
            if !rt.contains_policy(publisher) {
                rt.create_policy(publisher)?;
            }
            if let Some(decl) = exported {
                rt.set_schema(publisher, table, decl)?;
            }
            Ok(())
        })
    }

    /// Receive rule and fact events published by `publisher` on the
    /// `policy-update` channel.
    pub fn subscribe_policy_updates(&self, publisher: &str) -> BusResult<bool> {
        let weak = Arc::downgrade(&self.inner);
        let callback: Callback = Arc::new(move |msg| {
            if let Some(engine) = Self::from_weak(&weak) {
                engine.receive_policy_update(msg);
            }
        });
        self.inner.ctx.subscribe(publisher, POLICY_UPDATE, callback)
    }

    // ── Inbox handlers ────────────────────────────────────────────────────

    /// Apply data from a source to the policy named after its publisher.
    pub fn receive_data(&self, msg: Message) {
        self.remember(&msg);
        let policy = msg.publisher().to_string();
        match &msg.body {
            Payload::Snapshot(rows) => {
                let result = self.write(|rt| -> PolicyResult<UpdateReport> {
                    if !rt.contains_policy(&policy) {
                        rt.create_policy(&policy)?;
                    }
                    rt.receive_update(&policy, msg.table(), rows)
                });
                if let Err(e) = result {
                    tracing::warn!(message = %msg, error = %e, "snapshot refused");
                }
            }
            Payload::Events(events) => {
                self.write(|rt| {
                    for event in events {
                        if let Err(e) = rt.apply_event(&policy, event) {
                            tracing::warn!(policy = %policy, event = %event, error = %e, "data event refused");
                        }
                    }
                });
            }
            Payload::Raw(_) => {
                tracing::debug!(message = %msg, "ignoring raw payload on data channel");
            }
        }
    }

    /// Apply a batch of policy updates strictly in order. Each event sees
    /// the effect of the ones before it.
    pub fn receive_policy_update(&self, msg: Message) {
        self.remember(&msg);
        let Payload::Events(events) = &msg.body else {
            tracing::warn!(message = %msg, "policy update without events ignored");
            return;
        };
        let change = self.apply_batch(events);
        *self.inner.last_change.lock().expect("change lock poisoned") = Some(change);
    }

    /// Apply events in order, subscribing to any bus service a rule reads
    /// from before inserting it. Refused events do not stop the batch.
    pub fn apply_batch(&self, events: &[Event]) -> PolicyChange {
        let mut change = PolicyChange::default();
        for event in events {
            let sources = self.prepare_sources(event);
            let default = self.default_policy();
            match self.write(|rt| rt.apply_event(&default, event)) {
                Ok(_) => {
                    for (publisher, table) in sources {
                        if let Err(e) = self.subscribe(&publisher, &table) {
                            tracing::warn!(publisher = %publisher, table = %table, error = %e, "auto-subscribe failed");
                        }
                    }
                    change.applied.push(event.clone());
                }
                Err(e) => {
                    tracing::warn!(event = %event, error = %e, "policy update refused");
                    change.rejected.push((event.clone(), e.to_string()));
                }
            }
        }
        tracing::info!(
            applied = change.applied.len(),
            rejected = change.rejected.len(),
            "policy update applied"
        );
        change
    }

    /// Before inserting a rule, bind every table it reads from another
    /// policy that names a service on the bus. Returns the channels to
    /// subscribe once the rule is accepted.
    fn prepare_sources(&self, event: &Event) -> Vec<(String, String)> {
        let (Action::Insert, Formula::Rule(rule)) = (event.action, &event.formula) else {
            return Vec::new();
        };
        let own = event.target.clone().unwrap_or_else(|| self.default_policy());
        let mut sources = Vec::new();
        for atom in &rule.body {
            let Some(theory) = atom.theory.as_deref() else {
                continue;
            };
            if theory == own || theory == self.name() || self.inner.ctx.lookup(theory).is_err() {
                continue;
            }
            match self.bind_source(theory, &atom.table) {
                Ok(()) => sources.push((theory.to_string(), atom.table.clone())),
                Err(e) => {
                    tracing::warn!(publisher = theory, table = %atom.table, error = %e, "source schema refused");
                }
            }
        }
        sources
    }

    fn remember(&self, msg: &Message) {
        *self.inner.last_message.lock().expect("message lock poisoned") = Some(msg.clone());
    }

    /// Most recent message handed to the engine, of any kind.
    pub fn last_message(&self) -> Option<Message> {
        self.inner
            .last_message
            .lock()
            .expect("message lock poisoned")
            .clone()
    }

    pub fn last_policy_change(&self) -> Option<PolicyChange> {
        self.inner
            .last_change
            .lock()
            .expect("change lock poisoned")
            .clone()
    }

    // ── Direct API ────────────────────────────────────────────────────────

    /// Apply one event to the default policy (or the event's target).
    pub fn apply_event(&self, event: &Event) -> PolicyResult<bool> {
        self.write(|rt| {
            let default = rt.default_policy().to_string();
            rt.apply_event(&default, event)
        })
    }

    pub fn select(&self, policy: &str, query: &Query) -> PolicyResult<BTreeSet<Tuple>> {
        self.read(|rt| rt.select(policy, query))
    }

    /// Parse and evaluate a query.
    pub fn select_text(&self, policy: &str, text: &str) -> PolicyResult<BTreeSet<Tuple>> {
        let query = parse_query(text)?;
        self.select(policy, &query)
    }
}

impl Service for PolicyEngine {
    fn name(&self) -> &str {
        self.inner.ctx.name()
    }

    fn actions(&self) -> &ActionTable {
        &self.inner.actions
    }
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("name", &self.inner.ctx.name())
            .field("policies", &self.policies())
            .finish()
    }
}

// ── Actions ───────────────────────────────────────────────────────────────

fn build_actions(weak: Weak<EngineInner>) -> ActionTable {
    let select = weak.clone();
    let insert = weak.clone();
    let delete = weak.clone();
    let policies = weak;
    ActionTable::new()
        .with("select", move |args| {
            let engine = PolicyEngine::from_weak(&select).ok_or("engine stopped")?;
            let policy = policy_arg(&engine, args)?;
            let text = str_arg(args, "query")?;
            let rows = engine
                .select_text(&policy, text)
                .map_err(|e| e.to_string())?;
            serde_json::to_value(rows).map_err(|e| e.to_string())
        })
        .with("insert", move |args| {
            formula_action(&insert, args, Action::Insert)
        })
        .with("delete", move |args| {
            formula_action(&delete, args, Action::Delete)
        })
        .with("policies", move |_| {
            let engine = PolicyEngine::from_weak(&policies).ok_or("engine stopped")?;
            Ok(serde_json::json!(engine.policies()))
        })
}

fn formula_action(
    weak: &Weak<EngineInner>,
    args: &ServiceArgs,
    action: Action,
) -> Result<serde_json::Value, String> {
    let engine = PolicyEngine::from_weak(weak).ok_or("engine stopped")?;
    let policy = policy_arg(&engine, args)?;
    let formula = parse_formula(str_arg(args, "formula")?).map_err(|e| e.to_string())?;
    let event = Event::new(action, formula).for_policy(policy);
    let changed = engine.apply_event(&event).map_err(|e| e.to_string())?;
    Ok(serde_json::Value::Bool(changed))
}

fn str_arg<'a>(args: &'a ServiceArgs, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| format!("missing string argument \"{key}\""))
}

fn policy_arg(engine: &PolicyEngine, args: &ServiceArgs) -> Result<String, String> {
    match args.get("policy") {
        None => Ok(engine.default_policy()),
        Some(_) => str_arg(args, "policy").map(str::to_string),
    }
}
