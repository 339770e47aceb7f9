//! Process-wide service bus ("cage").
//!
//! The [`Bus`] maps service names to running services and routes published
//! payloads to subscribers. It is an explicit context object: clone it into
//! whatever needs it, there is no global instance.
//!
//! Each registered service gets one tokio task that drains its inbox and, for
//! producers, fires its poll timer. `publish` only enqueues, so it never
//! blocks; messages from one publisher to one subscriber arrive in the order
//! they were published. Nothing is ordered across channels.

pub mod factory;
pub mod service;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BusError, BusResult};
use crate::message::{Channel, Message, Payload};

pub use factory::{Factory, FactoryRegistry};
pub use service::{
    ActionHandler, ActionTable, AsAny, Callback, Service, ServiceArgs, ServiceContext,
};

/// A message queued for one subscriber, with the handler that consumes it.
struct Delivery {
    message: Message,
    callback: Callback,
}

struct Route {
    subscriber: String,
    callback: Callback,
}

struct ServiceRecord {
    service: Arc<dyn Service>,
    inbox: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
    subscriptions: BTreeSet<Channel>,
}

pub(crate) struct BusInner {
    services: DashMap<String, ServiceRecord>,
    routes: DashMap<Channel, Vec<Route>>,
    factories: FactoryRegistry,
}

impl BusInner {
    fn publish(&self, from: &str, table: &str, payload: Payload) -> usize {
        let channel = Channel::new(from, table);
        // Copy the route list out so no routes lock is held while touching
        // the service table.
        let routes: Vec<(String, Callback)> = match self.routes.get(&channel) {
            Some(routes) => routes
                .iter()
                .map(|r| (r.subscriber.clone(), Arc::clone(&r.callback)))
                .collect(),
            None => {
                tracing::trace!(channel = %channel, "publish with no subscribers");
                return 0;
            }
        };

        let message = Message::new(channel, payload);
        let mut reached = 0;
        for (subscriber, callback) in routes {
            let Some(record) = self.services.get(&subscriber) else {
                continue;
            };
            let delivery = Delivery {
                message: message.clone(),
                callback,
            };
            if record.inbox.send(delivery).is_ok() {
                reached += 1;
            } else {
                tracing::debug!(subscriber = %subscriber, "inbox closed, message dropped");
            }
        }
        tracing::trace!(message = %message, reached, "published");
        reached
    }

    /// Lock order is services, then routes. The record guard is held while
    /// the route is pushed so a concurrent `unregister` purges it.
    fn subscribe(&self, subscriber: &str, channel: Channel, callback: Callback) -> BusResult<bool> {
        let mut record =
            self.services
                .get_mut(subscriber)
                .ok_or_else(|| BusError::UnknownService {
                    name: subscriber.to_string(),
                })?;
        if !record.subscriptions.insert(channel.clone()) {
            return Ok(false);
        }
        tracing::debug!(subscriber, channel = %channel, "subscribed");
        self.routes.entry(channel).or_default().push(Route {
            subscriber: subscriber.to_string(),
            callback,
        });
        drop(record);
        Ok(true)
    }

    fn unsubscribe(&self, subscriber: &str, channel: &Channel) -> bool {
        let removed = self
            .services
            .get_mut(subscriber)
            .is_some_and(|mut record| record.subscriptions.remove(channel));
        if removed {
            if let Some(mut routes) = self.routes.get_mut(channel) {
                routes.retain(|r| r.subscriber != subscriber);
            }
            self.routes.remove_if(channel, |_, routes| routes.is_empty());
        }
        removed
    }

    fn lookup(&self, name: &str) -> BusResult<ServiceHandle> {
        self.services
            .get(name)
            .map(|record| ServiceHandle {
                name: name.to_string(),
                service: Arc::clone(&record.service),
                subscriptions: record.subscriptions.iter().cloned().collect(),
            })
            .ok_or_else(|| BusError::UnknownService {
                name: name.to_string(),
            })
    }

    fn purge_routes(&self, subscriber: &str) {
        self.routes.retain(|_, routes| {
            routes.retain(|r| r.subscriber != subscriber);
            !routes.is_empty()
        });
    }
}

// ── Bus ──────────────────────────────────────────────────────────────────

/// The service bus. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_factories(FactoryRegistry::new())
    }

    pub fn with_factories(factories: FactoryRegistry) -> Self {
        Self {
            inner: Arc::new(BusInner {
                services: DashMap::new(),
                routes: DashMap::new(),
                factories,
            }),
        }
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.inner.factories
    }

    /// Build a service with `factory` and start its task.
    ///
    /// Fails with [`BusError::DuplicateName`] if `name` is taken and with
    /// [`BusError::Initialization`] if the factory fails. A failed
    /// registration leaves nothing behind.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register<F>(&self, name: &str, factory: F, args: &ServiceArgs) -> BusResult<ServiceHandle>
    where
        F: FnOnce(ServiceContext, &ServiceArgs) -> Result<Arc<dyn Service>, String>,
    {
        if self.inner.services.contains_key(name) {
            return Err(BusError::DuplicateName {
                name: name.to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime {
            name: name.to_string(),
        })?;

        let ctx = ServiceContext::new(name, Arc::downgrade(&self.inner));
        let service = factory(ctx, args).map_err(|message| {
            tracing::warn!(service = name, error = %message, "service initialization failed");
            BusError::Initialization {
                name: name.to_string(),
                message,
            }
        })?;

        match self.inner.services.entry(name.to_string()) {
            // Lost a race with a concurrent registration of the same name.
            Entry::Occupied(_) => Err(BusError::DuplicateName {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                let (inbox, rx) = mpsc::unbounded_channel();
                let task = runtime.spawn(run_service(Arc::clone(&service), rx));
                slot.insert(ServiceRecord {
                    service: Arc::clone(&service),
                    inbox,
                    task,
                    subscriptions: BTreeSet::new(),
                });
                tracing::info!(service = name, "registered service");
                Ok(ServiceHandle {
                    name: name.to_string(),
                    service,
                    subscriptions: Vec::new(),
                })
            }
        }
    }

    /// Register a service built by the factory registered under `module`.
    pub fn create_service(
        &self,
        name: &str,
        module: &str,
        args: &ServiceArgs,
    ) -> BusResult<ServiceHandle> {
        let factory = self
            .inner
            .factories
            .get(module)
            .ok_or_else(|| BusError::UnknownModule {
                module: module.to_string(),
            })?;
        self.register(name, |ctx, args| factory(ctx, args), args)
    }

    pub fn lookup(&self, name: &str) -> BusResult<ServiceHandle> {
        self.inner.lookup(name)
    }

    /// Enqueue `payload` for every subscriber of `(from, table)`.
    ///
    /// Returns how many inboxes received it. No subscribers is not an error.
    pub fn publish(&self, from: &str, table: &str, payload: impl Into<Payload>) -> usize {
        self.inner.publish(from, table, payload.into())
    }

    /// Route `(publisher, table)` to `subscriber`'s inbox, handled by
    /// `callback`. Returns `false` if the subscription already existed, in
    /// which case nothing changes.
    pub fn subscribe(
        &self,
        subscriber: &str,
        publisher: &str,
        table: &str,
        callback: Callback,
    ) -> BusResult<bool> {
        self.inner
            .subscribe(subscriber, Channel::new(publisher, table), callback)
    }

    pub fn unsubscribe(&self, subscriber: &str, publisher: &str, table: &str) -> bool {
        self.inner
            .unsubscribe(subscriber, &Channel::new(publisher, table))
    }

    /// Channels `name` is subscribed to.
    pub fn subscriptions(&self, name: &str) -> BusResult<Vec<Channel>> {
        self.inner
            .services
            .get(name)
            .map(|r| r.subscriptions.iter().cloned().collect())
            .ok_or_else(|| BusError::UnknownService {
                name: name.to_string(),
            })
    }

    /// Run a named action on a service.
    pub fn invoke(
        &self,
        service: &str,
        action: &str,
        args: &ServiceArgs,
    ) -> BusResult<serde_json::Value> {
        let handle = self.lookup(service)?;
        Ok(handle.service().execute(action, args)?)
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Tear a service down.
    ///
    /// The service stops receiving immediately; messages already in its
    /// inbox are still handled before its task exits.
    pub async fn unregister(&self, name: &str) -> BusResult<()> {
        let (_, record) =
            self.inner
                .services
                .remove(name)
                .ok_or_else(|| BusError::UnknownService {
                    name: name.to_string(),
                })?;
        self.inner.purge_routes(name);

        let ServiceRecord { inbox, task, .. } = record;
        drop(inbox);
        if let Err(e) = task.await {
            tracing::warn!(service = name, error = %e, "service task ended abnormally");
        }
        tracing::info!(service = name, "unregistered service");
        Ok(())
    }

    /// Tear down every service.
    pub async fn shutdown(&self) {
        for name in self.services() {
            // Already gone if a concurrent caller removed it.
            let _ = self.unregister(&name).await;
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("services", &self.services())
            .field("channels", &self.inner.routes.len())
            .finish()
    }
}

// ── ServiceHandle ────────────────────────────────────────────────────────

/// A looked-up service.
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    service: Arc<dyn Service>,
    subscriptions: Vec<Channel>,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Channels the service was subscribed to when it was looked up.
    pub fn subscriptions(&self) -> &[Channel] {
        &self.subscriptions
    }

    /// Borrow the concrete service type.
    pub fn downcast_ref<T: Service>(&self) -> Option<&T> {
        AsAny::as_any(&*self.service).downcast_ref::<T>()
    }

    /// Clone out the concrete service; useful for handle-style services.
    pub fn downcast<T: Service + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

// ── Service task ─────────────────────────────────────────────────────────

async fn run_service(service: Arc<dyn Service>, mut inbox: mpsc::UnboundedReceiver<Delivery>) {
    let name = service.name().to_string();
    match service.poll_interval() {
        Some(period) => {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    delivery = inbox.recv() => match delivery {
                        Some(d) => (d.callback)(d.message),
                        None => break,
                    },
                    _ = tick.tick() => {
                        if let Err(e) = service.poll() {
                            tracing::warn!(service = %name, error = %e, "poll failed, continuing");
                        }
                    }
                }
            }
        }
        None => {
            while let Some(d) = inbox.recv().await {
                (d.callback)(d.message);
            }
        }
    }
    tracing::debug!(service = %name, "service task stopped");
}
