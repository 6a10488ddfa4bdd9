//! Per-store subscriber bookkeeping and event fan-out.
//!
//! A registry holds topic subscribers (every event), key subscribers (events
//! for one key) and downstream hooks (outer store layers re-publishing
//! translated events). Delivery is synchronous on the mutating thread and
//! happens without holding the registry lock, so subscribers may register or
//! unregister while an event is being fanned out.

use crate::error::InvalidSubscriber;
use crate::event::MapEvent;
use crate::types::SubscriberId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub trait Subscriber<E>: Send + Sync {
    /// Returning [`InvalidSubscriber`] removes this subscriber from all
    /// future deliveries.
    fn on_message(&self, event: &E) -> Result<(), InvalidSubscriber>;

    fn on_end_of_subscription(&self) {}
}

impl<E, F> Subscriber<E> for F
where
    F: Fn(&E) -> Result<(), InvalidSubscriber> + Send + Sync,
{
    fn on_message(&self, event: &E) -> Result<(), InvalidSubscriber> {
        self(event)
    }
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Issued through the store's public mutation entry points.
    Local,
    /// Applied from another host's replication log.
    Replicated,
}

/// Which origins a subscriber wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    All,
    /// Skips [`EventOrigin::Replicated`] events; used by replication hooks so
    /// applied events are not shipped again.
    LocalOnly,
}

impl Delivery {
    fn accepts(self, origin: EventOrigin) -> bool {
        match self {
            Delivery::All => true,
            Delivery::LocalOnly => origin == EventOrigin::Local,
        }
    }
}

pub type DownstreamHook<K, V> = Arc<dyn Fn(&MapEvent<K, V>, EventOrigin) + Send + Sync>;

struct Registration<K, V> {
    id: SubscriberId,
    delivery: Delivery,
    subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
}

impl<K, V> Clone for Registration<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            delivery: self.delivery,
            subscriber: self.subscriber.clone(),
        }
    }
}

struct Inner<K, V> {
    topic: Vec<Registration<K, V>>,
    keyed: HashMap<K, Vec<Registration<K, V>>>,
    /// Reverse index for unregistering by id; `None` marks a topic subscriber.
    scopes: HashMap<SubscriberId, Option<K>>,
    downstream: Vec<DownstreamHook<K, V>>,
}

pub struct SubscriptionRegistry<K, V> {
    inner: RwLock<Inner<K, V>>,
    next_id: AtomicU64,
}

impl<K, V> Default for SubscriptionRegistry<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SubscriptionRegistry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                topic: Vec::new(),
                keyed: HashMap::new(),
                scopes: HashMap::new(),
                downstream: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a subscriber for every event. Registering the same
    /// subscriber twice yields two independent deliveries.
    pub fn register_topic_subscriber(
        &self,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
    ) -> SubscriberId {
        self.register_topic_subscriber_with(subscriber, Delivery::All)
    }

    pub fn register_topic_subscriber_with(
        &self,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
        delivery: Delivery,
    ) -> SubscriberId {
        let id = self.alloc_id();
        let mut inner = self.inner.write();
        inner.topic.push(Registration {
            id,
            delivery,
            subscriber,
        });
        inner.scopes.insert(id, None);
        trace!(id, "registered topic subscriber");
        id
    }

    /// Registers a subscriber for events whose key equals `key`.
    pub fn register_key_subscriber(
        &self,
        key: K,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
    ) -> SubscriberId {
        let id = self.alloc_id();
        let mut inner = self.inner.write();
        inner.keyed.entry(key.clone()).or_default().push(Registration {
            id,
            delivery: Delivery::All,
            subscriber,
        });
        inner.scopes.insert(id, Some(key));
        trace!(id, "registered key subscriber");
        id
    }

    /// Adds a hook run before subscribers for every event.
    pub fn register_downstream(&self, hook: DownstreamHook<K, V>) {
        self.inner.write().downstream.push(hook);
    }

    /// Removes a subscriber and ends its subscription. Unknown ids are
    /// ignored.
    pub fn unregister_subscriber(&self, id: SubscriberId) -> bool {
        let removed = self.remove(id);
        match removed {
            Some(registration) => {
                registration.subscriber.on_end_of_subscription();
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: SubscriberId) -> Option<Registration<K, V>> {
        let mut inner = self.inner.write();
        let scope = inner.scopes.remove(&id)?;
        match scope {
            None => {
                let pos = inner.topic.iter().position(|r| r.id == id)?;
                Some(inner.topic.remove(pos))
            }
            Some(key) => {
                let registrations = inner.keyed.get_mut(&key)?;
                let pos = registrations.iter().position(|r| r.id == id)?;
                let registration = registrations.remove(pos);
                if registrations.is_empty() {
                    inner.keyed.remove(&key);
                }
                Some(registration)
            }
        }
    }

    /// Delivers one event to downstream hooks and then to every matching
    /// subscriber in registration order. Subscribers that report themselves
    /// invalid are dropped.
    pub fn notify_event(&self, event: &MapEvent<K, V>, origin: EventOrigin) {
        let (downstream, mut targets) = {
            let inner = self.inner.read();
            let mut targets: Vec<Registration<K, V>> = inner
                .topic
                .iter()
                .filter(|r| r.delivery.accepts(origin))
                .cloned()
                .collect();
            if let Some(keyed) = inner.keyed.get(event.key()) {
                targets.extend(keyed.iter().filter(|r| r.delivery.accepts(origin)).cloned());
            }
            (inner.downstream.clone(), targets)
        };

        for hook in &downstream {
            hook(event, origin);
        }

        targets.sort_by_key(|r| r.id);
        for registration in targets {
            if registration.subscriber.on_message(event).is_err() {
                debug!(id = registration.id, "dropping invalid subscriber");
                self.remove(registration.id);
            }
        }
    }

    pub fn topic_subscriber_count(&self) -> usize {
        self.inner.read().topic.len()
    }

    pub fn key_subscriber_count(&self) -> usize {
        self.inner.read().keyed.values().map(Vec::len).sum()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.inner.read().scopes.is_empty()
    }

    /// Whether any subscriber or downstream hook would observe an event.
    pub fn has_listeners(&self) -> bool {
        let inner = self.inner.read();
        !inner.scopes.is_empty() || !inner.downstream.is_empty()
    }

    /// Ends every subscription and drops downstream hooks.
    pub fn close(&self) {
        let registrations: Vec<Registration<K, V>> = {
            let mut inner = self.inner.write();
            inner.scopes.clear();
            inner.downstream.clear();
            let mut all: Vec<_> = inner.topic.drain(..).collect();
            all.extend(inner.keyed.drain().flat_map(|(_, regs)| regs));
            all
        };
        for registration in registrations {
            registration.subscriber.on_end_of_subscription();
        }
    }
}

impl<K, V> crate::asset::Closeable for SubscriptionRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    fn close(&self) {
        SubscriptionRegistry::close(self);
    }
}
