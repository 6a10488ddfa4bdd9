//! Application-facing views built on a key-value store.

use crate::error::{EngineError, InvalidSubscriber, Result};
use crate::event::MapEvent;
use crate::kvs::{KeyValueStore, StoreKey, StoreValue};
use crate::request_context::RequestContext;
use crate::subscription::{Delivery, Subscriber, SubscriptionRegistry};
use crate::types::SubscriberId;
use std::sync::Arc;

/// Map-like view over a store.
///
/// `put_returns_null` / `remove_returns_null` make [`MapView::get_and_put`]
/// and [`MapView::get_and_remove`] skip fetching the previous value.
pub struct MapView<K, V> {
    store: Arc<dyn KeyValueStore<K, V>>,
    put_returns_null: bool,
    remove_returns_null: bool,
}

impl<K: StoreKey, V: StoreValue> MapView<K, V> {
    pub fn new(store: Arc<dyn KeyValueStore<K, V>>, context: &RequestContext) -> Self {
        Self {
            store,
            put_returns_null: context.put_returns_null(),
            remove_returns_null: context.remove_returns_null(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.store.get(key)
    }

    /// Returns `true` when an existing value was replaced.
    pub fn put(&self, key: K, value: V) -> Result<bool> {
        self.store.put(key, value)
    }

    pub fn get_and_put(&self, key: K, value: V) -> Result<Option<V>> {
        if self.put_returns_null {
            self.store.put(key, value)?;
            return Ok(None);
        }
        self.store.get_and_put(key, value)
    }

    pub fn remove(&self, key: &K) -> Result<bool> {
        self.store.remove(key)
    }

    pub fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        if self.remove_returns_null {
            self.store.remove(key)?;
            return Ok(None);
        }
        self.store.get_and_remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.store.contains_key(key)
    }

    pub fn contains_value(&self, value: &V) -> Result<bool> {
        self.store.contains_value(value)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    pub fn size(&self) -> usize {
        self.store.long_size() as usize
    }

    pub fn long_size(&self) -> u64 {
        self.store.long_size()
    }

    pub fn is_empty(&self) -> bool {
        self.store.long_size() == 0
    }

    /// All entries, segment by segment. Within a segment keys are ordered.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut entries = Vec::with_capacity(self.size());
        let mut collect = |event: MapEvent<K, V>| -> Result<(), InvalidSubscriber> {
            if let MapEvent::Insert { key, new_value } = event {
                entries.push((key, new_value));
            }
            Ok(())
        };
        for segment in 0..self.store.segments() {
            // The consumer never rejects, so the walk cannot fail.
            let _ = self.store.entries_for(segment, &mut collect);
        }
        entries
    }

    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.size());
        let mut collect = |key: &K| -> Result<(), InvalidSubscriber> {
            keys.push(key.clone());
            Ok(())
        };
        for segment in 0..self.store.segments() {
            let _ = self.store.keys_for(segment, &mut collect);
        }
        keys
    }

    pub fn subscription(&self) -> Result<Arc<SubscriptionRegistry<K, V>>> {
        self.store
            .subscription()
            .ok_or(EngineError::Unsupported("subscription"))
    }

    pub fn register_subscriber(
        &self,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
    ) -> Result<SubscriberId> {
        Ok(self.subscription()?.register_topic_subscriber(subscriber))
    }

    pub fn register_key_subscriber(
        &self,
        key: K,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
    ) -> Result<SubscriberId> {
        Ok(self.subscription()?.register_key_subscriber(key, subscriber))
    }

    pub fn unregister_subscriber(&self, id: SubscriberId) -> bool {
        self.store
            .subscription()
            .is_some_and(|registry| registry.unregister_subscriber(id))
    }

    pub fn replicated_put(&self, key: K, value: V) -> Result<()> {
        self.store.replicated_put(key, value)
    }

    pub fn replicated_remove(&self, key: &K) -> Result<()> {
        self.store.replicated_remove(key)
    }

    pub fn underlying(&self) -> &Arc<dyn KeyValueStore<K, V>> {
        &self.store
    }
}

pub trait TopicSubscriber<T, M>: Send + Sync {
    fn on_message(&self, topic: &T, message: &M) -> Result<(), InvalidSubscriber>;
}

impl<T, M, F> TopicSubscriber<T, M> for F
where
    F: Fn(&T, &M) -> Result<(), InvalidSubscriber> + Send + Sync,
{
    fn on_message(&self, topic: &T, message: &M) -> Result<(), InvalidSubscriber> {
        self(topic, message)
    }
}

/// Publishes messages under topics. Each topic holds its last message.
pub struct TopicPublisher<T, M> {
    map: Arc<MapView<T, M>>,
}

impl<T: StoreKey, M: StoreValue> TopicPublisher<T, M> {
    pub fn new(map: Arc<MapView<T, M>>) -> Self {
        Self { map }
    }

    pub fn publish(&self, topic: T, message: M) -> Result<()> {
        self.map.put(topic, message).map(|_| ())
    }

    pub fn last_message(&self, topic: &T) -> Option<M> {
        self.map.get(topic)
    }

    /// Subscribers see every published message; removals are not messages.
    pub fn register_topic_subscriber(
        &self,
        subscriber: Arc<dyn TopicSubscriber<T, M>>,
    ) -> Result<SubscriberId> {
        let registry = self.map.subscription()?;
        let adapter = move |event: &MapEvent<T, M>| -> Result<(), InvalidSubscriber> {
            match event.new_value() {
                Some(message) => subscriber.on_message(event.key(), message),
                None => Ok(()),
            }
        };
        Ok(registry.register_topic_subscriber_with(Arc::new(adapter), Delivery::All))
    }

    pub fn unregister_topic_subscriber(&self, id: SubscriberId) -> bool {
        self.map.unregister_subscriber(id)
    }
}
