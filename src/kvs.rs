//! The key-value store capability and its decoration chain.
//!
//! A typical chain is a [`MemoryKeyValueStore`] of raw bytes, wrapped by a
//! [`SubscriptionKeyValueStore`] that turns mutations into events, wrapped by
//! a [`TranslatingKeyValueStore`] that presents the bytes as strings. Events
//! are produced once, by the subscription layer, and re-published outward
//! through translation.

use crate::error::{EngineError, InvalidSubscriber, Result};
use crate::event::MapEvent;
use crate::subscription::{EventOrigin, SubscriptionRegistry};
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use twox_hash::XxHash64;

/// Bounds shared by every key type a store can hold.
pub trait StoreKey: Ord + Hash + Clone + Send + Sync + 'static {}
impl<T> StoreKey for T where T: Ord + Hash + Clone + Send + Sync + 'static {}

/// Bounds shared by every value type a store can hold.
pub trait StoreValue: Clone + Send + Sync + 'static {}
impl<T> StoreValue for T where T: Clone + Send + Sync + 'static {}

/// Consumers used by segmented walks. Returning [`InvalidSubscriber`] aborts
/// the walk of that segment.
pub type KeyConsumer<'a, K> = dyn FnMut(&K) -> Result<(), InvalidSubscriber> + 'a;
pub type EntryConsumer<'a, K, V> = dyn FnMut(MapEvent<K, V>) -> Result<(), InvalidSubscriber> + 'a;

pub trait KeyValueStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Returns `true` when an existing value was replaced.
    fn put(&self, key: K, value: V) -> Result<bool>;

    fn get_and_put(&self, key: K, value: V) -> Result<Option<V>>;

    /// Returns `true` when a value was removed.
    fn remove(&self, key: &K) -> Result<bool>;

    fn get_and_remove(&self, key: &K) -> Result<Option<V>>;

    fn clear(&self) -> Result<()>;

    fn long_size(&self) -> u64;

    /// Number of independently walkable segments.
    fn segments(&self) -> usize;

    fn keys_for(
        &self,
        segment: usize,
        consumer: &mut KeyConsumer<'_, K>,
    ) -> Result<(), InvalidSubscriber>;

    /// Walks one segment, presenting each entry as an insert event.
    fn entries_for(
        &self,
        segment: usize,
        consumer: &mut EntryConsumer<'_, K, V>,
    ) -> Result<(), InvalidSubscriber>;

    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn contains_value(&self, _value: &V) -> Result<bool> {
        Err(EngineError::Unsupported("contains_value"))
    }

    /// Applies a put that arrived through replication.
    fn replicated_put(&self, _key: K, _value: V) -> Result<()> {
        Err(EngineError::Unsupported("replicated_put"))
    }

    /// Applies a remove that arrived through replication.
    fn replicated_remove(&self, _key: &K) -> Result<()> {
        Err(EngineError::Unsupported("replicated_remove"))
    }

    /// The registry mutations are published to, if this store publishes any.
    fn subscription(&self) -> Option<Arc<SubscriptionRegistry<K, V>>> {
        None
    }

    fn close(&self) {}
}

/// In-memory leaf store. Keys are spread over a fixed number of ordered
/// segments by hash.
pub struct MemoryKeyValueStore<K, V> {
    segments: Vec<RwLock<BTreeMap<K, V>>>,
}

impl<K: StoreKey, V: StoreValue> MemoryKeyValueStore<K, V> {
    pub fn new(segments: usize) -> Self {
        let segments = segments.max(1);
        Self {
            segments: (0..segments).map(|_| RwLock::new(BTreeMap::new())).collect(),
        }
    }

    fn segment_for(&self, key: &K) -> &RwLock<BTreeMap<K, V>> {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.segments.len() as u64) as usize;
        &self.segments[index]
    }
}

impl<K: StoreKey, V: StoreValue> KeyValueStore<K, V> for MemoryKeyValueStore<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.segment_for(key).read().get(key).cloned()
    }

    fn put(&self, key: K, value: V) -> Result<bool> {
        Ok(self.segment_for(&key).write().insert(key, value).is_some())
    }

    fn get_and_put(&self, key: K, value: V) -> Result<Option<V>> {
        Ok(self.segment_for(&key).write().insert(key, value))
    }

    fn remove(&self, key: &K) -> Result<bool> {
        Ok(self.segment_for(key).write().remove(key).is_some())
    }

    fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self.segment_for(key).write().remove(key))
    }

    fn clear(&self) -> Result<()> {
        for segment in &self.segments {
            segment.write().clear();
        }
        Ok(())
    }

    fn long_size(&self) -> u64 {
        self.segments.iter().map(|s| s.read().len() as u64).sum()
    }

    fn segments(&self) -> usize {
        self.segments.len()
    }

    fn keys_for(
        &self,
        segment: usize,
        consumer: &mut KeyConsumer<'_, K>,
    ) -> Result<(), InvalidSubscriber> {
        let Some(segment) = self.segments.get(segment) else {
            return Ok(());
        };
        // Walk a copy so consumers may call back into the store.
        let keys: Vec<K> = segment.read().keys().cloned().collect();
        for key in &keys {
            consumer(key)?;
        }
        Ok(())
    }

    fn entries_for(
        &self,
        segment: usize,
        consumer: &mut EntryConsumer<'_, K, V>,
    ) -> Result<(), InvalidSubscriber> {
        let Some(segment) = self.segments.get(segment) else {
            return Ok(());
        };
        let entries: Vec<(K, V)> = segment
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, new_value) in entries {
            consumer(MapEvent::Insert { key, new_value })?;
        }
        Ok(())
    }

    fn replicated_put(&self, key: K, value: V) -> Result<()> {
        self.put(key, value).map(|_| ())
    }

    fn replicated_remove(&self, key: &K) -> Result<()> {
        self.remove(key).map(|_| ())
    }
}

/// Decorator that publishes every mutation of its delegate to a registry.
///
/// Mutations are serialized so each subscriber sees events in the order the
/// mutations were applied. The lock is re-entrant: a subscriber may mutate
/// the store it listens to.
pub struct SubscriptionKeyValueStore<K, V> {
    inner: Arc<dyn KeyValueStore<K, V>>,
    registry: Arc<SubscriptionRegistry<K, V>>,
    mutation: ReentrantMutex<()>,
}

impl<K: StoreKey, V: StoreValue> SubscriptionKeyValueStore<K, V> {
    pub fn new(
        inner: Arc<dyn KeyValueStore<K, V>>,
        registry: Arc<SubscriptionRegistry<K, V>>,
    ) -> Self {
        Self {
            inner,
            registry,
            mutation: ReentrantMutex::new(()),
        }
    }

    pub fn underlying(&self) -> &Arc<dyn KeyValueStore<K, V>> {
        &self.inner
    }

    fn put_from(&self, key: K, value: V, origin: EventOrigin) -> Result<Option<V>> {
        let _guard = self.mutation.lock();
        let old = self.inner.get_and_put(key.clone(), value.clone())?;
        self.registry
            .notify_event(&MapEvent::for_put(key, old.clone(), value), origin);
        Ok(old)
    }

    fn remove_from(&self, key: &K, origin: EventOrigin) -> Result<Option<V>> {
        let _guard = self.mutation.lock();
        let old = self.inner.get_and_remove(key)?;
        if let Some(old_value) = &old {
            self.registry.notify_event(
                &MapEvent::Remove {
                    key: key.clone(),
                    old_value: old_value.clone(),
                },
                origin,
            );
        }
        Ok(old)
    }
}

impl<K: StoreKey, V: StoreValue> KeyValueStore<K, V> for SubscriptionKeyValueStore<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    fn put(&self, key: K, value: V) -> Result<bool> {
        self.put_from(key, value, EventOrigin::Local)
            .map(|old| old.is_some())
    }

    fn get_and_put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_from(key, value, EventOrigin::Local)
    }

    fn remove(&self, key: &K) -> Result<bool> {
        self.remove_from(key, EventOrigin::Local)
            .map(|old| old.is_some())
    }

    fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        self.remove_from(key, EventOrigin::Local)
    }

    /// Removes entries one by one so subscribers see a remove per key.
    fn clear(&self) -> Result<()> {
        if !self.registry.has_listeners() {
            return self.inner.clear();
        }
        for segment in 0..self.inner.segments() {
            let mut keys = Vec::new();
            self.inner
                .keys_for(segment, &mut |key: &K| -> Result<(), InvalidSubscriber> {
                    keys.push(key.clone());
                    Ok(())
                })
                .map_err(EngineError::from)?;
            for key in keys {
                self.remove_from(&key, EventOrigin::Local)?;
            }
        }
        Ok(())
    }

    fn long_size(&self) -> u64 {
        self.inner.long_size()
    }

    fn segments(&self) -> usize {
        self.inner.segments()
    }

    fn keys_for(
        &self,
        segment: usize,
        consumer: &mut KeyConsumer<'_, K>,
    ) -> Result<(), InvalidSubscriber> {
        self.inner.keys_for(segment, consumer)
    }

    fn entries_for(
        &self,
        segment: usize,
        consumer: &mut EntryConsumer<'_, K, V>,
    ) -> Result<(), InvalidSubscriber> {
        self.inner.entries_for(segment, consumer)
    }

    fn contains_value(&self, value: &V) -> Result<bool> {
        self.inner.contains_value(value)
    }

    fn replicated_put(&self, key: K, value: V) -> Result<()> {
        self.put_from(key, value, EventOrigin::Replicated).map(|_| ())
    }

    fn replicated_remove(&self, key: &K) -> Result<()> {
        self.remove_from(key, EventOrigin::Replicated).map(|_| ())
    }

    fn subscription(&self) -> Option<Arc<SubscriptionRegistry<K, V>>> {
        Some(self.registry.clone())
    }

    fn close(&self) {
        self.registry.close();
        self.inner.close();
    }
}

pub type Converter<A, B> = Arc<dyn Fn(&A) -> B + Send + Sync>;

/// Decorator presenting a store of `IV` values as a store of `V` values.
///
/// Events from the delegate's registry are translated and re-published on
/// this store's own registry, so subscribers attach at whichever layer
/// matches the value type they want.
pub struct TranslatingKeyValueStore<K, V, IV> {
    inner: Arc<dyn KeyValueStore<K, IV>>,
    to_inner: Converter<V, IV>,
    from_inner: Converter<IV, V>,
    registry: Arc<SubscriptionRegistry<K, V>>,
}

impl<K, V, IV> TranslatingKeyValueStore<K, V, IV>
where
    K: StoreKey,
    V: StoreValue,
    IV: StoreValue,
{
    pub fn new(
        inner: Arc<dyn KeyValueStore<K, IV>>,
        registry: Arc<SubscriptionRegistry<K, V>>,
        to_inner: Converter<V, IV>,
        from_inner: Converter<IV, V>,
    ) -> Self {
        if let Some(raw) = inner.subscription() {
            let downstream = registry.clone();
            let convert = from_inner.clone();
            raw.register_downstream(Arc::new(move |event: &MapEvent<K, IV>, origin: EventOrigin| {
                downstream.notify_event(&event.translate(K::clone, |v| convert(v)), origin);
            }));
        }
        Self {
            inner,
            to_inner,
            from_inner,
            registry,
        }
    }

    pub fn underlying(&self) -> &Arc<dyn KeyValueStore<K, IV>> {
        &self.inner
    }
}

impl<K, V, IV> KeyValueStore<K, V> for TranslatingKeyValueStore<K, V, IV>
where
    K: StoreKey,
    V: StoreValue,
    IV: StoreValue,
{
    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| (self.from_inner)(&v))
    }

    fn put(&self, key: K, value: V) -> Result<bool> {
        self.inner.put(key, (self.to_inner)(&value))
    }

    fn get_and_put(&self, key: K, value: V) -> Result<Option<V>> {
        Ok(self
            .inner
            .get_and_put(key, (self.to_inner)(&value))?
            .map(|v| (self.from_inner)(&v)))
    }

    fn remove(&self, key: &K) -> Result<bool> {
        self.inner.remove(key)
    }

    fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self
            .inner
            .get_and_remove(key)?
            .map(|v| (self.from_inner)(&v)))
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    fn long_size(&self) -> u64 {
        self.inner.long_size()
    }

    fn segments(&self) -> usize {
        self.inner.segments()
    }

    fn keys_for(
        &self,
        segment: usize,
        consumer: &mut KeyConsumer<'_, K>,
    ) -> Result<(), InvalidSubscriber> {
        self.inner.keys_for(segment, consumer)
    }

    fn entries_for(
        &self,
        segment: usize,
        consumer: &mut EntryConsumer<'_, K, V>,
    ) -> Result<(), InvalidSubscriber> {
        let from_inner = &self.from_inner;
        self.inner.entries_for(segment, &mut |event: MapEvent<K, IV>| {
            consumer(event.translate(K::clone, |v| from_inner(v)))
        })
    }

    fn replicated_put(&self, key: K, value: V) -> Result<()> {
        self.inner.replicated_put(key, (self.to_inner)(&value))
    }

    fn replicated_remove(&self, key: &K) -> Result<()> {
        self.inner.replicated_remove(key)
    }

    fn subscription(&self) -> Option<Arc<SubscriptionRegistry<K, V>>> {
        Some(self.registry.clone())
    }

    fn close(&self) {
        self.registry.close();
        self.inner.close();
    }
}

/// Byte-to-string converters used by the string view over byte stores.
#[allow(clippy::ptr_arg)]
pub fn bytes_to_string(bytes: &Vec<u8>) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[allow(clippy::ptr_arg)]
pub fn string_to_bytes(s: &String) -> Vec<u8> {
    s.as_bytes().to_vec()
}
