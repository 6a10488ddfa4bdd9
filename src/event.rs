use serde::{Deserialize, Serialize};

/// A single mutation of a key-value store, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapEvent<K, V> {
    Insert { key: K, new_value: V },
    Update { key: K, old_value: V, new_value: V },
    Remove { key: K, old_value: V },
}

impl<K, V> MapEvent<K, V> {
    pub fn key(&self) -> &K {
        match self {
            MapEvent::Insert { key, .. }
            | MapEvent::Update { key, .. }
            | MapEvent::Remove { key, .. } => key,
        }
    }

    pub fn old_value(&self) -> Option<&V> {
        match self {
            MapEvent::Insert { .. } => None,
            MapEvent::Update { old_value, .. } | MapEvent::Remove { old_value, .. } => {
                Some(old_value)
            }
        }
    }

    pub fn new_value(&self) -> Option<&V> {
        match self {
            MapEvent::Insert { new_value, .. } | MapEvent::Update { new_value, .. } => {
                Some(new_value)
            }
            MapEvent::Remove { .. } => None,
        }
    }

    /// Builds the event a put produces, given the value it replaced.
    pub fn for_put(key: K, old_value: Option<V>, new_value: V) -> Self {
        match old_value {
            Some(old_value) => MapEvent::Update {
                key,
                old_value,
                new_value,
            },
            None => MapEvent::Insert { key, new_value },
        }
    }

    /// Re-types the key and values. The variant is never changed and the
    /// converters are only called on values the event actually carries.
    pub fn translate<K2, V2>(
        &self,
        key_fn: impl Fn(&K) -> K2,
        value_fn: impl Fn(&V) -> V2,
    ) -> MapEvent<K2, V2> {
        match self {
            MapEvent::Insert { key, new_value } => MapEvent::Insert {
                key: key_fn(key),
                new_value: value_fn(new_value),
            },
            MapEvent::Update {
                key,
                old_value,
                new_value,
            } => MapEvent::Update {
                key: key_fn(key),
                old_value: value_fn(old_value),
                new_value: value_fn(new_value),
            },
            MapEvent::Remove { key, old_value } => MapEvent::Remove {
                key: key_fn(key),
                old_value: value_fn(old_value),
            },
        }
    }

    pub fn apply(&self, listener: &dyn MapEventListener<K, V>) {
        match self {
            MapEvent::Insert { key, new_value } => listener.on_insert(key, new_value),
            MapEvent::Update {
                key,
                old_value,
                new_value,
            } => listener.on_update(key, old_value, new_value),
            MapEvent::Remove { key, old_value } => listener.on_remove(key, old_value),
        }
    }
}

/// Callback-style consumer of map events, see [`MapEvent::apply`].
pub trait MapEventListener<K, V> {
    fn on_insert(&self, key: &K, value: &V);
    fn on_update(&self, key: &K, old_value: &V, new_value: &V);
    fn on_remove(&self, key: &K, old_value: &V);
}
