//! The asset tree: a root asset carrying the standard rules and the
//! tree-wide views (event loop, cluster configuration).

use crate::asset::Asset;
use crate::config::{ClusterConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::event::MapEvent;
use crate::event_loop::EventLoop;
use crate::kvs::{
    bytes_to_string, string_to_bytes, KeyValueStore, MemoryKeyValueStore, StoreKey, StoreValue,
    SubscriptionKeyValueStore, TranslatingKeyValueStore,
};
use crate::log::{AppendLog, MemoryAppendLog, QueueView};
use crate::map_view::{MapView, TopicPublisher};
use crate::replication::MapReplicator;
use crate::request_context::{ElementType, RequestContext, ViewType};
use crate::subscription::{Subscriber, SubscriptionRegistry};
use crate::types::{HostId, SubscriberId};
use crate::wal::FileAppendLog;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Settings shared by every asset of a tree.
#[derive(Debug)]
pub struct EngineContext {
    config: EngineConfig,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host_id(&self) -> HostId {
        self.config.host_id
    }
}

pub struct AssetTree {
    root: Arc<Asset>,
    context: Arc<EngineContext>,
    event_loop: Arc<EventLoop>,
    /// `(K, V)` pairs whose map rules are installed on the root.
    installed: Mutex<HashSet<TypeId>>,
}

impl AssetTree {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(format!("{e:#}")))?;
        let context = Arc::new(EngineContext::new(config));
        let root = Asset::new_root(context.clone());
        let event_loop = Arc::new(EventLoop::new(Duration::from_millis(
            context.config().event_loop_pause_ms,
        )));
        root.add_view(event_loop.clone());
        root.add_view(Arc::new(context.config().cluster.clone()));

        let tree = Self {
            root,
            context,
            event_loop,
            installed: Mutex::new(HashSet::new()),
        };
        tree.install_queue_rule();
        tree.ensure_map_rules::<String, Vec<u8>>();
        tree.install_string_rules();
        tree.ensure_map_rules::<String, String>();
        info!(host_id = tree.context.host_id(), "asset tree created");
        Ok(tree)
    }

    pub fn root(&self) -> &Arc<Asset> {
        &self.root
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn cluster(&self) -> Option<Arc<ClusterConfig>> {
        self.root.get_view::<Arc<ClusterConfig>>()
    }

    pub fn acquire_asset(&self, path: &str) -> Arc<Asset> {
        self.root.acquire_asset(path)
    }

    /// Resolves view `C` at the asset named by `uri`.
    pub fn acquire_view<C>(&self, uri: &str) -> Result<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        let rc = RequestContext::parse(uri);
        self.root
            .acquire_asset(&rc.full_name())
            .acquire_view_with::<C>(&rc)
    }

    /// Like [`AssetTree::acquire_view`], but first checks the `view`,
    /// `keyType` and `valueType` keys of `uri` against what `C` holds.
    fn acquire_typed<C, K, V>(&self, uri: &str, accepted: &[ViewType]) -> Result<C>
    where
        C: Clone + Send + Sync + 'static,
        K: 'static,
        V: 'static,
    {
        let rc = RequestContext::parse(uri);
        if let Some(view_type) = rc.view_type {
            if !accepted.contains(&view_type) {
                return Err(EngineError::CapabilityNotFound {
                    capability: type_name::<C>(),
                    path: rc.full_name(),
                });
            }
        }
        check_element::<K>(rc.key_type.as_ref())?;
        check_element::<V>(rc.value_type.as_ref())?;
        self.acquire_view(uri)
    }

    pub fn acquire_map<K: StoreKey, V: StoreValue>(&self, uri: &str) -> Result<Arc<MapView<K, V>>> {
        self.ensure_map_rules::<K, V>();
        self.acquire_typed::<_, K, V>(uri, &[ViewType::Map, ViewType::KeyValueStore])
    }

    pub fn acquire_queue(&self, uri: &str) -> Result<Arc<QueueView>> {
        self.acquire_typed::<_, (), ()>(uri, &[ViewType::Queue])
    }

    pub fn acquire_topic_publisher<T: StoreKey, M: StoreValue>(
        &self,
        uri: &str,
    ) -> Result<Arc<TopicPublisher<T, M>>> {
        self.ensure_map_rules::<T, M>();
        self.acquire_typed::<_, T, M>(uri, &[ViewType::TopicPublisher, ViewType::Publisher])
    }

    pub fn acquire_replicator<K, V>(&self, uri: &str) -> Result<Arc<MapReplicator<K, V>>>
    where
        K: StoreKey + Serialize + DeserializeOwned,
        V: StoreValue + Serialize + DeserializeOwned,
    {
        self.ensure_map_rules::<K, V>();
        self.ensure_replication_rule::<K, V>();
        self.acquire_typed::<_, K, V>(uri, &[ViewType::Replication, ViewType::Map])
    }

    pub fn register_subscriber<K: StoreKey, V: StoreValue>(
        &self,
        uri: &str,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
    ) -> Result<SubscriberId> {
        self.acquire_map::<K, V>(uri)?.register_subscriber(subscriber)
    }

    pub fn register_key_subscriber<K: StoreKey, V: StoreValue>(
        &self,
        uri: &str,
        key: K,
        subscriber: Arc<dyn Subscriber<MapEvent<K, V>>>,
    ) -> Result<SubscriberId> {
        self.acquire_map::<K, V>(uri)?
            .register_key_subscriber(key, subscriber)
    }

    pub fn unregister_subscriber<K: StoreKey, V: StoreValue>(
        &self,
        uri: &str,
        id: SubscriberId,
    ) -> Result<bool> {
        Ok(self.acquire_map::<K, V>(uri)?.unregister_subscriber(id))
    }

    /// Runs the event loop on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.event_loop.start()
    }

    pub fn close(&self) {
        self.event_loop.stop();
        self.root.close();
        info!(host_id = self.context.host_id(), "asset tree closed");
    }

    fn install_queue_rule(&self) {
        self.root
            .add_leaf_rule::<Arc<QueueView>, _>("queue over append log", |rc, asset| {
                let config = asset.context().config();
                let base_path = rc.base_path.clone().or_else(|| config.base_path.clone());
                let log: Arc<dyn AppendLog> = match base_path {
                    Some(base_path) => {
                        let file = base_path
                            .join(format!("{}.wal", asset.full_name().trim_start_matches('/')));
                        Arc::new(FileAppendLog::open(file, config.host_id).map_err(EngineError::Log)?)
                    }
                    None => Arc::new(MemoryAppendLog::new(config.max_log_entries)),
                };
                let queue = Arc::new(QueueView::new(asset.full_name(), log));
                asset.add_closeable(queue.clone());
                Ok(queue)
            });
    }

    /// String maps are stored as bytes and translated at the view.
    fn install_string_rules(&self) {
        self.root.add_wrapping_rule::<
            Arc<TranslatingKeyValueStore<String, String, Vec<u8>>>,
            Arc<SubscriptionKeyValueStore<String, Vec<u8>>>,
            _,
        >("string store over byte store", |rc, asset, raw| {
            let registry = asset.acquire_view_with::<Arc<SubscriptionRegistry<String, String>>>(rc)?;
            Ok(Arc::new(TranslatingKeyValueStore::new(
                raw,
                registry,
                Arc::new(string_to_bytes),
                Arc::new(bytes_to_string),
            )))
        });
        self.root.add_wrapping_rule::<
            Arc<MapView<String, String>>,
            Arc<TranslatingKeyValueStore<String, String, Vec<u8>>>,
            _,
        >("string map over translating store", |rc, _asset, store| {
            Ok(Arc::new(MapView::new(store, rc)))
        });
    }

    /// Installs the generic rules for maps of `K` to `V` once per pair.
    pub fn ensure_map_rules<K: StoreKey, V: StoreValue>(&self) {
        if !self.installed.lock().insert(TypeId::of::<(K, V)>()) {
            return;
        }
        let root = &self.root;
        root.add_leaf_rule::<Arc<SubscriptionRegistry<K, V>>, _>(
            "subscription registry",
            |_rc, asset| {
                let registry = Arc::new(SubscriptionRegistry::new());
                asset.add_closeable(registry.clone());
                Ok(registry)
            },
        );
        root.add_leaf_rule::<Arc<dyn KeyValueStore<K, V>>, _>("segmented memory store", |rc, asset| {
            let segments = rc.segments.unwrap_or(asset.context().config().segments);
            Ok(Arc::new(MemoryKeyValueStore::new(segments)) as Arc<dyn KeyValueStore<K, V>>)
        });
        root.add_wrapping_rule::<Arc<SubscriptionKeyValueStore<K, V>>, Arc<dyn KeyValueStore<K, V>>, _>(
            "subscription store over store",
            |rc, asset, inner| {
                let registry = asset.acquire_view_with::<Arc<SubscriptionRegistry<K, V>>>(rc)?;
                Ok(Arc::new(SubscriptionKeyValueStore::new(inner, registry)))
            },
        );
        root.add_wrapping_rule::<Arc<MapView<K, V>>, Arc<SubscriptionKeyValueStore<K, V>>, _>(
            "map over subscription store",
            |rc, _asset, store| Ok(Arc::new(MapView::new(store, rc))),
        );
        root.add_wrapping_rule::<Arc<TopicPublisher<K, V>>, Arc<MapView<K, V>>, _>(
            "topic publisher over map",
            |_rc, _asset, map| Ok(Arc::new(TopicPublisher::new(map))),
        );
    }

    fn ensure_replication_rule<K, V>(&self)
    where
        K: StoreKey + Serialize + DeserializeOwned,
        V: StoreValue + Serialize + DeserializeOwned,
    {
        if !self.installed.lock().insert(TypeId::of::<MapReplicator<K, V>>()) {
            return;
        }
        self.root
            .add_wrapping_rule::<Arc<MapReplicator<K, V>>, Arc<MapView<K, V>>, _>(
                "replicator over map",
                |_rc, asset, map| {
                    let replicator = MapReplicator::new(asset, map)?;
                    asset.add_closeable(replicator.clone());
                    Ok(replicator)
                },
            );
    }
}

/// Fails when a request names an element type other than the one `T` is.
fn check_element<T: 'static>(requested: Option<&ElementType>) -> Result<()> {
    match (requested, ElementType::of::<T>()) {
        (Some(requested), Some(actual)) if *requested != actual => Err(
            EngineError::ValueTypeUnresolved(format!("{requested:?}, view holds {actual:?}")),
        ),
        _ => Ok(()),
    }
}
