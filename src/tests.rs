use crate::asset::Closeable;
use crate::config::EngineConfig;
use crate::error::{EngineError, InvalidEventHandler, InvalidSubscriber};
use crate::event::{MapEvent, MapEventListener};
use crate::event_loop::{EventHandler, EventLoop, HandlerPriority, Progress};
use crate::kvs::{KeyValueStore, MemoryKeyValueStore};
use crate::log::AppendLog;
use crate::replication::{ApplyOutcome, QueueReplicationHandler, ReplicationState};
use crate::request_context::{ElementType, RequestContext, ViewType};
use crate::session::{SessionHandler, SubscriptionQuery};
use crate::subscription::Subscriber;
use crate::tree::AssetTree;
use crate::types::{ReplicatedMutation, ReplicationEvent, ReplicationHandshake, SubscriberId};
use crate::wal::FileAppendLog;
use crate::wire::{EventName, Frame, QueuedPublisher, WireOutPublisher};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Events<K, V> = Arc<Mutex<Vec<MapEvent<K, V>>>>;

fn collector<K, V>() -> (Events<K, V>, Arc<dyn Subscriber<MapEvent<K, V>>>)
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let events: Events<K, V> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscriber = move |event: &MapEvent<K, V>| -> Result<(), InvalidSubscriber> {
        sink.lock().push(event.clone());
        Ok(())
    };
    (events, Arc::new(subscriber))
}

fn s(value: &str) -> String {
    value.to_string()
}

fn new_tree(host_id: u8) -> Arc<AssetTree> {
    Arc::new(AssetTree::new(EngineConfig::for_host(host_id)).unwrap())
}

fn register_frame(tid: u64, query: &SubscriptionQuery) -> Frame {
    Frame::new("/session", tid, EventName::RegisterSubscriber, query).unwrap()
}

fn reply_frames(publisher: &QueuedPublisher) -> Vec<Frame> {
    publisher
        .drain()
        .into_iter()
        .filter(|f| f.event == EventName::Reply)
        .collect()
}

/// Runs event loop passes until a pass makes no progress.
fn run_until_idle(event_loop: &EventLoop) {
    while event_loop.run_once() == Progress::Busy {}
}

#[tokio::test]
async fn test_request_context_parse() {
    let rc = RequestContext::parse("/grandparent/parent/child/");
    assert_eq!(rc.name(), "child");
    assert_eq!(rc.path_name(), "grandparent/parent");
    assert_eq!(rc.full_name(), "/grandparent/parent/child");

    let rc = RequestContext::parse("");
    assert_eq!(rc.name(), "");
    assert_eq!(rc.full_name(), "/");

    let rc = RequestContext::parse(
        "/data?view=map&valueType=string&putReturnsNull=true&segments=4&bogus=1&tcpBufferSize=abc",
    );
    assert_eq!(rc.name(), "data");
    assert_eq!(rc.view_type, Some(ViewType::Map));
    assert_eq!(rc.value_type, Some(ElementType::String));
    assert!(rc.put_returns_null());
    assert!(!rc.remove_returns_null());
    assert_eq!(rc.segments, Some(4));
    // Malformed values keep the defaults
    assert_eq!(rc.tcp_buffer_size, 1024);
    assert!(rc.bootstrap());
}

#[tokio::test]
async fn test_config_validation() {
    let config = EngineConfig::from_toml(
        r#"
        host_id = 2
        segments = 4

        [cluster]
        name = "test"

        [[cluster.hosts]]
        host_id = 1
        connect_uri = "localhost:8081"

        [[cluster.hosts]]
        host_id = 2
        connect_uri = "localhost:8082"
        timeout_ms = 500
        "#,
    )
    .unwrap();
    assert_eq!(config.host_id, 2);
    assert_eq!(config.segments, 4);
    assert_eq!(config.publisher_capacity, 1024);
    assert_eq!(config.cluster.host(1).unwrap().timeout_ms, 1000);
    assert_eq!(config.cluster.host(2).unwrap().timeout_ms, 500);
    let peers: Vec<_> = config.cluster.peers(2).map(|h| h.host_id).collect();
    assert_eq!(peers, vec![1]);

    // An empty document is a valid single-host configuration
    assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());

    let duplicate = r#"
        [[cluster.hosts]]
        host_id = 1
        connect_uri = "a:1"
        [[cluster.hosts]]
        host_id = 1
        connect_uri = "b:1"
    "#;
    assert!(EngineConfig::from_toml(duplicate).is_err());
    assert!(EngineConfig::from_toml("segments = 0").is_err());

    let config = EngineConfig {
        publisher_capacity: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        AssetTree::new(config),
        Err(EngineError::Config(_))
    ));
}

#[tokio::test]
async fn test_map_put_get_size() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();

    assert!(!map.put(s("k1"), s("v1")).unwrap());
    assert_eq!(map.get(&s("k1")), Some(s("v1")));
    assert_eq!(map.size(), 1);

    assert!(map.put(s("k1"), s("v2")).unwrap());
    assert_eq!(map.get_and_put(s("k1"), s("v3")).unwrap(), Some(s("v2")));
    assert_eq!(map.size(), 1);

    assert_eq!(map.get_and_remove(&s("k1")).unwrap(), Some(s("v3")));
    assert!(!map.remove(&s("k1")).unwrap());
    assert!(map.is_empty());
}

#[tokio::test]
async fn test_topic_subscriber_sees_insert_update_remove() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let (events, subscriber) = collector::<String, String>();
    tree.register_subscriber("/data", subscriber).unwrap();

    map.put(s("k1"), s("v1")).unwrap();
    map.put(s("k1"), s("v2")).unwrap();
    map.remove(&s("k1")).unwrap();
    // Removing a missing key produces no event
    map.remove(&s("k1")).unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            MapEvent::Insert {
                key: s("k1"),
                new_value: s("v1"),
            },
            MapEvent::Update {
                key: s("k1"),
                old_value: s("v1"),
                new_value: s("v2"),
            },
            MapEvent::Remove {
                key: s("k1"),
                old_value: s("v2"),
            },
        ]
    );
}

#[tokio::test]
async fn test_views_are_memoized() {
    let tree = new_tree(1);
    let first = tree.acquire_map::<String, String>("/data").unwrap();
    let second = tree.acquire_map::<String, String>("/data").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let asset = tree.acquire_asset("/data");
    assert!(Arc::ptr_eq(&asset, &tree.acquire_asset("data/")));
    let queue = asset.acquire_view::<Arc<crate::log::QueueView>>().unwrap();
    let again = asset.acquire_view::<Arc<crate::log::QueueView>>().unwrap();
    assert!(Arc::ptr_eq(&queue, &again));

    // Different value types are different views of the same asset
    let bytes = tree.acquire_map::<String, Vec<u8>>("/data").unwrap();
    bytes.put(s("raw"), b"v".to_vec()).unwrap();
    assert_eq!(first.get(&s("raw")), Some(s("v")));
}

#[derive(Clone, Debug, PartialEq)]
struct Greeting(&'static str);

#[derive(Clone)]
struct Base;

#[tokio::test]
async fn test_rule_order_and_fallback() {
    let tree = new_tree(1);

    let wrapped = tree.acquire_asset("/rules/wrapped");
    wrapped.add_wrapping_rule::<Greeting, Base, _>("greeting over base", |_rc, _asset, _base| {
        Ok(Greeting("wrapped"))
    });
    wrapped.add_leaf_rule::<Greeting, _>("plain greeting", |_rc, _asset| Ok(Greeting("leaf")));
    wrapped.add_leaf_rule::<Base, _>("base", |_rc, _asset| Ok(Base));
    assert_eq!(wrapped.acquire_view::<Greeting>().unwrap(), Greeting("wrapped"));

    // Without a resolvable predicate the wrapping rule is skipped
    let plain = tree.acquire_asset("/rules/plain");
    plain.add_wrapping_rule::<Greeting, Base, _>("greeting over base", |_rc, _asset, _base| {
        Ok(Greeting("wrapped"))
    });
    plain.add_leaf_rule::<Greeting, _>("plain greeting", |_rc, _asset| Ok(Greeting("leaf")));
    assert_eq!(plain.acquire_view::<Greeting>().unwrap(), Greeting("leaf"));

    // Rules on an ancestor apply to descendants
    let child = tree.acquire_asset("/rules/wrapped/child");
    assert_eq!(child.acquire_view::<Greeting>().unwrap(), Greeting("wrapped"));

    match tree.acquire_asset("/rules/none").acquire_view::<Greeting>() {
        Err(EngineError::CapabilityNotFound { path, .. }) => assert_eq!(path, "/rules/none"),
        other => panic!("expected CapabilityNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cyclic_rules_fall_through_to_leaf() {
    let tree = new_tree(1);
    let asset = tree.acquire_asset("/cycle");
    asset.add_wrapping_rule::<Greeting, Base, _>("greeting over base", |_rc, _asset, _base| {
        Ok(Greeting("wrapped"))
    });
    asset.add_wrapping_rule::<Base, Greeting, _>("base over greeting", |_rc, _asset, _g| Ok(Base));
    asset.add_leaf_rule::<Greeting, _>("plain greeting", |_rc, _asset| Ok(Greeting("leaf")));

    assert_eq!(asset.acquire_view::<Greeting>().unwrap(), Greeting("leaf"));
    // Base now resolves through the cached greeting
    assert!(asset.acquire_view::<Base>().is_ok());
}

#[tokio::test]
async fn test_find_view_walks_ancestors() {
    let tree = new_tree(7);
    let asset = tree.acquire_asset("/a/b/c");
    let event_loop = asset.find_view::<Arc<EventLoop>>().unwrap();
    assert!(Arc::ptr_eq(&event_loop, tree.event_loop()));
    assert!(asset.get_view::<Arc<EventLoop>>().is_none());
    assert!(tree.cluster().is_some());
    assert_eq!(asset.context().host_id(), 7);
    assert_eq!(asset.full_name(), "/a/b/c");
    assert_eq!(asset.parent().unwrap().full_name(), "/a/b");
}

#[tokio::test]
async fn test_translate_preserves_shape() {
    let calls = AtomicUsize::new(0);
    let value_fn = |v: &String| {
        calls.fetch_add(1, Ordering::Relaxed);
        v.to_uppercase()
    };

    let insert = MapEvent::Insert {
        key: s("key"),
        new_value: s("a"),
    };
    let translated = insert.translate(|k: &String| k.len(), &value_fn);
    assert_eq!(
        translated,
        MapEvent::Insert {
            key: 3,
            new_value: s("A"),
        }
    );
    assert!(translated.old_value().is_none());
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    let update = MapEvent::Update {
        key: s("k"),
        old_value: s("a"),
        new_value: s("b"),
    };
    assert!(matches!(
        update.translate(String::clone, &value_fn),
        MapEvent::Update { .. }
    ));
    assert_eq!(calls.load(Ordering::Relaxed), 3);

    let remove = MapEvent::Remove {
        key: s("k"),
        old_value: s("a"),
    };
    let translated = remove.translate(String::clone, &value_fn);
    assert!(matches!(translated, MapEvent::Remove { .. }));
    assert!(translated.new_value().is_none());
    assert_eq!(calls.load(Ordering::Relaxed), 4);
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl MapEventListener<String, String> for Recorder {
    fn on_insert(&self, key: &String, value: &String) {
        self.0.lock().push(format!("insert {key}={value}"));
    }

    fn on_update(&self, key: &String, old_value: &String, new_value: &String) {
        self.0
            .lock()
            .push(format!("update {key}={old_value}->{new_value}"));
    }

    fn on_remove(&self, key: &String, old_value: &String) {
        self.0.lock().push(format!("remove {key}={old_value}"));
    }
}

#[tokio::test]
async fn test_event_apply_dispatches_by_variant() {
    let recorder = Recorder::default();
    MapEvent::for_put(s("k"), None, s("a")).apply(&recorder);
    MapEvent::for_put(s("k"), Some(s("a")), s("b")).apply(&recorder);
    MapEvent::Remove {
        key: s("k"),
        old_value: s("b"),
    }
    .apply(&recorder);
    assert_eq!(
        *recorder.0.lock(),
        vec![s("insert k=a"), s("update k=a->b"), s("remove k=b")]
    );
}

#[tokio::test]
async fn test_key_subscriber_isolation() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let (keyed, key_subscriber) = collector::<String, String>();
    let (all, topic_subscriber) = collector::<String, String>();
    map.register_key_subscriber(s("k1"), key_subscriber).unwrap();
    map.register_subscriber(topic_subscriber).unwrap();

    map.put(s("k1"), s("v1")).unwrap();
    map.put(s("k2"), s("v2")).unwrap();
    map.remove(&s("k2")).unwrap();

    let keyed = keyed.lock();
    assert_eq!(keyed.len(), 1);
    assert_eq!(keyed[0].key(), "k1");
    assert_eq!(all.lock().len(), 3);
}

#[tokio::test]
async fn test_duplicate_registration_delivers_twice() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let (events, subscriber) = collector::<String, String>();
    let first = map.register_subscriber(subscriber.clone()).unwrap();
    let second = map.register_subscriber(subscriber).unwrap();
    assert_ne!(first, second);

    map.put(s("k"), s("v")).unwrap();
    assert_eq!(events.lock().len(), 2);

    assert!(map.unregister_subscriber(first));
    assert!(!map.unregister_subscriber(first));
    map.put(s("k"), s("w")).unwrap();
    assert_eq!(events.lock().len(), 3);
}

#[tokio::test]
async fn test_invalid_subscriber_is_dropped() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let failing = move |_: &MapEvent<String, String>| -> Result<(), InvalidSubscriber> {
        counter.fetch_add(1, Ordering::Relaxed);
        Err(InvalidSubscriber)
    };
    map.register_subscriber(Arc::new(failing)).unwrap();
    let registry = map.subscription().unwrap();
    assert_eq!(registry.topic_subscriber_count(), 1);

    // The mutator never sees the subscriber's failure
    map.put(s("k"), s("v1")).unwrap();
    map.put(s("k"), s("v2")).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(registry.topic_subscriber_count(), 0);
}

#[tokio::test]
async fn test_clear_notifies_each_key() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    map.put(s("a"), s("1")).unwrap();
    map.put(s("b"), s("2")).unwrap();
    let (events, subscriber) = collector::<String, String>();
    map.register_subscriber(subscriber).unwrap();

    map.clear().unwrap();
    assert!(map.is_empty());
    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| matches!(e, MapEvent::Remove { .. })));
}

#[tokio::test]
async fn test_segmented_walk_abort_and_unsupported() {
    let store = MemoryKeyValueStore::<String, String>::new(1);
    for key in ["a", "b", "c"] {
        store.put(s(key), s("v")).unwrap();
    }
    let mut seen = 0;
    let result = store.keys_for(0, &mut |_key: &String| {
        seen += 1;
        if seen == 2 {
            Err(InvalidSubscriber)
        } else {
            Ok(())
        }
    });
    assert_eq!(result, Err(InvalidSubscriber));
    assert_eq!(seen, 2);
    assert!(matches!(
        EngineError::from(InvalidSubscriber),
        EngineError::InvalidSubscriber
    ));

    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data?segments=3").unwrap();
    for i in 0..20 {
        map.put(format!("k{i}"), s("v")).unwrap();
    }
    assert_eq!(map.underlying().segments(), 3);
    assert_eq!(map.keys().len(), 20);
    assert_eq!(map.entries().len(), 20);
    assert!(matches!(
        map.contains_value(&s("v")),
        Err(EngineError::Unsupported(_))
    ));
    assert!(map.contains_key(&s("k3")));
}

#[tokio::test]
async fn test_put_returns_null_flags() {
    let tree = new_tree(1);
    let map = tree
        .acquire_map::<String, String>("/quiet?putReturnsNull=true&removeReturnsNull=true")
        .unwrap();
    map.put(s("k"), s("v1")).unwrap();
    assert_eq!(map.get_and_put(s("k"), s("v2")).unwrap(), None);
    assert_eq!(map.get(&s("k")), Some(s("v2")));
    assert_eq!(map.get_and_remove(&s("k")).unwrap(), None);
    assert!(map.is_empty());
}

#[tokio::test]
async fn test_topic_publisher() {
    let tree = new_tree(1);
    let publisher = tree
        .acquire_topic_publisher::<String, String>("/topics")
        .unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscriber = move |topic: &String, message: &String| -> Result<(), InvalidSubscriber> {
        sink.lock().push((topic.clone(), message.clone()));
        Ok(())
    };
    let id = publisher
        .register_topic_subscriber(Arc::new(subscriber))
        .unwrap();

    publisher.publish(s("news"), s("hello")).unwrap();
    publisher.publish(s("news"), s("again")).unwrap();
    assert_eq!(publisher.last_message(&s("news")), Some(s("again")));
    assert_eq!(
        *received.lock(),
        vec![(s("news"), s("hello")), (s("news"), s("again"))]
    );

    assert!(publisher.unregister_topic_subscriber(id));
    publisher.publish(s("news"), s("ignored")).unwrap();
    assert_eq!(received.lock().len(), 2);
}

#[tokio::test]
async fn test_two_sessions_get_tid_tagged_frames() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let pub10 = Arc::new(QueuedPublisher::new(16));
    let pub11 = Arc::new(QueuedPublisher::new(16));
    let session10 = SessionHandler::new(tree.clone(), pub10.clone());
    let session11 = SessionHandler::new(tree.clone(), pub11.clone());

    session10
        .on_frame(&register_frame(10, &SubscriptionQuery::topic("/data")))
        .unwrap();
    session11
        .on_frame(&register_frame(11, &SubscriptionQuery::topic("/data")))
        .unwrap();

    map.put(s("k1"), s("v1")).unwrap();

    let expected = MapEvent::Insert {
        key: s("k1"),
        new_value: s("v1"),
    };
    for (publisher, tid) in [(&pub10, 10), (&pub11, 11)] {
        let frames = reply_frames(publisher);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tid, tid);
        assert_eq!(frames[0].read::<MapEvent<String, String>>().unwrap(), expected);
    }
}

#[tokio::test]
async fn test_session_key_and_bytes_subscriptions() {
    let tree = new_tree(1);
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());

    session
        .on_frame(&register_frame(1, &SubscriptionQuery::key("/data", "k1")))
        .unwrap();
    let bytes_query = SubscriptionQuery {
        value_type: Some(s("bytes")),
        ..SubscriptionQuery::topic("/data")
    };
    session.on_frame(&register_frame(2, &bytes_query)).unwrap();
    assert_eq!(session.subscription_count(), 2);

    let map = tree.acquire_map::<String, String>("/data").unwrap();
    map.put(s("k1"), s("v1")).unwrap();
    map.put(s("k2"), s("v2")).unwrap();

    let frames = reply_frames(&publisher);
    assert_eq!(frames.iter().filter(|f| f.tid == 1).count(), 1);
    let raw: Vec<_> = frames.iter().filter(|f| f.tid == 2).collect();
    assert_eq!(raw.len(), 2);
    assert_eq!(
        raw[1].read::<MapEvent<String, Vec<u8>>>().unwrap(),
        MapEvent::Insert {
            key: s("k2"),
            new_value: b"v2".to_vec(),
        }
    );
}

#[tokio::test]
async fn test_session_protocol_misuse_is_ignored() {
    let tree = new_tree(1);
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());

    let query = SubscriptionQuery::topic("/data");
    session.on_frame(&register_frame(10, &query)).unwrap();
    // Duplicate tid
    session.on_frame(&register_frame(10, &query)).unwrap();
    assert_eq!(session.subscription_count(), 1);

    // Empty selection
    session
        .on_frame(&register_frame(11, &SubscriptionQuery::topic("")))
        .unwrap();
    // Unresolvable value type
    let long_query = SubscriptionQuery {
        value_type: Some(s("long")),
        ..SubscriptionQuery::topic("/data")
    };
    session.on_frame(&register_frame(12, &long_query)).unwrap();
    // Payload that is not a query
    let garbage = Frame {
        csp: s("/session"),
        tid: 13,
        event: EventName::RegisterSubscriber,
        payload: vec![0xff, 0xff, 0xff],
    };
    session.on_frame(&garbage).unwrap();
    assert_eq!(session.subscription_count(), 1);
    assert!(session.is_registered(10));

    // Unknown tid
    let unregister = Frame::new("/session", 99, EventName::UnregisterSubscriber, &()).unwrap();
    session.on_frame(&unregister).unwrap();
    assert_eq!(session.subscription_count(), 1);

    let unregister = Frame::new("/session", 10, EventName::UnregisterSubscriber, &()).unwrap();
    session.on_frame(&unregister).unwrap();
    assert_eq!(session.subscription_count(), 0);
    let frames = publisher.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event, EventName::OnEndOfSubscription);
    assert_eq!(frames[0].tid, 10);
}

#[tokio::test]
async fn test_typed_acquire_checks_request() {
    let tree = new_tree(1);
    assert!(matches!(
        tree.acquire_queue("/data?view=map"),
        Err(EngineError::CapabilityNotFound { .. })
    ));
    assert!(matches!(
        tree.acquire_map::<String, String>("/data?view=queue"),
        Err(EngineError::CapabilityNotFound { .. })
    ));
    assert!(matches!(
        tree.acquire_map::<String, String>("/data?valueType=bytes"),
        Err(EngineError::ValueTypeUnresolved(_))
    ));
    assert!(matches!(
        tree.acquire_map::<String, String>("/data?keyType=long"),
        Err(EngineError::ValueTypeUnresolved(_))
    ));

    let map = tree
        .acquire_map::<String, String>("/data?view=map&keyType=string&valueType=string")
        .unwrap();
    let bytes = tree
        .acquire_map::<String, Vec<u8>>("/data?valueType=bytes")
        .unwrap();
    map.put(s("k"), s("v")).unwrap();
    assert_eq!(bytes.get(&s("k")), Some(b"v".to_vec()));
    assert!(tree.acquire_queue("/log?view=queue").is_ok());
}

#[tokio::test]
async fn test_select_value_type_picks_reply_type() {
    let tree = new_tree(1);
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());
    session
        .on_frame(&register_frame(
            3,
            &SubscriptionQuery::topic("/data?valueType=bytes"),
        ))
        .unwrap();
    assert!(session.is_registered(3));

    let map = tree.acquire_map::<String, String>("/data").unwrap();
    map.put(s("k"), s("v")).unwrap();
    let frames = reply_frames(&publisher);
    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0].read::<MapEvent<String, Vec<u8>>>().unwrap(),
        MapEvent::Insert {
            key: s("k"),
            new_value: b"v".to_vec(),
        }
    );

    // A select naming a view other than a map is not subscribable
    session
        .on_frame(&register_frame(4, &SubscriptionQuery::topic("/data?view=queue")))
        .unwrap();
    assert!(!session.is_registered(4));
}

#[tokio::test]
async fn test_subscription_bootstraps_current_entries() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    map.put(s("k1"), s("v1")).unwrap();
    map.put(s("k2"), s("v2")).unwrap();
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());

    session
        .on_frame(&register_frame(1, &SubscriptionQuery::topic("/data")))
        .unwrap();
    let mut current: Vec<_> = reply_frames(&publisher)
        .iter()
        .map(|f| f.read::<MapEvent<String, String>>().unwrap())
        .collect();
    current.sort_by(|a, b| a.key().cmp(b.key()));
    assert_eq!(
        current,
        vec![
            MapEvent::Insert {
                key: s("k1"),
                new_value: s("v1"),
            },
            MapEvent::Insert {
                key: s("k2"),
                new_value: s("v2"),
            },
        ]
    );

    session
        .on_frame(&register_frame(2, &SubscriptionQuery::key("/data", "k2")))
        .unwrap();
    let frames = reply_frames(&publisher);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].tid, 2);

    session
        .on_frame(&register_frame(
            3,
            &SubscriptionQuery::topic("/data?bootstrap=false"),
        ))
        .unwrap();
    assert!(session.is_registered(3));
    assert!(reply_frames(&publisher).is_empty());

    // Live events still follow
    map.put(s("k3"), s("v3")).unwrap();
    let tids: Vec<_> = reply_frames(&publisher).iter().map(|f| f.tid).collect();
    assert_eq!(tids, vec![1, 3]);
}

#[tokio::test]
async fn test_unregister_during_fanout() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let (b_events, b) = collector::<String, String>();
    let (c_events, c) = collector::<String, String>();
    let b_id = map.register_subscriber(b).unwrap();

    let a_id: Arc<Mutex<Option<SubscriberId>>> = Arc::new(Mutex::new(None));
    let a_calls = Arc::new(AtomicUsize::new(0));
    let a = {
        let map = map.clone();
        let a_id = a_id.clone();
        let a_calls = a_calls.clone();
        let c = Mutex::new(Some(c));
        move |_: &MapEvent<String, String>| -> Result<(), InvalidSubscriber> {
            a_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = a_id.lock().take() {
                map.unregister_subscriber(id);
            }
            map.unregister_subscriber(b_id);
            if let Some(c) = c.lock().take() {
                map.register_subscriber(c).unwrap();
            }
            Ok(())
        }
    };
    // Registered after `b`, so `b` is delivered from the snapshot first
    *a_id.lock() = Some(map.register_subscriber(Arc::new(a)).unwrap());

    map.put(s("k"), s("v1")).unwrap();
    assert_eq!(a_calls.load(Ordering::Relaxed), 1);
    assert_eq!(b_events.lock().len(), 1);

    map.put(s("k"), s("v2")).unwrap();
    assert_eq!(a_calls.load(Ordering::Relaxed), 1);
    assert_eq!(b_events.lock().len(), 1);
    assert_eq!(
        c_events.lock().last(),
        Some(&MapEvent::Update {
            key: s("k"),
            old_value: s("v1"),
            new_value: s("v2"),
        })
    );
    assert_eq!(map.subscription().unwrap().topic_subscriber_count(), 1);
}

#[tokio::test]
async fn test_unregister_all_stops_delivery() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let other = tree.acquire_map::<String, String>("/other").unwrap();
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());
    session
        .on_frame(&register_frame(1, &SubscriptionQuery::topic("/data")))
        .unwrap();
    session
        .on_frame(&register_frame(2, &SubscriptionQuery::key("/other", "k")))
        .unwrap();

    map.put(s("k"), s("v")).unwrap();
    assert_eq!(reply_frames(&publisher).len(), 1);

    session.unregister_all();
    assert_eq!(session.subscription_count(), 0);
    publisher.drain();

    map.put(s("k"), s("w")).unwrap();
    other.put(s("k"), s("w")).unwrap();
    assert!(publisher.is_empty());
    assert!(!map.subscription().unwrap().has_subscribers());
}

#[tokio::test]
async fn test_closed_publisher_invalidates_listener() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());
    session
        .on_frame(&register_frame(1, &SubscriptionQuery::topic("/data")))
        .unwrap();
    let registry = map.subscription().unwrap();
    assert_eq!(registry.topic_subscriber_count(), 1);

    publisher.close();
    map.put(s("k"), s("v")).unwrap();
    assert_eq!(registry.topic_subscriber_count(), 0);
    assert!(publisher.put(Frame::new("/x", 1, EventName::Reply, &()).unwrap()).is_err());
}

fn sink_handler(tree: &AssetTree, csp: &str) -> QueueReplicationHandler {
    let handshake = ReplicationHandshake {
        csp: s(csp),
        origin_host: 2,
        last_index_received: 0,
        is_source: false,
    };
    let mut handler = QueueReplicationHandler::sink(&handshake);
    handler
        .on_bootstrap(tree, Arc::new(QueuedPublisher::new(16)))
        .unwrap();
    handler
}

#[tokio::test]
async fn test_replication_contiguity() {
    let tree = new_tree(1);

    let mut handler = sink_handler(&tree, "/p6/.replication/2");
    assert_eq!(handler.state(), ReplicationState::Streaming);
    for index in [5, 6, 7] {
        let event = ReplicationEvent::new(index, b"x".to_vec());
        assert_eq!(
            handler.process_event(&tree, &event).unwrap(),
            ApplyOutcome::Applied
        );
    }
    assert_eq!(handler.last_index_received(), 7);

    let mut handler = sink_handler(&tree, "/gap/.replication/2");
    let first = ReplicationEvent::new(5, b"x".to_vec());
    let skipped = ReplicationEvent::new(7, b"x".to_vec());
    assert_eq!(
        handler.process_event(&tree, &first).unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(
        handler.process_event(&tree, &skipped).unwrap(),
        ApplyOutcome::OutOfOrder
    );
    assert_eq!(handler.last_index_received(), 5);
    let queue = tree.acquire_queue("/gap/.replication/2").unwrap();
    assert_eq!(queue.last_index_appended(), Some(5));
}

#[tokio::test]
async fn test_closed_replication_drops_events() {
    let tree = new_tree(1);
    let mut handler = sink_handler(&tree, "/closed/.replication/2");
    handler.close();
    assert_eq!(handler.state(), ReplicationState::Closed);
    let event = ReplicationEvent::new(1, b"x".to_vec());
    assert_eq!(
        handler.process_event(&tree, &event).unwrap(),
        ApplyOutcome::Dropped
    );
    assert!(tree
        .acquire_queue("/closed/.replication/2")
        .unwrap()
        .is_empty());
}

/// Moves every frame `from` has queued into `to`.
fn forward(from: &QueuedPublisher, to: &SessionHandler) {
    for frame in from.drain() {
        to.on_frame(&frame).unwrap();
    }
}

#[tokio::test]
async fn test_replication_between_hosts() {
    let host1 = new_tree(1);
    let host2 = new_tree(2);
    let source = host1.acquire_replicator::<String, String>("/data").unwrap();
    host2.acquire_replicator::<String, String>("/data").unwrap();

    let map1 = host1.acquire_map::<String, String>("/data").unwrap();
    map1.put(s("k1"), s("v1")).unwrap();
    map1.put(s("k2"), s("v2")).unwrap();
    map1.put(s("k1"), s("v3")).unwrap();
    assert_eq!(source.local_log().last_index_appended(), Some(3));

    let to_host2 = Arc::new(QueuedPublisher::new(64));
    let session1 = SessionHandler::new(host1.clone(), to_host2.clone());
    let session2 = SessionHandler::new(host2.clone(), Arc::new(QueuedPublisher::new(64)));

    let csp = "/data/.replication/1";
    session1.start_replication(csp, 0).unwrap();
    forward(&to_host2, &session2);
    run_until_idle(host1.event_loop());
    forward(&to_host2, &session2);

    let map2 = host2.acquire_map::<String, String>("/data").unwrap();
    assert_eq!(map2.get(&s("k1")), Some(s("v3")));
    assert_eq!(map2.get(&s("k2")), Some(s("v2")));
    assert_eq!(
        session2.replication_handler(csp, |h| h.last_index_received()),
        Some(3)
    );
    assert_eq!(
        host2.acquire_queue(csp).unwrap().last_index_appended(),
        Some(3)
    );
    // Applied events are not recorded for shipping back
    assert!(host2
        .acquire_queue("/data/.replication/2")
        .unwrap()
        .is_empty());

    // Later writes stream on the next pass
    map1.remove(&s("k2")).unwrap();
    run_until_idle(host1.event_loop());
    forward(&to_host2, &session2);
    assert_eq!(map2.get(&s("k2")), None);
    assert_eq!(
        session2.replication_handler(csp, |h| h.last_index_received()),
        Some(4)
    );
}

#[tokio::test]
async fn test_replication_tailer_backpressure() {
    let tree = new_tree(1);
    let queue = tree.acquire_queue("/bp").unwrap();
    queue.append(b"one").unwrap();
    queue.append(b"two").unwrap();

    // Capacity 1: the handshake alone fills the publisher
    let publisher = Arc::new(QueuedPublisher::new(1));
    let session = SessionHandler::new(tree.clone(), publisher.clone());
    session.start_replication("/bp", 0).unwrap();
    assert!(!publisher.can_take_more_data());

    assert_eq!(tree.event_loop().run_once(), Progress::Idle);
    assert_eq!(publisher.len(), 1);
    assert_eq!(publisher.drain()[0].event, EventName::ReplicationHandshake);

    assert_eq!(tree.event_loop().run_once(), Progress::Busy);
    let frames = publisher.drain();
    assert_eq!(frames.len(), 1);
    let event = frames[0].read::<ReplicationEvent>().unwrap();
    assert_eq!(event.index, 1);
    assert_eq!(event.payload, b"one".to_vec());

    assert_eq!(tree.event_loop().run_once(), Progress::Busy);
    assert_eq!(publisher.drain()[0].read::<ReplicationEvent>().unwrap().index, 2);
    assert_eq!(tree.event_loop().run_once(), Progress::Idle);

    // Closing the session closes replication and the tailer removes itself
    session.close();
    assert!(session.replication_handler("/bp", |_| ()).is_none());
    assert_eq!(tree.event_loop().handler_count(), 1);
    tree.event_loop().run_once();
    assert_eq!(tree.event_loop().handler_count(), 0);
}

#[tokio::test]
async fn test_source_resumes_after_index() {
    let tree = new_tree(1);
    let queue = tree.acquire_queue("/resume").unwrap();
    for payload in [b"a", b"b", b"c"] {
        queue.append(payload).unwrap();
    }
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());
    session.start_replication("/resume", 2).unwrap();
    run_until_idle(tree.event_loop());

    let frames = publisher.drain();
    let handshake = frames[0].read::<ReplicationHandshake>().unwrap();
    assert_eq!(handshake.last_index_received, 2);
    assert!(!handshake.is_source);
    let indices: Vec<_> = frames[1..]
        .iter()
        .map(|f| f.read::<ReplicationEvent>().unwrap().index)
        .collect();
    assert_eq!(indices, vec![3]);
}

#[tokio::test]
async fn test_source_cursor_tracks_shipped_entries() {
    let tree = new_tree(1);
    let queue = tree.acquire_queue("/pc").unwrap();
    for payload in [b"a", b"b", b"c"] {
        queue.append(payload).unwrap();
    }
    let session = SessionHandler::new(tree.clone(), Arc::new(QueuedPublisher::new(16)));
    session.start_replication("/pc", 0).unwrap();
    assert_eq!(
        session.replication_handler("/pc", |h| h.last_index_received()),
        Some(0)
    );
    run_until_idle(tree.event_loop());
    assert_eq!(
        session.replication_handler("/pc", |h| h.last_index_received()),
        Some(3)
    );
}

#[tokio::test]
async fn test_tcp_buffer_size_bounds_each_pass() {
    let tree = new_tree(1);
    let queue = tree.acquire_queue("/batch").unwrap();
    for payload in [b"a", b"b", b"c"] {
        queue.append(payload).unwrap();
    }
    let events_per_pass = |csp: &str| {
        let publisher = Arc::new(QueuedPublisher::new(16));
        let session = SessionHandler::new(tree.clone(), publisher.clone());
        session.start_replication(csp, 0).unwrap();
        let mut passes = Vec::new();
        while tree.event_loop().run_once() == Progress::Busy {
            let shipped = publisher
                .drain()
                .iter()
                .filter(|f| f.event == EventName::ReplicationEvent)
                .count();
            passes.push(shipped);
        }
        session.close();
        tree.event_loop().run_once();
        passes
    };
    assert_eq!(events_per_pass("/batch?tcpBufferSize=1"), vec![1, 1, 1]);
    assert_eq!(events_per_pass("/batch"), vec![3]);
}

#[tokio::test]
async fn test_logged_entries_replay_when_replicator_registers() {
    let host1 = new_tree(1);
    let host2 = new_tree(2);
    host1.acquire_replicator::<String, String>("/d").unwrap();
    let map1 = host1.acquire_map::<String, String>("/d").unwrap();
    map1.put(s("k1"), s("v1")).unwrap();

    let to_host2 = Arc::new(QueuedPublisher::new(16));
    let session1 = SessionHandler::new(host1.clone(), to_host2.clone());
    let session2 = SessionHandler::new(host2.clone(), Arc::new(QueuedPublisher::new(16)));
    let csp = "/d/.replication/1";
    session1.start_replication(csp, 0).unwrap();
    forward(&to_host2, &session2);
    run_until_idle(host1.event_loop());
    forward(&to_host2, &session2);

    // Logged but not applied: host2 has no replicator on /d yet
    assert_eq!(host2.acquire_queue(csp).unwrap().last_index_appended(), Some(1));
    let map2 = host2.acquire_map::<String, String>("/d").unwrap();
    assert_eq!(map2.get(&s("k1")), None);

    host2.acquire_replicator::<String, String>("/d").unwrap();
    assert_eq!(map2.get(&s("k1")), Some(s("v1")));

    // Entries arriving afterwards are applied directly
    map1.put(s("k2"), s("v2")).unwrap();
    run_until_idle(host1.event_loop());
    forward(&to_host2, &session2);
    assert_eq!(map2.get(&s("k2")), Some(s("v2")));
    assert_eq!(
        session2.replication_handler(csp, |h| h.last_index_received()),
        Some(2)
    );
}

#[tokio::test]
async fn test_failed_apply_leaves_index_open() {
    let tree = new_tree(1);
    tree.acquire_replicator::<String, String>("/d").unwrap();
    let mut handler = sink_handler(&tree, "/d/.replication/2");

    let garbage = ReplicationEvent::new(1, vec![0xff, 0xff, 0xff]);
    assert!(handler.process_event(&tree, &garbage).is_err());
    let queue = tree.acquire_queue("/d/.replication/2").unwrap();
    assert_eq!(queue.last_index_appended(), None);
    assert_eq!(handler.last_index_received(), 0);

    let mutation = ReplicatedMutation::<String, String>::Put {
        key: s("k"),
        value: s("v"),
    };
    let payload = bincode::serde::encode_to_vec(&mutation, bincode::config::standard()).unwrap();
    assert_eq!(
        handler
            .process_event(&tree, &ReplicationEvent::new(1, payload))
            .unwrap(),
        ApplyOutcome::Applied
    );
    assert_eq!(queue.last_index_appended(), Some(1));
    assert_eq!(handler.last_index_received(), 1);
    let map = tree.acquire_map::<String, String>("/d").unwrap();
    assert_eq!(map.get(&s("k")), Some(s("v")));
}

#[tokio::test]
async fn test_durable_replication_round_trip() {
    use tempfile::TempDir;

    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let durable = |host_id, dir: &TempDir| {
        Arc::new(
            AssetTree::new(EngineConfig {
                base_path: Some(dir.path().to_path_buf()),
                ..EngineConfig::for_host(host_id)
            })
            .unwrap(),
        )
    };
    let host1 = durable(1, &dir1);
    let host2 = durable(2, &dir2);
    host1.acquire_replicator::<String, String>("/data").unwrap();
    host2.acquire_replicator::<String, String>("/data").unwrap();

    let map1 = host1.acquire_map::<String, String>("/data").unwrap();
    map1.put(s("k1"), s("v1")).unwrap();
    map1.put(s("k2"), s("v2")).unwrap();
    map1.remove(&s("k1")).unwrap();

    let to_host2 = Arc::new(QueuedPublisher::new(64));
    let session1 = SessionHandler::new(host1.clone(), to_host2.clone());
    let session2 = SessionHandler::new(host2.clone(), Arc::new(QueuedPublisher::new(64)));
    let csp = "/data/.replication/1";
    session1.start_replication(csp, 0).unwrap();
    forward(&to_host2, &session2);
    run_until_idle(host1.event_loop());
    forward(&to_host2, &session2);

    let map2 = host2.acquire_map::<String, String>("/data").unwrap();
    assert_eq!(map2.get(&s("k1")), None);
    assert_eq!(map2.get(&s("k2")), Some(s("v2")));

    session1.close();
    session2.close();
    host1.close();
    host2.close();

    assert!(dir1.path().join("data/.replication/1.wal").exists());
    let copy = dir2.path().join("data/.replication/1.wal");
    let log = FileAppendLog::open(&copy, 1).unwrap();
    assert_eq!(log.last_index_appended(), Some(3));
    assert_eq!(log.len(), 3);
}

struct Ordered {
    name: &'static str,
    priority: HandlerPriority,
    seen: Arc<Mutex<Vec<&'static str>>>,
    remaining: usize,
}

impl EventHandler for Ordered {
    fn action(&mut self) -> Result<Progress, InvalidEventHandler> {
        if self.remaining == 0 {
            return Err(InvalidEventHandler("done"));
        }
        self.remaining -= 1;
        self.seen.lock().push(self.name);
        Ok(Progress::Busy)
    }

    fn priority(&self) -> HandlerPriority {
        self.priority
    }
}

#[tokio::test]
async fn test_event_loop_priority_and_removal() {
    let event_loop = EventLoop::new(Duration::from_millis(1));
    let seen = Arc::new(Mutex::new(Vec::new()));
    for (name, priority, remaining) in [
        ("monitor", HandlerPriority::Monitor, 2),
        ("high", HandlerPriority::High, 1),
        ("replication", HandlerPriority::Replication, 2),
    ] {
        event_loop.add_handler(Box::new(Ordered {
            name,
            priority,
            seen: seen.clone(),
            remaining,
        }));
    }

    assert_eq!(event_loop.run_once(), Progress::Busy);
    assert_eq!(*seen.lock(), vec!["high", "replication", "monitor"]);
    assert_eq!(event_loop.run_once(), Progress::Busy);
    assert_eq!(event_loop.handler_count(), 2);
    assert_eq!(event_loop.run_once(), Progress::Idle);
    assert_eq!(event_loop.handler_count(), 0);
}

#[tokio::test]
async fn test_event_loop_runs_on_runtime() {
    let tree = new_tree(1);
    let queue = tree.acquire_queue("/live").unwrap();
    let publisher = Arc::new(QueuedPublisher::new(16));
    let session = SessionHandler::new(tree.clone(), publisher.clone());
    session.start_replication("/live", 0).unwrap();
    tree.start().unwrap();

    queue.append(b"payload").unwrap();
    for _ in 0..100 {
        if publisher.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tree.event_loop().stop();
    let frames = publisher.drain();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].event, EventName::ReplicationEvent);
}

struct EndFlag(AtomicBool);

impl Subscriber<MapEvent<String, String>> for EndFlag {
    fn on_message(&self, _event: &MapEvent<String, String>) -> Result<(), InvalidSubscriber> {
        Ok(())
    }

    fn on_end_of_subscription(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn test_tree_close_ends_subscriptions() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let flag = Arc::new(EndFlag(AtomicBool::new(false)));
    map.register_subscriber(flag.clone()).unwrap();

    tree.close();
    assert!(flag.0.load(Ordering::Relaxed));
    assert!(tree.root().is_closed());
    assert!(tree.root().get_child("data").is_none());
    assert!(matches!(
        tree.root().acquire_view::<Arc<crate::log::QueueView>>(),
        Err(EngineError::Closed)
    ));
}

#[tokio::test]
async fn test_remove_child_closes_views() {
    let tree = new_tree(1);
    let map = tree.acquire_map::<String, String>("/data").unwrap();
    let flag = Arc::new(EndFlag(AtomicBool::new(false)));
    map.register_subscriber(flag.clone()).unwrap();

    let removed = tree.root().remove_child("data").unwrap();
    assert!(removed.is_closed());
    assert!(flag.0.load(Ordering::Relaxed));

    // A fresh asset is created on the next acquisition
    let fresh = tree.acquire_map::<String, String>("/data").unwrap();
    assert!(!Arc::ptr_eq(&map, &fresh));
    assert!(fresh.is_empty());
}

#[tokio::test]
async fn test_wal_recovery() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("queue.wal");

    {
        let log = FileAppendLog::open(&path, 1).unwrap();
        assert_eq!(log.write_bytes(b"one").unwrap(), 1);
        assert_eq!(log.write_bytes(b"two").unwrap(), 2);
        log.write_at(10, b"ten").unwrap();
        assert!(log.write_at(10, b"again").is_err());
        assert_eq!(log.write_bytes(b"eleven").unwrap(), 11);
    }

    // Simulate a crash in the middle of writing a record
    {
        use std::io::Write;
        let mut file = fs_err::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
    }

    let log = FileAppendLog::open(&path, 1).unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log.last_index_appended(), Some(11));
    assert_eq!(log.read_from(3), Some((10, b"ten".to_vec())));
    assert_eq!(log.read_from(12), None);

    // The torn record was cut off, so new records land after index 11
    assert_eq!(log.write_bytes(b"twelve").unwrap(), 12);
    drop(log);
    let log = FileAppendLog::open(&path, 1).unwrap();
    assert_eq!(log.len(), 5);
    assert_eq!(log.read_from(12), Some((12, b"twelve".to_vec())));
}

#[tokio::test]
async fn test_durable_queue_through_tree() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let config = EngineConfig {
        base_path: Some(temp_dir.path().to_path_buf()),
        ..EngineConfig::default()
    };

    {
        let tree = AssetTree::new(config.clone()).unwrap();
        let queue = tree.acquire_queue("/logs/events").unwrap();
        queue.append(b"first").unwrap();
        queue.append(b"second").unwrap();
        tree.close();
    }
    assert!(temp_dir.path().join("logs/events.wal").exists());

    let tree = AssetTree::new(config).unwrap();
    let queue = tree.acquire_queue("/logs/events").unwrap();
    assert_eq!(queue.len(), 2);
    let mut tailer = queue.tailer();
    let mut buf = Vec::new();
    assert!(tailer.read_bytes(&mut buf));
    assert_eq!(buf, b"first");
    assert!(tailer.read_bytes(&mut buf));
    assert_eq!(buf, b"second");
    assert!(!tailer.read_bytes(&mut buf));
    assert_eq!(queue.append(b"third").unwrap(), 3);
    assert_eq!(tailer.index(), 3);
}

#[tokio::test]
async fn test_memory_log_retention() {
    let log = crate::log::MemoryAppendLog::new(2);
    for payload in [b"a", b"b", b"c"] {
        log.write_bytes(payload).unwrap();
    }
    assert_eq!(log.len(), 2);
    assert_eq!(log.last_index_appended(), Some(3));
    assert_eq!(log.read_from(1), Some((2, b"b".to_vec())));
    // Indices are not reused after retention drops entries
    assert_eq!(log.write_bytes(b"d").unwrap(), 4);
}

#[tokio::test]
async fn test_queue_view_closeable() {
    let tree = new_tree(1);
    let queue = tree.acquire_queue("/q").unwrap();
    queue.append(b"x").unwrap();
    Closeable::close(queue.as_ref());
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_wal_rejects_oversized_length() {
    use std::io::Write;
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("queue.wal");
    {
        let log = FileAppendLog::open(&path, 1).unwrap();
        log.write_bytes(b"one").unwrap();
    }
    {
        let mut file = fs_err::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
    }
    assert!(FileAppendLog::open(&path, 1).is_err());

    let header = temp_dir.path().join("header.wal");
    fs_err::write(&header, u32::MAX.to_le_bytes()).unwrap();
    assert!(FileAppendLog::open(&header, 1).is_err());
}

#[tokio::test]
async fn test_tailer_skips_dropped_entries() {
    let log: Arc<dyn AppendLog> = Arc::new(crate::log::MemoryAppendLog::new(2));
    for payload in [b"a", b"b", b"c"] {
        log.write_bytes(payload).unwrap();
    }
    let mut tailer = crate::log::LogTailer::new(log, 1);
    assert_eq!(tailer.index(), 2);
    let mut buf = Vec::new();
    assert!(tailer.read_bytes(&mut buf));
    assert_eq!(buf, b"b");
    assert!(tailer.read_bytes(&mut buf));
    assert_eq!(buf, b"c");
    assert!(!tailer.read_bytes(&mut buf));
}
