//! Per-connection demultiplexing of subscriptions and replication streams.
//!
//! Every inbound frame carries a tid. A `RegisterSubscriber` frame binds a
//! remote listener to that tid; events it receives go out as `Reply` frames
//! tagged with the same tid. Replication frames are routed by `csp` to the
//! handler replicating that log.

use crate::error::{EngineError, InvalidSubscriber, Result};
use crate::event::MapEvent;
use crate::kvs::StoreValue;
use crate::replication::{ApplyOutcome, QueueReplicationHandler};
use crate::request_context::{ElementType, RequestContext};
use crate::subscription::Subscriber;
use crate::tree::AssetTree;
use crate::types::{LogIndex, ReplicationEvent, ReplicationHandshake, Tid};
use crate::wire::{EventName, Frame, WireOutPublisher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Payload of a `RegisterSubscriber` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionQuery {
    /// Request string of the map to subscribe to, e.g. `/data?putReturnsNull=true`.
    pub select: String,
    /// Restricts the subscription to one key.
    pub key: Option<String>,
    /// `string` (default) or `bytes`.
    pub value_type: Option<String>,
}

impl SubscriptionQuery {
    pub fn topic(select: impl Into<String>) -> Self {
        Self {
            select: select.into(),
            key: None,
            value_type: None,
        }
    }

    pub fn key(select: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            select: select.into(),
            key: Some(key.into()),
            value_type: None,
        }
    }
}

/// Forwards events to the peer as frames tagged with `tid`.
struct RemoteListener {
    csp: String,
    tid: Tid,
    publisher: Arc<dyn WireOutPublisher>,
}

impl<V: StoreValue + Serialize> Subscriber<MapEvent<String, V>> for RemoteListener {
    fn on_message(&self, event: &MapEvent<String, V>) -> Result<(), InvalidSubscriber> {
        if self.publisher.is_closed() {
            return Err(InvalidSubscriber);
        }
        let frame = match Frame::new(self.csp.clone(), self.tid, EventName::Reply, event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(tid = self.tid, "failed to encode event: {err}");
                return Ok(());
            }
        };
        self.publisher.put(frame).map_err(|_| InvalidSubscriber)
    }

    fn on_end_of_subscription(&self) {
        if self.publisher.is_closed() {
            return;
        }
        if let Ok(frame) = Frame::new(self.csp.clone(), self.tid, EventName::OnEndOfSubscription, &())
        {
            let _ = self.publisher.put(frame);
        }
    }
}

struct RemoteSubscription {
    select: String,
    unregister: Box<dyn Fn() -> bool + Send>,
}

pub struct SessionHandler {
    tree: Arc<AssetTree>,
    publisher: Arc<dyn WireOutPublisher>,
    tid_to_listener: Mutex<HashMap<Tid, RemoteSubscription>>,
    replication: Mutex<HashMap<String, QueueReplicationHandler>>,
}

impl SessionHandler {
    pub fn new(tree: Arc<AssetTree>, publisher: Arc<dyn WireOutPublisher>) -> Self {
        Self {
            tree,
            publisher,
            tid_to_listener: Mutex::new(HashMap::new()),
            replication: Mutex::new(HashMap::new()),
        }
    }

    pub fn publisher(&self) -> &Arc<dyn WireOutPublisher> {
        &self.publisher
    }

    pub fn subscription_count(&self) -> usize {
        self.tid_to_listener.lock().len()
    }

    pub fn is_registered(&self, tid: Tid) -> bool {
        self.tid_to_listener.lock().contains_key(&tid)
    }

    /// Handles one inbound frame. Protocol misuse is logged and ignored;
    /// only configuration errors are returned.
    #[instrument(skip_all, fields(tid = frame.tid, event = ?frame.event))]
    pub fn on_frame(&self, frame: &Frame) -> Result<()> {
        match frame.event {
            EventName::RegisterSubscriber => self.on_register(frame),
            EventName::UnregisterSubscriber => {
                self.unregister(frame.tid);
                Ok(())
            }
            EventName::ReplicationHandshake => self.on_handshake(frame),
            EventName::ReplicationEvent => {
                self.on_replication_event(frame);
                Ok(())
            }
            EventName::Reply | EventName::OnEndOfSubscription => {
                warn!("unexpected inbound event, ignoring");
                Ok(())
            }
        }
    }

    fn on_register(&self, frame: &Frame) -> Result<()> {
        let tid = frame.tid;
        let mut listeners = self.tid_to_listener.lock();
        if listeners.contains_key(&tid) {
            info!(tid, "duplicate registration for tid, ignoring");
            return Ok(());
        }
        let query = match frame.read::<SubscriptionQuery>() {
            Ok(query) => query,
            Err(err) => {
                warn!(tid, "malformed subscription query: {err}");
                return Ok(());
            }
        };
        if query.select.is_empty() {
            warn!(tid, "subscription query has an empty selection, ignoring");
            return Ok(());
        }

        let rc = RequestContext::parse(&query.select);
        if let Some(key_type) = rc.key_type.as_ref().filter(|t| **t != ElementType::String) {
            warn!(tid, ?key_type, "remote subscriptions are keyed by string, ignoring");
            return Ok(());
        }

        let listener = Arc::new(RemoteListener {
            csp: frame.csp.clone(),
            tid,
            publisher: self.publisher.clone(),
        });
        let value_type = query
            .value_type
            .as_deref()
            .map(ElementType::parse)
            .or_else(|| rc.value_type.clone())
            .unwrap_or(ElementType::String);
        let subscribed = match value_type {
            ElementType::String => self.subscribe::<String>(&query, &rc, listener),
            ElementType::Bytes => self.subscribe::<Vec<u8>>(&query, &rc, listener),
            other => {
                warn!(tid, value_type = ?other, "unable to resolve value type, ignoring");
                return Ok(());
            }
        };
        let unregister = match subscribed {
            Ok(unregister) => unregister,
            Err(err @ (EngineError::ValueTypeUnresolved(_) | EngineError::CapabilityNotFound { .. })) => {
                warn!(tid, select = %query.select, "cannot subscribe: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        debug!(tid, select = %query.select, "registered remote subscriber");
        listeners.insert(
            tid,
            RemoteSubscription {
                select: query.select,
                unregister,
            },
        );
        Ok(())
    }

    /// Registers `listener` on the map named by the query. With `bootstrap`
    /// (the default) the current entries are sent first as inserts.
    fn subscribe<V>(
        &self,
        query: &SubscriptionQuery,
        rc: &RequestContext,
        listener: Arc<RemoteListener>,
    ) -> Result<Box<dyn Fn() -> bool + Send>>
    where
        V: StoreValue + Serialize,
    {
        let map = self.tree.acquire_map::<String, V>(&query.select)?;
        if rc.bootstrap() {
            let current: Vec<(String, V)> = match &query.key {
                Some(key) => map.get(key).map(|v| (key.clone(), v)).into_iter().collect(),
                None => map.entries(),
            };
            for (key, new_value) in current {
                let event = MapEvent::Insert { key, new_value };
                if listener.on_message(&event).is_err() {
                    break;
                }
            }
        }
        let id = match &query.key {
            Some(key) => map.register_key_subscriber(key.clone(), listener)?,
            None => map.register_subscriber(listener)?,
        };
        Ok(Box::new(move || map.unregister_subscriber(id)))
    }

    /// Removes the subscription bound to `tid`. Unknown tids are ignored.
    pub fn unregister(&self, tid: Tid) {
        let removed = self.tid_to_listener.lock().remove(&tid);
        match removed {
            Some(subscription) => {
                (subscription.unregister)();
                debug!(tid, select = %subscription.select, "unregistered remote subscriber");
            }
            None => warn!(tid, "no subscription registered for tid"),
        }
    }

    /// Removes every subscription this session holds.
    pub fn unregister_all(&self) {
        let subscriptions: Vec<(Tid, RemoteSubscription)> =
            self.tid_to_listener.lock().drain().collect();
        for (tid, subscription) in subscriptions {
            (subscription.unregister)();
            debug!(tid, "unregistered remote subscriber");
        }
    }

    /// Starts shipping the log at `csp` to the peer, after `last_index_received`.
    pub fn start_replication(&self, csp: &str, last_index_received: LogIndex) -> Result<()> {
        let mut handler = QueueReplicationHandler::source(
            csp,
            self.tree.context().host_id(),
            last_index_received,
        );
        handler.on_bootstrap(&self.tree, self.publisher.clone())?;
        if let Some(mut previous) = self.replication.lock().insert(csp.to_string(), handler) {
            previous.close();
        }
        Ok(())
    }

    fn on_handshake(&self, frame: &Frame) -> Result<()> {
        let handshake = match frame.read::<ReplicationHandshake>() {
            Ok(handshake) => handshake,
            Err(err) => {
                warn!("malformed replication handshake: {err}");
                return Ok(());
            }
        };
        if handshake.is_source {
            warn!(csp = %handshake.csp, "peer asked this host to ship its log, ignoring");
            return Ok(());
        }
        let mut handler = QueueReplicationHandler::sink(&handshake);
        handler.on_bootstrap(&self.tree, self.publisher.clone())?;
        if let Some(mut previous) = self.replication.lock().insert(handshake.csp, handler) {
            previous.close();
        }
        Ok(())
    }

    fn on_replication_event(&self, frame: &Frame) {
        let event = match frame.read::<ReplicationEvent>() {
            Ok(event) => event,
            Err(err) => {
                warn!(csp = %frame.csp, "malformed replication event: {err}");
                return;
            }
        };
        let mut replication = self.replication.lock();
        let Some(handler) = replication.get_mut(&frame.csp) else {
            warn!(csp = %frame.csp, "replication event for unknown log");
            return;
        };
        match handler.process_event(&self.tree, &event) {
            Ok(ApplyOutcome::Applied) => {}
            Ok(outcome) => debug!(csp = %frame.csp, index = event.index, ?outcome, "event not applied"),
            Err(err) => error!(csp = %frame.csp, index = event.index, "failed to apply replication event: {err}"),
        }
    }

    pub fn replication_handler<R>(
        &self,
        csp: &str,
        f: impl FnOnce(&QueueReplicationHandler) -> R,
    ) -> Option<R> {
        self.replication.lock().get(csp).map(f)
    }

    /// Closes replication first, then drops every subscription.
    pub fn close(&self) {
        let handlers: Vec<(String, QueueReplicationHandler)> =
            self.replication.lock().drain().collect();
        for (_, mut handler) in handlers {
            handler.close();
        }
        self.unregister_all();
        info!("session closed");
    }
}
