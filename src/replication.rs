//! Index-ordered log shipping between hosts.
//!
//! Every host appends its local map mutations to its own log under
//! `<map>/.replication/<host_id>`. A source tails that log and ships each
//! entry as a [`ReplicationEvent`]; the sink stores it at the same index in
//! its copy of the origin's log and applies it to the local map through the
//! replicated path, which local replication hooks ignore.

use crate::asset::{Asset, Closeable};
use crate::error::{EngineError, InvalidEventHandler, InvalidSubscriber, Result};
use crate::event::MapEvent;
use crate::event_loop::{EventHandler, EventLoop, HandlerPriority, Progress};
use crate::kvs::{StoreKey, StoreValue};
use crate::log::{LogTailer, QueueView};
use crate::map_view::MapView;
use crate::request_context::RequestContext;
use crate::subscription::Delivery;
use crate::tree::AssetTree;
use crate::types::{
    HostId, LogIndex, ReplicatedMutation, ReplicationEvent, ReplicationHandshake, SubscriberId,
};
use crate::wire::{EventName, Frame, WireOutPublisher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

/// Name of the child asset holding a map's replication logs.
pub const REPLICATION_ASSET: &str = ".replication";

/// Applies entries of another host's log to local state.
pub trait ReplicationApplier: Send + Sync {
    fn apply(&self, origin: HostId, payload: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationRole {
    Source,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    Bootstrapping,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The index did not follow the local log; the event was dropped.
    OutOfOrder,
    /// The handler is closed or not bootstrapped.
    Dropped,
}

/// One side of the replication of a single log between two hosts.
pub struct QueueReplicationHandler {
    csp: String,
    role: ReplicationRole,
    state: ReplicationState,
    origin_host: HostId,
    /// Last index shipped (source) or applied (sink). A source's tailer
    /// advances it.
    cursor: Arc<AtomicU64>,
    asset: Option<Arc<Asset>>,
    queue: Option<Arc<QueueView>>,
    applier: Option<Arc<dyn ReplicationApplier>>,
    closed: Arc<AtomicBool>,
}

impl QueueReplicationHandler {
    /// A handler shipping the log at `csp`, starting after `last_index_received`.
    pub fn source(csp: impl Into<String>, origin_host: HostId, last_index_received: LogIndex) -> Self {
        Self::new(csp.into(), ReplicationRole::Source, origin_host, last_index_received)
    }

    /// A handler receiving the log described by a peer's handshake.
    pub fn sink(handshake: &ReplicationHandshake) -> Self {
        Self::new(
            handshake.csp.clone(),
            ReplicationRole::Sink,
            handshake.origin_host,
            handshake.last_index_received,
        )
    }

    fn new(csp: String, role: ReplicationRole, origin_host: HostId, last: LogIndex) -> Self {
        Self {
            csp,
            role,
            state: ReplicationState::Bootstrapping,
            origin_host,
            cursor: Arc::new(AtomicU64::new(last)),
            asset: None,
            queue: None,
            applier: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn csp(&self) -> &str {
        &self.csp
    }

    pub fn role(&self) -> ReplicationRole {
        self.role
    }

    pub fn state(&self) -> ReplicationState {
        self.state
    }

    pub fn origin_host(&self) -> HostId {
        self.origin_host
    }

    pub fn last_index_received(&self) -> LogIndex {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves the log at `csp`. A source then sends its handshake and
    /// schedules a tailer on the tree's event loop; `tcpBufferSize` in `csp`
    /// bounds the payload bytes the tailer ships per pass.
    #[instrument(skip_all, fields(csp = %self.csp, role = ?self.role))]
    pub fn on_bootstrap(
        &mut self,
        tree: &AssetTree,
        publisher: Arc<dyn WireOutPublisher>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let rc = RequestContext::parse(&self.csp);
        let asset = tree.root().acquire_asset(&rc.full_name());
        let queue = asset.acquire_view_with::<Arc<QueueView>>(&rc)?;

        match self.role {
            ReplicationRole::Sink => {
                self.cursor
                    .store(queue.last_index_appended().unwrap_or(0), Ordering::Release);
                self.applier = asset.find_view::<Arc<dyn ReplicationApplier>>();
                if self.applier.is_none() {
                    warn!("no replication applier yet, entries are logged and replayed once one registers");
                }
            }
            ReplicationRole::Source => {
                let event_loop = asset.find_view::<Arc<EventLoop>>().ok_or_else(|| {
                    EngineError::CapabilityNotFound {
                        capability: type_name::<Arc<EventLoop>>(),
                        path: self.csp.clone(),
                    }
                })?;
                let last_index_received = self.last_index_received();
                let handshake = ReplicationHandshake {
                    csp: self.csp.clone(),
                    origin_host: self.origin_host,
                    last_index_received,
                    is_source: false,
                };
                publisher.put(Frame::new(
                    self.csp.clone(),
                    0,
                    EventName::ReplicationHandshake,
                    &handshake,
                )?)?;
                event_loop.add_handler(Box::new(ReplicationTailer {
                    csp: self.csp.clone(),
                    tailer: queue.tailer_from(last_index_received + 1),
                    cursor: self.cursor.clone(),
                    publisher,
                    closed: self.closed.clone(),
                    batch_bytes: rc.tcp_buffer_size.max(1),
                    buf: Vec::new(),
                }));
            }
        }

        info!(last_index = self.last_index_received(), "replication streaming");
        self.asset = Some(asset);
        self.queue = Some(queue);
        self.state = ReplicationState::Streaming;
        Ok(())
    }

    /// Applies one inbound event if its index directly follows the local
    /// log, or if the local log is empty. The entry is logged only after it
    /// was applied, so a failed apply leaves the index open for a retry.
    pub fn process_event(&mut self, tree: &AssetTree, event: &ReplicationEvent) -> Result<ApplyOutcome> {
        if self.is_closed() {
            trace!(index = event.index, "replication closed, dropping event");
            return Ok(ApplyOutcome::Dropped);
        }
        let Some(queue) = &self.queue else {
            warn!(csp = %self.csp, "replication event before bootstrap");
            return Ok(ApplyOutcome::Dropped);
        };

        if let Some(last) = queue.last_index_appended() {
            if event.index != last + 1 {
                error!(
                    csp = %self.csp,
                    index = event.index,
                    last_index = last,
                    "replication event out of order, dropping"
                );
                return Ok(ApplyOutcome::OutOfOrder);
            }
        }

        if self.applier.is_none() {
            self.applier = match &self.asset {
                Some(asset) => asset.find_view::<Arc<dyn ReplicationApplier>>(),
                None => tree
                    .root()
                    .acquire_asset(&RequestContext::parse(&self.csp).full_name())
                    .find_view::<Arc<dyn ReplicationApplier>>(),
            };
        }
        if let Some(applier) = &self.applier {
            applier.apply(self.origin_host, &event.payload)?;
        }
        queue.log().write_at(event.index, &event.payload)?;
        self.cursor.store(event.index, Ordering::Release);
        trace!(csp = %self.csp, index = event.index, "applied replication event");
        Ok(ApplyOutcome::Applied)
    }

    /// Marks the handler closed. Its tailer removes itself on the next pass.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.state = ReplicationState::Closed;
        debug!(csp = %self.csp, "replication closed");
    }
}

/// Event-loop handler shipping new log entries to the peer.
pub struct ReplicationTailer {
    csp: String,
    tailer: LogTailer,
    /// Shared with the owning handler; the last index put on the wire.
    cursor: Arc<AtomicU64>,
    publisher: Arc<dyn WireOutPublisher>,
    closed: Arc<AtomicBool>,
    batch_bytes: usize,
    buf: Vec<u8>,
}

impl EventHandler for ReplicationTailer {
    fn action(&mut self) -> Result<Progress, InvalidEventHandler> {
        if self.closed.load(Ordering::Acquire) {
            return Err(InvalidEventHandler("replication closed"));
        }
        if self.publisher.is_closed() {
            return Err(InvalidEventHandler("publisher closed"));
        }

        let mut shipped = 0;
        let mut progress = Progress::Idle;
        while shipped < self.batch_bytes && self.publisher.can_take_more_data() {
            let index = self.tailer.index();
            if !self.tailer.read_bytes(&mut self.buf) {
                break;
            }
            progress = Progress::Busy;
            let last = self.cursor.load(Ordering::Acquire);
            if index <= last {
                trace!(index, last, "skipping already sent entry");
                continue;
            }

            let event = ReplicationEvent::new(index, self.buf.clone());
            let frame = Frame::new(self.csp.clone(), 0, EventName::ReplicationEvent, &event)
                .map_err(|err| {
                    error!(csp = %self.csp, index, "failed to encode replication event: {err}");
                    InvalidEventHandler("encode failed")
                })?;
            self.publisher
                .put(frame)
                .map_err(|_| InvalidEventHandler("publisher closed"))?;
            self.cursor.store(index, Ordering::Release);
            shipped += self.buf.len().max(1);
        }
        Ok(progress)
    }

    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Replication
    }
}

/// Records local mutations of a map in this host's replication log and
/// applies entries shipped from other hosts.
pub struct MapReplicator<K, V> {
    map: Arc<MapView<K, V>>,
    local_log: Arc<QueueView>,
    host_id: HostId,
    subscriber_id: SubscriberId,
}

impl<K, V> MapReplicator<K, V>
where
    K: StoreKey + Serialize + DeserializeOwned,
    V: StoreValue + Serialize + DeserializeOwned,
{
    /// Hooks `map` (the view of `asset`) up for replication and registers
    /// the replicator as the applier for logs under `.replication`.
    pub fn new(asset: &Arc<Asset>, map: Arc<MapView<K, V>>) -> Result<Arc<Self>> {
        let host_id = asset.context().host_id();
        let replication = asset.acquire_asset(REPLICATION_ASSET);
        let local_log = replication
            .acquire_asset(&host_id.to_string())
            .acquire_view::<Arc<QueueView>>()?;

        let log = local_log.clone();
        let hook = move |event: &MapEvent<K, V>| -> Result<(), InvalidSubscriber> {
            let mutation = match event {
                MapEvent::Insert { key, new_value } | MapEvent::Update { key, new_value, .. } => {
                    ReplicatedMutation::Put {
                        key: key.clone(),
                        value: new_value.clone(),
                    }
                }
                MapEvent::Remove { key, .. } => ReplicatedMutation::Remove { key: key.clone() },
            };
            let appended = bincode::serde::encode_to_vec(&mutation, bincode::config::standard())
                .map_err(EngineError::from)
                .and_then(|payload| log.append(&payload));
            if let Err(err) = appended {
                error!(log = log.name(), "failed to record mutation: {err}");
            }
            Ok(())
        };
        let subscriber_id = map
            .subscription()?
            .register_topic_subscriber_with(Arc::new(hook), Delivery::LocalOnly);

        let replicator = Arc::new(Self {
            map,
            local_log,
            host_id,
            subscriber_id,
        });
        replication.add_view::<Arc<dyn ReplicationApplier>>(replicator.clone());
        replicator.replay_logged(&replication)?;
        info!(map = asset.full_name(), host_id, "map replication enabled");
        Ok(replicator)
    }

    /// Applies entries other hosts shipped before this replicator existed.
    /// Sinks log such entries without applying them.
    fn replay_logged(&self, replication: &Arc<Asset>) -> Result<()> {
        for child in replication.children() {
            let Ok(origin) = child.name().parse::<HostId>() else {
                continue;
            };
            if origin == self.host_id {
                continue;
            }
            let Some(queue) = child.get_view::<Arc<QueueView>>() else {
                continue;
            };
            let mut tailer = queue.tailer();
            let mut buf = Vec::new();
            let mut replayed = 0;
            while tailer.read_bytes(&mut buf) {
                self.apply(origin, &buf)?;
                replayed += 1;
            }
            if replayed > 0 {
                info!(origin, replayed, "replayed logged replication entries");
            }
        }
        Ok(())
    }

    pub fn local_log(&self) -> &Arc<QueueView> {
        &self.local_log
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn map(&self) -> &Arc<MapView<K, V>> {
        &self.map
    }
}

impl<K, V> ReplicationApplier for MapReplicator<K, V>
where
    K: StoreKey + Serialize + DeserializeOwned,
    V: StoreValue + Serialize + DeserializeOwned,
{
    fn apply(&self, origin: HostId, payload: &[u8]) -> Result<()> {
        if origin == self.host_id {
            return Ok(());
        }
        let (mutation, _): (ReplicatedMutation<K, V>, _) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
        match mutation {
            ReplicatedMutation::Put { key, value } => self.map.replicated_put(key, value),
            ReplicatedMutation::Remove { key } => self.map.replicated_remove(&key),
        }
    }
}

impl<K, V> Closeable for MapReplicator<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    fn close(&self) {
        self.map.unregister_subscriber(self.subscriber_id);
    }
}
