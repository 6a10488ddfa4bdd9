use serde::{Deserialize, Serialize};

/// Small integer identifying a host in the cluster.
pub type HostId = u8;

/// Transaction id correlating one logical request/subscription on a connection.
pub type Tid = u64;

/// Position of an entry in one host's append log. The first entry is 1.
pub type LogIndex = u64;

/// Identifier handed out by a subscription registry, increasing per registry.
pub type SubscriberId = u64;

/// One shipped entry of a host's replication log.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationEvent {
    pub index: LogIndex,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for ReplicationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEvent")
            .field("index", &self.index)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl ReplicationEvent {
    pub fn new(index: LogIndex, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }
}

/// Sent by a source to its peer when replication starts. The peer is told to
/// act as a sink only, so it never ships the same entries back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationHandshake {
    /// Path of the replicated queue asset.
    pub csp: String,
    /// Host whose log is being shipped.
    pub origin_host: HostId,
    pub last_index_received: LogIndex,
    pub is_source: bool,
}

/// Serialized form of a map mutation stored in a replication log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicatedMutation<K, V> {
    Put { key: K, value: V },
    Remove { key: K },
}
