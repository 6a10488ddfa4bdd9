//! Index-addressed append logs and the queue view built on them.
//!
//! Indices start at 1 and increase by one per local write. Entries shipped
//! from another host are stored at the index they had on that host
//! ([`AppendLog::write_at`]), so a sink's log mirrors its source.

use crate::error::{EngineError, Result};
use crate::types::LogIndex;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

pub trait AppendLog: Send + Sync {
    /// Index of the newest entry, `None` while the log is empty.
    fn last_index_appended(&self) -> Option<LogIndex>;

    /// Appends a local entry and returns its index.
    fn write_bytes(&self, payload: &[u8]) -> Result<LogIndex>;

    /// Stores an entry at a caller-chosen index, which must be greater than
    /// the last index. This is the raw path replicated entries take.
    fn write_at(&self, index: LogIndex, payload: &[u8]) -> Result<()>;

    /// First retained entry whose index is at least `index`.
    fn read_from(&self, index: LogIndex) -> Option<(LogIndex, Vec<u8>)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self) {}
}

/// Cursor over a log. Reading never blocks: an exhausted tailer reports no
/// data and picks up new entries on a later call.
pub struct LogTailer {
    log: Arc<dyn AppendLog>,
    next: LogIndex,
}

impl LogTailer {
    pub fn new(log: Arc<dyn AppendLog>, start: LogIndex) -> Self {
        Self {
            log,
            next: start.max(1),
        }
    }

    /// Index of the entry the next successful read returns.
    pub fn index(&self) -> LogIndex {
        self.log
            .read_from(self.next)
            .map_or(self.next, |(index, _)| index)
    }

    /// Copies the next entry into `buf` and advances. Returns `false` when
    /// there is nothing to read. Entries already dropped by retention are
    /// skipped with a warning.
    pub fn read_bytes(&mut self, buf: &mut Vec<u8>) -> bool {
        match self.log.read_from(self.next) {
            Some((index, payload)) => {
                if index > self.next {
                    warn!(
                        from = self.next,
                        to = index,
                        "tailer skipped entries no longer retained"
                    );
                }
                buf.clear();
                buf.extend_from_slice(&payload);
                self.next = index + 1;
                true
            }
            None => false,
        }
    }

    pub fn move_to(&mut self, index: LogIndex) {
        self.next = index.max(1);
    }
}

struct MemoryLogState {
    entries: BTreeMap<LogIndex, Vec<u8>>,
    last: Option<LogIndex>,
}

/// Heap-backed log. With `max_entries > 0` the oldest entries are dropped
/// once the limit is exceeded; indices are never reused.
pub struct MemoryAppendLog {
    state: RwLock<MemoryLogState>,
    max_entries: usize,
}

impl MemoryAppendLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: RwLock::new(MemoryLogState {
                entries: BTreeMap::new(),
                last: None,
            }),
            max_entries,
        }
    }

    fn insert(state: &mut MemoryLogState, index: LogIndex, payload: &[u8], max_entries: usize) {
        state.entries.insert(index, payload.to_vec());
        state.last = Some(index);
        if max_entries > 0 {
            while state.entries.len() > max_entries {
                state.entries.pop_first();
            }
        }
    }
}

impl AppendLog for MemoryAppendLog {
    fn last_index_appended(&self) -> Option<LogIndex> {
        self.state.read().last
    }

    fn write_bytes(&self, payload: &[u8]) -> Result<LogIndex> {
        let mut state = self.state.write();
        let index = state.last.map_or(1, |last| last + 1);
        Self::insert(&mut state, index, payload, self.max_entries);
        trace!(index, len = payload.len(), "appended log entry");
        Ok(index)
    }

    fn write_at(&self, index: LogIndex, payload: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if let Some(last) = state.last {
            if index <= last {
                return Err(EngineError::Log(anyhow::anyhow!(
                    "index {index} is not after last index {last}"
                )));
            }
        }
        Self::insert(&mut state, index, payload, self.max_entries);
        Ok(())
    }

    fn read_from(&self, index: LogIndex) -> Option<(LogIndex, Vec<u8>)> {
        self.state
            .read()
            .entries
            .range(index..)
            .next()
            .map(|(index, payload)| (*index, payload.clone()))
    }

    fn len(&self) -> usize {
        self.state.read().entries.len()
    }
}

/// A named append log exposed as an asset view.
pub struct QueueView {
    name: String,
    log: Arc<dyn AppendLog>,
}

impl QueueView {
    pub fn new(name: impl Into<String>, log: Arc<dyn AppendLog>) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn append(&self, payload: &[u8]) -> Result<LogIndex> {
        self.log.write_bytes(payload)
    }

    pub fn last_index_appended(&self) -> Option<LogIndex> {
        self.log.last_index_appended()
    }

    pub fn tailer(&self) -> LogTailer {
        LogTailer::new(self.log.clone(), 1)
    }

    pub fn tailer_from(&self, index: LogIndex) -> LogTailer {
        LogTailer::new(self.log.clone(), index)
    }

    pub fn log(&self) -> Arc<dyn AppendLog> {
        self.log.clone()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

impl crate::asset::Closeable for QueueView {
    fn close(&self) {
        self.log.close();
    }
}
