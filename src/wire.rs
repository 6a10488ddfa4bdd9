//! Framing between a session and its transport.
//!
//! A frame carries a channel path (`csp`), a transaction id, an event name
//! and an opaque bincode payload. The core reads the event name and decodes
//! the payload type it expects for that event; nothing else about a frame is
//! interpreted.

use crate::error::{EngineError, Result};
use crate::types::Tid;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    RegisterSubscriber,
    UnregisterSubscriber,
    /// An event delivered to the subscription identified by the frame's tid.
    Reply,
    OnEndOfSubscription,
    ReplicationHandshake,
    ReplicationEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub csp: String,
    pub tid: Tid,
    pub event: EventName,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new<T: Serialize>(
        csp: impl Into<String>,
        tid: Tid,
        event: EventName,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            csp: csp.into(),
            tid,
            event,
            payload: bincode::serde::encode_to_vec(payload, bincode::config::standard())?,
        })
    }

    /// Decodes the payload as `T`.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())?;
        Ok(value)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(frame)
    }
}

/// Outbound side of a connection.
pub trait WireOutPublisher: Send + Sync {
    fn is_closed(&self) -> bool;

    /// `false` while the outbound buffer is full. Producers skip their turn
    /// instead of waiting.
    fn can_take_more_data(&self) -> bool;

    fn put(&self, frame: Frame) -> Result<()>;
}

/// Bounded in-memory publisher drained by the transport.
pub struct QueuedPublisher {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    closed: AtomicBool,
}

impl QueuedPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Removes and returns every queued frame, oldest first.
    pub fn drain(&self) -> Vec<Frame> {
        self.frames.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Marks the connection closed and discards unsent frames.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.frames.lock().clear();
    }
}

impl WireOutPublisher for QueuedPublisher {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn can_take_more_data(&self) -> bool {
        !self.is_closed() && self.frames.lock().len() < self.capacity
    }

    /// Frames are accepted past capacity; capacity only drives
    /// [`WireOutPublisher::can_take_more_data`].
    fn put(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        trace!(csp = %frame.csp, tid = frame.tid, event = ?frame.event, "queued frame");
        self.frames.lock().push_back(frame);
        Ok(())
    }
}
