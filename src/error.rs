use thiserror::Error;

/// Errors surfaced by the engine to the caller that requested an operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No rule could produce the requested capability for this asset.
    #[error("capability {capability} not found for asset {path}")]
    CapabilityNotFound {
        capability: &'static str,
        path: String,
    },

    #[error("unable to resolve value type {0:?}")]
    ValueTypeUnresolved(String),

    /// A subscriber or segment consumer rejected an item.
    #[error("subscriber is no longer valid")]
    InvalidSubscriber,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("resource is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("append log failure: {0:#}")]
    Log(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Returned by a subscriber when it can no longer accept events, e.g. because
/// its transport closed. The registry drops it; the mutator never sees this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid subscriber")]
pub struct InvalidSubscriber;

impl From<InvalidSubscriber> for EngineError {
    fn from(_: InvalidSubscriber) -> Self {
        EngineError::InvalidSubscriber
    }
}

/// Returned by an event-loop handler that must be removed from the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid event handler: {0}")]
pub struct InvalidEventHandler(pub &'static str);

impl From<bincode::error::EncodeError> for EngineError {
    fn from(err: bincode::error::EncodeError) -> Self {
        EngineError::Codec(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(err: bincode::error::DecodeError) -> Self {
        EngineError::Codec(err.to_string())
    }
}
