//! AssetKV - A hierarchical tree of typed key-value views with subscriptions
//! and index-ordered replication
//!
//! AssetKV organizes data as a tree of named assets, like a filesystem
//! namespace. Each asset lazily resolves typed views (maps, queues, topic
//! publishers, replicators) through ordered rules, and every map mutation is
//! observable by local and remote subscribers.
//!
//! # Key Features
//!
//! - **Rule-based view resolution**: Views are built on first use by leaf or wrapping rules and cached per asset
//! - **Decorated stores**: Segmented memory store, subscription-aware decorator, type-translating decorator
//! - **Topic and key subscribers**: Synchronous, ordered fan-out with automatic removal of dead subscribers
//! - **Remote sessions**: Tid-multiplexed subscriptions over one connection with backpressure
//! - **Log shipping**: Per-host append logs replicated in strict index order
//! - **Transport-agnostic**: Frames go through a publisher you drain
//!
//! # Quick Start
//!
//! ```rust
//! use assetkv::{AssetTree, EngineConfig};
//!
//! let tree = AssetTree::new(EngineConfig::default()).unwrap();
//! let map = tree.acquire_map::<String, String>("/data").unwrap();
//! map.put("k1".to_string(), "v1".to_string()).unwrap();
//! assert_eq!(map.get(&"k1".to_string()), Some("v1".to_string()));
//! assert_eq!(map.size(), 1);
//! ```
//!
//! # Architecture
//!
//! A string map at `/data` is a chain of views on the `/data` asset:
//! [`kvs::MemoryKeyValueStore`] of bytes, wrapped by
//! [`kvs::SubscriptionKeyValueStore`], wrapped by
//! [`kvs::TranslatingKeyValueStore`], presented as [`MapView`]. Events are
//! produced once, at the subscription layer, and translated outward.
//!
//! Replication keeps one log per origin host under `/data/.replication/<host>`.
//! See [`replication`] for the protocol.
//!
//! # Non-goals
//!
//! AssetKV intentionally does NOT provide:
//! - Query or filter languages
//! - Authentication or access control
//! - Compression at rest
//! - Network transport layer
//! - Automatic resynchronization after an out-of-order replication event

pub mod asset;
pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod kvs;
pub mod log;
pub mod map_view;
pub mod replication;
pub mod request_context;
pub mod session;
pub mod subscription;
pub mod tree;
pub mod types;
pub mod wal;
pub mod wire;

pub use asset::Asset;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use event::MapEvent;
pub use map_view::{MapView, TopicPublisher};
pub use request_context::RequestContext;
pub use session::SessionHandler;
pub use tree::AssetTree;

#[cfg(test)]
mod tests;
