//! Parsing of `/seg1/seg2/name?key=value&...` request strings.

use std::any::TypeId;
use std::path::PathBuf;
use tracing::trace;

/// Capability family named by the `view` query key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    Map,
    Queue,
    Publisher,
    TopicPublisher,
    KeyValueStore,
    Replication,
}

impl ViewType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "map" | "Map" => Some(Self::Map),
            "queue" | "Queue" => Some(Self::Queue),
            "publisher" | "Publisher" => Some(Self::Publisher),
            "topicPublisher" | "TopicPublisher" => Some(Self::TopicPublisher),
            "kvStore" | "keyValueStore" => Some(Self::KeyValueStore),
            "replication" | "Replication" => Some(Self::Replication),
            _ => None,
        }
    }
}

/// Element type named by `keyType` / `valueType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementType {
    String,
    Bytes,
    Long,
    Other(String),
}

impl ElementType {
    pub fn parse(value: &str) -> Self {
        match value {
            "string" | "String" | "java.lang.String" | "CharSequence" => Self::String,
            "bytes" | "byte[]" | "Bytes" | "BytesStore" => Self::Bytes,
            "long" | "Long" | "java.lang.Long" | "i64" | "u64" => Self::Long,
            other => Self::Other(other.to_string()),
        }
    }

    /// The element type a Rust type is stored as, if it is one of the named
    /// ones.
    pub fn of<T: 'static>() -> Option<Self> {
        let id = TypeId::of::<T>();
        if id == TypeId::of::<String>() {
            Some(Self::String)
        } else if id == TypeId::of::<Vec<u8>>() {
            Some(Self::Bytes)
        } else if id == TypeId::of::<i64>() || id == TypeId::of::<u64>() {
            Some(Self::Long)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    path_name: String,
    name: String,
    pub view_type: Option<ViewType>,
    pub key_type: Option<ElementType>,
    pub value_type: Option<ElementType>,
    pub base_path: Option<PathBuf>,
    pub put_returns_null: Option<bool>,
    pub remove_returns_null: Option<bool>,
    /// Whether a subscription first receives the current entries.
    pub bootstrap: Option<bool>,
    pub segments: Option<usize>,
    /// Payload bytes a replication source ships per event-loop pass.
    pub tcp_buffer_size: usize,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            path_name: String::new(),
            name: String::new(),
            view_type: None,
            key_type: None,
            value_type: None,
            base_path: None,
            put_returns_null: None,
            remove_returns_null: None,
            bootstrap: None,
            segments: None,
            tcp_buffer_size: 1024,
        }
    }
}

impl RequestContext {
    /// Parses a request string. Never fails: unknown keys and values that do
    /// not parse are ignored and leave the defaults in place.
    pub fn parse(uri: &str) -> Self {
        let mut rc = Self::default();
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };

        let trimmed = path.trim_end_matches('/');
        let trimmed = trimmed.trim_start_matches('/');
        match trimmed.rsplit_once('/') {
            Some((parent, name)) => {
                rc.path_name = parent.to_string();
                rc.name = name.to_string();
            }
            None => rc.name = trimmed.to_string(),
        }

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                rc.apply(key, value);
            }
        }
        rc
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "view" | "viewType" => self.view_type = ViewType::parse(value),
            "keyType" => self.key_type = Some(ElementType::parse(value)),
            "valueType" => self.value_type = Some(ElementType::parse(value)),
            "basePath" => self.base_path = Some(PathBuf::from(value)),
            "putReturnsNull" => self.put_returns_null = value.parse().ok(),
            "removeReturnsNull" => self.remove_returns_null = value.parse().ok(),
            "bootstrap" => self.bootstrap = value.parse().ok(),
            "segments" => self.segments = value.parse().ok().filter(|&s: &usize| s > 0),
            "tcpBufferSize" => {
                if let Ok(v) = value.parse() {
                    self.tcp_buffer_size = v;
                }
            }
            _ => trace!(key, "ignoring unrecognized request context key"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent path without leading or trailing slashes.
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    /// `/parent/path/name`, or `/` for the root.
    pub fn full_name(&self) -> String {
        if self.path_name.is_empty() {
            format!("/{}", self.name)
        } else {
            format!("/{}/{}", self.path_name, self.name)
        }
    }

    pub fn view_type(mut self, view_type: ViewType) -> Self {
        self.view_type = Some(view_type);
        self
    }

    pub fn value_type(mut self, value_type: ElementType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn put_returns_null(&self) -> bool {
        self.put_returns_null.unwrap_or(false)
    }

    pub fn remove_returns_null(&self) -> bool {
        self.remove_returns_null.unwrap_or(false)
    }

    pub fn bootstrap(&self) -> bool {
        self.bootstrap.unwrap_or(true)
    }
}
