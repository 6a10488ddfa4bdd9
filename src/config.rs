//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid single-host configuration.

use crate::types::HostId;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifier of this host within the cluster.
    pub host_id: HostId,

    /// Number of independent segments each in-memory store is split into.
    pub segments: usize,

    /// Outbound frames a connection may queue before it reports backpressure.
    pub publisher_capacity: usize,

    /// How long the event loop sleeps after a pass where no handler was busy.
    pub event_loop_pause_ms: u64,

    /// Entries retained by in-memory logs; 0 keeps everything.
    pub max_log_entries: usize,

    /// Directory for durable logs. In-memory logs are used when unset.
    pub base_path: Option<PathBuf>,

    pub cluster: ClusterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_id: 1,
            segments: 16,
            publisher_capacity: 1024,
            event_loop_pause_ms: 1,
            max_log_entries: 0,
            base_path: None,
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    pub hosts: Vec<HostDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostDetails {
    pub host_id: HostId,
    /// `host:port`, `*` as host meaning any local interface.
    pub connect_uri: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ClusterConfig {
    pub fn host(&self, host_id: HostId) -> Option<&HostDetails> {
        self.hosts.iter().find(|h| h.host_id == host_id)
    }

    /// Hosts other than `local`.
    pub fn peers(&self, local: HostId) -> impl Iterator<Item = &HostDetails> {
        self.hosts.iter().filter(move |h| h.host_id != local)
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).context("failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            bail!("segments must be at least 1");
        }
        if self.publisher_capacity == 0 {
            bail!("publisher_capacity must be at least 1");
        }
        let mut seen = HashSet::new();
        for host in &self.cluster.hosts {
            if !seen.insert(host.host_id) {
                bail!("duplicate host id {} in cluster", host.host_id);
            }
        }
        Ok(())
    }

    pub fn for_host(host_id: HostId) -> Self {
        Self {
            host_id,
            ..Self::default()
        }
    }
}
