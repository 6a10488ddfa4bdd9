use anyhow::{bail, Result};
use assetkv::{
    error::InvalidSubscriber,
    session::SessionHandler,
    wire::QueuedPublisher,
    AssetTree, EngineConfig, MapEvent,
};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "two_hosts")]
#[command(about = "Replicates a map between two in-process hosts", long_about = None)]
struct Cli {
    /// Keys each host writes
    #[arg(short, long, default_value_t = 10)]
    keys: usize,

    /// Map to replicate
    #[arg(short, long, default_value = "/data")]
    map: String,

    /// Directory for durable logs (in-memory when omitted)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Give up after this many milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,
}

/// A host with the publisher carrying its frames to the peer.
struct Host {
    tree: Arc<AssetTree>,
    outbound: Arc<QueuedPublisher>,
    session: SessionHandler,
}

impl Host {
    fn new(host_id: u8, data_dir: Option<&PathBuf>) -> Result<Self> {
        let config = EngineConfig {
            base_path: data_dir.map(|dir| dir.join(format!("host{host_id}"))),
            ..EngineConfig::for_host(host_id)
        };
        let tree = Arc::new(AssetTree::new(config)?);
        let outbound = Arc::new(QueuedPublisher::new(tree.context().config().publisher_capacity));
        let session = SessionHandler::new(tree.clone(), outbound.clone());
        Ok(Self {
            tree,
            outbound,
            session,
        })
    }

    /// Delivers every frame queued by `self` to `peer`.
    fn flush_to(&self, peer: &Host) -> Result<usize> {
        let frames = self.outbound.drain();
        let count = frames.len();
        for frame in frames {
            peer.session.on_frame(&frame)?;
        }
        Ok(count)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let host1 = Host::new(1, cli.data_dir.as_ref())?;
    let host2 = Host::new(2, cli.data_dir.as_ref())?;

    for host in [&host1, &host2] {
        let replicator = host
            .tree
            .acquire_replicator::<String, String>(&cli.map)?;
        let host_id = replicator.host_id();
        let csp = format!("{}/.replication/{host_id}", cli.map.trim_end_matches('/'));
        host.session.start_replication(&csp, 0)?;
        host.tree.start()?;
    }

    let watched = host2.tree.acquire_map::<String, String>(&cli.map)?;
    watched.register_subscriber(Arc::new(
        |event: &MapEvent<String, String>| -> Result<(), InvalidSubscriber> {
            info!(key = %event.key(), value = ?event.new_value(), "host 2 observed");
            Ok(())
        },
    ))?;

    let map1 = host1.tree.acquire_map::<String, String>(&cli.map)?;
    let map2 = watched;
    for i in 0..cli.keys {
        map1.put(format!("a{i}"), format!("from host 1 #{i}"))?;
        map2.put(format!("b{i}"), format!("from host 2 #{i}"))?;
    }

    let deadline = Instant::now() + Duration::from_millis(cli.timeout_ms);
    let expected = cli.keys * 2;
    loop {
        let shipped = host1.flush_to(&host2)? + host2.flush_to(&host1)?;
        if shipped == 0 && map1.size() == expected && map2.size() == expected {
            break;
        }
        if Instant::now() > deadline {
            warn!(
                host1 = map1.size(),
                host2 = map2.size(),
                expected,
                "hosts did not converge in time"
            );
            bail!("replication timed out");
        }
        sleep(Duration::from_millis(2)).await;
    }

    let mut entries1 = map1.entries();
    let mut entries2 = map2.entries();
    entries1.sort();
    entries2.sort();
    if entries1 != entries2 {
        bail!("hosts converged to different contents");
    }
    info!(entries = entries1.len(), "hosts converged");

    for host in [&host1, &host2] {
        host.session.close();
        host.tree.close();
    }
    Ok(())
}
