#![warn(missing_docs)]

//! metainfo-sim: drives segment lifecycles against the in-process coordinator
//! and prints the client metrics snapshot as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use metainfo_client::{
    ClientConfig, ClientMetrics, Connection, Context, ListOptions, MemoryCoordinator,
    MemoryCoordinatorConfig, MemoryDialer, MetainfoClient, Pointer, RedundancyScheme,
    RemotePiece, SegmentLocator, StorageNode,
};
use metainfo_kv::{FileKvStore, KvStore, MemoryKvStore};
use tokio::task::JoinSet;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "metainfo-sim", about = "Segment lifecycle simulation against an in-process coordinator")]
struct Args {
    /// Client configuration file (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordinator configuration file (.toml or .json)
    #[arg(long)]
    coordinator_config: Option<PathBuf>,

    /// Persist pointers in this directory instead of memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Storage nodes registered with the coordinator
    #[arg(long, default_value_t = 80)]
    nodes: u32,

    /// Nodes taken offline before the run
    #[arg(long, default_value_t = 0)]
    offline: u32,

    /// Objects to upload, read, list and delete
    #[arg(long, default_value_t = 20)]
    segments: u32,

    /// Lifecycles in flight at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Redundancy as min/repair/success/total
    #[arg(long, default_value = "29/35/50/80")]
    redundancy: String,

    /// Coordinator latency per call in milliseconds
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
}

fn parse_redundancy(text: &str) -> Result<RedundancyScheme> {
    let parts: Vec<u32> = text
        .split('/')
        .map(str::parse)
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid redundancy {text:?}"))?;
    let &[min, repair, success, total] = parts.as_slice() else {
        anyhow::bail!("redundancy must have four parts, got {text:?}");
    };
    let scheme = RedundancyScheme::new(min, repair, success, total, 256);
    scheme.validate()?;
    Ok(scheme)
}

async fn lifecycle(client: MetainfoClient, scheme: RedundancyScheme, index: u32) -> Result<()> {
    let ctx = Context::with_timeout(Duration::from_secs(30));
    let loc = SegmentLocator::last("sim", format!("objects/{index:05}").into_bytes());

    let (limits, root) = client
        .create_segment(&ctx, &loc, &scheme, 64 << 20, None)
        .await?;
    let pieces = limits
        .iter()
        .map(|l| RemotePiece::new(l.piece_number, l.storage_node_id))
        .collect();
    let size = i64::try_from(scheme.stripe_size())?.saturating_mul(1024);
    let mut pointer = Pointer::new(size, scheme, root, pieces);
    pointer.metadata = format!("object {index}").into_bytes();
    client.commit_segment(&ctx, &loc, pointer, limits).await?;

    let (_, aligned) = client.read_segment(&ctx, &loc).await?;
    tracing::debug!(index, authorized = aligned.present(), "read back");

    client
        .list_segments(&ctx, "sim", ListOptions::new("objects/").limit(10))
        .await?;
    client.delete_segment(&ctx, &loc).await?;
    Ok(())
}

fn succeeded(result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "lifecycle failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let scheme = parse_redundancy(&args.redundancy)?;

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if config.api_key.is_empty() {
        config.api_key = String::from("metainfo-sim");
    }
    let coordinator_config = match &args.coordinator_config {
        Some(path) => MemoryCoordinatorConfig::from_file(path)?,
        None => MemoryCoordinatorConfig::default(),
    };

    let kv: Arc<dyn KvStore> = match &args.data_dir {
        Some(dir) => Arc::new(FileKvStore::open(dir)?),
        None => Arc::new(MemoryKvStore::new()),
    };
    let coordinator = Arc::new(MemoryCoordinator::new(kv.clone(), coordinator_config));
    coordinator.register_api_key(config.api_key.clone());
    for i in 0..args.nodes {
        let node = StorageNode::simulated(i);
        let id = node.id;
        coordinator.add_node(node);
        if i < args.offline {
            coordinator.set_online(&id, false);
        }
    }
    coordinator.set_latency(Duration::from_millis(args.latency_ms));
    tracing::info!(
        nodes = args.nodes,
        online = coordinator.online_count(),
        segments = args.segments,
        "starting simulation"
    );

    let metrics = Arc::new(ClientMetrics::new());
    let dialer = MemoryDialer::new(coordinator.clone());
    let connection = Connection::dial(&Context::background(), &dialer, &config)
        .await?
        .with_monitor(metrics.clone());

    let mut tasks = JoinSet::new();
    let mut failed = 0u32;
    for index in 0..args.segments {
        if tasks.len() >= args.concurrency.max(1) {
            if let Some(joined) = tasks.join_next().await {
                failed += u32::from(!succeeded(joined?));
            }
        }
        tasks.spawn(lifecycle(connection.client(), scheme, index));
    }
    while let Some(joined) = tasks.join_next().await {
        failed += u32::from(!succeeded(joined?));
    }

    connection.close();
    kv.close()?;
    tracing::info!(failed, "simulation finished");
    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    Ok(())
}
