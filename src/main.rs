use clap::Parser;
use model_cluster::config::ClusterConfig;
use model_cluster::dispatch::service::NodeComponents;
use model_cluster::membership::provider::MembershipProvider;
use model_cluster::membership::service::MembershipService;
use model_cluster::membership::types::{LocalNodeSpec, NodeRole};
use model_cluster::node::ClusterNode;
use model_cluster::runtime::file::FileModelRuntime;
use model_cluster::server::build_router;
use model_cluster::store::SharedStore;
use model_cluster::store::memory::InMemoryArtifactStore;
use model_cluster::store::remote::HttpArtifactStore;
use model_cluster::transport::http::HttpTransport;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A node of the model distribution cluster.
#[derive(Debug, Parser)]
#[command(name = "model-cluster", version)]
struct Args {
    /// Gossip address; the HTTP API listens on the same IP, port + 1000.
    #[arg(long)]
    bind: SocketAddr,

    /// Gossip address of an existing member (repeatable).
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    #[arg(long)]
    name: Option<String>,

    /// Comma separated: cluster_manager, data, ml, ingest.
    #[arg(long, value_delimiter = ',', default_value = "data,ml")]
    roles: Vec<NodeRole>,

    #[arg(long)]
    group: Option<String>,

    /// HTTP address of the node hosting the artifact store. Without it this
    /// node hosts the store itself.
    #[arg(long)]
    store: Option<SocketAddr>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(cache_dir) = &args.cache_dir {
        config.chunk.cache_dir = cache_dir.clone();
    }
    config.validate()?;

    let http_addr = SocketAddr::new(args.bind.ip(), args.bind.port() + 1000);
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("node-{}", args.bind.port()));

    tracing::info!("Starting node {} on {}", name, args.bind);
    if !args.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", args.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let spec = LocalNodeSpec {
        name,
        roles: args.roles.iter().copied().collect::<BTreeSet<_>>(),
        group: args.group.clone(),
        http_addr,
    };
    let membership = MembershipService::new(args.bind, spec, args.seeds.clone()).await?;
    tracing::info!("Node ID: {}", membership.local_node_id());

    // 2. Artifact store, hosted here or reached over HTTP:
    let (store, hosted_store): (SharedStore, Option<SharedStore>) = match args.store {
        Some(addr) => {
            tracing::info!("Using artifact store at {}", addr);
            let remote = HttpArtifactStore::new(addr, config.dispatch.request_timeout());
            (Arc::new(remote), None)
        }
        None => {
            tracing::info!("Hosting the artifact store on this node");
            let hosted: SharedStore = Arc::new(InMemoryArtifactStore::new());
            (hosted.clone(), Some(hosted))
        }
    };

    // 3. Node components:
    let runtime = Arc::new(FileModelRuntime::new(config.chunk.cache_dir.join("resident")));
    let transport = Arc::new(HttpTransport::new(
        config.dispatch.request_timeout(),
        config.dispatch.forward_attempts,
    ));
    let events = membership.subscribe();
    let node = ClusterNode::new(
        config,
        NodeComponents {
            membership: membership.clone(),
            transport,
            store,
            runtime,
        },
    );

    // 4. Spawn membership service:
    let service = membership.clone();
    tokio::spawn(async move {
        service.start().await;
    });

    // 5. Spawn reconciler and stats reporter:
    node.spawn_background(Some(events));
    node.spawn_stats(Duration::from_secs(5));

    // 6. Start HTTP server:
    let app = build_router(node, hosted_store);
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
