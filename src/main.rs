use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use durable_executor::cluster::http::{HttpTransport, internal_router};
use durable_executor::cluster::membership::GossipMembership;
use durable_executor::config::NodeConfig;
use durable_executor::executor::handlers::{handle_result, handle_shutdown, handle_stats, handle_submit};
use durable_executor::executor::protocol::{ENDPOINT_RESULT, ENDPOINT_SHUTDOWN, ENDPOINT_STATS, ENDPOINT_SUBMIT};
use durable_executor::executor::registry::TaskRegistry;
use durable_executor::node::ClusterNode;
use durable_executor::tasks::register_builtin_tasks;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A member of a durable executor cluster.
#[derive(Debug, Parser)]
#[command(name = "durable-node", version)]
struct Args {
    /// Gossip address; the HTTP API listens on the same IP, port + 1000.
    #[arg(long)]
    bind: SocketAddr,

    /// Gossip address of an existing member. Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// JSON node configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    tracing::info!("Starting node on {}", args.bind);
    if !args.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", args.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let membership = GossipMembership::new(args.bind, args.seeds.clone()).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    // 2. Node:
    let registry = TaskRegistry::new();
    register_builtin_tasks(&registry);
    let transport = Arc::new(HttpTransport::new(membership.clone(), config.invocation.clone()));
    let node = ClusterNode::builder(config)
        .registry(registry)
        .build(membership.clone(), transport);

    // 3. HTTP Router:
    let app = Router::new()
        .route(ENDPOINT_SUBMIT, post(handle_submit))
        .route(ENDPOINT_RESULT, get(handle_result))
        .route(ENDPOINT_SHUTDOWN, post(handle_shutdown))
        .route(ENDPOINT_STATS, get(handle_stats))
        .layer(Extension(node.clone()))
        .merge(internal_router(node.engine().clone()));

    // 4. Spawn membership service and partition handover:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });
    node.spawn_membership_watch();

    // 5. Spawn stats reporter:
    let stats_node = node.clone();
    let stats_membership = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            if !stats_node.is_running() {
                break;
            }
            let alive = stats_membership.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, {} primary partitions here, {} invocations",
                alive.len(),
                stats_node.engine().owned_partition_count(),
                stats_node.invocation_count()
            );
            for member in alive {
                tracing::debug!(
                    "  - {} gossip={} http={} (inc={})",
                    member.id,
                    member.gossip_addr,
                    member.http_addr,
                    member.incarnation
                );
            }
        }
    });

    // 6. Start HTTP server:
    let http_addr = membership.local_node.http_addr;

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    node.shutdown().await;
    Ok(())
}
