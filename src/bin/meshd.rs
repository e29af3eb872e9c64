// Toolmesh daemon
// Discovers tool servers, keeps connections monitored, serves workflows
// Run with: cargo run --bin meshd

use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use toolmesh::engine::registry::StaticDiscovery;
use toolmesh::mesh::MeshDeps;
use toolmesh::{MeshConfig, ServerDefinition, ToolMesh};

/// Toolmesh coordination daemon
#[derive(Parser, Debug)]
#[command(name = "meshd", version, about)]
struct Args {
    /// JSON file with server definitions to seed discovery
    #[arg(long, env = "TOOLMESH_SERVERS")]
    servers: Option<PathBuf>,

    /// Config file stem; looks for <stem>.toml next to the process
    #[arg(long, default_value = "toolmesh")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real deployments set variables through the
    // environment
    if dotenv().is_err() {
        eprintln!("No .env file found, relying on process environment");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = MeshConfig::load_from(&args.config)?;

    info!("🔌 Starting Toolmesh daemon");
    info!(
        monitor_interval_secs = config.monitor_interval_secs,
        stale_connection_secs = config.stale_connection_secs,
        "configuration loaded"
    );

    let mut deps = MeshDeps::default();
    if let Some(path) = &args.servers {
        let raw = std::fs::read_to_string(path)?;
        let seeded: Vec<ServerDefinition> = serde_json::from_str(&raw)?;
        info!(count = seeded.len(), path = %path.display(), "seeding discovery");
        deps.sources.push(Arc::new(StaticDiscovery::new("seed-file", seeded)));
    }

    let mesh = ToolMesh::new(config, deps);

    let servers = mesh.discover_and_route().await;
    info!(servers = servers.len(), "discovery complete");
    for server in &servers {
        match mesh.registry().validate_server_connection(&server.id).await {
            Ok(true) => info!(server_id = %server.id, transport = %server.transport, "server looks reachable"),
            Ok(false) => warn!(server_id = %server.id, "server failed the liveness check"),
            Err(err) => warn!(server_id = %server.id, error = %err, "liveness check errored"),
        }
    }

    let mut sweep = interval(Duration::from_secs(mesh.config().monitor_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                mesh.connections().monitor_connections().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
