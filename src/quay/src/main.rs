use std::sync::Arc;

use cluster::{ClusterNode, FrameTransport, HaSettings, LocalBus, ManagementAgent};
use log::{error, info, warn};
use logger::logger;
use server::{HttpMetricsServer, Metrics, Server, ServerConfig, ServerError};
use storage::QueueRegistry;
use tokio::sync::broadcast;

// Use jemalloc as the global allocator for better memory efficiency
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Member id and broker URL of the `index`-th member in this process
fn member_settings(base: &HaSettings, config: &ServerConfig, index: usize, port: u16) -> HaSettings {
    let mut settings = base.clone();
    if config.nodes > 1 {
        settings.node_id = format!("{}-{}", base.node_id, index + 1);
        // Members co-hosted on one bus need distinct addresses.
        if std::env::var("QUAY_HA_BROKER_URL").is_err() {
            settings.broker_url = format!("amqp:tcp:{}:{}", config.host, port);
        }
    }
    settings
}

async fn start(config: &ServerConfig, shutdown: &broadcast::Sender<()>) -> Result<Vec<Arc<ClusterNode>>, ServerError> {
    let base = HaSettings::from_env();
    let bus: Arc<dyn FrameTransport> = Arc::new(LocalBus::new());
    let metrics = Arc::new(Metrics::new());
    let mut nodes = Vec::with_capacity(config.nodes);

    for index in 0..config.nodes {
        let port = config.member_port(index)?;
        let settings = member_settings(&base, config, index, port);

        let storage = config.storage_config(&settings.node_id);
        if storage.is_persistent() {
            info!("Persistence enabled for {}, journal dir: {}/{}", settings.node_id, config.data_dir, settings.node_id);
        } else {
            info!("Running {} in memory-only mode (no persistence)", settings.node_id);
        }
        let registry = QueueRegistry::with_config(storage)?;

        let agent = Arc::new(ManagementAgent::new(&settings.node_id));
        let node = ClusterNode::new(&settings, registry, bus.clone(), Some(agent))?;
        node.start().await?;

        let server = Server::new(node.clone(), metrics.clone(), &config.host, port);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(server_shutdown).await {
                error!("Server error: {}", e);
            }
        });
        nodes.push(node);
    }

    if config.metrics_port > 0 {
        let http = HttpMetricsServer::new(nodes.clone(), metrics, config.metrics_port);
        tokio::spawn(async move {
            if let Err(e) = http.start().await {
                error!("HTTP metrics server error: {}", e);
            }
        });
    }

    Ok(nodes)
}

#[tokio::main]
async fn main() {
    logger::setup_logging();

    let ascii_logo = r#"
  ____  __  _____ __  __
 / __ \/ / / / _ |\ \/ /
/ /_/ / /_/ / __ | \  /
\___\_\____/_/ |_| /_/
-----------------------------------------------
Highly available message queue broker
-----------------------------------------------
    "#;

    println!("{}", ascii_logo);

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let nodes = match start(&config, &shutdown_tx).await {
        Ok(nodes) => nodes,
        Err(e) => {
            eprintln!("Failed to initialize broker: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "{} member(s) started as backup; promote one with `quay-ctl promote`",
        nodes.len()
    );

    for node in &nodes {
        let mut conditions = node.conditions();
        let id = node.id().clone();
        tokio::spawn(async move {
            while let Ok(condition) = conditions.recv().await {
                if let cluster::ClusterCondition::PrimaryLost { member } = condition {
                    warn!("{} saw primary {} leave; awaiting operator promotion", id, member);
                }
            }
        });
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal, stopping broker...");
    let _ = shutdown_tx.send(());

    for node in &nodes {
        node.stop().await;
    }
    info!("QUAY stopped");
}
