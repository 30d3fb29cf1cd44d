use anyhow::Result;
use clap::Parser;
use core_logic::metrics::MetricsCollector;
use core_logic::setup_logger;
use dotenv::dotenv;
use evm_monitor::config::parse_track_arg;
use evm_monitor::{
    topics, AddressNetwork, ChainService, MemoryStore, MonitorConfig, SqliteStore, Store,
};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "chains/evm-monitor/config.toml")]
    config: String,
    /// SQLite file, overrides `database` from the config file
    #[arg(short, long)]
    database: Option<String>,
    /// Account to track as `<address>@<chain_id>`, repeatable
    #[arg(short, long)]
    track: Vec<String>,
    #[arg(short, long)]
    export_metrics: Option<String>,
    /// Seconds between metrics exports
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    metrics_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Keep guard alive for file logging
    let _log_guard = setup_logger();
    dotenv().ok();

    let args = Args::parse();
    info!("Loading config from: {}", args.config);

    let config = match MonitorConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Ok(());
        }
    };

    let mut tracked = config.tracked_accounts()?;
    for value in &args.track {
        tracked.push(parse_track_arg(value)?);
    }

    let store: Arc<dyn Store> = match args.database.as_ref().or(config.database.as_ref()) {
        Some(path) => Arc::new(SqliteStore::open(path).await?),
        None => {
            info!("No database configured, keeping state in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let service = ChainService::connect(config.settings.clone(), &config.networks, store).await?;
    let networks = service.networks();

    let mut blocks = service.events().subscribe::<topics::Block>();
    let mut transactions = service.events().subscribe::<topics::Transaction>();
    let event_log = tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(block) = blocks.recv() => {
                    info!("{} block #{} {:?}", block.network, block.height, block.hash);
                }
                Ok(event) = transactions.recv() => {
                    if !event.for_accounts.is_empty() {
                        info!(
                            "{} transaction {:?} for {} tracked account(s), pending: {}",
                            event.transaction.network,
                            event.transaction.hash,
                            event.for_accounts.len(),
                            event.transaction.is_pending()
                        );
                    }
                }
                else => break,
            }
        }
    });

    service.start().await?;

    for (address, chain_id) in tracked {
        let Some(network) = networks.iter().find(|n| n.chain_id == chain_id) else {
            error!("Chain {} is not configured, not tracking {:?}", chain_id, address);
            continue;
        };
        if let Err(e) = service
            .add_account_to_track(AddressNetwork::new(address, network.clone()))
            .await
        {
            error!("Failed to track {:?} on {}: {}", address, network, e);
        }
    }

    let metrics_task = if let Some(ref metrics_path) = args.export_metrics {
        let path = metrics_path.clone();
        let interval_secs = args.metrics_interval;
        Some(tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                let metrics = MetricsCollector::global();
                if let Err(e) = metrics.export_to_file(&path).await {
                    tracing::error!("Metrics export failed: {}", e);
                } else {
                    tracing::info!("Metrics exported to {}", path);
                }
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    service.stop().await?;
    if let Some(task) = metrics_task {
        task.abort();
    }
    event_log.abort();
    info!("{}", MetricsCollector::global().to_json());
    Ok(())
}
