use anyhow::{Context, Result};
use clap::Parser;
use common::TaskExecutor;
use mimalloc::MiMalloc;
use netstats::adapters::{LogNotifier, StaticBundleSource, SysfsCounterSampler};
use netstats::api::ApiServer;
use netstats::config::{StatsConfig, StorageKind};
use netstats::persistence::{MemoryGateway, PersistenceGateway, SqliteGateway};
use netstats::ports::{Clock, Ports, SystemClock};
use netstats::{NetStatsService, telemetry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "netstatsd")]
#[command(about = "Network traffic statistics daemon", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "netstats.toml")]
    config: String,

    /// API listen address
    #[arg(long, env = "NETSTATS_API_ADDR")]
    api_addr: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "NETSTATS_LOG_LEVEL")]
    log_level: Option<String>,
}

async fn open_gateway(cfg: &StatsConfig) -> Result<Arc<dyn PersistenceGateway>> {
    Ok(match cfg.storage {
        StorageKind::Sqlite => Arc::new(
            SqliteGateway::open(&cfg.database_path, &cfg.backup_database_path)
                .await
                .with_context(|| format!("Failed to open database {}", cfg.database_path))?,
        ),
        StorageKind::Memory => Arc::new(MemoryGateway::new()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = StatsConfig::load(&args.config)?;
    if let Some(api_addr) = args.api_addr {
        cfg.api_addr = api_addr;
    }
    if let Some(log_level) = args.log_level {
        cfg.log_level = log_level;
    }

    let _log_guard = telemetry::init_tracing(
        cfg.log_dir.as_deref(),
        &cfg.log_file,
        &cfg.log_level,
        cfg.console_port,
    );

    info!("Starting netstatsd with configuration: {:?}", cfg);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ports = Ports {
        sampler: Arc::new(SysfsCounterSampler::new(&cfg.counters, clock.clone())),
        bundles: Arc::new(StaticBundleSource::new(cfg.bundles.clone())),
        gateway: open_gateway(&cfg).await?,
        notifier: Arc::new(LogNotifier),
        clock,
    };

    let executor = TaskExecutor::current()?;
    let service = Arc::new(NetStatsService::new(cfg.clone(), ports, executor.clone()));
    service.start().await?;

    let shutdown = CancellationToken::new();
    let api_server = {
        let server = ApiServer::new(cfg.api_addr.clone(), cfg.api_token.clone(), service.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("netstatsd started, API listening on {}", cfg.api_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = api_server => {
            if let Err(e) = result {
                error!("API server task failed: {}", e);
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = service.shutdown().await {
        error!("Final flush failed: {}", e);
    }
    executor.shutdown();
    info!("netstatsd stopped");
    Ok(())
}
