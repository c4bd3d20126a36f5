use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tavily_relay::{
    config::{self, Config},
    jobs,
    master_key::MasterKey,
    proxy::Dispatcher,
    quota_sync::QuotaReconciler,
    server::{self, AppState},
    stats::StatsAggregator,
    store::KeyStore,
    sync_job::SyncJobSupervisor,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Key-pooling reverse proxy for the Tavily API")]
struct Cli {
    /// Address to bind, e.g. 0.0.0.0:8080.
    #[arg(long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// SQLite database path.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,

    /// Upstream API base URL.
    #[arg(long, env = "TAVILY_BASE_URL")]
    upstream: Option<String>,

    /// Upstream request timeout (duration string or bare seconds).
    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    upstream_timeout: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let defaults = Config::from_env();
    let config = Config {
        listen_addr: cli.listen.unwrap_or(defaults.listen_addr),
        database_path: cli.db_path.unwrap_or(defaults.database_path),
        upstream_base: cli.upstream.unwrap_or(defaults.upstream_base),
        upstream_timeout: cli
            .upstream_timeout
            .as_deref()
            .and_then(config::parse_duration)
            .unwrap_or(defaults.upstream_timeout),
    };

    let addr: SocketAddr = config.listen_addr.parse()?;
    info!(
        db = %config.database_path,
        upstream = %config.upstream_base,
        timeout = ?config.upstream_timeout,
        "starting tavily-relay"
    );

    let store = KeyStore::open(&config.database_path).await?;
    let master = Arc::new(MasterKey::load_or_create(store.clone()).await?);
    let stats = StatsAggregator::new(store.clone());

    // Reconstruct counters from raw logs when the stats table is brand new.
    match stats.backfill_if_empty().await {
        Ok(true) => info!("request stats backfilled from logs"),
        Ok(false) => {}
        Err(err) => warn!(error = %err, "stats backfill failed"),
    }

    let dispatcher = Dispatcher::new(
        &config.upstream_base,
        config.upstream_timeout,
        store.clone(),
        master.clone(),
        stats.clone(),
    )?;
    let reconciler = QuotaReconciler::new(
        &config.upstream_base,
        config.upstream_timeout,
        store.clone(),
    )?;
    let supervisor = Arc::new(SyncJobSupervisor::new(store.clone(), reconciler.clone()));

    let shutdown = CancellationToken::new();
    jobs::spawn_auto_sync(store.clone(), reconciler, shutdown.clone());
    jobs::spawn_log_cleanup(store.clone(), shutdown.clone());
    jobs::spawn_monthly_reset(store.clone(), shutdown.clone());

    let state = Arc::new(AppState {
        dispatcher,
        store,
        master,
        stats,
        supervisor,
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let serve = server::serve(addr, state);
    tokio::select! {
        result = serve => result?,
        _ = shutdown.cancelled() => {
            // Periodic drivers observe the token; in-flight upstream calls
            // finish on their own timeouts.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    Ok(())
}
