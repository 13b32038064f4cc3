use std::env;

use fx_core::models::Asset;
use ingestor::SchedulerConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let upstream_url = env::var("EMCONT_RATES_URL").expect("EMCONT_RATES_URL must be set");
    let asset_list = env::var("ASSET_LIST").unwrap_or_default();

    let worker_count = env::var("INGESTOR_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let tick_interval_ms = env::var("INGESTOR_TICK_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(500);

    info!("connecting to database...");
    let pool = fx_core::db::create_pool(&database_url).await;
    fx_core::db::run_migrations(&pool).await;
    info!("migrations applied");

    let assets: Vec<Asset> = asset_list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .enumerate()
        .map(|(i, name)| Asset { id: i as i32 + 1, name: name.to_owned() })
        .collect();

    // Non-raising: the server process (or a prior ingestor instance) may
    // already have populated the table with this same list.
    fx_core::store::initialize_assets(&pool, &assets, false)
        .await
        .expect("failed to initialize assets");

    let client = ingestor::fetcher::build_client();
    let config = SchedulerConfig {
        upstream_url,
        worker_count,
        tick_interval: std::time::Duration::from_millis(tick_interval_ms),
    };

    info!(workers = config.worker_count, interval_ms = tick_interval_ms, "ingestor starting");
    if let Err(err) = ingestor::run(pool, client, config).await {
        error!(error = %err, "ingestion worker group failed, exiting for supervisor restart");
        std::process::exit(1);
    }
}
