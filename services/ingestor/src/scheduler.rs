//! Ingestion scheduler (C3): a fixed pool of staggered periodic workers,
//! each repeating fetch -> index -> upsert. Grounded on the original
//! `async_periodic_tasks.periodic`/`main`: `NUMBER_OF_TASKS` workers, each
//! presleeping `k / N` of the interval before its first tick, run inside a
//! task group that tears the whole process down if any worker's body fails
//! with something other than an already-handled fetch/format error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fx_core::models::Asset;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::TickError;
use crate::fetcher::{self, RateDto};

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub upstream_url: String,
    pub worker_count: usize,
    pub tick_interval: Duration,
}

impl SchedulerConfig {
    pub fn new(upstream_url: String) -> Self {
        Self {
            upstream_url,
            worker_count: DEFAULT_WORKER_COUNT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// The cached list of tracked assets, shared by every worker. Read on
/// every tick; refilled from the store only when empty (cold start, or a
/// worker observing the cache before the first successful sync).
type AssetCache = Arc<RwLock<Vec<Asset>>>;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

/// Run the scheduler to completion. Only returns if a worker hits an
/// unrecoverable store error; the caller (main) treats that as fatal and
/// exits the process so the supervisor restarts it fresh, per the spec's
/// all-or-nothing ingestion policy.
pub async fn run(pool: PgPool, client: reqwest::Client, config: SchedulerConfig) -> Result<(), TickError> {
    let cache: AssetCache = Arc::new(RwLock::new(Vec::new()));
    let n = config.worker_count.max(1);

    let mut workers = JoinSet::new();
    for k in 0..n {
        let pool = pool.clone();
        let client = client.clone();
        let cache = cache.clone();
        let config = config.clone();
        workers.spawn(async move { worker_loop(k, n, pool, client, cache, config).await });
    }

    // The first worker body to fail aborts every sibling; `JoinSet::join_next`
    // on a `JoinError` (panic) or an `Err` result both count as fatal here —
    // fetch/format failures never reach this point, they're swallowed inside
    // `tick`.
    while let Some(outcome) = workers.join_next().await {
        match outcome {
            Ok(Ok(())) => unreachable!("worker_loop only returns on error"),
            Ok(Err(err)) => {
                error!(error = %err, "ingestion worker failed, tearing down the group");
                workers.abort_all();
                return Err(err);
            }
            Err(join_err) => {
                error!(error = %join_err, "ingestion worker panicked, tearing down the group");
                workers.abort_all();
                // A panic carries no `TickError` of its own; re-wrap as a
                // store error is misleading, so propagate by resuming the
                // panic on this task instead.
                std::panic::resume_unwind(join_err.into_panic());
            }
        }
    }
    Ok(())
}

async fn worker_loop(
    k: usize,
    n: usize,
    pool: PgPool,
    client: reqwest::Client,
    cache: AssetCache,
    config: SchedulerConfig,
) -> Result<(), TickError> {
    let presleep = config.tick_interval.mul_f64(k as f64 / n as f64);
    tokio::time::sleep(presleep).await;

    loop {
        let inserted = tick(&pool, &client, &config.upstream_url, &cache).await?;
        if inserted > 0 {
            info!(worker = k, inserted, "ingestion tick stored new points");
        }
        tokio::time::sleep(config.tick_interval).await;
    }
}

/// One ingestion tick: ensure the asset cache is populated, fetch the
/// upstream quote list, and upsert one point per tracked asset that has a
/// matching quote. Returns the number of points that were genuinely new.
///
/// Fetch/format failures are logged and swallowed — the next tick retries.
/// A store failure here (not a duplicate-key no-op, those are silent inside
/// `upsert_point` itself) propagates, since it means the database is no
/// longer reachable and ingestion must not silently keep limping along.
pub async fn tick(
    pool: &PgPool,
    client: &reqwest::Client,
    upstream_url: &str,
    cache: &AssetCache,
) -> Result<usize, TickError> {
    if cache.read().await.is_empty() {
        let assets = fx_core::store::list_assets(pool).await?;
        *cache.write().await = assets;
    }

    let assets = cache.read().await;
    if assets.is_empty() {
        return Ok(0);
    }

    let rates = match fetcher::fetch_rates(client, upstream_url).await {
        Ok(rates) => rates,
        Err(err) => {
            warn!(error = %err, "upstream fetch failed, retrying next tick");
            return Ok(0);
        }
    };
    let by_symbol: HashMap<&str, &RateDto> = rates.iter().map(|r| (r.symbol.as_str(), r)).collect();

    let time = now_secs();
    let mut inserted = 0usize;
    for asset in assets.iter() {
        let Some(rate) = by_symbol.get(asset.name.as_str()) else { continue };
        if fx_core::store::upsert_point(pool, asset.id, time, rate.mid()).await? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stagger_offsets_span_the_full_interval() {
        let interval = Duration::from_millis(500);
        let n = 4;
        let offsets: Vec<Duration> = (0..n).map(|k| interval.mul_f64(k as f64 / n as f64)).collect();
        assert_eq!(offsets[0], Duration::from_millis(0));
        assert_eq!(offsets[1], Duration::from_millis(125));
        assert_eq!(offsets[3], Duration::from_millis(375));
    }

    #[test]
    fn default_config_matches_the_spec_defaults() {
        let config = SchedulerConfig::new("https://example.test".to_owned());
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.tick_interval, DEFAULT_TICK_INTERVAL);
    }
}
