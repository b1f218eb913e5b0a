use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use aleph_engine::core::config::ProviderKind;
use aleph_engine::core::{Clock, SystemClock};
use aleph_engine::feeds::{HistoricalReplayClient, LiveFeedClient, MarketDataProvider};
use aleph_engine::{Config, StrategyServer, TopOfBookQuoter, logging};

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Configuration: CLI arg > ALEPH_CONFIG > ./config.toml
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ALEPH_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    // 2. Logger; the guard drains it on the way out
    let log_guard = logging::init(&config.logging)?;
    info!("🦀 Aleph engine starting ({} engine threads)", config.engine.num_engine_threads);

    // 3. Runtime for the ingestion task and batch loads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("aleph-io")
        .build()
        .context("building tokio runtime")?;

    let result = match config.provider.kind {
        ProviderKind::Historical => {
            let provider = HistoricalReplayClient::from_config(&config.historical);
            runtime.block_on(run(config, provider))
        }
        ProviderKind::Live => {
            let provider = LiveFeedClient::from_config(&config.live);
            runtime.block_on(run(config, provider))
        }
    };
    if let Err(e) = &result {
        error!("engine failed: {:#}", e);
    }

    let dropped = log_guard.dropped();
    drop(log_guard);
    if dropped > 0 {
        eprintln!("{} log lines dropped", dropped);
    }
    result
}

async fn run<T: MarketDataProvider>(config: Config, provider: T) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let num_engine_threads = config.engine.num_engine_threads;
    let quote_qty = config.strategy.quote_qty;

    let mut server = StrategyServer::<T, TopOfBookQuoter>::new(config, clock)?;
    server.create_threads(num_engine_threads, |_| TopOfBookQuoter::new(quote_qty))?;
    server.subscribe_to_market_data(provider, &tokio::runtime::Handle::current())?;
    info!("⏳ Subscribed. Waiting for market data...");

    tokio::select! {
        ended = server.wait_for_market_data() => match ended {
            Ok(end) => info!("market data session ended: {:?}", end),
            Err(e) => error!("market data failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => warn!("Ctrl-C received, shutting down"),
    }

    if let Some(stats) = server.processor_stats() {
        info!(
            accepted = stats.accepted(),
            trades = stats.trades(),
            malformed = stats.malformed(),
            "market data totals"
        );
    }
    for engine in 0..server.num_engine_threads() {
        if let Some(queue) = server.queue_stats(engine) {
            info!(engine, enqueued = queue.enqueued, rejected = queue.rejected, stalls = queue.stalls, "queue totals");
        }
    }

    for report in server.shutdown().await? {
        let om = &report.order_manager;
        info!(
            engine = report.engine_id,
            jobs = report.stats.jobs,
            orders = report.stats.orders,
            rejected = report.stats.rejected,
            completed = om.completed().len(),
            "📊 engine report"
        );
    }
    Ok(())
}
