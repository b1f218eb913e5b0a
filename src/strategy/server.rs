//! Strategy server - engine threads, routing, and the market data hookup
//!
//! `JobRouter` owns the producer half of every engine queue. It is moved into
//! the ingestion callback on subscription, which makes the ingestion task
//! the one producer of each queue for the rest of the session.

use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use super::engine::{EngineHandle, EngineReport, EngineStatsSnapshot, Job, StrategyEngine};
use super::routing::RoutingTable;
use super::Strategy;
use crate::core::{Bbo, Clock, Config, Error, Result};
use crate::execution::OrderManager;
use crate::feeds::{MarketDataProvider, SessionEnd};
use crate::market_data::{BookSnapshots, MarketDataStreamingClient, ProcessorStats, RetryPolicy, StopToken};
use crate::queue::{QueueProcessor, QueueStatsSnapshot, queue_processor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    ThreadsCreated,
    Subscribed,
}

struct Lane {
    queue: QueueProcessor<Job>,
    next_sequence: u64,
}

/// Scheduler side of every engine queue.
pub struct JobRouter {
    routing: Arc<RoutingTable>,
    lanes: Vec<Lane>,
}

impl JobRouter {
    fn new(routing: Arc<RoutingTable>, queues: Vec<QueueProcessor<Job>>) -> Self {
        let lanes = queues.into_iter().map(|queue| Lane { queue, next_sequence: 1 }).collect();
        Self { routing, lanes }
    }

    /// Push `bbo` onto engine `engine_thread_id`'s queue.
    pub fn schedule_job(&mut self, engine_thread_id: usize, bbo: Arc<Bbo>) -> Result<()> {
        let lane = self
            .lanes
            .get_mut(engine_thread_id)
            .ok_or_else(|| Error::Routing(format!("no engine thread {}", engine_thread_id)))?;
        let job = Job { engine_id: engine_thread_id, sequence: lane.next_sequence, bbo };
        lane.queue.submit(job)?;
        lane.next_sequence += 1;
        Ok(())
    }

    /// Route by instrument and schedule. Returns the engine used.
    pub fn route(&mut self, bbo: Arc<Bbo>) -> Result<usize> {
        let engine = self.routing.engine_for(bbo.instrument_id);
        self.schedule_job(engine, bbo)?;
        Ok(engine)
    }

    /// Ingestion callback body: a failed handoff is logged, never raised.
    fn on_book_update(&mut self, bbo: Arc<Bbo>) {
        let instrument_id = bbo.instrument_id;
        if let Err(e) = self.route(bbo) {
            warn!(instrument_id, "book update not scheduled: {}", e);
        }
    }
}

pub struct StrategyServer<T: MarketDataProvider, S: Strategy> {
    config: Config,
    clock: Arc<dyn Clock>,
    routing: Arc<RoutingTable>,
    state: ServerState,
    router: Option<JobRouter>,
    engines: Vec<EngineHandle<S>>,
    snapshots: BookSnapshots,
    client: Option<MarketDataStreamingClient<T>>,
}

impl<T: MarketDataProvider, S: Strategy> StrategyServer<T, S> {
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let routing = Arc::new(RoutingTable::from_config(&config.engine, &config.routing)?);
        Ok(Self {
            config,
            clock,
            routing,
            state: ServerState::Uninitialized,
            router: None,
            engines: Vec::new(),
            snapshots: BookSnapshots::new(),
            client: None,
        })
    }

    /// Start `num_engine_threads` engines, each bound for the session to its
    /// own queue. `new_strategy` is called once per engine index.
    pub fn create_threads<F>(&mut self, num_engine_threads: usize, mut new_strategy: F) -> Result<()>
    where
        F: FnMut(usize) -> S,
    {
        if self.state != ServerState::Uninitialized {
            return Err(Error::InvalidState(format!("create_threads called in state {:?}", self.state)));
        }
        let routing = if num_engine_threads == self.routing.num_engines() {
            Arc::clone(&self.routing)
        } else {
            Arc::new(RoutingTable::new(
                num_engine_threads,
                &self.config.routing.overrides,
                &self.config.routing.instruments,
            )?)
        };

        let cores = if self.config.engine.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if self.config.engine.pin_cores && cores.is_empty() {
            warn!("core pinning requested but no core ids available");
        }

        // Nothing is committed to `self` until every engine is running.
        let mut engines = Vec::with_capacity(num_engine_threads);
        let mut queues = Vec::with_capacity(num_engine_threads);
        for id in 0..num_engine_threads {
            let (queue, receiver) = queue_processor(id, self.config.queue.capacity, self.config.queue.overflow);
            let orders = OrderManager::with_history(Arc::clone(&self.clock), self.config.execution.order_history);
            let engine = StrategyEngine::new(id, receiver, new_strategy(id), orders, self.config.engine.idle_spins);
            let core = (!cores.is_empty()).then(|| cores[id % cores.len()]);
            match engine.spawn(core) {
                Ok(handle) => {
                    engines.push(handle);
                    queues.push(queue);
                }
                Err(e) => {
                    error!(engine = id, "failed to start engine thread: {}", e);
                    drop(queues);
                    for started in engines {
                        let _ = started.join();
                    }
                    return Err(e);
                }
            }
        }

        self.routing = routing;
        self.engines = engines;
        self.router = Some(JobRouter::new(Arc::clone(&self.routing), queues));
        self.state = ServerState::ThreadsCreated;
        info!(
            engines = num_engine_threads,
            capacity = self.config.queue.capacity,
            overflow = ?self.config.queue.overflow,
            "🧵 engine threads created"
        );
        Ok(())
    }

    /// Engine thread that owns `instrument_id`. Fixed for the session.
    #[inline]
    pub fn get_engine_thread(&self, instrument_id: u32) -> usize {
        self.routing.engine_for(instrument_id)
    }

    /// Hand `bbo` to engine `engine_thread_id`. Only available between
    /// `create_threads` and `subscribe_to_market_data`; afterwards the
    /// ingestion task is the sole scheduler.
    pub fn schedule_job(&mut self, engine_thread_id: usize, bbo: Arc<Bbo>) -> Result<()> {
        match self.router.as_mut() {
            Some(router) => router.schedule_job(engine_thread_id, bbo),
            None => Err(Error::InvalidState(format!("cannot schedule jobs in state {:?}", self.state))),
        }
    }

    /// Build the streaming client for `provider` and start ingestion on
    /// `runtime`. Every normalized snapshot goes to the diagnostics store and
    /// to the owning engine's queue.
    pub fn subscribe_to_market_data(&mut self, provider: T, runtime: &Handle) -> Result<()> {
        if self.state != ServerState::ThreadsCreated {
            return Err(Error::InvalidState(format!("subscribe called in state {:?}", self.state)));
        }
        let mut router = self
            .router
            .take()
            .ok_or_else(|| Error::InvalidState("job router already handed out".into()))?;
        let snapshots = self.snapshots.clone();

        let mut client = MarketDataStreamingClient::new(provider, RetryPolicy::from_config(&self.config.provider));
        client.initialize(
            Box::new(move |bbo: Arc<Bbo>| {
                snapshots.update(Arc::clone(&bbo));
                router.on_book_update(bbo);
            }),
            runtime,
        )?;

        self.client = Some(client);
        self.state = ServerState::Subscribed;
        Ok(())
    }

    /// Wait for the market data session to end on its own. Cancel safe.
    pub async fn wait_for_market_data(&mut self) -> Result<SessionEnd> {
        match self.client.as_mut() {
            Some(client) => client.join().await,
            None => Err(Error::InvalidState("not subscribed to market data".into())),
        }
    }

    /// Stop ingestion, let every engine drain its queue and end its trading
    /// session, and collect the engine reports in engine order.
    pub async fn shutdown(mut self) -> Result<Vec<EngineReport<S>>> {
        if let Some(client) = self.client.as_mut() {
            client.stop();
            if client.is_running() {
                match client.join().await {
                    Ok(end) => info!("market data stopped: {:?}", end),
                    Err(e) => warn!("market data ended with error: {}", e),
                }
            }
        }
        // Closes every queue that was never handed to a client.
        self.router = None;

        let mut reports = Vec::with_capacity(self.engines.len());
        for engine in self.engines.drain(..) {
            reports.push(engine.join()?);
        }
        info!(engines = reports.len(), "🛑 strategy server shut down");
        Ok(reports)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn num_engine_threads(&self) -> usize {
        self.engines.len()
    }

    pub fn snapshots(&self) -> &BookSnapshots {
        &self.snapshots
    }

    pub fn engine_stats(&self, engine_thread_id: usize) -> Option<EngineStatsSnapshot> {
        self.engines.get(engine_thread_id).map(|e| e.stats())
    }

    pub fn queue_stats(&self, engine_thread_id: usize) -> Option<QueueStatsSnapshot> {
        self.engines.get(engine_thread_id).map(|e| e.queue_stats().snapshot())
    }

    pub fn processor_stats(&self) -> Option<Arc<ProcessorStats>> {
        self.client.as_ref()?.processor_stats()
    }

    pub fn stop_token(&self) -> Option<StopToken> {
        self.client.as_ref().map(|c| c.stop_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ProviderKind;
    use crate::core::{ManualClock, MdEntity, OrderIntent, PriceLevel};
    use crate::feeds::{HistoricalReplayClient, KeepGoing, RTYPE_BOOK_LEVEL, RawRecord, RecordCallback};
    use crate::queue::OverflowPolicy;
    use crate::strategy::TopOfBookQuoter;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Remembers `(instrument, exchange timestamp)` of every update it sees.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(u32, u64)>,
    }

    impl Strategy for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_book_update(&mut self, bbo: &Bbo) -> Option<OrderIntent> {
            self.seen.push((bbo.instrument_id, bbo.entity.exchange_timestamp()));
            None
        }
    }

    fn test_config(engines: usize) -> Config {
        let mut config = Config::default();
        config.engine.num_engine_threads = engines;
        config.engine.idle_spins = 0;
        config.provider.kind = ProviderKind::Live;
        config
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_000))
    }

    fn update(instrument_id: u32, ts: u64) -> Arc<Bbo> {
        let mut bbo = Bbo::new(instrument_id, MdEntity::new("T", ts, 19700101));
        bbo.bids[0] = PriceLevel::new(1.0, 1, 1);
        Arc::new(bbo)
    }

    #[tokio::test]
    async fn test_routing_lands_on_same_engine() {
        let mut server = StrategyServer::<HistoricalReplayClient, Recorder>::new(test_config(4), clock()).unwrap();
        server.create_threads(4, |_| Recorder::default()).unwrap();

        for ts in 0..1000 {
            let engine = server.get_engine_thread(1005);
            assert_eq!(engine, 1);
            server.schedule_job(engine, update(1005, ts)).unwrap();
        }

        let reports = server.shutdown().await.unwrap();
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[1].stats.jobs, 1000);
        for report in reports.iter().filter(|r| r.engine_id != 1) {
            assert_eq!(report.stats.jobs, 0);
        }
    }

    #[tokio::test]
    async fn test_per_instrument_order_preserved() {
        let mut config = test_config(2);
        config.queue.capacity = 16;
        config.queue.overflow = OverflowPolicy::Block;
        let mut server = StrategyServer::<HistoricalReplayClient, Recorder>::new(config, clock()).unwrap();
        server.create_threads(2, |_| Recorder::default()).unwrap();

        let instruments = [7u32, 8, 9, 10];
        for ts in 0..500 {
            for id in instruments {
                server.schedule_job(server.get_engine_thread(id), update(id, ts)).unwrap();
            }
        }

        let reports = server.shutdown().await.unwrap();
        for id in instruments {
            let owner = &reports[id as usize % 2];
            let seen: Vec<u64> = owner.strategy.seen.iter().filter(|(i, _)| *i == id).map(|(_, ts)| *ts).collect();
            assert_eq!(seen, (0..500).collect::<Vec<_>>());
        }
    }

    fn write_replay(lines: &[String]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("aleph-server-{}.jsonl", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn level(instrument_id: u32, ts: u64, side: char, price: i64) -> String {
        format!(
            r#"{{"rtype":1,"instrument_id":{},"symbol":"S{}","ts_event":{},"side":"{}","depth":0,"price":{},"size":2,"count":1}}"#,
            instrument_id, instrument_id, ts, side, price
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replay_to_order_requests() {
        // Per instrument: the first update has only a bid, every later one
        // quotes, so 2 * (6 - 1) order requests in total.
        let mut lines = Vec::new();
        for step in 0..6i64 {
            for id in [1001u32, 1002] {
                let side = if step % 2 == 0 { 'B' } else { 'A' };
                lines.push(level(id, step as u64 + 1, side, (100 + step) * 1_000_000_000));
            }
        }
        lines.push(r#"{"rtype":0,"instrument_id":1001,"ts_event":99,"side":"N","price":1}"#.to_string());
        let path = write_replay(&lines);

        let mut config = test_config(2);
        config.provider.kind = ProviderKind::Historical;
        config.historical.files = vec![path.clone()];
        let provider = HistoricalReplayClient::from_config(&config.historical);

        let mut server = StrategyServer::<_, TopOfBookQuoter>::new(config, clock()).unwrap();
        server.create_threads(2, |_| TopOfBookQuoter::new(2)).unwrap();
        server.subscribe_to_market_data(provider, &Handle::current()).unwrap();

        assert_eq!(server.wait_for_market_data().await.unwrap(), SessionEnd::Exhausted);
        assert_eq!(server.processor_stats().map(|s| (s.accepted(), s.trades())), Some((12, 1)));
        assert_eq!(server.snapshots().len(), 2);

        let reports = server.shutdown().await.unwrap();
        let total: u64 = reports.iter().map(|r| r.stats.orders).sum();
        assert_eq!(total, 10);
        for report in &reports {
            assert_eq!(report.stats.jobs, 6);
            assert_eq!(report.stats.orders, 5);
            let last_bid = report.order_manager.completed().iter().filter(|o| o.side == crate::core::Side::Bid).last();
            assert_eq!(last_bid.map(|o| o.price), Some(104.0));
        }
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_state_machine() {
        let mut server = StrategyServer::<HistoricalReplayClient, Recorder>::new(test_config(2), clock()).unwrap();
        assert_eq!(server.state(), ServerState::Uninitialized);
        assert!(matches!(server.schedule_job(0, update(1, 1)), Err(Error::InvalidState(_))));
        let provider = HistoricalReplayClient::new(vec![], 1);
        assert!(matches!(server.subscribe_to_market_data(provider, &Handle::current()), Err(Error::InvalidState(_))));

        server.create_threads(2, |_| Recorder::default()).unwrap();
        assert_eq!(server.state(), ServerState::ThreadsCreated);
        assert!(matches!(server.create_threads(2, |_| Recorder::default()), Err(Error::InvalidState(_))));
        assert!(matches!(server.schedule_job(5, update(1, 1)), Err(Error::Routing(_))));

        let provider = HistoricalReplayClient::new(vec![], 1);
        server.subscribe_to_market_data(provider, &Handle::current()).unwrap();
        assert_eq!(server.state(), ServerState::Subscribed);
        assert!(matches!(server.schedule_job(0, update(1, 1)), Err(Error::InvalidState(_))));

        server.wait_for_market_data().await.unwrap();
        assert_eq!(server.shutdown().await.unwrap().len(), 2);
    }

    #[test]
    fn test_bad_override_fails_at_startup() {
        let mut config = test_config(2);
        config.routing.overrides.insert(1005, 2);
        let server = StrategyServer::<HistoricalReplayClient, Recorder>::new(config, clock());
        assert!(matches!(server, Err(Error::Routing(_))));
    }

    #[tokio::test]
    async fn test_failed_create_threads_leaves_server_untouched() {
        let mut config = test_config(4);
        config.routing.overrides.insert(1005, 3);
        let mut server = StrategyServer::<HistoricalReplayClient, Recorder>::new(config, clock()).unwrap();

        assert!(matches!(server.create_threads(2, |_| Recorder::default()), Err(Error::Routing(_))));
        assert_eq!(server.state(), ServerState::Uninitialized);
        assert_eq!(server.num_engine_threads(), 0);
        assert!(matches!(server.schedule_job(0, update(1, 1)), Err(Error::InvalidState(_))));

        server.create_threads(4, |_| Recorder::default()).unwrap();
        assert_eq!(server.num_engine_threads(), 4);
        assert_eq!(server.get_engine_thread(1005), 3);
        server.schedule_job(3, update(1005, 1)).unwrap();

        let reports = server.shutdown().await.unwrap();
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[3].stats.jobs, 1);
    }

    /// Holds the engine inside its first update until `release` is set.
    struct Gate {
        seen: Vec<u64>,
        entered: Arc<AtomicU64>,
        release: Arc<AtomicBool>,
    }

    impl Strategy for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn on_book_update(&mut self, bbo: &Bbo) -> Option<OrderIntent> {
            self.seen.push(bbo.entity.exchange_timestamp());
            if self.entered.fetch_add(1, Ordering::SeqCst) == 0 {
                while !self.release.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
            }
            None
        }
    }

    /// Emits updates in step with the gated engine.
    struct GatedFeed {
        entered: Arc<AtomicU64>,
        release: Arc<AtomicBool>,
    }

    impl GatedFeed {
        async fn wait_entered(&self, n: u64) {
            while self.entered.load(Ordering::SeqCst) < n {
                tokio::task::yield_now().await;
            }
        }
    }

    fn bid(ts: u64) -> RawRecord {
        RawRecord {
            rtype: RTYPE_BOOK_LEVEL,
            instrument_id: 7,
            symbol: "S7".into(),
            ts_event: ts,
            side: 'B',
            depth: 0,
            price: 100_000_000_000,
            size: 1,
            count: 1,
        }
    }

    #[async_trait]
    impl MarketDataProvider for GatedFeed {
        fn name(&self) -> &str {
            "gated"
        }

        async fn get_book_update(&mut self, callback: &mut RecordCallback<'_>) -> Result<SessionEnd> {
            callback(bid(1));
            self.wait_entered(1).await;
            // Engine is busy with 1: 2 fills the only slot, 3..=5 overflow.
            for ts in 2..=5 {
                callback(bid(ts));
            }
            self.release.store(true, Ordering::SeqCst);
            self.wait_entered(2).await;
            if callback(bid(6)) == KeepGoing::Stop {
                return Ok(SessionEnd::Stopped);
            }
            Ok(SessionEnd::Exhausted)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_rejects_and_session_continues() {
        let mut config = test_config(1);
        config.queue.capacity = 1;
        config.queue.overflow = OverflowPolicy::Reject;

        let entered = Arc::new(AtomicU64::new(0));
        let release = Arc::new(AtomicBool::new(false));
        let provider = GatedFeed { entered: Arc::clone(&entered), release: Arc::clone(&release) };

        let mut server = StrategyServer::<GatedFeed, Gate>::new(config, clock()).unwrap();
        server
            .create_threads(1, |_| Gate { seen: Vec::new(), entered: Arc::clone(&entered), release: Arc::clone(&release) })
            .unwrap();
        server.subscribe_to_market_data(provider, &Handle::current()).unwrap();

        assert_eq!(server.wait_for_market_data().await.unwrap(), SessionEnd::Exhausted);
        assert_eq!(server.processor_stats().map(|s| s.accepted()), Some(6));
        let queue = server.queue_stats(0).unwrap();
        assert_eq!(queue.rejected, 3);
        assert_eq!(queue.enqueued, 3);

        let reports = server.shutdown().await.unwrap();
        assert_eq!(reports[0].strategy.seen, vec![1, 2, 6]);
        assert_eq!(reports[0].stats.jobs, 3);
    }
}
