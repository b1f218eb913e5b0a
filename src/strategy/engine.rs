//! Strategy engine - one dedicated thread draining one job queue
//!
//! Everything an engine touches (strategy state and orders) is owned by
//! its thread. The only cross-thread traffic is the job queue and
//! the atomic counters below.

use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Strategy;
use crate::core::{Bbo, Error, Result};
use crate::execution::OrderManager;
use crate::queue::{QueueReceiver, QueueStats};

/// One routed book update.
#[derive(Debug, Clone)]
pub struct Job {
    pub engine_id: usize,
    /// Per-engine scheduling sequence, starting at 1
    pub sequence: u64,
    pub bbo: Arc<Bbo>,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    jobs: AtomicU64,
    orders: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub jobs: u64,
    /// Order requests accepted by the order manager
    pub orders: u64,
    /// Order requests the order manager refused
    pub rejected: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            jobs: self.jobs.load(Ordering::Relaxed),
            orders: self.orders.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// What an engine thread hands back when it exits.
pub struct EngineReport<S> {
    pub engine_id: usize,
    pub strategy: S,
    pub order_manager: OrderManager,
    pub stats: EngineStatsSnapshot,
}

pub struct StrategyEngine<S: Strategy> {
    id: usize,
    receiver: QueueReceiver<Job>,
    strategy: S,
    orders: OrderManager,
    last_sequence: u64,
    idle_spins: u32,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
}

impl<S: Strategy> StrategyEngine<S> {
    pub fn new(id: usize, receiver: QueueReceiver<Job>, strategy: S, orders: OrderManager, idle_spins: u32) -> Self {
        Self {
            id,
            receiver,
            strategy,
            orders,
            last_sequence: 0,
            idle_spins,
            stats: Arc::new(EngineStats::default()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Move the engine onto its own thread, optionally pinned to `core`.
    pub fn spawn(self, core: Option<core_affinity::CoreId>) -> Result<EngineHandle<S>> {
        let id = self.id;
        let stats = Arc::clone(&self.stats);
        let queue_stats = self.receiver.stats();
        let running = Arc::clone(&self.running);

        let thread = thread::Builder::new().name(format!("engine-{}", id)).spawn(move || {
            if let Some(core) = core {
                if core_affinity::set_for_current(core) {
                    debug!(engine = id, core = core.id, "engine pinned");
                } else {
                    warn!(engine = id, core = core.id, "failed to pin engine thread");
                }
            }
            self.run()
        })?;

        Ok(EngineHandle { id, stats, queue_stats, running, thread })
    }

    /// Drain loop. Returns once asked to stop (or the scheduler is gone)
    /// and every job already queued has been processed.
    pub fn run(mut self) -> EngineReport<S> {
        info!(engine = self.id, strategy = self.strategy.name(), "⚙️ engine started");
        let backoff = Backoff::new();
        let mut idle = 0u32;

        loop {
            if let Some(job) = self.receiver.try_next() {
                self.on_job(job);
                idle = 0;
                backoff.reset();
                continue;
            }

            if !self.running.load(Ordering::Acquire) || self.receiver.is_closed() {
                while let Some(job) = self.receiver.try_next() {
                    self.on_job(job);
                }
                break;
            }

            self.strategy.on_idle();
            idle = idle.saturating_add(1);
            if idle <= self.idle_spins {
                std::hint::spin_loop();
            } else if backoff.is_completed() {
                thread::park_timeout(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }

        let cancelled = self.orders.end_session();
        let stats = self.stats.snapshot();
        info!(
            engine = self.id,
            jobs = stats.jobs,
            orders = stats.orders,
            rejected = stats.rejected,
            cancelled,
            "engine stopped"
        );
        EngineReport { engine_id: self.id, strategy: self.strategy, order_manager: self.orders, stats }
    }

    fn on_job(&mut self, job: Job) {
        debug_assert_eq!(job.engine_id, self.id);
        debug_assert!(job.sequence > self.last_sequence, "job sequence went backwards");
        self.last_sequence = job.sequence;
        self.stats.jobs.fetch_add(1, Ordering::Relaxed);

        let Some(intent) = self.strategy.on_book_update(&job.bbo) else {
            return;
        };
        match self.orders.on_order_request(intent.instrument_id, intent.bid_price, intent.ask_price, intent.qty) {
            Ok(_) => {
                self.stats.orders.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(engine = self.id, instrument_id = intent.instrument_id, "order request rejected: {}", e);
            }
        }
    }
}

/// Owner-side handle of a running engine thread.
pub struct EngineHandle<S> {
    id: usize,
    stats: Arc<EngineStats>,
    queue_stats: Arc<QueueStats>,
    running: Arc<AtomicBool>,
    thread: JoinHandle<EngineReport<S>>,
}

impl<S> EngineHandle<S> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.queue_stats)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the engine to drain what is queued and exit.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.thread.thread().unpark();
    }

    pub fn join(self) -> Result<EngineReport<S>> {
        self.signal_stop();
        self.thread.join().map_err(|_| Error::InvalidState(format!("engine {} panicked", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, MdEntity, OrderIntent, OrderStatus, PriceLevel, Side};
    use crate::queue::{OverflowPolicy, queue_processor};

    /// Quotes the best bid and one above it, sized like the best bid.
    struct Echo;

    impl Strategy for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn on_book_update(&mut self, bbo: &Bbo) -> Option<OrderIntent> {
            let bid = bbo.best_bid()?;
            Some(OrderIntent {
                instrument_id: bbo.instrument_id,
                bid_price: bid.price,
                ask_price: bid.price + 1.0,
                qty: bid.size,
            })
        }
    }

    fn bbo(instrument_id: u32, price: f64, size: u32) -> Arc<Bbo> {
        let mut bbo = Bbo::new(instrument_id, MdEntity::new("T", 1, 19700101));
        bbo.bids[0] = PriceLevel::new(price, size, 1);
        Arc::new(bbo)
    }

    #[test]
    fn test_engine_drains_then_reports() {
        let (mut tx, rx) = queue_processor::<Job>(0, 16, OverflowPolicy::Reject);
        let orders = OrderManager::new(Arc::new(ManualClock::new(0)));
        let handle = StrategyEngine::new(0, rx, Echo, orders, 8).spawn(None).unwrap();

        tx.submit(Job { engine_id: 0, sequence: 1, bbo: bbo(4, 10.0, 2) }).unwrap();
        tx.submit(Job { engine_id: 0, sequence: 2, bbo: bbo(4, 11.0, 0) }).unwrap();
        tx.submit(Job { engine_id: 0, sequence: 3, bbo: bbo(8, 12.0, 5) }).unwrap();
        tx.submit(Job { engine_id: 0, sequence: 4, bbo: Arc::new(Bbo::new(9, MdEntity::default())) }).unwrap();

        let report = handle.join().unwrap();
        assert_eq!(report.stats, EngineStatsSnapshot { jobs: 4, orders: 2, rejected: 1 });

        let om = &report.order_manager;
        assert!(!om.is_session_open());
        assert_eq!(om.open_count(), 0);
        assert_eq!(om.completed().len(), 4);
        assert!(om.completed().iter().all(|o| o.status == OrderStatus::Cancelled));
        assert!(om.completed().iter().any(|o| o.instrument_id == 8 && o.side == Side::Ask && o.price == 13.0));
    }

    #[test]
    fn test_engine_exits_when_scheduler_dropped() {
        let (tx, rx) = queue_processor::<Job>(2, 4, OverflowPolicy::Reject);
        let orders = OrderManager::new(Arc::new(ManualClock::new(0)));
        let handle = StrategyEngine::new(2, rx, Echo, orders, 0).spawn(None).unwrap();
        drop(tx);

        while !handle.is_finished() {
            thread::yield_now();
        }
        let report = handle.join().unwrap();
        assert_eq!(report.engine_id, 2);
        assert_eq!(report.stats.jobs, 0);
    }
}
