//! Per-engine FIFO job buffer on top of the SPSC ring.
//!
//! The scheduler side (`QueueProcessor`) and the engine side
//! (`QueueReceiver`) share only the ring and a block of counters. Jobs are
//! never reordered or coalesced. What happens when the ring is full is an
//! explicit `OverflowPolicy`, and every rejection is counted.

use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::spsc::{self, Consumer, Producer};
use crate::core::{Error, Result};

/// Behaviour of `QueueProcessor::submit` on a full queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Reject the new job and count it. Already queued jobs are untouched.
    #[default]
    Reject,
    /// Spin/yield until the engine frees a slot (backpressure).
    Block,
}

/// Counters readable from any thread.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    stalls: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    /// Submits that found the queue full under the block policy
    pub stalls: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
        }
    }
}

/// Scheduler half of one engine's queue.
pub struct QueueProcessor<T> {
    engine: usize,
    producer: Producer<T>,
    policy: OverflowPolicy,
    stats: Arc<QueueStats>,
}

/// Engine half of one engine's queue.
pub struct QueueReceiver<T> {
    engine: usize,
    consumer: Consumer<T>,
    stats: Arc<QueueStats>,
}

/// Build the queue pair for engine `engine`.
pub fn queue_processor<T>(
    engine: usize,
    capacity: usize,
    policy: OverflowPolicy,
) -> (QueueProcessor<T>, QueueReceiver<T>) {
    let (producer, consumer) = spsc::channel(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        QueueProcessor { engine, producer, policy, stats: Arc::clone(&stats) },
        QueueReceiver { engine, consumer, stats },
    )
}

impl<T> QueueProcessor<T> {
    /// Queue `job` for the engine, applying the overflow policy.
    pub fn submit(&mut self, job: T) -> Result<()> {
        let rejected = match self.producer.push(job) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(full) => full.into_inner(),
        };

        match self.policy {
            OverflowPolicy::Reject => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::QueueFull { engine: self.engine })
            }
            OverflowPolicy::Block => self.submit_blocking(rejected),
        }
    }

    fn submit_blocking(&mut self, mut job: T) -> Result<()> {
        self.stats.stalls.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        loop {
            if self.producer.is_abandoned() {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(Error::InvalidState(format!("engine {} is no longer draining", self.engine)));
            }
            match self.producer.push(job) {
                Ok(()) => {
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(full) => {
                    job = full.into_inner();
                    backoff.snooze();
                }
            }
        }
    }

    pub fn engine(&self) -> usize {
        self.engine
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn depth(&self) -> usize {
        self.producer.len()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}

impl<T> QueueReceiver<T> {
    /// Next job in arrival order, if any.
    #[inline]
    pub fn try_next(&mut self) -> Option<T> {
        let job = self.consumer.pop()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(job)
    }

    /// The scheduler is gone and nothing is left to drain.
    pub fn is_closed(&self) -> bool {
        self.consumer.is_abandoned() && self.consumer.is_empty()
    }

    pub fn engine(&self) -> usize {
        self.engine
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}
