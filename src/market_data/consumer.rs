//! Background ingestion task: provider pull loop -> processor.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::processor::MarketDataProcessor;
use crate::core::config::ProviderConfig;
use crate::core::{Error, Result};
use crate::feeds::{KeepGoing, MarketDataProvider, RawRecord, SessionEnd};

#[derive(Debug, Default)]
struct StopState {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cancellation token shared between the ingestion task and its owner.
///
/// The flag is checked before every record; `stopped()` additionally wakes
/// a task parked on a silent transport or in a retry backoff.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<StopState>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.stopped.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    #[inline(always)]
    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::Acquire)
    }

    /// Resolves once `stop()` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Reconnect schedule after `Error::ProviderConnection`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self { max_retries: config.max_retries, initial_backoff: Duration::from_millis(config.retry_backoff_ms) }
    }

    /// Exponential: initial * 2^attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default())
    }
}

/// Owns the ingestion task of one provider.
pub struct MarketDataConsumer<T: MarketDataProvider> {
    stop: StopToken,
    retry: RetryPolicy,
    task: Option<JoinHandle<Result<SessionEnd>>>,
    _provider: PhantomData<fn() -> T>,
}

impl<T: MarketDataProvider> MarketDataConsumer<T> {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { stop: StopToken::new(), retry, task: None, _provider: PhantomData }
    }

    /// Spawn the pull loop on `runtime`. Returns as soon as the task is
    /// submitted.
    pub fn start(&mut self, provider: T, processor: MarketDataProcessor, runtime: &Handle) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::InvalidState("market data consumer already started".into()));
        }
        let stop = self.stop.clone();
        let retry = self.retry;
        self.task = Some(runtime.spawn(run(provider, processor, stop, retry)));
        Ok(())
    }

    /// Ask the task to finish. Safe from any thread; the pull loop sees it
    /// before the next record.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn is_started(&self) -> bool {
        self.task.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.is_finished())
    }

    /// Wait for the task and return how the session ended. Dropping the
    /// returned future leaves the task running and joinable.
    pub async fn join(&mut self) -> Result<SessionEnd> {
        let task = self
            .task
            .as_mut()
            .ok_or_else(|| Error::InvalidState("market data consumer not running".into()))?;
        let outcome = task.await;
        self.task = None;
        outcome.map_err(|e| Error::InvalidState(format!("market data task aborted: {}", e)))?
    }
}

async fn run<T: MarketDataProvider>(
    mut provider: T,
    mut processor: MarketDataProcessor,
    stop: StopToken,
    retry: RetryPolicy,
) -> Result<SessionEnd> {
    let mut attempt = 0u32;
    loop {
        if stop.is_stopped() {
            return Ok(SessionEnd::Stopped);
        }

        let mut delivered = 0u64;
        let result = {
            let mut on_raw = |raw: RawRecord| {
                if stop.is_stopped() {
                    return KeepGoing::Stop;
                }
                delivered += 1;
                processor.on_record(&raw)
            };
            tokio::select! {
                biased;
                _ = stop.stopped() => Ok(SessionEnd::Stopped),
                result = provider.get_book_update(&mut on_raw) => result,
            }
        };

        match result {
            Ok(end) => {
                info!(provider = provider.name(), "market data session ended: {:?}", end);
                return Ok(end);
            }
            Err(Error::ProviderConnection(reason)) if stop.is_stopped() => {
                warn!(provider = provider.name(), "provider failed while stopping: {}", reason);
                return Ok(SessionEnd::Stopped);
            }
            Err(Error::ProviderConnection(reason)) if attempt < retry.max_retries => {
                if delivered > 0 {
                    attempt = 0;
                }
                let delay = retry.delay(attempt);
                attempt += 1;
                error!(
                    provider = provider.name(),
                    attempt,
                    "provider connection failure: {}; retrying in {:?}",
                    reason,
                    delay
                );
                tokio::select! {
                    _ = stop.stopped() => return Ok(SessionEnd::Stopped),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(provider = provider.name(), "market data consumer giving up: {}", e);
                return Err(e);
            }
        }
    }
}
