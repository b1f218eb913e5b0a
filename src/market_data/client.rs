//! Composition root: one provider, one processor, one consumer.

use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

use super::consumer::{MarketDataConsumer, RetryPolicy, StopToken};
use super::processor::{MarketDataProcessor, MdCallback, ProcessorStats};
use crate::core::{Error, Result};
use crate::feeds::{MarketDataProvider, SessionEnd};

pub struct MarketDataStreamingClient<T: MarketDataProvider> {
    provider: Option<T>,
    processor: Option<MarketDataProcessor>,
    consumer: MarketDataConsumer<T>,
    processor_stats: Option<Arc<ProcessorStats>>,
    initialized: bool,
}

impl<T: MarketDataProvider> MarketDataStreamingClient<T> {
    pub fn new(provider: T, retry: RetryPolicy) -> Self {
        Self {
            provider: Some(provider),
            processor: None,
            consumer: MarketDataConsumer::new(retry),
            processor_stats: None,
            initialized: false,
        }
    }

    /// Processor that will be handed to the consumer, created on first use.
    pub fn create_streaming_processor(&mut self) -> Result<&mut MarketDataProcessor> {
        if self.initialized {
            return Err(Error::InvalidState("processor already handed to the consumer".into()));
        }
        Ok(self.processor.get_or_insert_with(MarketDataProcessor::new))
    }

    /// Create processor -> register callback -> start consumer. One shot.
    pub fn initialize(&mut self, callback: MdCallback, runtime: &Handle) -> Result<()> {
        if self.initialized {
            return Err(Error::InvalidState("streaming client already initialized".into()));
        }
        self.initialized = true;

        let provider = self
            .provider
            .take()
            .ok_or_else(|| Error::InvalidState("streaming client has no provider".into()))?;
        let mut processor = self.processor.take().unwrap_or_default();
        processor.register_callback(callback);
        self.processor_stats = Some(processor.stats());

        info!("🚀 Starting {} market data stream", provider.name());
        self.consumer.start(provider, processor, runtime)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn processor_stats(&self) -> Option<Arc<ProcessorStats>> {
        self.processor_stats.clone()
    }

    pub fn stop(&self) {
        self.consumer.stop();
    }

    pub fn stop_token(&self) -> StopToken {
        self.consumer.stop_token()
    }

    /// Started and not yet joined.
    pub fn is_running(&self) -> bool {
        self.consumer.is_started()
    }

    pub fn is_finished(&self) -> bool {
        self.consumer.is_finished()
    }

    pub async fn join(&mut self) -> Result<SessionEnd> {
        self.consumer.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{KeepGoing, RTYPE_BOOK_LEVEL, RawRecord, RecordCallback};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct OneShot;

    #[async_trait]
    impl MarketDataProvider for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }

        async fn get_book_update(&mut self, callback: &mut RecordCallback<'_>) -> Result<SessionEnd> {
            let record = RawRecord {
                rtype: RTYPE_BOOK_LEVEL,
                instrument_id: 3,
                symbol: "CLZ4".into(),
                ts_event: 99,
                side: 'A',
                depth: 0,
                price: 70_000_000_000,
                size: 4,
                count: 1,
            };
            if callback(record) == KeepGoing::Stop {
                return Ok(SessionEnd::Stopped);
            }
            Ok(SessionEnd::Exhausted)
        }
    }

    #[tokio::test]
    async fn test_initialize_wires_callback() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let mut client = MarketDataStreamingClient::new(OneShot, RetryPolicy::default());
        assert!(client.create_streaming_processor().is_ok());

        client
            .initialize(
                Box::new(move |bbo| {
                    assert_eq!(bbo.instrument_id, 3);
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
                &Handle::current(),
            )
            .unwrap();

        assert_eq!(client.join().await.unwrap(), SessionEnd::Exhausted);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(client.processor_stats().map(|s| s.accepted()), Some(1));
    }

    #[tokio::test]
    async fn test_initialize_is_one_shot() {
        let mut client = MarketDataStreamingClient::new(OneShot, RetryPolicy::default());
        client.initialize(Box::new(|_| {}), &Handle::current()).unwrap();
        let again = client.initialize(Box::new(|_| {}), &Handle::current());
        assert!(matches!(again, Err(Error::InvalidState(_))));
        assert!(client.create_streaming_processor().is_err());
        client.join().await.unwrap();
    }
}
