//! Market data pipeline - normalization, ingestion task, composition

pub mod client;
pub mod consumer;
pub mod processor;
pub mod snapshot;

pub use client::MarketDataStreamingClient;
pub use consumer::{MarketDataConsumer, RetryPolicy, StopToken};
pub use processor::{MarketDataProcessor, MdCallback, ProcessorStats};
pub use snapshot::BookSnapshots;
