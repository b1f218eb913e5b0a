//! Lock-free handoff between the ingestion task and engine threads

pub mod processor;
pub mod spsc;

pub use processor::{OverflowPolicy, QueueProcessor, QueueReceiver, QueueStats, QueueStatsSnapshot, queue_processor};
pub use spsc::{Consumer, Producer, QueueFull, channel};
