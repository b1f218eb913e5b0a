//! Aleph Engine - Core Library
//! Multi-threaded market data to strategy engine pipeline

// Public modules
pub mod core;
pub mod execution;
pub mod feeds;
pub mod logging;
pub mod market_data;
pub mod queue;
pub mod strategy;

// Re-exports
pub use self::core::{Config, Error, Result};
pub use strategy::{Strategy, StrategyServer, TopOfBookQuoter};
