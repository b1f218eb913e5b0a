//! Error handling - one hierarchy for the whole pipeline

use thiserror::Error;

use crate::core::types::Side;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error hierarchy.
///
/// Per-message errors (`MalformedRecord`, `QueueFull`, `InvalidOrderRequest`)
/// are handled where they happen and only logged. Startup errors (`Config`,
/// `Routing`) abort initialization.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File / socket IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Raw provider record that cannot be normalized
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Engine queue at capacity under the reject policy
    #[error("Queue full for engine {engine}")]
    QueueFull { engine: usize },

    /// Order request rejected before any state change
    #[error("Invalid order request: {0}")]
    InvalidOrderRequest(String),

    /// No open order for the instrument/side
    #[error("Unknown order: instrument {instrument_id} side {side}")]
    UnknownOrder { instrument_id: u32, side: Side },

    /// Market data provider could not be reached or dropped the session
    #[error("Provider connection failure: {0}")]
    ProviderConnection(String),

    /// Instrument without an engine, or an engine index out of range
    #[error("Routing error: {0}")]
    Routing(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
