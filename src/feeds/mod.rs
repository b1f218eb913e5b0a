//! Market data feeds - provider-agnostic raw record ingestion
//!
//! A provider owns the transport and pushes every raw record it receives
//! through a callback until the callback says stop or the session ends.

pub mod historical;
pub mod live;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

pub use historical::HistoricalReplayClient;
pub use live::LiveFeedClient;

/// Aggregated book level update.
pub const RTYPE_BOOK_LEVEL: u8 = 0x01;
/// Trade print.
pub const RTYPE_TRADE: u8 = 0x00;
/// Price value meaning "level removed".
pub const UNDEF_PRICE: i64 = i64::MAX;
/// Fixed-point price scale (1e-9 units).
pub const FIXED_PRICE_SCALE: f64 = 1_000_000_000.0;

/// Raw provider record, one per JSON line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub rtype: u8,
    pub instrument_id: u32,
    #[serde(default)]
    pub symbol: String,
    /// Exchange timestamp, ns since epoch
    pub ts_event: u64,
    /// 'B' bid, 'A' ask, 'N' none
    pub side: char,
    #[serde(default)]
    pub depth: u8,
    /// Fixed point, see `FIXED_PRICE_SCALE`
    pub price: i64,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub count: i32,
}

impl RawRecord {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Decode one raw wire line. `Ok(None)` for blank lines; bytes that are
    /// not UTF-8 are a `MalformedRecord`, same as bad JSON.
    pub fn from_line(bytes: &[u8]) -> Result<Option<Self>> {
        let line = std::str::from_utf8(bytes)
            .map_err(|e| Error::MalformedRecord(format!("line is not valid UTF-8: {}", e)))?
            .trim();
        if line.is_empty() {
            return Ok(None);
        }
        Self::parse(line).map(Some)
    }
}

/// Callback verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepGoing {
    Continue,
    Stop,
}

/// Why a provider session returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Replay ran out of records
    Exhausted,
    /// Remote side closed the stream
    Closed,
    /// Callback asked to stop
    Stopped,
}

pub type RecordCallback<'a> = dyn FnMut(RawRecord) -> KeepGoing + Send + 'a;

/// Capability every market data source offers to the consumer.
#[async_trait]
pub trait MarketDataProvider: Send + 'static {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Run the pull loop, invoking `callback` once per raw record.
    ///
    /// Connection problems are `Error::ProviderConnection`; the consumer
    /// decides whether to call again.
    async fn get_book_update(&mut self, callback: &mut RecordCallback<'_>) -> Result<SessionEnd>;
}
