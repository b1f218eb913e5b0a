//! Normalization of raw provider records into `Bbo` snapshots.

use chrono::Datelike;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::core::{BOOK_DEPTH, Bbo, Error, MdEntity, PriceLevel, Result, Side};
use crate::feeds::{FIXED_PRICE_SCALE, KeepGoing, RTYPE_BOOK_LEVEL, RTYPE_TRADE, RawRecord, UNDEF_PRICE};

/// Receives every normalized snapshot. Must not panic; it runs on the
/// ingestion task.
pub type MdCallback = Box<dyn FnMut(Arc<Bbo>) + Send>;

#[derive(Debug, Default)]
pub struct ProcessorStats {
    accepted: AtomicU64,
    trades: AtomicU64,
    malformed: AtomicU64,
}

impl ProcessorStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn trades(&self) -> u64 {
        self.trades.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Keeps the last-seen levels per instrument and emits one fresh snapshot
/// for every accepted level update.
pub struct MarketDataProcessor {
    books: HashMap<u32, Bbo>,
    callback: Option<MdCallback>,
    stats: Arc<ProcessorStats>,
}

impl Default for MarketDataProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataProcessor {
    pub fn new() -> Self {
        Self { books: HashMap::new(), callback: None, stats: Arc::new(ProcessorStats::default()) }
    }

    pub fn register_callback(&mut self, callback: MdCallback) {
        self.callback = Some(callback);
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Entry point for the consumer: normalize, publish, never fail.
    pub fn on_record(&mut self, record: &RawRecord) -> KeepGoing {
        match self.normalize(record) {
            Ok(Some(bbo)) => {
                if let Some(callback) = self.callback.as_mut() {
                    callback(bbo);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(instrument_id = record.instrument_id, "dropping record: {}", e);
            }
        }
        KeepGoing::Continue
    }

    /// Apply one raw record to the instrument's cached book.
    ///
    /// Returns the new snapshot for book updates, `None` for records that do
    /// not change the book (trades).
    pub fn normalize(&mut self, record: &RawRecord) -> Result<Option<Arc<Bbo>>> {
        match record.rtype {
            RTYPE_BOOK_LEVEL => {}
            RTYPE_TRADE => {
                self.stats.trades.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            other => return Err(Error::MalformedRecord(format!("unknown rtype {:#04x}", other))),
        }

        let side = match record.side {
            'B' => Side::Bid,
            'A' => Side::Ask,
            other => return Err(Error::MalformedRecord(format!("unknown side '{}'", other))),
        };
        let depth = record.depth as usize;
        if depth >= BOOK_DEPTH {
            return Err(Error::MalformedRecord(format!("depth {} outside book of {}", depth, BOOK_DEPTH)));
        }
        let level = match record.price {
            UNDEF_PRICE => PriceLevel::EMPTY,
            p if p < 0 => return Err(Error::MalformedRecord(format!("negative price {}", p))),
            p => PriceLevel::new(p as f64 / FIXED_PRICE_SCALE, record.size, record.count),
        };

        let book = self
            .books
            .entry(record.instrument_id)
            .or_insert_with(|| Bbo::new(record.instrument_id, MdEntity::default()));
        book.levels_mut(side)[depth] = level;
        book.entity.set_symbol(&record.symbol);
        book.entity.set_exchange_timestamp(record.ts_event);
        book.entity.set_trade_date(trade_date(record.ts_event));

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Arc::new(book.clone())))
    }
}

/// YYYYMMDD (UTC) of a nanosecond epoch timestamp.
pub fn trade_date(ts_nanos: u64) -> i32 {
    let secs = (ts_nanos / 1_000_000_000) as i64;
    let nanos = (ts_nanos % 1_000_000_000) as u32;
    chrono::DateTime::from_timestamp(secs, nanos)
        .map(|t| t.year() * 10_000 + t.month() as i32 * 100 + t.day() as i32)
        .unwrap_or(0)
}
