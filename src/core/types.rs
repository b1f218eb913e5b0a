//! Core types - market data entities and orders

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of levels per side carried in a `Bbo`.
pub const BOOK_DEPTH: usize = 5;

/// Common header of every normalized market data entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdEntity {
    symbol: String,
    exchange_timestamp: u64,
    trade_date: i32,
}

impl MdEntity {
    pub fn new(symbol: impl Into<String>, exchange_timestamp: u64, trade_date: i32) -> Self {
        Self { symbol: symbol.into(), exchange_timestamp, trade_date }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Nanoseconds since the UNIX epoch, exactly as the provider stamped it.
    pub fn exchange_timestamp(&self) -> u64 {
        self.exchange_timestamp
    }

    /// YYYYMMDD
    pub fn trade_date(&self) -> i32 {
        self.trade_date
    }

    pub(crate) fn set_symbol(&mut self, symbol: &str) {
        if self.symbol != symbol {
            self.symbol = symbol.to_string();
        }
    }

    pub(crate) fn set_exchange_timestamp(&mut self, exchange_timestamp: u64) {
        self.exchange_timestamp = exchange_timestamp;
    }

    pub(crate) fn set_trade_date(&mut self, trade_date: i32) {
        self.trade_date = trade_date;
    }
}

/// Aggregated resting interest at one book level, e.g. 25.10 x 100 across
/// 12 orders. A NaN price marks an empty level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: u32,
    pub count: i32,
}

impl PriceLevel {
    pub const EMPTY: PriceLevel = PriceLevel { price: f64::NAN, size: 0, count: 0 };

    pub fn new(price: f64, size: u32, count: i32) -> Self {
        Self { price, size, count }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.price.is_nan()
    }
}

impl Default for PriceLevel {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl PartialEq for PriceLevel {
    fn eq(&self, other: &Self) -> bool {
        let same_price = (self.is_empty() && other.is_empty()) || self.price == other.price;
        same_price && self.size == other.size && self.count == other.count
    }
}

/// Book snapshot for one instrument: best bid/offer plus depth.
///
/// Produced once per normalized update and shared as `Arc<Bbo>` by every
/// holder (engine, diagnostics, logs). Never mutated after it is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bbo {
    pub entity: MdEntity,
    pub instrument_id: u32,
    pub bids: [PriceLevel; BOOK_DEPTH],
    pub asks: [PriceLevel; BOOK_DEPTH],
}

impl Bbo {
    pub fn new(instrument_id: u32, entity: MdEntity) -> Self {
        Self {
            entity,
            instrument_id,
            bids: [PriceLevel::EMPTY; BOOK_DEPTH],
            asks: [PriceLevel::EMPTY; BOOK_DEPTH],
        }
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first().filter(|l| !l.is_empty())
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first().filter(|l| !l.is_empty())
    }

    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()?.price + self.best_ask()?.price) * 0.5)
    }

    pub fn levels(&self, side: Side) -> &[PriceLevel; BOOK_DEPTH] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    pub(crate) fn levels_mut(&mut self, side: Side) -> &mut [PriceLevel; BOOK_DEPTH] {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }
}

/// Order / book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "BID"),
            Side::Ask => write!(f, "ASK"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Open,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

/// One resting strategy order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub instrument_id: u32,
    pub side: Side,
    pub price: f64,
    pub qty: u32,
    pub leaves_qty: u32,
    pub status: OrderStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Order {
    pub fn new(instrument_id: u32, side: Side, price: f64, qty: u32, now: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument_id,
            side,
            price,
            qty,
            leaves_qty: qty,
            status: OrderStatus::New,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a strategy wants resting in the book for one instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderIntent {
    pub instrument_id: u32,
    pub bid_price: f64,
    pub ask_price: f64,
    pub qty: u32,
}
