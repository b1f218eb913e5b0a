//! Execution layer - Order lifecycle for the instruments of one engine
//!
//! An `OrderManager` belongs to exactly one engine thread and is never
//! shared, so every transition below is a plain synchronous mutation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::core::{Clock, Error, Order, OrderStatus, Result, Side};

/// Resting orders of one instrument, at most one per side.
#[derive(Debug, Clone, Default)]
pub struct InstrumentOrders {
    pub bid: Option<Order>,
    pub ask: Option<Order>,
}

impl InstrumentOrders {
    pub fn side(&self, side: Side) -> Option<&Order> {
        match side {
            Side::Bid => self.bid.as_ref(),
            Side::Ask => self.ask.as_ref(),
        }
    }

    fn slot_mut(&mut self, side: Side) -> &mut Option<Order> {
        match side {
            Side::Bid => &mut self.bid,
            Side::Ask => &mut self.ask,
        }
    }

    fn is_empty(&self) -> bool {
        self.bid.is_none() && self.ask.is_none()
    }
}

/// Default number of finished orders kept per manager.
pub const DEFAULT_ORDER_HISTORY: usize = 4096;

/// Orders that left the book: the most recent `capacity` of them, plus
/// running totals per final status.
#[derive(Debug)]
struct OrderHistory {
    recent: VecDeque<Order>,
    capacity: usize,
    cancelled: u64,
    filled: u64,
}

impl OrderHistory {
    fn new(capacity: usize) -> Self {
        Self { recent: VecDeque::with_capacity(capacity.min(DEFAULT_ORDER_HISTORY)), capacity, cancelled: 0, filled: 0 }
    }

    fn retire(&mut self, order: Order) {
        match order.status {
            OrderStatus::Cancelled => self.cancelled += 1,
            OrderStatus::Filled => self.filled += 1,
            OrderStatus::New | OrderStatus::Open => {}
        }
        if self.capacity == 0 {
            return;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(order);
    }
}

/// Order manager - tracks open orders keyed by instrument id
pub struct OrderManager {
    clock: Arc<dyn Clock>,
    open_orders: HashMap<u32, InstrumentOrders>,
    history: OrderHistory,
    session_open: bool,
}

impl OrderManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_history(clock, DEFAULT_ORDER_HISTORY)
    }

    /// Keep at most `order_history` finished orders for reporting.
    pub fn with_history(clock: Arc<dyn Clock>, order_history: usize) -> Self {
        Self { clock, open_orders: HashMap::new(), history: OrderHistory::new(order_history), session_open: true }
    }

    /// Quote both sides of `instrument_id`. Any order already resting on a
    /// side is cancelled and replaced.
    ///
    /// A rejected request leaves every order untouched.
    pub fn on_order_request(
        &mut self,
        instrument_id: u32,
        bid_price: f64,
        ask_price: f64,
        qty: u32,
    ) -> Result<&InstrumentOrders> {
        if !self.session_open {
            return Err(Error::InvalidOrderRequest("trading session has ended".into()));
        }
        if qty == 0 {
            return Err(Error::InvalidOrderRequest(format!("instrument {}: zero quantity", instrument_id)));
        }
        for (side, price) in [(Side::Bid, bid_price), (Side::Ask, ask_price)] {
            if !price.is_finite() || price < 0.0 {
                return Err(Error::InvalidOrderRequest(format!(
                    "instrument {}: invalid {} price {}",
                    instrument_id, side, price
                )));
            }
        }

        let now = self.clock.now_nanos();
        let entry = self.open_orders.entry(instrument_id).or_default();
        for (side, price) in [(Side::Bid, bid_price), (Side::Ask, ask_price)] {
            let slot = entry.slot_mut(side);
            if let Some(mut prior) = slot.take() {
                prior.status = OrderStatus::Cancelled;
                prior.updated_at = now;
                debug!(instrument_id, %side, order_id = %prior.id, "replaced order cancelled");
                self.history.retire(prior);
            }

            let mut order = Order::new(instrument_id, side, price, qty, now);
            order.status = OrderStatus::Open;
            debug!(instrument_id, %side, order_id = %order.id, price, qty, "order open");
            *slot = Some(order);
        }
        Ok(entry)
    }

    /// Apply an execution against the resting order on `side`.
    pub fn on_fill(&mut self, instrument_id: u32, side: Side, qty: u32) -> Result<Order> {
        if qty == 0 {
            return Err(Error::InvalidOrderRequest(format!("instrument {}: zero fill quantity", instrument_id)));
        }
        let now = self.clock.now_nanos();
        let entry = self
            .open_orders
            .get_mut(&instrument_id)
            .ok_or(Error::UnknownOrder { instrument_id, side })?;
        let slot = entry.slot_mut(side);
        let order = slot.as_mut().ok_or(Error::UnknownOrder { instrument_id, side })?;

        order.leaves_qty -= qty.min(order.leaves_qty);
        order.updated_at = now;
        if order.leaves_qty > 0 {
            return Ok(order.clone());
        }

        let mut filled = slot.take().ok_or(Error::UnknownOrder { instrument_id, side })?;
        filled.status = OrderStatus::Filled;
        if entry.is_empty() {
            self.open_orders.remove(&instrument_id);
        }
        self.history.retire(filled.clone());
        Ok(filled)
    }

    /// Cancel whatever rests on `instrument_id`. Returns the number of
    /// orders cancelled.
    pub fn cancel(&mut self, instrument_id: u32) -> usize {
        let Some(entry) = self.open_orders.remove(&instrument_id) else {
            return 0;
        };
        let now = self.clock.now_nanos();
        let mut cancelled = 0;
        for mut order in [entry.bid, entry.ask].into_iter().flatten() {
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
            self.history.retire(order);
            cancelled += 1;
        }
        cancelled
    }

    /// Close the session: cancel everything and refuse further requests.
    pub fn end_session(&mut self) -> usize {
        let instruments: Vec<u32> = self.open_orders.keys().copied().collect();
        let cancelled = instruments.into_iter().map(|id| self.cancel(id)).sum();
        self.session_open = false;
        cancelled
    }

    pub fn is_session_open(&self) -> bool {
        self.session_open
    }

    pub fn open_orders(&self) -> &HashMap<u32, InstrumentOrders> {
        &self.open_orders
    }

    pub fn open_order(&self, instrument_id: u32, side: Side) -> Option<&Order> {
        self.open_orders.get(&instrument_id)?.side(side)
    }

    /// Number of resting orders across all instruments.
    pub fn open_count(&self) -> usize {
        self.open_orders.values().map(|e| e.bid.is_some() as usize + e.ask.is_some() as usize).sum()
    }

    /// Most recent finished orders, oldest first.
    pub fn completed(&self) -> &VecDeque<Order> {
        &self.history.recent
    }

    pub fn cancelled_total(&self) -> u64 {
        self.history.cancelled
    }

    pub fn filled_total(&self) -> u64 {
        self.history.filled
    }
}
