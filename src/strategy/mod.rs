pub mod engine;
pub mod routing;
pub mod server;

pub use engine::{EngineHandle, EngineReport, EngineStats, EngineStatsSnapshot, Job, StrategyEngine};
pub use routing::RoutingTable;
pub use server::{JobRouter, ServerState, StrategyServer};

use crate::core::{Bbo, OrderIntent};

/// Strategy defines the decision step an engine runs for every book update
/// of the instruments it owns. An instance lives on exactly one engine
/// thread, so implementations keep plain mutable state.
pub trait Strategy: Send + 'static {
    /// Returns the name of the strategy for logging purposes
    fn name(&self) -> &str;

    /// Called once per routed book update, in arrival order per instrument.
    fn on_book_update(&mut self, bbo: &Bbo) -> Option<OrderIntent>;

    /// Called when the engine finds its queue empty.
    fn on_idle(&mut self) {}
}

/// Joins the best bid and best ask with a fixed quantity.
#[derive(Debug, Clone)]
pub struct TopOfBookQuoter {
    qty: u32,
}

impl TopOfBookQuoter {
    pub fn new(qty: u32) -> Self {
        Self { qty }
    }
}

impl Strategy for TopOfBookQuoter {
    fn name(&self) -> &str {
        "top-of-book"
    }

    fn on_book_update(&mut self, bbo: &Bbo) -> Option<OrderIntent> {
        let bid = bbo.best_bid()?;
        let ask = bbo.best_ask()?;
        Some(OrderIntent { instrument_id: bbo.instrument_id, bid_price: bid.price, ask_price: ask.price, qty: self.qty })
    }
}
