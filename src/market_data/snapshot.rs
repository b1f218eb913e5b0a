//! Latest book snapshot per instrument, for diagnostics.
//!
//! Holds the same `Arc<Bbo>` the engine receives, so a snapshot lives until
//! both have let go of it. Cold path only: engines never read from here.
//!
//! The ingestion task publishes with `try_write`. While a reader holds the
//! lock the update is skipped and counted, so an instrument's entry may lag
//! until its next update. The producer never waits on a reader.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::Bbo;

#[derive(Clone, Default)]
pub struct BookSnapshots {
    books: Arc<RwLock<HashMap<u32, Arc<Bbo>>>>,
    skipped: Arc<AtomicU64>,
}

impl BookSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `bbo` unless a reader holds the store. Returns whether it
    /// was stored.
    pub fn update(&self, bbo: Arc<Bbo>) -> bool {
        match self.books.try_write() {
            Some(mut books) => {
                books.insert(bbo.instrument_id, bbo);
                true
            }
            None => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn get(&self, instrument_id: u32) -> Option<Arc<Bbo>> {
        self.books.read().get(&instrument_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }

    /// Updates dropped because a reader held the store.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Copy of every instrument's latest snapshot (for diagnostics / REST).
    pub fn snapshot(&self) -> HashMap<u32, Arc<Bbo>> {
        self.books.read().clone()
    }
}
