//! Instrument -> engine thread assignment, fixed for the session.

use std::collections::HashMap;
use tracing::debug;

use crate::core::config::{EngineConfig, RoutingConfig};
use crate::core::{Error, Result};

#[derive(Debug, Clone)]
pub struct RoutingTable {
    num_engines: usize,
    overrides: HashMap<u32, usize>,
}

impl RoutingTable {
    /// Fails fast on anything that could leave an instrument without an
    /// engine: no engines at all, or an override past the last engine.
    pub fn new(num_engines: usize, overrides: &HashMap<u32, usize>, instruments: &[u32]) -> Result<Self> {
        if num_engines == 0 {
            return Err(Error::Routing("no engine threads to route to".into()));
        }
        if let Some((instrument_id, engine)) = overrides.iter().find(|(_, engine)| **engine >= num_engines) {
            return Err(Error::Routing(format!(
                "instrument {} pinned to engine {} but only {} engine threads exist",
                instrument_id, engine, num_engines
            )));
        }

        let table = Self { num_engines, overrides: overrides.clone() };
        for instrument_id in instruments {
            debug!(instrument_id, engine = table.engine_for(*instrument_id), "instrument routed");
        }
        Ok(table)
    }

    pub fn from_config(engine: &EngineConfig, routing: &RoutingConfig) -> Result<Self> {
        Self::new(engine.num_engine_threads, &routing.overrides, &routing.instruments)
    }

    /// Total: every id maps to an engine in `0..num_engines`.
    #[inline]
    pub fn engine_for(&self, instrument_id: u32) -> usize {
        match self.overrides.get(&instrument_id) {
            Some(engine) => *engine,
            None => instrument_id as usize % self.num_engines,
        }
    }

    pub fn num_engines(&self) -> usize {
        self.num_engines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulo_routing_is_stable() {
        let table = RoutingTable::new(4, &HashMap::new(), &[]).unwrap();
        for _ in 0..1000 {
            assert_eq!(table.engine_for(1005), 1);
        }
        assert_eq!(table.engine_for(0), 0);
        assert_eq!(table.engine_for(u32::MAX), u32::MAX as usize % 4);
    }

    #[test]
    fn test_overrides() {
        let overrides = HashMap::from([(1005, 3)]);
        let table = RoutingTable::new(4, &overrides, &[1005, 1006]).unwrap();
        assert_eq!(table.engine_for(1005), 3);
        assert_eq!(table.engine_for(1006), 2);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(matches!(RoutingTable::new(0, &HashMap::new(), &[]), Err(Error::Routing(_))));
        let overrides = HashMap::from([(7, 4)]);
        assert!(matches!(RoutingTable::new(4, &overrides, &[7]), Err(Error::Routing(_))));
    }
}
