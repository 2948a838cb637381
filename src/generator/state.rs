use indexmap::IndexMap;

use crate::tick::Tick;

/// Last emitted tick per symbol, iterated in seeding order.
#[derive(Debug, Default)]
pub struct GeneratorStateStore {
    last: IndexMap<String, Tick>,
}

impl GeneratorStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&Tick> {
        self.last.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.last.contains_key(symbol)
    }

    /// Replaces the symbol's entry in place, keeping its position.
    pub fn put(&mut self, tick: Tick) {
        self.last.insert(tick.symbol.clone(), tick);
    }

    pub fn symbols(&self) -> Vec<String> {
        self.last.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
