use crate::value_objects::position::Position;
use std::collections::BTreeMap;

/// Open positions keyed by symbol (one netted position per symbol) plus the last marked equity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Portfolio {
    positions: BTreeMap<String, Position>,
    equity: f64,
}

impl Portfolio {
    pub fn new(equity: f64) -> Self {
        Self {
            positions: BTreeMap::new(),
            equity,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn position_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.positions
            .get(symbol)
            .map(|position| position.side.sign() * position.quantity)
            .unwrap_or(0.0)
    }

    pub fn insert(&mut self, position: Position) {
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn used_margin(&self) -> f64 {
        self.positions.values().map(|position| position.margin).sum()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .values()
            .map(|position| position.unrealized_pnl)
            .sum()
    }

    /// Equity not committed as initial margin; shared collateral for cross positions.
    pub fn free_collateral(&self) -> f64 {
        (self.equity - self.used_margin()).max(0.0)
    }

    pub fn equity(&self) -> f64 {
        self.equity
    }

    pub fn set_equity(&mut self, equity: f64) {
        self.equity = equity;
    }
}
