use crate::entities::portfolio::Portfolio;
use crate::services::audit::AuditEvent;
use crate::value_objects::bar::Bar;
use crate::value_objects::side::Side;
use crate::value_objects::signal::Signal;
use std::collections::BTreeMap;

pub trait Strategy {
    fn name(&self) -> &str;

    fn on_bar(&mut self, _bar: &Bar, _portfolio: &Portfolio) -> Signal {
        Signal::hold()
    }

    fn drain_audit_events(&mut self) -> Vec<AuditEvent> {
        Vec::new()
    }
}

/// Optional protective exits, as fractions of the entry reference price.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExitOffsets {
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

impl ExitOffsets {
    pub fn prices(&self, side: Side, reference: f64) -> (Option<f64>, Option<f64>) {
        let sign = side.sign();
        (
            self.stop_loss_pct
                .map(|pct| reference * (1.0 - sign * pct)),
            self.take_profit_pct
                .map(|pct| reference * (1.0 + sign * pct)),
        )
    }
}

pub struct BuyAndHold {
    has_bought: bool,
    size: f64,
    leverage: f64,
    exits: ExitOffsets,
}

impl BuyAndHold {
    pub fn new(size: f64, leverage: f64, exits: ExitOffsets) -> Self {
        Self {
            has_bought: false,
            size,
            leverage,
            exits,
        }
    }
}

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    fn on_bar(&mut self, bar: &Bar, _portfolio: &Portfolio) -> Signal {
        if self.has_bought {
            return Signal::hold();
        }
        self.has_bought = true;
        let (stop_loss, take_profit) = self.exits.prices(Side::Long, bar.close);
        Signal::buy(self.size)
            .with_leverage(self.leverage)
            .with_stops(stop_loss, take_profit)
    }
}

/// Moving-average crossover. Goes long when the fast average is above the slow one; with
/// `allow_short` it flips to short on the opposite cross, otherwise it only flattens.
pub struct SmaCross {
    short_window: usize,
    long_window: usize,
    size: f64,
    leverage: f64,
    allow_short: bool,
    exits: ExitOffsets,
    prices: Vec<f64>,
}

impl SmaCross {
    pub fn new(
        short_window: usize,
        long_window: usize,
        size: f64,
        leverage: f64,
        allow_short: bool,
        exits: ExitOffsets,
    ) -> Self {
        Self {
            short_window,
            long_window,
            size,
            leverage,
            allow_short,
            exits,
            prices: Vec::new(),
        }
    }

    fn sma(&self, window: usize) -> Option<f64> {
        if self.prices.len() < window || window == 0 {
            return None;
        }
        let slice = &self.prices[self.prices.len() - window..];
        Some(slice.iter().sum::<f64>() / window as f64)
    }

    fn entry(&self, side: Side, bar: &Bar) -> Signal {
        let (stop_loss, take_profit) = self.exits.prices(side, bar.close);
        let signal = match side {
            Side::Long => Signal::buy(self.size),
            Side::Short => Signal::sell(self.size),
        };
        signal
            .with_leverage(self.leverage)
            .with_stops(stop_loss, take_profit)
    }
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn on_bar(&mut self, bar: &Bar, portfolio: &Portfolio) -> Signal {
        self.prices.push(bar.close);
        if self.prices.len() > self.long_window.max(self.short_window) {
            self.prices.remove(0);
        }

        let (Some(short), Some(long)) = (self.sma(self.short_window), self.sma(self.long_window))
        else {
            return Signal::hold();
        };

        let held = portfolio.position(&bar.symbol).map(|position| position.side);
        if short > long {
            return match held {
                Some(Side::Long) => Signal::hold(),
                Some(Side::Short) => Signal::close(),
                None => self.entry(Side::Long, bar),
            };
        }
        if short < long {
            return match held {
                Some(Side::Long) => Signal::close(),
                Some(Side::Short) => Signal::hold(),
                None if self.allow_short => self.entry(Side::Short, bar),
                None => Signal::hold(),
            };
        }
        Signal::hold()
    }
}

pub struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn name(&self) -> &str {
        "hold"
    }
}

/// Replays pre-computed signals keyed by bar timestamp.
pub struct ScriptedStrategy {
    signals: BTreeMap<i64, Signal>,
}

impl ScriptedStrategy {
    pub fn new(signals: impl IntoIterator<Item = (i64, Signal)>) -> Self {
        Self {
            signals: signals.into_iter().collect(),
        }
    }
}

impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        "scripted"
    }

    fn on_bar(&mut self, bar: &Bar, _portfolio: &Portfolio) -> Signal {
        self.signals
            .remove(&bar.timestamp)
            .unwrap_or_else(Signal::hold)
    }
}

pub enum StrategyKind {
    BuyAndHold(BuyAndHold),
    SmaCross(SmaCross),
    Hold(HoldStrategy),
    Scripted(ScriptedStrategy),
}

impl Strategy for StrategyKind {
    fn name(&self) -> &str {
        match self {
            StrategyKind::BuyAndHold(strategy) => strategy.name(),
            StrategyKind::SmaCross(strategy) => strategy.name(),
            StrategyKind::Hold(strategy) => strategy.name(),
            StrategyKind::Scripted(strategy) => strategy.name(),
        }
    }

    fn on_bar(&mut self, bar: &Bar, portfolio: &Portfolio) -> Signal {
        match self {
            StrategyKind::BuyAndHold(strategy) => strategy.on_bar(bar, portfolio),
            StrategyKind::SmaCross(strategy) => strategy.on_bar(bar, portfolio),
            StrategyKind::Hold(strategy) => strategy.on_bar(bar, portfolio),
            StrategyKind::Scripted(strategy) => strategy.on_bar(bar, portfolio),
        }
    }

    fn drain_audit_events(&mut self) -> Vec<AuditEvent> {
        match self {
            StrategyKind::BuyAndHold(strategy) => strategy.drain_audit_events(),
            StrategyKind::SmaCross(strategy) => strategy.drain_audit_events(),
            StrategyKind::Hold(strategy) => strategy.drain_audit_events(),
            StrategyKind::Scripted(strategy) => strategy.drain_audit_events(),
        }
    }
}
