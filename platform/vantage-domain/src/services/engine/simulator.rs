use crate::entities::catalog::{MarketCatalog, MarketSpec};
use crate::entities::portfolio::Portfolio;
use crate::services::engine::execution::{ExecutionConfig, RemainderPolicy};
use crate::services::engine::InvariantViolation;
use crate::value_objects::bar::Bar;
use crate::value_objects::fill::{Fill, FillKind, FundingPayment, Liquidity};
use crate::value_objects::order::{IntentOrigin, OrderIntent, OrderType};
use crate::value_objects::position::{MarginMode, Position};
use crate::value_objects::side::Side;
use crate::value_objects::trade::{ExitReason, Trade};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const QTY_EPSILON: f64 = 1e-12;

/// Intents waiting for a bar of their symbol, kept in submission (id) order.
#[derive(Debug, Clone, Default)]
pub struct OrderQueue {
    pending: Vec<OrderIntent>,
}

impl OrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, intent: OrderIntent) {
        self.pending.push(intent);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderIntent> {
        self.pending.iter()
    }

    pub fn drain(&mut self) -> Vec<OrderIntent> {
        std::mem::take(&mut self.pending)
    }

    fn take_symbol(&mut self, symbol: &str) -> Vec<OrderIntent> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|intent| intent.symbol == symbol);
        self.pending = rest;
        matching
    }

    fn restore(&mut self, intents: Vec<OrderIntent>) {
        if intents.is_empty() {
            return;
        }
        self.pending.extend(intents);
        self.pending.sort_by_key(|intent| intent.id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelledIntent {
    pub intent: OrderIntent,
    pub reason: &'static str,
    pub unfilled_qty: f64,
}

/// Everything that happened to one symbol during one bar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    pub fills: Vec<Fill>,
    pub trades: Vec<Trade>,
    pub funding: Vec<FundingPayment>,
    pub cancelled: Vec<CancelledIntent>,
}

impl StepReport {
    pub fn liquidations(&self) -> impl Iterator<Item = &Trade> {
        self.trades
            .iter()
            .filter(|trade| trade.exit_reason == ExitReason::Liquidation)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Equity not committed as initial margin before this bar.
    pub available_balance: f64,
}

pub struct MarketSimulator {
    config: ExecutionConfig,
    catalog: MarketCatalog,
    rng: StdRng,
    bars_seen: BTreeMap<String, u64>,
}

impl MarketSimulator {
    pub fn new(config: ExecutionConfig, catalog: MarketCatalog) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            catalog,
            rng,
            bars_seen: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn market(&self, symbol: &str) -> Option<&MarketSpec> {
        self.catalog.get(symbol)
    }

    /// Advances one bar for `bar.symbol`: fills, liquidation, stop-loss/take-profit, funding,
    /// then mark-to-market. Positions in `portfolio` are updated in place.
    pub fn step(
        &mut self,
        bar: &Bar,
        portfolio: &mut Portfolio,
        queue: &mut OrderQueue,
        ctx: StepContext,
    ) -> Result<StepReport, InvariantViolation> {
        let market = self
            .catalog
            .get(&bar.symbol)
            .cloned()
            .unwrap_or_else(|| MarketSpec::unrestricted(&bar.symbol, f64::MAX));
        let mut report = StepReport::default();
        let mut available = ctx.available_balance;
        let mut liquidity = self.liquidity_cap(bar);

        let mut carried = Vec::new();
        for intent in queue.take_symbol(&bar.symbol) {
            if !intent.quantity.is_finite() || intent.quantity < 0.0 {
                return Err(InvariantViolation::NegativeQuantity {
                    symbol: intent.symbol.clone(),
                    order_id: Some(intent.id),
                    quantity: intent.quantity,
                });
            }
            if let Some(rest) = self.execute_intent(
                bar,
                &market,
                portfolio,
                intent,
                &mut liquidity,
                &mut available,
                &mut report,
            ) {
                carried.push(rest);
            }
        }
        queue.restore(carried);

        self.check_liquidation(bar, &market, portfolio, available, &mut report);
        self.check_exits(bar, &market, portfolio, &mut report);
        self.apply_funding(bar, &market, portfolio, &mut report);

        if let Some(position) = portfolio.position_mut(&bar.symbol) {
            if !position.quantity.is_finite() || position.quantity < 0.0 {
                return Err(InvariantViolation::NegativeQuantity {
                    symbol: position.symbol.clone(),
                    order_id: None,
                    quantity: position.quantity,
                });
            }
            position.mark(bar.close);
            let collateral = collateral_for(position, available);
            position.liquidation_price = position.liquidation_price_for(collateral);
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_intent(
        &mut self,
        bar: &Bar,
        market: &MarketSpec,
        portfolio: &mut Portfolio,
        mut intent: OrderIntent,
        liquidity: &mut Option<f64>,
        available: &mut f64,
        report: &mut StepReport,
    ) -> Option<OrderIntent> {
        let Some((reference, is_maker)) = match_price(&intent, market, bar) else {
            intent.bars_waited += 1;
            if self
                .config
                .expire_after_bars
                .is_some_and(|bars| intent.bars_waited >= bars)
            {
                report.cancelled.push(CancelledIntent {
                    unfilled_qty: intent.quantity,
                    reason: "expired",
                    intent,
                });
                return None;
            }
            return Some(intent);
        };

        let held = portfolio
            .position(&intent.symbol)
            .filter(|position| position.side != intent.side)
            .map(|position| position.quantity);
        let reducing = held.is_some();

        let mut wanted = intent.quantity;
        if let Some(held) = held {
            if wanted > held + QTY_EPSILON {
                report.cancelled.push(CancelledIntent {
                    intent: intent.clone(),
                    reason: "exceeds_position",
                    unfilled_qty: wanted - held,
                });
                wanted = held;
            }
        }

        let fill_qty = match liquidity {
            Some(remaining) => wanted.min(*remaining).max(0.0),
            None => wanted,
        };
        if fill_qty <= QTY_EPSILON {
            intent.quantity = wanted;
            return self.handle_remainder(intent, "no_liquidity", report);
        }

        let liquidity_kind = if is_maker {
            Liquidity::Maker
        } else {
            Liquidity::Taker
        };
        let mut price = if is_maker {
            reference
        } else {
            self.slipped(reference, fill_qty, bar, intent.side)
        };
        if let (OrderType::Limit, Some(limit)) = (intent.order_type, intent.limit_price) {
            let limit = market.quantize_price(limit);
            price = match intent.side {
                Side::Long => price.min(limit),
                Side::Short => price.max(limit),
            };
        }
        let fee = price * fill_qty * self.fee_rate(market, liquidity_kind);
        let slippage = (price - reference).abs() * fill_qty;

        let (kind, funding) = if reducing {
            let reason = match intent.origin {
                IntentOrigin::Strategy => ExitReason::Signal,
                IntentOrigin::Manual => ExitReason::Manual,
            };
            let Some(position) = portfolio.position_mut(&intent.symbol) else {
                return None;
            };
            let (trade, released) =
                close_quantity(position, price, fill_qty, fee, bar.timestamp, reason);
            let closed = position.quantity <= QTY_EPSILON;
            if closed {
                portfolio.remove(&intent.symbol);
            }
            *available += released + trade.gross_pnl() - fee;
            let funding = trade.funding;
            report.trades.push(trade);
            let kind = if closed {
                FillKind::Close
            } else {
                FillKind::Reduce
            };
            (kind, funding)
        } else {
            let margin = price * fill_qty / intent.leverage;
            if margin + fee > *available + 1e-9 {
                report.cancelled.push(CancelledIntent {
                    unfilled_qty: wanted,
                    reason: "insufficient_margin",
                    intent,
                });
                return None;
            }
            *available -= margin + fee;
            let kind = open_or_increase(
                portfolio,
                market,
                &intent,
                price,
                fill_qty,
                margin,
                fee,
                bar.timestamp,
            );
            (kind, 0.0)
        };

        report.fills.push(Fill {
            order_id: Some(intent.id),
            symbol: intent.symbol.clone(),
            side: intent.side,
            kind,
            price,
            quantity: fill_qty,
            fee,
            liquidity: liquidity_kind,
            slippage,
            funding,
            timestamp: bar.timestamp,
        });

        if let Some(remaining) = liquidity.as_mut() {
            *remaining -= fill_qty;
        }

        let leftover = wanted - fill_qty;
        if leftover > QTY_EPSILON {
            intent.quantity = leftover;
            return self.handle_remainder(intent, "partial_fill_remainder", report);
        }
        None
    }

    fn handle_remainder(
        &mut self,
        mut intent: OrderIntent,
        reason: &'static str,
        report: &mut StepReport,
    ) -> Option<OrderIntent> {
        match self.config.remainder {
            RemainderPolicy::Carry => {
                intent.bars_waited += 1;
                Some(intent)
            }
            RemainderPolicy::Cancel => {
                report.cancelled.push(CancelledIntent {
                    unfilled_qty: intent.quantity,
                    reason,
                    intent,
                });
                None
            }
        }
    }

    fn check_liquidation(
        &mut self,
        bar: &Bar,
        market: &MarketSpec,
        portfolio: &mut Portfolio,
        available: f64,
        report: &mut StepReport,
    ) {
        let Some(position) = portfolio.position(&bar.symbol) else {
            return;
        };
        let collateral = collateral_for(position, available);
        let Some(liquidation_price) = position.liquidation_price_for(collateral) else {
            return;
        };
        if !position.crosses(liquidation_price, bar.high, bar.low) {
            return;
        }
        self.force_close(
            bar,
            market,
            portfolio,
            ForcedExit {
                price: liquidation_price,
                reference: liquidation_price,
                liquidity: Liquidity::Taker,
                kind: FillKind::Liquidation,
                reason: ExitReason::Liquidation,
            },
            report,
        );
    }

    fn check_exits(
        &mut self,
        bar: &Bar,
        market: &MarketSpec,
        portfolio: &mut Portfolio,
        report: &mut StepReport,
    ) {
        let Some(position) = portfolio.position(&bar.symbol) else {
            return;
        };
        let stop = position
            .stop_loss
            .filter(|stop| position.crosses(*stop, bar.high, bar.low));
        let target = position.take_profit.filter(|target| match position.side {
            Side::Long => bar.high >= *target,
            Side::Short => bar.low <= *target,
        });
        let side = position.side;
        let quantity = position.quantity;

        // A bar touching both levels is resolved against the position.
        if let Some(stop) = stop {
            let trigger = match side {
                Side::Long => stop.min(bar.open),
                Side::Short => stop.max(bar.open),
            };
            let price = self.slipped(trigger, quantity, bar, side.opposite());
            self.force_close(
                bar,
                market,
                portfolio,
                ForcedExit {
                    price,
                    reference: trigger,
                    liquidity: Liquidity::Taker,
                    kind: FillKind::StopLoss,
                    reason: ExitReason::StopLoss,
                },
                report,
            );
        } else if let Some(target) = target {
            let price = match side {
                Side::Long => target.max(bar.open),
                Side::Short => target.min(bar.open),
            };
            self.force_close(
                bar,
                market,
                portfolio,
                ForcedExit {
                    price,
                    reference: price,
                    liquidity: Liquidity::Maker,
                    kind: FillKind::TakeProfit,
                    reason: ExitReason::TakeProfit,
                },
                report,
            );
        }
    }

    fn apply_funding(
        &mut self,
        bar: &Bar,
        market: &MarketSpec,
        portfolio: &mut Portfolio,
        report: &mut StepReport,
    ) {
        let count = {
            let seen = self.bars_seen.entry(bar.symbol.clone()).or_insert(0);
            *seen += 1;
            *seen
        };
        if !market.is_perpetual() {
            return;
        }
        let Some(interval) = self.funding_interval_bars(market) else {
            return;
        };
        if count % interval != 0 {
            return;
        }
        let rate = market.funding_rate();
        if rate == 0.0 {
            return;
        }
        let Some(position) = portfolio.position_mut(&bar.symbol) else {
            return;
        };
        let notional = bar.close * position.quantity;
        let amount = position.side.sign() * notional * rate;
        position.funding_paid += amount;
        report.funding.push(FundingPayment {
            symbol: bar.symbol.clone(),
            side: position.side,
            timestamp: bar.timestamp,
            rate,
            notional,
            amount,
        });
    }

    fn force_close(
        &mut self,
        bar: &Bar,
        market: &MarketSpec,
        portfolio: &mut Portfolio,
        exit: ForcedExit,
        report: &mut StepReport,
    ) {
        let Some(mut position) = portfolio.remove(&bar.symbol) else {
            return;
        };
        let quantity = position.quantity;
        let fee = exit.price * quantity * self.fee_rate(market, exit.liquidity);
        let (trade, _) = close_quantity(
            &mut position,
            exit.price,
            quantity,
            fee,
            bar.timestamp,
            exit.reason,
        );
        report.fills.push(Fill {
            order_id: None,
            symbol: bar.symbol.clone(),
            side: position.side.opposite(),
            kind: exit.kind,
            price: exit.price,
            quantity,
            fee,
            liquidity: exit.liquidity,
            slippage: (exit.price - exit.reference).abs() * quantity,
            funding: trade.funding,
            timestamp: bar.timestamp,
        });
        report.trades.push(trade);
    }

    fn liquidity_cap(&self, bar: &Bar) -> Option<f64> {
        if self.config.max_fill_pct_of_volume <= 0.0 || bar.volume <= 0.0 {
            return None;
        }
        Some(bar.volume * self.config.max_fill_pct_of_volume)
    }

    fn slipped(&mut self, reference: f64, quantity: f64, bar: &Bar, side: Side) -> f64 {
        let participation = if bar.volume > 0.0 {
            quantity / bar.volume
        } else {
            0.0
        };
        let mut bps = self.config.slippage_bps * (1.0 + participation);
        if self.config.slippage_jitter_bps > 0.0 {
            bps += self.rng.gen_range(0.0..=self.config.slippage_jitter_bps);
        }
        let frac = bps / 10_000.0;
        match side {
            Side::Long => reference * (1.0 + frac),
            Side::Short => reference * (1.0 - frac),
        }
    }

    fn fee_rate(&self, market: &MarketSpec, liquidity: Liquidity) -> f64 {
        let bps = match (market.fees_bps, liquidity) {
            (Some(fees), Liquidity::Maker) => fees.maker,
            (Some(fees), Liquidity::Taker) => fees.taker,
            (None, Liquidity::Maker) => self.config.maker_fee_bps,
            (None, Liquidity::Taker) => self.config.taker_fee_bps,
        };
        bps / 10_000.0
    }

    fn funding_interval_bars(&self, market: &MarketSpec) -> Option<u64> {
        self.config.funding_interval_bars.or_else(|| {
            market
                .funding_interval_seconds()
                .map(|seconds| (seconds / self.config.bar_seconds.max(1)).max(1) as u64)
        })
    }
}

struct ForcedExit {
    price: f64,
    reference: f64,
    liquidity: Liquidity,
    kind: FillKind,
    reason: ExitReason,
}

/// Reference price for an intent on this bar and whether it rests as a maker order.
fn match_price(intent: &OrderIntent, market: &MarketSpec, bar: &Bar) -> Option<(f64, bool)> {
    match intent.order_type {
        OrderType::Market => Some((bar.open, false)),
        OrderType::Limit => {
            let limit = market.quantize_price(intent.limit_price?);
            match intent.side {
                Side::Long if bar.open <= limit => Some((bar.open, false)),
                Side::Long if bar.low <= limit => Some((limit, true)),
                Side::Short if bar.open >= limit => Some((bar.open, false)),
                Side::Short if bar.high >= limit => Some((limit, true)),
                _ => None,
            }
        }
    }
}

fn collateral_for(position: &Position, available: f64) -> f64 {
    match position.margin_mode {
        MarginMode::Isolated => position.margin,
        MarginMode::Cross => position.margin + available.max(0.0),
    }
}

#[allow(clippy::too_many_arguments)]
fn open_or_increase(
    portfolio: &mut Portfolio,
    market: &MarketSpec,
    intent: &OrderIntent,
    price: f64,
    quantity: f64,
    margin: f64,
    fee: f64,
    timestamp: i64,
) -> FillKind {
    if let Some(position) = portfolio.position_mut(&intent.symbol) {
        let total = position.quantity + quantity;
        position.entry_price = (position.entry_price * position.quantity + price * quantity) / total;
        position.quantity = total;
        position.margin += margin;
        position.leverage = position.entry_price * total / position.margin;
        position.fees_paid += fee;
        position.maintenance_margin_rate =
            market.maintenance_margin_rate(position.entry_price * total);
        if intent.stop_loss.is_some() {
            position.stop_loss = intent.stop_loss;
        }
        if intent.take_profit.is_some() {
            position.take_profit = intent.take_profit;
        }
        return FillKind::Increase;
    }

    portfolio.insert(Position {
        symbol: intent.symbol.clone(),
        side: intent.side,
        entry_price: price,
        quantity,
        leverage: intent.leverage,
        margin_mode: intent.margin_mode,
        margin,
        maintenance_margin_rate: market.maintenance_margin_rate(price * quantity),
        unrealized_pnl: 0.0,
        liquidation_price: None,
        stop_loss: intent.stop_loss,
        take_profit: intent.take_profit,
        opened_at: timestamp,
        fees_paid: fee,
        funding_paid: 0.0,
    });
    FillKind::Open
}

/// Closes `quantity` of `position` at `price`, attributing a pro-rata share of entry fees,
/// funding and margin. Returns the trade and the released margin.
fn close_quantity(
    position: &mut Position,
    price: f64,
    quantity: f64,
    exit_fee: f64,
    timestamp: i64,
    exit_reason: ExitReason,
) -> (Trade, f64) {
    let fraction = if position.quantity > 0.0 {
        (quantity / position.quantity).min(1.0)
    } else {
        1.0
    };
    let gross = position.side.sign() * (price - position.entry_price) * quantity;
    let entry_fees = position.fees_paid * fraction;
    let funding = position.funding_paid * fraction;
    let released = position.margin * fraction;

    position.quantity = (position.quantity - quantity).max(0.0);
    position.fees_paid -= entry_fees;
    position.funding_paid -= funding;
    position.margin -= released;

    let fees = entry_fees + exit_fee;
    let pnl = gross - fees - funding;
    let trade = Trade {
        symbol: position.symbol.clone(),
        side: position.side,
        quantity,
        entry_price: position.entry_price,
        exit_price: price,
        entry_time: position.opened_at,
        exit_time: timestamp,
        leverage: position.leverage,
        pnl,
        pnl_pct: if released > 0.0 {
            pnl / released * 100.0
        } else {
            0.0
        },
        fees,
        funding,
        exit_reason,
    };
    (trade, released)
}
