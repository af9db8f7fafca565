use crate::entities::catalog::MarketCatalog;
use crate::entities::metrics::{MetricsConfig, MetricsSummary, PerformanceTracker};
use crate::entities::portfolio::Portfolio;
use crate::entities::risk::{KillSwitchReason, RiskConfig, RiskContext, RiskDecision, RiskEngine};
use crate::services::audit::{sort_events, AuditEvent};
use crate::services::engine::execution::ExecutionConfig;
use crate::services::engine::simulator::{
    CancelledIntent, MarketSimulator, OrderQueue, StepContext, StepReport,
};
use crate::services::engine::InvariantViolation;
use crate::services::market_data_source::MarketDataSource;
use crate::services::strategy::Strategy;
use crate::value_objects::bar::Bar;
use crate::value_objects::equity_point::EquityPoint;
use crate::value_objects::fill::{Fill, FundingPayment, Liquidity};
use crate::value_objects::order::{IntentOrigin, OrderIntent};
use crate::value_objects::position::{MarginMode, Position};
use crate::value_objects::side::Side;
use crate::value_objects::signal::{Signal, SignalAction};
use crate::value_objects::trade::{ExitReason, Trade};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSizeMode {
    Quantity,
    /// `size` is the fraction of equity committed as initial margin.
    PctEquity,
}

impl OrderSizeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSizeMode::Quantity => "qty",
            OrderSizeMode::PctEquity => "pct_equity",
        }
    }
}

/// Cooperative control checked between bars.
pub trait RunControl {
    fn should_cancel(&self) -> bool;

    /// Blocks while the run is paused. Returns `false` if the run should stop.
    fn wait_if_paused(&self) -> bool {
        !self.should_cancel()
    }
}

pub struct NoopControl;

impl RunControl for NoopControl {
    fn should_cancel(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarProgress {
    pub bar_index: usize,
    pub timestamp: i64,
    pub close: f64,
    pub equity: f64,
    pub trades_in_bar: usize,
}

#[derive(Debug, Clone)]
pub struct BacktestSettings {
    pub run_id: String,
    pub initial_capital: f64,
    pub size_mode: OrderSizeMode,
    pub margin_mode: MarginMode,
    pub metrics: MetricsConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub summary: MetricsSummary,
    pub trades: Vec<Trade>,
    pub equity: Vec<EquityPoint>,
    pub fills: Vec<Fill>,
    pub funding: Vec<FundingPayment>,
    pub cancelled: Vec<CancelledIntent>,
    pub audit_events: Vec<AuditEvent>,
    pub final_positions: Vec<Position>,
    pub kill_switch: Option<KillSwitchReason>,
}

/// Last consistent state of a run, reported when it aborts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub bars_processed: usize,
    pub last_timestamp: Option<i64>,
    pub equity: f64,
    pub open_positions: usize,
    pub trades: usize,
    pub kill_switch: Option<KillSwitchReason>,
}

#[derive(Debug, Error)]
pub enum BacktestRunError {
    #[error("run cancelled after {bars_processed} bars")]
    Cancelled { bars_processed: usize },
    #[error("simulation aborted after {} bars: {violation}", .last_state.bars_processed)]
    Invariant {
        violation: InvariantViolation,
        last_state: Box<RunSnapshot>,
        offending_bar: Option<Box<Bar>>,
    },
}

/// Bar-by-bar replay shared by backtests and paper runs.
///
/// Per bar: queued intents for the bar's symbol are executed by the simulator, the tracker and
/// risk engine are marked, then the strategy is asked for a signal. Accepted intents fill no
/// earlier than the next bar of their symbol.
pub struct BacktestRunner<S, D>
where
    S: Strategy,
    D: MarketDataSource,
{
    run_id: String,
    size_mode: OrderSizeMode,
    margin_mode: MarginMode,
    strategy: S,
    data: D,
    portfolio: Portfolio,
    simulator: MarketSimulator,
    risk: RiskEngine,
    tracker: PerformanceTracker,
    queue: OrderQueue,
    next_order_id: u64,
    fills: Vec<Fill>,
    funding: Vec<FundingPayment>,
    cancelled: Vec<CancelledIntent>,
    audit_events: Vec<AuditEvent>,
    last_timestamps: BTreeMap<String, i64>,
    last_close: BTreeMap<String, f64>,
    bars_processed: usize,
}

impl<S, D> BacktestRunner<S, D>
where
    S: Strategy,
    D: MarketDataSource,
{
    pub fn new(settings: BacktestSettings, strategy: S, data: D, catalog: MarketCatalog) -> Self {
        let BacktestSettings {
            run_id,
            initial_capital,
            size_mode,
            margin_mode,
            metrics,
            risk,
            execution,
        } = settings;
        Self {
            risk: RiskEngine::new(run_id.clone(), risk, initial_capital),
            run_id,
            size_mode,
            margin_mode,
            strategy,
            data,
            portfolio: Portfolio::new(initial_capital),
            simulator: MarketSimulator::new(execution, catalog),
            tracker: PerformanceTracker::new(initial_capital, metrics),
            queue: OrderQueue::new(),
            next_order_id: 1,
            fills: Vec::new(),
            funding: Vec::new(),
            cancelled: Vec::new(),
            audit_events: Vec::new(),
            last_timestamps: BTreeMap::new(),
            last_close: BTreeMap::new(),
            bars_processed: 0,
        }
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    /// Queues an operator intent after risk checks. Reducing fills close with `ExitReason::Manual`.
    pub fn submit_manual(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        leverage: f64,
        timestamp: i64,
    ) -> RiskDecision {
        let intent = OrderIntent::market(self.next_order_id, symbol, side, quantity, timestamp)
            .with_leverage(leverage)
            .with_margin_mode(self.margin_mode)
            .with_origin(IntentOrigin::Manual);
        self.next_order_id += 1;
        self.submit(intent, timestamp)
    }

    pub fn trip_kill_switch(&mut self, reason: KillSwitchReason, timestamp: i64) {
        self.risk.trip_kill_switch(reason, timestamp);
        self.cancel_pending("kill_switch");
    }

    pub fn reset_kill_switch(&mut self, timestamp: i64) {
        self.risk.reset_kill_switch(timestamp);
    }

    pub fn run(&mut self) -> Result<BacktestResults, BacktestRunError> {
        self.run_with_progress_control(&mut |_progress: BarProgress| {}, &NoopControl)
    }

    pub fn run_with_progress(
        &mut self,
        progress: &mut dyn FnMut(BarProgress),
    ) -> Result<BacktestResults, BacktestRunError> {
        self.run_with_progress_control(progress, &NoopControl)
    }

    pub fn run_with_progress_control(
        &mut self,
        progress: &mut dyn FnMut(BarProgress),
        control: &dyn RunControl,
    ) -> Result<BacktestResults, BacktestRunError> {
        let strategy_name = self.strategy.name().to_string();
        let _span = tracing::info_span!(
            "backtest_engine",
            run_id = %self.run_id,
            strategy = %strategy_name
        )
        .entered();

        self.push_event(
            0,
            "engine",
            None,
            "start",
            None,
            json!({
                "strategy": strategy_name,
                "size_mode": self.size_mode.as_str(),
                "margin_mode": self.margin_mode.as_str(),
                "seed": self.simulator.config().seed,
                "remainder": self.simulator.config().remainder.as_str(),
            }),
        );

        while let Some(bar) = self.data.next_bar() {
            if control.should_cancel() || !control.wait_if_paused() {
                tracing::info!(bars_processed = self.bars_processed, "run cancelled");
                return Err(BacktestRunError::Cancelled {
                    bars_processed: self.bars_processed,
                });
            }

            let trades_in_bar = match self.process_bar(&bar) {
                Ok(trades) => trades,
                Err(violation) => {
                    tracing::error!(
                        symbol = %bar.symbol,
                        timestamp = bar.timestamp,
                        error = %violation,
                        "simulation invariant violated"
                    );
                    return Err(BacktestRunError::Invariant {
                        violation,
                        last_state: Box::new(self.snapshot()),
                        offending_bar: Some(Box::new(bar)),
                    });
                }
            };

            progress(BarProgress {
                bar_index: self.bars_processed - 1,
                timestamp: bar.timestamp,
                close: bar.close,
                equity: self.portfolio.equity(),
                trades_in_bar,
            });
        }

        Ok(self.finish())
    }

    fn process_bar(&mut self, bar: &Bar) -> Result<usize, InvariantViolation> {
        bar.validate()
            .map_err(|reason| InvariantViolation::malformed(bar, reason))?;
        if let Some(previous) = self.last_timestamps.get(&bar.symbol) {
            if bar.timestamp <= *previous {
                return Err(InvariantViolation::BarOutOfOrder {
                    symbol: bar.symbol.clone(),
                    previous: *previous,
                    timestamp: bar.timestamp,
                });
            }
        }

        let ctx = StepContext {
            available_balance: self.portfolio.free_collateral(),
        };
        let report = self
            .simulator
            .step(bar, &mut self.portfolio, &mut self.queue, ctx)?;
        self.last_timestamps
            .insert(bar.symbol.clone(), bar.timestamp);
        self.last_close.insert(bar.symbol.clone(), bar.close);

        let trades_in_bar = report.trades.len();
        self.record_step(report);

        let point = self
            .tracker
            .mark(
                bar.timestamp,
                self.portfolio.unrealized_pnl(),
                self.portfolio.len(),
            )
            .map_err(InvariantViolation::EquityOrder)?;
        self.portfolio.set_equity(point.equity);
        self.bars_processed += 1;

        if let Some(reason) = self
            .risk
            .on_mark(bar.timestamp, point.equity, self.portfolio.len())
        {
            tracing::warn!(
                reason = reason.as_str(),
                equity = point.equity,
                timestamp = bar.timestamp,
                "kill switch tripped"
            );
            self.cancel_pending("kill_switch");
        }

        let signal = self.strategy.on_bar(bar, &self.portfolio);
        self.schedule(bar, signal);
        if self.risk.kill_switch().is_some() {
            self.cancel_pending("kill_switch");
        }

        Ok(trades_in_bar)
    }

    fn record_step(&mut self, report: StepReport) {
        let StepReport {
            fills,
            trades,
            funding,
            cancelled,
        } = report;

        for fill in fills {
            self.tracker.on_fill(&fill);
            self.push_event(
                fill.timestamp,
                "fill",
                Some(fill.symbol.clone()),
                fill.kind.as_str(),
                None,
                json!({
                    "order_id": fill.order_id,
                    "side": fill.side.as_str(),
                    "qty": fill.quantity,
                    "price": fill.price,
                    "fee": fill.fee,
                    "slippage": fill.slippage,
                    "liquidity": match fill.liquidity {
                        Liquidity::Maker => "maker",
                        Liquidity::Taker => "taker",
                    },
                }),
            );
            self.fills.push(fill);
        }
        for payment in funding {
            self.tracker.on_funding(&payment);
            self.push_event(
                payment.timestamp,
                "funding",
                Some(payment.symbol.clone()),
                "settle",
                None,
                json!({
                    "side": payment.side.as_str(),
                    "rate": payment.rate,
                    "notional": payment.notional,
                    "amount": payment.amount,
                }),
            );
            self.funding.push(payment);
        }
        for trade in trades {
            if trade.exit_reason == ExitReason::Liquidation {
                tracing::warn!(
                    symbol = %trade.symbol,
                    side = trade.side.as_str(),
                    price = trade.exit_price,
                    pnl = trade.pnl,
                    "position liquidated"
                );
            }
            self.tracker.on_trade(trade);
        }
        for cancel in cancelled {
            self.record_cancel(&cancel);
            self.cancelled.push(cancel);
        }
    }

    fn schedule(&mut self, bar: &Bar, signal: Signal) {
        let position = self.portfolio.position(&bar.symbol);
        let (side, quantity) = match signal.action {
            SignalAction::Hold => return,
            SignalAction::Close => match position {
                Some(position) => (position.side.opposite(), Ok(position.quantity)),
                None => {
                    self.reject_signal(bar, &signal, "no_position");
                    return;
                }
            },
            SignalAction::Buy => (Side::Long, self.resolve_quantity(bar, &signal)),
            SignalAction::Sell => (Side::Short, self.resolve_quantity(bar, &signal)),
        };
        let quantity = match quantity {
            Ok(quantity) => quantity,
            Err(reason) => {
                self.reject_signal(bar, &signal, reason);
                return;
            }
        };

        let intent = OrderIntent {
            id: self.next_order_id,
            symbol: bar.symbol.clone(),
            side,
            order_type: signal.order_type,
            quantity,
            limit_price: signal.limit_price,
            leverage: signal.leverage,
            margin_mode: self.margin_mode,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            origin: IntentOrigin::Strategy,
            submitted_at: bar.timestamp,
            bars_waited: 0,
        };
        self.next_order_id += 1;
        self.submit(intent, bar.timestamp);
    }

    fn submit(&mut self, intent: OrderIntent, timestamp: i64) -> RiskDecision {
        let reference_price = intent.limit_price.unwrap_or_else(|| {
            self.last_close
                .get(&intent.symbol)
                .copied()
                .unwrap_or(0.0)
        });
        let open_positions = self.open_position_count();
        let ctx = RiskContext {
            timestamp,
            equity: self.portfolio.equity(),
            reference_price,
            position: self.portfolio.position(&intent.symbol),
            market: self.simulator.market(&intent.symbol),
            open_positions,
        };
        let decision = self.risk.evaluate(&intent, &ctx);
        self.audit_events.append(&mut self.risk.drain_audit_events());
        if let Some(approved) = decision.apply(&intent) {
            self.queue.push(approved);
        }
        decision
    }

    fn resolve_quantity(&self, bar: &Bar, signal: &Signal) -> Result<f64, &'static str> {
        let size = signal.size;
        if !size.is_finite() {
            return Err("size_not_finite");
        }
        if size <= 0.0 {
            return Err("non_positive_size");
        }
        match self.size_mode {
            OrderSizeMode::Quantity => Ok(size),
            OrderSizeMode::PctEquity => {
                if size > 1.0 {
                    return Err("pct_out_of_range");
                }
                let equity = self.portfolio.equity();
                if equity <= 0.0 || !equity.is_finite() {
                    return Err("equity_not_positive");
                }
                let price = signal.limit_price.unwrap_or(bar.close);
                if price <= 0.0 || !price.is_finite() {
                    return Err("price_not_positive");
                }
                Ok(equity * size * signal.leverage.max(1.0) / price)
            }
        }
    }

    /// Symbols with an open position or a queued intent that may open one.
    fn open_position_count(&self) -> usize {
        let mut symbols: BTreeSet<&str> = self
            .portfolio
            .positions()
            .map(|position| position.symbol.as_str())
            .collect();
        symbols.extend(self.queue.iter().map(|intent| intent.symbol.as_str()));
        symbols.len()
    }

    fn cancel_pending(&mut self, reason: &'static str) {
        for intent in self.queue.drain() {
            let cancel = CancelledIntent {
                unfilled_qty: intent.quantity,
                reason,
                intent,
            };
            self.record_cancel(&cancel);
            self.cancelled.push(cancel);
        }
    }

    fn record_cancel(&mut self, cancel: &CancelledIntent) {
        let timestamp = self
            .last_timestamps
            .get(&cancel.intent.symbol)
            .copied()
            .unwrap_or(cancel.intent.submitted_at);
        self.push_event(
            timestamp,
            "order",
            Some(cancel.intent.symbol.clone()),
            "cancel",
            Some(cancel.reason.to_string()),
            json!({
                "order_id": cancel.intent.id,
                "side": cancel.intent.side.as_str(),
                "unfilled_qty": cancel.unfilled_qty,
                "bars_waited": cancel.intent.bars_waited,
            }),
        );
    }

    fn reject_signal(&mut self, bar: &Bar, signal: &Signal, reason: &str) {
        let strategy_id = self.strategy.name().to_string();
        self.push_event(
            bar.timestamp,
            "order",
            Some(bar.symbol.clone()),
            "reject",
            Some(reason.to_string()),
            json!({
                "strategy_id": strategy_id,
                "action_type": format!("{:?}", signal.action),
                "requested_size": signal.size,
                "size_mode": self.size_mode.as_str(),
            }),
        );
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            bars_processed: self.bars_processed,
            last_timestamp: self.tracker.equity_curve().last().map(|p| p.timestamp),
            equity: self.portfolio.equity(),
            open_positions: self.portfolio.len(),
            trades: self.tracker.trades().len(),
            kill_switch: self.risk.kill_switch(),
        }
    }

    fn finish(&mut self) -> BacktestResults {
        self.cancel_pending("run_ended");
        self.audit_events
            .append(&mut self.strategy.drain_audit_events());
        self.audit_events.append(&mut self.risk.drain_audit_events());

        let kill_switch = self.risk.kill_switch();
        let final_positions: Vec<Position> = self.portfolio.positions().cloned().collect();
        let (equity, trades, summary) = std::mem::take(&mut self.tracker).into_parts();
        let last_timestamp = equity.last().map(|point| point.timestamp).unwrap_or(0);
        self.push_event(
            last_timestamp,
            "engine",
            None,
            "complete",
            None,
            json!({
                "bars_processed": summary.bars_processed,
                "trades": summary.trades,
                "net_profit": summary.net_profit,
                "sharpe": summary.sharpe,
                "max_drawdown": summary.max_drawdown,
                "liquidations": summary.liquidations,
                "open_positions": final_positions.len(),
                "kill_switch": kill_switch.map(|reason| reason.as_str()),
            }),
        );
        sort_events(&mut self.audit_events);

        BacktestResults {
            summary,
            trades,
            equity,
            fills: std::mem::take(&mut self.fills),
            funding: std::mem::take(&mut self.funding),
            cancelled: std::mem::take(&mut self.cancelled),
            audit_events: std::mem::take(&mut self.audit_events),
            final_positions,
            kill_switch,
        }
    }

    fn push_event(
        &mut self,
        timestamp: i64,
        stage: &str,
        symbol: Option<String>,
        action: &str,
        error: Option<String>,
        details: serde_json::Value,
    ) {
        self.audit_events.push(AuditEvent {
            run_id: self.run_id.clone(),
            timestamp,
            stage: stage.to_string(),
            symbol,
            action: action.to_string(),
            error,
            details,
        });
    }
}
