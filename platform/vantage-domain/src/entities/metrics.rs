use crate::value_objects::equity_point::EquityPoint;
use crate::value_objects::fill::{Fill, FundingPayment};
use crate::value_objects::trade::{ExitReason, Trade};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub bars_processed: usize,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    /// Gross profit over gross loss; `None` when there are no losing trades.
    pub profit_factor: Option<f64>,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub total_fees: f64,
    pub total_funding: f64,
    pub liquidations: usize,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub final_equity: f64,
    pub total_return: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsConfig {
    pub risk_free_rate: f64,
    pub annualization_factor: Option<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            annualization_factor: None,
        }
    }
}

/// Equity bookkeeping for one run.
///
/// Counters (wins, gross profit/loss, peak, max drawdown) are updated incrementally as fills,
/// trades and marks arrive. Ratios are always derived from the stored history, and
/// [`recompute_summary`] rebuilds the same summary from persisted trades and equity alone.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    config: MetricsConfig,
    initial_equity: f64,
    realized_gross: f64,
    fees: f64,
    funding: f64,
    unrealized: f64,
    peak_equity: f64,
    max_drawdown: f64,
    wins: usize,
    losses: usize,
    gross_profit: f64,
    gross_loss: f64,
    liquidations: usize,
    equity_curve: Vec<EquityPoint>,
    trades: Vec<Trade>,
}

impl PerformanceTracker {
    pub fn new(initial_equity: f64, config: MetricsConfig) -> Self {
        Self {
            config,
            initial_equity,
            peak_equity: initial_equity,
            ..Self::default()
        }
    }

    pub fn on_fill(&mut self, fill: &Fill) {
        self.fees += fill.fee;
    }

    pub fn on_funding(&mut self, payment: &FundingPayment) {
        self.funding += payment.amount;
    }

    pub fn on_trade(&mut self, trade: Trade) {
        self.realized_gross += trade.gross_pnl();
        if trade.pnl > 0.0 {
            self.wins += 1;
            self.gross_profit += trade.pnl;
        } else {
            self.losses += 1;
            self.gross_loss += -trade.pnl;
        }
        if trade.exit_reason == ExitReason::Liquidation {
            self.liquidations += 1;
        }
        self.trades.push(trade);
    }

    /// Equity implied by everything recorded so far, valued with `unrealized` open PnL.
    pub fn equity_with(&self, unrealized: f64) -> f64 {
        self.initial_equity + self.realized_gross + unrealized - self.fees - self.funding
    }

    pub fn equity(&self) -> f64 {
        self.equity_with(self.unrealized)
    }

    /// Appends a snapshot. Timestamps must not go backwards.
    pub fn mark(
        &mut self,
        timestamp: i64,
        unrealized: f64,
        open_positions: usize,
    ) -> Result<EquityPoint, String> {
        if let Some(last) = self.equity_curve.last() {
            if timestamp < last.timestamp {
                return Err(format!(
                    "equity timestamp went backwards: {} after {}",
                    timestamp, last.timestamp
                ));
            }
        }
        self.unrealized = unrealized;
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = drawdown(self.peak_equity, equity);
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }

        let point = EquityPoint {
            timestamp,
            equity,
            realized_pnl: self.realized_gross,
            unrealized_pnl: unrealized,
            fees: self.fees,
            funding: self.funding,
            drawdown,
            cumulative_return: cumulative_return(self.initial_equity, equity),
            open_positions,
        };
        self.equity_curve.push(point.clone());
        Ok(point)
    }

    pub fn initial_equity(&self) -> f64 {
        self.initial_equity
    }

    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn summary(&self) -> MetricsSummary {
        let final_equity = self
            .equity_curve
            .last()
            .map(|point| point.equity)
            .unwrap_or(self.initial_equity);
        build_summary(
            SummaryCounters {
                wins: self.wins,
                losses: self.losses,
                gross_profit: self.gross_profit,
                gross_loss: self.gross_loss,
                liquidations: self.liquidations,
                fees: self.fees,
                funding: self.funding,
                max_drawdown: self.max_drawdown,
            },
            self.initial_equity,
            final_equity,
            &self.equity_curve,
            self.trades.len(),
            self.config,
        )
    }

    pub fn into_parts(self) -> (Vec<EquityPoint>, Vec<Trade>, MetricsSummary) {
        let summary = self.summary();
        (self.equity_curve, self.trades, summary)
    }
}

struct SummaryCounters {
    wins: usize,
    losses: usize,
    gross_profit: f64,
    gross_loss: f64,
    liquidations: usize,
    fees: f64,
    funding: f64,
    max_drawdown: f64,
}

/// Rebuilds the summary from persisted history only.
pub fn recompute_summary(
    initial_equity: f64,
    trades: &[Trade],
    equity: &[EquityPoint],
    config: MetricsConfig,
) -> MetricsSummary {
    let mut counters = SummaryCounters {
        wins: 0,
        losses: 0,
        gross_profit: 0.0,
        gross_loss: 0.0,
        liquidations: 0,
        fees: 0.0,
        funding: 0.0,
        max_drawdown: 0.0,
    };
    for trade in trades {
        if trade.pnl > 0.0 {
            counters.wins += 1;
            counters.gross_profit += trade.pnl;
        } else {
            counters.losses += 1;
            counters.gross_loss += -trade.pnl;
        }
        if trade.exit_reason == ExitReason::Liquidation {
            counters.liquidations += 1;
        }
    }

    let mut peak = initial_equity;
    for point in equity {
        if point.equity > peak {
            peak = point.equity;
        }
        counters.max_drawdown = counters.max_drawdown.max(drawdown(peak, point.equity));
    }
    if let Some(last) = equity.last() {
        counters.fees = last.fees;
        counters.funding = last.funding;
    }

    let final_equity = equity
        .last()
        .map(|point| point.equity)
        .unwrap_or(initial_equity);
    build_summary(
        counters,
        initial_equity,
        final_equity,
        equity,
        trades.len(),
        config,
    )
}

fn build_summary(
    counters: SummaryCounters,
    initial_equity: f64,
    final_equity: f64,
    equity: &[EquityPoint],
    trades: usize,
    config: MetricsConfig,
) -> MetricsSummary {
    let win_rate = if trades == 0 {
        0.0
    } else {
        counters.wins as f64 / trades as f64
    };
    let profit_factor = if counters.gross_loss > 0.0 {
        Some(counters.gross_profit / counters.gross_loss)
    } else {
        None
    };
    MetricsSummary {
        bars_processed: equity.len(),
        trades,
        wins: counters.wins,
        losses: counters.losses,
        win_rate,
        profit_factor,
        gross_profit: counters.gross_profit,
        gross_loss: counters.gross_loss,
        net_profit: final_equity - initial_equity,
        total_fees: counters.fees,
        total_funding: counters.funding,
        liquidations: counters.liquidations,
        sharpe: sharpe_ratio(equity, initial_equity, config),
        max_drawdown: counters.max_drawdown,
        final_equity,
        total_return: cumulative_return(initial_equity, final_equity),
    }
}

fn drawdown(peak: f64, equity: f64) -> f64 {
    if peak > 0.0 {
        ((peak - equity) / peak).max(0.0)
    } else {
        0.0
    }
}

fn cumulative_return(initial: f64, equity: f64) -> f64 {
    if initial > 0.0 {
        equity / initial - 1.0
    } else {
        0.0
    }
}

/// Per-bar Sharpe, scaled by `sqrt(annualization_factor)` periods per year. Unscaled when no
/// factor is set.
pub fn sharpe_ratio(equity: &[EquityPoint], initial_equity: f64, config: MetricsConfig) -> f64 {
    if equity.is_empty() {
        return 0.0;
    }

    let mut returns = Vec::with_capacity(equity.len());
    let mut prev = initial_equity;
    for point in equity {
        if prev > 0.0 {
            returns.push(point.equity / prev - 1.0 - config.risk_free_rate);
        }
        prev = point.equity;
    }

    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns
        .iter()
        .map(|ret| {
            let diff = ret - mean;
            diff * diff
        })
        .sum::<f64>()
        / (returns.len() as f64 - 1.0);

    let std = var.sqrt();
    if std == 0.0 {
        0.0
    } else {
        let scale = config
            .annualization_factor
            .filter(|factor| factor.is_finite() && *factor > 0.0)
            .unwrap_or(1.0);
        mean / std * scale.sqrt()
    }
}
