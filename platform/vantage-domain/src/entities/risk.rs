use crate::entities::catalog::MarketSpec;
use crate::services::audit::AuditEvent;
use crate::value_objects::order::{OrderIntent, OrderType};
use crate::value_objects::position::Position;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Risk limits. A limit of `0` disables the corresponding check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskConfig {
    pub max_open_positions: usize,
    pub max_leverage: f64,
    /// Maximum initial margin of a single position as a fraction of equity.
    pub max_position_pct: f64,
    /// Maximum loss within one UTC session as a fraction of the session's starting equity.
    pub daily_loss_limit_pct: f64,
    pub max_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 0,
            max_leverage: 1.0,
            max_position_pct: 0.0,
            daily_loss_limit_pct: 0.0,
            max_drawdown_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchReason {
    DailyLoss,
    MaxDrawdown,
    Manual,
}

impl KillSwitchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            KillSwitchReason::DailyLoss => "daily_loss",
            KillSwitchReason::MaxDrawdown => "max_drawdown",
            KillSwitchReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskRejectReason {
    KillSwitch(KillSwitchReason),
    InvalidIntent(&'static str),
    MarketNotTrading,
    MaxOpenPositions,
    PositionSizeLimit,
    BelowLotSize,
    BelowMinNotional,
}

impl RiskRejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RiskRejectReason::KillSwitch(KillSwitchReason::DailyLoss) => "kill_switch_daily_loss",
            RiskRejectReason::KillSwitch(KillSwitchReason::MaxDrawdown) => {
                "kill_switch_max_drawdown"
            }
            RiskRejectReason::KillSwitch(KillSwitchReason::Manual) => "kill_switch_manual",
            RiskRejectReason::InvalidIntent(_) => "invalid_intent",
            RiskRejectReason::MarketNotTrading => "market_not_trading",
            RiskRejectReason::MaxOpenPositions => "max_open_positions",
            RiskRejectReason::PositionSizeLimit => "position_size_limit",
            RiskRejectReason::BelowLotSize => "below_lot_size",
            RiskRejectReason::BelowMinNotional => "below_min_notional",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeReason {
    LeverageCap,
    PositionSize,
    LotSize,
}

impl ResizeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResizeReason::LeverageCap => "leverage_cap",
            ResizeReason::PositionSize => "position_size",
            ResizeReason::LotSize => "lot_size",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accept,
    Reject(RiskRejectReason),
    Resize {
        quantity: f64,
        leverage: f64,
        reasons: Vec<ResizeReason>,
    },
}

impl RiskDecision {
    pub fn is_reject(&self) -> bool {
        matches!(self, RiskDecision::Reject(_))
    }

    /// The intent to forward to the engine, if any.
    pub fn apply(&self, intent: &OrderIntent) -> Option<OrderIntent> {
        match self {
            RiskDecision::Accept => Some(intent.clone()),
            RiskDecision::Reject(_) => None,
            RiskDecision::Resize {
                quantity, leverage, ..
            } => {
                let mut resized = intent.clone();
                resized.quantity = *quantity;
                resized.leverage = *leverage;
                Some(resized)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskState {
    pub session_day: Option<NaiveDate>,
    pub session_start_equity: f64,
    pub daily_pnl: f64,
    pub peak_equity: f64,
    pub current_drawdown: f64,
    pub open_positions: usize,
    pub kill_switch: Option<KillSwitchReason>,
    last_equity: f64,
}

impl RiskState {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            session_day: None,
            session_start_equity: initial_equity,
            daily_pnl: 0.0,
            peak_equity: initial_equity,
            current_drawdown: 0.0,
            open_positions: 0,
            kill_switch: None,
            last_equity: initial_equity,
        }
    }

    /// Session loss as a positive fraction of the session's starting equity.
    pub fn daily_loss_pct(&self) -> f64 {
        if self.session_start_equity <= 0.0 {
            return 0.0;
        }
        (-self.daily_pnl / self.session_start_equity).max(0.0)
    }
}

/// Inputs the engine knows about at decision time.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext<'a> {
    pub timestamp: i64,
    pub equity: f64,
    /// Price used to value the intent (limit price or last close).
    pub reference_price: f64,
    pub position: Option<&'a Position>,
    pub market: Option<&'a MarketSpec>,
    /// Open positions plus accepted intents that will open new ones.
    pub open_positions: usize,
}

#[derive(Debug)]
pub struct RiskEngine {
    run_id: String,
    config: RiskConfig,
    state: RiskState,
    audit_events: Vec<AuditEvent>,
}

impl RiskEngine {
    pub fn new(run_id: String, config: RiskConfig, initial_equity: f64) -> Self {
        Self {
            run_id,
            config,
            state: RiskState::new(initial_equity),
            audit_events: Vec::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn kill_switch(&self) -> Option<KillSwitchReason> {
        self.state.kill_switch
    }

    pub fn drain_audit_events(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.audit_events)
    }

    /// Pre-trade checks, applied in a fixed order. Every decision is recorded in the audit trail.
    pub fn evaluate(&mut self, intent: &OrderIntent, ctx: &RiskContext<'_>) -> RiskDecision {
        self.roll_session(ctx.timestamp);
        let decision = self.decide(intent, ctx);
        self.record_decision(intent, ctx, &decision);
        decision
    }

    fn decide(&mut self, intent: &OrderIntent, ctx: &RiskContext<'_>) -> RiskDecision {
        if let Some(reason) = self.state.kill_switch {
            return RiskDecision::Reject(RiskRejectReason::KillSwitch(reason));
        }

        if let Some(reason) = invalid_intent_reason(intent, ctx.reference_price) {
            return RiskDecision::Reject(RiskRejectReason::InvalidIntent(reason));
        }
        if ctx.market.is_some_and(|market| !market.is_trading()) {
            return RiskDecision::Reject(RiskRejectReason::MarketNotTrading);
        }

        let reducing = ctx
            .position
            .is_some_and(|position| position.side != intent.side);
        let opens_new = ctx.position.is_none();

        if opens_new
            && self.config.max_open_positions > 0
            && ctx.open_positions >= self.config.max_open_positions
        {
            return RiskDecision::Reject(RiskRejectReason::MaxOpenPositions);
        }

        let mut quantity = intent.quantity;
        let mut leverage = intent.leverage;
        let mut reasons = Vec::new();

        if !reducing {
            let cap = self.leverage_cap(ctx.market);
            if leverage > cap {
                leverage = cap;
                reasons.push(ResizeReason::LeverageCap);
            }

            if self.config.max_position_pct > 0.0 {
                let budget = ctx.equity.max(0.0) * self.config.max_position_pct;
                let existing = ctx.position.map(|position| position.margin).unwrap_or(0.0);
                let required = existing + quantity * ctx.reference_price / leverage;
                if required > budget {
                    let allowed = (budget - existing) * leverage / ctx.reference_price;
                    if allowed <= 0.0 {
                        return RiskDecision::Reject(RiskRejectReason::PositionSizeLimit);
                    }
                    quantity = allowed;
                    reasons.push(ResizeReason::PositionSize);
                }
            }
        }

        if self.config.daily_loss_limit_pct > 0.0 {
            let daily_pnl = ctx.equity - self.state.session_start_equity;
            self.state.daily_pnl = daily_pnl;
            if self.state.daily_loss_pct() >= self.config.daily_loss_limit_pct {
                self.trip(KillSwitchReason::DailyLoss, ctx.timestamp);
                return RiskDecision::Reject(RiskRejectReason::KillSwitch(
                    KillSwitchReason::DailyLoss,
                ));
            }
        }

        if !reducing {
            if let Some(market) = ctx.market {
                let quantized = market.quantize_quantity(quantity);
                if quantized <= 0.0 {
                    return RiskDecision::Reject(RiskRejectReason::BelowLotSize);
                }
                if (quantized - quantity).abs() > f64::EPSILON * quantity.abs().max(1.0) {
                    quantity = quantized;
                    reasons.push(ResizeReason::LotSize);
                }
                if market.min_notional > 0.0
                    && quantity * ctx.reference_price < market.min_notional
                {
                    return RiskDecision::Reject(RiskRejectReason::BelowMinNotional);
                }
            }
        }

        if reasons.is_empty() {
            RiskDecision::Accept
        } else {
            RiskDecision::Resize {
                quantity,
                leverage,
                reasons,
            }
        }
    }

    /// Continuous checks after each mark-to-market. Returns a kill switch tripped by this mark.
    pub fn on_mark(
        &mut self,
        timestamp: i64,
        equity: f64,
        open_positions: usize,
    ) -> Option<KillSwitchReason> {
        self.roll_session(timestamp);

        self.state.open_positions = open_positions;
        self.state.daily_pnl = equity - self.state.session_start_equity;
        if equity > self.state.peak_equity {
            self.state.peak_equity = equity;
        }
        self.state.current_drawdown = if self.state.peak_equity > 0.0 {
            ((self.state.peak_equity - equity) / self.state.peak_equity).max(0.0)
        } else {
            0.0
        };
        self.state.last_equity = equity;

        if self.state.kill_switch.is_some() {
            return None;
        }
        if self.config.max_drawdown_pct > 0.0
            && self.state.current_drawdown >= self.config.max_drawdown_pct
        {
            self.trip(KillSwitchReason::MaxDrawdown, timestamp);
            return Some(KillSwitchReason::MaxDrawdown);
        }
        if self.config.daily_loss_limit_pct > 0.0
            && self.state.daily_loss_pct() >= self.config.daily_loss_limit_pct
        {
            self.trip(KillSwitchReason::DailyLoss, timestamp);
            return Some(KillSwitchReason::DailyLoss);
        }
        None
    }

    pub fn trip_kill_switch(&mut self, reason: KillSwitchReason, timestamp: i64) {
        if self.state.kill_switch.is_none() {
            self.trip(reason, timestamp);
        }
    }

    pub fn reset_kill_switch(&mut self, timestamp: i64) {
        let Some(previous) = self.state.kill_switch.take() else {
            return;
        };
        self.push_event(
            timestamp,
            None,
            "kill_switch_reset",
            None,
            json!({ "previous": previous.as_str() }),
        );
    }

    fn leverage_cap(&self, market: Option<&MarketSpec>) -> f64 {
        let configured = if self.config.max_leverage >= 1.0 {
            self.config.max_leverage
        } else {
            1.0
        };
        match market {
            Some(market) if market.max_leverage >= 1.0 => configured.min(market.max_leverage),
            _ => configured,
        }
    }

    fn trip(&mut self, reason: KillSwitchReason, timestamp: i64) {
        self.state.kill_switch = Some(reason);
        self.push_event(
            timestamp,
            None,
            "kill_switch",
            Some(reason.as_str().to_string()),
            json!({
                "daily_pnl": self.state.daily_pnl,
                "session_start_equity": self.state.session_start_equity,
                "drawdown": self.state.current_drawdown,
            }),
        );
    }

    fn roll_session(&mut self, timestamp: i64) {
        let Some(day) = session_day(timestamp) else {
            return;
        };
        match self.state.session_day {
            Some(current) if current == day => {}
            Some(_) => {
                self.state.session_day = Some(day);
                self.state.session_start_equity = self.state.last_equity;
                self.state.daily_pnl = 0.0;
                let cleared = self.state.kill_switch == Some(KillSwitchReason::DailyLoss);
                if cleared {
                    self.state.kill_switch = None;
                }
                self.push_event(
                    timestamp,
                    None,
                    "session_rollover",
                    None,
                    json!({
                        "session_day": day.to_string(),
                        "session_start_equity": self.state.session_start_equity,
                        "daily_loss_kill_switch_cleared": cleared,
                    }),
                );
            }
            None => {
                self.state.session_day = Some(day);
            }
        }
    }

    fn record_decision(
        &mut self,
        intent: &OrderIntent,
        ctx: &RiskContext<'_>,
        decision: &RiskDecision,
    ) {
        let (action, error, extra) = match decision {
            RiskDecision::Accept => ("accept", None, json!({})),
            RiskDecision::Reject(reason) => {
                let detail = match reason {
                    RiskRejectReason::InvalidIntent(detail) => Some(*detail),
                    _ => None,
                };
                (
                    "reject",
                    Some(reason.code().to_string()),
                    json!({ "detail": detail }),
                )
            }
            RiskDecision::Resize {
                quantity,
                leverage,
                reasons,
            } => (
                "resize",
                None,
                json!({
                    "resized_qty": quantity,
                    "resized_leverage": leverage,
                    "reasons": reasons.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
                }),
            ),
        };
        self.push_event(
            ctx.timestamp,
            Some(intent.symbol.clone()),
            action,
            error,
            json!({
                "order_id": intent.id,
                "side": intent.side.as_str(),
                "order_type": match intent.order_type {
                    OrderType::Market => "market",
                    OrderType::Limit => "limit",
                },
                "requested_qty": intent.quantity,
                "requested_leverage": intent.leverage,
                "equity": ctx.equity,
                "reference_price": ctx.reference_price,
                "decision": extra,
            }),
        );
    }

    fn push_event(
        &mut self,
        timestamp: i64,
        symbol: Option<String>,
        action: &str,
        error: Option<String>,
        details: serde_json::Value,
    ) {
        match action {
            "accept" | "session_rollover" => tracing::debug!(
                run_id = %self.run_id,
                timestamp,
                symbol = symbol.as_deref().unwrap_or("-"),
                action,
                "risk decision"
            ),
            _ => tracing::info!(
                run_id = %self.run_id,
                timestamp,
                symbol = symbol.as_deref().unwrap_or("-"),
                action,
                reason = error.as_deref().unwrap_or("-"),
                "risk decision"
            ),
        }
        self.audit_events.push(AuditEvent {
            run_id: self.run_id.clone(),
            timestamp,
            stage: "risk".to_string(),
            symbol,
            action: action.to_string(),
            error,
            details,
        });
    }
}

fn invalid_intent_reason(intent: &OrderIntent, reference_price: f64) -> Option<&'static str> {
    if !intent.quantity.is_finite() || intent.quantity <= 0.0 {
        return Some("non_positive_quantity");
    }
    if !intent.leverage.is_finite() || intent.leverage < 1.0 {
        return Some("leverage_below_one");
    }
    if intent.order_type == OrderType::Limit
        && !intent
            .limit_price
            .is_some_and(|price| price.is_finite() && price > 0.0)
    {
        return Some("limit_without_price");
    }
    if !reference_price.is_finite() || reference_price <= 0.0 {
        return Some("no_reference_price");
    }
    None
}

fn session_day(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}
