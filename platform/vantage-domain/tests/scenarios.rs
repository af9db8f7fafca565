use vantage_domain::entities::catalog::{
    ContractType, FeeSchedule, FundingSpec, MarketCatalog, MarketSpec,
};
use vantage_domain::entities::metrics::MetricsConfig;
use vantage_domain::entities::risk::{KillSwitchReason, RiskConfig};
use vantage_domain::services::engine::backtest::{
    BacktestResults, BacktestRunner, BacktestSettings, OrderSizeMode,
};
use vantage_domain::services::engine::execution::ExecutionConfig;
use vantage_domain::services::market_data_source::VecBarSource;
use vantage_domain::services::strategy::ScriptedStrategy;
use vantage_domain::value_objects::bar::Bar;
use vantage_domain::value_objects::fill::FillKind;
use vantage_domain::value_objects::position::MarginMode;
use vantage_domain::value_objects::signal::Signal;
use vantage_domain::value_objects::trade::ExitReason;

const SYMBOL: &str = "BTC_USDT";
const DAY: i64 = 86_400;

fn bar(ts: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: SYMBOL.to_string(),
        timestamp: ts,
        open,
        high,
        low,
        close,
        volume: 1_000.0,
    }
}

fn flat(ts: i64, price: f64) -> Bar {
    bar(ts, price, price, price, price)
}

fn settings(initial_capital: f64, risk: RiskConfig, execution: ExecutionConfig) -> BacktestSettings {
    BacktestSettings {
        run_id: "scenario".to_string(),
        initial_capital,
        size_mode: OrderSizeMode::Quantity,
        margin_mode: MarginMode::Isolated,
        metrics: MetricsConfig::default(),
        risk,
        execution,
    }
}

fn run(
    signals: Vec<(i64, Signal)>,
    bars: Vec<Bar>,
    settings: BacktestSettings,
    catalog: MarketCatalog,
) -> BacktestResults {
    BacktestRunner::new(
        settings,
        ScriptedStrategy::new(signals),
        VecBarSource::new(bars),
        catalog,
    )
    .run()
    .expect("run")
}

fn risk_rejects(results: &BacktestResults) -> Vec<(i64, String)> {
    results
        .audit_events
        .iter()
        .filter(|event| event.stage == "risk" && event.action == "reject")
        .map(|event| (event.timestamp, event.error.clone().unwrap_or_default()))
        .collect()
}

#[test]
fn leveraged_long_marks_unrealized_pnl_net_of_entry_fee() {
    let bars = vec![
        flat(0, 100.0),
        bar(60, 100.0, 101.0, 99.0, 100.0),
        bar(120, 100.0, 106.0, 99.0, 105.0),
        bar(180, 105.0, 106.0, 94.0, 95.0),
        bar(240, 95.0, 111.0, 94.0, 110.0),
    ];
    let risk = RiskConfig {
        max_leverage: 2.0,
        ..RiskConfig::default()
    };
    let results = run(
        vec![(0, Signal::buy(1.0).with_leverage(2.0))],
        bars,
        settings(1_000.0, risk, ExecutionConfig::simple(10.0, 0.0)),
        MarketCatalog::default(),
    );

    assert_eq!(results.fills.len(), 1);
    assert_eq!(results.fills[0].price, 100.0);
    assert!((results.fills[0].fee - 0.1).abs() < 1e-12);
    let closes: Vec<f64> = results
        .equity
        .iter()
        .map(|point| point.unrealized_pnl)
        .collect();
    assert_eq!(closes, vec![0.0, 0.0, 5.0, -5.0, 10.0]);
    assert!((results.summary.final_equity - 1_009.9).abs() < 1e-9);
    assert!(results.trades.is_empty());
}

#[test]
fn short_is_liquidated_at_liquidation_price() {
    let bars = vec![
        flat(60, 100.0),
        flat(120, 100.0),
        bar(180, 101.0, 110.0, 100.0, 108.0),
        flat(240, 108.0),
    ];
    let risk = RiskConfig {
        max_leverage: 20.0,
        ..RiskConfig::default()
    };
    let results = run(
        vec![(60, Signal::sell(1.0).with_leverage(20.0))],
        bars,
        settings(1_000.0, risk, ExecutionConfig::simple(0.0, 0.0)),
        MarketCatalog::default(),
    );

    let expected = 105.0 / 1.005;
    assert_eq!(results.trades.len(), 1);
    let trade = &results.trades[0];
    assert_eq!(trade.exit_reason, ExitReason::Liquidation);
    assert!((trade.exit_price - expected).abs() < 1e-9);
    assert!(trade.pnl < 0.0 && trade.pnl > -5.0);
    assert_eq!(results.summary.liquidations, 1);
    assert_eq!(
        results.fills.last().map(|fill| fill.kind),
        Some(FillKind::Liquidation)
    );
    assert!(results.final_positions.is_empty());
}

#[test]
fn daily_loss_kill_switch_clears_on_next_session() {
    let bars = vec![
        flat(DAY - 180, 100.0),
        flat(DAY - 120, 100.0),
        bar(DAY - 60, 100.0, 100.0, 89.0, 89.0),
        flat(DAY + 60, 89.0),
        flat(DAY + 120, 89.0),
    ];
    let risk = RiskConfig {
        daily_loss_limit_pct: 0.05,
        ..RiskConfig::default()
    };
    let results = run(
        vec![
            (DAY - 180, Signal::buy(5.0)),
            (DAY - 60, Signal::buy(1.0)),
            (DAY + 60, Signal::buy(1.0)),
        ],
        bars,
        settings(1_000.0, risk, ExecutionConfig::simple(0.0, 0.0)),
        MarketCatalog::default(),
    );

    assert_eq!(
        risk_rejects(&results),
        vec![(DAY - 60, "kill_switch_daily_loss".to_string())]
    );
    assert_eq!(results.fills.len(), 2);
    assert_eq!(results.kill_switch, None);
    let rollover = results
        .audit_events
        .iter()
        .find(|event| event.action == "session_rollover")
        .expect("rollover");
    assert_eq!(rollover.details["daily_loss_kill_switch_cleared"], true);
}

#[test]
fn drawdown_kill_switch_persists_across_sessions() {
    let bars = vec![
        flat(60, 100.0),
        flat(120, 100.0),
        bar(180, 100.0, 100.0, 75.0, 75.0),
        flat(DAY + 60, 75.0),
        flat(DAY + 120, 75.0),
    ];
    let risk = RiskConfig {
        max_drawdown_pct: 0.1,
        ..RiskConfig::default()
    };
    let results = run(
        vec![(60, Signal::buy(5.0)), (DAY + 60, Signal::buy(1.0))],
        bars,
        settings(1_000.0, risk, ExecutionConfig::simple(0.0, 0.0)),
        MarketCatalog::default(),
    );

    assert_eq!(results.kill_switch, Some(KillSwitchReason::MaxDrawdown));
    assert_eq!(
        risk_rejects(&results),
        vec![(DAY + 60, "kill_switch_max_drawdown".to_string())]
    );
    assert_eq!(results.fills.len(), 1);
}

#[test]
fn catalog_caps_leverage_quantizes_and_enforces_min_notional() {
    let catalog = MarketCatalog::new(vec![MarketSpec {
        lot_size: 0.01,
        tick_size: 0.1,
        min_notional: 10.0,
        fees_bps: Some(FeeSchedule {
            maker: 2.0,
            taker: 5.0,
        }),
        ..MarketSpec::unrestricted(SYMBOL, 5.0)
    }]);
    let risk = RiskConfig {
        max_leverage: 10.0,
        ..RiskConfig::default()
    };
    let results = run(
        vec![
            (60, Signal::buy(0.123).with_leverage(10.0)),
            (120, Signal::buy(0.05).with_leverage(5.0)),
        ],
        vec![flat(60, 100.0), flat(120, 100.0), flat(180, 100.0)],
        settings(1_000.0, risk, ExecutionConfig::simple(50.0, 0.0)),
        catalog,
    );

    assert_eq!(results.fills.len(), 1);
    let fill = &results.fills[0];
    assert!((fill.quantity - 0.12).abs() < 1e-9);
    assert!((fill.fee - 0.006).abs() < 1e-12);
    assert_eq!(results.final_positions[0].leverage, 5.0);
    assert_eq!(
        risk_rejects(&results),
        vec![(120, "below_min_notional".to_string())]
    );
    let resize = results
        .audit_events
        .iter()
        .find(|event| event.action == "resize")
        .expect("resize");
    assert_eq!(
        resize.details["decision"]["reasons"],
        serde_json::json!(["leverage_cap", "lot_size"])
    );
}

#[test]
fn perpetual_funding_is_debited_from_equity() {
    let step = 4 * 3600;
    let catalog = MarketCatalog::new(vec![MarketSpec {
        contract_type: ContractType::Perpetual,
        funding: Some(FundingSpec {
            interval_hours: 8,
            rate: 0.001,
            rate_cap: None,
        }),
        ..MarketSpec::unrestricted(SYMBOL, 10.0)
    }]);
    let execution = ExecutionConfig {
        bar_seconds: step,
        ..ExecutionConfig::simple(0.0, 0.0)
    };
    let bars = (1..=6).map(|i| flat(i * step, 100.0)).collect();
    let results = run(
        vec![(step, Signal::buy(1.0))],
        bars,
        settings(10_000.0, RiskConfig::default(), execution),
        catalog,
    );

    assert_eq!(results.funding.len(), 3);
    assert!((results.summary.total_funding - 0.3).abs() < 1e-12);
    assert!((results.summary.final_equity - 9_999.7).abs() < 1e-9);
}
