//! Integration tests for the grid trading system
//!
//! These tests drive the planner, engine, governor, and backtester together
//! through the public API.

use std::sync::Arc;

use chrono::{Duration, Utc};

use grid_trader::audit::{AuditEvent, MemoryAudit};
use grid_trader::backtest::Backtester;
use grid_trader::config::{ExchangeConfig, GridConfig, RetryPolicy, RiskLimits, Spacing};
use grid_trader::feed::{FillNotice, MarketEvent};
use grid_trader::oms::Command;
use grid_trader::planner::{self, LevelStatus};
use grid_trader::{GridEngine, Money, PriceTick, SessionConfig, Side, Symbol};

// =============================================================================
// Test Utilities
// =============================================================================

fn session_config(stop_loss: f64, max_capital: f64) -> SessionConfig {
    SessionConfig {
        grid: GridConfig {
            instrument: "BTCUSDT".to_string(),
            lower_bound: 90.0,
            upper_bound: 110.0,
            level_count: 5,
            capital_allocation: 1000.0,
            spacing: Spacing::Arithmetic,
        },
        risk: RiskLimits {
            max_capital_at_risk: max_capital,
            stop_loss_price: stop_loss,
            max_orders_per_minute: 600,
        },
        retry: RetryPolicy::default(),
        exchange: ExchangeConfig::default(),
        audit_dir: "state".to_string(),
    }
}

/// Sawtooth price path oscillating between the given bounds
fn sawtooth(low: f64, high: f64, cycles: usize) -> Vec<PriceTick> {
    let sym = Symbol::new("BTCUSDT");
    let mid = (low + high) / 2.0;
    let start = Utc::now();
    let mut prices = vec![mid];
    for _ in 0..cycles {
        prices.push(low);
        prices.push(high);
    }
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            PriceTick::new(
                start + Duration::minutes(i as i64),
                sym.clone(),
                p * 0.999,
                p * 1.001,
                p,
            )
            .unwrap()
        })
        .collect()
}

fn ack_placements(engine: &mut GridEngine, commands: &[Command]) {
    let now = Utc::now();
    for command in commands {
        if let Command::PlaceOrder(request) = command {
            engine.handle_event(
                MarketEvent::Acknowledged {
                    client_id: request.client_id,
                    exchange_order_id: format!("ex-{}", request.client_id),
                },
                now,
            );
        }
    }
}

// =============================================================================
// Planner + Engine
// =============================================================================

#[test]
fn test_ladder_covers_configured_range() {
    let config = session_config(0.0, 10_000.0);
    let levels = planner::plan(&config.grid, Money::from_f64(100.0)).unwrap();

    assert_eq!(levels.len(), 5);
    assert_eq!(levels.first().unwrap().price.to_f64(), 90.0);
    assert_eq!(levels.last().unwrap().price.to_f64(), 110.0);

    let buys = levels.iter().filter(|l| l.side == Side::Buy).count();
    let sells = levels.iter().filter(|l| l.side == Side::Sell).count();
    assert_eq!(buys, 2);
    assert_eq!(sells, 3);
}

#[test]
fn test_full_round_trip_through_engine() {
    let audit = Arc::new(MemoryAudit::new());
    let mut engine = GridEngine::new(
        &session_config(0.0, 10_000.0),
        Money::from_f64(100.0),
        audit.clone(),
    )
    .unwrap();
    let now = Utc::now();

    let commands = engine.seed(now);
    ack_placements(&mut engine, &commands);

    let buy_order = engine
        .state()
        .orders
        .values()
        .find(|o| o.price.to_f64() == 95.0)
        .unwrap()
        .clone();

    // Buy fill at 95 arms the sell at 100
    let commands = engine.handle_event(
        MarketEvent::Fill(FillNotice {
            exchange_order_id: buy_order.exchange_order_id.clone().unwrap(),
            fill_id: "f-1".to_string(),
            price: buy_order.price,
            quantity: buy_order.quantity,
            timestamp: now,
        }),
        now,
    );
    ack_placements(&mut engine, &commands);

    let sell_order = engine
        .state()
        .orders
        .values()
        .find(|o| o.price.to_f64() == 100.0 && o.is_open())
        .unwrap()
        .clone();
    assert_eq!(sell_order.side, Side::Sell);
    assert_eq!(sell_order.quantity, buy_order.quantity);

    // Sell fill closes the round trip at a profit
    engine.handle_event(
        MarketEvent::Fill(FillNotice {
            exchange_order_id: sell_order.exchange_order_id.clone().unwrap(),
            fill_id: "f-2".to_string(),
            price: sell_order.price,
            quantity: sell_order.quantity,
            timestamp: now,
        }),
        now,
    );

    let state = engine.state();
    assert_eq!(state.round_trips, 1);
    assert_eq!(state.winning_trips, 1);
    let expected = (Money::from_f64(100.0) - Money::from_f64(95.0)) * buy_order.quantity;
    assert_eq!(state.cumulative_pnl, expected);
    assert!(audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::Fill { .. })));
}

#[test]
fn test_duplicate_fill_is_idempotent() {
    let audit = Arc::new(MemoryAudit::new());
    let mut engine = GridEngine::new(
        &session_config(0.0, 10_000.0),
        Money::from_f64(100.0),
        audit,
    )
    .unwrap();
    let now = Utc::now();

    let commands = engine.seed(now);
    ack_placements(&mut engine, &commands);

    let order = engine
        .state()
        .orders
        .values()
        .find(|o| o.price.to_f64() == 95.0)
        .unwrap()
        .clone();
    let notice = FillNotice {
        exchange_order_id: order.exchange_order_id.clone().unwrap(),
        fill_id: "f-dup".to_string(),
        price: order.price,
        quantity: order.quantity,
        timestamp: now,
    };

    engine.handle_event(MarketEvent::Fill(notice.clone()), now);
    let pnl_after_first = engine.state().cumulative_pnl;
    let lots_after_first = engine.state().inventory.len();

    engine.handle_event(MarketEvent::Fill(notice), now);
    assert_eq!(engine.state().cumulative_pnl, pnl_after_first);
    assert_eq!(engine.state().inventory.len(), lots_after_first);
}

// =============================================================================
// Risk invariants
// =============================================================================

#[test]
fn test_capital_cap_holds_across_session() {
    // Cap admits only part of the ladder
    let cap = 450.0;
    let audit = Arc::new(MemoryAudit::new());
    let mut engine = GridEngine::new(
        &session_config(0.0, cap),
        Money::from_f64(100.0),
        audit.clone(),
    )
    .unwrap();
    let now = Utc::now();

    let commands = engine.seed(now);
    ack_placements(&mut engine, &commands);
    assert!(engine.state().open_notional() <= Money::from_f64(cap));
    assert!(audit.denials() >= 1);

    // A fill frees notional; the re-armed order must still respect the cap
    let order = engine
        .state()
        .orders
        .values()
        .find(|o| o.is_open())
        .unwrap()
        .clone();
    let commands = engine.handle_event(
        MarketEvent::Fill(FillNotice {
            exchange_order_id: order.exchange_order_id.clone().unwrap(),
            fill_id: "f-1".to_string(),
            price: order.price,
            quantity: order.quantity,
            timestamp: now,
        }),
        now,
    );
    ack_placements(&mut engine, &commands);
    assert!(engine.state().open_notional() <= Money::from_f64(cap));
}

#[test]
fn test_stop_loss_halts_and_blocks_trading() {
    let audit = Arc::new(MemoryAudit::new());
    let mut engine = GridEngine::new(
        &session_config(85.0, 10_000.0),
        Money::from_f64(100.0),
        audit.clone(),
    )
    .unwrap();
    let now = Utc::now();

    let commands = engine.seed(now);
    ack_placements(&mut engine, &commands);

    let sym = Symbol::new("BTCUSDT");
    let crash = PriceTick::new(now, sym.clone(), 83.0, 84.0, 83.5).unwrap();
    let commands = engine.handle_event(MarketEvent::Tick(crash), now);

    assert!(engine.is_halted());
    assert!(commands
        .iter()
        .all(|c| matches!(c, Command::CancelOrder { .. })));
    assert!(audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::Halt { .. })));

    // Recovery tick after the halt places nothing
    let recovery = PriceTick::new(now, sym, 99.0, 101.0, 100.0).unwrap();
    let commands = engine.handle_event(MarketEvent::Tick(recovery), now);
    assert!(commands.is_empty());
    assert!(engine
        .state()
        .levels
        .iter()
        .all(|l| l.status == LevelStatus::Cancelled));
}

// =============================================================================
// Backtest
// =============================================================================

#[test]
fn test_backtest_profits_from_oscillation() {
    let ticks = sawtooth(93.0, 107.0, 10);
    let backtester = Backtester::new(session_config(0.0, 10_000.0), Arc::new(MemoryAudit::new()));
    let report = backtester.run(&ticks).unwrap();

    assert!(report.round_trips >= 5);
    assert!(report.realized_pnl.is_positive());
    assert!(report.final_equity > report.initial_capital);
    assert!(!report.halted);
}

#[test]
fn test_backtest_and_engine_agree_on_flat_market() {
    let ticks = sawtooth(100.0, 100.0, 5);
    let backtester = Backtester::new(session_config(0.0, 10_000.0), Arc::new(MemoryAudit::new()));
    let report = backtester.run(&ticks).unwrap();

    assert_eq!(report.round_trips, 0);
    assert!(report.realized_pnl.is_zero());
    assert_eq!(report.final_equity, report.initial_capital);
}

#[test]
fn test_backtest_stop_loss_limits_losses() {
    let sym = Symbol::new("BTCUSDT");
    let start = Utc::now();
    let prices = [100.0, 95.0, 91.0, 86.0, 84.0, 80.0, 70.0];
    let ticks: Vec<PriceTick> = prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            PriceTick::new(
                start + Duration::minutes(i as i64),
                sym.clone(),
                p * 0.999,
                p * 1.001,
                p,
            )
            .unwrap()
        })
        .collect();

    let backtester = Backtester::new(session_config(85.0, 10_000.0), Arc::new(MemoryAudit::new()));
    let report = backtester.run(&ticks).unwrap();

    assert!(report.halted);
    // Inventory acquired before the halt is marked at the crash price
    assert!(report.final_equity < report.initial_capital);
}
