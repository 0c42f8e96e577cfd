//! Backtest harness
//!
//! Replays a historical tick series through the same grid engine the live
//! session runs. A simulated exchange acknowledges every placement
//! immediately and fills resting orders when the tick price crosses them,
//! so engine behavior is identical between replay and live trading.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::audit::AuditSink;
use crate::config::SessionConfig;
use crate::feed::{FillNotice, MarketEvent};
use crate::oms::{Command, GridEngine, OrderRequest};
use crate::types::{Money, PriceTick, Side};

/// Cap on fill-and-rearm cascades inside a single tick
const MAX_MATCH_ROUNDS: usize = 64;

// ============================================================================
// Simulated exchange
// ============================================================================

/// Book of resting limit orders. Placements are acknowledged immediately;
/// fills trigger when the tick's last trade touches the limit price.
struct SimExchange {
    book: HashMap<String, OrderRequest>,
    next_order_id: u64,
    next_fill_id: u64,
}

impl SimExchange {
    fn new() -> Self {
        Self {
            book: HashMap::new(),
            next_order_id: 1,
            next_fill_id: 1,
        }
    }

    /// Apply engine commands, returning the resulting acknowledgment events
    fn apply(&mut self, commands: Vec<Command>) -> Vec<MarketEvent> {
        let mut events = Vec::new();
        for command in commands {
            match command {
                Command::PlaceOrder(request) => {
                    let exchange_order_id = format!("sim-{}", self.next_order_id);
                    self.next_order_id += 1;
                    events.push(MarketEvent::Acknowledged {
                        client_id: request.client_id,
                        exchange_order_id: exchange_order_id.clone(),
                    });
                    self.book.insert(exchange_order_id, request);
                }
                Command::CancelOrder { exchange_order_id } => {
                    self.book.remove(&exchange_order_id);
                }
            }
        }
        events
    }

    /// Fill every resting order the tick crosses
    fn match_tick(&mut self, tick: &PriceTick) -> Vec<MarketEvent> {
        let crossed: Vec<String> = self
            .book
            .iter()
            .filter(|(_, req)| match req.side {
                Side::Buy => tick.last <= req.price,
                Side::Sell => tick.last >= req.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for exchange_order_id in crossed {
            if let Some(request) = self.book.remove(&exchange_order_id) {
                let fill_id = format!("sim-fill-{}", self.next_fill_id);
                self.next_fill_id += 1;
                events.push(MarketEvent::Fill(FillNotice {
                    exchange_order_id,
                    fill_id,
                    price: request.price,
                    quantity: request.quantity,
                    timestamp: tick.timestamp,
                }));
            }
        }
        events
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub instrument: String,
    pub ticks_replayed: usize,
    pub fills: usize,
    pub round_trips: usize,
    pub win_rate: f64,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub initial_capital: Money,
    pub final_equity: Money,
    pub return_pct: f64,
    pub max_drawdown_pct: f64,
    pub halted: bool,
    /// (year-month, percent return over the month)
    pub monthly_returns: Vec<(String, f64)>,
    /// Equity marked after every tick
    pub equity_curve: Vec<(DateTime<Utc>, Money)>,
}

impl BacktestReport {
    pub fn print(&self) {
        println!("\n{}", "=".repeat(60));
        println!("  BACKTEST RESULTS: {}", self.instrument);
        println!("{}", "=".repeat(60));
        println!("  Ticks replayed:    {}", self.ticks_replayed);
        println!("  Fills:             {}", self.fills);
        println!("  Round trips:       {}", self.round_trips);
        println!("  Win rate:          {:.1}%", self.win_rate * 100.0);
        println!("  Realized PnL:      {}", self.realized_pnl);
        println!("  Unrealized PnL:    {}", self.unrealized_pnl);
        println!("  Final equity:      {}", self.final_equity);
        println!("  Return:            {:.2}%", self.return_pct);
        println!("  Max drawdown:      {:.2}%", self.max_drawdown_pct);
        if self.halted {
            println!("  Session halted by stop loss");
        }
        if !self.monthly_returns.is_empty() {
            println!("\n  Monthly returns:");
            for (month, pct) in &self.monthly_returns {
                println!("    {}  {:+.2}%", month, pct);
            }
        }
        println!("{}", "=".repeat(60));
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct Backtester {
    config: SessionConfig,
    audit: Arc<dyn AuditSink>,
}

impl Backtester {
    pub fn new(config: SessionConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { config, audit }
    }

    /// Replay the series in order. The first tick supplies the reference
    /// price the ladder is planned around.
    pub fn run(&self, ticks: &[PriceTick]) -> Result<BacktestReport> {
        let Some(first) = ticks.first() else {
            bail!("tick series is empty");
        };

        let mut engine =
            GridEngine::new(&self.config, first.last, self.audit.clone())?;
        let mut exchange = SimExchange::new();
        let mut fills = 0usize;

        let initial_capital = Money::from_f64(self.config.grid.capital_allocation);
        let mut equity_curve: Vec<(DateTime<Utc>, Money)> = Vec::new();
        let mut peak = initial_capital;
        let mut max_drawdown_pct = 0.0f64;

        // Seed and acknowledge the initial ladder
        let commands = engine.seed(first.timestamp);
        Self::drain(&mut engine, &mut exchange, commands, first.timestamp);

        for tick in ticks {
            let commands = engine.handle_event(MarketEvent::Tick(tick.clone()), tick.timestamp);
            Self::drain(&mut engine, &mut exchange, commands, tick.timestamp);

            // Fills can arm new rungs the same tick already crosses
            for round in 0.. {
                let fill_events = exchange.match_tick(tick);
                if fill_events.is_empty() {
                    break;
                }
                if round >= MAX_MATCH_ROUNDS {
                    debug!(ts = %tick.timestamp, "match round cap reached");
                    break;
                }
                for event in fill_events {
                    fills += 1;
                    let commands = engine.handle_event(event, tick.timestamp);
                    Self::drain(&mut engine, &mut exchange, commands, tick.timestamp);
                }
            }

            let equity =
                initial_capital + engine.state().cumulative_pnl + engine.state().unrealized_pnl();
            if equity > peak {
                peak = equity;
            }
            if peak.is_positive() {
                let dd = ((peak - equity) / peak).to_f64() * 100.0;
                if dd > max_drawdown_pct {
                    max_drawdown_pct = dd;
                }
            }
            equity_curve.push((tick.timestamp, equity));
        }

        let state = engine.state();
        let final_equity = equity_curve
            .last()
            .map(|(_, e)| *e)
            .unwrap_or(initial_capital);
        let return_pct = if initial_capital.is_positive() {
            ((final_equity - initial_capital) / initial_capital).to_f64() * 100.0
        } else {
            0.0
        };
        let win_rate = if state.round_trips > 0 {
            state.winning_trips as f64 / state.round_trips as f64
        } else {
            0.0
        };

        info!(
            ticks = ticks.len(),
            fills,
            round_trips = state.round_trips,
            realized = %state.cumulative_pnl,
            "backtest complete"
        );

        Ok(BacktestReport {
            instrument: state.instrument.to_string(),
            ticks_replayed: ticks.len(),
            fills,
            round_trips: state.round_trips,
            win_rate,
            realized_pnl: state.cumulative_pnl,
            unrealized_pnl: state.unrealized_pnl(),
            initial_capital,
            final_equity,
            return_pct,
            max_drawdown_pct,
            halted: state.halted,
            monthly_returns: monthly_returns(&equity_curve),
            equity_curve,
        })
    }

    /// Route commands to the exchange and feed acknowledgments straight back
    fn drain(
        engine: &mut GridEngine,
        exchange: &mut SimExchange,
        commands: Vec<Command>,
        now: DateTime<Utc>,
    ) {
        let mut pending = commands;
        while !pending.is_empty() {
            let acks = exchange.apply(pending);
            pending = Vec::new();
            for ack in acks {
                pending.extend(engine.handle_event(ack, now));
            }
        }
    }
}

/// Percent change of equity within each calendar month
fn monthly_returns(curve: &[(DateTime<Utc>, Money)]) -> Vec<(String, f64)> {
    let mut months: Vec<(String, Money, Money)> = Vec::new();
    for (ts, equity) in curve {
        let key = ts.format("%Y-%m").to_string();
        match months.last_mut() {
            Some((month, _, last)) if *month == key => *last = *equity,
            _ => months.push((key, *equity, *equity)),
        }
    }
    months
        .into_iter()
        .filter(|(_, first, _)| first.is_positive())
        .map(|(month, first, last)| {
            let pct = ((last - first) / first).to_f64() * 100.0;
            (month, pct)
        })
        .collect()
}
