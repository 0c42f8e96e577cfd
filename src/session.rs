//! Session state
//!
//! Process-wide state of one trading session: the ladder, order records,
//! inventory lots, and realized PnL. The order state machine is the single
//! writer; the risk governor's emergency-stop path is the one exception
//! (see `risk::RiskGovernor::enforce_stop_loss`). Everything else reads.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::oms::{ClientOrderId, OrderRecord};
use crate::planner::{GridLevel, LevelStatus};
use crate::types::{Money, Symbol};

/// Cost-basis lot from a filled buy, consumed FIFO by sell fills
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub price: Money,
    pub quantity: Money,
}

/// State for one trading session. Initialized at session start, torn down at
/// session end or on a triggered halt.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub instrument: Symbol,
    pub reference_price: Money,
    /// Ordered ladder, strictly increasing prices
    pub levels: Vec<GridLevel>,
    /// All order records of the session, live and terminal
    pub orders: HashMap<ClientOrderId, OrderRecord>,
    /// Exchange order id -> client order id, populated on acknowledgment
    pub exchange_ids: HashMap<String, ClientOrderId>,
    /// Open buy inventory awaiting the profit-taking sell
    pub inventory: VecDeque<Lot>,
    pub cumulative_pnl: Money,
    pub halted: bool,
    /// Submissions withheld while exchange connectivity is down
    pub suspended: bool,
    pub last_price: Option<Money>,
    pub round_trips: usize,
    pub winning_trips: usize,
}

impl SessionState {
    pub fn new(instrument: Symbol, reference_price: Money, levels: Vec<GridLevel>) -> Self {
        Self {
            instrument,
            reference_price,
            levels,
            orders: HashMap::new(),
            exchange_ids: HashMap::new(),
            inventory: VecDeque::new(),
            cumulative_pnl: Money::ZERO,
            halted: false,
            suspended: false,
            last_price: None,
            round_trips: 0,
            winning_trips: 0,
        }
    }

    /// Iterate orders currently working at the exchange
    pub fn open_orders(&self) -> impl Iterator<Item = &OrderRecord> {
        self.orders.values().filter(|o| o.is_open())
    }

    /// Summed notional of open orders, checked against the capital cap
    pub fn open_notional(&self) -> Money {
        self.open_orders().map(|o| o.notional()).sum()
    }

    /// Mark-to-market PnL of open inventory at the last seen price
    pub fn unrealized_pnl(&self) -> Money {
        let Some(last) = self.last_price else {
            return Money::ZERO;
        };
        self.inventory
            .iter()
            .map(|lot| (last - lot.price) * lot.quantity)
            .sum()
    }

    pub fn report(&self) -> SessionReport {
        let open_levels = self
            .levels
            .iter()
            .filter(|l| l.status == LevelStatus::Open)
            .count();
        let win_rate = if self.round_trips > 0 {
            self.winning_trips as f64 / self.round_trips as f64 * 100.0
        } else {
            0.0
        };
        SessionReport {
            instrument: self.instrument.clone(),
            last_price: self.last_price,
            realized_pnl: self.cumulative_pnl,
            unrealized_pnl: self.unrealized_pnl(),
            open_levels,
            open_lots: self.inventory.len(),
            round_trips: self.round_trips,
            win_rate,
            halted: self.halted,
        }
    }
}

/// Point-in-time session summary for logs and reports
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub instrument: Symbol,
    pub last_price: Option<Money>,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub open_levels: usize,
    pub open_lots: usize,
    pub round_trips: usize,
    pub win_rate: f64,
    pub halted: bool,
}

impl SessionReport {
    pub fn log(&self) {
        tracing::info!(
            instrument = %self.instrument,
            realized_pnl = %self.realized_pnl,
            unrealized_pnl = %self.unrealized_pnl,
            open_levels = self.open_levels,
            round_trips = self.round_trips,
            win_rate = format!("{:.1}%", self.win_rate),
            halted = self.halted,
            "session status"
        );
    }
}
