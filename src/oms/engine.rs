//! Grid order state machine
//!
//! Consumes the normalized event stream and drives each level through
//! Pending -> Open -> Filled -> (re-armed) Open on the opposite side.
//! Every placement decision passes through the risk governor. The engine
//! never performs exchange I/O: it emits commands and reconciles the
//! acknowledgments and fills the feed adapter delivers later.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{RetryPolicy, SessionConfig};
use crate::feed::{FillNotice, MarketEvent};
use crate::oms::types::{Command, OrderRecord, OrderRequest, OrderStatus};
use crate::planner::{self, LevelStatus};
use crate::risk::{Decision, RiskGovernor};
use crate::session::{Lot, SessionState};
use crate::types::{Money, SessionError, Side};

#[derive(Debug, Clone)]
struct RetryState {
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

pub struct GridEngine {
    state: SessionState,
    governor: RiskGovernor,
    retry: RetryPolicy,
    /// Reject/backoff bookkeeping per level index
    retries: HashMap<usize, RetryState>,
    /// Submissions withheld while connectivity is down
    deferred: Vec<usize>,
    /// Levels denied for capital, re-proposed when open notional shrinks
    starved: Vec<usize>,
    audit: Arc<dyn AuditSink>,
}

impl GridEngine {
    /// Plan the ladder and build the session. Fails with
    /// `InvalidConfiguration` before any order is placed.
    pub fn new(
        config: &SessionConfig,
        reference_price: Money,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, SessionError> {
        let levels = planner::plan(&config.grid, reference_price)?;
        let state = SessionState::new(config.grid.symbol(), reference_price, levels);
        let governor = RiskGovernor::new(&config.risk, audit.clone());

        Ok(Self {
            state,
            governor,
            retry: config.retry.clone(),
            retries: HashMap::new(),
            deferred: Vec::new(),
            starved: Vec::new(),
            audit,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state.halted
    }

    /// Submit the initial ladder. A rung priced exactly at the reference is
    /// withheld; it is first armed by the re-arm path.
    pub fn seed(&mut self, now: DateTime<Utc>) -> Vec<Command> {
        let mut commands = Vec::new();
        for index in 0..self.state.levels.len() {
            let level = &self.state.levels[index];
            if level.status != LevelStatus::Pending {
                continue;
            }
            if level.price == self.state.reference_price {
                debug!(index, price = %level.price, "withholding reference rung from seeding");
                continue;
            }
            self.submit_level(index, now, &mut commands);
        }
        info!(
            submitted = commands.len(),
            levels = self.state.levels.len(),
            "grid seeded"
        );
        commands
    }

    /// Process one event in arrival order. Returned commands are handed to
    /// the feed adapter (or the backtest's simulated sink).
    pub fn handle_event(&mut self, event: MarketEvent, now: DateTime<Utc>) -> Vec<Command> {
        let mut commands = Vec::new();
        match event {
            MarketEvent::Tick(tick) => {
                self.state.last_price = Some(tick.last);
                if let Some(cancels) = self.governor.enforce_stop_loss(tick.last, &mut self.state)
                {
                    self.retries.clear();
                    self.deferred.clear();
                    self.starved.clear();
                    commands.extend(cancels);
                }
                self.poll_retries(now, &mut commands);
            }
            MarketEvent::Fill(notice) => self.on_fill(notice, now, &mut commands),
            MarketEvent::Acknowledged {
                client_id,
                exchange_order_id,
            } => self.on_ack(client_id, exchange_order_id, now, &mut commands),
            MarketEvent::Rejected { client_id, reason } => {
                self.on_reject(client_id, reason, now)
            }
            MarketEvent::ConnectivityLost => {
                warn!("connectivity lost, suspending submissions");
                self.state.suspended = true;
            }
            MarketEvent::Reconnected => {
                info!("connectivity restored, resuming submissions");
                self.state.suspended = false;
                let deferred = std::mem::take(&mut self.deferred);
                for index in deferred {
                    if self.state.levels[index].status == LevelStatus::Pending {
                        self.submit_level(index, now, &mut commands);
                    }
                }
            }
        }
        commands
    }

    /// Explicit user-initiated stop: cancel all open orders and retire the
    /// ladder. Terminal for the session.
    pub fn stop(&mut self) -> Vec<Command> {
        if self.state.halted {
            return Vec::new();
        }
        self.state.halted = true;
        self.retries.clear();
        self.deferred.clear();
        self.starved.clear();
        self.audit.record(&AuditEvent::Halt {
            reason: "user_stop".to_string(),
        });

        let mut commands = Vec::new();
        for order in self.state.orders.values_mut() {
            if order.is_open() {
                order.status = OrderStatus::Cancelled;
                if let Some(id) = &order.exchange_order_id {
                    commands.push(Command::CancelOrder {
                        exchange_order_id: id.clone(),
                    });
                }
            }
        }
        for index in 0..self.state.levels.len() {
            self.transition_level(index, LevelStatus::Cancelled);
        }
        commands
    }

    fn submit_level(&mut self, index: usize, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        if self.state.halted {
            return;
        }
        if self.state.suspended {
            if !self.deferred.contains(&index) {
                self.deferred.push(index);
            }
            return;
        }

        let level = &self.state.levels[index];
        let request = OrderRequest::new(
            self.state.instrument.clone(),
            level.side,
            level.price,
            level.quantity,
            index,
        );

        match self.governor.authorize(&request, &self.state, now) {
            Decision::Allow => {
                self.governor.note_submission(now);
                let record = OrderRecord::from_request(&request, now);
                self.state.orders.insert(record.client_id, record);
                self.transition_level(index, LevelStatus::Open);
                self.starved.retain(|&i| i != index);
                commands.push(Command::PlaceOrder(request));
            }
            Decision::Deny(reason) => match reason {
                // Rate denials clear on their own; schedule a resubmission
                crate::risk::DenyReason::RateLimited => {
                    let entry = self.retries.entry(index).or_insert(RetryState {
                        attempts: 0,
                        next_attempt_at: now,
                    });
                    entry.next_attempt_at =
                        now + Duration::milliseconds(self.retry.delay_ms(1) as i64);
                }
                // Capital denials wait for fills to shrink the open notional
                crate::risk::DenyReason::CapitalExceeded => {
                    if !self.starved.contains(&index) {
                        self.starved.push(index);
                    }
                }
                // A stop breach halts the session on the next tick
                crate::risk::DenyReason::StopLossTriggered => {}
            },
        }
    }

    fn on_fill(&mut self, notice: FillNotice, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        let Some(&client_id) = self.state.exchange_ids.get(&notice.exchange_order_id) else {
            // Exchange/client desync; expected from real connections
            warn!(
                "{}",
                SessionError::UnknownFillReference(notice.exchange_order_id.clone())
            );
            return;
        };

        let Some(order) = self.state.orders.get_mut(&client_id) else {
            warn!(client_id, "exchange id maps to a missing order record");
            return;
        };
        if !order.is_open() {
            debug!(
                client_id,
                fill_id = %notice.fill_id,
                "ignoring fill for non-open order"
            );
            return;
        }

        order.status = OrderStatus::Filled;
        order.updated_at = now;
        let side = order.side;
        let index = order.level_index;
        let filled_qty = notice.quantity;

        self.audit.record(&AuditEvent::Fill {
            exchange_order_id: notice.exchange_order_id.clone(),
            fill_id: notice.fill_id.clone(),
            price: notice.price,
            quantity: filled_qty,
        });
        self.transition_level(index, LevelStatus::Filled);
        self.settle_fill(side, notice.price, filled_qty);
        self.rearm(index, side, filled_qty, now, commands);
        self.resubmit_starved(now, commands);
    }

    /// Re-propose capital-denied levels; a fill just freed their share or a
    /// tick may find room after other levels retired
    fn resubmit_starved(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        if self.state.halted || self.state.suspended {
            return;
        }
        let starved = std::mem::take(&mut self.starved);
        for index in starved {
            if self.state.levels[index].status == LevelStatus::Pending {
                self.submit_level(index, now, commands);
            }
        }
    }

    /// Update inventory lots and realized PnL for one fill
    fn settle_fill(&mut self, side: Side, price: Money, quantity: Money) {
        match side {
            Side::Buy => {
                self.state.inventory.push_back(Lot { price, quantity });
            }
            Side::Sell => {
                let mut remaining = quantity;
                let mut pnl = Money::ZERO;
                let mut matched = false;
                while remaining.is_positive() {
                    let Some(lot) = self.state.inventory.front_mut() else {
                        // Seeded sell without inventory: proceeds without a
                        // cost basis, nothing to realize
                        break;
                    };
                    matched = true;
                    let take = remaining.min(lot.quantity);
                    pnl += (price - lot.price) * take;
                    lot.quantity -= take;
                    remaining -= take;
                    if lot.quantity.is_zero() {
                        self.state.inventory.pop_front();
                    }
                }
                if matched {
                    self.state.cumulative_pnl += pnl;
                    self.state.round_trips += 1;
                    if pnl.is_positive() {
                        self.state.winning_trips += 1;
                    }
                    info!(price = %price, pnl = %pnl, "round trip completed");
                }
            }
        }
    }

    /// Arm the opposite side at the adjacent rung. Price comes from the
    /// stored ladder and quantity from the fill, never re-planned.
    fn rearm(
        &mut self,
        index: usize,
        filled_side: Side,
        filled_qty: Money,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        if self.state.halted {
            return;
        }

        let target = match filled_side {
            Side::Buy => index.checked_add(1).filter(|&i| i < self.state.levels.len()),
            Side::Sell => index.checked_sub(1),
        };
        let Some(target) = target else {
            info!(index, side = %filled_side, "edge rung filled, no adjacent rung to arm");
            return;
        };

        match self.state.levels[target].status {
            LevelStatus::Open => {
                info!(target, "adjacent rung already carries a live order, skipping re-arm");
                return;
            }
            // Retired rungs stay retired
            LevelStatus::Cancelled => {
                info!(target, "adjacent rung is retired, skipping re-arm");
                return;
            }
            LevelStatus::Pending | LevelStatus::Filled => {}
        }

        {
            let level = &mut self.state.levels[target];
            level.side = filled_side.opposite();
            level.quantity = filled_qty;
        }
        self.transition_level(target, LevelStatus::Pending);
        self.submit_level(target, now, commands);
    }

    fn on_ack(
        &mut self,
        client_id: u64,
        exchange_order_id: String,
        now: DateTime<Utc>,
        commands: &mut Vec<Command>,
    ) {
        let Some(order) = self.state.orders.get_mut(&client_id) else {
            warn!(client_id, "acknowledgment for unknown client order id");
            return;
        };

        if order.status == OrderStatus::Cancelled {
            // Halt raced the submission; answer with a no-op cancellation
            info!(
                client_id,
                exchange_order_id, "late acknowledgment for cancelled level"
            );
            commands.push(Command::CancelOrder {
                exchange_order_id: exchange_order_id.clone(),
            });
            self.state
                .exchange_ids
                .insert(exchange_order_id, client_id);
            return;
        }

        order.exchange_order_id = Some(exchange_order_id.clone());
        order.status = OrderStatus::Acknowledged;
        order.updated_at = now;
        let index = order.level_index;
        self.state
            .exchange_ids
            .insert(exchange_order_id, client_id);
        self.retries.remove(&index);
    }

    fn on_reject(&mut self, client_id: u64, reason: String, now: DateTime<Utc>) {
        let Some(order) = self.state.orders.get_mut(&client_id) else {
            warn!(client_id, "rejection for unknown client order id");
            return;
        };
        let index = order.level_index;
        order.status = OrderStatus::Rejected;
        order.updated_at = now;
        warn!(
            "{}",
            SessionError::OrderRejected {
                client_id,
                reason: reason.clone()
            }
        );

        self.transition_level(index, LevelStatus::Pending);

        let entry = self.retries.entry(index).or_insert(RetryState {
            attempts: 0,
            next_attempt_at: now,
        });
        entry.attempts += 1;

        if entry.attempts >= self.retry.max_attempts {
            warn!(
                index,
                attempts = entry.attempts,
                "retry budget exhausted, retiring level"
            );
            self.retries.remove(&index);
            self.audit.record(&AuditEvent::OrderDenied {
                client_id,
                reason: format!("retries_exhausted: {}", reason),
            });
            self.transition_level(index, LevelStatus::Cancelled);
        } else {
            let delay = self.retry.delay_ms(entry.attempts);
            entry.next_attempt_at = now + Duration::milliseconds(delay as i64);
            debug!(index, attempts = entry.attempts, delay_ms = delay, "retry scheduled");
        }
    }

    fn poll_retries(&mut self, now: DateTime<Utc>, commands: &mut Vec<Command>) {
        if self.state.halted || self.state.suspended {
            return;
        }
        let due: Vec<usize> = self
            .retries
            .iter()
            .filter(|(_, r)| r.next_attempt_at <= now)
            .map(|(&i, _)| i)
            .collect();
        for index in due {
            if self.state.levels[index].status == LevelStatus::Pending {
                self.submit_level(index, now, commands);
            } else {
                self.retries.remove(&index);
            }
        }
        self.resubmit_starved(now, commands);
    }

    fn transition_level(&mut self, index: usize, to: LevelStatus) {
        let from = self.state.levels[index].status;
        if from == to {
            return;
        }
        self.state.levels[index].status = to;
        self.audit.record(&AuditEvent::LevelTransition {
            level_index: index,
            from,
            to,
        });
    }
}
