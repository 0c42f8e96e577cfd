//! Risk governor
//!
//! Gates every order placement against the session's risk limits and owns
//! the emergency-stop path. The governor reads `SessionState`; the one
//! mutation it performs is the stop-loss halt, which must short-circuit
//! independently of the fill-driven flow.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::RiskLimits;
use crate::oms::{Command, OrderRequest, OrderStatus};
use crate::planner::LevelStatus;
use crate::session::SessionState;
use crate::types::Money;

/// Reason an order placement was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Open notional plus the proposed order would exceed max_capital_at_risk
    CapitalExceeded,
    /// Last trade price is at or below the stop-loss threshold
    StopLossTriggered,
    /// Trailing 60-second submission budget is spent
    RateLimited,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::CapitalExceeded => "capital_exceeded",
            DenyReason::StopLossTriggered => "stop_loss_triggered",
            DenyReason::RateLimited => "rate_limited",
        }
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

const RATE_WINDOW_SECS: i64 = 60;

pub struct RiskGovernor {
    max_capital_at_risk: Money,
    stop_loss_price: Money,
    max_orders_per_minute: usize,
    /// Timestamps of approved submissions inside the trailing window
    submissions: VecDeque<DateTime<Utc>>,
    audit: Arc<dyn AuditSink>,
}

impl RiskGovernor {
    pub fn new(limits: &RiskLimits, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            max_capital_at_risk: Money::from_f64(limits.max_capital_at_risk),
            stop_loss_price: Money::from_f64(limits.stop_loss_price),
            max_orders_per_minute: limits.max_orders_per_minute,
            submissions: VecDeque::new(),
            audit,
        }
    }

    /// Authorize a proposed order against a read-only view of the session.
    /// Every denial is recorded to the audit trail.
    pub fn authorize(
        &mut self,
        request: &OrderRequest,
        state: &SessionState,
        now: DateTime<Utc>,
    ) -> Decision {
        self.prune_window(now);

        let decision = if self.stop_breached(state.last_price) {
            Decision::Deny(DenyReason::StopLossTriggered)
        } else if self.submissions.len() >= self.max_orders_per_minute {
            Decision::Deny(DenyReason::RateLimited)
        } else if state.open_notional() + request.notional() > self.max_capital_at_risk {
            Decision::Deny(DenyReason::CapitalExceeded)
        } else {
            Decision::Allow
        };

        if let Decision::Deny(reason) = decision {
            warn!(
                client_id = request.client_id,
                reason = reason.as_str(),
                price = %request.price,
                "order denied"
            );
            self.audit.record(&AuditEvent::OrderDenied {
                client_id: request.client_id,
                reason: reason.as_str().to_string(),
            });
        }

        decision
    }

    /// Count an approved submission against the rate window
    pub fn note_submission(&mut self, now: DateTime<Utc>) {
        self.submissions.push_back(now);
    }

    /// Emergency stop. The only state mutation performed outside the order
    /// state machine: on breach, mark the session halted, retire every level,
    /// and produce cancellation commands for orders known to the exchange.
    pub fn enforce_stop_loss(
        &mut self,
        last_price: Money,
        state: &mut SessionState,
    ) -> Option<Vec<Command>> {
        if state.halted || !self.stop_breached(Some(last_price)) {
            return None;
        }

        info!(
            last_price = %last_price,
            stop = %self.stop_loss_price,
            "stop loss triggered, halting session"
        );
        state.halted = true;
        self.audit.record(&AuditEvent::Halt {
            reason: format!("stop_loss_triggered at {}", last_price),
        });

        let mut commands = Vec::new();
        for order in state.orders.values_mut() {
            if order.is_open() {
                order.status = OrderStatus::Cancelled;
                if let Some(id) = &order.exchange_order_id {
                    commands.push(Command::CancelOrder {
                        exchange_order_id: id.clone(),
                    });
                }
            }
        }
        for (index, level) in state.levels.iter_mut().enumerate() {
            if level.status != LevelStatus::Cancelled {
                self.audit.record(&AuditEvent::LevelTransition {
                    level_index: index,
                    from: level.status,
                    to: LevelStatus::Cancelled,
                });
                level.status = LevelStatus::Cancelled;
            }
        }

        Some(commands)
    }

    fn stop_breached(&self, last_price: Option<Money>) -> bool {
        if !self.stop_loss_price.is_positive() {
            return false;
        }
        matches!(last_price, Some(last) if last <= self.stop_loss_price)
    }

    fn prune_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        while matches!(self.submissions.front(), Some(&ts) if ts < cutoff) {
            self.submissions.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::planner::GridLevel;
    use crate::types::{Side, Symbol};

    fn limits() -> RiskLimits {
        RiskLimits {
            max_capital_at_risk: 500.0,
            stop_loss_price: 85.0,
            max_orders_per_minute: 3,
        }
    }

    fn empty_state() -> SessionState {
        SessionState::new(Symbol::new("BTCUSDT"), Money::from_f64(100.0), Vec::new())
    }

    fn request(price: f64, qty: f64) -> OrderRequest {
        OrderRequest::new(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Money::from_f64(price),
            Money::from_f64(qty),
            0,
        )
    }

    #[test]
    fn test_allow_within_limits() {
        let audit = Arc::new(MemoryAudit::new());
        let mut governor = RiskGovernor::new(&limits(), audit);
        let state = empty_state();

        let decision = governor.authorize(&request(95.0, 1.0), &state, Utc::now());
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn test_capital_cap_includes_proposed_notional() {
        let audit = Arc::new(MemoryAudit::new());
        let mut governor = RiskGovernor::new(&limits(), audit.clone());
        let state = empty_state();

        // 95 * 6 = 570 > 500 cap
        let decision = governor.authorize(&request(95.0, 6.0), &state, Utc::now());
        assert_eq!(decision, Decision::Deny(DenyReason::CapitalExceeded));
        assert_eq!(audit.denials(), 1);
    }

    #[test]
    fn test_rate_limit_trailing_window() {
        let audit = Arc::new(MemoryAudit::new());
        let mut governor = RiskGovernor::new(&limits(), audit);
        let state = empty_state();
        let t0 = Utc::now();

        for i in 0..3 {
            let seq = t0 + Duration::seconds(i);
            assert_eq!(governor.authorize(&request(95.0, 0.1), &state, seq), Decision::Allow);
            governor.note_submission(seq);
        }

        // Fourth inside the window is refused
        assert_eq!(
            governor.authorize(&request(95.0, 0.1), &state, t0 + Duration::seconds(3)),
            Decision::Deny(DenyReason::RateLimited)
        );

        // After the window slides past the early submissions, approved again
        assert_eq!(
            governor.authorize(&request(95.0, 0.1), &state, t0 + Duration::seconds(120)),
            Decision::Allow
        );
    }

    #[test]
    fn test_stop_loss_denies_submissions() {
        let audit = Arc::new(MemoryAudit::new());
        let mut governor = RiskGovernor::new(&limits(), audit);
        let mut state = empty_state();
        state.last_price = Some(Money::from_f64(84.0));

        assert_eq!(
            governor.authorize(&request(95.0, 0.1), &state, Utc::now()),
            Decision::Deny(DenyReason::StopLossTriggered)
        );
    }

    #[test]
    fn test_enforce_stop_loss_halts_and_cancels() {
        let audit = Arc::new(MemoryAudit::new());
        let mut governor = RiskGovernor::new(&limits(), audit.clone());

        let levels = vec![GridLevel {
            price: Money::from_f64(95.0),
            side: Side::Buy,
            quantity: Money::from_f64(1.0),
            status: LevelStatus::Open,
        }];
        let mut state =
            SessionState::new(Symbol::new("BTCUSDT"), Money::from_f64(100.0), levels);

        let req = request(95.0, 1.0);
        let mut record = crate::oms::OrderRecord::from_request(&req, Utc::now());
        record.status = OrderStatus::Acknowledged;
        record.exchange_order_id = Some("ex-1".to_string());
        state.orders.insert(req.client_id, record);

        let commands = governor
            .enforce_stop_loss(Money::from_f64(84.0), &mut state)
            .expect("stop loss must trigger");

        assert!(state.halted);
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            Command::CancelOrder { exchange_order_id } if exchange_order_id == "ex-1"
        ));
        assert!(state
            .levels
            .iter()
            .all(|l| l.status == LevelStatus::Cancelled));
        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::Halt { .. })));

        // Second breach is a no-op
        assert!(governor
            .enforce_stop_loss(Money::from_f64(80.0), &mut state)
            .is_none());
    }

    #[test]
    fn test_zero_stop_price_disables_stop() {
        let audit = Arc::new(MemoryAudit::new());
        let mut governor = RiskGovernor::new(
            &RiskLimits {
                stop_loss_price: 0.0,
                ..limits()
            },
            audit,
        );
        let mut state = empty_state();
        state.last_price = Some(Money::from_f64(1.0));

        assert_eq!(
            governor.authorize(&request(95.0, 0.1), &state, Utc::now()),
            Decision::Allow
        );
        assert!(governor
            .enforce_stop_loss(Money::from_f64(1.0), &mut state)
            .is_none());
    }
}
