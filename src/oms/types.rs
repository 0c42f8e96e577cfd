//! Core order types
//!
//! Order records reference exactly one grid level. The exchange order id is
//! absent until the exchange acknowledges the submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{Money, Side, Symbol};

/// Client-side order id, assigned before submission
pub type ClientOrderId = u64;

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate the next client order id (thread-safe, lock-free)
pub fn next_client_id() -> ClientOrderId {
    CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Exchange-reported lifecycle of one order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Sent to the exchange, not yet acknowledged
    Submitted,
    /// Accepted and working
    Acknowledged,
    /// Completely filled
    Filled,
    /// Refused by the exchange
    Rejected,
    /// Cancelled by halt or explicit stop
    Cancelled,
}

/// Order placement request emitted by the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: ClientOrderId,
    pub instrument: Symbol,
    pub side: Side,
    pub price: Money,
    pub quantity: Money,
    pub level_index: usize,
}

impl OrderRequest {
    pub fn new(
        instrument: Symbol,
        side: Side,
        price: Money,
        quantity: Money,
        level_index: usize,
    ) -> Self {
        Self {
            client_id: next_client_id(),
            instrument,
            side,
            price,
            quantity,
            level_index,
        }
    }

    pub fn notional(&self) -> Money {
        self.price * self.quantity
    }
}

/// Record of one order submitted for a grid level.
///
/// Created by the state machine on submission; mutated only by feed adapter
/// callbacks reporting exchange state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_id: ClientOrderId,
    pub exchange_order_id: Option<String>,
    pub level_index: usize,
    pub side: Side,
    pub price: Money,
    pub quantity: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn from_request(request: &OrderRequest, now: DateTime<Utc>) -> Self {
        Self {
            client_id: request.client_id,
            exchange_order_id: None,
            level_index: request.level_index,
            side: request.side,
            price: request.price,
            quantity: request.quantity,
            status: OrderStatus::Submitted,
            created_at: now,
            updated_at: now,
        }
    }

    /// Notional value (price x quantity) counted against the capital cap
    pub fn notional(&self) -> Money {
        self.price * self.quantity
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Submitted | OrderStatus::Acknowledged)
    }
}

/// Instruction for the feed adapter to execute against the exchange.
///
/// The state machine never performs exchange I/O itself; it emits commands
/// and the adapter delivers the acknowledgment or fill as a later event.
#[derive(Debug, Clone)]
pub enum Command {
    PlaceOrder(OrderRequest),
    CancelOrder { exchange_order_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_generation() {
        let a = next_client_id();
        let b = next_client_id();
        assert!(b > a);
    }

    #[test]
    fn test_record_from_request() {
        let request = OrderRequest::new(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Money::from_f64(95.0),
            Money::from_f64(2.0),
            1,
        );
        let record = OrderRecord::from_request(&request, Utc::now());

        assert_eq!(record.client_id, request.client_id);
        assert_eq!(record.status, OrderStatus::Submitted);
        assert!(record.exchange_order_id.is_none());
        assert!(record.is_open());
        assert_eq!(record.notional().to_f64(), 190.0);
    }

    #[test]
    fn test_terminal_states_not_open() {
        let request = OrderRequest::new(
            Symbol::new("BTCUSDT"),
            Side::Sell,
            Money::from_f64(105.0),
            Money::from_f64(1.0),
            3,
        );
        let mut record = OrderRecord::from_request(&request, Utc::now());
        for status in [OrderStatus::Filled, OrderStatus::Rejected, OrderStatus::Cancelled] {
            record.status = status;
            assert!(!record.is_open());
        }
    }
}
