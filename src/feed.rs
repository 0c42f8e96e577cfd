//! Market feed adapter
//!
//! Normalizes exchange payloads into the internal event stream and executes
//! the state machine's commands against the exchange. Events cross an
//! unbounded tokio mpsc channel to the session loop, preserving arrival
//! order; the session loop both fills and drains the channel, so a send
//! must never block.
//!
//! Fill forwarding is at-most-once: each exchange fill id is delivered to
//! the state machine exactly once no matter how many times the exchange
//! reports it.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::exchange::{ExchangeClient, RawFill, RawTicker};
use crate::oms::Command;
use crate::types::{Money, PriceTick, SessionError, Symbol};

/// Deduplicated fill notification
#[derive(Debug, Clone)]
pub struct FillNotice {
    pub exchange_order_id: String,
    pub fill_id: String,
    pub price: Money,
    pub quantity: Money,
    pub timestamp: DateTime<Utc>,
}

/// Normalized event stream consumed by the order state machine
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Tick(PriceTick),
    Fill(FillNotice),
    Acknowledged {
        client_id: u64,
        exchange_order_id: String,
    },
    Rejected {
        client_id: u64,
        reason: String,
    },
    ConnectivityLost,
    Reconnected,
}

/// Sole boundary between the engine and the live exchange
pub struct FeedAdapter<C: ExchangeClient> {
    client: C,
    instrument: Symbol,
    events: mpsc::UnboundedSender<MarketEvent>,
    seen_fill_ids: HashSet<String>,
    connected: bool,
}

impl<C: ExchangeClient> FeedAdapter<C> {
    pub fn new(client: C, instrument: Symbol, events: mpsc::UnboundedSender<MarketEvent>) -> Self {
        Self {
            client,
            instrument,
            events,
            seen_fill_ids: HashSet::new(),
            connected: true,
        }
    }

    /// One polling cycle: ticker then fills. Transport failures emit a
    /// single `ConnectivityLost`; the first subsequent success emits
    /// `Reconnected` before any data events.
    pub async fn poll(&mut self) {
        match self.client.fetch_ticker(&self.instrument).await {
            Ok(raw) => {
                self.note_success();
                match normalize_ticker(&self.instrument, &raw) {
                    Ok(tick) => self.emit(MarketEvent::Tick(tick)),
                    Err(e) => warn!("Discarding malformed ticker: {}", e),
                }
            }
            Err(e) => {
                self.note_failure(&e);
                return;
            }
        }

        match self.client.fetch_fills(&self.instrument).await {
            Ok(raw_fills) => {
                for raw in raw_fills {
                    if let Some(notice) = self.accept_fill(raw) {
                        self.emit(MarketEvent::Fill(notice));
                    }
                }
            }
            Err(e) => self.note_failure(&e),
        }
    }

    /// Execute state-machine commands. Placement outcomes come back as
    /// events, never as return values; the engine stays fire-and-acknowledge.
    pub async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::PlaceOrder(request) => {
                    let client_id = request.client_id;
                    match self.client.place_order(&request).await {
                        Ok(ack) => {
                            self.note_success();
                            self.emit(MarketEvent::Acknowledged {
                                client_id,
                                exchange_order_id: ack.id,
                            });
                        }
                        Err(SessionError::OrderRejected { reason, .. }) => {
                            self.emit(MarketEvent::Rejected { client_id, reason });
                        }
                        Err(e) => self.note_failure(&e),
                    }
                }
                Command::CancelOrder { exchange_order_id } => {
                    match self.client.cancel_order(&exchange_order_id).await {
                        Ok(()) => self.note_success(),
                        Err(e @ SessionError::ExchangeConnectivityLoss(_)) => {
                            self.note_failure(&e);
                        }
                        Err(e) => {
                            // Cancellation of an already-dead order is a no-op
                            warn!("Cancel of {} failed: {}", exchange_order_id, e);
                        }
                    }
                }
            }
        }
    }

    /// At-most-once gate keyed by exchange fill id
    fn accept_fill(&mut self, raw: RawFill) -> Option<FillNotice> {
        if !self.seen_fill_ids.insert(raw.fill_id.clone()) {
            debug!("Dropping duplicate fill {}", raw.fill_id);
            return None;
        }
        Some(FillNotice {
            exchange_order_id: raw.order_id,
            fill_id: raw.fill_id,
            price: Money::from_f64(raw.price),
            quantity: Money::from_f64(raw.quantity),
            timestamp: raw.timestamp,
        })
    }

    fn note_failure(&mut self, error: &SessionError) {
        warn!("Exchange request failed: {}", error);
        if self.connected {
            self.connected = false;
            self.emit(MarketEvent::ConnectivityLost);
        }
    }

    fn note_success(&mut self) {
        if !self.connected {
            self.connected = true;
            self.emit(MarketEvent::Reconnected);
        }
    }

    fn emit(&self, event: MarketEvent) {
        if self.events.send(event).is_err() {
            warn!("Event channel closed; session loop has shut down");
        }
    }
}

/// Parse a raw exchange ticker into a validated tick
pub fn normalize_ticker(instrument: &Symbol, raw: &RawTicker) -> Result<PriceTick, SessionError> {
    let parse = |field: &str, value: &str| -> Result<f64, SessionError> {
        value.parse::<f64>().map_err(|_| {
            SessionError::MalformedPayload(format!(
                "unparseable {} in ticker: {:?}",
                field, value
            ))
        })
    };

    let bid = parse("bid", &raw.bid)?;
    let ask = parse("ask", &raw.ask)?;
    let last = parse("last_price", &raw.last_price)?;
    let timestamp = Utc
        .timestamp_millis_opt(raw.timestamp)
        .single()
        .unwrap_or_else(Utc::now);

    PriceTick::new(timestamp, instrument.clone(), bid, ask, last)
        .map_err(|e| SessionError::MalformedPayload(e.to_string()))
}
