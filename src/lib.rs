//! Grid Trader
//!
//! An automated grid trading engine: plans a ladder of limit orders around a
//! reference price, re-arms the opposite side as fills arrive, enforces
//! capital and stop-loss limits, and replays historical data through the
//! same engine for backtesting.

pub mod audit;
pub mod backtest;
pub mod config;
pub mod data;
pub mod exchange;
pub mod feed;
pub mod oms;
pub mod planner;
pub mod risk;
pub mod session;
pub mod types;

pub use config::{GridConfig, RetryPolicy, RiskLimits, SessionConfig, Spacing};
pub use oms::GridEngine;
pub use session::{SessionReport, SessionState};
pub use types::*;
