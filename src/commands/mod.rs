//! CLI command implementations

pub mod backtest;
pub mod live;
pub mod plan;
