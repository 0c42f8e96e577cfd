//! Grid planner
//!
//! Computes the ladder of buy/sell price levels from a `GridConfig` and the
//! current reference price. Pure function over its inputs so backtests and
//! live sessions derive identical ladders.

use serde::{Deserialize, Serialize};

use crate::config::{GridConfig, Spacing};
use crate::types::{Money, SessionError, Side};

/// Lifecycle state of one rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    /// No live order at this rung
    Pending,
    /// Order submitted or working at the exchange
    Open,
    /// Order filled; rung awaiting re-arm or terminal
    Filled,
    /// Rung retired; capital returned to the pool
    Cancelled,
}

/// One rung of the ladder. Owned exclusively by the order state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: Money,
    pub side: Side,
    pub quantity: Money,
    pub status: LevelStatus,
}

/// Compute the ladder for a validated config and reference price.
///
/// Rungs span [lower_bound, upper_bound] inclusive with either a constant
/// step (arithmetic) or a constant ratio (geometric). Rungs strictly below
/// the reference are seeded as buys, rungs strictly above as sells. A rung
/// equal to the reference is seeded as a sell; the state machine withholds
/// it from initial submission and it is first armed by the re-arm path.
///
/// Per-rung quantity is (capital_allocation / level_count) / rung price.
pub fn plan(config: &GridConfig, reference_price: Money) -> Result<Vec<GridLevel>, SessionError> {
    config.validate()?;

    let lower = Money::from_f64(config.lower_bound);
    let upper = Money::from_f64(config.upper_bound);
    if reference_price <= lower || reference_price >= upper {
        return Err(SessionError::InvalidConfiguration(format!(
            "reference price {} must lie strictly inside ({}, {})",
            reference_price, lower, upper
        )));
    }

    let prices = rung_prices(config);
    if prices.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(SessionError::InvalidConfiguration(format!(
            "grid step over [{}, {}] with {} levels quantizes below price resolution",
            config.lower_bound, config.upper_bound, config.level_count
        )));
    }
    let notional_per_rung = config.capital_allocation / config.level_count as f64;

    let levels = prices
        .into_iter()
        .map(|price| {
            let side = if price < reference_price {
                Side::Buy
            } else {
                Side::Sell
            };
            GridLevel {
                price,
                side,
                quantity: Money::from_f64(notional_per_rung) / price,
                status: LevelStatus::Pending,
            }
        })
        .collect();

    Ok(levels)
}

fn rung_prices(config: &GridConfig) -> Vec<Money> {
    let n = config.level_count;
    let steps = (n - 1) as f64;

    (0..n)
        .map(|i| {
            let price = match config.spacing {
                Spacing::Arithmetic => {
                    let step = (config.upper_bound - config.lower_bound) / steps;
                    config.lower_bound + step * i as f64
                }
                Spacing::Geometric => {
                    let ratio = (config.upper_bound / config.lower_bound).powf(1.0 / steps);
                    config.lower_bound * ratio.powi(i as i32)
                }
            };
            // Quantize so equal rungs compare equal across spacing math
            Money::from_f64(price).round_dp(8)
        })
        .collect()
}
