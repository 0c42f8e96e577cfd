//! Plan command implementation

use anyhow::Result;
use grid_trader::planner;
use grid_trader::types::Money;
use grid_trader::SessionConfig;
use tracing::info;

pub fn run(config_path: String, reference: f64) -> Result<()> {
    let config = SessionConfig::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let levels = planner::plan(&config.grid, Money::from_f64(reference))?;

    println!("\n{}", "=".repeat(60));
    println!(
        "  GRID PLAN: {} around {}",
        config.grid.instrument, reference
    );
    println!("{}", "=".repeat(60));
    println!("  {:>4}  {:>5}  {:>14}  {:>14}  {:>12}", "rung", "side", "price", "quantity", "notional");
    for (index, level) in levels.iter().enumerate() {
        println!(
            "  {:>4}  {:>5}  {:>14}  {:>14}  {:>12}",
            index,
            level.side,
            level.price,
            level.quantity,
            (level.price * level.quantity).round_dp(2)
        );
    }
    println!("{}", "=".repeat(60));

    Ok(())
}
