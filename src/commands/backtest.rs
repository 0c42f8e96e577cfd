//! Backtest command implementation

use std::sync::Arc;

use anyhow::Result;
use grid_trader::audit::MemoryAudit;
use grid_trader::backtest::Backtester;
use grid_trader::{data, SessionConfig};
use tracing::{info, warn};

pub fn run(config_path: String, data_path: String) -> Result<()> {
    info!("Starting backtest");

    let config = SessionConfig::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let instrument = config.grid.symbol();
    let ticks = data::load_csv(&data_path, &instrument)?;
    for warning in data::validate_ticks(&ticks) {
        warn!("{}", warning);
    }

    let backtester = Backtester::new(config, Arc::new(MemoryAudit::new()));
    let report = backtester.run(&ticks)?;
    report.print();

    Ok(())
}
