//! Historical data loading
//!
//! Loads price history from CSV files into the tick stream the backtest
//! replays. Rows are OHLCV bars; each bar becomes one tick with the close
//! as the last trade and a synthetic bid/ask straddling it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{info, warn};

use crate::types::{PriceTick, Symbol};

/// Half-spread applied around the close when the file carries no quotes
const SYNTHETIC_SPREAD: f64 = 0.0005;

/// Load ticks from an OHLCV CSV file (datetime,open,high,low,close,volume)
pub fn load_csv(path: impl AsRef<Path>, instrument: &Symbol) -> Result<Vec<PriceTick>> {
    let mut reader =
        csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut ticks = Vec::new();
    let mut skipped = 0usize;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let timestamp = parse_datetime(dt_str)
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let close: f64 = record
            .get(4)
            .context("Missing close column")?
            .parse()
            .context("Failed to parse close")?;

        let bid = close * (1.0 - SYNTHETIC_SPREAD);
        let ask = close * (1.0 + SYNTHETIC_SPREAD);

        match PriceTick::new(timestamp, instrument.clone(), bid, ask, close) {
            Ok(tick) => ticks.push(tick),
            Err(err) => {
                warn!(row = row_idx + 1, %err, "skipping malformed row");
                skipped += 1;
            }
        }
    }

    if ticks.is_empty() {
        anyhow::bail!("No usable rows in {}", path.as_ref().display());
    }
    if skipped > 0 {
        warn!(skipped, "rows dropped during load");
    }
    info!(
        "Loaded {} ticks for {} from {}",
        ticks.len(),
        instrument,
        path.as_ref().display()
    );

    Ok(ticks)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // No timezone in the file, assume UTC
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .map_err(Into::into)
}

/// Check a loaded series before replay
pub fn validate_ticks(ticks: &[PriceTick]) -> Vec<String> {
    let mut warnings = Vec::new();
    for (i, tick) in ticks.iter().enumerate() {
        if i > 0 && tick.timestamp <= ticks[i - 1].timestamp {
            warnings.push(format!("tick {}: not chronological", i));
        }
    }
    warnings
}
