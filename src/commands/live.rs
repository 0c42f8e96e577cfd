//! Live command implementation
//!
//! Paper mode wraps the REST client so orders stay local while market data
//! is real. Everything else is identical between the two modes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use grid_trader::audit::{AuditSink, SqliteAudit};
use grid_trader::exchange::{ExchangeClient, PaperClient, RestClient};
use grid_trader::feed::{FeedAdapter, MarketEvent};
use grid_trader::{GridEngine, SessionConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Log a session report every this many poll cycles
const REPORT_EVERY: u64 = 60;

pub fn run(config_path: String, live: bool, interval_override: Option<u64>) -> Result<()> {
    let mut config = SessionConfig::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(interval) = interval_override {
        config.exchange.poll_interval_secs = interval;
    }

    if live {
        anyhow::ensure!(
            config.exchange.api_key.is_some() && config.exchange.api_secret.is_some(),
            "live trading requires exchange credentials"
        );
        warn!("LIVE trading enabled, real orders will be placed");
    } else {
        info!("Paper trading mode, orders stay local");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let rest = RestClient::new(
            config.exchange.api_key.clone().unwrap_or_default(),
            config.exchange.api_secret.clone().unwrap_or_default(),
        );
        if live {
            run_session(rest, config).await
        } else {
            run_session(PaperClient::new(rest), config).await
        }
    })
}

async fn run_session<C: ExchangeClient>(client: C, config: SessionConfig) -> Result<()> {
    let sqlite = Arc::new(SqliteAudit::open(&config.audit_dir)?);
    let audit: Arc<dyn AuditSink> = sqlite.clone();

    let instrument = config.grid.symbol();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut adapter = FeedAdapter::new(client, instrument.clone(), events_tx);

    let poll_interval = Duration::from_secs(config.exchange.poll_interval_secs);
    let mut engine: Option<GridEngine> = None;
    let mut cycles = 0u64;

    // Installed once so a signal during the poll phase is not lost
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(instrument = %instrument, interval_secs = poll_interval.as_secs(), "session starting");

    loop {
        adapter.poll().await;

        let mut commands = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            let now = Utc::now();
            if let Some(engine) = engine.as_mut() {
                commands.extend(engine.handle_event(event, now));
            } else if let MarketEvent::Tick(tick) = &event {
                // The first tick supplies the reference price
                let mut fresh = GridEngine::new(&config, tick.last, audit.clone())?;
                commands.extend(fresh.seed(now));
                engine = Some(fresh);
            }
        }
        adapter.execute(commands).await;

        if let Some(engine) = &engine {
            if engine.is_halted() {
                warn!("session halted, shutting down");
                engine.state().report().log();
                break;
            }
            cycles += 1;
            if cycles % REPORT_EVERY == 0 {
                engine.state().report().log();
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                if let Some(engine) = &mut engine {
                    let cancels = engine.stop();
                    adapter.execute(cancels).await;
                    engine.state().report().log();
                }
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    sqlite.export_json()?;
    info!("session closed");
    Ok(())
}
