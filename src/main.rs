//! Grid trader - main entry point
//!
//! This binary provides three subcommands:
//! - plan: Print the ladder a configuration would produce
//! - backtest: Replay historical data through the grid engine
//! - live: Run a trading session (paper by default)

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "grid-trader")]
#[command(about = "Automated grid trading with backtesting and paper trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the ladder a configuration would produce
    Plan {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/session.json")]
        config: String,

        /// Reference price to plan around
        #[arg(short, long)]
        reference: f64,
    },

    /// Replay historical data through the grid engine
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/session.json")]
        config: String,

        /// Path to OHLCV CSV file
        #[arg(short, long)]
        data: String,
    },

    /// Run a trading session
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/session.json")]
        config: String,

        /// Send real orders to the exchange (paper trading otherwise)
        #[arg(long)]
        live: bool,

        /// Poll interval override in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Plan { .. } => "plan",
        Commands::Backtest { .. } => "backtest",
        Commands::Live { .. } => "live",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Plan { config, reference } => commands::plan::run(config, reference),

        Commands::Backtest { config, data } => commands::backtest::run(config, data),

        Commands::Live {
            config,
            live,
            interval,
        } => commands::live::run(config, live, interval),
    }
}
