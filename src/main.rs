//! Spread Hedger - Main Entry Point
//!
//! Runs the hedge engine against OKX (venue A) and Bybit (venue B), or in
//! paper mode against in-memory venues quoting live prices.

use anyhow::{Context, Result};
use clap::Parser;
use spread_hedger::config::Config;
use spread_hedger::exchange::{BybitClient, MockVenue, OkxClient, VenueAdapter};
use spread_hedger::strategy::Runner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Spread Hedger CLI
#[derive(Parser)]
#[command(name = "spread-hedger")]
#[command(version, about = "Cross-venue perpetual spread hedging between OKX and Bybit")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Simulate orders and positions in memory while quoting live prices
    #[arg(long)]
    paper: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Directory for hourly log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_dir, cli.log_json)?;

    info!("Spread Hedger v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "❌ Fatal configuration error");
            return Err(e.into());
        }
    };
    log_config(&config, cli.paper);

    let (venue_a, venue_b) = build_venues(&config, cli.paper)?;

    let mut runner = Runner::new(&config, venue_a, venue_b);
    runner.startup().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("🛑 Shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    runner.run(shutdown_rx).await;

    info!("👋 Spread Hedger shutdown complete");
    Ok(())
}

/// Load, validate and check credentials.
fn load_config(cli: &Cli) -> Result<Config, spread_hedger::error::ConfigError> {
    let config = Config::load(&cli.config)?;
    config.validate()?;
    if !cli.paper {
        config.validate_credentials()?;
    }
    Ok(config)
}

/// Build venue A (OKX) and venue B (Bybit).
///
/// Paper mode wraps the live clients in in-memory venues that only borrow
/// their prices.
fn build_venues(
    config: &Config,
    paper: bool,
) -> Result<(Arc<dyn VenueAdapter>, Arc<dyn VenueAdapter>)> {
    let okx = Arc::new(
        OkxClient::new(&config.okx, config.sim_mode, config.engine.margin_mode)
            .context("Failed to create OKX client")?,
    );
    let bybit = Arc::new(
        BybitClient::new(&config.bybit, config.sim_mode).context("Failed to create Bybit client")?,
    );

    if paper {
        info!("📝 PAPER MODE - orders and positions simulated in memory");
        let venue_a: Arc<dyn VenueAdapter> = Arc::new(MockVenue::with_price_source(okx));
        let venue_b: Arc<dyn VenueAdapter> = Arc::new(MockVenue::with_price_source(bybit));
        return Ok((venue_a, venue_b));
    }

    if config.sim_mode {
        info!("🧪 SIM MODE - OKX demo trading and Bybit testnet");
    } else {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    }

    let venue_a: Arc<dyn VenueAdapter> = okx;
    let venue_b: Arc<dyn VenueAdapter> = bybit;
    Ok((venue_a, venue_b))
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(log_dir: &Path, json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::hourly(log_dir, "spread-hedger.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("spread_hedger=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().with_ansi(false).init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, paper: bool) {
    info!("📋 Configuration:");
    info!(
        paper,
        sim_mode = config.sim_mode,
        tick_ms = config.engine.tick_interval_ms,
        fetch_timeout_ms = config.engine.fetch_timeout_ms,
        drift_correction = config.engine.drift_correction,
        margin_mode = config.engine.margin_mode.as_str(),
        "   Engine"
    );
    for (symbol, pair) in &config.hedge {
        info!(
            %symbol,
            venue_a = %pair.venue_a,
            venue_b = %pair.venue_b,
            open_spread = %pair.open_spread,
            close_spread = %pair.close_spread,
            qty = %pair.qty,
            leverage = config.leverage_for(symbol),
            "   Pair"
        );
    }
}
