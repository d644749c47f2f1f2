use anyhow::Context;
use clap::Parser;
use fxtrader::api::OandaClient;
use fxtrader::config::{Credentials, Overrides, StrategyConfig, TraderConfig};
use fxtrader::execution::run_session;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-instrument FX trader for the OANDA v20 API")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instrument to trade, e.g. EUR_USD
    #[arg(short, long)]
    instrument: Option<String>,

    /// Base position size in units
    #[arg(short, long)]
    units: Option<u64>,

    /// Trade against the live environment instead of practice
    #[arg(long)]
    live: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let overrides = Overrides {
        instrument: args.instrument,
        units: args.units,
        live: args.live,
    };

    let config = TraderConfig::load(args.config.as_deref(), &overrides)
        .context("Failed to load configuration")?;
    let credentials = Credentials::from_env()?;

    tracing::info!("🚀 FX trader starting");
    log_configuration(&config);

    // Load the model (if any) before touching the network
    let strategy = config
        .strategy
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build strategy: {}", e))?;
    let settings = config.session_settings()?;

    let client = OandaClient::new(&config, &credentials).context("Failed to create OANDA client")?;

    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Checked between stream events only; an open position stays with the broker
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
    };

    match run_session(&client, client.clone(), strategy, &settings, shutdown).await {
        Ok(summary) => tracing::info!(
            "Session ended after {} ticks and {} decisions",
            summary.ticks,
            summary.decisions
        ),
        Err(e) => {
            tracing::error!("Session failed: {:#}", e);
            return Err(e);
        }
    }

    tracing::info!("👋 FX trader stopped");
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fxtrader=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_configuration(config: &TraderConfig) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Instrument: {}", config.instrument);
    tracing::info!("  Environment: {:?}", config.broker.environment);
    tracing::info!("  Bar length: {} min", config.bar_length_minutes);
    tracing::info!("  Units: {}", config.units);
    tracing::info!(
        "  History: {} days of {} candles",
        config.history_days,
        config.history_granularity
    );
    tracing::info!(
        "  Take profit: {} | Stop loss: {} | Tighten stop above PL {}",
        config.risk.take_profit_distance,
        config.risk.stop_loss_distance,
        config.risk.stop_tighten_threshold
    );
    match &config.strategy {
        StrategyConfig::Bollinger(cfg) => tracing::info!(
            "  Strategy: Bollinger (SMA {}, width {})",
            cfg.sma_window,
            cfg.band_width
        ),
        StrategyConfig::Probability(cfg) => tracing::info!(
            "  Strategy: Probability (window {}, lags {}, long > {}, short < {}, model {})",
            cfg.window,
            cfg.lags,
            cfg.long_threshold,
            cfg.short_threshold,
            cfg.model_path.display()
        ),
    }
}
