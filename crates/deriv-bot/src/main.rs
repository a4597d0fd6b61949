//! deriv-bot: autonomous trading agent for synthetic volatility indices.
//!
//! Usage:
//!   deriv-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: config/bot.toml)
//!   -s, --symbol <SYMBOL>   Instrument override
//!   --strategy <KIND>       Strategy variant: sma, squeeze
//!
//! Credentials come from the environment: `APP_ID` and `DERIV_TOKEN`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use deriv_bot::config::BotConfig;
use deriv_bot::engine::{EngineEvent, EngineFatal, StrategyEngine};
use deriv_bot::execution::Execution;
use deriv_bot::link::BrokerLink;
use deriv_bot::market::MarketBook;
use deriv_bot::risk::RiskGuardian;
use deriv_common::{MemorySink, NoopBroadcast};

/// CLI arguments for deriv-bot.
#[derive(Parser, Debug)]
#[command(name = "deriv-bot")]
#[command(about = "Autonomous trading agent for Deriv synthetic volatility indices")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Instrument override (e.g. BOOM500)
    #[arg(short, long)]
    symbol: Option<String>,

    /// Strategy variant: sma, squeeze
    #[arg(long)]
    strategy: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        BotConfig::default()
    };
    config.apply_env_overrides();
    if let Some(symbol) = args.symbol {
        config.broker.symbol = symbol;
    }
    if let Some(strategy) = args.strategy {
        config.trading.strategy = strategy;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    config.validate().context("Configuration validation failed")?;

    info!("Starting deriv-bot");
    info!("Symbol: {}", config.broker.symbol);
    info!("Strategy: {}", config.trading.strategy);

    // One FIFO mailbox serializes every event source into the engine.
    let (mailbox_tx, mut mailbox_rx) = mpsc::channel::<EngineEvent>(4096);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    // Broker link, forwarding its events into the mailbox.
    let (link_tx, mut link_rx) = mpsc::channel(4096);
    let link = BrokerLink::spawn(config.link_config(), link_tx, shutdown_tx.subscribe());
    {
        let mailbox = mailbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                if mailbox.send(EngineEvent::Link(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Execution outcomes land on the same mailbox.
    let (exec_tx, mut exec_rx) = mpsc::channel(256);
    {
        let mailbox = mailbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = exec_rx.recv().await {
                if mailbox.send(EngineEvent::Exec(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    let execution = Execution::new(link.clone(), config.execution_config(), exec_tx);
    let book = MarketBook::new(
        config.broker.symbol.clone(),
        config.trading.primary_timeframe,
        config.trading.tick_limit,
    );
    let risk = RiskGuardian::new(&config.risk_settings(), chrono::Utc::now());

    let mut engine = StrategyEngine::new(
        config.engine_config(),
        link,
        book,
        risk,
        execution,
        Arc::new(MemorySink::new()),
        Arc::new(NoopBroadcast),
    );

    // Signal handler requests engine shutdown.
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown().await {
                error!("Shutdown signal handler error: {}", e);
            }
            info!("Requesting shutdown...");
            let _ = shutdown.send(());
        });
    }

    let mut engine_shutdown = shutdown_tx.subscribe();
    match engine.run(&mut mailbox_rx, &mut engine_shutdown).await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(fatal @ (EngineFatal::InvalidToken | EngineFatal::BuyLimitReached)) => {
            warn!("Engine terminated: {fatal}");
            Err(anyhow::anyhow!(fatal))
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["deriv-bot"]).unwrap();
        assert_eq!(args.config.to_str().unwrap(), "config/bot.toml");
        assert!(args.symbol.is_none());
        assert!(args.strategy.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "deriv-bot",
            "-c",
            "/etc/bot.toml",
            "--symbol",
            "CRASH500",
            "--strategy",
            "squeeze",
        ])
        .unwrap();
        assert_eq!(args.config.to_str().unwrap(), "/etc/bot.toml");
        assert_eq!(args.symbol, Some("CRASH500".to_string()));
        assert_eq!(args.strategy, Some("squeeze".to_string()));
    }
}
