//! trailstop - main entry point
//!
//! Two subcommands:
//! - run: start the trading runtime (reconcile, trade ingestion, watchdog)
//! - migrate: apply or roll back schema migrations on the state database
//!
//! The market-data transport is external: `run` consumes `PRODUCT-ID price`
//! lines on stdin, one trade per line, so any feed can be piped in.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trailstop::config::Config;
use trailstop::engine::ExecutionEngine;
use trailstop::portfolio::{MultiPairOrchestrator, PairConfig, PortfolioConfig};
use trailstop::rate_limit::RateLimitGovernor;
use trailstop::runtime::{self, RuntimeConfig, TradeTick};
use trailstop::store::{migrations, SqliteStore};
use trailstop::types::ProductId;
use trailstop::venue::{CoinbaseClient, Credentials, VenueAdapter};

#[derive(Parser, Debug)]
#[command(name = "trailstop")]
#[command(about = "Spot trading engine with ratcheting trailing stops", long_about = None)]
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
    /// Run the trading engine, ingesting trade prices from stdin
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Override the state database path from the config
        #[arg(long)]
        state_db: Option<String>,
    },

    /// Apply or roll back state database migrations
    Migrate {
        /// State database path
        #[arg(long, default_value = "state.db")]
        db: String,

        /// Roll back the most recently applied migration instead of applying
        #[arg(long)]
        rollback: bool,
    },
}

/// Crates whose info-level chatter would drown the order-lifecycle log lines.
const QUIET_DEPS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs").context("Failed to create logs directory")?;

    // RUST_LOG wins outright; otherwise default to info (debug with -v) and
    // cap the HTTP stack at warn so stop replacements stay readable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let base = if verbose { "debug" } else { "info" };
        QUIET_DEPS.iter().fold(EnvFilter::new(base), |filter, dep| {
            filter.add_directive(
                format!("{dep}=warn")
                    .parse()
                    .expect("static directive is valid"),
            )
        })
    });

    // one dated file per command per day; audits read back through rotations
    let log_file = format!("trailstop-{command_name}.log");
    let file_appender = tracing_appender::rolling::daily("logs", &log_file);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false),
        )
        .init();

    info!("Logging to logs/{log_file} (daily rotation)");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Migrate { .. } => "migrate",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run { config, state_db } => run(config, state_db),
        Commands::Migrate { db, rollback } => migrate(db, rollback),
    }
}

fn migrate(db: String, rollback: bool) -> Result<()> {
    let mut conn = rusqlite::Connection::open(&db)
        .with_context(|| format!("Failed to open database {db}"))?;

    if rollback {
        match migrations::rollback_last(&mut conn)? {
            Some(version) => info!("Rolled back migration {version}"),
            None => info!("Nothing to roll back"),
        }
    } else {
        let applied = migrations::apply_migrations(&mut conn)?;
        if applied.is_empty() {
            info!("Schema already up to date");
        } else {
            info!("Applied migrations: {applied:?}");
        }
    }

    let versions = migrations::applied_versions(&conn)?;
    info!("Current schema versions: {versions:?}");
    Ok(())
}

fn run(config_path: String, state_db: Option<String>) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, state_db))
}

async fn run_async(config_path: String, state_db: Option<String>) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let credentials = Credentials::load(None).context("Refusing to start without credentials")?;
    let governor = RateLimitGovernor::with_rates(
        config.rate_limit.orders_per_second,
        config.rate_limit.default_per_second,
    );
    // an invalid signing secret is fatal here, before any state is touched
    let client = CoinbaseClient::new(credentials, config.exchange.client_config(), governor)
        .context("Refusing to start with an unusable signing secret")?;
    let adapter: Arc<dyn VenueAdapter> = Arc::new(client);

    if config.persistence.encryption_password.is_some() {
        warn!(
            "persistence.encryption_password is set; at-rest encryption must be \
             provided by the linked SQLite build"
        );
    }
    let db_path = state_db.unwrap_or_else(|| config.persistence.db_path.clone());
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open state database {db_path}"))?;

    let orchestrator = match &config.portfolio {
        Some(portfolio) => {
            let mut orchestrator = MultiPairOrchestrator::new(portfolio.limits.clone());
            for pair in &portfolio.pairs {
                if !pair.enabled {
                    continue;
                }
                let params = config.strategy.engine_params(Some(pair.trail_pct));
                let engine = Arc::new(ExecutionEngine::new(
                    ProductId::new(pair.product_id.clone()),
                    Arc::clone(&adapter),
                    store.clone(),
                    params,
                ));
                orchestrator.register_pair(pair.clone(), engine).await?;
            }
            orchestrator
        }
        None => {
            let mut orchestrator = MultiPairOrchestrator::new(PortfolioConfig::default());
            let product_id = config.exchange.product_id.clone();
            let pair = PairConfig {
                product_id: product_id.clone(),
                enabled: true,
                position_size_pct: rust_decimal_macros::dec!(5),
                trail_pct: config.strategy.trail_pct,
                correlation_group: None,
            };
            let engine = Arc::new(ExecutionEngine::new(
                ProductId::new(product_id),
                Arc::clone(&adapter),
                store.clone(),
                config.strategy.engine_params(None),
            ));
            orchestrator.register_pair(pair, engine).await?;
            orchestrator
        }
    };

    info!("Trading pairs: {}", orchestrator.product_ids().join(", "));
    let orchestrator = Arc::new(orchestrator);

    let (shutdown_tx, shutdown_rx) = runtime::shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Error setting up signal handler: {e}"),
        }
    });

    let (trade_tx, trade_rx) = tokio::sync::mpsc::channel::<TradeTick>(256);
    tokio::spawn(stdin_trade_source(trade_tx));

    runtime::run_loops(
        Arc::clone(&orchestrator),
        trade_rx,
        shutdown_rx,
        RuntimeConfig::default(),
    )
    .await?;

    let status = orchestrator.portfolio_status().await;
    info!(
        "Session ended | active_positions={} total_pnl={}",
        status.metrics.active_positions, status.metrics.total_pnl
    );
    Ok(())
}

/// Read `PRODUCT-ID price` lines from stdin and forward them as trade ticks.
async fn stdin_trade_source(trade_tx: tokio::sync::mpsc::Sender<TradeTick>) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(product_id), Some(price_str)) = (parts.next(), parts.next()) else {
            warn!("Ignoring malformed trade line: {line}");
            continue;
        };
        let Ok(price) = price_str.parse::<Decimal>() else {
            warn!("Ignoring unparseable price: {line}");
            continue;
        };
        if trade_tx
            .send(TradeTick {
                product_id: product_id.to_string(),
                price,
            })
            .await
            .is_err()
        {
            break;
        }
    }
}
