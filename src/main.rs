use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spot_trader::config::AppConfig;
use spot_trader::db::{
    realized_pnl_by_position, MemoryTradeStore, PostgresTradeStore, TradeStore,
};
use spot_trader::engine::{EngineSettings, TradingEngine};
use spot_trader::exchange::{verify_connectivity, BinanceClient, Exchange};
use spot_trader::execution::{ExitPolicy, Executor, PositionManager};
use spot_trader::notifications::{Notifier, TelegramNotifier};
use spot_trader::risk::RiskManager;
use spot_trader::strategy::MeanReversionStrategy;

/// Mean reversion spot trading bot
#[derive(Parser)]
#[command(name = "spot-trader")]
#[command(about = "Trade Binance spot pairs with an RSI and range mean reversion strategy", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop (default)
    Run,

    /// Show per-symbol trading summary and realized PnL
    Summary {
        /// Number of recent trades to list
        #[arg(short, long, default_value = "10")]
        recent: usize,
    },

    /// List open positions
    Positions,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());

    let config = AppConfig::load().context("Failed to load config")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Summary { recent } => {
            let store = open_store(&config).await;
            print_trading_summary(store.as_ref(), recent).await
        }
        Commands::Positions => {
            let store = open_store(&config).await;
            print_open_positions(store.as_ref()).await
        }
    }
}

fn setup_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(format!("spot_trader={}", level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("spot_trader=info")),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(config: &AppConfig) -> Arc<dyn TradeStore> {
    let Some(database_url) = config.database_url() else {
        tracing::warn!("⚠️  DATABASE_URL not set, trades are kept in memory only");
        return Arc::new(MemoryTradeStore::new());
    };

    match PostgresTradeStore::new(database_url).await {
        Ok(store) => {
            tracing::info!("✓ Postgres persistence enabled");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "⚠️  Postgres unavailable ({}), continuing with in-memory trade store",
                e
            );
            Arc::new(MemoryTradeStore::new())
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    tracing::info!("🚀 Spot trader starting");

    let client = BinanceClient::new(
        config.binance_api_key.clone(),
        config.binance_api_secret.clone(),
        config.binance_base_url.clone(),
    )
    .context("Failed to build Binance client")?;
    let exchange: Arc<dyn Exchange> = Arc::new(client);

    let balances = verify_connectivity(
        exchange.as_ref(),
        config.connect_max_attempts,
        Duration::from_secs(1),
    )
    .await
    .context("Failed to connect to Binance")?;

    for balance in balances.iter().filter(|b| b.free > 0.0 || b.locked > 0.0) {
        tracing::info!(
            "Balance {}: Free {:.8}, Locked {:.8}",
            balance.asset,
            balance.free,
            balance.locked
        );
    }

    let store = open_store(&config).await;

    let telegram = TelegramNotifier::new(
        config.telegram_token.clone(),
        config.telegram_chat_id.clone(),
    );
    if !telegram.is_enabled() {
        tracing::info!("Telegram notifications disabled (token or chat id not set)");
    }
    let notifier: Arc<dyn Notifier> = Arc::new(telegram);

    let settings = EngineSettings::from(&config);

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Initial Investment: ${:.2}", config.initial_investment);
    tracing::info!("  Max Drawdown: {}%", config.max_drawdown * 100.0);
    tracing::info!("  Risk Per Trade: {}%", config.risk_per_trade * 100.0);
    tracing::info!("  Min Order Size: {:.2} {}", config.min_order_size, config.quote_asset);
    tracing::info!("  Poll Interval: {:?}", settings.poll_interval);
    tracing::info!("  Pairs: {}", settings.pairs.join(", "));

    let mut engine = TradingEngine::new(
        exchange.clone(),
        Executor::new(exchange, config.executor_config()),
        PositionManager::new(store.clone(), config.fee_rate, ExitPolicy::default()),
        Box::new(MeanReversionStrategy::default()),
        RiskManager::new(config.initial_investment, config.risk_limits()),
        notifier,
        settings,
    );

    tracing::info!("\nPress Ctrl+C to stop...\n");

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        })
        .await;

    print_trading_summary(store.as_ref(), 0).await?;

    tracing::info!("👋 Spot trader stopped");
    Ok(())
}

async fn print_trading_summary(store: &dyn TradeStore, recent: usize) -> Result<()> {
    let summaries = store
        .trading_summary()
        .await
        .context("Failed to get trading summary")?;

    tracing::info!("=== Trading Summary ===");
    if summaries.is_empty() {
        tracing::info!("No trades recorded");
    }

    let mut total_pnl = 0.0;
    for s in &summaries {
        total_pnl += s.total_pnl;
        tracing::info!(
            "{}: {} trades ({} won, {} lost) | P&L ${:.4} | avg {:.2}% | volume ${:.2} | {} → {}",
            s.symbol,
            s.total_trades,
            s.winning_trades,
            s.losing_trades,
            s.total_pnl,
            s.avg_pnl_percent,
            s.total_volume,
            s.first_trade.format("%Y-%m-%d %H:%M"),
            s.last_trade.format("%Y-%m-%d %H:%M")
        );
    }
    tracing::info!("Total P&L: ${:.2}", total_pnl);

    if recent > 0 {
        let trades = store.get_all_trades().await.context("Failed to load trades")?;

        let realized = realized_pnl_by_position(&trades);
        tracing::info!("Closed positions: {}", realized.len());
        for (position_id, pnl) in &realized {
            tracing::info!("  {} realized ${:.4}", position_id, pnl);
        }

        let recent_trades = store
            .get_recent_trades(recent)
            .await
            .context("Failed to load recent trades")?;

        tracing::info!("=== Recent Trades ===");
        for trade in &recent_trades {
            tracing::info!(
                "{} {} {} {:.8} @ {:.2} [{}] PnL ${:.4} ({:.2}%)",
                trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
                trade.symbol,
                trade.side,
                trade.quantity,
                trade.price,
                trade.status,
                trade.pnl,
                trade.pnl_percent
            );
        }
    }

    Ok(())
}

async fn print_open_positions(store: &dyn TradeStore) -> Result<()> {
    let open = store
        .get_open_positions()
        .await
        .context("Failed to load open positions")?;

    tracing::info!("=== Open Positions ({}) ===", open.len());
    for trade in open.iter().filter(|t| t.side == spot_trader::TradeSide::Buy) {
        tracing::info!(
            "{} {} {:.8} @ {:.2} (value ${:.2}, opened {})",
            trade.position_id,
            trade.symbol,
            trade.quantity,
            trade.price,
            trade.value,
            trade.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}
