//! Spot grid bot process entry
//!
//! Usage: `spotgrid <config-file> [log-filter-file]`
//!
//! The optional second argument names a file containing an env_logger
//! filter string (e.g. "info,spotgrid=debug"); `RUST_LOG` overrides both it
//! and the configured log level.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};

use spotgrid::{
    init_currency_registry, ConnectionManager, GridStrategy, OrderBook, OrderManager, Settings,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(config_path) = args.get(1) else {
        eprintln!("usage: spotgrid <config-file> [log-filter-file]");
        return ExitCode::from(2);
    };

    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from {}", path.display()),
        Err(_) => {}
    }

    let settings = match Settings::load(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load config '{config_path}': {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = args
        .get(2)
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| settings.log.level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(settings).await {
        error!("Unrecoverable startup failure: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(settings: Settings) -> spotgrid::Result<()> {
    // The registry must exist before the first CurrencyPair is built
    init_currency_registry(settings.currencies())?;

    let book = Arc::new(OrderBook::new());

    let connection_manager = ConnectionManager::new(&settings.session, book.clone())?;
    let order_manager =
        OrderManager::new(connection_manager.order_connection().clone(), book.clone());
    connection_manager.set_order_manager(&order_manager);

    let strategy = GridStrategy::new(&order_manager, &settings.grid_configs())?;
    book.bind_tick(strategy.clone());

    // Connect market data and the order path; on the push transport this
    // also waits for the user snapshot so existing orders can be loaded.
    connection_manager.connect().await?;

    if let Err(e) = order_manager.initialize_balances().await {
        warn!("Failed to initialize balances: {}", e);
    }

    strategy.load_existing_orders().await;
    strategy.start().await;
    strategy.log_status().await;

    info!("SpotGridBot has started - press Ctrl-C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for shutdown signal: {}", e);
    }

    connection_manager.disconnect().await;
    info!("SpotGridBot has stopped successfully");
    Ok(())
}
