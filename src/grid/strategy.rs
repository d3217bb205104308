//! Multi-grid coordinator
//!
//! Fans lifecycle calls out to one `GridBot` per configured (name,
//! instrument) tuple and receives the per-batch tick from the order book.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::Mutex;

use crate::book::TickHandler;
use crate::errors::{Error, Result};
use crate::grid::bot::GridBot;
use crate::grid::config::GridBotConfig;
use crate::orders::OrderManager;

pub struct GridStrategy {
    bots: Mutex<Vec<GridBot>>,
}

impl GridStrategy {
    /// Create a grid bot for each configuration
    pub fn new(order_manager: &Arc<OrderManager>, configs: &[GridBotConfig]) -> Result<Arc<Self>> {
        if configs.is_empty() {
            return Err(Error::InvalidConfig("no grid configurations found".into()));
        }

        info!("Initializing {} grid bots", configs.len());
        let mut bots = Vec::with_capacity(configs.len());
        for cfg in configs {
            bots.push(GridBot::new(cfg.clone(), order_manager.clone())?);
        }

        Ok(Arc::new(Self {
            bots: Mutex::new(bots),
        }))
    }

    /// Load pre-existing open orders into every grid. Run once, after the
    /// exchange snapshot has been applied and before start.
    pub async fn load_existing_orders(&self) {
        info!("Loading existing orders for all grids...");
        let mut bots = self.bots.lock().await;
        for bot in bots.iter_mut() {
            bot.load_existing_orders();
        }
    }

    /// Start every grid. A bot that fails to start is logged and skipped;
    /// the remaining grids keep running.
    pub async fn start(&self) {
        info!("Starting all grid bots...");
        let mut bots = self.bots.lock().await;
        for bot in bots.iter_mut() {
            if let Err(e) = bot.start().await {
                error!("Grid '{}' failed to start: {}", bot.name(), e);
            }
        }
        info!("Grid bots started");
    }

    /// Run the fill-reconciliation pass on every grid
    pub async fn check_filled_orders(&self) {
        let mut bots = self.bots.lock().await;
        for bot in bots.iter_mut() {
            bot.check_filled_orders().await;
        }
    }

    /// Instruments covered by the configured grids
    pub async fn instruments(&self) -> Vec<String> {
        let bots = self.bots.lock().await;
        bots.iter().map(|b| b.instrument().to_string()).collect()
    }

    pub async fn log_status(&self) {
        info!("=== Grid Strategy Status ===");
        let bots = self.bots.lock().await;
        for bot in bots.iter() {
            bot.log_status();
        }
    }
}

#[async_trait]
impl TickHandler for GridStrategy {
    async fn on_tick(&self) {
        self.check_filled_orders().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderBook;
    use crate::connection::order::mock::MockOrderConnection;
    use crate::grid::config::sample_config;
    use crate::instruments::init_test_registry;

    fn order_manager() -> (Arc<OrderManager>, Arc<MockOrderConnection>) {
        init_test_registry();
        let connection = Arc::new(MockOrderConnection::new());
        let om = OrderManager::new(connection.clone(), Arc::new(OrderBook::new()));
        (om, connection)
    }

    #[tokio::test]
    async fn test_empty_config_is_rejected() {
        let (om, _) = order_manager();
        assert!(GridStrategy::new(&om, &[]).is_err());
    }

    #[tokio::test]
    async fn test_fan_out_over_bots() {
        let (om, connection) = order_manager();
        let mut second = sample_config("eth");
        second.instrument = "ETH/USD".to_string();
        second.base_price = 10.0;

        let strategy = GridStrategy::new(&om, &[sample_config("btc"), second]).unwrap();
        let cp = crate::instruments::CurrencyPair::parse("BTC/USD").unwrap();
        om.set_balance(cp.quote().clone(), 1_000_000.0);

        strategy.load_existing_orders().await;
        strategy.start().await;

        // Two grids, four levels each
        assert_eq!(connection.sent_count(), 8);
        assert_eq!(
            strategy.instruments().await,
            vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
        );
    }

    #[tokio::test]
    async fn test_tick_runs_fill_check() {
        let (om, connection) = order_manager();
        let strategy = GridStrategy::new(&om, &[sample_config("btc")]).unwrap();
        let cp = crate::instruments::CurrencyPair::parse("BTC/USD").unwrap();
        om.set_balance(cp.quote().clone(), 1_000_000.0);

        strategy.start().await;
        let placed = connection.sent_count();

        // Fill one grid order, then deliver a tick
        let buy_id = {
            let sent = connection.sent.lock().unwrap();
            sent.iter()
                .find(|o| (o.price - 99.0).abs() < 1e-9)
                .unwrap()
                .order_id
                .clone()
        };
        om.update_order(&buy_id, crate::orders::OrderStatus::Filled, 1.0);

        strategy.on_tick().await;
        assert_eq!(connection.sent_count(), placed + 1);
    }
}
