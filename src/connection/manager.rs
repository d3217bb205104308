//! Connection manager
//!
//! Owns the market-data and order connections for the process lifetime,
//! brokers the order-manager reference, and drives connect/disconnect for
//! both sessions.

use std::sync::{Arc, Mutex};

use log::info;

use crate::auth::JwtSigner;
use crate::book::OrderBook;
use crate::config::{OrderTransport, SessionConfig};
use crate::connection::market_data::MarketDataConnection;
use crate::connection::order::OrderConnection;
use crate::connection::order_rest::RestOrderConnection;
use crate::connection::order_ws::WsOrderConnection;
use crate::errors::Result;
use crate::instruments::{DashedSymbols, SymbolTable};
use crate::orders::OrderManager;

pub struct ConnectionManager {
    market_data: Arc<MarketDataConnection>,
    orders: Arc<dyn OrderConnection>,
    order_manager: Mutex<Option<Arc<OrderManager>>>,
}

impl ConnectionManager {
    /// Build both connections from session settings. The order-entry
    /// variant is chosen by `session.order_transport`.
    pub fn new(settings: &SessionConfig, book: Arc<OrderBook>) -> Result<Arc<Self>> {
        let signer = Arc::new(JwtSigner::new(&settings.apikey, &settings.secretkey)?);
        let symbols: Arc<dyn SymbolTable> = Arc::new(DashedSymbols);

        let market_data =
            MarketDataConnection::new(settings.clone(), signer.clone(), symbols.clone(), book);

        let orders: Arc<dyn OrderConnection> = match settings.order_transport {
            OrderTransport::Ws => WsOrderConnection::new(settings.clone(), signer, symbols),
            OrderTransport::Rest => RestOrderConnection::new(settings, signer, symbols)?,
        };

        Ok(Arc::new(Self {
            market_data,
            orders,
            order_manager: Mutex::new(None),
        }))
    }

    /// Open both sessions and subscribe. Blocks until both are open and
    /// subscribed; the first failure is surfaced. On the push transport
    /// this also waits for the initial user snapshot.
    pub async fn connect(&self) -> Result<()> {
        self.market_data.connect().await?;
        self.orders.connect().await?;
        self.orders.await_ready().await;
        info!("Connections established");
        Ok(())
    }

    /// Close both sessions and join their listeners
    pub async fn disconnect(&self) {
        self.orders.disconnect().await;
        self.market_data.disconnect().await;
        info!("Connections closed");
    }

    pub fn market_data_connection(&self) -> &Arc<MarketDataConnection> {
        &self.market_data
    }

    pub fn order_connection(&self) -> &Arc<dyn OrderConnection> {
        &self.orders
    }

    pub fn order_manager(&self) -> Option<Arc<OrderManager>> {
        self.order_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Install the order-manager reference consumed by the order
    /// connection's push callbacks. Must run after both connections are
    /// constructed and before the grid engine starts.
    pub fn set_order_manager(&self, order_manager: &Arc<OrderManager>) {
        *self
            .order_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(order_manager.clone());
        self.orders.set_order_manager(Arc::downgrade(order_manager));
    }
}
