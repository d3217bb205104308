//! Order cache and balances: the single source of local truth
//!
//! All reads and writes go through one mutex guarding both the order map
//! and the balance map. Snapshot reads return copies so callers can iterate
//! without holding the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::book::OrderBook;
use crate::connection::order::OrderConnection;
use crate::errors::Result;
use crate::instruments::{registry_initialized, Currency, CurrencyPair, Side};

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// A cached order: immutable identity plus mutable status/filled
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub instrument: CurrencyPair,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub status: OrderStatus,
    pub filled: f64,
}

#[derive(Default)]
struct Cache {
    /// Orders keyed by their primary id (the id handed back to callers)
    orders: HashMap<String, Order>,
    /// Server-id to primary-id aliases, installed when the exchange echoes
    /// a server id for an order placed under a client id
    server_ids: HashMap<String, String>,
    balances: HashMap<Currency, f64>,
}

impl Cache {
    fn resolve<'a>(&'a self, order_id: &'a str) -> &'a str {
        self.server_ids
            .get(order_id)
            .map(String::as_str)
            .unwrap_or(order_id)
    }
}

/// Owns the local order cache and asset balances
pub struct OrderManager {
    cache: Mutex<Cache>,
    connection: Arc<dyn OrderConnection>,
    book: Arc<OrderBook>,
}

impl OrderManager {
    pub fn new(connection: Arc<dyn OrderConnection>, book: Arc<OrderBook>) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(Cache::default()),
            connection,
            book,
        })
    }

    /// Place a GTC limit order. Returns the assigned order id, or an empty
    /// string when the order was not placed.
    pub async fn place_limit_order(
        &self,
        instrument: &CurrencyPair,
        side: Side,
        price: f64,
        qty: f64,
    ) -> String {
        let ack = match self.connection.send_order(instrument, side, price, qty).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Order send failed for {}: {}", instrument, e);
                return String::new();
            }
        };

        if !ack.success || ack.order_id.is_empty() {
            warn!(
                "Order rejected for {}: {}",
                instrument,
                ack.error.unwrap_or_else(|| "no error detail".into())
            );
            return String::new();
        }

        let order = Order {
            order_id: ack.order_id.clone(),
            client_order_id: ack.order_id.clone(),
            instrument: instrument.clone(),
            side,
            price,
            qty,
            status: OrderStatus::New,
            filled: 0.0,
        };

        {
            let mut cache = self.lock();
            cache.orders.insert(ack.order_id.clone(), order);
        }

        info!(
            "Placed order {} {} {} @{} qty={}",
            ack.order_id, instrument, side, price, qty
        );
        ack.order_id
    }

    /// Cancel a live order. Returns false when the id is unknown or the
    /// order is already terminal.
    pub async fn cancel_order(&self, instrument: &CurrencyPair, order_id: &str) -> bool {
        {
            let mut cache = self.lock();
            let primary = cache.resolve(order_id).to_string();
            match cache.orders.get_mut(&primary) {
                Some(order) if !order.status.is_terminal() => {
                    order.status = OrderStatus::Canceled;
                    cache.orders.remove(&primary);
                }
                _ => return false,
            }
        }

        if let Err(e) = self.connection.cancel_order(instrument, order_id).await {
            warn!("Cancel request for {} failed: {}", order_id, e);
        }
        info!("Canceled order {}", order_id);
        true
    }

    /// Current order state. On the request-reply transport this re-queries
    /// the exchange and refreshes the cached status and fill; on the push
    /// transport the cache is already exchange truth.
    pub async fn get_order(&self, instrument: &CurrencyPair, order_id: &str) -> Option<Order> {
        if self.connection.supports_push() {
            warn!("get_order on a push connection; prefer get_order_local");
            return self.get_order_local(order_id);
        }

        match self.connection.query_order(instrument, order_id).await {
            Ok(Some(snapshot)) => {
                let mut cache = self.lock();
                let primary = cache.resolve(order_id).to_string();
                match cache.orders.get_mut(&primary) {
                    Some(order) => {
                        order.status = snapshot.status;
                        order.filled = snapshot.filled;
                        Some(order.clone())
                    }
                    None => {
                        warn!("Queried order {} is not in the local cache", order_id);
                        None
                    }
                }
            }
            Ok(None) => self.get_order_local(order_id),
            Err(e) => {
                warn!("Order query for {} failed: {}", order_id, e);
                self.get_order_local(order_id)
            }
        }
    }

    /// Pure cache read
    pub fn get_order_local(&self, order_id: &str) -> Option<Order> {
        let cache = self.lock();
        let primary = cache.resolve(order_id);
        cache.orders.get(primary).cloned()
    }

    /// Overwrite the mutable fields of an existing order. Unknown ids log a
    /// warning and do nothing.
    pub fn update_order(&self, order_id: &str, status: OrderStatus, filled: f64) {
        let mut cache = self.lock();
        let primary = cache.resolve(order_id).to_string();
        match cache.orders.get_mut(&primary) {
            Some(order) => {
                order.status = status;
                order.filled = filled;
            }
            None => warn!("Update for unknown order {} ignored", order_id),
        }
    }

    /// Upsert from an external source (startup snapshot). Creates the order
    /// when absent; otherwise only status and fill are overwritten, never
    /// identity fields.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_order(
        &self,
        order_id: &str,
        instrument: CurrencyPair,
        side: Side,
        price: f64,
        qty: f64,
        status: OrderStatus,
        filled: f64,
    ) {
        let mut cache = self.lock();
        let primary = cache.resolve(order_id).to_string();
        match cache.orders.get_mut(&primary) {
            Some(order) => {
                order.status = status;
                order.filled = filled;
            }
            None => {
                cache.orders.insert(
                    order_id.to_string(),
                    Order {
                        order_id: order_id.to_string(),
                        client_order_id: order_id.to_string(),
                        instrument,
                        side,
                        price,
                        qty,
                        status,
                        filled,
                    },
                );
                debug!("Synced order {} into cache", order_id);
            }
        }
    }

    /// Record the server id the exchange assigned to an order placed under
    /// a client id. The record is updated in place; the caller-facing key
    /// stays the client id.
    pub fn assign_server_id(&self, client_id: &str, server_id: &str) {
        if client_id == server_id {
            return;
        }
        let mut cache = self.lock();
        if let Some(order) = cache.orders.get_mut(client_id) {
            order.order_id = server_id.to_string();
            cache
                .server_ids
                .insert(server_id.to_string(), client_id.to_string());
            debug!("Order {} rekeyed to server id {}", client_id, server_id);
        }
    }

    /// Full copy of the order cache, taken under the lock
    pub fn get_all_orders(&self) -> HashMap<String, Order> {
        self.lock().orders.clone()
    }

    pub fn get_balance(&self, currency: &Currency) -> f64 {
        *self.lock().balances.get(currency).unwrap_or(&0.0)
    }

    pub fn set_balance(&self, currency: Currency, balance: f64) {
        self.lock().balances.insert(currency, balance);
    }

    /// Pull account balances from the order connection. Unknown currency
    /// codes are skipped with a debug log.
    pub async fn initialize_balances(&self) -> Result<()> {
        if !registry_initialized() {
            return Err(crate::errors::Error::RegistryUninitialized);
        }
        let accounts = self.connection.fetch_balances().await?;

        let mut cache = self.lock();
        for (code, available) in accounts {
            match Currency::new(&code) {
                Ok(currency) => {
                    cache.balances.insert(currency, available);
                }
                Err(_) => debug!("Skipping balance for unknown currency '{}'", code),
            }
        }

        info!("Initialized {} currency balances", cache.balances.len());
        Ok(())
    }

    /// Midpoint of the best bid/ask from the order book, 0 when unknown
    pub fn current_market_price(&self, instrument: &CurrencyPair) -> f64 {
        self.book.mid_price(instrument)
    }

    /// Log the balances of both legs of an instrument
    pub fn log_balances(&self, instrument: &CurrencyPair) {
        let base = self.get_balance(instrument.base());
        let quote = self.get_balance(instrument.quote());
        info!(
            "Balances: {} {} / {} {}",
            instrument.base(),
            base,
            instrument.quote(),
            quote
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::order::mock::MockOrderConnection;
    use crate::instruments::init_test_registry;

    fn setup() -> (Arc<OrderManager>, Arc<MockOrderConnection>, CurrencyPair) {
        init_test_registry();
        let connection = Arc::new(MockOrderConnection::new());
        let book = Arc::new(OrderBook::new());
        let om = OrderManager::new(connection.clone(), book);
        let cp = CurrencyPair::parse("BTC/USD").unwrap();
        (om, connection, cp)
    }

    #[tokio::test]
    async fn test_place_limit_order_caches_new_order() {
        let (om, connection, cp) = setup();

        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;
        assert!(!id.is_empty());
        assert_eq!(connection.sent_count(), 1);

        let order = om.get_order_local(&id).unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.filled, 0.0);
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.price, 99.0);
    }

    #[tokio::test]
    async fn test_place_failure_returns_empty_id() {
        let (om, connection, cp) = setup();
        connection.set_should_fail(true);

        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;
        assert!(id.is_empty());
        assert!(om.get_all_orders().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_order() {
        let (om, connection, cp) = setup();

        let id = om.place_limit_order(&cp, Side::Sell, 101.0, 1.0).await;
        assert!(om.cancel_order(&cp, &id).await);
        assert!(om.get_order_local(&id).is_none());
        assert_eq!(connection.cancelled.lock().unwrap().clone(), vec![id.clone()]);

        // Unknown and already-removed ids are refused
        assert!(!om.cancel_order(&cp, &id).await);
        assert!(!om.cancel_order(&cp, "nope").await);
    }

    #[tokio::test]
    async fn test_cancel_refuses_terminal_order() {
        let (om, _, cp) = setup();

        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;
        om.update_order(&id, OrderStatus::Filled, 1.0);
        assert!(!om.cancel_order(&cp, &id).await);
    }

    #[tokio::test]
    async fn test_update_order_overwrites_mutable_fields() {
        let (om, _, cp) = setup();

        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 2.0).await;
        om.update_order(&id, OrderStatus::PartiallyFilled, 0.5);

        let order = om.get_order_local(&id).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled, 0.5);
        // Identity untouched
        assert_eq!(order.price, 99.0);
        assert_eq!(order.qty, 2.0);

        // Unknown id: no-op
        om.update_order("missing", OrderStatus::Filled, 1.0);
        assert!(om.get_order_local("missing").is_none());
    }

    #[tokio::test]
    async fn test_sync_order_upserts() {
        let (om, _, cp) = setup();

        om.sync_order("srv-1", cp.clone(), Side::Buy, 99.0, 1.0, OrderStatus::New, 0.0);
        assert_eq!(om.get_all_orders().len(), 1);

        // Second sync only touches status/filled
        om.sync_order(
            "srv-1",
            cp.clone(),
            Side::Sell,
            1.0,
            9.0,
            OrderStatus::PartiallyFilled,
            0.4,
        );
        let order = om.get_order_local("srv-1").unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled, 0.4);
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.price, 99.0);
    }

    #[tokio::test]
    async fn test_server_id_rekeying() {
        let (om, _, cp) = setup();

        let client_id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;
        om.assign_server_id(&client_id, "srv-42");

        // Updates arriving under the server id land on the same record
        om.update_order("srv-42", OrderStatus::Filled, 1.0);
        let order = om.get_order_local(&client_id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.order_id, "srv-42");

        // And the record resolves under either id
        assert!(om.get_order_local("srv-42").is_some());
    }

    #[tokio::test]
    async fn test_get_order_refreshes_from_exchange_on_rest() {
        let (om, connection, cp) = setup();
        connection.set_push(false);

        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;
        connection.set_query_result(
            &id,
            crate::connection::order::OrderSnapshot {
                order_id: id.clone(),
                status: OrderStatus::PartiallyFilled,
                filled: 0.6,
            },
        );

        let order = om.get_order(&cp, &id).await.unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled, 0.6);

        // The cached copy was refreshed too
        let cached = om.get_order_local(&id).unwrap();
        assert_eq!(cached.filled, 0.6);
        assert_eq!(connection.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_order_on_push_reads_cache() {
        let (om, connection, cp) = setup();

        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;
        let order = om.get_order(&cp, &id).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        // No exchange round-trip on the push transport
        assert!(connection.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_balances() {
        let (om, connection, cp) = setup();
        connection.set_balances(vec![
            ("BTC".to_string(), 1.5),
            ("USD".to_string(), 1000.0),
            ("XYZ".to_string(), 7.0),
        ]);

        om.initialize_balances().await.unwrap();
        assert_eq!(om.get_balance(cp.base()), 1.5);
        assert_eq!(om.get_balance(cp.quote()), 1000.0);

        om.set_balance(cp.base().clone(), 2.0);
        assert_eq!(om.get_balance(cp.base()), 2.0);
    }

    #[tokio::test]
    async fn test_get_all_orders_is_a_copy() {
        let (om, _, cp) = setup();
        let id = om.place_limit_order(&cp, Side::Buy, 99.0, 1.0).await;

        let mut snapshot = om.get_all_orders();
        snapshot.remove(&id);
        assert!(om.get_order_local(&id).is_some());
    }

    #[tokio::test]
    async fn test_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
