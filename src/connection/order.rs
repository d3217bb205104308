//! Order connection contract
//!
//! Two interchangeable variants satisfy one capability set: the push
//! WebSocket connection and the request-reply REST connection. The order
//! manager is written against this trait only.

use std::sync::Weak;

use async_trait::async_trait;
use log::warn;

use crate::errors::Result;
use crate::instruments::{CurrencyPair, Side};
use crate::orders::{OrderManager, OrderStatus};

/// Result of submitting an order
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub success: bool,
    /// Server-assigned id, or the client id on the push path; empty when
    /// the order was not placed
    pub order_id: String,
    pub error: Option<String>,
}

impl OrderAck {
    pub fn placed(order_id: String) -> Self {
        Self {
            success: true,
            order_id,
            error: None,
        }
    }

    pub fn rejected(error: String) -> Self {
        Self {
            success: false,
            order_id: String::new(),
            error: Some(error),
        }
    }
}

/// Exchange-side view of an order, as returned by query_order
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled: f64,
}

/// Capability set shared by both order-connection variants
#[async_trait]
pub trait OrderConnection: Send + Sync {
    /// Open the transport. Blocks until usable; surfaces the first failure.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Whether order state is pushed (WebSocket) rather than polled (REST)
    fn supports_push(&self) -> bool;

    /// Submit a GTC limit order
    async fn send_order(
        &self,
        instrument: &CurrencyPair,
        side: Side,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck>;

    async fn cancel_order(&self, instrument: &CurrencyPair, order_id: &str) -> Result<bool>;

    /// Query current exchange state of an order. The push variant returns
    /// None: state arrives on the user stream instead.
    async fn query_order(
        &self,
        instrument: &CurrencyPair,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>>;

    /// Subscribe to the user order-update channel (no-op for REST)
    async fn subscribe_user_channel(&self) -> Result<()>;

    /// Account balances: currency code to available amount
    async fn fetch_balances(&self) -> Result<Vec<(String, f64)>>;

    /// Install the back reference used to deliver push callbacks. Installed
    /// by the connection manager after both components exist; no-op for
    /// variants without a push channel.
    fn set_order_manager(&self, _order_manager: Weak<OrderManager>) {}

    /// Wait until the connection has delivered its initial state (the user
    /// snapshot on the push path). Default: immediately ready.
    async fn await_ready(&self) {}
}

/// Translate an exchange status string into the order status enum.
/// Unknown strings default to NEW with a logged warning.
pub fn translate_status(status: &str) -> OrderStatus {
    match status {
        "OPEN" | "PENDING" | "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" | "DONE" => OrderStatus::Filled,
        "CANCELLED" | "CANCELED" => OrderStatus::Canceled,
        "REJECTED" | "FAILED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        other => {
            warn!("Unknown order status '{}', defaulting to NEW", other);
            OrderStatus::New
        }
    }
}

/// Mock order connection for testing without an exchange.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A recorded order submission
    #[derive(Debug, Clone)]
    pub struct SentOrder {
        pub order_id: String,
        pub instrument: CurrencyPair,
        pub side: Side,
        pub price: f64,
        pub qty: f64,
    }

    /// Mock connection recording every call
    #[derive(Default)]
    pub struct MockOrderConnection {
        pub sent: Mutex<Vec<SentOrder>>,
        pub cancelled: Mutex<Vec<String>>,
        pub balances: Mutex<Vec<(String, f64)>>,
        pub queries: Mutex<Vec<String>>,
        pub query_results: Mutex<std::collections::HashMap<String, OrderSnapshot>>,
        should_fail: AtomicBool,
        push: AtomicBool,
        next_id: AtomicU64,
    }

    impl MockOrderConnection {
        pub fn new() -> Self {
            Self {
                push: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                ..Self::default()
            }
        }

        pub fn set_should_fail(&self, fail: bool) {
            self.should_fail.store(fail, Ordering::SeqCst);
        }

        /// Present as the request-reply variant instead of the push one
        pub fn set_push(&self, push: bool) {
            self.push.store(push, Ordering::SeqCst);
        }

        pub fn set_balances(&self, balances: Vec<(String, f64)>) {
            *self.balances.lock().unwrap() = balances;
        }

        pub fn set_query_result(&self, order_id: &str, snapshot: OrderSnapshot) {
            self.query_results
                .lock()
                .unwrap()
                .insert(order_id.to_string(), snapshot);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OrderConnection for MockOrderConnection {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        fn supports_push(&self) -> bool {
            self.push.load(Ordering::SeqCst)
        }

        async fn send_order(
            &self,
            instrument: &CurrencyPair,
            side: Side,
            price: f64,
            qty: f64,
        ) -> Result<OrderAck> {
            if self.should_fail.load(Ordering::SeqCst) {
                return Ok(OrderAck::rejected("mock failure".into()));
            }

            let order_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.sent.lock().unwrap().push(SentOrder {
                order_id: order_id.clone(),
                instrument: instrument.clone(),
                side,
                price,
                qty,
            });
            Ok(OrderAck::placed(order_id))
        }

        async fn cancel_order(&self, _instrument: &CurrencyPair, order_id: &str) -> Result<bool> {
            self.cancelled.lock().unwrap().push(order_id.to_string());
            Ok(true)
        }

        async fn query_order(
            &self,
            _instrument: &CurrencyPair,
            order_id: &str,
        ) -> Result<Option<OrderSnapshot>> {
            self.queries.lock().unwrap().push(order_id.to_string());
            Ok(self.query_results.lock().unwrap().get(order_id).cloned())
        }

        async fn subscribe_user_channel(&self) -> Result<()> {
            Ok(())
        }

        async fn fetch_balances(&self) -> Result<Vec<(String, f64)>> {
            Ok(self.balances.lock().unwrap().clone())
        }
    }
}
