//! Push order connection
//!
//! Duplex WebSocket: outbound order requests and the streaming `user`
//! channel on one socket. The one-shot snapshot after subscribe rebuilds
//! local order truth; streamed updates keep it current via the order
//! manager back reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::auth::JwtSigner;
use crate::config::SessionConfig;
use crate::connection::order::{translate_status, OrderAck, OrderConnection, OrderSnapshot};
use crate::connection::order_rest::{parse_accounts, parse_base};
use crate::connection::processor::MessageProcessor;
use crate::connection::session::WsSession;
use crate::connection::value_as_f64;
use crate::errors::Result;
use crate::instruments::{CurrencyPair, Side, SymbolTable};
use crate::orders::OrderManager;

/// How long startup waits for the user-channel snapshot
const SNAPSHOT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct PendingOrder {
    #[allow(dead_code)]
    instrument: CurrencyPair,
    #[allow(dead_code)]
    side: Side,
}

/// The WebSocket (push) variant of the order connection
pub struct WsOrderConnection {
    session: Arc<WsSession>,
    processor: Arc<MessageProcessor>,
    settings: SessionConfig,
    signer: Arc<JwtSigner>,
    symbols: Arc<dyn SymbolTable>,
    http: reqwest::Client,
    order_manager: Mutex<Weak<OrderManager>>,
    pending: Mutex<HashMap<String, PendingOrder>>,
    order_seq: AtomicU64,
    snapshot_seen: AtomicBool,
    snapshot_notify: Notify,
}

impl WsOrderConnection {
    pub fn new(
        settings: SessionConfig,
        signer: Arc<JwtSigner>,
        symbols: Arc<dyn SymbolTable>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            session: WsSession::new(&format!("{}-ord", settings.name)),
            processor: Arc::new(MessageProcessor::new()),
            settings,
            signer,
            symbols,
            http: reqwest::Client::new(),
            order_manager: Mutex::new(Weak::new()),
            pending: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(0),
            snapshot_seen: AtomicBool::new(false),
            snapshot_notify: Notify::new(),
        });
        connection.install_handlers();
        connection
    }

    fn install_handlers(self: &Arc<Self>) {
        let ord = self.clone();
        self.processor.register("user", move |value| {
            let ord = ord.clone();
            async move { ord.handle_user(value).await }
        });

        let name = self.settings.name.clone();
        self.processor.register("response", move |value| {
            let name = name.clone();
            async move {
                if value.get("success").and_then(Value::as_bool) == Some(false) {
                    error!(
                        "Session '{}-ord' order response failed: {}",
                        name,
                        value["error_message"].as_str().unwrap_or("unknown")
                    );
                } else {
                    debug!("Session '{}-ord' order response: success", name);
                }
            }
        });

        let name = self.settings.name.clone();
        self.processor.register("error", move |value| {
            let name = name.clone();
            async move {
                error!(
                    "Session '{}-ord' protocol error [{}]: {}",
                    name,
                    value["code"].as_i64().unwrap_or(0),
                    value["message"].as_str().unwrap_or("unknown")
                );
            }
        });

        let name = self.settings.name.clone();
        self.processor.register("subscriptions", move |_value| {
            let name = name.clone();
            async move {
                info!("Session '{}-ord' received subscription confirmation", name);
            }
        });
    }

    fn order_manager(&self) -> Option<Arc<OrderManager>> {
        self.order_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    async fn handle_user(&self, value: Value) {
        let Some(order_manager) = self.order_manager() else {
            warn!("User-channel message before order manager was installed; dropped");
            return;
        };

        let Some(events) = value.get("events").and_then(Value::as_array) else {
            warn!("User-channel message has no events");
            return;
        };

        for event in events {
            let orders = event
                .get("orders")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            match event.get("type").and_then(Value::as_str) {
                Some("snapshot") => {
                    for order in orders {
                        self.sync_from_snapshot(&order_manager, order);
                    }
                    info!("User snapshot applied: {} orders", orders.len());
                    self.snapshot_seen.store(true, Ordering::SeqCst);
                    self.snapshot_notify.notify_waiters();
                }
                Some("update") => {
                    for order in orders {
                        self.apply_update(&order_manager, order);
                    }
                }
                other => {
                    debug!("Ignoring user event of type {:?}", other);
                }
            }
        }
    }

    fn sync_from_snapshot(&self, order_manager: &OrderManager, order: &Value) {
        let Some(order_id) = order.get("order_id").and_then(Value::as_str) else {
            warn!("Snapshot order without order_id; skipped");
            return;
        };

        let product = order["product_id"].as_str().unwrap_or_default();
        let instrument = match CurrencyPair::parse(&self.symbols.to_internal(product)) {
            Ok(cp) => cp,
            Err(_) => {
                warn!("Snapshot order {} for unknown product '{}'; skipped", order_id, product);
                return;
            }
        };

        order_manager.sync_order(
            order_id,
            instrument,
            Side::from(order["side"].as_str().unwrap_or("SELL")),
            value_as_f64(&order["limit_price"]),
            value_as_f64(&order["order_size"]),
            translate_status(order["status"].as_str().unwrap_or_default()),
            value_as_f64(&order["filled_size"]),
        );
    }

    fn apply_update(&self, order_manager: &OrderManager, order: &Value) {
        let Some(order_id) = order.get("order_id").and_then(Value::as_str) else {
            return;
        };

        // First echo of a client-submitted order carries both ids; rekey
        // the cache record to the server id.
        if let Some(client_id) = order.get("client_order_id").and_then(Value::as_str) {
            let was_pending = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(client_id).is_some()
            };
            if was_pending {
                order_manager.assign_server_id(client_id, order_id);
            }
        }

        order_manager.update_order(
            order_id,
            translate_status(order["status"].as_str().unwrap_or_default()),
            value_as_f64(&order["filled_size"]),
        );
    }

    fn signed_payload(&self, mut payload: Value) -> Result<String> {
        payload["jwt"] = Value::String(self.signer.websocket_token()?);
        Ok(payload.to_string())
    }

    fn next_client_order_id(&self) -> String {
        format!(
            "ws-{}-{}",
            Utc::now().timestamp_millis(),
            self.order_seq.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[async_trait]
impl OrderConnection for WsOrderConnection {
    async fn connect(&self) -> Result<()> {
        self.session
            .connect(&self.settings.ws_url(), self.processor.clone())
            .await?;
        self.subscribe_user_channel().await
    }

    async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn supports_push(&self) -> bool {
        true
    }

    async fn send_order(
        &self,
        instrument: &CurrencyPair,
        side: Side,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck> {
        let client_order_id = self.next_client_order_id();

        let payload = json!({
            "type": "order",
            "action": "create",
            "client_order_id": client_order_id,
            "product_id": self.symbols.to_exchange(&instrument.to_string()),
            "side": side.as_str(),
            "order_configuration": {
                "limit_limit_gtc": {
                    "base_size": qty.to_string(),
                    "limit_price": price.to_string(),
                    "post_only": false,
                }
            }
        });

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(
                client_order_id.clone(),
                PendingOrder {
                    instrument: instrument.clone(),
                    side,
                },
            );
        }

        let frame = self.signed_payload(payload)?;
        if let Err(e) = self.session.send_text(frame).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&client_order_id);
            return Err(e);
        }

        info!(
            "Sent order {} {} {} @{} qty={}",
            client_order_id, instrument, side, price, qty
        );

        // The exchange acks asynchronously on the user stream; hand the
        // client id back immediately as the tentative order id.
        Ok(OrderAck::placed(client_order_id))
    }

    async fn cancel_order(&self, _instrument: &CurrencyPair, order_id: &str) -> Result<bool> {
        let payload = json!({
            "type": "order",
            "action": "cancel",
            "order_id": order_id,
        });

        let frame = self.signed_payload(payload)?;
        self.session.send_text(frame).await?;
        info!("Sent cancel for order {}", order_id);
        Ok(true)
    }

    async fn query_order(
        &self,
        _instrument: &CurrencyPair,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>> {
        debug!(
            "query_order({}) on the push transport: state arrives on the user stream",
            order_id
        );
        Ok(None)
    }

    async fn subscribe_user_channel(&self) -> Result<()> {
        let instruments: Vec<String> = self
            .settings
            .instrument_list()
            .iter()
            .map(|s| self.symbols.to_exchange(s))
            .collect();

        let payload = json!({
            "type": "subscribe",
            "channel": "user",
            "product_ids": instruments,
        });

        let frame = self.signed_payload(payload)?;
        self.session.send_text(frame).await
    }

    async fn fetch_balances(&self) -> Result<Vec<(String, f64)>> {
        // Balances live on the HTTPS accounts surface even for the push
        // transport
        let (host, base_path) = parse_base(&self.settings.orders_http)?;
        let token = self
            .signer
            .rest_token("GET", &host, &format!("{base_path}accounts"))?;

        let response = self
            .http
            .get(format!("{}accounts", self.settings.orders_http))
            .bearer_auth(token)
            .header("content-type", "application/json")
            .send()
            .await?;
        let body: Value = response.json().await?;
        Ok(parse_accounts(&body))
    }

    fn set_order_manager(&self, order_manager: Weak<OrderManager>) {
        *self.order_manager.lock().unwrap_or_else(|e| e.into_inner()) = order_manager;
    }

    async fn await_ready(&self) {
        let notified = self.snapshot_notify.notified();
        if self.snapshot_seen.load(Ordering::SeqCst) {
            return;
        }
        if tokio::time::timeout(SNAPSHOT_WAIT, notified).await.is_err() {
            warn!(
                "No user snapshot within {:?}; continuing with an empty cache",
                SNAPSHOT_WAIT
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderBook;
    use crate::connection::order::mock::MockOrderConnection;
    use crate::instruments::{init_test_registry, DashedSymbols};
    use crate::orders::OrderStatus;

    fn test_settings() -> SessionConfig {
        SessionConfig {
            name: "test".to_string(),
            host: "example.com".to_string(),
            port: 443,
            ws_path: "/".to_string(),
            instruments: "BTC/USD".to_string(),
            channels: "l2_data".to_string(),
            apikey: "organizations/test/apiKeys/unit".to_string(),
            secretkey: String::new(),
            orders_http: "https://example.com/api/v3/brokerage/".to_string(),
            depth: 50,
            order_transport: crate::config::OrderTransport::Ws,
        }
    }

    fn test_signer() -> Arc<JwtSigner> {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let pem = secret.to_sec1_pem(p256::pkcs8::LineEnding::LF).unwrap();
        Arc::new(JwtSigner::new("organizations/test/apiKeys/unit", &pem).unwrap())
    }

    fn setup() -> (Arc<WsOrderConnection>, Arc<OrderManager>) {
        init_test_registry();
        let connection = WsOrderConnection::new(test_settings(), test_signer(), Arc::new(DashedSymbols));

        // The cache under test is fed by the WS connection; its own order
        // routing is irrelevant here, so a mock transport backs it.
        let om = OrderManager::new(Arc::new(MockOrderConnection::new()), Arc::new(OrderBook::new()));
        connection.set_order_manager(Arc::downgrade(&om));
        (connection, om)
    }

    fn snapshot_message() -> Value {
        json!({
            "channel": "user",
            "events": [{
                "type": "snapshot",
                "orders": [
                    {
                        "order_id": "srv-1",
                        "product_id": "BTC-USD",
                        "side": "BUY",
                        "status": "OPEN",
                        "limit_price": "99.0",
                        "order_size": "1.0",
                        "filled_size": "0",
                    },
                    {
                        "order_id": "srv-2",
                        "product_id": "BTC-USD",
                        "side": "SELL",
                        "status": "OPEN",
                        "limit_price": "101.0",
                        "order_size": "1.0",
                        "filled_size": "0.25",
                    },
                ],
            }]
        })
    }

    #[tokio::test]
    async fn test_snapshot_reconstructs_cache() {
        let (connection, om) = setup();

        connection.handle_user(snapshot_message()).await;

        let orders = om.get_all_orders();
        assert_eq!(orders.len(), 2);

        let order = om.get_order_local("srv-1").unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.price, 99.0);
        assert_eq!(order.qty, 1.0);

        let order = om.get_order_local("srv-2").unwrap();
        assert_eq!(order.filled, 0.25);

        // Snapshot gate is open
        connection.await_ready().await;
    }

    #[tokio::test]
    async fn test_update_advances_order_state() {
        let (connection, om) = setup();
        connection.handle_user(snapshot_message()).await;

        let update = json!({
            "channel": "user",
            "events": [{
                "type": "update",
                "orders": [{
                    "order_id": "srv-1",
                    "status": "FILLED",
                    "filled_size": "1.0",
                }],
            }]
        });
        connection.handle_user(update).await;

        let order = om.get_order_local("srv-1").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled, 1.0);
    }

    #[tokio::test]
    async fn test_pending_order_rekeyed_to_server_id() {
        let (connection, om) = setup();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();

        // Simulate the synchronous half of send_order: cache the order
        // under a client id and mark it pending.
        om.sync_order("ws-1-0", cp.clone(), Side::Buy, 99.0, 1.0, OrderStatus::New, 0.0);
        connection
            .pending
            .lock()
            .unwrap()
            .insert("ws-1-0".to_string(), PendingOrder { instrument: cp, side: Side::Buy });

        let update = json!({
            "channel": "user",
            "events": [{
                "type": "update",
                "orders": [{
                    "order_id": "srv-99",
                    "client_order_id": "ws-1-0",
                    "status": "PARTIALLY_FILLED",
                    "filled_size": "0.5",
                }],
            }]
        });
        connection.handle_user(update).await;

        // Record updated in place, reachable under both ids
        let order = om.get_order_local("ws-1-0").unwrap();
        assert_eq!(order.order_id, "srv-99");
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled, 0.5);
        assert!(om.get_order_local("srv-99").is_some());
        assert!(connection.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_order_ids_are_unique() {
        let (connection, _) = setup();
        let a = connection.next_client_order_id();
        let b = connection.next_client_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("ws-"));
    }

    #[tokio::test]
    async fn test_send_order_fails_cleanly_when_disconnected() {
        let (connection, _) = setup();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();

        let result = connection.send_order(&cp, Side::Buy, 99.0, 1.0).await;
        assert!(result.is_err());
        assert!(connection.pending.lock().unwrap().is_empty());
    }
}
