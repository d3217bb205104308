//! Request-reply order connection
//!
//! Each operation is an authenticated HTTPS request carrying a per-request
//! JWT whose `uri` claim is "METHOD host/path". There is no push channel;
//! order state advances via query_order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::JwtSigner;
use crate::config::SessionConfig;
use crate::connection::order::{translate_status, OrderAck, OrderConnection, OrderSnapshot};
use crate::connection::value_as_f64;
use crate::errors::{Error, Result};
use crate::instruments::{CurrencyPair, Side, SymbolTable};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The REST variant of the order connection
pub struct RestOrderConnection {
    client: reqwest::Client,
    /// Full base URL, e.g. "https://api.coinbase.com/api/v3/brokerage/"
    base: String,
    host: String,
    base_path: String,
    signer: Arc<JwtSigner>,
    symbols: Arc<dyn SymbolTable>,
    connected: AtomicBool,
}

impl RestOrderConnection {
    pub fn new(
        settings: &SessionConfig,
        signer: Arc<JwtSigner>,
        symbols: Arc<dyn SymbolTable>,
    ) -> Result<Arc<Self>> {
        let (host, base_path) = parse_base(&settings.orders_http)?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Arc::new(Self {
            client,
            base: settings.orders_http.clone(),
            host,
            base_path,
            signer,
            symbols,
            connected: AtomicBool::new(false),
        }))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let token = self
            .signer
            .rest_token("GET", &self.host, &format!("{}{}", self.base_path, path))?;
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .bearer_auth(token)
            .header("content-type", "application/json")
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let token = self
            .signer
            .rest_token("POST", &self.host, &format!("{}{}", self.base_path, path))?;
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .bearer_auth(token)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Http(format!("{}: {}", status, body)));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl OrderConnection for RestOrderConnection {
    async fn connect(&self) -> Result<()> {
        // Transport is per-request; nothing to open
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn supports_push(&self) -> bool {
        false
    }

    async fn send_order(
        &self,
        instrument: &CurrencyPair,
        side: Side,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck> {
        let client_order_id = Uuid::new_v4().to_string();
        let body = limit_order_body(
            &client_order_id,
            &self.symbols.to_exchange(&instrument.to_string()),
            side,
            price,
            qty,
        );

        let response = self.post("orders", &body).await?;
        debug!("SendOrder response: {}", response);

        if response.get("success").and_then(Value::as_bool) == Some(true) {
            let order_id = response["success_response"]["order_id"]
                .as_str()
                .unwrap_or(&client_order_id)
                .to_string();
            info!("Order accepted: {}", order_id);
            Ok(OrderAck::placed(order_id))
        } else {
            let reason = response["error_response"]["message"]
                .as_str()
                .or_else(|| response["failure_reason"].as_str())
                .unwrap_or("order rejected")
                .to_string();
            warn!("Order rejected: {}", reason);
            Ok(OrderAck::rejected(reason))
        }
    }

    async fn cancel_order(&self, _instrument: &CurrencyPair, order_id: &str) -> Result<bool> {
        let body = json!({ "order_ids": [order_id] });
        let response = self.post("orders/batch_cancel", &body).await?;

        let cancelled = response["results"]
            .as_array()
            .and_then(|r| r.first())
            .and_then(|r| r.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(cancelled)
    }

    async fn query_order(
        &self,
        _instrument: &CurrencyPair,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>> {
        let response = self.get(&format!("orders/historical/{order_id}")).await?;

        let Some(order) = response.get("order") else {
            return Ok(None);
        };

        Ok(Some(OrderSnapshot {
            order_id: order["order_id"].as_str().unwrap_or(order_id).to_string(),
            status: translate_status(order["status"].as_str().unwrap_or_default()),
            filled: value_as_f64(&order["filled_size"]),
        }))
    }

    async fn subscribe_user_channel(&self) -> Result<()> {
        debug!("Request-reply transport has no user channel; order state advances via query_order");
        Ok(())
    }

    async fn fetch_balances(&self) -> Result<Vec<(String, f64)>> {
        let response = self.get("accounts").await?;
        Ok(parse_accounts(&response))
    }
}

/// Split an order-entry base URL into (host, base path)
pub(crate) fn parse_base(orders_http: &str) -> Result<(String, String)> {
    let url = url::Url::parse(orders_http)
        .map_err(|e| Error::InvalidConfig(format!("bad orders_http url '{orders_http}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("orders_http url '{orders_http}' has no host")))?
        .to_string();
    Ok((host, url.path().to_string()))
}

/// Body of a GTC limit order submission
pub(crate) fn limit_order_body(
    client_order_id: &str,
    product_id: &str,
    side: Side,
    price: f64,
    qty: f64,
) -> Value {
    json!({
        "client_order_id": client_order_id,
        "product_id": product_id,
        "side": side.as_str(),
        "order_configuration": {
            "limit_limit_gtc": {
                "limit_price": price.to_string(),
                "base_size": qty.to_string(),
                "post_only": false,
            }
        }
    })
}

/// Extract (currency, available) pairs from an accounts response
pub(crate) fn parse_accounts(response: &Value) -> Vec<(String, f64)> {
    response["accounts"]
        .as_array()
        .map(|accounts| {
            accounts
                .iter()
                .filter_map(|account| {
                    let currency = account["currency"].as_str()?;
                    let available = value_as_f64(&account["available_balance"]["value"]);
                    Some((currency.to_string(), available))
                })
                .collect()
        })
        .unwrap_or_default()
}
