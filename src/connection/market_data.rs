//! Market-data connection
//!
//! Long-lived authenticated WebSocket subscribed to the L2 channel.
//! Incoming events are normalized into book-update entries, reconciled
//! against the active-quote table, and published into the order book, which
//! fires the strategy tick after each complete message.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde_json::{json, Value};

use crate::auth::JwtSigner;
use crate::book::{entry_id, ActiveQuoteTable, BookEntry, OrderBook, QuoteInfo, QuoteSide, UpdateKind};
use crate::config::SessionConfig;
use crate::connection::processor::MessageProcessor;
use crate::connection::session::WsSession;
use crate::errors::{Error, Result};
use crate::instruments::{CurrencyPair, SymbolTable};

/// Heartbeats logged on startup before going quiet
const LOGGED_HEARTBEATS: u32 = 10;

pub struct MarketDataConnection {
    session: Arc<WsSession>,
    processor: Arc<MessageProcessor>,
    settings: SessionConfig,
    signer: Arc<JwtSigner>,
    symbols: Arc<dyn SymbolTable>,
    book: Arc<OrderBook>,
    instruments: Mutex<BTreeSet<String>>,
    quotes: Mutex<ActiveQuoteTable>,
    key_seq: AtomicI64,
    message_seq: AtomicU64,
    heartbeats_seen: AtomicU32,
}

impl MarketDataConnection {
    pub fn new(
        settings: SessionConfig,
        signer: Arc<JwtSigner>,
        symbols: Arc<dyn SymbolTable>,
        book: Arc<OrderBook>,
    ) -> Arc<Self> {
        let instruments: BTreeSet<String> = settings.instrument_list().into_iter().collect();

        let connection = Arc::new(Self {
            session: WsSession::new(&format!("{}-md", settings.name)),
            processor: Arc::new(MessageProcessor::new()),
            settings,
            signer,
            symbols,
            book,
            instruments: Mutex::new(instruments),
            quotes: Mutex::new(ActiveQuoteTable::new()),
            key_seq: AtomicI64::new(0),
            message_seq: AtomicU64::new(0),
            heartbeats_seen: AtomicU32::new(0),
        });
        connection.install_handlers();
        connection
    }

    fn install_handlers(self: &Arc<Self>) {
        let md = self.clone();
        self.processor.register("l2_data", move |value| {
            let md = md.clone();
            async move { md.handle_l2(value).await }
        });

        let md = self.clone();
        self.processor.register("heartbeats", move |_value| {
            let md = md.clone();
            async move {
                let seen = md.heartbeats_seen.fetch_add(1, Ordering::Relaxed);
                if seen < LOGGED_HEARTBEATS {
                    info!("Session '{}-md' received heartbeat", md.settings.name);
                }
            }
        });

        let name = self.settings.name.clone();
        self.processor.register("subscriptions", move |_value| {
            let name = name.clone();
            async move {
                info!("Session '{}-md' received subscription confirmation", name);
            }
        });
    }

    /// Open the socket and subscribe the configured instruments
    pub async fn connect(&self) -> Result<()> {
        self.session
            .connect(&self.settings.ws_url(), self.processor.clone())
            .await?;

        let instruments: Vec<String> = {
            let set = self.instruments.lock().unwrap_or_else(|e| e.into_inner());
            set.iter().cloned().collect()
        };
        self.send_channel_frame("subscribe", &instruments).await
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        self.session.last_message_time()
    }

    /// Add an instrument to the subscription set and subscribe it.
    /// Fails when the symbol is invalid or already subscribed.
    pub async fn subscribe_instrument(&self, symbol: &str) -> Result<()> {
        let symbol = symbol.to_uppercase();
        CurrencyPair::parse(&symbol)?;

        {
            let mut set = self.instruments.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(symbol.clone()) {
                return Err(Error::Subscription(format!(
                    "Instrument '{}' has been already subscribed",
                    symbol
                )));
            }
        }

        self.send_channel_frame("subscribe", &[symbol]).await
    }

    /// Remove an instrument from the subscription set and unsubscribe it
    pub async fn unsubscribe_instrument(&self, symbol: &str) -> Result<()> {
        let symbol = symbol.to_uppercase();

        {
            let mut set = self.instruments.lock().unwrap_or_else(|e| e.into_inner());
            if !set.remove(&symbol) {
                return Err(Error::Subscription(format!(
                    "Instrument '{}' has not been subscribed",
                    symbol
                )));
            }
        }

        self.send_channel_frame("unsubscribe", &[symbol]).await
    }

    /// Currently subscribed internal symbols
    pub fn instruments(&self) -> Vec<String> {
        self.instruments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn send_channel_frame(&self, action: &str, instruments: &[String]) -> Result<()> {
        let products: Vec<String> = instruments
            .iter()
            .map(|s| self.symbols.to_exchange(s))
            .collect();

        let payload = json!({
            "type": action,
            "channel": self.settings.channels,
            "product_ids": products,
            "jwt": self.signer.websocket_token()?,
        });

        self.session.send_text(payload.to_string()).await
    }

    async fn handle_l2(&self, value: Value) {
        let Some(events) = value.get("events").and_then(Value::as_array) else {
            warn!("l2_data message has no events");
            return;
        };

        for event in events {
            if event.get("type").and_then(Value::as_str) != Some("update") {
                continue;
            }

            let product = event
                .get("product_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let instrument = match CurrencyPair::parse(&self.symbols.to_internal(product)) {
                Ok(cp) => cp,
                Err(_) => {
                    error!("Invalid (or not supported) instrument '{}' - ignored", product);
                    continue;
                }
            };

            let Some(updates) = event.get("updates").and_then(Value::as_array) else {
                continue;
            };

            let sequence_tag = self.message_seq.fetch_add(1, Ordering::Relaxed);
            let mut entries = Vec::with_capacity(updates.len());

            for update in updates {
                let side = match update.get("side").and_then(Value::as_str) {
                    Some("bid") => QuoteSide::Bid,
                    Some(_) => QuoteSide::Ask,
                    None => continue,
                };
                let price_str = update
                    .get("price_level")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let qty_str = update
                    .get("new_quantity")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                let (Ok(price), Ok(volume)) = (price_str.parse::<f64>(), qty_str.parse::<f64>())
                else {
                    warn!(
                        "Unparseable L2 level for {}: price='{}' qty='{}'",
                        instrument, price_str, qty_str
                    );
                    continue;
                };

                let id = entry_id(&instrument, side, price_str);
                entries.push(BookEntry {
                    key: 0,
                    ref_key: 0,
                    ref_id: id.clone(),
                    id,
                    instrument: instrument.clone(),
                    side,
                    price,
                    volume,
                    kind: if volume == 0.0 {
                        UpdateKind::Delete
                    } else {
                        UpdateKind::New
                    },
                    position_no: 0,
                    sequence_tag,
                    end_of_message: false,
                });
            }

            self.publish_quotes(entries).await;
        }
    }

    /// Reconcile raw entries against the active-quote table and publish the
    /// survivors into the book as one batch.
    async fn publish_quotes(&self, entries: Vec<BookEntry>) {
        let mut published: Vec<BookEntry> = {
            let mut table = self.quotes.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .into_iter()
                .filter_map(|entry| self.reconcile(&mut table, entry))
                .collect()
        };

        if published.is_empty() {
            return;
        }

        if let Some(last) = published.last_mut() {
            last.end_of_message = true;
        }

        self.book.apply(&published).await;
    }

    fn reconcile(&self, table: &mut ActiveQuoteTable, mut entry: BookEntry) -> Option<BookEntry> {
        entry.key = self.key_seq.fetch_add(1, Ordering::SeqCst) + 1;

        match entry.kind {
            UpdateKind::Delete => match table.remove(&entry.ref_id) {
                Some(prior) => {
                    entry.ref_key = prior.key;
                    Some(entry)
                }
                None => {
                    error!(
                        "DELETE referring to non-existent entry '{}' -> '{}' - skipped",
                        entry.id, entry.ref_id
                    );
                    None
                }
            },
            UpdateKind::New | UpdateKind::Update => {
                let prior = table.replace(
                    &entry.id,
                    QuoteInfo {
                        key: entry.key,
                        instrument: entry.instrument.clone(),
                        side: entry.side,
                    },
                );

                match prior {
                    Some(prior) => {
                        // NEW referring to an existing quote is an UPDATE
                        if entry.kind == UpdateKind::New {
                            entry.kind = UpdateKind::Update;
                        }
                        entry.ref_key = prior.key;
                    }
                    None => {
                        // UPDATE without a prior quote is a NEW
                        if entry.kind == UpdateKind::Update {
                            entry.kind = UpdateKind::New;
                        }
                        entry.ref_key = 0;
                    }
                }
                Some(entry)
            }
        }
    }

    /// Number of quotes currently tracked as active
    pub fn active_quote_count(&self) -> usize {
        self.quotes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::TickHandler;
    use crate::instruments::{init_test_registry, DashedSymbols};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingTick(AtomicUsize);

    #[async_trait]
    impl TickHandler for CountingTick {
        async fn on_tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

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

    fn setup() -> (Arc<MarketDataConnection>, Arc<OrderBook>, Arc<CountingTick>) {
        init_test_registry();
        let book = Arc::new(OrderBook::new());
        let ticks = Arc::new(CountingTick(AtomicUsize::new(0)));
        book.bind_tick(ticks.clone());
        let md = MarketDataConnection::new(
            test_settings(),
            test_signer(),
            Arc::new(DashedSymbols),
            book.clone(),
        );
        (md, book, ticks)
    }

    fn l2_message(updates: Vec<Value>) -> Value {
        json!({
            "channel": "l2_data",
            "events": [{
                "type": "update",
                "product_id": "BTC-USD",
                "updates": updates,
            }]
        })
    }

    #[tokio::test]
    async fn test_l2_update_populates_book_and_ticks() {
        let (md, book, ticks) = setup();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();

        let message = l2_message(vec![
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "2.0"}),
            json!({"side": "offer", "price_level": "101.0", "new_quantity": "1.0"}),
        ]);
        md.handle_l2(message).await;

        assert_eq!(book.best_bid(&cp), Some(99.0));
        assert_eq!(book.best_ask(&cp), Some(101.0));
        assert_eq!(md.active_quote_count(), 2);
        assert_eq!(ticks.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_new_becomes_update() {
        let (md, book, ticks) = setup();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();

        md.handle_l2(l2_message(vec![
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "2.0"}),
        ]))
        .await;
        md.handle_l2(l2_message(vec![
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "5.0"}),
        ]))
        .await;

        // Still one active quote, volume replaced, two ticks
        assert_eq!(md.active_quote_count(), 1);
        assert_eq!(book.volume_at(&cp, true, 99.0), Some(5.0));
        assert_eq!(ticks.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_quantity_deletes_quote() {
        let (md, book, _) = setup();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();

        md.handle_l2(l2_message(vec![
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "2.0"}),
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "0"}),
        ]))
        .await;

        assert_eq!(md.active_quote_count(), 0);
        assert_eq!(book.best_bid(&cp), None);
    }

    #[tokio::test]
    async fn test_delete_before_new_is_skipped() {
        let (md, book, ticks) = setup();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();

        // DELETE for an unknown id: error logged, book unchanged, no tick
        md.handle_l2(l2_message(vec![
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "0"}),
        ]))
        .await;
        assert_eq!(md.active_quote_count(), 0);
        assert_eq!(book.depth(&cp), (0, 0));
        assert_eq!(ticks.0.load(Ordering::SeqCst), 0);

        // A subsequent NEW for the same id inserts normally
        md.handle_l2(l2_message(vec![
            json!({"side": "bid", "price_level": "99.0", "new_quantity": "1.0"}),
        ]))
        .await;
        assert_eq!(md.active_quote_count(), 1);
        assert_eq!(book.best_bid(&cp), Some(99.0));
    }

    #[tokio::test]
    async fn test_unknown_product_is_ignored() {
        let (md, _, ticks) = setup();

        let message = json!({
            "channel": "l2_data",
            "events": [{
                "type": "update",
                "product_id": "DOGE-USD",
                "updates": [{"side": "bid", "price_level": "1", "new_quantity": "1"}],
            }]
        });
        md.handle_l2(message).await;

        assert_eq!(md.active_quote_count(), 0);
        assert_eq!(ticks.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_instrument_validation() {
        let (md, _, _) = setup();

        // Invalid symbol
        assert!(md.subscribe_instrument("DOGE/USD").await.is_err());

        // Already subscribed from session config
        let result = md.subscribe_instrument("BTC/USD").await;
        assert!(matches!(result, Err(Error::Subscription(_))));

        // Unsubscribing something never subscribed
        let result = md.unsubscribe_instrument("ETH/USD").await;
        assert!(matches!(result, Err(Error::Subscription(_))));
    }
}
