//! Per-instrument order book with a strategy tick callback
//!
//! Bids and asks are sorted price maps. After a batch of entries whose last
//! member carries `end_of_message`, the stored tick handler is invoked
//! exactly once, on the market-data listener task.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use ordered_float::OrderedFloat;

use crate::book::types::{BookEntry, UpdateKind};
use crate::instruments::CurrencyPair;

/// Receiver of the per-batch strategy tick
#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self);
}

#[derive(Debug, Clone, Copy)]
struct Level {
    #[allow(dead_code)]
    key: i64,
    volume: f64,
}

#[derive(Default)]
struct InstrumentBook {
    bids: BTreeMap<OrderedFloat<f64>, Level>,
    asks: BTreeMap<OrderedFloat<f64>, Level>,
}

/// Order book across all subscribed instruments
#[derive(Default)]
pub struct OrderBook {
    books: Mutex<HashMap<CurrencyPair, InstrumentBook>>,
    tick: Mutex<Option<Arc<dyn TickHandler>>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the tick handler invoked after each applied batch
    pub fn bind_tick(&self, handler: Arc<dyn TickHandler>) {
        *self.tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Apply a single reconciled entry
    pub fn add_entry(&self, entry: &BookEntry) {
        let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        let book = books.entry(entry.instrument.clone()).or_default();
        Self::apply_entry(book, entry);
    }

    /// Apply a batch of reconciled entries, then fire the tick once if the
    /// last entry closes the message.
    pub async fn apply(&self, entries: &[BookEntry]) {
        let fire = entries.last().map(|e| e.end_of_message).unwrap_or(false);

        {
            let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
            for entry in entries {
                let book = books.entry(entry.instrument.clone()).or_default();
                Self::apply_entry(book, entry);
            }
        }

        if fire {
            let handler = self
                .tick
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(handler) = handler {
                handler.on_tick().await;
            }
        }
    }

    fn apply_entry(book: &mut InstrumentBook, entry: &BookEntry) {
        let levels = if entry.side.is_bid() {
            &mut book.bids
        } else {
            &mut book.asks
        };
        let price = OrderedFloat(entry.price);

        match entry.kind {
            UpdateKind::New | UpdateKind::Update => {
                levels.insert(
                    price,
                    Level {
                        key: entry.key,
                        volume: entry.volume,
                    },
                );
            }
            UpdateKind::Delete => {
                if levels.remove(&price).is_none() {
                    debug!("Delete for absent level {} @ {}", entry.id, entry.price);
                }
            }
        }
    }

    pub fn best_bid(&self, instrument: &CurrencyPair) -> Option<f64> {
        let books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        books
            .get(instrument)
            .and_then(|b| b.bids.iter().next_back().map(|(p, _)| p.into_inner()))
    }

    pub fn best_ask(&self, instrument: &CurrencyPair) -> Option<f64> {
        let books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        books
            .get(instrument)
            .and_then(|b| b.asks.iter().next().map(|(p, _)| p.into_inner()))
    }

    /// Midpoint of best bid/ask; 0 when either side is missing
    pub fn mid_price(&self, instrument: &CurrencyPair) -> f64 {
        match (self.best_bid(instrument), self.best_ask(instrument)) {
            (Some(bid), Some(ask)) => (bid + ask) / 2.0,
            _ => 0.0,
        }
    }

    /// (bid levels, ask levels) currently held for an instrument
    pub fn depth(&self, instrument: &CurrencyPair) -> (usize, usize) {
        let books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        books
            .get(instrument)
            .map(|b| (b.bids.len(), b.asks.len()))
            .unwrap_or((0, 0))
    }

    /// Volume resting at an exact price level
    pub fn volume_at(&self, instrument: &CurrencyPair, bid: bool, price: f64) -> Option<f64> {
        let books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        books.get(instrument).and_then(|b| {
            let levels = if bid { &b.bids } else { &b.asks };
            levels.get(&OrderedFloat(price)).map(|l| l.volume)
        })
    }
}
