//! Active quote table
//!
//! Tracks the currently-resting (price, side) quotes per instrument, keyed
//! by the deterministic entry id. The id encodes instrument, side and the
//! raw price string, so at most one entry can exist per price level.

use std::collections::HashMap;

use crate::book::types::QuoteSide;
use crate::instruments::CurrencyPair;

/// What is known about an active quote
#[derive(Debug, Clone)]
pub struct QuoteInfo {
    pub key: i64,
    pub instrument: CurrencyPair,
    pub side: QuoteSide,
}

/// Mapping from quote id to its active-quote record
#[derive(Debug, Default)]
pub struct ActiveQuoteTable {
    quotes: HashMap<String, QuoteInfo>,
}

impl ActiveQuoteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&QuoteInfo> {
        self.quotes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.quotes.contains_key(id)
    }

    /// Remove a quote, returning its prior record when present
    pub fn remove(&mut self, id: &str) -> Option<QuoteInfo> {
        self.quotes.remove(id)
    }

    /// Install a quote, returning the record it replaced when present
    pub fn replace(&mut self, id: &str, info: QuoteInfo) -> Option<QuoteInfo> {
        self.quotes.insert(id.to_string(), info)
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}
