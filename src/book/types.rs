//! Book update entry types

use crate::instruments::CurrencyPair;

/// Side of the book an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSide {
    Bid,
    Ask,
}

impl QuoteSide {
    pub fn is_bid(&self) -> bool {
        matches!(self, QuoteSide::Bid)
    }

    /// Single-character tag used in entry ids
    pub fn tag(&self) -> char {
        match self {
            QuoteSide::Bid => 'B',
            QuoteSide::Ask => 'A',
        }
    }
}

/// How an entry mutates the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    New,
    Update,
    Delete,
}

/// A single normalized book update
#[derive(Debug, Clone)]
pub struct BookEntry {
    /// Monotonic key assigned at publication
    pub key: i64,
    /// Key of the entry this one replaces, 0 when new
    pub ref_key: i64,
    /// Deterministic id: "{instrument}_{B|A}{priceString}"
    pub id: String,
    /// Id of the referenced entry (same as `id` for price-keyed feeds)
    pub ref_id: String,
    pub instrument: CurrencyPair,
    pub side: QuoteSide,
    pub price: f64,
    pub volume: f64,
    pub kind: UpdateKind,
    pub position_no: i64,
    pub sequence_tag: u64,
    /// Set on the last entry of a message batch; fires the strategy tick
    pub end_of_message: bool,
}

/// Deterministic quote id derived from the raw price string
pub fn entry_id(instrument: &CurrencyPair, side: QuoteSide, price: &str) -> String {
    format!("{}_{}{}", instrument, side.tag(), price)
}
