//! Market-data book: update entries, active-quote tracking, ordered book

pub mod active_quotes;
pub mod order_book;
pub mod types;

pub use active_quotes::{ActiveQuoteTable, QuoteInfo};
pub use order_book::{OrderBook, TickHandler};
pub use types::{entry_id, BookEntry, QuoteSide, UpdateKind};
