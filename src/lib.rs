#![deny(unreachable_pub)]

//! Spot-market grid trading bot core
//!
//! Maintains a lattice of resting limit orders around a reference price and
//! replaces each fill with a mirrored opposite-side order one step away,
//! harvesting the step as realized profit. The core is the live trading
//! path: a duplex authenticated exchange connection layer, a per-instrument
//! grid engine, and an incremental L2 order book that drives the engine's
//! fill-reconciliation tick.

pub mod auth;
pub mod book;
pub mod config;
pub mod connection;
pub mod errors;
pub mod grid;
pub mod helpers;
pub mod instruments;
pub mod orders;

pub use auth::JwtSigner;
pub use book::{ActiveQuoteTable, BookEntry, OrderBook, QuoteSide, TickHandler, UpdateKind};
pub use config::{OrderTransport, SessionConfig, Settings};
pub use connection::{
    ConnectionManager, MarketDataConnection, OrderAck, OrderConnection, OrderSnapshot,
    RestOrderConnection, WsOrderConnection,
};
pub use errors::{Error, Result};
pub use grid::{GridBot, GridBotConfig, GridStrategy};
pub use helpers::{round_to_tick, truncate_float};
pub use instruments::{
    init_currency_registry, Currency, CurrencyPair, DashedSymbols, Side, SymbolTable,
};
pub use orders::{Order, OrderManager, OrderStatus};
