//! Currencies, currency pairs and exchange symbol translation
//!
//! The currency registry is process-wide and must be initialized exactly
//! once, before the first `CurrencyPair` is constructed. Initialization is
//! an explicit call in the startup sequence rather than a lazy static.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use crate::errors::{Error, Result};

static CURRENCY_REGISTRY: OnceLock<BTreeSet<String>> = OnceLock::new();

/// Install the process-wide set of known currency codes.
///
/// Returns an error when called twice; the registry is immutable after
/// startup.
pub fn init_currency_registry<I, S>(codes: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let set: BTreeSet<String> = codes.into_iter().map(|c| c.into().to_uppercase()).collect();
    if set.is_empty() {
        return Err(Error::InvalidConfig("currency registry cannot be empty".into()));
    }
    CURRENCY_REGISTRY
        .set(set)
        .map_err(|_| Error::InvalidConfig("currency registry already initialized".into()))
}

/// Whether the registry has been initialized.
pub fn registry_initialized() -> bool {
    CURRENCY_REGISTRY.get().is_some()
}

fn registry() -> Result<&'static BTreeSet<String>> {
    CURRENCY_REGISTRY.get().ok_or(Error::RegistryUninitialized)
}

/// A single currency tag, validated against the registry on construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self> {
        let code = code.to_uppercase();
        if registry()?.contains(&code) {
            Ok(Currency(code))
        } else {
            Err(Error::UnknownCurrency(code))
        }
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered (base, quote) pair, e.g. "BTC/USD"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CurrencyPair {
    base: Currency,
    quote: Currency,
}

impl CurrencyPair {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// Parse an internal "BASE/QUOTE" symbol. Both currencies must be
    /// present in the registry.
    pub fn parse(symbol: &str) -> Result<Self> {
        let (base, quote) = symbol
            .split_once('/')
            .ok_or_else(|| Error::InvalidInstrument(symbol.to_string()))?;
        if base.is_empty() || quote.is_empty() {
            return Err(Error::InvalidInstrument(symbol.to_string()));
        }
        Ok(Self {
            base: Currency::new(base)?,
            quote: Currency::new(quote)?,
        })
    }

    pub fn base(&self) -> &Currency {
        &self.base
    }

    pub fn quote(&self) -> &Currency {
        &self.quote
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl From<&str> for Side {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => Side::Buy,
            _ => Side::Sell,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange-specific symbol translation, pluggable per venue
pub trait SymbolTable: Send + Sync {
    /// Internal "BASE/QUOTE" to exchange product id
    fn to_exchange(&self, internal: &str) -> String;

    /// Exchange product id to internal "BASE/QUOTE"
    fn to_internal(&self, exchange: &str) -> String;
}

/// Venues that join base and quote with a dash ("BTC-USD")
#[derive(Debug, Default, Clone, Copy)]
pub struct DashedSymbols;

impl SymbolTable for DashedSymbols {
    fn to_exchange(&self, internal: &str) -> String {
        internal.replace('/', "-")
    }

    fn to_internal(&self, exchange: &str) -> String {
        exchange.replace('-', "/")
    }
}

#[cfg(test)]
pub(crate) fn init_test_registry() {
    let _ = init_currency_registry(["BTC", "ETH", "USD", "USDC", "EUR"]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_parse_and_display() {
        init_test_registry();

        let cp = CurrencyPair::parse("btc/usd").unwrap();
        assert_eq!(cp.base().code(), "BTC");
        assert_eq!(cp.quote().code(), "USD");
        assert_eq!(cp.to_string(), "BTC/USD");
    }

    #[test]
    fn test_pair_rejects_unknown_currency() {
        init_test_registry();

        assert!(matches!(
            CurrencyPair::parse("DOGE/USD"),
            Err(Error::UnknownCurrency(_))
        ));
        assert!(matches!(
            CurrencyPair::parse("BTCUSD"),
            Err(Error::InvalidInstrument(_))
        ));
    }

    #[test]
    fn test_pair_equality_is_structural() {
        init_test_registry();

        let a = CurrencyPair::parse("ETH/USD").unwrap();
        let b = CurrencyPair::parse("eth/usd").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_side_translation() {
        assert_eq!(Side::from("BUY"), Side::Buy);
        assert_eq!(Side::from("b"), Side::Buy);
        assert_eq!(Side::from("SELL"), Side::Sell);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_dashed_symbols_round_trip() {
        let table = DashedSymbols;
        assert_eq!(table.to_exchange("BTC/USD"), "BTC-USD");
        assert_eq!(table.to_internal("BTC-USD"), "BTC/USD");
    }
}
