//! Crate-wide error types

use thiserror::Error;

/// Errors surfaced by the trading core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Currency registry has not been initialized")]
    RegistryUninitialized,

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Invalid instrument: {0}")]
    InvalidInstrument(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not connected")]
    NotConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Order book error: {0}")]
    Book(String),

    #[error("Unknown message kind: {0}")]
    UnknownMessage(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
