//! Exchange connectivity: WebSocket sessions, message dispatch, the
//! market-data connection, and the two order-connection variants.

pub mod manager;
pub mod market_data;
pub mod order;
pub mod order_rest;
pub mod order_ws;
pub mod processor;
pub mod session;

pub use manager::ConnectionManager;
pub use market_data::MarketDataConnection;
pub use order::{translate_status, OrderAck, OrderConnection, OrderSnapshot};
pub use order_rest::RestOrderConnection;
pub use order_ws::WsOrderConnection;
pub use processor::MessageProcessor;
pub use session::WsSession;

use serde_json::Value;

/// Numeric field that may arrive as a JSON string or number
pub(crate) fn value_as_f64(value: &Value) -> f64 {
    value
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| value.as_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_as_f64() {
        assert_eq!(value_as_f64(&json!("1.5")), 1.5);
        assert_eq!(value_as_f64(&json!(2.5)), 2.5);
        assert_eq!(value_as_f64(&json!(null)), 0.0);
        assert_eq!(value_as_f64(&json!("garbage")), 0.0);
    }
}
