//! Grid bot configuration

use serde::Deserialize;

use crate::errors::{Error, Result};

fn default_create_position() -> bool {
    true
}

fn default_qty_tick() -> f64 {
    1e-8
}

/// Configuration for a single grid instance
#[derive(Debug, Clone, Deserialize)]
pub struct GridBotConfig {
    /// Logical id used in log lines
    pub name: String,

    /// Internal instrument symbol, "BASE/QUOTE"
    pub instrument: String,

    /// Anchor price; 0 resolves from the market midpoint at start
    #[serde(default)]
    pub base_price: f64,

    /// Number of BUY levels below the base price
    pub levels_below: u32,

    /// Number of SELL levels above the base price
    pub levels_above: u32,

    /// Geometric step between levels, as a fraction in (0, 1)
    pub step_percent: f64,

    /// Per-order size in base units
    #[serde(rename = "percent_order_qty")]
    pub order_qty: f64,

    /// Cap on the base-currency balance before hedge sells are skipped
    #[serde(default)]
    pub max_position: f64,

    /// When false, skip initial placement (intra-day restart mode)
    #[serde(default = "default_create_position")]
    pub create_position: bool,

    /// Quantity granularity used when comparing fill deltas
    #[serde(default = "default_qty_tick")]
    pub qty_tick: f64,
}

impl GridBotConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("grid name cannot be empty".into()));
        }

        if !self.instrument.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "grid '{}': instrument must be BASE/QUOTE, got '{}'",
                self.name, self.instrument
            )));
        }

        if !(self.step_percent > 0.0 && self.step_percent < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "grid '{}': step_percent must be in (0, 1)",
                self.name
            )));
        }

        if self.order_qty <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "grid '{}': percent_order_qty must be positive",
                self.name
            )));
        }

        if self.max_position < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "grid '{}': max_position cannot be negative",
                self.name
            )));
        }

        if self.base_price < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "grid '{}': base_price cannot be negative",
                self.name
            )));
        }

        if self.qty_tick <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "grid '{}': qty_tick must be positive",
                self.name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_config(name: &str) -> GridBotConfig {
    GridBotConfig {
        name: name.to_string(),
        instrument: "BTC/USD".to_string(),
        base_price: 100.0,
        levels_below: 2,
        levels_above: 2,
        step_percent: 0.01,
        order_qty: 1.0,
        max_position: 10.0,
        create_position: true,
        qty_tick: 1e-8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ok() {
        assert!(sample_config("g1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_step() {
        let mut cfg = sample_config("g1");
        cfg.step_percent = 0.0;
        assert!(cfg.validate().is_err());

        cfg.step_percent = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_qty() {
        let mut cfg = sample_config("g1");
        cfg.order_qty = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_instrument() {
        let mut cfg = sample_config("g1");
        cfg.instrument = "BTCUSD".to_string();
        assert!(cfg.validate().is_err());
    }
}
