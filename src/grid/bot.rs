//! A single grid instance
//!
//! Plans the lattice of resting limit orders around the base price,
//! reconciles it against pre-existing open orders at startup, and replaces
//! each fill with a mirrored opposite-side order one step away.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};

use crate::errors::{Error, Result};
use crate::grid::config::GridBotConfig;
use crate::helpers::round_to_tick;
use crate::instruments::{CurrencyPair, Side};
use crate::orders::{OrderManager, OrderStatus};

/// Relative tolerance when matching existing orders to expected grid
/// levels; absorbs historical fills at rounded prices.
const PRICE_MATCH_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct OrderDetails {
    side: Side,
    price: f64,
    qty: f64,
}

pub struct GridBot {
    cfg: GridBotConfig,
    instrument: CurrencyPair,
    order_manager: Arc<OrderManager>,
    active_orders: Vec<String>,
    details: HashMap<String, OrderDetails>,
    known_fills: HashMap<String, f64>,
}

impl GridBot {
    pub fn new(cfg: GridBotConfig, order_manager: Arc<OrderManager>) -> Result<Self> {
        cfg.validate()?;
        let instrument = CurrencyPair::parse(&cfg.instrument)?;
        info!("Created grid '{}' for instrument {}", cfg.name, instrument);

        Ok(Self {
            cfg,
            instrument,
            order_manager,
            active_orders: Vec::new(),
            details: HashMap::new(),
            known_fills: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn instrument(&self) -> &CurrencyPair {
        &self.instrument
    }

    pub fn active_order_count(&self) -> usize {
        self.active_orders.len()
    }

    /// Track every NEW order for this instrument already present in the
    /// cache (synced from the exchange snapshot). Run once, before start.
    pub fn load_existing_orders(&mut self) {
        info!("[{}] Loading existing orders...", self.cfg.name);

        for (order_id, order) in self.order_manager.get_all_orders() {
            if order.status == OrderStatus::New && order.instrument == self.instrument {
                info!(
                    "[{}] Loaded order {}: {} @{} qty={}",
                    self.cfg.name, order_id, order.side, order.price, order.qty
                );
                self.track(
                    order_id,
                    OrderDetails {
                        side: order.side,
                        price: order.price,
                        qty: order.qty,
                    },
                );
            }
        }

        info!(
            "[{}] Loaded {} existing orders into grid",
            self.cfg.name,
            self.active_orders.len()
        );
    }

    /// Plan the expected level set, mark levels already covered by loaded
    /// orders, and place the missing ones.
    pub async fn start(&mut self) -> Result<()> {
        if !self.cfg.create_position {
            info!(
                "[{}] create_position=false, skipping new order placement (using existing orders only)",
                self.cfg.name
            );
            return Ok(());
        }

        let mut base = self.cfg.base_price;
        if base == 0.0 {
            info!("[{}] Base price is 0 - resolving from the current market", self.cfg.name);
            base = self.order_manager.current_market_price(&self.instrument);
            if base == 0.0 {
                return Err(Error::Book(format!(
                    "no market price available for {}",
                    self.instrument
                )));
            }
            info!("[{}] Using dynamic base price {}", self.cfg.name, base);
        }

        let step = self.cfg.step_percent;
        let mut buy_levels: Vec<(f64, bool)> = (1..=self.cfg.levels_below)
            .map(|i| (base * (1.0 - step * i as f64), false))
            .collect();
        let mut sell_levels: Vec<(f64, bool)> = (1..=self.cfg.levels_above)
            .map(|i| (base * (1.0 + step * i as f64), false))
            .collect();

        // Match loaded orders against expected levels so restarts do not
        // double-place.
        for order_id in &self.active_orders {
            let Some(details) = self.details.get(order_id) else {
                continue;
            };
            let levels = match details.side {
                Side::Buy => &mut buy_levels,
                Side::Sell => &mut sell_levels,
            };
            for (expected, placed) in levels.iter_mut() {
                if !*placed && ((details.price - *expected).abs() / *expected) < PRICE_MATCH_TOLERANCE {
                    *placed = true;
                    info!(
                        "[{}] Found existing {} order {} at {}",
                        self.cfg.name, details.side, order_id, details.price
                    );
                    break;
                }
            }
        }

        let existing = self.active_orders.len();
        let mut placed_new = 0usize;

        for (price, placed) in buy_levels {
            if !placed && self.place_grid_order(Side::Buy, price).await {
                placed_new += 1;
            }
        }
        for (price, placed) in sell_levels {
            if !placed && self.place_grid_order(Side::Sell, price).await {
                placed_new += 1;
            }
        }

        info!(
            "[{}] Grid initialization complete: {} existing orders, {} new orders placed, {} total",
            self.cfg.name,
            existing,
            placed_new,
            self.active_orders.len()
        );
        Ok(())
    }

    async fn place_grid_order(&mut self, side: Side, price: f64) -> bool {
        let order_id = self
            .order_manager
            .place_limit_order(&self.instrument, side, price, self.cfg.order_qty)
            .await;

        if order_id.is_empty() {
            error!("[{}] {} order at {} was not placed", self.cfg.name, side, price);
            return false;
        }

        info!("[{}] Placed new {} order {} at {}", self.cfg.name, side, order_id, price);
        self.track(
            order_id,
            OrderDetails {
                side,
                price,
                qty: self.cfg.order_qty,
            },
        );
        true
    }

    /// The reconciliation tick: walk every tracked order's cached state and
    /// hedge fills. Removal is deferred to after iteration.
    pub async fn check_filled_orders(&mut self) {
        let mut to_remove: Vec<String> = Vec::new();
        let tracked: Vec<String> = self.active_orders.clone();

        for order_id in tracked {
            // Cached state only: the push stream keeps it current
            let Some(order) = self.order_manager.get_order_local(&order_id) else {
                continue;
            };
            let Some(details) = self.details.get(&order_id).copied() else {
                continue;
            };

            match order.status {
                OrderStatus::Filled => {
                    self.hedge_fill(&order_id, details, details.qty, false).await;
                    to_remove.push(order_id);
                }
                OrderStatus::PartiallyFilled => {
                    let known = self.known_fills.get(&order_id).copied().unwrap_or(0.0);
                    let delta = order.filled - known;

                    if round_to_tick(delta, self.cfg.qty_tick) > 0.0 {
                        self.known_fills.insert(order_id.clone(), order.filled);
                        info!(
                            "[{}] Detected new partial fill on {} delta={}",
                            self.cfg.name, order_id, delta
                        );
                        self.hedge_fill(&order_id, details, delta, true).await;
                    }
                    // The order stays active for further partial fills
                }
                OrderStatus::Rejected | OrderStatus::Canceled | OrderStatus::Expired => {
                    to_remove.push(order_id);
                }
                OrderStatus::New => {}
            }
        }

        for order_id in to_remove {
            self.untrack(&order_id);
        }
    }

    /// Place the mirrored opposite-side order for a (partial) fill of
    /// `qty`, applying the capital and position guards.
    async fn hedge_fill(&mut self, order_id: &str, details: OrderDetails, qty: f64, partial: bool) {
        let step = self.cfg.step_percent;
        let kind = if partial { "Partial " } else { "" };

        match details.side {
            Side::Buy => {
                let sell_price = details.price * (1.0 + step);

                let base_balance = self.order_manager.get_balance(self.instrument.base());
                if base_balance > round_to_tick(self.cfg.max_position, self.cfg.qty_tick) {
                    warn!(
                        "[{}] Max base-currency position exceeded, not placing hedge sell",
                        self.cfg.name
                    );
                    return;
                }

                let new_id = self
                    .order_manager
                    .place_limit_order(&self.instrument, Side::Sell, sell_price, qty)
                    .await;
                if new_id.is_empty() {
                    warn!("[{}] Hedge SELL at {} missed for {}", self.cfg.name, sell_price, order_id);
                    return;
                }

                self.track(
                    new_id,
                    OrderDetails {
                        side: Side::Sell,
                        price: sell_price,
                        qty,
                    },
                );
                let profit = details.price * step * qty;
                info!(
                    "[{}] {}BUY fill {} at {}, placed hedge SELL at {}, expected profit {}",
                    self.cfg.name, kind, order_id, details.price, sell_price, profit
                );
            }
            Side::Sell => {
                let buy_price = details.price * (1.0 - step);

                let quote_balance = self.order_manager.get_balance(self.instrument.quote());
                let cost = buy_price * qty;
                if round_to_tick(quote_balance, self.cfg.qty_tick) < cost {
                    warn!(
                        "[{}] Insufficient quote-currency balance to place re-buy",
                        self.cfg.name
                    );
                    return;
                }

                let new_id = self
                    .order_manager
                    .place_limit_order(&self.instrument, Side::Buy, buy_price, qty)
                    .await;
                if new_id.is_empty() {
                    warn!("[{}] Hedge BUY at {} missed for {}", self.cfg.name, buy_price, order_id);
                    return;
                }

                self.track(
                    new_id,
                    OrderDetails {
                        side: Side::Buy,
                        price: buy_price,
                        qty,
                    },
                );
                let profit = details.price * step * qty;
                info!(
                    "[{}] {}SELL fill {} at {}, placed hedge BUY at {}, expected profit {}",
                    self.cfg.name, kind, order_id, details.price, buy_price, profit
                );
            }
        }
    }

    /// Log a one-line-per-order summary of the grid
    pub fn log_status(&self) {
        info!("[{}] Active orders: {}", self.cfg.name, self.active_orders.len());
        for order_id in &self.active_orders {
            if let Some(details) = self.details.get(order_id) {
                info!(
                    "[{}]  - {} {} @{} qty={}",
                    self.cfg.name, order_id, details.side, details.price, details.qty
                );
            }
        }
    }

    fn track(&mut self, order_id: String, details: OrderDetails) {
        self.details.insert(order_id.clone(), details);
        self.active_orders.push(order_id);
    }

    fn untrack(&mut self, order_id: &str) {
        self.active_orders.retain(|id| id != order_id);
        self.details.remove(order_id);
        self.known_fills.remove(order_id);
    }
}
