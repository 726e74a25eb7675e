//! Atomic Two-Leg Executor (C5)
//! Mission: place and unwind paired long/short positions as a single logical
//! unit -- either both legs end up matched, or neither does.
//! Philosophy: the invariant in spec §4.5 ("on return from open, either a
//! Position row exists with matching fills, or no Position row exists and
//! net exposure is zero") is the one thing this module is not allowed to
//! violate; everything else is plumbing around that invariant.
//! Grounded on `original_source/strategies/implementations/funding_arbitrage/
//! operations/opening/entry_validator.py` for the divergence-guard formula
//! and the teacher's `vault::execution`/`vault::trade_executor` for the
//! shape of a venue-facing order placement helper.

pub mod close;
pub mod open;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::Db;
use crate::errors::{CoreError, CoreResult};
use crate::models::{Side as ModelSide, TradeFill, TradeType, VenueId};
use crate::venues::{OrderInfo, Side as VenueSide, VenueAdapter};

/// Caller-supplied parameters for one `open` attempt (spec §6 config options
/// that feed directly into C5).
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub account_id: String,
    pub target_margin_usd: Decimal,
    pub leverage: Decimal,
    pub max_entry_price_divergence_pct: Decimal,
    pub limit_order_offset_pct: Decimal,
    pub order_timeout: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrderType {
    Market,
    Limit,
}

pub struct TwoLegExecutor {
    pub(crate) adapters: HashMap<VenueId, Arc<dyn VenueAdapter>>,
    pub(crate) db: Arc<Db>,
}

impl TwoLegExecutor {
    pub fn new(adapters: HashMap<VenueId, Arc<dyn VenueAdapter>>, db: Arc<Db>) -> Self {
        Self { adapters, db }
    }

    pub(crate) fn adapter(&self, venue: &VenueId) -> CoreResult<&Arc<dyn VenueAdapter>> {
        self.adapters
            .get(venue)
            .ok_or_else(|| CoreError::Invariant(format!("no adapter registered for venue {venue}")))
    }

    /// Fee schedule per registered venue, for C3/C7 to consult without
    /// reaching into the adapter map directly (spec §4.1: fee knowledge
    /// belongs to the calculator/collector side, not the adapter caller).
    pub fn fee_schedules(&self) -> HashMap<VenueId, crate::venues::FeeSchedule> {
        self.adapters.iter().map(|(id, a)| (id.clone(), a.fee_schedule())).collect()
    }
}

/// `(qty / increment).floor() * increment`, never negative.
pub(crate) fn round_down_to_increment(qty: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return qty;
    }
    (qty / increment).floor() * increment
}

/// `|a - b| / min(a, b)`, used for both the entry price-divergence guard and
/// the partial-fill quantity-match check. `None` if either side is <= 0.
pub(crate) fn relative_divergence(a: Decimal, b: Decimal) -> Option<Decimal> {
    if a <= Decimal::ZERO || b <= Decimal::ZERO {
        return None;
    }
    let min = a.min(b);
    let max = a.max(b);
    Some((max - min) / min)
}

pub(crate) fn to_model_side(side: VenueSide) -> ModelSide {
    match side {
        VenueSide::Buy => ModelSide::Buy,
        VenueSide::Sell => ModelSide::Sell,
    }
}

/// One `trade_fills` row from an adapter's `OrderInfo`. `fallback_price` is
/// used when the adapter did not report an average fill price (e.g. the
/// timed-out snapshot path in `submit_leg`/`await_result`).
pub(crate) fn fill_row(
    position_id: Uuid,
    account_id: &str,
    venue: &str,
    symbol: &str,
    info: &OrderInfo,
    fallback_price: Decimal,
    trade_type: TradeType,
    now: NaiveDateTime,
) -> TradeFill {
    TradeFill {
        id: None,
        position_id,
        account_id: account_id.to_string(),
        venue: venue.to_string(),
        symbol: symbol.to_string(),
        trade_type,
        side: to_model_side(info.side),
        order_id: info.order_id.clone(),
        timestamp: now,
        total_quantity: info.filled_quantity,
        weighted_avg_price: info.avg_fill_price.unwrap_or(fallback_price),
        total_fee: info.fee_paid,
        fee_currency: if info.fee_currency.is_empty() { "USD".to_string() } else { info.fee_currency.clone() },
        realized_pnl: None,
        realized_funding: None,
        fill_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_down_to_increment_floors_to_the_nearest_multiple() {
        assert_eq!(round_down_to_increment(dec!(1.2345), dec!(0.001)), dec!(1.234));
        assert_eq!(round_down_to_increment(dec!(1.0), dec!(0.1)), dec!(1.0));
    }

    #[test]
    fn relative_divergence_is_symmetric_and_none_for_non_positive() {
        assert_eq!(relative_divergence(dec!(100), dec!(103)), relative_divergence(dec!(103), dec!(100)));
        assert_eq!(relative_divergence(dec!(0), dec!(1)), None);
    }
}
