//! TradeFill
//! One coalesced fill per (position_id, order_id). Inserted by C5 when an
//! order reaches a terminal filled state; never updated.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Symbol, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buy, -1 for sell -- used when summing signed notional for PnL.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFill {
    pub id: Option<i64>,
    pub position_id: Uuid,
    pub account_id: String,
    pub venue: VenueId,
    pub symbol: Symbol,
    pub trade_type: TradeType,
    pub side: Side,
    pub order_id: String,
    pub timestamp: NaiveDateTime,
    pub total_quantity: Decimal,
    pub weighted_avg_price: Decimal,
    pub total_fee: Decimal,
    pub fee_currency: String,
    pub realized_pnl: Option<Decimal>,
    pub realized_funding: Option<Decimal>,
    pub fill_count: i64,
}
