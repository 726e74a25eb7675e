//! Opportunity
//! A directed, fee-net-profitable venue-pair candidate. Exists only in memory
//! for the duration of one orchestrator tick -- never persisted.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Symbol, VenueId};
use crate::arbitrage::fees::FeeBreakdown;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: Symbol,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    /// `short_rate - long_rate`, per 8h period.
    pub divergence: Decimal,
    pub fees: FeeBreakdown,
    /// `divergence - fees.total_fee`.
    pub net_rate_per_period: Decimal,
    /// `net_rate_per_period * 1095`.
    pub net_apy: Decimal,
    pub min_vol_24h: Decimal,
    pub min_oi_usd: Decimal,
    /// Secondary ranking signal: higher is better. Currently `min_oi_usd`.
    pub liquidity_score: Decimal,
}
