//! MarketData
//! Per venue/symbol liquidity snapshot: 24h volume and two-sided open interest.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Symbol, VenueId};

/// A record is considered stale (ignored by the finder) past this age.
pub const STALE_AFTER: chrono::Duration = chrono::Duration::minutes(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub volume_24h_usd: Option<Decimal>,
    /// Two-sided (long + short) open interest in USD. Adapters that only
    /// see one side are responsible for doubling it before this point (see
    /// `venues::TWO_SIDED_OI_NOTE`).
    pub open_interest_usd: Option<Decimal>,
    pub updated_at: NaiveDateTime,
}

impl MarketData {
    pub fn is_stale(&self, now: NaiveDateTime) -> bool {
        now.signed_duration_since(self.updated_at) > STALE_AFTER
    }
}
