//! FundingRateSample
//! One observation from one venue/symbol, normalized to the canonical 8-hour interval.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Symbol, VenueId};

/// Reference interval every normalized rate is expressed against.
pub const CANONICAL_INTERVAL_HOURS: u32 = 8;

/// Periods per year at the canonical 8-hour interval (365 * 24 / 8).
pub const PERIODS_PER_YEAR: i64 = 1095;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRateSample {
    pub venue: VenueId,
    pub symbol: Symbol,
    /// Rate per the venue's native interval, as reported by the venue.
    pub raw_rate: Decimal,
    /// The venue's native funding interval, in hours. Must be > 0.
    pub interval_hours: Decimal,
    /// `raw_rate * (8 / interval_hours)`, expressed per 8-hour reference interval.
    pub normalized_rate: Decimal,
    pub next_funding_time: Option<NaiveDateTime>,
    pub sampled_at: NaiveDateTime,
}

impl FundingRateSample {
    /// Build a sample from a venue's raw observation, normalizing to the canonical interval.
    ///
    /// Panics if `interval_hours <= 0`, since that is an adapter bug, not a runtime condition.
    pub fn new(
        venue: VenueId,
        symbol: Symbol,
        raw_rate: Decimal,
        interval_hours: Decimal,
        next_funding_time: Option<NaiveDateTime>,
        sampled_at: NaiveDateTime,
    ) -> Self {
        assert!(
            interval_hours > Decimal::ZERO,
            "interval_hours must be positive, got {interval_hours}"
        );
        let normalized_rate =
            raw_rate * Decimal::from(CANONICAL_INTERVAL_HOURS) / interval_hours;
        Self {
            venue,
            symbol,
            raw_rate,
            interval_hours,
            normalized_rate,
            next_funding_time,
            sampled_at,
        }
    }

    /// Annualized yield implied by this sample alone (not a pair divergence).
    pub fn annualized_rate(&self) -> Decimal {
        self.normalized_rate * Decimal::from(PERIODS_PER_YEAR)
    }

    pub fn is_stale(&self, now: NaiveDateTime, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.sampled_at) > max_age
    }
}
