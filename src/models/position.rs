//! Position
//! Persisted open arbitrage position. Created by C5, mutated by C6, closed by
//! C5 at C6's direction. Never deleted.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Symbol, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Opening,
    Monitoring,
    Rebalancing,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    MaxAge,
    LiquidationRisk,
    ProfitErosion,
    PersistentWideSpread,
    ManualClose,
}

impl ExitReason {
    /// Exit reasons gated by the min-hold timer (spec §4.6, property 9).
    /// `ManualClose` is deliberately excluded: an operator override bypasses
    /// the gate by design, it does not erode the property it protects.
    pub fn subject_to_min_hold_gate(self) -> bool {
        matches!(
            self,
            ExitReason::ProfitErosion
                | ExitReason::LiquidationRisk
                | ExitReason::PersistentWideSpread
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Uuid,
    pub account_id: String,
    pub symbol: Symbol,
    pub long_venue: VenueId,
    pub short_venue: VenueId,

    // Entry fields
    pub size_usd: Decimal,
    pub entry_long_rate: Decimal,
    pub entry_short_rate: Decimal,
    pub entry_divergence: Decimal,
    pub entry_long_price: Decimal,
    pub entry_short_price: Decimal,
    pub opened_at: NaiveDateTime,

    // Live fields
    pub cumulative_funding_usd: Decimal,
    pub last_heartbeat: NaiveDateTime,
    pub lifecycle_stage: LifecycleStage,

    // Exit fields
    pub closed_at: Option<NaiveDateTime>,
    pub pnl_usd: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,

    /// Set when a close escalated to market on both legs but one leg's
    /// reduce-only still failed to confirm zero size (spec §4.5).
    pub close_degraded: bool,
}

impl Position {
    /// Invariant check the in-memory construction path enforces directly
    /// rather than deferring to a database constraint: `size_usd > 0`,
    /// distinct venues, and closed implies (closed_at, exit_reason) set.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.size_usd <= Decimal::ZERO {
            return Err("size_usd must be positive".into());
        }
        if self.long_venue == self.short_venue {
            return Err("long_venue and short_venue must be distinct".into());
        }
        if self.lifecycle_stage == LifecycleStage::Closed
            && (self.closed_at.is_none() || self.exit_reason.is_none())
        {
            return Err("closed position must set closed_at and exit_reason".into());
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle_stage != LifecycleStage::Closed
    }
}
