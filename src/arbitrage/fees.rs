//! Fee Calculator (C4)
//! Mission: deterministic per-pair fee and net-rate arithmetic, no I/O.
//! Philosophy: a pure function over a static fee table; every other
//! component treats its output as ground truth rather than recomputing it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::PERIODS_PER_YEAR;
use crate::venues::FeeSchedule;

/// Round-trip fee and net-rate arithmetic for one directed venue pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub entry_fee: Decimal,
    pub exit_fee: Decimal,
    pub total_fee: Decimal,
    pub total_fee_bps: Decimal,
    pub net_rate: Decimal,
    pub net_apy: Decimal,
    pub is_profitable: bool,
}

/// Computes the round-trip fee for a directed pair and the resulting net
/// rate given `divergence` (per spec: `short_rate - long_rate`, per 8h).
///
/// `use_maker=true` prices both legs' entry and exit at the maker rate;
/// `use_maker=false` substitutes taker rates for all four fills.
pub fn compute_fee_breakdown(
    long: FeeSchedule,
    short: FeeSchedule,
    divergence: Decimal,
    use_maker: bool,
) -> FeeBreakdown {
    let (long_rate, short_rate) = if use_maker {
        (long.maker_bps, short.maker_bps)
    } else {
        (long.taker_bps, short.taker_bps)
    };
    // Entry: one fill per leg. Exit: one fill per leg. Both priced the same way.
    let entry_fee = (long_rate + short_rate) / Decimal::ONE_HUNDRED / Decimal::ONE_HUNDRED;
    let exit_fee = entry_fee;
    let total_fee = entry_fee + exit_fee;
    let total_fee_bps = (long_rate + short_rate) * Decimal::TWO;
    let net_rate = divergence - total_fee;
    let net_apy = net_rate * Decimal::from(PERIODS_PER_YEAR);
    FeeBreakdown {
        entry_fee,
        exit_fee,
        total_fee,
        total_fee_bps,
        net_rate,
        net_apy,
        is_profitable: net_rate > Decimal::ZERO,
    }
}

/// Reporting figures for a sized position held for `holding_periods` 8h
/// periods: gross funding captured, fees paid, net profit, and ROI on the
/// position's notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteProfit {
    pub gross: Decimal,
    pub fees: Decimal,
    pub net: Decimal,
    pub roi: Decimal,
}

pub fn absolute_profit(
    breakdown: &FeeBreakdown,
    divergence: Decimal,
    position_size_usd: Decimal,
    holding_periods: Decimal,
) -> AbsoluteProfit {
    let gross = divergence * holding_periods * position_size_usd;
    let fees = breakdown.total_fee * position_size_usd;
    let net = gross - fees;
    let roi = if position_size_usd.is_zero() {
        Decimal::ZERO
    } else {
        net / position_size_usd
    };
    AbsoluteProfit { gross, fees, net, roi }
}
