//! Opportunity Finder (C3)
//! Mission: from the latest funding samples, enumerate every directed venue
//! pair and surface the fee-net-profitable ones, ranked.
//! Philosophy: pure function over its inputs -- no I/O, no clock reads beyond
//! the `now` the caller supplies, so it is trivially unit-testable per
//! spec §8 property 4 (opportunity monotonicity) and property 5 (no
//! zero-divergence opportunities).

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

use crate::arbitrage::fees::compute_fee_breakdown;
use crate::models::{FundingRateSample, MarketData, Opportunity, Symbol, VenueId};
use crate::venues::FeeSchedule;

/// Input constraints for one orchestrator tick's scan (spec §4.3).
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub min_profit_per_period: Decimal,
    pub max_oi_usd: Option<Decimal>,
    pub min_oi_usd: Decimal,
    pub min_volume_24h: Decimal,
    pub max_entry_divergence_pct: Decimal,
    pub scan_venues: Vec<VenueId>,
    pub mandatory_venue: Option<VenueId>,
    pub excluded_symbols: Vec<Symbol>,
    pub limit: usize,
}

/// Maximum age a funding sample may have and still be considered (spec §3).
pub const MAX_SAMPLE_AGE: chrono::Duration = chrono::Duration::minutes(2);

struct SymbolVenueRow<'a> {
    venue: &'a VenueId,
    rate: &'a FundingRateSample,
    market: Option<&'a MarketData>,
}

/// Ranks directed venue pairs for every symbol present on at least two
/// scanned venues, per the algorithm in spec §4.3.
pub fn find_opportunities(
    now: NaiveDateTime,
    samples: &[FundingRateSample],
    market_data: &HashMap<(VenueId, Symbol), MarketData>,
    fee_schedules: &HashMap<VenueId, FeeSchedule>,
    filter: &FilterSpec,
) -> Vec<Opportunity> {
    let scanned: HashSet<&VenueId> = filter.scan_venues.iter().collect();
    let excluded: HashSet<&Symbol> = filter.excluded_symbols.iter().collect();

    // Group fresh, in-scope samples by symbol.
    let mut by_symbol: HashMap<&Symbol, Vec<SymbolVenueRow>> = HashMap::new();
    for sample in samples {
        if !scanned.contains(&sample.venue) {
            continue;
        }
        if excluded.contains(&sample.symbol) {
            continue;
        }
        if sample.is_stale(now, MAX_SAMPLE_AGE) {
            continue;
        }
        let market = market_data.get(&(sample.venue.clone(), sample.symbol.clone()));
        by_symbol.entry(&sample.symbol).or_default().push(SymbolVenueRow {
            venue: &sample.venue,
            rate: sample,
            market,
        });
    }

    let mut out = Vec::new();
    for (symbol, rows) in &by_symbol {
        if rows.len() < 2 {
            continue;
        }
        for long_row in rows {
            for short_row in rows {
                if long_row.venue == short_row.venue {
                    continue;
                }
                if let Some(mandatory) = &filter.mandatory_venue {
                    if long_row.venue != mandatory && short_row.venue != mandatory {
                        continue;
                    }
                }

                let divergence = short_row.rate.normalized_rate - long_row.rate.normalized_rate;
                if divergence <= Decimal::ZERO {
                    continue;
                }

                let (Some(long_fees), Some(short_fees)) = (
                    fee_schedules.get(long_row.venue),
                    fee_schedules.get(short_row.venue),
                ) else {
                    continue;
                };
                let fees = compute_fee_breakdown(*long_fees, *short_fees, divergence, true);
                if fees.net_rate < filter.min_profit_per_period {
                    continue;
                }

                let (Some(long_market), Some(short_market)) = (long_row.market, short_row.market)
                else {
                    continue;
                };
                if long_market.is_stale(now) || short_market.is_stale(now) {
                    continue;
                }
                let (Some(long_vol), Some(short_vol)) =
                    (long_market.volume_24h_usd, short_market.volume_24h_usd)
                else {
                    continue;
                };
                let (Some(long_oi), Some(short_oi)) =
                    (long_market.open_interest_usd, short_market.open_interest_usd)
                else {
                    continue;
                };
                let min_vol = long_vol.min(short_vol);
                let min_oi = long_oi.min(short_oi);
                let max_oi = long_oi.max(short_oi);
                if min_vol < filter.min_volume_24h {
                    continue;
                }
                if min_oi < filter.min_oi_usd {
                    continue;
                }
                if let Some(cap) = filter.max_oi_usd {
                    if max_oi > cap {
                        continue;
                    }
                }

                out.push(Opportunity {
                    symbol: (*symbol).clone(),
                    long_venue: long_row.venue.clone(),
                    short_venue: short_row.venue.clone(),
                    long_rate: long_row.rate.normalized_rate,
                    short_rate: short_row.rate.normalized_rate,
                    divergence,
                    fees,
                    net_rate_per_period: fees.net_rate,
                    net_apy: fees.net_apy,
                    min_vol_24h: min_vol,
                    min_oi_usd: min_oi,
                    liquidity_score: min_oi,
                });
            }
        }
    }

    out.sort_by(|a, b| {
        b.net_rate_per_period
            .cmp(&a.net_rate_per_period)
            .then_with(|| b.min_oi_usd.cmp(&a.min_oi_usd))
            .then_with(|| a.symbol.cmp(&b.symbol))
            .then_with(|| a.long_venue.cmp(&b.long_venue))
            .then_with(|| a.short_venue.cmp(&b.short_venue))
    });
    out.truncate(if filter.limit == 0 { out.len() } else { filter.limit });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn sample(venue: &str, symbol: &str, rate: Decimal, at: NaiveDateTime) -> FundingRateSample {
        FundingRateSample::new(venue.into(), symbol.into(), rate, dec!(8), None, at)
    }

    fn market(venue: &str, symbol: &str, vol: Decimal, oi: Decimal, at: NaiveDateTime) -> MarketData {
        MarketData {
            venue: venue.into(),
            symbol: symbol.into(),
            volume_24h_usd: Some(vol),
            open_interest_usd: Some(oi),
            updated_at: at,
        }
    }

    fn fee_schedules() -> HashMap<VenueId, FeeSchedule> {
        let mut m = HashMap::new();
        m.insert("venueA".to_string(), FeeSchedule { maker_bps: dec!(1), taker_bps: dec!(5) });
        m.insert("venueB".to_string(), FeeSchedule { maker_bps: dec!(1), taker_bps: dec!(5) });
        m
    }

    fn default_filter() -> FilterSpec {
        FilterSpec {
            min_profit_per_period: dec!(0.0002),
            max_oi_usd: None,
            min_oi_usd: dec!(0),
            min_volume_24h: dec!(0),
            max_entry_divergence_pct: dec!(0.02),
            scan_venues: vec!["venueA".into(), "venueB".into()],
            mandatory_venue: None,
            excluded_symbols: vec![],
            limit: 10,
        }
    }

    /// Scenario S1 from spec §8.
    #[test]
    fn s1_profitable_pair_found_and_ranked() {
        let samples = vec![
            sample("venueA", "BTC", dec!(0.0006), ts()),
            sample("venueB", "BTC", dec!(-0.0002), ts()),
        ];
        let mut md = HashMap::new();
        md.insert(("venueA".to_string(), "BTC".to_string()), market("venueA", "BTC", dec!(1_000_000), dec!(1_000_000), ts()));
        md.insert(("venueB".to_string(), "BTC".to_string()), market("venueB", "BTC", dec!(1_000_000), dec!(1_000_000), ts()));

        let opps = find_opportunities(ts(), &samples, &md, &fee_schedules(), &default_filter());
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.long_venue, "venueB");
        assert_eq!(opp.short_venue, "venueA");
        assert_eq!(opp.divergence, dec!(0.0008));
        assert_eq!(opp.net_rate_per_period, dec!(0.0004));
        assert_eq!(opp.net_apy, dec!(0.0004) * Decimal::from(1095));
    }

    #[test]
    fn no_zero_or_negative_divergence_opportunities_returned() {
        let samples = vec![
            sample("venueA", "ETH", dec!(0.0001), ts()),
            sample("venueB", "ETH", dec!(0.0001), ts()),
        ];
        let mut md = HashMap::new();
        md.insert(("venueA".to_string(), "ETH".to_string()), market("venueA", "ETH", dec!(1_000_000), dec!(1_000_000), ts()));
        md.insert(("venueB".to_string(), "ETH".to_string()), market("venueB", "ETH", dec!(1_000_000), dec!(1_000_000), ts()));
        let opps = find_opportunities(ts(), &samples, &md, &fee_schedules(), &default_filter());
        assert!(opps.is_empty());
    }

    /// Scenario S4 from spec §8: stale sample excluded.
    #[test]
    fn s4_stale_sample_excluded() {
        let stale_at = ts() - chrono::Duration::minutes(5);
        let samples = vec![
            sample("venueA", "ETH", dec!(0.0006), ts()),
            sample("venueB", "ETH", dec!(-0.0002), stale_at),
        ];
        let mut md = HashMap::new();
        md.insert(("venueA".to_string(), "ETH".to_string()), market("venueA", "ETH", dec!(1_000_000), dec!(1_000_000), ts()));
        md.insert(("venueB".to_string(), "ETH".to_string()), market("venueB", "ETH", dec!(1_000_000), dec!(1_000_000), ts()));
        let opps = find_opportunities(ts(), &samples, &md, &fee_schedules(), &default_filter());
        assert!(opps.is_empty());
    }

    #[test]
    fn mandatory_venue_constraint_requires_one_leg_to_match() {
        let samples = vec![
            sample("venueA", "BTC", dec!(0.0006), ts()),
            sample("venueB", "BTC", dec!(-0.0002), ts()),
        ];
        let mut md = HashMap::new();
        md.insert(("venueA".to_string(), "BTC".to_string()), market("venueA", "BTC", dec!(1_000_000), dec!(1_000_000), ts()));
        md.insert(("venueB".to_string(), "BTC".to_string()), market("venueB", "BTC", dec!(1_000_000), dec!(1_000_000), ts()));
        let mut filter = default_filter();
        filter.mandatory_venue = Some("venueC".to_string());
        let opps = find_opportunities(ts(), &samples, &md, &fee_schedules(), &filter);
        assert!(opps.is_empty());
    }

    #[test]
    fn opportunity_monotonicity_under_tighter_filter() {
        let samples = vec![
            sample("venueA", "BTC", dec!(0.0006), ts()),
            sample("venueB", "BTC", dec!(-0.0002), ts()),
        ];
        let mut md = HashMap::new();
        md.insert(("venueA".to_string(), "BTC".to_string()), market("venueA", "BTC", dec!(1_000_000), dec!(2_000_000), ts()));
        md.insert(("venueB".to_string(), "BTC".to_string()), market("venueB", "BTC", dec!(1_000_000), dec!(2_000_000), ts()));
        let loose = default_filter();
        let wide = find_opportunities(ts(), &samples, &md, &fee_schedules(), &loose);
        assert_eq!(wide.len(), 1);

        let mut tighter = loose.clone();
        tighter.min_oi_usd = dec!(1_500_000);
        let still = find_opportunities(ts(), &samples, &md, &fee_schedules(), &tighter);
        assert_eq!(still.len(), 1);
    }
}
