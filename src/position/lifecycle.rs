//! Position Lifecycle Manager (C6) -- spec §4.6.
//! Mission: evaluate one open position per orchestrator tick against the
//! fixed priority list of exit triggers, accrue funding, and keep the two
//! legs in sync.
//! Philosophy: first-match-wins over the six checks in spec order; nothing
//! here calls C5 directly -- it returns an `EvaluationAction` and the caller
//! (C7) decides what to do with a close request, so a position evaluation
//! never blocks on two-leg order placement under the per-position
//! concurrency cap (spec §5).
//! Grounded on the teacher's `venues::health::HealthRegistry` for the
//! wide-spread cooldown tracker (same consecutive-bad-tick-with-reset shape
//! applied to a position instead of a venue) and `vault::engine`'s
//! per-account position loop for the overall "fetch both legs, compare,
//! act" structure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Db, PositionPatch};
use crate::errors::CoreResult;
use crate::executor::fill_row;
use crate::models::{ExitReason, LifecycleStage, Position, TradeType, VenueId};
use crate::venues::{PositionSnapshot, Side, VenueAdapter};

/// Maximum age a funding sample may have and still feed the profit-erosion
/// check (same window C3 uses for staleness, spec §3).
const SAMPLE_MAX_AGE: chrono::Duration = chrono::Duration::minutes(2);

/// Relative quantity mismatch between legs that triggers a rebalance (spec
/// §4.6 item 6: "> 1% of target").
const LEG_DRIFT_THRESHOLD_PCT: Decimal = rust_decimal_macros::dec!(0.01);

/// Risk parameters C6 evaluates against, sourced from `StrategyConfig`.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub min_hold_hours: Decimal,
    pub max_position_age_hours: Decimal,
    pub min_liquidation_distance_pct: Decimal,
    pub profit_erosion_threshold: Decimal,
    pub wide_spread_cooldown_minutes: i64,
    /// Spread (as a fraction of mid, e.g. 0.003 = 30bps) beyond which a
    /// leg's BBO counts as "wide" for the cooldown check. Spec §4.6 item 5
    /// says "spread > configured bps" without naming the config key; this is
    /// that key (documented as an Open Question resolution in DESIGN.md).
    pub max_spread_pct: Decimal,
}

/// What C6 decided for one position this tick. The caller (C7) is
/// responsible for acting on `ClosingRequested` via C5; everything else is
/// already persisted by the time this returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationAction {
    /// Min-hold gate active, or a leg's BBO/snapshot was unavailable and the
    /// wide-spread cooldown has not yet elapsed. Heartbeat was still
    /// recorded.
    Deferred,
    /// All checks passed; position remains in `monitoring`. Funding accrual
    /// and heartbeat were recorded.
    Monitoring,
    /// Leg drift exceeded the threshold and a corrective reduce-only order
    /// was placed; position reverts to `monitoring` on the next tick.
    Rebalanced,
    /// `lifecycle_stage` was set to `closing` with this exit reason; the
    /// caller should invoke `TwoLegExecutor::close`.
    ClosingRequested(ExitReason),
}

fn hours_between(now: NaiveDateTime, since: NaiveDateTime) -> Decimal {
    Decimal::from(now.signed_duration_since(since).num_seconds()) / Decimal::from(3600)
}

/// First-bad-tick timestamp per position for the wide-spread/stale cooldown
/// (spec §4.6 item 5, §9 Open Question 3). Policy chosen here: the cooldown
/// timer starts the first tick a leg's BBO is wide or unavailable, and
/// resets to "clear" the moment a single good BBO is observed on both legs
/// -- it does not require N consecutive good samples to reset. This is the
/// simplest policy consistent with the spec's wording and mirrors
/// `VenueHealth`'s consecutive-failure reset-on-success behavior.
#[derive(Debug, Default)]
struct WideSpreadTracker {
    bad_since: Mutex<HashMap<Uuid, NaiveDateTime>>,
}

impl WideSpreadTracker {
    fn mark_bad(&self, position_id: Uuid, now: NaiveDateTime) -> NaiveDateTime {
        *self.bad_since.lock().entry(position_id).or_insert(now)
    }

    fn clear(&self, position_id: Uuid) {
        self.bad_since.lock().remove(&position_id);
    }
}

pub struct LifecycleManager {
    adapters: HashMap<VenueId, Arc<dyn VenueAdapter>>,
    db: Arc<Db>,
    config: RiskConfig,
    wide_spread: WideSpreadTracker,
}

impl LifecycleManager {
    pub fn new(adapters: HashMap<VenueId, Arc<dyn VenueAdapter>>, db: Arc<Db>, config: RiskConfig) -> Self {
        Self { adapters, db, config, wide_spread: WideSpreadTracker::default() }
    }

    fn adapter(&self, venue: &VenueId) -> CoreResult<&Arc<dyn VenueAdapter>> {
        self.adapters.get(venue).ok_or_else(|| {
            crate::errors::CoreError::Invariant(format!("no adapter registered for venue {venue}"))
        })
    }

    async fn heartbeat(&self, position_id: Uuid, now: NaiveDateTime) -> CoreResult<()> {
        self.db
            .update_position(position_id, PositionPatch { last_heartbeat: Some(now), ..Default::default() })
            .await
    }

    /// Evaluates one open position against the six checks in spec §4.6, in
    /// order, first-match-wins. Writes `last_heartbeat` every call; writes
    /// `cumulative_funding_usd` whenever both legs' snapshots were
    /// reachable; writes `lifecycle_stage`/`exit_reason` only when
    /// transitioning to `closing`.
    pub async fn evaluate(&self, position: &Position, now: NaiveDateTime) -> CoreResult<EvaluationAction> {
        let age_hours = hours_between(now, position.opened_at);

        // 1. Max-age check.
        if age_hours > self.config.max_position_age_hours {
            return self.request_close(position, ExitReason::MaxAge, now).await;
        }

        // 2. Min-hold gate: skip every remaining risk check.
        if age_hours < self.config.min_hold_hours {
            self.heartbeat(position.position_id, now).await?;
            return Ok(EvaluationAction::Deferred);
        }

        let long_adapter = self.adapter(&position.long_venue)?.clone();
        let short_adapter = self.adapter(&position.short_venue)?.clone();

        let (long_snap, short_snap) = tokio::join!(
            long_adapter.get_position_snapshot(&position.symbol),
            short_adapter.get_position_snapshot(&position.symbol),
        );
        let long_snap = long_snap.ok().flatten();
        let short_snap = short_snap.ok().flatten();

        // Funding accrual (spec §4.6 "Funding accrual"): a fresh read
        // replaces the stored total since `PositionSnapshot.funding_accrued`
        // is life-to-date, not a per-tick delta.
        if let (Some(l), Some(s)) = (&long_snap, &short_snap) {
            let cumulative_funding_usd = l.funding_accrued + s.funding_accrued;
            self.db
                .update_position(
                    position.position_id,
                    PositionPatch { cumulative_funding_usd: Some(cumulative_funding_usd), ..Default::default() },
                )
                .await?;
        }

        // 3. Liquidation proximity.
        if let Some(action) = self.check_liquidation_proximity(position, &long_snap, &short_snap, now).await? {
            return Ok(action);
        }

        // 4. Profit erosion.
        if let Some(action) = self.check_profit_erosion(position, now).await? {
            return Ok(action);
        }

        // 5. Wide-spread / data-stale cooldown.
        let (long_bbo, short_bbo) =
            tokio::join!(long_adapter.fetch_bbo(&position.symbol), short_adapter.fetch_bbo(&position.symbol));
        let spread_ok = match (long_bbo, short_bbo) {
            (Ok(l), Ok(s)) => self.spread_within_bounds(l.best_bid, l.best_ask) && self.spread_within_bounds(s.best_bid, s.best_ask),
            _ => false,
        };
        if !spread_ok {
            let bad_since = self.wide_spread.mark_bad(position.position_id, now);
            let minutes_bad = now.signed_duration_since(bad_since).num_minutes();
            if minutes_bad >= self.config.wide_spread_cooldown_minutes {
                return self.request_close(position, ExitReason::PersistentWideSpread, now).await;
            }
            self.heartbeat(position.position_id, now).await?;
            return Ok(EvaluationAction::Deferred);
        }
        self.wide_spread.clear(position.position_id);

        // 6. Leg drift / rebalance.
        if let (Some(l), Some(s)) = (&long_snap, &short_snap) {
            if let Some(action) = self.maybe_rebalance(position, l, s, now).await? {
                return Ok(action);
            }
        }

        self.heartbeat(position.position_id, now).await?;
        Ok(EvaluationAction::Monitoring)
    }

    fn spread_within_bounds(&self, bid: Decimal, ask: Decimal) -> bool {
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO || ask < bid {
            return false;
        }
        let mid = (bid + ask) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            return false;
        }
        (ask - bid) / mid <= self.config.max_spread_pct
    }

    async fn check_liquidation_proximity(
        &self,
        position: &Position,
        long_snap: &Option<PositionSnapshot>,
        short_snap: &Option<PositionSnapshot>,
        now: NaiveDateTime,
    ) -> CoreResult<Option<EvaluationAction>> {
        for snap in [long_snap, short_snap].into_iter().flatten() {
            if snap.mark_price <= Decimal::ZERO {
                continue;
            }
            let distance_pct = (snap.mark_price - snap.liquidation_price).abs() / snap.mark_price;
            if distance_pct < self.config.min_liquidation_distance_pct {
                let action = self.request_close(position, ExitReason::LiquidationRisk, now).await?;
                return Ok(Some(action));
            }
        }
        Ok(None)
    }

    /// Current directed divergence uses the same formula as C3
    /// (`short_rate - long_rate`), read from the latest persisted samples
    /// rather than a fresh adapter fetch -- C6 evaluates against the same
    /// ground truth C3 ranked against this tick.
    async fn check_profit_erosion(
        &self,
        position: &Position,
        now: NaiveDateTime,
    ) -> CoreResult<Option<EvaluationAction>> {
        if position.entry_divergence == Decimal::ZERO {
            return Ok(None);
        }
        let venues = vec![position.long_venue.clone(), position.short_venue.clone()];
        let samples = self.db.get_latest_samples(venues, SAMPLE_MAX_AGE, now).await?;
        let long_rate = samples
            .iter()
            .find(|s| s.venue == position.long_venue && s.symbol == position.symbol)
            .map(|s| s.normalized_rate);
        let short_rate = samples
            .iter()
            .find(|s| s.venue == position.short_venue && s.symbol == position.symbol)
            .map(|s| s.normalized_rate);
        let (Some(long_rate), Some(short_rate)) = (long_rate, short_rate) else {
            // Stale/missing samples defer the check rather than erroring
            // (spec §7 "Data staleness").
            return Ok(None);
        };
        let current_divergence = short_rate - long_rate;
        let erosion_ratio = (position.entry_divergence - current_divergence) / position.entry_divergence;
        if erosion_ratio >= self.config.profit_erosion_threshold {
            let action = self.request_close(position, ExitReason::ProfitErosion, now).await?;
            return Ok(Some(action));
        }
        Ok(None)
    }

    /// Trims the larger leg down with a reduce-only order so both legs
    /// match within the drift threshold again. A resting-size mismatch
    /// between two independently-filled legs can only be corrected by
    /// reducing the larger one -- reduce-only cannot add to either leg by
    /// definition, so "top-up" in spec §4.6 item 6 reads here as "bring the
    /// larger leg down to the smaller leg's size" (documented in
    /// DESIGN.md).
    async fn maybe_rebalance(
        &self,
        position: &Position,
        long_snap: &PositionSnapshot,
        short_snap: &PositionSnapshot,
        now: NaiveDateTime,
    ) -> CoreResult<Option<EvaluationAction>> {
        let larger = long_snap.quantity.max(short_snap.quantity);
        if larger <= Decimal::ZERO {
            return Ok(None);
        }
        let diff = (long_snap.quantity - short_snap.quantity).abs();
        if diff / larger <= LEG_DRIFT_THRESHOLD_PCT {
            return Ok(None);
        }

        self.db
            .update_position(
                position.position_id,
                PositionPatch { lifecycle_stage: Some(LifecycleStage::Rebalancing), last_heartbeat: Some(now), ..Default::default() },
            )
            .await?;

        let (venue, snap, side, entry_price) = if long_snap.quantity > short_snap.quantity {
            (&position.long_venue, long_snap, Side::Sell, position.entry_long_price)
        } else {
            (&position.short_venue, short_snap, Side::Buy, position.entry_short_price)
        };
        let adapter = self.adapter(venue)?.clone();
        let placed = adapter.place_market(&position.symbol, side, diff, true).await?;
        let info = adapter
            .await_order_update(&placed.order_id, std::time::Duration::from_secs(10))
            .await?
            .unwrap_or(crate::venues::OrderInfo {
                order_id: placed.order_id,
                symbol: position.symbol.clone(),
                side,
                status: placed.status,
                filled_quantity: placed.filled_quantity,
                avg_fill_price: placed.avg_fill_price,
                fee_paid: Decimal::ZERO,
                fee_currency: String::new(),
                updated_at: now,
            });

        if info.filled_quantity > Decimal::ZERO {
            let exit_price = info.avg_fill_price.unwrap_or(entry_price);
            let realized_pnl = match side {
                Side::Sell => (exit_price - entry_price) * info.filled_quantity,
                Side::Buy => (entry_price - exit_price) * info.filled_quantity,
            };
            let mut row = fill_row(position.position_id, &position.account_id, venue, &position.symbol, &info, entry_price, TradeType::Exit, now);
            row.realized_pnl = Some(realized_pnl);
            self.db.insert_trade_fill(row).await?;
        }

        info!(position_id = %position.position_id, venue = %venue, diff = %diff, "rebalanced leg drift");
        self.db
            .update_position(
                position.position_id,
                PositionPatch { lifecycle_stage: Some(LifecycleStage::Monitoring), last_heartbeat: Some(now), ..Default::default() },
            )
            .await?;
        Ok(Some(EvaluationAction::Rebalanced))
    }

    async fn request_close(
        &self,
        position: &Position,
        reason: ExitReason,
        now: NaiveDateTime,
    ) -> CoreResult<EvaluationAction> {
        if position.lifecycle_stage == LifecycleStage::Closing {
            self.heartbeat(position.position_id, now).await?;
            return Ok(EvaluationAction::ClosingRequested(reason));
        }
        warn!(position_id = %position.position_id, exit_reason = ?reason, "position moving to closing");
        self.db
            .update_position(
                position.position_id,
                PositionPatch {
                    lifecycle_stage: Some(LifecycleStage::Closing),
                    exit_reason: Some(reason),
                    last_heartbeat: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(EvaluationAction::ClosingRequested(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoreResult as Result;
    use crate::models::{FundingRateSample, MarketData, Symbol};
    use crate::venues::{Bbo, FeeSchedule, OrderBook, OrderInfo, OrderResult, OrderStatus};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn ts(hour: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap() + chrono::Duration::hours(hour)
    }

    fn default_config() -> RiskConfig {
        RiskConfig {
            min_hold_hours: dec!(1),
            max_position_age_hours: dec!(12),
            min_liquidation_distance_pct: dec!(0.10),
            profit_erosion_threshold: dec!(0.4),
            wide_spread_cooldown_minutes: 60,
            max_spread_pct: dec!(0.01),
        }
    }

    struct ScriptedAdapter {
        venue: VenueId,
        bbo: Bbo,
        snapshot: Option<PositionSnapshot>,
    }

    #[async_trait]
    impl VenueAdapter for ScriptedAdapter {
        fn venue_id(&self) -> &VenueId {
            &self.venue
        }
        fn fee_schedule(&self) -> FeeSchedule {
            FeeSchedule { maker_bps: dec!(1), taker_bps: dec!(5) }
        }
        fn normalize_symbol(&self, s: &str) -> Symbol {
            s.to_string()
        }
        fn denormalize(&self, s: &Symbol) -> String {
            s.clone()
        }
        async fn fetch_funding_rates(&self) -> Result<HashMap<Symbol, FundingRateSample>> {
            unimplemented!()
        }
        async fn fetch_market_data(&self) -> Result<HashMap<Symbol, MarketData>> {
            unimplemented!()
        }
        async fn fetch_bbo(&self, _symbol: &Symbol) -> Result<Bbo> {
            Ok(self.bbo)
        }
        async fn fetch_order_book(&self, _symbol: &Symbol, _depth: usize) -> Result<OrderBook> {
            unimplemented!()
        }
        async fn get_position_snapshot(&self, _symbol: &Symbol) -> Result<Option<PositionSnapshot>> {
            Ok(self.snapshot.clone())
        }
        async fn place_limit(
            &self, _s: &Symbol, _side: Side, _qty: Decimal, _price: Decimal, _post_only: bool, _reduce_only: bool,
        ) -> Result<OrderResult> {
            unimplemented!()
        }
        async fn place_market(&self, _s: &Symbol, side: Side, qty: Decimal, _reduce_only: bool) -> Result<OrderResult> {
            Ok(OrderResult { order_id: "reb".into(), status: OrderStatus::Filled, filled_quantity: qty, avg_fill_price: Some(match side { Side::Buy => self.bbo.best_ask, Side::Sell => self.bbo.best_bid }) })
        }
        async fn cancel(&self, order_id: &str) -> Result<OrderResult> {
            Ok(OrderResult { order_id: order_id.into(), status: OrderStatus::Cancelled, filled_quantity: Decimal::ZERO, avg_fill_price: None })
        }
        async fn get_order_info(&self, _order_id: &str, _force_refresh: bool) -> Result<Option<OrderInfo>> {
            unimplemented!()
        }
        async fn await_order_update(&self, _order_id: &str, _timeout: Duration) -> Result<Option<OrderInfo>> {
            Ok(None)
        }
        async fn set_leverage(&self, _symbol: &Symbol, _leverage: Decimal) -> Result<bool> {
            Ok(true)
        }
        async fn min_order_notional(&self, _symbol: &Symbol) -> Result<Option<Decimal>> {
            Ok(None)
        }
        async fn order_size_increment(&self, _symbol: &Symbol) -> Result<Decimal> {
            Ok(dec!(0.0001))
        }
    }

    fn position(opened_at: NaiveDateTime, entry_divergence: Decimal) -> Position {
        Position {
            position_id: Uuid::new_v4(),
            account_id: "acct1".into(),
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            size_usd: dec!(300),
            entry_long_rate: dec!(0.0001),
            entry_short_rate: dec!(-0.0007),
            entry_divergence,
            entry_long_price: dec!(100),
            entry_short_price: dec!(100),
            opened_at,
            cumulative_funding_usd: Decimal::ZERO,
            last_heartbeat: opened_at,
            lifecycle_stage: LifecycleStage::Monitoring,
            closed_at: None,
            pnl_usd: None,
            exit_reason: None,
            close_degraded: false,
        }
    }

    fn manager(
        long_snap: Option<PositionSnapshot>,
        short_snap: Option<PositionSnapshot>,
        bbo: Bbo,
        db: Arc<Db>,
        config: RiskConfig,
    ) -> LifecycleManager {
        let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert("aster".into(), Arc::new(ScriptedAdapter { venue: "aster".into(), bbo, snapshot: long_snap }));
        adapters.insert("lighter".into(), Arc::new(ScriptedAdapter { venue: "lighter".into(), bbo, snapshot: short_snap }));
        LifecycleManager::new(adapters, db, config)
    }

    fn healthy_snapshot(side: Side) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTC".into(),
            side,
            quantity: dec!(1),
            entry_price: dec!(100),
            mark_price: dec!(100),
            leverage: dec!(3),
            liquidation_price: dec!(50),
            unrealized_pnl: Decimal::ZERO,
            funding_accrued: dec!(0.05),
        }
    }

    /// Property 9 / spec §4.6 item 2: min-hold gate defers every risk check.
    #[tokio::test]
    async fn min_hold_gate_defers_before_any_risk_check_runs() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        let mgr = manager(None, None, Bbo { best_bid: dec!(1), best_ask: dec!(2) }, db, default_config());
        let action = mgr.evaluate(&pos, ts(0) + chrono::Duration::minutes(30)).await.unwrap();
        assert_eq!(action, EvaluationAction::Deferred);
    }

    /// Spec §6 scenario S6: force close past max age regardless of other state.
    #[tokio::test]
    async fn s6_max_age_forces_close_even_with_healthy_snapshots() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        let mgr = manager(
            Some(healthy_snapshot(Side::Buy)),
            Some(healthy_snapshot(Side::Sell)),
            Bbo { best_bid: dec!(100), best_ask: dec!(100.01) },
            db,
            default_config(),
        );
        let action = mgr.evaluate(&pos, ts(0) + chrono::Duration::hours(13)).await.unwrap();
        assert_eq!(action, EvaluationAction::ClosingRequested(ExitReason::MaxAge));
    }

    #[tokio::test]
    async fn liquidation_proximity_triggers_close() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        let mut risky = healthy_snapshot(Side::Buy);
        risky.mark_price = dec!(101);
        risky.liquidation_price = dec!(95); // (101-95)/101 ~= 5.9% < 10% threshold
        let mgr = manager(
            Some(risky),
            Some(healthy_snapshot(Side::Sell)),
            Bbo { best_bid: dec!(100), best_ask: dec!(100.01) },
            db,
            default_config(),
        );
        let action = mgr.evaluate(&pos, ts(2)).await.unwrap();
        assert_eq!(action, EvaluationAction::ClosingRequested(ExitReason::LiquidationRisk));
    }

    /// Spec §8 scenario S1's erosion arithmetic: entry divergence 0.0008,
    /// current divergence 0.0001 => erosion_ratio 0.875 > 0.4 threshold.
    #[tokio::test]
    async fn s1_profit_erosion_closes_when_ratio_exceeds_threshold() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        db.upsert_funding_rate(FundingRateSample::new("aster".into(), "BTC".into(), dec!(0.0001), dec!(8), None, ts(2)))
            .await
            .unwrap();
        db.upsert_funding_rate(FundingRateSample::new("lighter".into(), "BTC".into(), dec!(0.0000), dec!(8), None, ts(2)))
            .await
            .unwrap();
        let mgr = manager(
            Some(healthy_snapshot(Side::Buy)),
            Some(healthy_snapshot(Side::Sell)),
            Bbo { best_bid: dec!(100), best_ask: dec!(100.01) },
            db,
            default_config(),
        );
        let action = mgr.evaluate(&pos, ts(2)).await.unwrap();
        assert_eq!(action, EvaluationAction::ClosingRequested(ExitReason::ProfitErosion));
    }

    #[tokio::test]
    async fn wide_spread_defers_until_cooldown_elapses_then_closes() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        db.upsert_funding_rate(FundingRateSample::new("aster".into(), "BTC".into(), dec!(0.0001), dec!(8), None, ts(2)))
            .await
            .unwrap();
        db.upsert_funding_rate(FundingRateSample::new("lighter".into(), "BTC".into(), dec!(-0.0007), dec!(8), None, ts(2)))
            .await
            .unwrap();
        let mut config = default_config();
        config.wide_spread_cooldown_minutes = 10;
        // 10% wide spread vs 1% max_spread_pct -- always "bad".
        let mgr = manager(
            Some(healthy_snapshot(Side::Buy)),
            Some(healthy_snapshot(Side::Sell)),
            Bbo { best_bid: dec!(90), best_ask: dec!(100) },
            db,
            config,
        );
        let first = mgr.evaluate(&pos, ts(2)).await.unwrap();
        assert_eq!(first, EvaluationAction::Deferred);
        let second = mgr.evaluate(&pos, ts(2) + chrono::Duration::minutes(11)).await.unwrap();
        assert_eq!(second, EvaluationAction::ClosingRequested(ExitReason::PersistentWideSpread));
    }

    #[tokio::test]
    async fn leg_drift_beyond_one_percent_triggers_rebalance() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        db.upsert_funding_rate(FundingRateSample::new("aster".into(), "BTC".into(), dec!(0.0001), dec!(8), None, ts(2)))
            .await
            .unwrap();
        db.upsert_funding_rate(FundingRateSample::new("lighter".into(), "BTC".into(), dec!(-0.0007), dec!(8), None, ts(2)))
            .await
            .unwrap();
        let mut long_snap = healthy_snapshot(Side::Buy);
        long_snap.quantity = dec!(1.05);
        let short_snap = healthy_snapshot(Side::Sell);
        let mgr = manager(
            Some(long_snap),
            Some(short_snap),
            Bbo { best_bid: dec!(100), best_ask: dec!(100.01) },
            db,
            default_config(),
        );
        let action = mgr.evaluate(&pos, ts(2)).await.unwrap();
        assert_eq!(action, EvaluationAction::Rebalanced);
    }

    #[tokio::test]
    async fn clean_position_stays_in_monitoring() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let pos = position(ts(0), dec!(0.0008));
        db.insert_position(pos.clone()).await.unwrap();
        db.upsert_funding_rate(FundingRateSample::new("aster".into(), "BTC".into(), dec!(0.0001), dec!(8), None, ts(2)))
            .await
            .unwrap();
        db.upsert_funding_rate(FundingRateSample::new("lighter".into(), "BTC".into(), dec!(-0.0007), dec!(8), None, ts(2)))
            .await
            .unwrap();
        let mgr = manager(
            Some(healthy_snapshot(Side::Buy)),
            Some(healthy_snapshot(Side::Sell)),
            Bbo { best_bid: dec!(100), best_ask: dec!(100.01) },
            db,
            default_config(),
        );
        let action = mgr.evaluate(&pos, ts(2)).await.unwrap();
        assert_eq!(action, EvaluationAction::Monitoring);

        let reloaded = mgr.db.get_position(pos.position_id).await.unwrap().unwrap();
        assert_eq!(reloaded.cumulative_funding_usd, dec!(0.1));
    }
}
