//! `TwoLegExecutor::open` -- spec §4.5 "open".

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use super::{fill_row, relative_divergence, round_down_to_increment, OpenParams, TwoLegExecutor};
use crate::errors::{CoreError, CoreResult};
use crate::models::{LifecycleStage, Opportunity, Position, TradeType};
use crate::venues::{OrderInfo, OrderStatus, Side, VenueAdapter};

/// Maximum relative quantity mismatch tolerated between partially-filled legs
/// before a position is still opened at the realized (smaller) quantity.
const PARTIAL_FILL_MATCH_TOLERANCE: Decimal = dec!(0.01);

/// Places one leg as a post-only limit order and waits (bounded) for a
/// terminal state. On timeout, falls back to the last known snapshot from
/// `place_limit` rather than blocking forever.
async fn submit_leg(
    adapter: &dyn VenueAdapter,
    symbol: &str,
    side: Side,
    qty: Decimal,
    price: Decimal,
    timeout: std::time::Duration,
    now: NaiveDateTime,
) -> CoreResult<OrderInfo> {
    let placed = adapter.place_limit(&symbol.to_string(), side, qty, price, true, false).await?;
    if placed.status == OrderStatus::Rejected {
        return Ok(OrderInfo {
            order_id: placed.order_id,
            symbol: symbol.to_string(),
            side,
            status: OrderStatus::Rejected,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee_paid: Decimal::ZERO,
            fee_currency: String::new(),
            updated_at: now,
        });
    }
    match adapter.await_order_update(&placed.order_id, timeout).await? {
        Some(info) => Ok(info),
        None => Ok(OrderInfo {
            order_id: placed.order_id,
            symbol: symbol.to_string(),
            side,
            status: placed.status,
            filled_quantity: placed.filled_quantity,
            avg_fill_price: placed.avg_fill_price,
            fee_paid: Decimal::ZERO,
            fee_currency: String::new(),
            updated_at: now,
        }),
    }
}

impl TwoLegExecutor {
    /// Pre-flight + execution for one atomic two-leg entry (spec §4.5).
    pub async fn open(
        &self,
        opportunity: &Opportunity,
        params: OpenParams,
        now: NaiveDateTime,
    ) -> CoreResult<Position> {
        let long_adapter = self.adapter(&opportunity.long_venue)?.clone();
        let short_adapter = self.adapter(&opportunity.short_venue)?.clone();
        let symbol = opportunity.symbol.clone();

        // 1. BBOs in parallel.
        let (long_bbo, short_bbo) =
            tokio::join!(long_adapter.fetch_bbo(&symbol), short_adapter.fetch_bbo(&symbol));
        let long_bbo = long_bbo?;
        let short_bbo = short_bbo?;

        // 2. Price divergence guard.
        let mid_long = long_bbo.mid();
        let mid_short = short_bbo.mid();
        let divergence_pct = relative_divergence(mid_long, mid_short).ok_or_else(|| {
            CoreError::PriceUnavailable {
                venue: opportunity.long_venue.clone(),
                symbol: symbol.clone(),
                reason: "non-positive mid price".to_string(),
            }
        })?;
        if divergence_pct > params.max_entry_price_divergence_pct {
            return Err(CoreError::DivergenceTooWide {
                actual_pct: divergence_pct,
                max_pct: params.max_entry_price_divergence_pct,
            });
        }

        // 3. Size: same canonical quantity on both legs (the smaller rounded value).
        let notional = params.target_margin_usd * params.leverage;
        let long_incr = long_adapter.order_size_increment(&symbol).await?;
        let short_incr = short_adapter.order_size_increment(&symbol).await?;
        let qty_long = round_down_to_increment(notional / mid_long, long_incr);
        let qty_short = round_down_to_increment(notional / mid_short, short_incr);
        let qty = qty_long.min(qty_short);

        // 4. Min notional on both legs.
        if let Some(min) = long_adapter.min_order_notional(&symbol).await? {
            let leg_notional = qty * mid_long;
            if qty <= Decimal::ZERO || leg_notional < min {
                return Err(CoreError::BelowMinNotional {
                    venue: opportunity.long_venue.clone(),
                    notional: leg_notional,
                    minimum: min,
                });
            }
        }
        if let Some(min) = short_adapter.min_order_notional(&symbol).await? {
            let leg_notional = qty * mid_short;
            if qty <= Decimal::ZERO || leg_notional < min {
                return Err(CoreError::BelowMinNotional {
                    venue: opportunity.short_venue.clone(),
                    notional: leg_notional,
                    minimum: min,
                });
            }
        }

        // 5. Leverage.
        long_adapter.set_leverage(&symbol, params.leverage).await?;
        short_adapter.set_leverage(&symbol, params.leverage).await?;

        // 6/7. Place both legs concurrently as post-only limit orders.
        let offset = params.limit_order_offset_pct;
        let long_price = long_bbo.best_bid * (Decimal::ONE - offset);
        let short_price = short_bbo.best_ask * (Decimal::ONE + offset);

        let (long_info, short_info) = tokio::join!(
            submit_leg(long_adapter.as_ref(), &symbol, Side::Buy, qty, long_price, params.order_timeout, now),
            submit_leg(short_adapter.as_ref(), &symbol, Side::Sell, qty, short_price, params.order_timeout, now),
        );
        let mut long_info = long_info?;
        let mut short_info = short_info?;

        // Both post-only-rejected: retry once at the refreshed BBO.
        if long_info.status == OrderStatus::Rejected && short_info.status == OrderStatus::Rejected {
            let (long_bbo2, short_bbo2) =
                tokio::join!(long_adapter.fetch_bbo(&symbol), short_adapter.fetch_bbo(&symbol));
            let long_bbo2 = long_bbo2?;
            let short_bbo2 = short_bbo2?;
            let long_price2 = long_bbo2.best_bid * (Decimal::ONE - offset);
            let short_price2 = short_bbo2.best_ask * (Decimal::ONE + offset);
            let (retry_long, retry_short) = tokio::join!(
                submit_leg(long_adapter.as_ref(), &symbol, Side::Buy, qty, long_price2, params.order_timeout, now),
                submit_leg(short_adapter.as_ref(), &symbol, Side::Sell, qty, short_price2, params.order_timeout, now),
            );
            long_info = retry_long?;
            short_info = retry_short?;
            if long_info.status == OrderStatus::Rejected && short_info.status == OrderStatus::Rejected {
                return Err(CoreError::PostOnlyCrossed { venue: opportunity.long_venue.clone() });
            }
        }

        self.resolve_open_outcome(opportunity, qty, mid_long, mid_short, long_info, short_info, &params, now)
            .await
    }

    async fn resolve_open_outcome(
        &self,
        opportunity: &Opportunity,
        qty: Decimal,
        mid_long: Decimal,
        mid_short: Decimal,
        long_info: OrderInfo,
        short_info: OrderInfo,
        params: &OpenParams,
        now: NaiveDateTime,
    ) -> CoreResult<Position> {
        let long_adapter = self.adapter(&opportunity.long_venue)?.clone();
        let short_adapter = self.adapter(&opportunity.short_venue)?.clone();
        let symbol = opportunity.symbol.clone();

        let long_full = long_info.status == OrderStatus::Filled && long_info.filled_quantity >= qty;
        let short_full = short_info.status == OrderStatus::Filled && short_info.filled_quantity >= qty;

        if long_full && short_full {
            return self
                .finalize_opened_position(opportunity, params.account_id.clone(), qty, mid_long, mid_short, long_info, short_info, now)
                .await;
        }

        let long_partial = long_info.filled_quantity > Decimal::ZERO;
        let short_partial = short_info.filled_quantity > Decimal::ZERO;

        // Both sides partially filled: open at the realized quantity if they
        // match closely enough and both clear min notional; else roll back.
        if long_partial && short_partial && !long_full && !short_full {
            let qty_match = relative_divergence(long_info.filled_quantity, short_info.filled_quantity)
                .map(|d| d <= PARTIAL_FILL_MATCH_TOLERANCE)
                .unwrap_or(false);
            if qty_match {
                let realized_qty = long_info.filled_quantity.min(short_info.filled_quantity);
                let _ = long_adapter.cancel(&long_info.order_id).await;
                let _ = short_adapter.cancel(&short_info.order_id).await;
                return self
                    .finalize_opened_position(opportunity, params.account_id.clone(), realized_qty, mid_long, mid_short, long_info, short_info, now)
                    .await;
            }
        }

        // Exactly one filled (or neither), or partials that don't match:
        // cancel whatever is still resting and flatten any filled quantity.
        self.rollback_open(opportunity, params.account_id.clone(), mid_long, mid_short, long_info, short_info, now)
            .await?;
        Err(CoreError::PartialEntryRolledBack { symbol })
    }

    async fn finalize_opened_position(
        &self,
        opportunity: &Opportunity,
        account_id: String,
        qty: Decimal,
        mid_long: Decimal,
        mid_short: Decimal,
        long_info: OrderInfo,
        short_info: OrderInfo,
        now: NaiveDateTime,
    ) -> CoreResult<Position> {
        let position = Position {
            position_id: Uuid::new_v4(),
            account_id: account_id.clone(),
            symbol: opportunity.symbol.clone(),
            long_venue: opportunity.long_venue.clone(),
            short_venue: opportunity.short_venue.clone(),
            size_usd: qty * mid_long,
            entry_long_rate: opportunity.long_rate,
            entry_short_rate: opportunity.short_rate,
            entry_divergence: opportunity.divergence,
            entry_long_price: long_info.avg_fill_price.unwrap_or(mid_long),
            entry_short_price: short_info.avg_fill_price.unwrap_or(mid_short),
            opened_at: now,
            cumulative_funding_usd: Decimal::ZERO,
            last_heartbeat: now,
            lifecycle_stage: LifecycleStage::Monitoring,
            closed_at: None,
            pnl_usd: None,
            exit_reason: None,
            close_degraded: false,
        };
        let id = self.db.insert_position(position.clone()).await?;
        debug_assert_eq!(id, position.position_id);

        let long_fill = fill_row(position.position_id, &account_id, &opportunity.long_venue, &opportunity.symbol, &long_info, mid_long, TradeType::Entry, now);
        let short_fill = fill_row(position.position_id, &account_id, &opportunity.short_venue, &opportunity.symbol, &short_info, mid_short, TradeType::Entry, now);
        self.db.insert_trade_fill(long_fill).await?;
        self.db.insert_trade_fill(short_fill).await?;

        Ok(position)
    }

    /// No Position is created; whatever quantity filled on either leg is
    /// flattened with an emergency reduce-only market order, restoring zero
    /// net exposure (spec §4.5 invariant).
    async fn rollback_open(
        &self,
        opportunity: &Opportunity,
        account_id: String,
        mid_long: Decimal,
        mid_short: Decimal,
        long_info: OrderInfo,
        short_info: OrderInfo,
        now: NaiveDateTime,
    ) -> CoreResult<()> {
        let long_adapter = self.adapter(&opportunity.long_venue)?.clone();
        let short_adapter = self.adapter(&opportunity.short_venue)?.clone();
        let placeholder_position_id = Uuid::nil();

        if !long_info.status.is_terminal() {
            let _ = long_adapter.cancel(&long_info.order_id).await;
        }
        if !short_info.status.is_terminal() {
            let _ = short_adapter.cancel(&short_info.order_id).await;
        }

        if long_info.filled_quantity > Decimal::ZERO {
            let entry_fill = fill_row(placeholder_position_id, &account_id, &opportunity.long_venue, &opportunity.symbol, &long_info, mid_long, TradeType::Entry, now);
            self.db.insert_trade_fill(entry_fill).await?;
            let reversal = long_adapter
                .place_market(&opportunity.symbol, Side::Sell, long_info.filled_quantity, true)
                .await?;
            let reversal_info = OrderInfo {
                order_id: reversal.order_id,
                symbol: opportunity.symbol.clone(),
                side: Side::Sell,
                status: reversal.status,
                filled_quantity: reversal.filled_quantity,
                avg_fill_price: reversal.avg_fill_price,
                fee_paid: Decimal::ZERO,
                fee_currency: String::new(),
                updated_at: now,
            };
            let reversal_fill = fill_row(placeholder_position_id, &account_id, &opportunity.long_venue, &opportunity.symbol, &reversal_info, mid_long, TradeType::Entry, now);
            self.db.insert_trade_fill(reversal_fill).await?;
        }

        if short_info.filled_quantity > Decimal::ZERO {
            let entry_fill = fill_row(placeholder_position_id, &account_id, &opportunity.short_venue, &opportunity.symbol, &short_info, mid_short, TradeType::Entry, now);
            self.db.insert_trade_fill(entry_fill).await?;
            let reversal = short_adapter
                .place_market(&opportunity.symbol, Side::Buy, short_info.filled_quantity, true)
                .await?;
            let reversal_info = OrderInfo {
                order_id: reversal.order_id,
                symbol: opportunity.symbol.clone(),
                side: Side::Buy,
                status: reversal.status,
                filled_quantity: reversal.filled_quantity,
                avg_fill_price: reversal.avg_fill_price,
                fee_paid: Decimal::ZERO,
                fee_currency: String::new(),
                updated_at: now,
            };
            let reversal_fill = fill_row(placeholder_position_id, &account_id, &opportunity.short_venue, &opportunity.symbol, &reversal_info, mid_short, TradeType::Entry, now);
            self.db.insert_trade_fill(reversal_fill).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::fees::FeeBreakdown;
    use crate::db::Db;
    use crate::models::{MarketData, Symbol, VenueId};
    use crate::venues::{Bbo, FeeSchedule, OrderBook, PositionSnapshot};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn opportunity(long_venue: &str, short_venue: &str) -> Opportunity {
        Opportunity {
            symbol: "BTC".into(),
            long_venue: long_venue.into(),
            short_venue: short_venue.into(),
            long_rate: dec!(0.0001),
            short_rate: dec!(-0.0003),
            divergence: dec!(0.0004),
            fees: FeeBreakdown {
                entry_fee: dec!(0.00005),
                exit_fee: dec!(0.00005),
                total_fee: dec!(0.0001),
                total_fee_bps: dec!(1),
                net_rate: dec!(0.0003),
                net_apy: dec!(0.3285),
                is_profitable: true,
            },
            net_rate_per_period: dec!(0.0003),
            net_apy: dec!(0.3285),
            min_vol_24h: dec!(1_000_000),
            min_oi_usd: dec!(1_000_000),
            liquidity_score: dec!(1_000_000),
        }
    }

    /// A venue adapter whose BBO and order-placement outcomes are fixed at
    /// construction, for exercising one branch of `open` per test.
    struct ScriptedAdapter {
        venue: VenueId,
        bbo: Bbo,
        limit_status: OrderStatus,
        limit_filled_qty: Decimal,
        limit_avg_price: Option<Decimal>,
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
        async fn fetch_funding_rates(&self) -> CoreResult<HashMap<Symbol, crate::models::FundingRateSample>> {
            unimplemented!()
        }
        async fn fetch_market_data(&self) -> CoreResult<HashMap<Symbol, MarketData>> {
            unimplemented!()
        }
        async fn fetch_bbo(&self, _symbol: &Symbol) -> CoreResult<Bbo> {
            Ok(self.bbo)
        }
        async fn fetch_order_book(&self, _symbol: &Symbol, _depth: usize) -> CoreResult<OrderBook> {
            unimplemented!()
        }
        async fn get_position_snapshot(&self, _symbol: &Symbol) -> CoreResult<Option<PositionSnapshot>> {
            unimplemented!()
        }
        async fn place_limit(
            &self,
            _symbol: &Symbol,
            _side: Side,
            _qty: Decimal,
            _price: Decimal,
            _post_only: bool,
            _reduce_only: bool,
        ) -> CoreResult<crate::venues::OrderResult> {
            Ok(crate::venues::OrderResult {
                order_id: format!("{}-order", self.venue),
                status: self.limit_status,
                filled_quantity: self.limit_filled_qty,
                avg_fill_price: self.limit_avg_price,
            })
        }
        async fn place_market(&self, _symbol: &Symbol, side: Side, qty: Decimal, _reduce_only: bool) -> CoreResult<crate::venues::OrderResult> {
            Ok(crate::venues::OrderResult {
                order_id: format!("{}-reversal", self.venue),
                status: OrderStatus::Filled,
                filled_quantity: qty,
                avg_fill_price: Some(match side {
                    Side::Buy => self.bbo.best_ask,
                    Side::Sell => self.bbo.best_bid,
                }),
            })
        }
        async fn cancel(&self, order_id: &str) -> CoreResult<crate::venues::OrderResult> {
            Ok(crate::venues::OrderResult {
                order_id: order_id.to_string(),
                status: OrderStatus::Cancelled,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
            })
        }
        async fn get_order_info(&self, _order_id: &str, _force_refresh: bool) -> CoreResult<Option<OrderInfo>> {
            unimplemented!()
        }
        async fn await_order_update(&self, order_id: &str, _timeout: std::time::Duration) -> CoreResult<Option<OrderInfo>> {
            Ok(Some(OrderInfo {
                order_id: order_id.to_string(),
                symbol: "BTC".into(),
                side: Side::Buy,
                status: self.limit_status,
                filled_quantity: self.limit_filled_qty,
                avg_fill_price: self.limit_avg_price,
                fee_paid: dec!(0.01),
                fee_currency: "USDT".into(),
                updated_at: ts(),
            }))
        }
        async fn set_leverage(&self, _symbol: &Symbol, _leverage: Decimal) -> CoreResult<bool> {
            Ok(true)
        }
        async fn min_order_notional(&self, _symbol: &Symbol) -> CoreResult<Option<Decimal>> {
            Ok(None)
        }
        async fn order_size_increment(&self, _symbol: &Symbol) -> CoreResult<Decimal> {
            Ok(dec!(0.0001))
        }
    }

    fn executor(long: ScriptedAdapter, short: ScriptedAdapter) -> TwoLegExecutor {
        let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(long.venue.clone(), Arc::new(long));
        adapters.insert(short.venue.clone(), Arc::new(short));
        TwoLegExecutor::new(adapters, Arc::new(Db::open_in_memory(4).unwrap()))
    }

    fn base_params() -> OpenParams {
        OpenParams {
            account_id: "acct1".into(),
            target_margin_usd: dec!(100),
            leverage: dec!(3),
            max_entry_price_divergence_pct: dec!(0.01),
            limit_order_offset_pct: dec!(0.0002),
            order_timeout: std::time::Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn s2_wide_price_divergence_rejects_entry_before_any_order_is_placed() {
        let long = ScriptedAdapter {
            venue: "aster".into(),
            bbo: Bbo { best_bid: dec!(99.9), best_ask: dec!(100.1) },
            limit_status: OrderStatus::Filled,
            limit_filled_qty: dec!(1),
            limit_avg_price: Some(dec!(100)),
        };
        let short = ScriptedAdapter {
            venue: "lighter".into(),
            bbo: Bbo { best_bid: dec!(109.9), best_ask: dec!(110.1) },
            limit_status: OrderStatus::Filled,
            limit_filled_qty: dec!(1),
            limit_avg_price: Some(dec!(110)),
        };
        let exec = executor(long, short);
        let opp = opportunity("aster", "lighter");
        let err = exec.open(&opp, base_params(), ts()).await.unwrap_err();
        assert!(matches!(err, CoreError::DivergenceTooWide { .. }));
    }

    #[tokio::test]
    async fn s3_one_sided_fill_is_flattened_and_no_position_is_created() {
        let long = ScriptedAdapter {
            venue: "aster".into(),
            bbo: Bbo { best_bid: dec!(99.9), best_ask: dec!(100.1) },
            limit_status: OrderStatus::Filled,
            limit_filled_qty: dec!(3),
            limit_avg_price: Some(dec!(100)),
        };
        let short = ScriptedAdapter {
            venue: "lighter".into(),
            bbo: Bbo { best_bid: dec!(99.8), best_ask: dec!(100.2) },
            limit_status: OrderStatus::Rejected,
            limit_filled_qty: Decimal::ZERO,
            limit_avg_price: None,
        };
        let exec = executor(long, short);
        let opp = opportunity("aster", "lighter");
        let err = exec.open(&opp, base_params(), ts()).await.unwrap_err();
        assert!(matches!(err, CoreError::PartialEntryRolledBack { .. }));

        let open_positions = exec.db.get_open_positions(Some("acct1".to_string())).await.unwrap();
        assert!(open_positions.is_empty());
    }
}
