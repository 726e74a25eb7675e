//! `TwoLegExecutor::close` -- spec §4.5 "close".

use std::time::Duration;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use super::{fill_row, to_model_side, CloseOrderType, TwoLegExecutor};
use crate::db::PositionPatch;
use crate::errors::CoreResult;
use crate::models::{ExitReason, LifecycleStage, Position, Side as ModelSide, TradeType};
use crate::venues::{OrderInfo, OrderResult, OrderStatus, Side, VenueAdapter};

async fn await_result(
    adapter: &dyn VenueAdapter,
    placed: OrderResult,
    side: Side,
    symbol: &str,
    timeout: Duration,
    now: NaiveDateTime,
) -> CoreResult<OrderInfo> {
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

fn signed_notional(side: ModelSide, qty: Decimal, price: Decimal) -> Decimal {
    match side {
        ModelSide::Buy => qty * price,
        ModelSide::Sell => -qty * price,
    }
}

impl TwoLegExecutor {
    /// Flattens both legs of a position and closes it out. One reduce-only
    /// order type governs both legs; a resting `Limit` order that does not
    /// fully fill within `order_timeout` is cancelled and the remainder is
    /// escalated to `Market` (spec §4.5 "close"). If a leg still reports
    /// residual size after escalation, `close_degraded` is set on the
    /// returned `Position` rather than blocking the close.
    pub async fn close(
        &self,
        position: &Position,
        order_type: CloseOrderType,
        exit_reason: ExitReason,
        order_timeout: Duration,
        now: NaiveDateTime,
    ) -> CoreResult<Position> {
        let long_adapter = self.adapter(&position.long_venue)?.clone();
        let short_adapter = self.adapter(&position.short_venue)?.clone();
        let symbol = position.symbol.clone();

        let (long_snap, short_snap) = tokio::join!(
            long_adapter.get_position_snapshot(&symbol),
            short_adapter.get_position_snapshot(&symbol),
        );
        let long_snap = long_snap?;
        let short_snap = short_snap?;

        let fallback_qty = if position.entry_long_price > Decimal::ZERO {
            position.size_usd / position.entry_long_price
        } else {
            Decimal::ZERO
        };
        let long_qty = long_snap.as_ref().map(|s| s.quantity).unwrap_or(fallback_qty);
        let short_qty = short_snap.as_ref().map(|s| s.quantity).unwrap_or(fallback_qty);

        // `PositionSnapshot.funding_accrued` is life-to-date since the
        // position was opened, not a per-tick delta, so a fresh read
        // replaces the stored total rather than adding to it. If either leg's
        // snapshot is unavailable, keep the last value C6 recorded instead of
        // guessing at the missing leg's contribution.
        let cumulative_funding_usd = match (&long_snap, &short_snap) {
            (Some(l), Some(s)) => l.funding_accrued + s.funding_accrued,
            _ => position.cumulative_funding_usd,
        };

        let (long_fills, long_degraded) = self
            .close_leg(long_adapter.as_ref(), &symbol, Side::Sell, long_qty, order_type, order_timeout, now)
            .await?;
        let (short_fills, short_degraded) = self
            .close_leg(short_adapter.as_ref(), &symbol, Side::Buy, short_qty, order_type, order_timeout, now)
            .await?;
        let close_degraded = long_degraded || short_degraded;

        for info in &long_fills {
            if info.filled_quantity > Decimal::ZERO {
                let row = fill_row(position.position_id, &position.account_id, &position.long_venue, &symbol, info, position.entry_long_price, TradeType::Exit, now);
                self.db.insert_trade_fill(row).await?;
            }
        }
        for info in &short_fills {
            if info.filled_quantity > Decimal::ZERO {
                let row = fill_row(position.position_id, &position.account_id, &position.short_venue, &symbol, info, position.entry_short_price, TradeType::Exit, now);
                self.db.insert_trade_fill(row).await?;
            }
        }

        let all_fills = self.db.get_fills(position.position_id).await?;
        let entry_fills: Vec<_> = all_fills.iter().filter(|f| f.trade_type == TradeType::Entry).collect();
        let entry_sum: Decimal = entry_fills
            .iter()
            .map(|f| signed_notional(f.side, f.total_quantity, f.weighted_avg_price))
            .sum();
        let entry_fees: Decimal = entry_fills.iter().map(|f| f.total_fee).sum();

        // C6 leg-drift rebalances (spec §4.6 item 6) record their own
        // `realized_pnl` at the time they run, since they are a partial
        // reduce-only close that this function's entry/exit reconciliation
        // never otherwise sees. `fill_row` always leaves `realized_pnl` unset,
        // so any row with it set here is one of those prior rebalances.
        let rebalance_fills: Vec<_> = all_fills
            .iter()
            .filter(|f| f.trade_type == TradeType::Exit && f.realized_pnl.is_some())
            .collect();
        let rebalance_pnl: Decimal = rebalance_fills.iter().filter_map(|f| f.realized_pnl).sum();
        let rebalance_fees: Decimal = rebalance_fills.iter().map(|f| f.total_fee).sum();

        let exit_fills: Vec<&OrderInfo> = long_fills
            .iter()
            .chain(short_fills.iter())
            .filter(|info| info.filled_quantity > Decimal::ZERO)
            .collect();
        let exit_sum: Decimal = exit_fills
            .iter()
            .map(|info| {
                let price = info.avg_fill_price.unwrap_or(Decimal::ZERO);
                signed_notional(to_model_side(info.side), info.filled_quantity, price)
            })
            .sum();
        let exit_fees: Decimal = exit_fills.iter().map(|info| info.fee_paid).sum();
        let total_fees = entry_fees + exit_fees + rebalance_fees;

        // signed_notional is +qty*price for a Buy fill and -qty*price for a
        // Sell fill; entry_sum and exit_sum are each a sum of those. Realized
        // pnl on a round trip is the negative of the combined total (a Buy
        // entry paired with a Sell exit nets to a cash inflow, not outflow).
        let pnl_usd = -(entry_sum + exit_sum) + rebalance_pnl + cumulative_funding_usd - total_fees;

        self.db
            .update_position(
                position.position_id,
                PositionPatch {
                    cumulative_funding_usd: Some(cumulative_funding_usd),
                    last_heartbeat: Some(now),
                    lifecycle_stage: Some(LifecycleStage::Closed),
                    closed_at: Some(now),
                    pnl_usd: Some(pnl_usd),
                    exit_reason: Some(exit_reason),
                    close_degraded: Some(close_degraded),
                },
            )
            .await?;

        Ok(Position {
            cumulative_funding_usd,
            last_heartbeat: now,
            lifecycle_stage: LifecycleStage::Closed,
            closed_at: Some(now),
            pnl_usd: Some(pnl_usd),
            exit_reason: Some(exit_reason),
            close_degraded,
            ..position.clone()
        })
    }

    /// Flattens one leg. Returns every fill produced (one for a clean market
    /// or fully-filled limit order, two if a partial limit fill had to be
    /// escalated) and whether residual size survived the attempt.
    async fn close_leg(
        &self,
        adapter: &dyn VenueAdapter,
        symbol: &str,
        side: Side,
        qty: Decimal,
        order_type: CloseOrderType,
        timeout: Duration,
        now: NaiveDateTime,
    ) -> CoreResult<(Vec<OrderInfo>, bool)> {
        if qty <= Decimal::ZERO {
            return Ok((Vec::new(), false));
        }

        match order_type {
            CloseOrderType::Market => {
                let placed = adapter.place_market(&symbol.to_string(), side, qty, true).await?;
                let info = await_result(adapter, placed, side, symbol, timeout, now).await?;
                let degraded = info.filled_quantity < qty;
                Ok((vec![info], degraded))
            }
            CloseOrderType::Limit => {
                // Post-only at BBO, same retry-once-on-cross policy as
                // `open` (spec §4.5 "close": "use post-only at BBO with the
                // same retry policy"). A still-rejected or partially-filled
                // resting order escalates to a reduce-only market order for
                // the remainder.
                let bbo = adapter.fetch_bbo(&symbol.to_string()).await?;
                let price = match side {
                    Side::Sell => bbo.best_bid,
                    Side::Buy => bbo.best_ask,
                };
                let placed = adapter.place_limit(&symbol.to_string(), side, qty, price, true, true).await?;
                let mut info = await_result(adapter, placed, side, symbol, timeout, now).await?;

                if info.status == OrderStatus::Rejected && info.filled_quantity == Decimal::ZERO {
                    let bbo2 = adapter.fetch_bbo(&symbol.to_string()).await?;
                    let price2 = match side {
                        Side::Sell => bbo2.best_bid,
                        Side::Buy => bbo2.best_ask,
                    };
                    let retry_placed = adapter.place_limit(&symbol.to_string(), side, qty, price2, true, true).await?;
                    info = await_result(adapter, retry_placed, side, symbol, timeout, now).await?;
                }

                if info.filled_quantity >= qty {
                    return Ok((vec![info], false));
                }
                if !info.status.is_terminal() {
                    let _ = adapter.cancel(&info.order_id).await;
                }
                let remaining = qty - info.filled_quantity;
                if remaining <= Decimal::ZERO {
                    return Ok((vec![info], false));
                }
                let mkt_placed = adapter.place_market(&symbol.to_string(), side, remaining, true).await?;
                let mkt_info = await_result(adapter, mkt_placed, side, symbol, timeout, now).await?;
                let degraded = info.filled_quantity + mkt_info.filled_quantity < qty;
                Ok((vec![info, mkt_info], degraded))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;
    use crate::db::Db;
    use crate::errors::CoreResult as Result;
    use crate::models::{FundingRateSample, MarketData, Symbol, TradeFill, VenueId};
    use crate::venues::{Bbo, FeeSchedule, OrderBook, OrderStatus, PositionSnapshot};

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    /// A venue double whose fills are driven by a fixed fraction of the
    /// requested quantity, separately configurable for the initial limit
    /// leg and any market order (escalation or direct). Mirrors the
    /// `ScriptedAdapter` pattern in `open.rs`'s tests.
    struct ScriptedAdapter {
        venue: VenueId,
        bbo: Bbo,
        snapshot: PositionSnapshot,
        limit_fill_frac: Decimal,
        market_fill_frac: Decimal,
    }

    #[async_trait]
    impl VenueAdapter for ScriptedAdapter {
        fn venue_id(&self) -> &VenueId {
            &self.venue
        }

        fn fee_schedule(&self) -> FeeSchedule {
            FeeSchedule { maker_bps: Decimal::ZERO, taker_bps: Decimal::ZERO }
        }

        fn normalize_symbol(&self, venue_symbol: &str) -> Symbol {
            venue_symbol.to_string()
        }

        fn denormalize(&self, canonical: &Symbol) -> String {
            canonical.clone()
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
            Ok(Some(self.snapshot.clone()))
        }

        async fn place_limit(
            &self,
            _symbol: &Symbol,
            side: Side,
            qty: Decimal,
            price: Decimal,
            _post_only: bool,
            _reduce_only: bool,
        ) -> Result<OrderResult> {
            let filled = qty * self.limit_fill_frac;
            let status = if filled >= qty { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
            Ok(OrderResult {
                order_id: format!("{}-limit-{side:?}", self.venue),
                status,
                filled_quantity: filled,
                avg_fill_price: Some(price),
            })
        }

        async fn place_market(
            &self,
            _symbol: &Symbol,
            side: Side,
            qty: Decimal,
            _reduce_only: bool,
        ) -> Result<OrderResult> {
            let filled = qty * self.market_fill_frac;
            let status = if filled >= qty { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
            let price = match side {
                Side::Sell => self.bbo.best_bid,
                Side::Buy => self.bbo.best_ask,
            };
            Ok(OrderResult {
                order_id: format!("{}-market-{side:?}", self.venue),
                status,
                filled_quantity: filled,
                avg_fill_price: Some(price),
            })
        }

        async fn cancel(&self, order_id: &str) -> Result<OrderResult> {
            Ok(OrderResult {
                order_id: order_id.to_string(),
                status: OrderStatus::Cancelled,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
            })
        }

        async fn get_order_info(&self, _order_id: &str, _force_refresh: bool) -> Result<Option<OrderInfo>> {
            unimplemented!()
        }

        async fn await_order_update(&self, _order_id: &str, _timeout: Duration) -> Result<Option<OrderInfo>> {
            Ok(None)
        }

        async fn set_leverage(&self, _symbol: &Symbol, _leverage: Decimal) -> Result<bool> {
            unimplemented!()
        }

        async fn min_order_notional(&self, _symbol: &Symbol) -> Result<Option<Decimal>> {
            Ok(None)
        }

        async fn order_size_increment(&self, _symbol: &Symbol) -> Result<Decimal> {
            Ok(dec!(0.0001))
        }
    }

    async fn seed_position(db: &Db, long_venue: &str, short_venue: &str) -> Position {
        let position = Position {
            position_id: Uuid::new_v4(),
            account_id: "acct1".into(),
            symbol: "BTC".into(),
            long_venue: long_venue.into(),
            short_venue: short_venue.into(),
            size_usd: dec!(100),
            entry_long_rate: dec!(0.0001),
            entry_short_rate: dec!(-0.0002),
            entry_divergence: dec!(0),
            entry_long_price: dec!(100),
            entry_short_price: dec!(100),
            opened_at: ts(),
            cumulative_funding_usd: Decimal::ZERO,
            last_heartbeat: ts(),
            lifecycle_stage: LifecycleStage::Monitoring,
            closed_at: None,
            pnl_usd: None,
            exit_reason: None,
            close_degraded: false,
        };
        db.insert_position(position.clone()).await.unwrap();

        let entry = |venue: &str, side: ModelSide, price: Decimal| TradeFill {
            id: None,
            position_id: position.position_id,
            account_id: "acct1".into(),
            venue: venue.to_string(),
            symbol: "BTC".into(),
            trade_type: TradeType::Entry,
            side,
            order_id: format!("{venue}-entry"),
            timestamp: ts(),
            total_quantity: dec!(1),
            weighted_avg_price: price,
            total_fee: Decimal::ZERO,
            fee_currency: "USDT".into(),
            realized_pnl: None,
            realized_funding: None,
            fill_count: 1,
        };
        db.insert_trade_fill(entry(long_venue, ModelSide::Buy, dec!(100))).await.unwrap();
        db.insert_trade_fill(entry(short_venue, ModelSide::Sell, dec!(100))).await.unwrap();

        position
    }

    fn executor(
        long_bbo: Bbo,
        short_bbo: Bbo,
        long_limit_frac: Decimal,
        long_market_frac: Decimal,
        short_limit_frac: Decimal,
        short_market_frac: Decimal,
        db: Arc<Db>,
    ) -> TwoLegExecutor {
        let snapshot = |side: Side| PositionSnapshot {
            symbol: "BTC".into(),
            side,
            quantity: dec!(1),
            entry_price: dec!(100),
            mark_price: dec!(100),
            leverage: dec!(3),
            liquidation_price: dec!(50),
            unrealized_pnl: Decimal::ZERO,
            funding_accrued: dec!(0.05),
        };
        let mut adapters: HashMap<VenueId, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(
            "aster".into(),
            Arc::new(ScriptedAdapter {
                venue: "aster".into(),
                bbo: long_bbo,
                snapshot: snapshot(Side::Buy),
                limit_fill_frac: long_limit_frac,
                market_fill_frac: long_market_frac,
            }),
        );
        adapters.insert(
            "lighter".into(),
            Arc::new(ScriptedAdapter {
                venue: "lighter".into(),
                bbo: short_bbo,
                snapshot: snapshot(Side::Sell),
                limit_fill_frac: short_limit_frac,
                market_fill_frac: short_market_frac,
            }),
        );
        TwoLegExecutor::new(adapters, db)
    }

    #[tokio::test]
    async fn market_close_flattens_both_legs_and_computes_pnl() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let position = seed_position(&db, "aster", "lighter").await;

        let exec = executor(
            Bbo { best_bid: dec!(105), best_ask: dec!(105.2) },
            Bbo { best_bid: dec!(94.8), best_ask: dec!(95) },
            Decimal::ZERO,
            Decimal::ONE,
            Decimal::ZERO,
            Decimal::ONE,
            db.clone(),
        );

        let closed = exec
            .close(&position, CloseOrderType::Market, ExitReason::MaxAge, Duration::from_secs(5), ts())
            .await
            .unwrap();

        assert_eq!(closed.lifecycle_stage, LifecycleStage::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::MaxAge));
        assert!(!closed.close_degraded);
        // long sells at 105 (bought at 100, +5), short buys back at 95 (sold at 100, +5),
        // plus 0.1 of accrued funding across both legs.
        assert_eq!(closed.pnl_usd, Some(dec!(10.1)));
        assert_eq!(closed.cumulative_funding_usd, dec!(0.1));

        let persisted = db.get_position(position.position_id).await.unwrap().unwrap();
        assert_eq!(persisted.lifecycle_stage, LifecycleStage::Closed);
        assert_eq!(persisted.pnl_usd, Some(dec!(10.1)));
    }

    #[tokio::test]
    async fn limit_close_escalates_a_partial_fill_and_flags_degraded_when_residual_survives() {
        let db = Arc::new(Db::open_in_memory(4).unwrap());
        let position = seed_position(&db, "aster", "lighter").await;

        // Limit order fills 40%, escalation market order only fills half of
        // the remainder -- the leg never fully flattens.
        let exec = executor(
            Bbo { best_bid: dec!(100), best_ask: dec!(100.2) },
            Bbo { best_bid: dec!(99.8), best_ask: dec!(100) },
            dec!(0.4),
            dec!(0.5),
            Decimal::ONE,
            Decimal::ONE,
            db.clone(),
        );

        let closed = exec
            .close(&position, CloseOrderType::Limit, ExitReason::PersistentWideSpread, Duration::from_secs(5), ts())
            .await
            .unwrap();

        assert_eq!(closed.lifecycle_stage, LifecycleStage::Closed);
        assert!(closed.close_degraded);

        let persisted = db.get_position(position.position_id).await.unwrap().unwrap();
        assert!(persisted.close_degraded);
    }
}
