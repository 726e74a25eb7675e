//! Lighter perpetual-DEX adapter
//! Grounded on `original_source/exchange_clients/lighter/funding_adapter/`
//! (adapter.py, fetchers.py, funding_client.py).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use crate::errors::{CoreError, CoreResult};
use crate::models::{FundingRateSample, MarketData, Symbol, VenueId};
use crate::venues::retry::with_backoff;
use crate::venues::{
    strip_multiplier_prefix, Bbo, FeeSchedule, OrderBook, OrderBookLevel, OrderInfo, OrderResult,
    PositionSnapshot, Side, VenueAdapter,
};

const API_BASE: &str = "https://mainnet.zklighter.elliot.ai/api/v1";
/// Lighter funds hourly; every sample must be normalized by x8 before compare.
const NATIVE_INTERVAL_HOURS: u8 = 1;
const MAX_HTTP_CONCURRENCY: usize = 10;

#[derive(Deserialize)]
struct LighterFundingRow {
    symbol: String,
    rate: String,
}

#[derive(Deserialize)]
struct LighterMarketRow {
    symbol: String,
    volume_24h: Option<String>,
    open_interest_long: Option<String>,
    open_interest_short: Option<String>,
}

pub struct LighterAdapter {
    venue_id: VenueId,
    client: Client,
    http_gate: Arc<Semaphore>,
    order_updates: watch::Receiver<Option<OrderInfo>>,
}

impl LighterAdapter {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("funding-arb-core/0.1 (+lighter)")
            .build()
            .expect("failed to build Lighter HTTP client");
        let (_tx, rx) = watch::channel(None);
        Self {
            venue_id: "lighter".to_string(),
            client,
            http_gate: Arc::new(Semaphore::new(MAX_HTTP_CONCURRENCY)),
            order_updates: rx,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> CoreResult<T> {
        let _permit = self.http_gate.acquire().await.expect("semaphore closed");
        with_backoff(&self.venue_id, path, || async {
            let resp = self
                .client
                .get(format!("{API_BASE}{path}"))
                .send()
                .await
                .map_err(|e| CoreError::VenueUnavailable {
                    venue: self.venue_id.clone(),
                    reason: e.to_string(),
                })?;
            if !resp.status().is_success() {
                return Err(CoreError::VenueUnavailable {
                    venue: self.venue_id.clone(),
                    reason: format!("http {}", resp.status()),
                });
            }
            resp.json::<T>().await.map_err(|e| CoreError::VenueUnavailable {
                venue: self.venue_id.clone(),
                reason: format!("bad json: {e}"),
            })
        })
        .await
    }
}

impl Default for LighterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueAdapter for LighterAdapter {
    fn venue_id(&self) -> &VenueId {
        &self.venue_id
    }

    fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            maker_bps: Decimal::ZERO, // Lighter runs zero maker fees
            taker_bps: Decimal::new(3, 2),
        }
    }

    fn normalize_symbol(&self, venue_symbol: &str) -> Symbol {
        strip_multiplier_prefix(venue_symbol.trim_end_matches("-PERP"))
    }

    fn denormalize(&self, canonical: &Symbol) -> String {
        format!("{canonical}-PERP")
    }

    async fn fetch_funding_rates(&self) -> CoreResult<HashMap<Symbol, FundingRateSample>> {
        let rows: Vec<LighterFundingRow> = self.get_json("/fundingRates").await?;
        let now = Utc::now().naive_utc();
        let mut out = HashMap::new();
        for row in rows {
            let symbol = self.normalize_symbol(&row.symbol);
            let rate: Decimal = row
                .rate
                .parse()
                .map_err(|_| CoreError::Invariant(format!("unparseable rate {}", row.rate)))?;
            out.insert(
                symbol.clone(),
                FundingRateSample::new(
                    self.venue_id.clone(),
                    symbol,
                    rate,
                    Decimal::from(NATIVE_INTERVAL_HOURS),
                    None,
                    now,
                ),
            );
        }
        Ok(out)
    }

    async fn fetch_market_data(&self) -> CoreResult<HashMap<Symbol, MarketData>> {
        let rows: Vec<LighterMarketRow> = self.get_json("/markets").await?;
        let now = Utc::now().naive_utc();
        let mut out = HashMap::new();
        for row in rows {
            let symbol = self.normalize_symbol(&row.symbol);
            let long_oi: Decimal = row
                .open_interest_long
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let short_oi: Decimal = row
                .open_interest_short
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            out.insert(
                symbol.clone(),
                MarketData {
                    venue: self.venue_id.clone(),
                    symbol,
                    volume_24h_usd: row.volume_24h.as_deref().and_then(|s| s.parse().ok()),
                    // Lighter reports both sides directly; sum is already two-sided.
                    open_interest_usd: Some(long_oi + short_oi),
                    updated_at: now,
                },
            );
        }
        Ok(out)
    }

    async fn fetch_bbo(&self, symbol: &Symbol) -> CoreResult<Bbo> {
        #[derive(Deserialize)]
        struct Ticker {
            bid: String,
            ask: String,
        }
        let venue_symbol = self.denormalize(symbol);
        let row: Ticker = self.get_json(&format!("/ticker/{venue_symbol}")).await?;
        let best_bid: Decimal = row.bid.parse().unwrap_or(Decimal::ZERO);
        let best_ask: Decimal = row.ask.parse().unwrap_or(Decimal::ZERO);
        if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO || best_bid > best_ask {
            return Err(CoreError::PriceUnavailable {
                venue: self.venue_id.clone(),
                symbol: symbol.clone(),
                reason: format!("invalid bbo bid={best_bid} ask={best_ask}"),
            });
        }
        Ok(Bbo { best_bid, best_ask })
    }

    async fn fetch_order_book(&self, symbol: &Symbol, depth: usize) -> CoreResult<OrderBook> {
        #[derive(Deserialize)]
        struct Depth {
            bids: Vec<[String; 2]>,
            asks: Vec<[String; 2]>,
        }
        let venue_symbol = self.denormalize(symbol);
        let raw: Depth = self
            .get_json(&format!("/orderbook/{venue_symbol}?depth={depth}"))
            .await?;
        let parse_level = |lvl: &[String; 2]| OrderBookLevel {
            price: lvl[0].parse().unwrap_or(Decimal::ZERO),
            quantity: lvl[1].parse().unwrap_or(Decimal::ZERO),
        };
        Ok(OrderBook {
            bids: raw.bids.iter().map(parse_level).collect(),
            asks: raw.asks.iter().map(parse_level).collect(),
        })
    }

    async fn get_position_snapshot(&self, _symbol: &Symbol) -> CoreResult<Option<PositionSnapshot>> {
        Err(CoreError::Authorization {
            venue: self.venue_id.clone(),
            reason: "position snapshot requires an authenticated session".into(),
        })
    }

    async fn place_limit(
        &self,
        _symbol: &Symbol,
        _side: Side,
        _qty: Decimal,
        _price: Decimal,
        _post_only: bool,
        _reduce_only: bool,
    ) -> CoreResult<OrderResult> {
        Err(CoreError::Authorization {
            venue: self.venue_id.clone(),
            reason: "order placement requires a signed L2 session".into(),
        })
    }

    async fn place_market(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> CoreResult<OrderResult> {
        self.place_limit(symbol, side, qty, Decimal::ZERO, false, reduce_only).await
    }

    async fn cancel(&self, _order_id: &str) -> CoreResult<OrderResult> {
        Err(CoreError::Authorization {
            venue: self.venue_id.clone(),
            reason: "cancel requires a signed L2 session".into(),
        })
    }

    async fn get_order_info(&self, _order_id: &str, _force_refresh: bool) -> CoreResult<Option<OrderInfo>> {
        Ok(self.order_updates.borrow().clone())
    }

    async fn await_order_update(&self, order_id: &str, timeout: Duration) -> CoreResult<Option<OrderInfo>> {
        let mut rx = self.order_updates.clone();
        let wait = tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let snapshot = rx.borrow().clone();
                if let Some(info) = &snapshot {
                    if info.order_id == order_id && info.status.is_terminal() {
                        return snapshot;
                    }
                }
            }
        })
        .await;
        Ok(wait.unwrap_or(None))
    }

    async fn set_leverage(&self, _symbol: &Symbol, _leverage: Decimal) -> CoreResult<bool> {
        Err(CoreError::Authorization {
            venue: self.venue_id.clone(),
            reason: "set_leverage requires a signed L2 session".into(),
        })
    }

    async fn min_order_notional(&self, _symbol: &Symbol) -> CoreResult<Option<Decimal>> {
        Ok(Some(Decimal::from(10u8)))
    }

    async fn order_size_increment(&self, _symbol: &Symbol) -> CoreResult<Decimal> {
        Ok(Decimal::new(1, 4)) // 0.0001
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_denormalize_round_trip() {
        let adapter = LighterAdapter::new();
        for raw in ["BTC", "ETH", "ZORA"] {
            let venue_symbol = adapter.denormalize(&raw.to_string());
            assert_eq!(adapter.normalize_symbol(&venue_symbol), raw);
        }
    }

    #[test]
    fn hourly_native_interval_normalizes_to_eighth_of_rate_times_eight() {
        use chrono::NaiveDate;
        use rust_decimal_macros::dec;
        let ts = NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let sample = FundingRateSample::new(
            "lighter".into(),
            "BTC".into(),
            dec!(0.0000100),
            Decimal::from(NATIVE_INTERVAL_HOURS),
            None,
            ts,
        );
        assert_eq!(sample.normalized_rate, dec!(0.0000100) * Decimal::from(8u8));
    }
}
