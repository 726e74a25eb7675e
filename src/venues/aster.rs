//! Aster perpetual-DEX adapter
//! Grounded on `original_source/exchange_clients/aster/funding_adapter/` (adapter.py,
//! fetchers.py, funding_client.py) and the teacher's `scrapers::polymarket_api`
//! REST-client shape (reqwest::Client + rate limiting + execute-with-retry).

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_tungstenite::tungstenite::Message;

use crate::errors::{CoreError, CoreResult};
use crate::models::{FundingRateSample, MarketData, Symbol, VenueId};
use crate::venues::retry::with_backoff;
use crate::venues::{
    strip_multiplier_prefix, Bbo, FeeSchedule, OrderBook, OrderBookLevel, OrderInfo, OrderResult,
    OrderStatus, PositionSnapshot, Side, VenueAdapter,
};

const API_BASE: &str = "https://fapi.asterdex.com";
const WS_BASE: &str = "wss://fstream.asterdex.com/ws";
const QUOTE_SUFFIX: &str = "USDT";
const MAX_HTTP_CONCURRENCY: usize = 10;
const WS_BACKOFF_BASE: Duration = Duration::from_secs(1);
const WS_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct AsterFundingRateRow {
    symbol: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: Option<i64>,
}

#[derive(Deserialize)]
struct AsterTickerRow {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

#[derive(Deserialize)]
struct AsterOpenInterestRow {
    symbol: String,
    #[serde(rename = "openInterest")]
    open_interest: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
}

pub struct AsterAdapter {
    venue_id: VenueId,
    client: Client,
    http_gate: Arc<Semaphore>,
    api_key: Option<String>,
    api_secret: Option<String>,
    account_id: Option<String>,
    order_updates: watch::Receiver<Option<OrderInfo>>,
    /// Pushed into by the `spawn_order_stream` websocket task in production;
    /// `push_order_update` lets tests/mocks push synthetic updates without a
    /// live connection.
    last_order_tx: watch::Sender<Option<OrderInfo>>,
    /// order_id -> (symbol, side) for orders this adapter placed, since the
    /// venue's order-status endpoint requires `symbol` alongside `orderId`
    /// and the `VenueAdapter` trait only carries `order_id` past `place_*`.
    pending_orders: Mutex<HashMap<String, (Symbol, Side)>>,
}

impl AsterAdapter {
    pub fn new(api_key: Option<String>, api_secret: Option<String>, account_id: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("funding-arb-core/0.1 (+aster)")
            .build()
            .expect("failed to build Aster HTTP client");
        let (tx, rx) = watch::channel(None);
        Self {
            venue_id: "aster".to_string(),
            client,
            http_gate: Arc::new(Semaphore::new(MAX_HTTP_CONCURRENCY)),
            api_key,
            api_secret,
            account_id,
            order_updates: rx,
            last_order_tx: tx,
            pending_orders: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticated endpoints additionally require a bound sub-account id
    /// (spec's multi-account credential model, `config::AccountCredentials`);
    /// `sign` alone only checks the secret is present.
    fn ensure_authenticated(&self) -> CoreResult<()> {
        if self.api_key.is_none() || self.account_id.is_none() {
            return Err(CoreError::Authorization {
                venue: self.venue_id.clone(),
                reason: "order/account endpoints require api_key and account_id".into(),
            });
        }
        Ok(())
    }

    fn sign(&self, query: &str) -> CoreResult<String> {
        let secret = self.api_secret.as_deref().ok_or_else(|| CoreError::Authorization {
            venue: self.venue_id.clone(),
            reason: "no api secret configured".into(),
        })?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| CoreError::Authorization {
                venue: self.venue_id.clone(),
                reason: format!("bad secret: {e}"),
            })?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Extracts `{"code": -2010, "msg": "..."}`-shaped exchange error bodies;
    /// falls back to the raw body when the venue doesn't return that shape.
    fn exchange_error_reason(body: &str) -> String {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(|s| s.to_string()))
            .unwrap_or_else(|| body.to_string())
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
            let status = resp.status();
            if status.is_client_error() && status.as_u16() != 429 {
                let body = resp.text().await.unwrap_or_default();
                return Err(CoreError::ExchangeRejection {
                    venue: self.venue_id.clone(),
                    reason: Self::exchange_error_reason(&body),
                });
            }
            if !status.is_success() {
                return Err(CoreError::VenueUnavailable {
                    venue: self.venue_id.clone(),
                    reason: format!("http {status}"),
                });
            }
            resp.json::<T>().await.map_err(|e| CoreError::VenueUnavailable {
                venue: self.venue_id.clone(),
                reason: format!("bad json: {e}"),
            })
        })
        .await
    }

    /// Issues a signed request against an authenticated endpoint (spec §4.1:
    /// "Authenticated REST or signed calls for orders, positions, leverage").
    /// Every parameter goes into the query string -- including on `POST`/
    /// `DELETE` -- which is how Aster's Binance-compatible futures API reads
    /// signed requests regardless of HTTP verb.
    async fn signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> CoreResult<T> {
        let api_key = self.api_key.as_deref().ok_or_else(|| CoreError::Authorization {
            venue: self.venue_id.clone(),
            reason: "no api key configured".into(),
        })?;
        params.push(("timestamp".to_string(), Utc::now().timestamp_millis().to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;
        let url = format!("{API_BASE}{path}?{query}&signature={signature}");

        let _permit = self.http_gate.acquire().await.expect("semaphore closed");
        with_backoff(&self.venue_id, path, || async {
            let resp = self
                .client
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", api_key)
                .send()
                .await
                .map_err(|e| CoreError::VenueUnavailable {
                    venue: self.venue_id.clone(),
                    reason: e.to_string(),
                })?;
            let status = resp.status();
            let body = resp.text().await.map_err(|e| CoreError::VenueUnavailable {
                venue: self.venue_id.clone(),
                reason: format!("bad body: {e}"),
            })?;
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(CoreError::Authorization {
                    venue: self.venue_id.clone(),
                    reason: Self::exchange_error_reason(&body),
                });
            }
            if status.is_client_error() && status.as_u16() != 429 {
                return Err(CoreError::ExchangeRejection {
                    venue: self.venue_id.clone(),
                    reason: Self::exchange_error_reason(&body),
                });
            }
            if !status.is_success() {
                return Err(CoreError::VenueUnavailable {
                    venue: self.venue_id.clone(),
                    reason: format!("http {status}"),
                });
            }
            serde_json::from_str::<T>(&body).map_err(|e| CoreError::VenueUnavailable {
                venue: self.venue_id.clone(),
                reason: format!("bad json: {e} (body: {body})"),
            })
        })
        .await
    }

    /// Starts the background order-update websocket listener. A no-op when
    /// no api key is configured (read-only adapters have nothing to listen
    /// for). Safe to call once after construction; the task runs for the
    /// lifetime of the process and reconnects on its own.
    pub fn spawn_order_stream(&self) {
        let Some(api_key) = self.api_key.clone() else { return };
        let client = self.client.clone();
        let venue_id = self.venue_id.clone();
        let tx = self.last_order_tx.clone();
        tokio::spawn(run_order_update_stream(client, api_key, venue_id, tx));
    }
}

/// Fetches a fresh Binance-style user-data-stream `listenKey`. Header-only
/// auth (`X-MBX-APIKEY`) -- unlike `signed_request`, this endpoint takes no
/// HMAC signature at all.
async fn obtain_listen_key(client: &Client, api_key: &str) -> Result<String, String> {
    #[derive(Deserialize)]
    struct ListenKeyResponse {
        #[serde(rename = "listenKey")]
        listen_key: String,
    }
    let resp = client
        .post(format!("{API_BASE}/fapi/v1/listenKey"))
        .header("X-MBX-APIKEY", api_key)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("http {}", resp.status()));
    }
    resp.json::<ListenKeyResponse>()
        .await
        .map(|r| r.listen_key)
        .map_err(|e| e.to_string())
}

#[derive(Deserialize)]
struct AsterOrderUpdateInner {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "z")]
    cumulative_filled_qty: String,
    #[serde(rename = "ap")]
    avg_price: String,
    #[serde(rename = "n")]
    commission: Option<String>,
    #[serde(rename = "N")]
    commission_asset: Option<String>,
}

#[derive(Deserialize)]
struct AsterOrderUpdateEnvelope {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "o")]
    order: Option<AsterOrderUpdateInner>,
}

/// Reconnect-with-backoff loop around a single websocket session, grounded
/// on the teacher's `scrapers::binance_session::BackoffCalculator` shape
/// (exponential, capped) but without its multi-endpoint rotation or
/// heartbeat/resync state machine -- Aster exposes exactly one user-data
/// websocket host, so there is nothing to rotate across.
async fn run_order_update_stream(
    client: Client,
    api_key: String,
    venue_id: VenueId,
    tx: watch::Sender<Option<OrderInfo>>,
) {
    let mut backoff = WS_BACKOFF_BASE;
    loop {
        let listen_key = match obtain_listen_key(&client, &api_key).await {
            Ok(key) => key,
            Err(reason) => {
                tracing::warn!(venue = %venue_id, %reason, "aster: failed to obtain listenKey, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(WS_BACKOFF_MAX);
                continue;
            }
        };
        let ws_url = format!("{WS_BASE}/{listen_key}");
        match stream_once(&ws_url, &tx).await {
            Ok(()) => {
                // Clean close (venue-initiated); reconnect promptly.
                backoff = WS_BACKOFF_BASE;
            }
            Err(reason) => {
                tracing::warn!(venue = %venue_id, %reason, "aster: order-update stream dropped, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(WS_BACKOFF_MAX);
            }
        }
    }
}

/// Runs a single websocket connection until it closes or errors. Returns
/// `Ok(())` on a clean close so the caller doesn't back off unnecessarily.
async fn stream_once(ws_url: &str, tx: &watch::Sender<Option<OrderInfo>>) -> Result<(), String> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(|e| e.to_string())?;
    let (_, mut read) = ws_stream.split();
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Ok(()),
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<AsterOrderUpdateEnvelope>(&text) else {
            continue;
        };
        if envelope.event != "ORDER_TRADE_UPDATE" {
            continue;
        }
        let Some(o) = envelope.order else { continue };
        let filled_quantity: Decimal = o.cumulative_filled_qty.parse().unwrap_or(Decimal::ZERO);
        let avg_fill_price = o
            .avg_price
            .parse::<Decimal>()
            .ok()
            .filter(|p| *p > Decimal::ZERO);
        let fee_paid: Decimal = o
            .commission
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(Decimal::ZERO);
        let info = OrderInfo {
            order_id: o.order_id.to_string(),
            symbol: strip_multiplier_prefix(o.symbol.strip_suffix(QUOTE_SUFFIX).unwrap_or(&o.symbol)),
            side: if o.side == "BUY" { Side::Buy } else { Side::Sell },
            status: order_status_from_aster(&o.status),
            filled_quantity,
            avg_fill_price,
            fee_paid,
            fee_currency: o.commission_asset.unwrap_or_else(|| QUOTE_SUFFIX.to_string()),
            updated_at: Utc::now().naive_utc(),
        };
        let _ = tx.send(Some(info));
    }
    Ok(())
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn order_status_from_aster(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Open,
    }
}

#[derive(Deserialize)]
struct AsterOrderRow {
    #[serde(rename = "orderId")]
    order_id: u64,
    status: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    #[serde(rename = "avgPrice")]
    avg_price: Option<String>,
}

impl AsterOrderRow {
    fn into_order_result(self) -> OrderResult {
        let filled_quantity: Decimal = self.executed_qty.parse().unwrap_or(Decimal::ZERO);
        let avg_fill_price = self
            .avg_price
            .and_then(|p| p.parse::<Decimal>().ok())
            .filter(|p| *p > Decimal::ZERO);
        OrderResult {
            order_id: self.order_id.to_string(),
            status: order_status_from_aster(&self.status),
            filled_quantity,
            avg_fill_price,
        }
    }
}

#[derive(Deserialize)]
struct AsterPositionRow {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    leverage: String,
    #[serde(rename = "liquidationPrice")]
    liquidation_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
}

#[async_trait]
impl VenueAdapter for AsterAdapter {
    fn venue_id(&self) -> &VenueId {
        &self.venue_id
    }

    fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            maker_bps: Decimal::new(2, 2), // 0.02%
            taker_bps: Decimal::new(5, 2), // 0.05%
        }
    }

    fn normalize_symbol(&self, venue_symbol: &str) -> Symbol {
        let base = venue_symbol.strip_suffix(QUOTE_SUFFIX).unwrap_or(venue_symbol);
        strip_multiplier_prefix(base)
    }

    fn denormalize(&self, canonical: &Symbol) -> String {
        format!("{canonical}{QUOTE_SUFFIX}")
    }

    async fn fetch_funding_rates(&self) -> CoreResult<HashMap<Symbol, FundingRateSample>> {
        let rows: Vec<AsterFundingRateRow> = self.get_json("/fapi/v1/premiumIndex").await?;
        let now = Utc::now().naive_utc();
        let mut out = HashMap::new();
        for row in rows {
            let symbol = self.normalize_symbol(&row.symbol);
            let rate: Decimal = row.last_funding_rate.parse().map_err(|_| CoreError::Invariant(
                format!("unparseable funding rate {}", row.last_funding_rate),
            ))?;
            let next_funding_time = row
                .next_funding_time
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                .map(|dt| dt.naive_utc());
            out.insert(
                symbol.clone(),
                FundingRateSample::new(
                    self.venue_id.clone(),
                    symbol,
                    rate,
                    Decimal::from(8u8), // Aster funds every 8h
                    next_funding_time,
                    now,
                ),
            );
        }
        Ok(out)
    }

    async fn fetch_market_data(&self) -> CoreResult<HashMap<Symbol, MarketData>> {
        let tickers: Vec<AsterTickerRow> = self.get_json("/fapi/v1/ticker/24hr").await?;
        let oi_rows: Vec<AsterOpenInterestRow> = self.get_json("/fapi/v1/openInterest").await?;
        let now = Utc::now().naive_utc();

        let mut oi_by_symbol: HashMap<String, Decimal> = HashMap::new();
        for row in oi_rows {
            let qty: Decimal = row.open_interest.parse().unwrap_or(Decimal::ZERO);
            let mark: Decimal = row.mark_price.parse().unwrap_or(Decimal::ZERO);
            // Aster's /openInterest returns one-sided (total outstanding contracts);
            // two-sided USD is long notional + short notional == 2 * qty * mark.
            oi_by_symbol.insert(row.symbol, qty * mark * Decimal::TWO);
        }

        let mut out = HashMap::new();
        for row in tickers {
            let symbol = self.normalize_symbol(&row.symbol);
            let volume_24h_usd = row.quote_volume.parse().ok();
            let open_interest_usd = oi_by_symbol.get(&row.symbol).copied();
            out.insert(
                symbol.clone(),
                MarketData {
                    venue: self.venue_id.clone(),
                    symbol,
                    volume_24h_usd,
                    open_interest_usd,
                    updated_at: now,
                },
            );
        }
        Ok(out)
    }

    async fn fetch_bbo(&self, symbol: &Symbol) -> CoreResult<Bbo> {
        #[derive(Deserialize)]
        struct BookTicker {
            #[serde(rename = "bidPrice")]
            bid_price: String,
            #[serde(rename = "askPrice")]
            ask_price: String,
        }
        let venue_symbol = self.denormalize(symbol);
        let row: BookTicker = self
            .get_json(&format!("/fapi/v1/ticker/bookTicker?symbol={venue_symbol}"))
            .await?;
        let best_bid: Decimal = row.bid_price.parse().unwrap_or(Decimal::ZERO);
        let best_ask: Decimal = row.ask_price.parse().unwrap_or(Decimal::ZERO);
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
            .get_json(&format!("/fapi/v1/depth?symbol={venue_symbol}&limit={depth}"))
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

    async fn get_position_snapshot(&self, symbol: &Symbol) -> CoreResult<Option<PositionSnapshot>> {
        self.ensure_authenticated()?;
        let venue_symbol = self.denormalize(symbol);
        let rows: Vec<AsterPositionRow> = self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol".to_string(), venue_symbol.clone())],
            )
            .await?;
        let Some(row) = rows.into_iter().find(|r| r.symbol == venue_symbol) else {
            return Ok(None);
        };
        let qty: Decimal = row.position_amt.parse().unwrap_or(Decimal::ZERO);
        if qty == Decimal::ZERO {
            return Ok(None);
        }
        Ok(Some(PositionSnapshot {
            symbol: symbol.clone(),
            side: if qty > Decimal::ZERO { Side::Buy } else { Side::Sell },
            quantity: qty.abs(),
            entry_price: row.entry_price.parse().unwrap_or(Decimal::ZERO),
            mark_price: row.mark_price.parse().unwrap_or(Decimal::ZERO),
            leverage: row.leverage.parse().unwrap_or(Decimal::ONE),
            liquidation_price: row.liquidation_price.parse().unwrap_or(Decimal::ZERO),
            unrealized_pnl: row.unrealized_profit.parse().unwrap_or(Decimal::ZERO),
            // positionRisk doesn't expose cumulative funding paid; C6 tracks
            // accrual itself from funding rate samples (position::lifecycle).
            funding_accrued: Decimal::ZERO,
        }))
    }

    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
        post_only: bool,
        reduce_only: bool,
    ) -> CoreResult<OrderResult> {
        self.ensure_authenticated()?;
        let mut params = vec![
            ("symbol".to_string(), self.denormalize(symbol)),
            ("side".to_string(), side_str(side).to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("quantity".to_string(), qty.to_string()),
            ("price".to_string(), price.to_string()),
            // GTX ("good-till-crossing") is Binance-family's post-only: the
            // order is rejected outright instead of crossing the book, which
            // is exactly the retry-on-cross signal `open`/`close` check for.
            ("timeInForce".to_string(), if post_only { "GTX".to_string() } else { "GTC".to_string() }),
        ];
        if reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        let row: AsterOrderRow = self.signed_request(reqwest::Method::POST, "/fapi/v1/order", params).await?;
        let result = row.into_order_result();
        self.pending_orders.lock().insert(result.order_id.clone(), (symbol.clone(), side));
        Ok(result)
    }

    async fn place_market(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> CoreResult<OrderResult> {
        self.ensure_authenticated()?;
        let mut params = vec![
            ("symbol".to_string(), self.denormalize(symbol)),
            ("side".to_string(), side_str(side).to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), qty.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        let row: AsterOrderRow = self.signed_request(reqwest::Method::POST, "/fapi/v1/order", params).await?;
        let result = row.into_order_result();
        self.pending_orders.lock().insert(result.order_id.clone(), (symbol.clone(), side));
        Ok(result)
    }

    async fn cancel(&self, order_id: &str) -> CoreResult<OrderResult> {
        self.ensure_authenticated()?;
        let symbol = self.pending_orders.lock().get(order_id).map(|(s, _)| s.clone());
        let symbol = symbol.ok_or_else(|| CoreError::Invariant(format!("cancel: unknown order_id {order_id}")))?;
        let params = vec![
            ("symbol".to_string(), self.denormalize(&symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let row: AsterOrderRow = self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", params).await?;
        Ok(row.into_order_result())
    }

    async fn get_order_info(&self, order_id: &str, force_refresh: bool) -> CoreResult<Option<OrderInfo>> {
        if !force_refresh {
            let cached = self.order_updates.borrow().clone();
            if let Some(info) = &cached {
                if info.order_id == order_id {
                    return Ok(cached);
                }
            }
        }
        self.ensure_authenticated()?;
        let Some((symbol, side)) = self.pending_orders.lock().get(order_id).cloned() else {
            return Ok(self.order_updates.borrow().clone().filter(|i| i.order_id == order_id));
        };
        let params = vec![
            ("symbol".to_string(), self.denormalize(&symbol)),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let row: AsterOrderRow = self.signed_request(reqwest::Method::GET, "/fapi/v1/order", params).await?;
        let result = row.into_order_result();
        Ok(Some(OrderInfo {
            order_id: result.order_id,
            symbol,
            side,
            status: result.status,
            filled_quantity: result.filled_quantity,
            avg_fill_price: result.avg_fill_price,
            fee_paid: Decimal::ZERO,
            fee_currency: QUOTE_SUFFIX.to_string(),
            updated_at: Utc::now().naive_utc(),
        }))
    }

    /// Checks the cached push from the `spawn_order_stream` websocket task
    /// first; if it isn't for this order yet (or the stream isn't running,
    /// e.g. in tests), falls back to polling `get_order_info` with
    /// `force_refresh` until the order reaches a terminal state or
    /// `timeout` elapses.
    async fn await_order_update(&self, order_id: &str, timeout: Duration) -> CoreResult<Option<OrderInfo>> {
        const POLL_INTERVAL: Duration = Duration::from_millis(500);
        if let Some(info) = self.get_order_info(order_id, false).await? {
            if info.status.is_terminal() {
                return Ok(Some(info));
            }
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
            match self.get_order_info(order_id, true).await {
                Ok(Some(info)) if info.status.is_terminal() => return Ok(Some(info)),
                Ok(_) => continue,
                Err(_) => return Ok(None),
            }
        }
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: Decimal) -> CoreResult<bool> {
        self.ensure_authenticated()?;
        #[derive(Deserialize)]
        struct LeverageResponse {
            leverage: i64,
        }
        let params = vec![
            ("symbol".to_string(), self.denormalize(symbol)),
            ("leverage".to_string(), leverage.trunc().to_string()),
        ];
        let resp: LeverageResponse = self.signed_request(reqwest::Method::POST, "/fapi/v1/leverage", params).await?;
        Ok(Decimal::from(resp.leverage) == leverage.trunc())
    }

    async fn min_order_notional(&self, _symbol: &Symbol) -> CoreResult<Option<Decimal>> {
        Ok(Some(Decimal::from(5u8)))
    }

    async fn order_size_increment(&self, _symbol: &Symbol) -> CoreResult<Decimal> {
        Ok(Decimal::new(1, 3)) // 0.001
    }
}

/// Used by tests/mocks that need to push a synthetic terminal order update
/// into an adapter's `await_order_update` stream without a live websocket.
#[allow(dead_code)]
pub(crate) fn push_order_update(tx: &watch::Sender<Option<OrderInfo>>, info: OrderInfo) {
    let _ = tx.send(Some(info));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_denormalize_round_trip() {
        let adapter = AsterAdapter::new(None, None, None);
        for raw in ["BTC", "ETH", "PEPE"] {
            let venue_symbol = adapter.denormalize(&raw.to_string());
            assert_eq!(adapter.normalize_symbol(&venue_symbol), raw);
        }
    }

    #[test]
    fn normalizes_multiplier_prefixed_symbols() {
        let adapter = AsterAdapter::new(None, None, None);
        assert_eq!(adapter.normalize_symbol("1000PEPEUSDT"), "PEPE");
    }

    #[test]
    fn order_status_mapping_covers_every_terminal_state() {
        assert_eq!(order_status_from_aster("NEW"), OrderStatus::Open);
        assert_eq!(order_status_from_aster("PARTIALLY_FILLED"), OrderStatus::PartiallyFilled);
        assert_eq!(order_status_from_aster("FILLED"), OrderStatus::Filled);
        assert_eq!(order_status_from_aster("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(order_status_from_aster("EXPIRED"), OrderStatus::Cancelled);
        assert_eq!(order_status_from_aster("REJECTED"), OrderStatus::Rejected);
    }

    #[test]
    fn order_row_parses_fill_fields_and_clamps_zero_avg_price_to_none() {
        let row = AsterOrderRow {
            order_id: 42,
            status: "FILLED".to_string(),
            executed_qty: "1.500".to_string(),
            avg_price: Some("0".to_string()),
        };
        let result = row.into_order_result();
        assert_eq!(result.order_id, "42");
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_quantity, Decimal::new(15, 1));
        assert_eq!(result.avg_fill_price, None);
    }

    #[test]
    fn exchange_error_reason_extracts_msg_field_and_falls_back_to_raw_body() {
        assert_eq!(
            AsterAdapter::exchange_error_reason(r#"{"code":-2010,"msg":"Account has insufficient balance"}"#),
            "Account has insufficient balance"
        );
        assert_eq!(AsterAdapter::exchange_error_reason("not json"), "not json");
    }

    #[tokio::test]
    async fn place_limit_without_credentials_fails_fast_with_authorization_error() {
        let adapter = AsterAdapter::new(None, None, None);
        let err = adapter
            .place_limit(&"BTC".to_string(), Side::Buy, Decimal::ONE, Decimal::ONE, true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Authorization { .. }));
    }

    #[tokio::test]
    async fn cancel_of_an_order_this_adapter_never_placed_is_an_invariant_error() {
        let adapter = AsterAdapter::new(Some("key".to_string()), Some("secret".to_string()), Some("acct".to_string()));
        let err = adapter.cancel("does-not-exist").await.unwrap_err();
        assert!(matches!(err, CoreError::Invariant(_)));
    }
}
