//! Persistence Layer (C8)
//! Mission: the five tables every other component reads/writes, and nothing else.
//! Philosophy: every entity is owned here; in-memory components hold borrowed
//! copies for one tick only (spec §3 "Ownership"). Grounded on the teacher's
//! `signals::db_storage` (WAL-mode SQLite behind `parking_lot::Mutex<Connection>`,
//! `SCHEMA_SQL` constant, `CREATE TABLE IF NOT EXISTS`), generalized from a
//! single connection to the pool size the spec asks for (§5:
//! `max_concurrent_position_evaluations + 4`).

pub mod maintenance;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::models::{
    ExitReason, FundingRateSample, LifecycleStage, MarketData, Position, Side, Symbol, TradeFill,
    TradeType, VenueId,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS funding_rates (
    time TEXT NOT NULL,
    venue TEXT NOT NULL,
    symbol TEXT NOT NULL,
    raw_rate TEXT NOT NULL,
    interval_hours TEXT NOT NULL,
    funding_rate TEXT NOT NULL,
    next_funding_time TEXT
);
CREATE INDEX IF NOT EXISTS idx_funding_rates_lookup ON funding_rates(venue, symbol, time);

CREATE TABLE IF NOT EXISTS latest_funding_rates (
    venue TEXT NOT NULL,
    symbol TEXT NOT NULL,
    raw_rate TEXT NOT NULL,
    interval_hours TEXT NOT NULL,
    funding_rate TEXT NOT NULL,
    next_funding_time TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (venue, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS dex_symbols (
    venue TEXT NOT NULL,
    symbol TEXT NOT NULL,
    volume_24h TEXT,
    open_interest_usd TEXT,
    updated_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (venue, symbol)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS strategy_positions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    long_venue TEXT NOT NULL,
    short_venue TEXT NOT NULL,
    size_usd TEXT NOT NULL,
    entry_long_rate TEXT NOT NULL,
    entry_short_rate TEXT NOT NULL,
    entry_divergence TEXT NOT NULL,
    entry_long_price TEXT NOT NULL,
    entry_short_price TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    cumulative_funding_usd TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    lifecycle_stage TEXT NOT NULL,
    closed_at TEXT,
    pnl_usd TEXT,
    exit_reason TEXT,
    close_degraded INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_positions_account_stage ON strategy_positions(account_id, lifecycle_stage);
-- Spec §3 invariant: at most one open position per (account_id, symbol, long_venue, short_venue).
CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_one_open_per_pair
    ON strategy_positions(account_id, symbol, long_venue, short_venue)
    WHERE lifecycle_stage != 'closed';

CREATE TABLE IF NOT EXISTS trade_fills (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    venue TEXT NOT NULL,
    symbol TEXT NOT NULL,
    trade_type TEXT NOT NULL,
    side TEXT NOT NULL,
    order_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    total_quantity TEXT NOT NULL,
    weighted_avg_price TEXT NOT NULL,
    total_fee TEXT NOT NULL,
    fee_currency TEXT NOT NULL,
    realized_pnl TEXT,
    realized_funding TEXT,
    fill_count INTEGER NOT NULL,
    UNIQUE(position_id, order_id)
);
"#;

/// SQLite permits exactly one writer at a time; under the pool's concurrent
/// writers (collector upserts, orchestrator position evaluations) a second
/// writer must wait out the first's transaction rather than fail immediately
/// with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn dt_to_sql(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn dt_from_sql(s: &str) -> CoreResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| CoreError::Invariant(format!("unparseable timestamp {s}: {e}")))
}

fn dec_to_sql(d: Decimal) -> String {
    d.to_string()
}

fn dec_from_sql(s: &str) -> CoreResult<Decimal> {
    Decimal::from_str(s).map_err(|e| CoreError::Invariant(format!("unparseable decimal {s}: {e}")))
}

/// Partial update applied by C6/C5 to an existing position row. `None` means
/// "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct PositionPatch {
    pub cumulative_funding_usd: Option<Decimal>,
    pub last_heartbeat: Option<NaiveDateTime>,
    pub lifecycle_stage: Option<LifecycleStage>,
    pub closed_at: Option<NaiveDateTime>,
    pub pnl_usd: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub close_degraded: Option<bool>,
}

/// A small fixed-size pool of SQLite connections, sized per spec §5
/// (`max_concurrent_position_evaluations + 4`). Checkout blocks on a
/// semaphore permit; the connection itself never leaves the pool's lock for
/// longer than one blocking-pool task.
pub struct Db {
    conns: Arc<Mutex<VecDeque<Connection>>>,
    gate: Arc<Semaphore>,
    /// Keeps a shared-cache `:memory:` database alive for the pool's
    /// lifetime; SQLite drops a shared-cache in-memory database once its
    /// last connection closes, and the pool's own connections cycle through
    /// `checkout`/`checkin` rather than staying open continuously. `None`
    /// for file-backed databases, which need no such anchor. Wrapped in a
    /// `Mutex` purely so `Db` stays `Sync` (`rusqlite::Connection` isn't) --
    /// nothing ever locks it except `Drop`.
    _memory_sentinel: Option<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> CoreResult<Self> {
        let pool_size = pool_size.max(1);
        let mut conns = VecDeque::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open(path.as_ref())
                .map_err(|e| CoreError::Other(e.into()))?;
            conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| CoreError::Other(e.into()))?;
            conn.execute_batch(SCHEMA_SQL).map_err(|e| CoreError::Other(e.into()))?;
            conns.push_back(conn);
        }
        Ok(Self {
            conns: Arc::new(Mutex::new(conns)),
            gate: Arc::new(Semaphore::new(pool_size)),
            _memory_sentinel: None,
        })
    }

    /// A bare `:memory:` path gives every `Connection::open` call its own
    /// private database -- fine for a single connection, broken for a pool,
    /// since round-robin checkout would scatter writes and reads across
    /// unrelated databases. A named shared-cache URI
    /// (`file:<unique>?mode=memory&cache=shared`) makes every pooled
    /// connection see the same in-memory database instead.
    pub fn open_in_memory(pool_size: usize) -> CoreResult<Self> {
        let pool_size = pool_size.max(1);
        let uri = format!("file:perp-funding-arb-{}?mode=memory&cache=shared", Uuid::new_v4());
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        // SQLite tears the shared-cache database down once its last
        // connection closes; hold this one open for as long as `Db` lives so
        // the pool's connections always find it alive.
        let sentinel = Connection::open_with_flags(&uri, flags).map_err(|e| CoreError::Other(e.into()))?;
        sentinel.busy_timeout(BUSY_TIMEOUT).map_err(|e| CoreError::Other(e.into()))?;
        sentinel.execute_batch(SCHEMA_SQL).map_err(|e| CoreError::Other(e.into()))?;

        let mut conns = VecDeque::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open_with_flags(&uri, flags).map_err(|e| CoreError::Other(e.into()))?;
            conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| CoreError::Other(e.into()))?;
            conns.push_back(conn);
        }
        Ok(Self {
            conns: Arc::new(Mutex::new(conns)),
            gate: Arc::new(Semaphore::new(pool_size)),
            _memory_sentinel: Some(Mutex::new(sentinel)),
        })
    }

    async fn checkout(&self) -> (tokio::sync::OwnedSemaphorePermit, Connection) {
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        let conn = self
            .conns
            .lock()
            .pop_front()
            .expect("permit count matches connection count");
        (permit, conn)
    }

    fn checkin(&self, conn: Connection) {
        self.conns.lock().push_back(conn);
    }

    /// Runs `f` against a pooled connection on a blocking-pool thread and
    /// returns the connection to the pool regardless of outcome.
    async fn run<T, F>(&self, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let (_permit, conn) = self.checkout().await;
        let (result, conn) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (result, conn)
        })
        .await
        .expect("db worker thread panicked");
        self.checkin(conn);
        result.map_err(|e| CoreError::Other(e.into()))
    }

    pub async fn upsert_funding_rate(&self, sample: FundingRateSample) -> CoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO latest_funding_rates
                    (venue, symbol, raw_rate, interval_hours, funding_rate, next_funding_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(venue, symbol) DO UPDATE SET
                    raw_rate = excluded.raw_rate,
                    interval_hours = excluded.interval_hours,
                    funding_rate = excluded.funding_rate,
                    next_funding_time = excluded.next_funding_time,
                    updated_at = MAX(excluded.updated_at, latest_funding_rates.updated_at)
                 WHERE excluded.updated_at >= latest_funding_rates.updated_at",
                params![
                    sample.venue,
                    sample.symbol,
                    dec_to_sql(sample.raw_rate),
                    dec_to_sql(sample.interval_hours),
                    dec_to_sql(sample.normalized_rate),
                    sample.next_funding_time.map(dt_to_sql),
                    dt_to_sql(sample.sampled_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_funding_history(&self, sample: FundingRateSample) -> CoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO funding_rates (time, venue, symbol, raw_rate, interval_hours, funding_rate, next_funding_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    dt_to_sql(sample.sampled_at),
                    sample.venue,
                    sample.symbol,
                    dec_to_sql(sample.raw_rate),
                    dec_to_sql(sample.interval_hours),
                    dec_to_sql(sample.normalized_rate),
                    sample.next_funding_time.map(dt_to_sql),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_market_data(&self, row: MarketData) -> CoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO dex_symbols (venue, symbol, volume_24h, open_interest_usd, updated_at, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(venue, symbol) DO UPDATE SET
                    volume_24h = excluded.volume_24h,
                    open_interest_usd = excluded.open_interest_usd,
                    updated_at = MAX(excluded.updated_at, dex_symbols.updated_at),
                    is_active = 1
                 WHERE excluded.updated_at >= dex_symbols.updated_at",
                params![
                    row.venue,
                    row.symbol,
                    row.volume_24h_usd.map(dec_to_sql),
                    row.open_interest_usd.map(dec_to_sql),
                    dt_to_sql(row.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_latest_samples(
        &self,
        venues: Vec<VenueId>,
        max_age: chrono::Duration,
        now: NaiveDateTime,
    ) -> CoreResult<Vec<FundingRateSample>> {
        let cutoff = dt_to_sql(now - max_age);
        let rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT venue, symbol, raw_rate, interval_hours, funding_rate, next_funding_time, updated_at
                     FROM latest_funding_rates WHERE updated_at >= ?1",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (venue, symbol, raw_rate, interval_hours, funding_rate, next_funding_time, updated_at) in rows {
            if !venues.is_empty() && !venues.contains(&venue) {
                continue;
            }
            out.push(FundingRateSample {
                venue,
                symbol,
                raw_rate: dec_from_sql(&raw_rate)?,
                interval_hours: dec_from_sql(&interval_hours)?,
                normalized_rate: dec_from_sql(&funding_rate)?,
                next_funding_time: next_funding_time.as_deref().map(dt_from_sql).transpose()?,
                sampled_at: dt_from_sql(&updated_at)?,
            });
        }
        Ok(out)
    }

    pub async fn get_market_data(
        &self,
        venues: Vec<VenueId>,
    ) -> CoreResult<HashMap<(VenueId, Symbol), MarketData>> {
        let rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT venue, symbol, volume_24h, open_interest_usd, updated_at FROM dex_symbols WHERE is_active = 1",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = HashMap::new();
        for (venue, symbol, volume_24h, open_interest_usd, updated_at) in rows {
            if !venues.is_empty() && !venues.contains(&venue) {
                continue;
            }
            let data = MarketData {
                venue: venue.clone(),
                symbol: symbol.clone(),
                volume_24h_usd: volume_24h.as_deref().map(dec_from_sql).transpose()?,
                open_interest_usd: open_interest_usd.as_deref().map(dec_from_sql).transpose()?,
                updated_at: dt_from_sql(&updated_at)?,
            };
            out.insert((venue, symbol), data);
        }
        Ok(out)
    }

    pub async fn insert_position(&self, position: Position) -> CoreResult<Uuid> {
        position
            .check_invariants()
            .map_err(CoreError::Invariant)?;
        let id = position.position_id;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO strategy_positions
                    (id, account_id, symbol, long_venue, short_venue, size_usd,
                     entry_long_rate, entry_short_rate, entry_divergence,
                     entry_long_price, entry_short_price, opened_at,
                     cumulative_funding_usd, last_heartbeat, lifecycle_stage,
                     closed_at, pnl_usd, exit_reason, close_degraded)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    position.position_id.to_string(),
                    position.account_id,
                    position.symbol,
                    position.long_venue,
                    position.short_venue,
                    dec_to_sql(position.size_usd),
                    dec_to_sql(position.entry_long_rate),
                    dec_to_sql(position.entry_short_rate),
                    dec_to_sql(position.entry_divergence),
                    dec_to_sql(position.entry_long_price),
                    dec_to_sql(position.entry_short_price),
                    dt_to_sql(position.opened_at),
                    dec_to_sql(position.cumulative_funding_usd),
                    dt_to_sql(position.last_heartbeat),
                    lifecycle_stage_to_sql(position.lifecycle_stage),
                    position.closed_at.map(dt_to_sql),
                    position.pnl_usd.map(dec_to_sql),
                    position.exit_reason.map(exit_reason_to_sql),
                    position.close_degraded as i64,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn update_position(&self, id: Uuid, patch: PositionPatch) -> CoreResult<()> {
        self.run(move |conn| {
            if let Some(v) = patch.cumulative_funding_usd {
                conn.execute(
                    "UPDATE strategy_positions SET cumulative_funding_usd = ?1 WHERE id = ?2",
                    params![dec_to_sql(v), id.to_string()],
                )?;
            }
            if let Some(v) = patch.last_heartbeat {
                conn.execute(
                    "UPDATE strategy_positions SET last_heartbeat = ?1 WHERE id = ?2",
                    params![dt_to_sql(v), id.to_string()],
                )?;
            }
            if let Some(v) = patch.lifecycle_stage {
                conn.execute(
                    "UPDATE strategy_positions SET lifecycle_stage = ?1 WHERE id = ?2",
                    params![lifecycle_stage_to_sql(v), id.to_string()],
                )?;
            }
            if let Some(v) = patch.closed_at {
                conn.execute(
                    "UPDATE strategy_positions SET closed_at = ?1 WHERE id = ?2",
                    params![dt_to_sql(v), id.to_string()],
                )?;
            }
            if let Some(v) = patch.pnl_usd {
                conn.execute(
                    "UPDATE strategy_positions SET pnl_usd = ?1 WHERE id = ?2",
                    params![dec_to_sql(v), id.to_string()],
                )?;
            }
            if let Some(v) = patch.exit_reason {
                conn.execute(
                    "UPDATE strategy_positions SET exit_reason = ?1 WHERE id = ?2",
                    params![exit_reason_to_sql(v), id.to_string()],
                )?;
            }
            if let Some(v) = patch.close_degraded {
                conn.execute(
                    "UPDATE strategy_positions SET close_degraded = ?1 WHERE id = ?2",
                    params![v as i64, id.to_string()],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_open_positions(&self, account_id: Option<String>) -> CoreResult<Vec<Position>> {
        let rows = self
            .run(move |conn| {
                let sql = "SELECT id, account_id, symbol, long_venue, short_venue, size_usd,
                                  entry_long_rate, entry_short_rate, entry_divergence,
                                  entry_long_price, entry_short_price, opened_at,
                                  cumulative_funding_usd, last_heartbeat, lifecycle_stage,
                                  closed_at, pnl_usd, exit_reason, close_degraded
                           FROM strategy_positions
                           WHERE lifecycle_stage != 'closed'
                             AND (?1 IS NULL OR account_id = ?1)";
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(params![account_id], row_to_position_tuple)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(position_from_tuple).collect()
    }

    pub async fn get_position(&self, id: Uuid) -> CoreResult<Option<Position>> {
        let row = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, account_id, symbol, long_venue, short_venue, size_usd,
                            entry_long_rate, entry_short_rate, entry_divergence,
                            entry_long_price, entry_short_price, opened_at,
                            cumulative_funding_usd, last_heartbeat, lifecycle_stage,
                            closed_at, pnl_usd, exit_reason, close_degraded
                     FROM strategy_positions WHERE id = ?1",
                    params![id.to_string()],
                    row_to_position_tuple,
                )
                .optional()
            })
            .await?;
        row.map(position_from_tuple).transpose()
    }

    /// Returns `None` on a `(position_id, order_id)` conflict (spec §3
    /// "Uniqueness", §8 property 7) rather than erroring: a duplicate insert
    /// is a no-op, not a failure.
    pub async fn insert_trade_fill(&self, fill: TradeFill) -> CoreResult<Option<i64>> {
        self.run(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO trade_fills
                    (position_id, account_id, venue, symbol, trade_type, side, order_id,
                     timestamp, total_quantity, weighted_avg_price, total_fee, fee_currency,
                     realized_pnl, realized_funding, fill_count)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    fill.position_id.to_string(),
                    fill.account_id,
                    fill.venue,
                    fill.symbol,
                    trade_type_to_sql(fill.trade_type),
                    side_to_sql(fill.side),
                    fill.order_id,
                    dt_to_sql(fill.timestamp),
                    dec_to_sql(fill.total_quantity),
                    dec_to_sql(fill.weighted_avg_price),
                    dec_to_sql(fill.total_fee),
                    fill.fee_currency,
                    fill.realized_pnl.map(dec_to_sql),
                    fill.realized_funding.map(dec_to_sql),
                    fill.fill_count,
                ],
            )?;
            if changed == 0 {
                Ok(None)
            } else {
                Ok(Some(conn.last_insert_rowid()))
            }
        })
        .await
    }

    /// All fills recorded against a position, oldest first. Used by the
    /// closer to reconstruct entry notional for the PnL formula.
    pub async fn get_fills(&self, position_id: Uuid) -> CoreResult<Vec<TradeFill>> {
        let id = position_id.to_string();
        let rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, position_id, account_id, venue, symbol, trade_type, side, order_id,
                            timestamp, total_quantity, weighted_avg_price, total_fee, fee_currency,
                            realized_pnl, realized_funding, fill_count
                     FROM trade_fills WHERE position_id = ?1 ORDER BY timestamp ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![id], |row| {
                        Ok((
                            row.get::<_, Option<i64>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, String>(9)?,
                            row.get::<_, String>(10)?,
                            row.get::<_, String>(11)?,
                            row.get::<_, String>(12)?,
                            row.get::<_, Option<String>>(13)?,
                            row.get::<_, Option<String>>(14)?,
                            row.get::<_, i64>(15)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(
                |(
                    id,
                    position_id,
                    account_id,
                    venue,
                    symbol,
                    trade_type,
                    side,
                    order_id,
                    timestamp,
                    total_quantity,
                    weighted_avg_price,
                    total_fee,
                    fee_currency,
                    realized_pnl,
                    realized_funding,
                    fill_count,
                )| {
                    Ok(TradeFill {
                        id,
                        position_id: Uuid::parse_str(&position_id)
                            .map_err(|e| CoreError::Invariant(format!("bad position id {position_id}: {e}")))?,
                        account_id,
                        venue,
                        symbol,
                        trade_type: trade_type_from_sql(&trade_type)?,
                        side: side_from_sql(&side)?,
                        order_id,
                        timestamp: dt_from_sql(&timestamp)?,
                        total_quantity: dec_from_sql(&total_quantity)?,
                        weighted_avg_price: dec_from_sql(&weighted_avg_price)?,
                        total_fee: dec_from_sql(&total_fee)?,
                        fee_currency,
                        realized_pnl: realized_pnl.as_deref().map(dec_from_sql).transpose()?,
                        realized_funding: realized_funding.as_deref().map(dec_from_sql).transpose()?,
                        fill_count,
                    })
                },
            )
            .collect()
    }
}

type PositionRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
);

fn row_to_position_tuple(row: &rusqlite::Row) -> rusqlite::Result<PositionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
    ))
}

fn position_from_tuple(row: PositionRow) -> CoreResult<Position> {
    let (
        id, account_id, symbol, long_venue, short_venue, size_usd, entry_long_rate,
        entry_short_rate, entry_divergence, entry_long_price, entry_short_price, opened_at,
        cumulative_funding_usd, last_heartbeat, lifecycle_stage, closed_at, pnl_usd, exit_reason,
        close_degraded,
    ) = row;
    Ok(Position {
        position_id: Uuid::parse_str(&id)
            .map_err(|e| CoreError::Invariant(format!("bad position id {id}: {e}")))?,
        account_id,
        symbol,
        long_venue,
        short_venue,
        size_usd: dec_from_sql(&size_usd)?,
        entry_long_rate: dec_from_sql(&entry_long_rate)?,
        entry_short_rate: dec_from_sql(&entry_short_rate)?,
        entry_divergence: dec_from_sql(&entry_divergence)?,
        entry_long_price: dec_from_sql(&entry_long_price)?,
        entry_short_price: dec_from_sql(&entry_short_price)?,
        opened_at: dt_from_sql(&opened_at)?,
        cumulative_funding_usd: dec_from_sql(&cumulative_funding_usd)?,
        last_heartbeat: dt_from_sql(&last_heartbeat)?,
        lifecycle_stage: lifecycle_stage_from_sql(&lifecycle_stage)?,
        closed_at: closed_at.as_deref().map(dt_from_sql).transpose()?,
        pnl_usd: pnl_usd.as_deref().map(dec_from_sql).transpose()?,
        exit_reason: exit_reason.as_deref().map(exit_reason_from_sql).transpose()?,
        close_degraded: close_degraded != 0,
    })
}

fn lifecycle_stage_to_sql(stage: LifecycleStage) -> &'static str {
    match stage {
        LifecycleStage::Opening => "opening",
        LifecycleStage::Monitoring => "monitoring",
        LifecycleStage::Rebalancing => "rebalancing",
        LifecycleStage::Closing => "closing",
        LifecycleStage::Closed => "closed",
    }
}

fn lifecycle_stage_from_sql(s: &str) -> CoreResult<LifecycleStage> {
    match s {
        "opening" => Ok(LifecycleStage::Opening),
        "monitoring" => Ok(LifecycleStage::Monitoring),
        "rebalancing" => Ok(LifecycleStage::Rebalancing),
        "closing" => Ok(LifecycleStage::Closing),
        "closed" => Ok(LifecycleStage::Closed),
        other => Err(CoreError::Invariant(format!("unknown lifecycle_stage {other}"))),
    }
}

fn exit_reason_to_sql(r: ExitReason) -> &'static str {
    match r {
        ExitReason::MaxAge => "max_age",
        ExitReason::LiquidationRisk => "liquidation_risk",
        ExitReason::ProfitErosion => "profit_erosion",
        ExitReason::PersistentWideSpread => "persistent_wide_spread",
        ExitReason::ManualClose => "manual_close",
    }
}

fn exit_reason_from_sql(s: &str) -> CoreResult<ExitReason> {
    match s {
        "max_age" => Ok(ExitReason::MaxAge),
        "liquidation_risk" => Ok(ExitReason::LiquidationRisk),
        "profit_erosion" => Ok(ExitReason::ProfitErosion),
        "persistent_wide_spread" => Ok(ExitReason::PersistentWideSpread),
        "manual_close" => Ok(ExitReason::ManualClose),
        other => Err(CoreError::Invariant(format!("unknown exit_reason {other}"))),
    }
}

fn trade_type_to_sql(t: TradeType) -> &'static str {
    match t {
        TradeType::Entry => "entry",
        TradeType::Exit => "exit",
    }
}

fn trade_type_from_sql(s: &str) -> CoreResult<TradeType> {
    match s {
        "entry" => Ok(TradeType::Entry),
        "exit" => Ok(TradeType::Exit),
        other => Err(CoreError::Invariant(format!("unknown trade_type {other}"))),
    }
}

fn side_to_sql(s: Side) -> &'static str {
    match s {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn side_from_sql(s: &str) -> CoreResult<Side> {
    match s {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(CoreError::Invariant(format!("unknown side {other}"))),
    }
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

    fn position(account: &str, symbol: &str, long: &str, short: &str, at: NaiveDateTime) -> Position {
        Position {
            position_id: Uuid::new_v4(),
            account_id: account.into(),
            symbol: symbol.into(),
            long_venue: long.into(),
            short_venue: short.into(),
            size_usd: dec!(300),
            entry_long_rate: dec!(0.0001),
            entry_short_rate: dec!(-0.0002),
            entry_divergence: dec!(0.0008),
            entry_long_price: dec!(100),
            entry_short_price: dec!(100),
            opened_at: at,
            cumulative_funding_usd: Decimal::ZERO,
            last_heartbeat: at,
            lifecycle_stage: LifecycleStage::Monitoring,
            closed_at: None,
            pnl_usd: None,
            exit_reason: None,
            close_degraded: false,
        }
    }

    #[tokio::test]
    async fn upsert_then_history_round_trips_through_decimal_strings() {
        let db = Db::open_in_memory(2).unwrap();
        let s = sample("aster", "BTC", dec!(0.0001), ts());
        db.upsert_funding_rate(s.clone()).await.unwrap();
        db.append_funding_history(s.clone()).await.unwrap();

        let latest = db
            .get_latest_samples(vec![], chrono::Duration::minutes(2), ts())
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].normalized_rate, dec!(0.0001));
    }

    #[tokio::test]
    async fn later_sample_overwrites_latest_but_earlier_does_not() {
        let db = Db::open_in_memory(2).unwrap();
        let early = sample("aster", "BTC", dec!(0.0001), ts());
        let later = sample("aster", "BTC", dec!(0.0005), ts() + chrono::Duration::minutes(1));
        db.upsert_funding_rate(later.clone()).await.unwrap();
        db.upsert_funding_rate(early).await.unwrap();

        let latest = db
            .get_latest_samples(vec![], chrono::Duration::minutes(5), ts() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(latest[0].normalized_rate, dec!(0.0005));
    }

    #[tokio::test]
    async fn stale_sample_excluded_by_max_age() {
        let db = Db::open_in_memory(2).unwrap();
        let s = sample("aster", "BTC", dec!(0.0001), ts());
        db.upsert_funding_rate(s).await.unwrap();
        let latest = db
            .get_latest_samples(vec![], chrono::Duration::minutes(2), ts() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert!(latest.is_empty());
    }

    #[tokio::test]
    async fn duplicate_position_for_same_pair_is_rejected_by_unique_index() {
        let db = Db::open_in_memory(2).unwrap();
        let p1 = position("acct1", "BTC", "aster", "lighter", ts());
        let mut p2 = position("acct1", "BTC", "aster", "lighter", ts());
        p2.position_id = Uuid::new_v4();
        db.insert_position(p1).await.unwrap();
        let result = db.insert_position(p2).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn closed_position_does_not_block_reopening_the_same_pair() {
        let db = Db::open_in_memory(2).unwrap();
        let mut p1 = position("acct1", "BTC", "aster", "lighter", ts());
        p1.lifecycle_stage = LifecycleStage::Closed;
        p1.closed_at = Some(ts());
        p1.exit_reason = Some(ExitReason::ManualClose);
        db.insert_position(p1).await.unwrap();

        let p2 = position("acct1", "BTC", "aster", "lighter", ts());
        db.insert_position(p2).await.unwrap();
        let open = db.get_open_positions(Some("acct1".to_string())).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_trade_fill_insert_is_idempotent() {
        let db = Db::open_in_memory(2).unwrap();
        let pos_id = Uuid::new_v4();
        let fill = TradeFill {
            id: None,
            position_id: pos_id,
            account_id: "acct1".into(),
            venue: "aster".into(),
            symbol: "BTC".into(),
            trade_type: TradeType::Entry,
            side: Side::Buy,
            order_id: "order-1".into(),
            timestamp: ts(),
            total_quantity: dec!(1),
            weighted_avg_price: dec!(100),
            total_fee: dec!(0.1),
            fee_currency: "USDT".into(),
            realized_pnl: None,
            realized_funding: None,
            fill_count: 1,
        };
        let first = db.insert_trade_fill(fill.clone()).await.unwrap();
        assert!(first.is_some());
        let second = db.insert_trade_fill(fill).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn update_position_patch_only_touches_named_fields() {
        let db = Db::open_in_memory(2).unwrap();
        let p = position("acct1", "BTC", "aster", "lighter", ts());
        let id = p.position_id;
        db.insert_position(p).await.unwrap();

        db.update_position(
            id,
            PositionPatch {
                lifecycle_stage: Some(LifecycleStage::Closing),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let reloaded = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(reloaded.lifecycle_stage, LifecycleStage::Closing);
        assert_eq!(reloaded.size_usd, dec!(300));
    }

    #[tokio::test]
    async fn get_fills_returns_rows_for_the_position_in_timestamp_order() {
        let db = Db::open_in_memory(2).unwrap();
        let pos_id = Uuid::new_v4();
        let make = |order_id: &str, at: NaiveDateTime| TradeFill {
            id: None,
            position_id: pos_id,
            account_id: "acct1".into(),
            venue: "aster".into(),
            symbol: "BTC".into(),
            trade_type: TradeType::Entry,
            side: Side::Buy,
            order_id: order_id.into(),
            timestamp: at,
            total_quantity: dec!(1),
            weighted_avg_price: dec!(100),
            total_fee: dec!(0.1),
            fee_currency: "USDT".into(),
            realized_pnl: None,
            realized_funding: None,
            fill_count: 1,
        };
        db.insert_trade_fill(make("order-1", ts())).await.unwrap();
        db.insert_trade_fill(make("order-2", ts() + chrono::Duration::seconds(1))).await.unwrap();

        let fills = db.get_fills(pos_id).await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].order_id, "order-1");
        assert_eq!(fills[1].order_id, "order-2");
    }
}
