//! Strategy Orchestrator (C7)
//! Mission: the single outer loop tying C2 (collector) -> C3 (finder) -> C5
//! (executor) -> C6 (lifecycle manager) together on a fixed period.
//! Philosophy: this module owns no domain logic of its own -- every decision
//! it makes was already computed by a lower component; it only sequences
//! calls, enforces the entry budget, and bounds concurrency.
//! Grounded on the teacher's `arbitrage::engine` tick loop for the overall
//! "collect -> rank -> act -> record" shape and `scrapers::binance_session`
//! for the hand-rolled cancellation/drain pattern (`tokio::sync::Notify` +
//! `AtomicBool`, since no cancellation-token crate is in the dependency
//! graph -- spec §9 Open Question resolution, documented in DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDateTime;
use metrics::{counter, histogram};
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};

use crate::arbitrage::finder::{find_opportunities, FilterSpec};
use crate::config::StrategyConfig;
use crate::db::Db;
use crate::executor::{CloseOrderType, OpenParams, TwoLegExecutor};
use crate::funding::FundingCollector;
use crate::models::VenueId;
use crate::position::{EvaluationAction, LifecycleManager};

/// Hand-rolled cooperative cancellation: a single `Notify` woken once,
/// guarded by an `AtomicBool` so late subscribers (a task that checks after
/// the notify already fired) still observe cancellation instead of hanging.
/// This is the full surface a one-shot drain signal needs; pulling in a
/// crate for it would be the only dependency in the tree used for exactly
/// one flag.
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled; otherwise waits for the
    /// next `cancel()`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// One tick's outcome, persisted as an in-memory ring-buffer entry by the
/// caller and returned directly for tests (spec §4.7 step 6; the historical
/// record itself lives outside this crate's scope -- the control API is
/// out-of-scope ambient surface).
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub started_at: Option<NaiveDateTime>,
    pub opportunities_scanned: usize,
    pub opened: usize,
    pub closed: usize,
    pub rebalanced: usize,
    pub collector_errors: usize,
    pub evaluation_errors: usize,
    pub open_errors: usize,
    pub close_errors: usize,
}

pub struct Orchestrator {
    collector: Arc<FundingCollector>,
    executor: Arc<TwoLegExecutor>,
    lifecycle: Arc<LifecycleManager>,
    db: Arc<Db>,
    config: StrategyConfig,
    account_id: String,
    purge_every_n_ticks: u64,
    tick_count: std::sync::atomic::AtomicU64,
}

impl Orchestrator {
    pub fn new(
        collector: Arc<FundingCollector>,
        executor: Arc<TwoLegExecutor>,
        lifecycle: Arc<LifecycleManager>,
        db: Arc<Db>,
        config: StrategyConfig,
        account_id: String,
    ) -> Self {
        Self {
            collector,
            executor,
            lifecycle,
            db,
            config,
            account_id,
            purge_every_n_ticks: 60,
            tick_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Runs the tick loop on `tokio::time::interval(check_interval_seconds)`
    /// until `cancel` fires. No new `open` is attempted once cancellation is
    /// observed, but the in-flight tick (including any rollback) always
    /// completes -- cancellation is only checked between ticks, never
    /// injected into a running one (spec §4.7, §5 "Cancellation &
    /// timeouts").
    pub async fn run(&self, cancel: Arc<CancellationToken>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(self.config.check_interval_seconds));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = crate::now_naive_utc();
                    match self.tick(now).await {
                        Ok(report) => info!(
                            opportunities = report.opportunities_scanned,
                            opened = report.opened,
                            closed = report.closed,
                            rebalanced = report.rebalanced,
                            errors = report.evaluation_errors + report.open_errors + report.close_errors,
                            "orchestrator tick complete"
                        ),
                        Err(e) => error!(error = %e, "orchestrator tick failed; sleeping and retrying next period"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("cancellation observed; draining in-flight monitoring and exiting loop");
                    break;
                }
            }
        }
    }

    /// One full iteration of spec §4.7 steps 1-6. Never panics on a single
    /// venue/position/opportunity failure -- those are logged and folded
    /// into the returned counters, per §7's "a single failed position
    /// evaluation does not affect other positions in the same tick".
    pub async fn tick(&self, now: NaiveDateTime) -> anyhow::Result<TickReport> {
        let span = info_span!("orchestrator_tick", now = %now);
        async {
            let mut report = TickReport { started_at: Some(now), ..Default::default() };

            // 1. Collector completes before anything else reads latest_funding_rates.
            let collector_report = self.collector.tick(now).await;
            report.collector_errors = collector_report.error_count();

            // 2 & 3. Evaluate every open position, bounded concurrency.
            let open_positions = self.db.get_open_positions(Some(self.account_id.clone())).await?;
            let gate = Arc::new(Semaphore::new(self.config.max_concurrent_position_evaluations));
            let mut handles = Vec::with_capacity(open_positions.len());
            for position in open_positions {
                let gate = gate.clone();
                let lifecycle = self.lifecycle.clone();
                let position_id = position.position_id;
                let span = info_span!("evaluate_position", position_id = %position_id);
                handles.push(tokio::spawn(
                    async move {
                        let _permit = gate.acquire_owned().await.expect("semaphore never closed");
                        lifecycle.evaluate(&position, now).await.map(|action| (position, action))
                    }
                    .instrument(span),
                ));
            }

            let mut closing: Vec<(crate::models::Position, crate::models::ExitReason)> = Vec::new();
            let mut open_count = 0usize;
            for handle in handles {
                match handle.await {
                    Ok(Ok((position, action))) => match action {
                        EvaluationAction::ClosingRequested(reason) => closing.push((position, reason)),
                        EvaluationAction::Rebalanced => {
                            report.rebalanced += 1;
                            open_count += 1;
                        }
                        EvaluationAction::Monitoring | EvaluationAction::Deferred => open_count += 1,
                    },
                    Ok(Err(e)) => {
                        warn!(error = %e, "position evaluation failed; retried next tick");
                        report.evaluation_errors += 1;
                        open_count += 1;
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "position evaluation task panicked");
                        report.evaluation_errors += 1;
                    }
                }
            }
            let closing_count = closing.len();

            // Closures requested by C6 run through C5, sequentially -- each
            // close reads/writes the same position row and there is no
            // benefit parallelizing the SQL side of distinct closes either.
            // `dry_run` never touches C6's own writes (risk evaluation and
            // the `closing` transition are analysis, not order placement) --
            // it only gates the two-leg order placement C5 would perform.
            for (position, exit_reason) in &closing {
                if self.config.dry_run {
                    info!(position_id = %position.position_id, exit_reason = ?exit_reason, "dry_run: would close position");
                    report.closed += 1;
                    continue;
                }
                match self
                    .executor
                    .close(
                        position,
                        CloseOrderType::Limit,
                        *exit_reason,
                        StdDuration::from_secs(self.config.order_timeout_seconds),
                        now,
                    )
                    .await
                {
                    Ok(_) => report.closed += 1,
                    Err(e) => {
                        warn!(position_id = %position.position_id, error = %e, "close failed; retried next tick");
                        report.close_errors += 1;
                    }
                }
            }

            // 4. Entry budget.
            let slots = (self.config.max_positions as i64 - open_count as i64 - closing_count as i64)
                .min(self.config.max_new_positions_per_cycle as i64)
                .max(0) as usize;

            if slots > 0 {
                // 5. Rank opportunities and attempt opens sequentially.
                // Venues whose circuit breaker has tripped open are dropped
                // from this tick's scan so C3 doesn't keep ranking pairs
                // against samples a persistently failing venue can no
                // longer refresh.
                let usable: std::collections::HashSet<VenueId> =
                    self.collector.usable_venues(now).into_iter().collect();
                let active_scan_venues: Vec<VenueId> =
                    self.config.scan_venues.iter().filter(|v| usable.is_empty() || usable.contains(*v)).cloned().collect();

                let samples = self
                    .db
                    .get_latest_samples(active_scan_venues.clone(), crate::arbitrage::finder::MAX_SAMPLE_AGE, now)
                    .await?;
                let market_data = self.db.get_market_data(active_scan_venues.clone()).await?;
                let fee_schedules = self.fee_schedules();
                let mut filter: FilterSpec = self.config.filter_spec();
                filter.scan_venues = active_scan_venues;
                filter.limit = slots;

                let opportunities = find_opportunities(now, &samples, &market_data, &fee_schedules, &filter);
                report.opportunities_scanned = opportunities.len();

                let mut opened_this_tick = 0usize;
                for opportunity in opportunities.iter().take(slots) {
                    if self.config.dry_run {
                        info!(symbol = %opportunity.symbol, long = %opportunity.long_venue, short = %opportunity.short_venue, net_apy = %opportunity.net_apy, "dry_run: would open position");
                        opened_this_tick += 1;
                        report.opened += 1;
                        continue;
                    }
                    let params = OpenParams {
                        account_id: self.account_id.clone(),
                        target_margin_usd: self.config.resolved_target_margin(),
                        leverage: self.config.leverage,
                        max_entry_price_divergence_pct: self.config.max_entry_price_divergence_pct,
                        limit_order_offset_pct: self.config.limit_order_offset_pct,
                        order_timeout: StdDuration::from_secs(self.config.order_timeout_seconds),
                    };
                    match self.executor.open(opportunity, params, now).await {
                        Ok(_) => {
                            opened_this_tick += 1;
                            report.opened += 1;
                        }
                        Err(e) => {
                            warn!(symbol = %opportunity.symbol, long = %opportunity.long_venue, short = %opportunity.short_venue, error = %e, "open attempt failed");
                            report.open_errors += 1;
                        }
                    }
                }
                counter!("orchestrator.positions_opened").increment(opened_this_tick as u64);
            }

            // 6. Per-tick metrics.
            counter!("orchestrator.ticks").increment(1);
            counter!("orchestrator.opportunities_scanned").increment(report.opportunities_scanned as u64);
            counter!("orchestrator.positions_closed").increment(report.closed as u64);
            counter!("orchestrator.errors").increment((report.evaluation_errors + report.open_errors + report.close_errors) as u64);
            histogram!("orchestrator.tick_open_positions").record((open_count + closing_count) as f64);

            let n = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
            if n % self.purge_every_n_ticks == 0 {
                match self.db.purge_stale_market_data(chrono::Duration::hours(24), now).await {
                    Ok(purged) if purged > 0 => info!(purged, "purged stale market data rows"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "stale market data purge failed"),
                }
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn fee_schedules(&self) -> HashMap<VenueId, crate::venues::FeeSchedule> {
        self.executor.fee_schedules()
    }
}
