//! Funding Collector (C2) tick implementation.
//! Mission: fan out across every enabled venue concurrently, normalize and
//! persist what comes back, and never let one venue's failure block another.
//! Grounded on the teacher's `scrapers::binance_session` reconnect/backoff
//! loop generalized from a single websocket feed to N independent REST
//! fan-outs, each isolated behind its own `tokio::time::timeout`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::db::Db;
use crate::models::VenueId;
use crate::venues::health::HealthRegistry;
use crate::venues::VenueAdapter;

/// Per-venue deadline for one collector tick (spec §4.2).
const VENUE_TICK_DEADLINE: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Clone)]
pub struct VenueTickOutcome {
    pub venue: VenueId,
    pub funding_rates: usize,
    pub market_rows: usize,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CollectorTickReport {
    pub started_at: NaiveDateTime,
    pub outcomes: Vec<VenueTickOutcome>,
}

impl CollectorTickReport {
    pub fn error_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

pub struct FundingCollector {
    adapters: Vec<Arc<dyn VenueAdapter>>,
    db: Arc<Db>,
    health: Mutex<HealthRegistry>,
}

impl FundingCollector {
    pub fn new(adapters: Vec<Arc<dyn VenueAdapter>>, db: Arc<Db>) -> Self {
        Self {
            adapters,
            db,
            health: Mutex::new(HealthRegistry::default()),
        }
    }

    /// Venues whose circuit is not tripped open, as of `now` (supplemented
    /// feature: venue health tracking excludes persistently failing venues
    /// from C3 pair enumeration rather than retrying them every tick).
    pub fn usable_venues(&self, now: NaiveDateTime) -> Vec<VenueId> {
        self.health.lock().usable_venues(now)
    }

    /// Runs one collection tick across every adapter concurrently (spec §4.2
    /// step 1). Per-venue isolation: a failed or timed-out venue does not
    /// prevent the others' samples from being persisted.
    pub async fn tick(&self, now: NaiveDateTime) -> CollectorTickReport {
        let futures = self
            .adapters
            .iter()
            .cloned()
            .map(|adapter| self.collect_one(adapter, now));
        let outcomes = futures_util::future::join_all(futures).await;

        for outcome in &outcomes {
            let mut health = self.health.lock();
            let entry = health.entry(&outcome.venue);
            entry.error_count_this_tick = 0;
            if outcome.error.is_some() {
                entry.record_failure(now);
            } else {
                entry.record_success(now, outcome.latency_ms);
            }
        }

        metrics::counter!("funding_collector.ticks_total").increment(1);
        CollectorTickReport { started_at: now, outcomes }
    }

    async fn collect_one(&self, adapter: Arc<dyn VenueAdapter>, now: NaiveDateTime) -> VenueTickOutcome {
        let venue = adapter.venue_id().clone();
        let start = std::time::Instant::now();

        let result = tokio::time::timeout(VENUE_TICK_DEADLINE, async {
            let rates = adapter.fetch_funding_rates().await?;
            let market = adapter.fetch_market_data().await?;
            Ok::<_, crate::errors::CoreError>((rates, market))
        })
        .await;

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("funding_collector.venue_latency_ms", "venue" => venue.clone())
            .record(latency_ms as f64);

        match result {
            Ok(Ok((rates, market))) => {
                let funding_rates = rates.len();
                let market_rows = market.len();
                for (_, sample) in rates {
                    if let Err(e) = self.db.upsert_funding_rate(sample.clone()).await {
                        warn!(venue = %venue, error = %e, "failed to upsert funding rate");
                    }
                    if let Err(e) = self.db.append_funding_history(sample).await {
                        warn!(venue = %venue, error = %e, "failed to append funding history");
                    }
                }
                for (_, row) in market {
                    if let Err(e) = self.db.upsert_market_data(row).await {
                        warn!(venue = %venue, error = %e, "failed to upsert market data");
                    }
                }
                info!(venue = %venue, funding_rates, market_rows, latency_ms, "collector tick ok");
                VenueTickOutcome { venue, funding_rates, market_rows, latency_ms, error: None }
            }
            Ok(Err(e)) => {
                metrics::counter!("funding_collector.venue_errors", "venue" => venue.clone()).increment(1);
                warn!(venue = %venue, error = %e, "collector tick failed");
                VenueTickOutcome { venue, funding_rates: 0, market_rows: 0, latency_ms, error: Some(e.to_string()) }
            }
            Err(_elapsed) => {
                metrics::counter!("funding_collector.venue_errors", "venue" => venue.clone()).increment(1);
                warn!(venue = %venue, "collector tick exceeded 30s deadline");
                VenueTickOutcome {
                    venue,
                    funding_rates: 0,
                    market_rows: 0,
                    latency_ms,
                    error: Some("per-venue collection deadline exceeded".to_string()),
                }
            }
        }
    }
}
