//! Venue health tracking
//! Mission: a persistently failing venue stops being retried every tick forever
//! Grounded on `scrapers::binance_session::{SessionState, HeartbeatMonitor}`,
//! generalized from a websocket session's state machine to a simple
//! consecutive-failure circuit since the collector only needs open/half-open/
//! closed, not full session lifecycle tracking.

use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::models::VenueId;

const TRIP_THRESHOLD: u32 = 5;
const HALF_OPEN_AFTER: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct VenueHealth {
    consecutive_failures: u32,
    last_success: Option<NaiveDateTime>,
    last_failure: Option<NaiveDateTime>,
    tripped_at: Option<NaiveDateTime>,
    pub error_count_this_tick: u64,
    pub last_latency_ms: Option<u64>,
}

impl Default for VenueHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            tripped_at: None,
            error_count_this_tick: 0,
            last_latency_ms: None,
        }
    }
}

impl VenueHealth {
    pub fn record_success(&mut self, now: NaiveDateTime, latency_ms: u64) {
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.tripped_at = None;
        self.last_latency_ms = Some(latency_ms);
    }

    pub fn record_failure(&mut self, now: NaiveDateTime) {
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        self.error_count_this_tick += 1;
        if self.consecutive_failures >= TRIP_THRESHOLD && self.tripped_at.is_none() {
            self.tripped_at = Some(now);
        }
    }

    pub fn reset_tick_counters(&mut self) {
        self.error_count_this_tick = 0;
    }

    pub fn state(&self, now: NaiveDateTime) -> CircuitState {
        match self.tripped_at {
            None => CircuitState::Closed,
            Some(tripped_at) if now.signed_duration_since(tripped_at) > HALF_OPEN_AFTER => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    /// Whether C2/C3 should still attempt to use this venue this tick.
    pub fn is_usable(&self, now: NaiveDateTime) -> bool {
        self.state(now) != CircuitState::Open
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    venues: HashMap<VenueId, VenueHealth>,
}

impl HealthRegistry {
    pub fn entry(&mut self, venue: &VenueId) -> &mut VenueHealth {
        self.venues.entry(venue.clone()).or_default()
    }

    pub fn get(&self, venue: &VenueId) -> Option<&VenueHealth> {
        self.venues.get(venue)
    }

    pub fn usable_venues(&self, now: NaiveDateTime) -> Vec<VenueId> {
        self.venues
            .iter()
            .filter(|(_, h)| h.is_usable(now))
            .map(|(v, _)| v.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(minute: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + chrono::Duration::minutes(minute)
    }

    #[test]
    fn trips_open_after_five_consecutive_failures() {
        let mut h = VenueHealth::default();
        for i in 0..5 {
            h.record_failure(ts(i));
        }
        assert_eq!(h.state(ts(5)), CircuitState::Open);
        assert!(!h.is_usable(ts(5)));
    }

    #[test]
    fn goes_half_open_after_cooldown_then_closes_on_success() {
        let mut h = VenueHealth::default();
        for i in 0..5 {
            h.record_failure(ts(i));
        }
        assert_eq!(h.state(ts(10)), CircuitState::HalfOpen);
        assert!(h.is_usable(ts(10)));
        h.record_success(ts(10), 50);
        assert_eq!(h.state(ts(11)), CircuitState::Closed);
    }
}
