//! Multi-Exchange Funding-Arbitrage Core
//!
//! Eight components, each a module: `venues` (C1), `funding` (C2),
//! `arbitrage` (C3 + C4), `executor` (C5), `position` (C6), `orchestrator`
//! (C7), `db` (C8). `models` holds the shared entities; `config` and
//! `errors` are the ambient stack every component depends on.

pub mod arbitrage;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod funding;
pub mod models;
pub mod orchestrator;
pub mod position;
pub mod venues;

/// Current time as naive UTC, the timestamp representation every entity in
/// `models` stores (spec §4.8: "all timestamps are stored naive UTC").
pub fn now_naive_utc() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}
