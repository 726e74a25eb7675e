//! Domain Entities
//! Mission: Typed, fixed-point representations of every object the core reads or writes
//! Philosophy: No floating point at rest; every entity round-trips through C8 unchanged

pub mod funding_rate;
pub mod market_data;
pub mod opportunity;
pub mod position;
pub mod trade_fill;

pub use funding_rate::{FundingRateSample, CANONICAL_INTERVAL_HOURS, PERIODS_PER_YEAR};
pub use market_data::MarketData;
pub use opportunity::Opportunity;
pub use position::{ExitReason, LifecycleStage, Position};
pub use trade_fill::{Side, TradeFill, TradeType};

/// Canonical venue identifier, lowercase (e.g. "aster", "lighter", "edgex", "grvt", "paradex").
pub type VenueId = String;

/// Canonical symbol identifier: uppercase base asset only, multiplier prefixes stripped
/// (e.g. "BTC", "PEPE" -- never "1000PEPE" or "BTC-PERP").
pub type Symbol = String;
