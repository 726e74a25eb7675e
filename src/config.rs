//! Strategy configuration (spec §6 "Configuration")
//! Mission: one document describing everything C3/C5/C6/C7 need to run
//! Philosophy: the document is TOML on disk; secrets come from the environment,
//! mirroring the teacher's `Config::from_env` pattern used across `vault::*`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::arbitrage::finder::FilterSpec;
use crate::models::{Symbol, VenueId};

fn default_leverage() -> Decimal {
    dec!(3)
}
fn default_max_new_positions_per_cycle() -> u32 {
    1
}
fn default_max_entry_price_divergence_pct() -> Decimal {
    dec!(0.01)
}
fn default_min_liquidation_distance_pct() -> Decimal {
    dec!(0.10)
}
fn default_wide_spread_cooldown_minutes() -> i64 {
    60
}
fn default_limit_order_offset_pct() -> Decimal {
    dec!(0.0002)
}
fn default_check_interval_seconds() -> u64 {
    60
}
fn default_max_concurrent_position_evaluations() -> usize {
    8
}
/// `notional = target_exposure * notional_per_exposure_unit` (spec §9, Open Question 1).
/// The original migration (`migrate_target_exposure_to_target_margin.py`) hardcodes 10;
/// we keep it configurable per the spec's explicit instruction not to hardcode it.
fn default_notional_per_exposure_unit() -> Decimal {
    dec!(10)
}
fn default_order_timeout_seconds() -> u64 {
    10
}
/// Spread (fraction of mid) beyond which a leg's BBO counts as "wide" for
/// the C6 cooldown check (spec §4.6 item 5 names the check but not the
/// threshold key; see `position::lifecycle::RiskConfig`).
fn default_max_spread_pct() -> Decimal {
    dec!(0.01)
}

/// The document loaded from TOML, one per running strategy instance. Field
/// names match spec §6 verbatim except where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub scan_venues: Vec<VenueId>,
    #[serde(default)]
    pub mandatory_venue: Option<VenueId>,

    /// USD margin per position. Mutually exclusive with the legacy
    /// `target_exposure` field; see `resolved_target_margin`.
    #[serde(default)]
    pub target_margin: Option<Decimal>,
    /// Legacy notional-denominated field from older config documents.
    #[serde(default)]
    pub target_exposure: Option<Decimal>,
    #[serde(default = "default_notional_per_exposure_unit")]
    pub notional_per_exposure_unit: Decimal,

    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    pub max_positions: u32,
    #[serde(default = "default_max_new_positions_per_cycle")]
    pub max_new_positions_per_cycle: u32,

    pub min_profit_rate: Decimal,
    pub min_hold_hours: Decimal,
    pub max_position_age_hours: Decimal,
    pub profit_erosion_threshold: Decimal,

    pub min_volume_24h: Decimal,
    pub min_oi_usd: Decimal,
    #[serde(default)]
    pub max_oi_usd: Option<Decimal>,
    #[serde(default)]
    pub excluded_symbols: Vec<Symbol>,
    #[serde(default)]
    pub opportunity_limit: usize,

    #[serde(default = "default_max_entry_price_divergence_pct")]
    pub max_entry_price_divergence_pct: Decimal,
    #[serde(default = "default_min_liquidation_distance_pct")]
    pub min_liquidation_distance_pct: Decimal,
    #[serde(default = "default_wide_spread_cooldown_minutes")]
    pub wide_spread_cooldown_minutes: i64,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
    #[serde(default = "default_limit_order_offset_pct")]
    pub limit_order_offset_pct: Decimal,
    #[serde(default = "default_order_timeout_seconds")]
    pub order_timeout_seconds: u64,

    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_position_evaluations")]
    pub max_concurrent_position_evaluations: usize,

    #[serde(default)]
    pub dry_run: bool,
}

impl StrategyConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.target_margin.is_none() && self.target_exposure.is_none() {
            anyhow::bail!("config must set either target_margin or target_exposure");
        }
        if self.scan_venues.len() < 2 {
            anyhow::bail!("scan_venues must list at least two venues for a directed pair to exist");
        }
        Ok(())
    }

    /// Resolves the per-position USD margin, preferring `target_margin` and
    /// falling back to the legacy `target_exposure * notional_per_exposure_unit`
    /// conversion (spec §9 Open Question 1). Logs a deprecation warning when
    /// the legacy field is the one actually used.
    pub fn resolved_target_margin(&self) -> Decimal {
        match (self.target_margin, self.target_exposure) {
            (Some(margin), _) => margin,
            (None, Some(exposure)) => {
                warn!(
                    target_exposure = %exposure,
                    notional_per_exposure_unit = %self.notional_per_exposure_unit,
                    "config uses legacy target_exposure; converting to target_margin -- \
                     update the config document to set target_margin directly"
                );
                exposure * self.notional_per_exposure_unit
            }
            (None, None) => unreachable!("validate() rejects configs with neither field set"),
        }
    }

    pub fn filter_spec(&self) -> FilterSpec {
        FilterSpec {
            min_profit_per_period: self.min_profit_rate,
            max_oi_usd: self.max_oi_usd,
            min_oi_usd: self.min_oi_usd,
            min_volume_24h: self.min_volume_24h,
            max_entry_divergence_pct: self.max_entry_price_divergence_pct,
            scan_venues: self.scan_venues.clone(),
            mandatory_venue: self.mandatory_venue.clone(),
            excluded_symbols: self.excluded_symbols.clone(),
            limit: self.opportunity_limit,
        }
    }

    pub fn risk_config(&self) -> crate::position::RiskConfig {
        crate::position::RiskConfig {
            min_hold_hours: self.min_hold_hours,
            max_position_age_hours: self.max_position_age_hours,
            min_liquidation_distance_pct: self.min_liquidation_distance_pct,
            profit_erosion_threshold: self.profit_erosion_threshold,
            wide_spread_cooldown_minutes: self.wide_spread_cooldown_minutes,
            max_spread_pct: self.max_spread_pct,
        }
    }
}

/// Secrets and per-account identity, loaded from the environment rather than
/// the checked-in TOML document (mirrors the teacher's `dotenv` + `env::var`
/// idiom in `vault::*::from_env`).
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub account_id: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl AccountCredentials {
    pub fn from_env(venue: &VenueId) -> Self {
        let prefix = venue.to_uppercase();
        AccountCredentials {
            account_id: std::env::var(format!("{prefix}_ACCOUNT_ID"))
                .unwrap_or_else(|_| "default".to_string()),
            api_key: std::env::var(format!("{prefix}_API_KEY")).ok(),
            api_secret: std::env::var(format!("{prefix}_API_SECRET")).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
scan_venues = ["aster", "lighter"]
target_margin = "100"
max_positions = 5
min_profit_rate = "0.0002"
min_hold_hours = "1"
max_position_age_hours = "12"
profit_erosion_threshold = "0.4"
min_volume_24h = "100000"
min_oi_usd = "500000"
opportunity_limit = 5
"#
    }

    #[test]
    fn parses_minimal_document_with_defaults_filled_in() {
        let cfg = StrategyConfig::from_toml_str(minimal_toml()).unwrap();
        assert_eq!(cfg.leverage, dec!(3));
        assert_eq!(cfg.max_new_positions_per_cycle, 1);
        assert_eq!(cfg.check_interval_seconds, 60);
        assert_eq!(cfg.resolved_target_margin(), dec!(100));
    }

    #[test]
    fn rejects_document_missing_both_margin_fields() {
        let bad = minimal_toml().replace("target_margin = \"100\"", "");
        assert!(StrategyConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn converts_legacy_target_exposure_via_configurable_factor() {
        let toml_str = minimal_toml()
            .replace("target_margin = \"100\"", "target_exposure = \"10\"\nnotional_per_exposure_unit = \"10\"");
        let cfg = StrategyConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(cfg.resolved_target_margin(), dec!(100));
    }

    #[test]
    fn rejects_fewer_than_two_scan_venues() {
        let bad = minimal_toml().replace(
            r#"scan_venues = ["aster", "lighter"]"#,
            r#"scan_venues = ["aster"]"#,
        );
        assert!(StrategyConfig::from_toml_str(&bad).is_err());
    }
}
