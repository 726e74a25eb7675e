//! Error taxonomy
//! Mission: every failure mode the core can hit gets a typed variant, per spec §7
//! Philosophy: retried failures stay inside the adapter; everything that
//! surfaces is one of these, never a bare string

use thiserror::Error;

use crate::models::VenueId;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Timeout, 5xx, connection reset -- the adapter has already exhausted
    /// its retry budget (base 1s, max 10s, 3 attempts) before this surfaces.
    #[error("venue {venue} unavailable: {reason}")]
    VenueUnavailable { venue: VenueId, reason: String },

    /// Authentication/authorization failure. Fatal for that venue this tick;
    /// never retried by the adapter.
    #[error("venue {venue} rejected credentials: {reason}")]
    Authorization { venue: VenueId, reason: String },

    #[error("price unavailable on {venue} for {symbol}: {reason}")]
    PriceUnavailable {
        venue: VenueId,
        symbol: String,
        reason: String,
    },

    #[error("order notional below venue minimum on {venue}: {notional} < {minimum}")]
    BelowMinNotional {
        venue: VenueId,
        notional: rust_decimal::Decimal,
        minimum: rust_decimal::Decimal,
    },

    #[error("post-only order crossed the book on {venue} after retry")]
    PostOnlyCrossed { venue: VenueId },

    /// One leg of a two-leg entry filled and the other did not within the
    /// timeout (or the filled quantities diverged too far); the filled leg
    /// was flattened with an emergency reduce-only market order. No
    /// `Position` row was created (spec §4.5).
    #[error("two-leg entry on {symbol} could not be matched on both legs; rolled back")]
    PartialEntryRolledBack { symbol: String },

    #[error("price divergence {actual_pct} exceeds max {max_pct}")]
    DivergenceTooWide {
        actual_pct: rust_decimal::Decimal,
        max_pct: rust_decimal::Decimal,
    },

    /// Insufficient margin, reduce-only rejected with no position, etc.
    /// Aborts the current operation; rollback runs.
    #[error("venue {venue} rejected the order: {reason}")]
    ExchangeRejection { venue: VenueId, reason: String },

    /// Duplicate (position_id, order_id), an impossible state reached, etc.
    /// Logged at ERROR and treated as a no-op by the caller.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Samples older than 2 minutes, or a leg's BBO unavailable for a risk
    /// check. Never surfaced as a hard error -- callers branch on this
    /// variant to defer rather than fail.
    #[error("data stale: {0}")]
    DataStale(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
