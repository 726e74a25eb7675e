//! Position Lifecycle Manager (C6)
//! Mission: the per-position state machine that decides, each orchestrator
//! tick, whether an open position stays in `monitoring`, needs a rebalance,
//! or should transition to `closing`.

pub mod lifecycle;

pub use lifecycle::{EvaluationAction, LifecycleManager, RiskConfig};
