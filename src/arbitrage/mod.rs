//! Opportunity Finder & Fee Calculator (C3 + C4)
//! Mission: rank funding-rate divergences across venue pairs net of fees
//! Philosophy: the edge is in the divergence, not the price; execution (C5)
//! is a separate concern from ranking it

pub mod fees;
pub mod finder;
