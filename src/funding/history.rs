//! Historical funding analysis helpers (supplemented feature, not in the
//! distilled spec). Grounded on
//! `original_source/funding_rate_service/core/historical_analyzer.py`'s
//! `average_rate`/`rate_volatility` helpers over the `funding_rates` history
//! table. Kept intentionally small -- backtesting/replay remains a
//! Non-goal; this is a liquidity/quality tie-break input for C3, not a
//! simulation engine.

use rust_decimal::Decimal;

/// Arithmetic mean of normalized rates over a window. `None` if the window is empty.
pub fn average_rate(history: &[Decimal]) -> Option<Decimal> {
    if history.is_empty() {
        return None;
    }
    Some(history.iter().sum::<Decimal>() / Decimal::from(history.len()))
}

/// Population standard deviation of normalized rates over a window, as a
/// volatility proxy. `None` if the window has fewer than two samples.
pub fn rate_volatility(history: &[Decimal]) -> Option<Decimal> {
    if history.len() < 2 {
        return None;
    }
    let mean = average_rate(history)?;
    let variance = history
        .iter()
        .map(|r| {
            let d = *r - mean;
            d * d
        })
        .sum::<Decimal>()
        / Decimal::from(history.len());
    Some(variance.sqrt().unwrap_or(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn average_rate_of_empty_window_is_none() {
        assert_eq!(average_rate(&[]), None);
    }

    #[test]
    fn average_rate_is_the_arithmetic_mean() {
        let h = vec![dec!(0.0001), dec!(0.0003), dec!(0.0002)];
        assert_eq!(average_rate(&h), Some(dec!(0.0002)));
    }

    #[test]
    fn volatility_of_constant_series_is_zero() {
        let h = vec![dec!(0.0002); 5];
        assert_eq!(rate_volatility(&h), Some(Decimal::ZERO));
    }

    #[test]
    fn volatility_of_single_sample_is_none() {
        assert_eq!(rate_volatility(&[dec!(0.0001)]), None);
    }
}
