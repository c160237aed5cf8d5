//! Millisecond-to-second conversion for histogram observations.

/// Convert a millisecond duration to seconds, rounded to three decimal
/// places with ties rounding away from zero (`1234.5` ms → `1.235` s).
///
/// Rounding the millisecond value to a whole number is exactly equivalent
/// to rounding the quotient to three decimals, and avoids a lossy
/// multiply-back through an inexact intermediate.
///
/// Finiteness is validated at event decode; non-finite input yields
/// non-finite output.
pub fn ms_to_secs(ms: f64) -> f64 {
    ms.round() / 1000.0
}
