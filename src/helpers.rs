//! Small conversions shared by the store, extractor, pacing and poller code.
//!
//! Weather values are persisted as `NUMERIC` rounded to one decimal place so that
//! the same upstream slot always produces byte-identical rows. Geo values keep
//! full precision. Non-finite floats never reach the database.

use chrono::{DateTime, Duration, DurationRound, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Decimal <-> f64
// ---------------------------------------------------------------------------

/// Round a weather value to 0.1 and convert it to `Decimal`.
pub(crate) fn weather_decimal(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(value = v, "non-finite weather value, storing 0");
        return Decimal::ZERO;
    }
    Decimal::from_f64((v * 10.0).round() / 10.0)
        .map(|d| d.round_dp(1))
        .unwrap_or_default()
}

pub(crate) fn opt_weather_decimal(v: Option<f64>) -> Option<Decimal> {
    v.map(weather_decimal)
}

/// Convert a geographic value (lat, lon, elevation, distance) at full precision.
#[cfg(test)]
pub(crate) fn geo_decimal(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(value = v, "non-finite geo value, storing 0");
        return Decimal::ZERO;
    }
    Decimal::from_f64(v).unwrap_or_default()
}

/// `Decimal` to `f64`, 0.0 when the value cannot be represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub(crate) fn opt_dec_to_f64(d: Option<Decimal>) -> Option<f64> {
    d.and_then(|v| v.to_f64())
}

// ---------------------------------------------------------------------------
// Time arithmetic
// ---------------------------------------------------------------------------

/// `start` plus a fractional number of hours, rounded to the millisecond.
/// Offsets outside the representable range leave `start` unchanged.
pub(crate) fn add_hours(start: DateTime<Utc>, hours: f64) -> DateTime<Utc> {
    if !hours.is_finite() {
        return start;
    }
    let ms = (hours * 3_600_000.0).round() as i64;
    start
        .checked_add_signed(Duration::milliseconds(ms.max(-i64::MAX)))
        .unwrap_or(start)
}

/// Truncate to the start of the hour.
pub(crate) fn floor_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(Duration::hours(1)).unwrap_or(dt)
}

/// Round up to the next whole hour; whole hours are returned unchanged.
pub(crate) fn ceil_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    let floored = floor_to_hour(dt);
    if floored == dt {
        dt
    } else {
        floored + Duration::hours(1)
    }
}
