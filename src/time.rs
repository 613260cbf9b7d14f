//! Timestamps: configurable epoch and unit, monotonic now.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, ErrorKind, Result};

const OBJECT: &str = "time";

/// A point in time, counted in units since the configured epoch.
pub type Time = i64;

/// One nanosecond in `Time` units of the default scale.
pub const NANO: Time = 1;
/// One microsecond in nanoseconds.
pub const MICRO: Time = 1_000;
/// One millisecond in nanoseconds.
pub const MILLI: Time = 1_000_000;
/// One second in nanoseconds.
pub const SECOND: Time = 1_000_000_000;
/// One minute in nanoseconds.
pub const MINUTE: Time = 60 * SECOND;
/// One hour in nanoseconds.
pub const HOUR: Time = 60 * MINUTE;
/// One day in nanoseconds.
pub const DAY: Time = 24 * HOUR;

/// The scale timestamps are expressed in: an epoch offset (seconds
/// relative to the UNIX epoch) and a unit (nanoseconds per tick).
#[derive(Debug, Clone, Copy)]
pub struct TimeScale {
    /// Seconds between the UNIX epoch and this scale's epoch.
    pub epoch: i64,
    /// Nanoseconds per tick; `SECOND` gives per-second granularity.
    pub unit: i64,
}

impl Default for TimeScale {
    fn default() -> Self {
        TimeScale { epoch: 0, unit: 1 }
    }
}

static SCALE: OnceLock<TimeScale> = OnceLock::new();
static LAST: AtomicI64 = AtomicI64::new(i64::MIN);

/// Installs the process-wide time scale. May be called once; later
/// calls have no effect. When never called, the UNIX epoch with
/// nanosecond units applies.
pub fn init(scale: TimeScale) {
    let _ = SCALE.set(scale);
}

fn scale() -> TimeScale {
    SCALE.get().copied().unwrap_or_default()
}

/// Current time, monotonic: never returns a value smaller than a
/// previously returned one, even if the wall clock steps back.
pub fn now() -> Time {
    let t = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => from_unix(d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(_) => 0,
    };
    LAST.fetch_max(t, Ordering::AcqRel).max(t)
}

/// Converts UNIX seconds and nanoseconds to scale units.
pub fn from_unix(secs: i64, nanos: i64) -> Time {
    let s = scale();
    let ns = (secs - s.epoch) * SECOND + nanos;
    ns / s.unit
}

/// Converts a timestamp back to UNIX seconds and nanoseconds.
pub fn to_unix(t: Time) -> (i64, i64) {
    let s = scale();
    let ns = t * s.unit + s.epoch * SECOND;
    (ns.div_euclid(SECOND), ns.rem_euclid(SECOND))
}

/// Converts a `SystemTime` to scale units.
pub fn from_system(st: SystemTime) -> Result<Time> {
    match st.duration_since(UNIX_EPOCH) {
        Ok(d) => Ok(from_unix(d.as_secs() as i64, d.subsec_nanos() as i64)),
        Err(_) => Err(Error::new(ErrorKind::Time, OBJECT, "before UNIX epoch")),
    }
}

/// Renders a timestamp as `YYYY-MM-DDTHH:MM:SS[.fffffffff]`.
pub fn to_string(t: Time) -> Result<String> {
    let (secs, nanos) = to_unix(t);
    let dt = DateTime::<Utc>::from_timestamp(secs, nanos as u32)
        .ok_or_else(|| Error::new(ErrorKind::Time, OBJECT, format!("out of range: {t}")))?;
    if nanos == 0 {
        Ok(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
    } else {
        Ok(dt.format("%Y-%m-%dT%H:%M:%S%.9f").to_string())
    }
}

/// Parses `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS[.f]` into a timestamp.
pub fn from_string(s: &str) -> Result<Time> {
    let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&format!("{s}T00:00:00"), "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| Error::new(ErrorKind::Time, OBJECT, format!("{s}: {e}")))?;
    let dt = dt.and_utc();
    Ok(from_unix(dt.timestamp(), dt.timestamp_subsec_nanos() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let mut prev = now();
        for _ in 0..1000 {
            let t = now();
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn unix_round_trip() {
        let t = from_unix(1_500_000_000, 123);
        let (s, n) = to_unix(t);
        assert_eq!(s, 1_500_000_000);
        assert_eq!(n, 123);
    }

    #[test]
    fn string_round_trip() {
        let t = from_string("2018-06-01T12:30:15").unwrap();
        assert_eq!(to_string(t).unwrap(), "2018-06-01T12:30:15");
    }

    #[test]
    fn date_only_parses() {
        assert!(from_string("2018-06-01").is_ok());
    }
}
