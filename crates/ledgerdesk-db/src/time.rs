//! Timestamp encoding for TEXT columns.
//!
//! Timestamps are stored as RFC 3339 UTC with microsecond precision and a `Z`
//! suffix. That format is fixed width, so lexicographic order in SQL equals
//! chronological order.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, SubsecRound, Utc};

pub fn encode(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    encode(Utc::now())
}

pub fn decode(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') format, "YYYY-MM-DD HH:MM:SS", no timezone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| anyhow!("Invalid timestamp '{}': {}", raw, e))
}

/// The current time, or one microsecond past `after` if the clock has not
/// moved beyond it.
pub fn next_after(after: Option<&str>) -> Result<String> {
    // Compare at stored precision, or a sub-microsecond lead encodes equal to `after`.
    let now = Utc::now().trunc_subsecs(6);
    let Some(prev) = after else {
        return Ok(encode(now));
    };
    let prev = decode(prev)?;
    if now > prev {
        Ok(encode(now))
    } else {
        Ok(encode(prev + Duration::microseconds(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_sorts_chronologically() {
        let a = "2024-01-01T09:59:59.999999Z".parse::<DateTime<Utc>>().unwrap();
        let b = a + Duration::microseconds(1);
        assert!(encode(a) < encode(b));
        assert_eq!(encode(b), "2024-01-01T10:00:00.000000Z");
    }

    #[test]
    fn decode_accepts_sqlite_format() {
        let ts = decode("2024-03-05 10:11:12").unwrap();
        assert_eq!(encode(ts), "2024-03-05T10:11:12.000000Z");
        assert!(decode("yesterday").is_err());
    }

    #[test]
    fn next_after_moves_past_future_timestamp() {
        let future = encode(Utc::now() + Duration::hours(1));
        let next = next_after(Some(&future)).unwrap();
        assert!(next > future);
        assert_eq!(decode(&next).unwrap() - decode(&future).unwrap(), Duration::microseconds(1));
    }

    #[test]
    fn next_after_is_strict_for_back_to_back_calls() {
        for _ in 0..100_000 {
            let prev = now();
            let next = next_after(Some(&prev)).unwrap();
            assert!(next > prev, "{} did not advance past {}", next, prev);
        }
    }
}
