//! Timestamp encodings used in attributes, revision keys and etags.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Seconds between 0001-01-01 and the unix epoch.
const UNIX_TO_INTERNAL: i64 = 62_135_596_800;

/// RFC3339 with nanoseconds, trailing zeros of the fraction trimmed, always UTC "Z".
pub fn format_rfc3339_nano(t: &DateTime<Utc>) -> String {
    let secs = t.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = t.timestamp_subsec_nanos();
    if nanos == 0 {
        return format!("{}Z", secs);
    }
    let frac = format!("{:09}", nanos);
    format!("{}.{}Z", secs, frac.trim_end_matches('0'))
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::invalid(format!("invalid timestamp '{}': {}", s, e)))
}

/// Client supplied mtime: unix seconds with optional fraction, or RFC3339.
pub fn parse_mtime(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    let (secs, frac) = match s.split_once('.') {
        Some((a, b)) => (a, Some(b)),
        None => (s, None),
    };
    if let Ok(sec) = secs.parse::<i64>() {
        let nanos = match frac {
            None => 0u32,
            Some(f) if !f.is_empty() && f.len() <= 9 && f.chars().all(|c| c.is_ascii_digit()) => {
                let padded = format!("{:0<9}", f);
                padded.parse::<u32>().map_err(|_| Error::invalid(format!("invalid mtime '{}'", s)))?
            }
            Some(_) => return Err(Error::invalid(format!("invalid mtime '{}'", s))),
        };
        return Utc
            .timestamp_opt(sec, nanos)
            .single()
            .ok_or_else(|| Error::invalid(format!("mtime out of range '{}'", s)));
    }
    parse_rfc3339(s)
}

/// Binary time encoding hashed into etags: version byte, seconds since year one,
/// nanoseconds, and the UTC offset marker.
pub fn marshal_binary(t: &DateTime<Utc>) -> [u8; 15] {
    let mut out = [0u8; 15];
    out[0] = 1;
    let sec = t.timestamp() + UNIX_TO_INTERNAL;
    out[1..9].copy_from_slice(&sec.to_be_bytes());
    out[9..13].copy_from_slice(&(t.timestamp_subsec_nanos() as i32).to_be_bytes());
    out[13..15].copy_from_slice(&(-1i16).to_be_bytes());
    out
}

pub fn from_system_time(t: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
