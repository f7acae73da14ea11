//! # IDs and Timestamps
//!
//! Opaque unique IDs (used as idempotency keys) and monotonic-ish
//! ISO-8601 UTC timestamps.
//!
//! ## Monotonicity
//! Wall clocks can step backwards (NTP adjustment, VM resume). Watermarks
//! and lock expiry compare timestamps, so [`now`] never returns a value
//! earlier than the previous call within this process: if the OS clock
//! regressed, the last observed millisecond is bumped by one instead.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Last timestamp handed out, in milliseconds since the epoch.
static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// ISO-8601 rendering of the epoch; the default downstream watermark.
pub const EPOCH_ISO: &str = "1970-01-01T00:00:00.000Z";

/// Generates a new opaque unique ID (UUID v4).
///
/// Used for outbox item IDs (which double as idempotency keys), conflict
/// log rows, and any other local primary key.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Returns the current UTC time, never earlier than a previous call.
pub fn now() -> DateTime<Utc> {
    let wall = Utc::now().timestamp_millis();
    let mut prev = LAST_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = if wall > prev { wall } else { prev + 1 };
        match LAST_MILLIS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => {
                // Unwrap-free: millis straight from a valid clock reading
                return Utc
                    .timestamp_millis_opt(next)
                    .single()
                    .unwrap_or_else(Utc::now);
            }
            Err(observed) => prev = observed,
        }
    }
}

/// Returns the current time as an ISO-8601 UTC string with milliseconds.
pub fn now_iso() -> String {
    to_iso(now())
}

/// Renders a timestamp as ISO-8601 UTC with millisecond precision.
///
/// The fixed `.3f` + `Z` shape matches what the remote API and the
/// realtime channel emit, so string comparison of two rendered values
/// agrees with chronological comparison.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parses an ISO-8601 timestamp, tolerating offset forms (`+00:00`).
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
