//! Monotonic microsecond clock used to timestamp the writer period.
//!
//! Mirrors the teacher crate's `current_time_nanos`: a lazily-initialized
//! base `Instant` so repeated calls are cheap and never need `libc::clock_gettime`
//! directly on platforms where `Instant` already wraps `CLOCK_MONOTONIC`.

use std::sync::OnceLock;
use std::time::Instant;

static BASE: OnceLock<Instant> = OnceLock::new();

/// Microseconds since an arbitrary but fixed point in the past. Only valid
/// for computing elapsed durations within one process's lifetime.
pub fn now_micros() -> u64 {
    let base = BASE.get_or_init(Instant::now);
    base.elapsed().as_micros() as u64
}
