//! Monotonic microsecond timestamps shared by the sender, receiver and
//! monitoring ring so "wall time" always means the same clock. Built on
//! `Instant` rather than `SystemTime`, since a latency budget measured
//! against a clock that can jump backward on an NTP step is not a latency
//! budget.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

pub fn now_us() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}
