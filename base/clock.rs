// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2018 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Every timestamp in Guardian (`Event.ts`, suppression timelines, capture
//! timers) is milliseconds since the Unix epoch, so `Clocks` deals only in
//! that unit rather than wrapping a richer calendar type. Call sites that
//! need calendar arithmetic (day boundaries, `YYYY-MM-DD` directories) build
//! a `jiff::Timestamp` from the millis themselves.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Abstract interface to wall-clock time. This is for testability: unit
/// tests that exercise restart backoff or suppression windows use
/// [`SimulatedClocks`] instead of sleeping in real time.
pub trait Clocks: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn now_ms(&self) -> i64 {
        jiff::Timestamp::now().as_millisecond()
    }
}

/// Simulated clock for testing: advances only when told to.
#[derive(Clone, Default)]
pub struct SimulatedClocks(Arc<AtomicI64>);

impl SimulatedClocks {
    pub fn new(start_ms: i64) -> Self {
        SimulatedClocks(Arc::new(AtomicI64::new(start_ms)))
    }

    /// Advances the clock by `ms` without actually sleeping.
    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clocks for SimulatedClocks {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Logs a warning if the guarded operation takes "too long" (>= 1s), using
/// the label produced by a supplied function. Mirrors the
/// measure-then-warn idiom used throughout the capture and retention paths
/// without requiring every call site to hand-roll an `Instant` diff.
pub struct TimerGuard<S: AsRef<str>, F: FnOnce() -> S> {
    label_f: Option<F>,
    start: std::time::Instant,
}

impl<S: AsRef<str>, F: FnOnce() -> S> TimerGuard<S, F> {
    pub fn new(label_f: F) -> Self {
        TimerGuard {
            label_f: Some(label_f),
            start: std::time::Instant::now(),
        }
    }
}

impl<S: AsRef<str>, F: FnOnce() -> S> Drop for TimerGuard<S, F> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!(?elapsed, "{} took a long time", label_f().as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_command() {
        let c = SimulatedClocks::new(1_000);
        assert_eq!(c.now_ms(), 1_000);
        c.advance(500);
        assert_eq!(c.now_ms(), 1_500);
        c.set(42);
        assert_eq!(c.now_ms(), 42);
    }
}
