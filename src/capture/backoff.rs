// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Restart backoff-with-jitter (§4.1), isolated behind a [`JitterSource`]
//! trait so scenario tests can supply a deterministic sequence instead of
//! `rand`'s thread-local generator.

pub trait JitterSource: Send {
    /// Returns a sample uniformly distributed in `[0.0, 1.0)`.
    fn sample(&mut self) -> f64;
}

#[derive(Default)]
pub struct RandJitter;

impl JitterSource for RandJitter {
    fn sample(&mut self) -> f64 {
        use rand::Rng;
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// A fixed, exhausted-panics sequence for tests (scenario S1).
pub struct ScriptedJitter {
    samples: std::vec::IntoIter<f64>,
}

impl ScriptedJitter {
    pub fn new(samples: impl IntoIterator<Item = f64>) -> Self {
        ScriptedJitter {
            samples: samples.into_iter().collect::<Vec<_>>().into_iter(),
        }
    }
}

impl JitterSource for ScriptedJitter {
    fn sample(&mut self) -> f64 {
        self.samples
            .next()
            .expect("scripted jitter source exhausted")
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffOptions {
    pub restart_delay_ms: i64,
    pub restart_max_delay_ms: i64,
    pub restart_jitter_factor: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffMeta {
    pub base_delay_ms: i64,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
    pub min_jitter_ms: i64,
    pub max_jitter_ms: i64,
    pub applied_jitter_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub delay_ms: i64,
    pub meta: BackoffMeta,
}

/// Computes the delay for restart attempt `attempt` (1-indexed), per §4.1's
/// exact formula: `baseDelayMs = min(max, delay * 2^(attempt-1))`, then a
/// jitter sampled uniformly within bounds that depend on whether this is the
/// first attempt (jitter is one-sided, `[0, base*f]`) or a later one
/// (two-sided, `[-base*f, base*f]`).
pub fn compute(opts: &BackoffOptions, attempt: u32, jitter: &mut dyn JitterSource) -> Backoff {
    let pow = 2f64.powi(attempt.saturating_sub(1) as i32);
    let base_delay_ms = ((opts.restart_delay_ms as f64) * pow)
        .min(opts.restart_max_delay_ms as f64) as i64;

    let (min_jitter_ms, max_jitter_ms) = if attempt <= 1 {
        (0i64, (base_delay_ms as f64 * opts.restart_jitter_factor) as i64)
    } else {
        let bound = (base_delay_ms as f64 * opts.restart_jitter_factor) as i64;
        (-bound, bound)
    };

    let span = (max_jitter_ms - min_jitter_ms) as f64;
    let applied_jitter_ms = min_jitter_ms + (jitter.sample() * span).round() as i64;

    let delay_ms = (base_delay_ms + applied_jitter_ms)
        .clamp(opts.restart_delay_ms, opts.restart_max_delay_ms);

    Backoff {
        delay_ms,
        meta: BackoffMeta {
            base_delay_ms,
            min_delay_ms: opts.restart_delay_ms,
            max_delay_ms: opts.restart_max_delay_ms,
            min_jitter_ms,
            max_jitter_ms,
            applied_jitter_ms,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario S1 from the testable-properties section, verbatim.
    #[test]
    fn s1_restart_backoff_with_jitter() {
        let opts = BackoffOptions {
            restart_delay_ms: 30,
            restart_max_delay_ms: 90,
            restart_jitter_factor: 0.5,
        };
        let mut jitter = ScriptedJitter::new([0.0, 1.0, 0.5]);

        let b1 = compute(&opts, 1, &mut jitter);
        assert_eq!(b1.meta.base_delay_ms, 30);
        assert_eq!(b1.meta.applied_jitter_ms, 0);
        assert_eq!(b1.delay_ms, 30);

        let b2 = compute(&opts, 2, &mut jitter);
        assert_eq!(b2.meta.base_delay_ms, 60);
        assert_eq!(b2.meta.applied_jitter_ms, 30);
        assert_eq!(b2.delay_ms, 90);

        let b3 = compute(&opts, 3, &mut jitter);
        assert_eq!(b3.meta.base_delay_ms, 90);
        assert_eq!(b3.meta.applied_jitter_ms, 0);
        assert_eq!(b3.delay_ms, 90);
    }

    #[test]
    fn delay_never_exceeds_max() {
        let opts = BackoffOptions {
            restart_delay_ms: 30,
            restart_max_delay_ms: 90,
            restart_jitter_factor: 0.5,
        };
        let mut jitter = ScriptedJitter::new([1.0; 10]);
        for attempt in 1..=10 {
            let b = compute(&opts, attempt, &mut jitter);
            assert!(b.delay_ms <= 90);
            assert!(b.delay_ms >= 30);
        }
    }
}
