// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Motion detection (§4.2): a stateless-per-frame call over a
//! [`MotionScorer`] that turns a frame into a scalar diff signal, behind a
//! debounce/cooldown/adaptive-baseline state machine that IS specified.

/// Produces the per-frame diff signal the motion state machine thresholds.
/// Kept as a trait so tests can supply scripted scores instead of decoding
/// real PNG frames and diffing pixels.
pub trait MotionScorer: Send {
    /// Returns `(mean_absolute_diff, fraction_over_pixel_threshold)` between
    /// `frame` and the previous frame, or `None` if there is no previous
    /// frame yet (first call).
    fn score(&mut self, frame: &[u8]) -> Option<(f64, f64)>;
}

/// Decodes each incoming PNG frame and diffs it against the previous one,
/// the same per-pixel absolute difference the snapshot diff endpoint uses.
/// A pixel counts toward `fraction_over_pixel_threshold` when its summed RGB
/// absolute difference exceeds `pixel_diff_threshold`.
pub struct PngDiffScorer {
    pixel_diff_threshold: u32,
    previous: Option<image::RgbaImage>,
}

impl PngDiffScorer {
    pub fn new(pixel_diff_threshold: u32) -> Self {
        PngDiffScorer {
            pixel_diff_threshold,
            previous: None,
        }
    }
}

impl MotionScorer for PngDiffScorer {
    fn score(&mut self, frame: &[u8]) -> Option<(f64, f64)> {
        let decoded = image::load_from_memory_with_format(frame, image::ImageFormat::Png)
            .ok()?
            .to_rgba8();
        let Some(previous) = self.previous.replace(decoded) else {
            return None;
        };
        let current = self.previous.as_ref().unwrap();
        if previous.dimensions() != current.dimensions() {
            return None;
        }
        let mut sum_diff = 0u64;
        let mut over = 0u64;
        let mut pixels = 0u64;
        for (a, b) in previous.pixels().zip(current.pixels()) {
            let d = a[0].abs_diff(b[0]) as u32 + a[1].abs_diff(b[1]) as u32 + a[2].abs_diff(b[2]) as u32;
            sum_diff += d as u64;
            if d > self.pixel_diff_threshold {
                over += 1;
            }
            pixels += 1;
        }
        if pixels == 0 {
            return None;
        }
        Some((sum_diff as f64 / pixels as f64, over as f64 / pixels as f64))
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub diff_threshold_multiple: f64,
    pub adaptive_area_threshold: f64,
    pub debounce_frames: u32,
    pub backoff_frames: u32,
    pub min_interval_ms: i64,
    pub baseline_alpha: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    Debouncing(u32),
    Cooldown(u32),
}

pub struct MotionDetector {
    options: Options,
    baseline_diff: f64,
    phase: Phase,
    last_event_ts: Option<i64>,
}

pub struct Outcome {
    pub triggered: bool,
}

impl MotionDetector {
    pub fn new(options: Options) -> Self {
        MotionDetector {
            options,
            baseline_diff: 0.0,
            phase: Phase::Idle,
            last_event_ts: None,
        }
    }

    pub fn update_options(&mut self, options: Options) {
        self.options = options;
    }

    /// Feeds one `(mean_diff, area_fraction)` sample (already computed by a
    /// [`MotionScorer`]) through the debounce/cooldown/rate-limit state
    /// machine, returning whether this frame should publish an event.
    pub fn handle_sample(&mut self, mean_diff: f64, area_fraction: f64, ts: i64) -> Outcome {
        self.baseline_diff = self.options.baseline_alpha * mean_diff
            + (1.0 - self.options.baseline_alpha) * self.baseline_diff;

        if let Phase::Cooldown(remaining) = self.phase {
            self.phase = if remaining <= 1 {
                Phase::Idle
            } else {
                Phase::Cooldown(remaining - 1)
            };
            return Outcome { triggered: false };
        }

        let candidate = mean_diff > self.baseline_diff * self.options.diff_threshold_multiple
            && area_fraction >= self.options.adaptive_area_threshold;

        if !candidate {
            self.phase = Phase::Idle;
            return Outcome { triggered: false };
        }

        let consecutive = match self.phase {
            Phase::Debouncing(n) => n + 1,
            _ => 1,
        };

        if consecutive < self.options.debounce_frames {
            self.phase = Phase::Debouncing(consecutive);
            return Outcome { triggered: false };
        }

        if let Some(last) = self.last_event_ts {
            if ts - last < self.options.min_interval_ms {
                self.phase = Phase::Debouncing(consecutive);
                return Outcome { triggered: false };
            }
        }

        self.last_event_ts = Some(ts);
        self.phase = Phase::Cooldown(self.options.backoff_frames);
        Outcome { triggered: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Options {
        Options {
            diff_threshold_multiple: 2.0,
            adaptive_area_threshold: 0.05,
            debounce_frames: 2,
            backoff_frames: 3,
            min_interval_ms: 1000,
            baseline_alpha: 0.1,
        }
    }

    #[test]
    fn requires_consecutive_frames_before_firing() {
        let mut d = MotionDetector::new(opts());
        // Warm the baseline with quiet frames first.
        for ts in 0..5 {
            d.handle_sample(1.0, 0.0, ts * 100);
        }
        assert!(!d.handle_sample(50.0, 0.5, 500).triggered);
        assert!(d.handle_sample(50.0, 0.5, 600).triggered);
    }

    #[test]
    fn enters_cooldown_after_firing() {
        let mut d = MotionDetector::new(opts());
        for ts in 0..5 {
            d.handle_sample(1.0, 0.0, ts * 100);
        }
        d.handle_sample(50.0, 0.5, 500);
        assert!(d.handle_sample(50.0, 0.5, 600).triggered);
        // Still within cooldown frames; must not trigger again immediately.
        assert!(!d.handle_sample(50.0, 0.5, 700).triggered);
        assert!(!d.handle_sample(50.0, 0.5, 800).triggered);
        assert!(!d.handle_sample(50.0, 0.5, 900).triggered);
    }

    #[test]
    fn respects_min_interval_after_cooldown() {
        let mut d = MotionDetector::new(opts());
        for ts in 0..5 {
            d.handle_sample(1.0, 0.0, ts * 100);
        }
        d.handle_sample(50.0, 0.5, 500);
        d.handle_sample(50.0, 0.5, 600); // fires
        d.handle_sample(50.0, 0.5, 700);
        d.handle_sample(50.0, 0.5, 800);
        d.handle_sample(50.0, 0.5, 900); // cooldown ends here
        // Debounce restarts; min_interval_ms=1000 since ts=600 blocks an
        // immediate re-fire at ts=1000.
        assert!(!d.handle_sample(50.0, 0.5, 1000).triggered);
    }
}
