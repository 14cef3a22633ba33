// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Audio anomaly detection (§4.2): rolling RMS/spectral-centroid features
//! over a Hanning-windowed PCM buffer, EMA baselines, and day/night
//! threshold blending with an eased ratio at the blend boundary.

use std::collections::VecDeque;

/// Extracts per-hop features from a window of samples. Isolated behind a
/// trait so the threshold-blending/accumulation state machine (the part
/// that's actually specified) can be tested without a real FFT.
pub trait AudioFeatureExtractor: Send {
    /// Returns `(rms, spectral_centroid)` for one Hanning-windowed hop.
    fn extract(&mut self, window: &[i16]) -> (f64, f64);
}

#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
    pub rms: f64,
    pub centroid_jump: f64,
}

#[derive(Clone, Debug)]
pub struct DayNightOptions {
    pub day: Thresholds,
    pub night: Thresholds,
    /// Hours (0-23, start inclusive, end exclusive, may wrap past midnight)
    /// during which the night profile is active outside the blend window.
    pub night_hours: (u8, u8),
    pub blend_minutes: f64,
}

#[derive(Clone, Debug)]
pub struct Options {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub hop_size: usize,
    pub baseline_alpha: f64,
    pub min_trigger_duration_ms: i64,
    pub min_interval_ms: i64,
    pub day_night: DayNightOptions,
}

impl Options {
    fn hop_duration_ms(&self) -> f64 {
        1000.0 * self.hop_size as f64 / self.sample_rate as f64
    }
}

/// Computes the eased blend weight for the night profile at a given
/// hour-of-day-in-minutes `minute_of_day`, per §4.2: within `blendMinutes/2`
/// of a day/night boundary, thresholds are a weighted average using
/// `w = 1 - r^2` where `r` is the normalized distance to the boundary.
fn night_weight(minute_of_day: f64, opts: &DayNightOptions) -> f64 {
    let (start_h, end_h) = opts.day_night_boundaries_in_minutes();
    let half_blend = opts.blend_minutes / 2.0;
    if half_blend <= 0.0 {
        return if opts.is_night_hour(minute_of_day) { 1.0 } else { 0.0 };
    }

    for boundary in [start_h, end_h] {
        let dist = circular_distance_minutes(minute_of_day, boundary);
        if dist <= half_blend {
            let r = dist / half_blend;
            let w = 1.0 - r * r;
            // Entering night at `start_h`: weight toward night increases as
            // we approach/pass the boundary. Entering day at `end_h`: weight
            // toward night decreases. We disambiguate by which side of the
            // boundary we're on using the night-hour test at the boundary's
            // "far" side.
            let approaching_night = boundary == start_h;
            let eased = 1.0 - w;
            return if approaching_night { 0.5 + 0.5 * eased * sign(minute_of_day, boundary) } else {
                0.5 - 0.5 * eased * sign(minute_of_day, boundary)
            }
            .clamp(0.0, 1.0);
        }
    }
    if opts.is_night_hour(minute_of_day) { 1.0 } else { 0.0 }
}

fn sign(minute_of_day: f64, boundary: f64) -> f64 {
    let diff = ((minute_of_day - boundary + 720.0).rem_euclid(1440.0)) - 720.0;
    if diff >= 0.0 { 1.0 } else { -1.0 }
}

fn circular_distance_minutes(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(1440.0);
    d.min(1440.0 - d)
}

impl DayNightOptions {
    fn day_night_boundaries_in_minutes(&self) -> (f64, f64) {
        (self.night_hours.0 as f64 * 60.0, self.night_hours.1 as f64 * 60.0)
    }

    fn is_night_hour(&self, minute_of_day: f64) -> bool {
        let hour = (minute_of_day / 60.0).rem_euclid(24.0);
        let (start, end) = (self.night_hours.0 as f64, self.night_hours.1 as f64);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Blends day and night thresholds for the given minute-of-day.
    pub fn effective_thresholds(&self, minute_of_day: f64) -> Thresholds {
        let w = night_weight(minute_of_day, self);
        Thresholds {
            rms: self.day.rms * (1.0 - w) + self.night.rms * w,
            centroid_jump: self.day.centroid_jump * (1.0 - w) + self.night.centroid_jump * w,
        }
    }
}

pub struct Outcome {
    pub triggered: bool,
}

/// A direct (non-FFT) Hanning-windowed spectral centroid and RMS extractor.
/// `O(window^2)`, which is fine at the hop sizes this detector runs at and
/// avoids pulling in an FFT crate the rest of the stack has no other use for.
pub struct DftFeatureExtractor {
    sample_rate: u32,
}

impl DftFeatureExtractor {
    pub fn new(sample_rate: u32) -> Self {
        DftFeatureExtractor { sample_rate }
    }
}

impl AudioFeatureExtractor for DftFeatureExtractor {
    fn extract(&mut self, window: &[i16]) -> (f64, f64) {
        let n = window.len();
        if n == 0 {
            return (0.0, 0.0);
        }
        let windowed: Vec<f64> = window
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let hann = 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1).max(1) as f64).cos();
                s as f64 * hann
            })
            .collect();

        let rms = (windowed.iter().map(|v| v * v).sum::<f64>() / n as f64).sqrt();

        let bins = n / 2;
        let mut weighted_sum = 0.0;
        let mut magnitude_sum = 0.0;
        for k in 0..bins.max(1) {
            let mut re = 0.0;
            let mut im = 0.0;
            for (t, &x) in windowed.iter().enumerate() {
                let angle = -2.0 * std::f64::consts::PI * k as f64 * t as f64 / n as f64;
                re += x * angle.cos();
                im += x * angle.sin();
            }
            let magnitude = (re * re + im * im).sqrt();
            let freq_hz = k as f64 * self.sample_rate as f64 / n as f64;
            weighted_sum += freq_hz * magnitude;
            magnitude_sum += magnitude;
        }
        let centroid = if magnitude_sum > 0.0 { weighted_sum / magnitude_sum } else { 0.0 };
        (rms, centroid)
    }
}

pub struct AudioAnomalyDetector {
    options: Options,
    fifo: VecDeque<i16>,
    baseline_rms: f64,
    baseline_centroid: f64,
    rms_duration_ms: f64,
    centroid_duration_ms: f64,
    last_event_ts: Option<i64>,
}

impl AudioAnomalyDetector {
    pub fn new(options: Options) -> Self {
        AudioAnomalyDetector {
            options,
            fifo: VecDeque::new(),
            baseline_rms: 0.0,
            baseline_centroid: 0.0,
            rms_duration_ms: 0.0,
            centroid_duration_ms: 0.0,
            last_event_ts: None,
        }
    }

    /// Truncates FIFOs and resets accumulators on a window-geometry change,
    /// per §4.2's `updateOptions` contract.
    pub fn update_options(&mut self, options: Options) {
        self.fifo.truncate(options.frame_size);
        self.rms_duration_ms = 0.0;
        self.centroid_duration_ms = 0.0;
        self.options = options;
    }

    /// Feeds PCM samples in, draining complete hops through `extractor`.
    /// `minute_of_day` drives the day/night threshold blend.
    pub fn handle_samples(
        &mut self,
        samples: &[i16],
        ts: i64,
        minute_of_day: f64,
        extractor: &mut dyn AudioFeatureExtractor,
    ) -> Outcome {
        self.fifo.extend(samples.iter().copied());
        let mut triggered = false;

        while self.fifo.len() >= self.options.frame_size {
            let window: Vec<i16> = self.fifo.iter().take(self.options.frame_size).copied().collect();
            for _ in 0..self.options.hop_size.min(self.fifo.len()) {
                self.fifo.pop_front();
            }

            let (rms, centroid) = extractor.extract(&window);
            self.baseline_rms = self.options.baseline_alpha * rms
                + (1.0 - self.options.baseline_alpha) * self.baseline_rms;
            self.baseline_centroid = self.options.baseline_alpha * centroid
                + (1.0 - self.options.baseline_alpha) * self.baseline_centroid;

            let thresholds = self.options.day_night.effective_thresholds(minute_of_day);
            let hop_ms = self.options.hop_duration_ms();
            let rms_triggered = (rms - self.baseline_rms) >= thresholds.rms;
            let centroid_triggered = (centroid - self.baseline_centroid).abs() >= thresholds.centroid_jump;

            if rms_triggered {
                self.rms_duration_ms += hop_ms;
            } else {
                self.rms_duration_ms = (self.rms_duration_ms - hop_ms).max(0.0);
            }
            if centroid_triggered {
                self.centroid_duration_ms += hop_ms;
            } else {
                self.centroid_duration_ms = (self.centroid_duration_ms - hop_ms).max(0.0);
            }

            let duration_met = self.rms_duration_ms >= self.options.min_trigger_duration_ms as f64
                || self.centroid_duration_ms >= self.options.min_trigger_duration_ms as f64;
            let interval_ok = self
                .last_event_ts
                .map(|last| ts - last >= self.options.min_interval_ms)
                .unwrap_or(true);

            if duration_met && interval_ok {
                self.last_event_ts = Some(ts);
                triggered = true;
            }
        }

        Outcome { triggered }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_weights_are_equal_at_exact_midpoint() {
        let opts = DayNightOptions {
            day: Thresholds { rms: 10.0, centroid_jump: 5.0 },
            night: Thresholds { rms: 20.0, centroid_jump: 15.0 },
            night_hours: (22, 6),
            blend_minutes: 60.0,
        };
        // Midpoint of the blend window straddling the 22:00 boundary.
        let midpoint = 22.0 * 60.0;
        let t = opts.effective_thresholds(midpoint);
        // Halfway between day and night thresholds.
        assert!((t.rms - 15.0).abs() < 1e-6);
        assert!((t.centroid_jump - 10.0).abs() < 1e-6);
    }

    #[test]
    fn deep_night_uses_night_profile_fully() {
        let opts = DayNightOptions {
            day: Thresholds { rms: 10.0, centroid_jump: 5.0 },
            night: Thresholds { rms: 20.0, centroid_jump: 15.0 },
            night_hours: (22, 6),
            blend_minutes: 60.0,
        };
        let deep_night = 2.0 * 60.0; // 2am, far from both boundaries.
        let t = opts.effective_thresholds(deep_night);
        assert!((t.rms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn midday_uses_day_profile_fully() {
        let opts = DayNightOptions {
            day: Thresholds { rms: 10.0, centroid_jump: 5.0 },
            night: Thresholds { rms: 20.0, centroid_jump: 15.0 },
            night_hours: (22, 6),
            blend_minutes: 60.0,
        };
        let noon = 12.0 * 60.0;
        let t = opts.effective_thresholds(noon);
        assert!((t.rms - 10.0).abs() < 1e-6);
    }
}
