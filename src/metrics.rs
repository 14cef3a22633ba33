// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The metrics registry (C7): an explicit, mutex-protected struct passed to
//! constructors rather than a global singleton, per the design notes on
//! "global metrics singleton". Tests construct a fresh one per case instead
//! of resetting shared state.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum PipelineKind {
    Ffmpeg,
    Audio,
}

impl PipelineKind {
    fn as_str(self) -> &'static str {
        match self {
            PipelineKind::Ffmpeg => "ffmpeg",
            PipelineKind::Audio => "audio",
        }
    }
}

const DELAY_BUCKETS: &[(&str, i64)] = &[
    ("<25", 25),
    ("25-50", 50),
    ("50-100", 100),
    ("100-250", 250),
    ("250-500", 500),
    ("500-1000", 1000),
    (">=1000", i64::MAX),
];

const ATTEMPT_BUCKETS: &[(&str, i64)] = &[
    ("1", 1),
    ("2", 2),
    ("3", 3),
    ("4-5", 5),
    ("6-10", 10),
    (">10", i64::MAX),
];

fn bucket_for(buckets: &[(&str, i64)], value: i64) -> &'static str {
    for (label, max) in buckets {
        if value <= *max {
            return label;
        }
    }
    buckets.last().unwrap().0
}

#[derive(Clone, Debug, Default)]
pub struct RestartDescriptor {
    pub reason: String,
    pub attempt: u32,
    pub delay_ms: i64,
    pub jitter_ms: i64,
    pub at: i64,
}

fn restart_descriptor_json(desc: &RestartDescriptor) -> serde_json::Value {
    serde_json::json!({
        "reason": desc.reason,
        "attempt": desc.attempt,
        "delayMs": desc.delay_ms,
        "jitterMs": desc.jitter_ms,
        "at": desc.at,
    })
}

/// Per-channel restart history is capped at this many entries (oldest
/// dropped first), matching the digest's `historyLimit` field.
const RESTART_HISTORY_LIMIT: usize = 20;

#[derive(Clone, Debug, Default)]
pub struct ChannelHealth {
    pub severity: Option<String>,
    pub reason: Option<String>,
    pub degraded_since: Option<i64>,
}

#[derive(Clone, Debug, Default)]
struct ChannelPipelineStats {
    restarts: u64,
    by_reason: BTreeMap<String, u64>,
    last_restart: Option<RestartDescriptor>,
    last_restart_at: Option<i64>,
    delay_histogram: BTreeMap<&'static str, u64>,
    attempt_histogram: BTreeMap<&'static str, u64>,
    health: ChannelHealth,
    restart_history: VecDeque<RestartDescriptor>,
    watchdog_backoff_ms: i64,
    last_watchdog_jitter_ms: i64,
    dropped_frames: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct ChannelTimers {
    watchdog_timeout_ms: i64,
    idle_timeout_ms: i64,
    start_timeout_ms: i64,
}

#[derive(Clone, Debug, Default)]
struct TransportFallbackStats {
    total: u64,
    by_channel: BTreeMap<String, (u64, Option<(String, String, String)>)>,
    last: Option<(String, String, String)>,
}

#[derive(Clone, Debug, Default)]
struct PipelineFamily {
    restarts: u64,
    by_reason: BTreeMap<String, u64>,
    last_restart: Option<RestartDescriptor>,
    last_restart_at: Option<i64>,
    by_channel: BTreeMap<String, ChannelPipelineStats>,
    transport_fallbacks: TransportFallbackStats,
    timers_by_channel: BTreeMap<String, ChannelTimers>,
}

#[derive(Clone, Debug, Default)]
struct RetentionStats {
    runs: u64,
    last_run_at: Option<i64>,
    warnings: u64,
    warnings_by_camera: BTreeMap<String, u64>,
    last_warning: Option<String>,
    removed_events: u64,
    archived_snapshots: u64,
    pruned_archives: u64,
    disk_savings_bytes: u64,
    totals_by_camera: BTreeMap<String, (u64, u64)>,
}

#[derive(Default)]
struct Inner {
    log_by_level: BTreeMap<String, u64>,
    /// The most recently observed log level, used to derive the
    /// `guardian_log_level_state` gauge and detect transitions for
    /// `guardian_log_level_change_total`.
    current_log_level: Option<String>,
    log_level_changes: u64,
    pipelines: BTreeMap<&'static str, PipelineFamily>,
    detector_counters: BTreeMap<String, BTreeMap<String, u64>>,
    detector_latency: BTreeMap<String, (u64, u64)>,
    retention: RetentionStats,
}

/// Process-wide counters and histograms, owned by whatever constructs the
/// capture/detector/retention subsystems and handed to them by reference.
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_log_level(&self, level: &str) {
        let mut inner = self.inner.lock().unwrap();
        *inner.log_by_level.entry(level.to_string()).or_default() += 1;
        if inner.current_log_level.as_deref() != Some(level) {
            inner.log_level_changes += 1;
            inner.current_log_level = Some(level.to_string());
        }
    }

    pub fn record_pipeline_restart(
        &self,
        kind: PipelineKind,
        channel: &str,
        desc: RestartDescriptor,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.pipelines.entry(kind.as_str()).or_default();
        family.restarts += 1;
        *family.by_reason.entry(desc.reason.clone()).or_default() += 1;
        family.last_restart_at = Some(desc.at);

        let chan = family.by_channel.entry(channel.to_string()).or_default();
        chan.restarts += 1;
        *chan.by_reason.entry(desc.reason.clone()).or_default() += 1;
        *chan
            .delay_histogram
            .entry(bucket_for(DELAY_BUCKETS, desc.delay_ms))
            .or_default() += 1;
        *chan
            .attempt_histogram
            .entry(bucket_for(ATTEMPT_BUCKETS, desc.attempt as i64))
            .or_default() += 1;
        chan.last_restart_at = Some(desc.at);
        chan.watchdog_backoff_ms = desc.delay_ms;
        chan.last_watchdog_jitter_ms = desc.jitter_ms;
        chan.restart_history.push_back(desc.clone());
        if chan.restart_history.len() > RESTART_HISTORY_LIMIT {
            chan.restart_history.pop_front();
        }
        chan.last_restart = Some(desc.clone());
        family.last_restart = Some(desc);
    }

    /// Records the timer budgets in effect for a channel, surfaced in the
    /// digest's `timers.byChannel` so a dashboard can show configured vs.
    /// observed restart delay.
    pub fn set_pipeline_channel_timers(
        &self,
        kind: PipelineKind,
        channel: &str,
        watchdog_timeout_ms: i64,
        idle_timeout_ms: i64,
        start_timeout_ms: i64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.pipelines.entry(kind.as_str()).or_default();
        family.timers_by_channel.insert(
            channel.to_string(),
            ChannelTimers {
                watchdog_timeout_ms,
                idle_timeout_ms,
                start_timeout_ms,
            },
        );
    }

    pub fn record_transport_fallback(
        &self,
        kind: PipelineKind,
        channel: &str,
        from: &str,
        to: &str,
        reason: &str,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.pipelines.entry(kind.as_str()).or_default();
        let entry = (from.to_string(), to.to_string(), reason.to_string());
        family.transport_fallbacks.total += 1;
        family.transport_fallbacks.last = Some(entry.clone());
        let chan_entry = family
            .transport_fallbacks
            .by_channel
            .entry(channel.to_string())
            .or_insert((0, None));
        chan_entry.0 += 1;
        chan_entry.1 = Some(entry);
    }

    pub fn set_pipeline_channel_health(
        &self,
        kind: PipelineKind,
        channel: &str,
        severity: Option<&str>,
        reason: Option<&str>,
        degraded_since: Option<i64>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.pipelines.entry(kind.as_str()).or_default();
        let chan = family.by_channel.entry(channel.to_string()).or_default();
        chan.health = ChannelHealth {
            severity: severity.map(str::to_string),
            reason: reason.map(str::to_string),
            degraded_since,
        };
    }

    /// Counts a circuit-breaker trip under `byReason['circuit-breaker']`,
    /// both family- and channel-wide (§4.1/§2). Distinct from
    /// `record_pipeline_restart`: tripping the breaker stops the restart
    /// loop rather than scheduling another attempt, so no backoff/attempt
    /// histogram entry is recorded.
    pub fn record_circuit_breaker_trip(&self, kind: PipelineKind, channel: &str, at: i64) {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.pipelines.entry(kind.as_str()).or_default();
        *family.by_reason.entry("circuit-breaker".to_string()).or_default() += 1;
        family.last_restart_at = Some(at);
        let chan = family.by_channel.entry(channel.to_string()).or_default();
        *chan.by_reason.entry("circuit-breaker".to_string()).or_default() += 1;
        chan.last_restart_at = Some(at);
    }

    pub fn reset_pipeline_channel(&self, kind: PipelineKind, channel: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(family) = inner.pipelines.get_mut(kind.as_str()) {
            family.by_channel.remove(channel);
            family.timers_by_channel.remove(channel);
        }
    }

    /// Records a frame dropped by the supervisor's backpressure policy
    /// (§4.1: "drop the next frame emission if the handler has not yet
    /// completed the previous one").
    pub fn increment_dropped_frames(&self, kind: PipelineKind, channel: &str) {
        let mut inner = self.inner.lock().unwrap();
        let family = inner.pipelines.entry(kind.as_str()).or_default();
        let chan = family.by_channel.entry(channel.to_string()).or_default();
        chan.dropped_frames += 1;
    }

    pub fn observe_detector_latency(&self, detector: &str, ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .detector_latency
            .entry(detector.to_string())
            .or_insert((0, 0));
        entry.0 += 1;
        entry.1 += ms;
    }

    pub fn increment_detector_counter(&self, detector: &str, key: &str, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .detector_counters
            .entry(detector.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default() += n;
    }

    pub fn record_retention_run(
        &self,
        removed_events: u64,
        archived_snapshots: u64,
        pruned_archives: u64,
        disk_savings_bytes: u64,
        per_camera: &BTreeMap<String, (u64, u64)>,
        at: i64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let r = &mut inner.retention;
        r.runs += 1;
        r.last_run_at = Some(at);
        r.removed_events += removed_events;
        r.archived_snapshots += archived_snapshots;
        r.pruned_archives += pruned_archives;
        r.disk_savings_bytes += disk_savings_bytes;
        for (camera, (archived, pruned)) in per_camera {
            let totals = r.totals_by_camera.entry(camera.clone()).or_insert((0, 0));
            totals.0 += archived;
            totals.1 += pruned;
        }
    }

    pub fn record_retention_warning(&self, camera: Option<&str>, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        let r = &mut inner.retention;
        r.warnings += 1;
        r.last_warning = Some(reason.to_string());
        if let Some(camera) = camera {
            *r.warnings_by_camera.entry(camera.to_string()).or_default() += 1;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
    }

    /// A read-only JSON snapshot matching the SSE `metrics` digest shape
    /// (§4.7). `families` narrows the output per the `metrics` query param;
    /// pass an empty slice for "all".
    pub fn snapshot(&self, families: &[&str]) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let want = |name: &str| families.is_empty() || families.contains(&name) || families.contains(&"all");

        let mut root = serde_json::Map::new();
        if want("pipelines") || want("audio") {
            root.insert(
                "pipelines".into(),
                serde_json::json!({
                    "ffmpeg": pipeline_family_json(inner.pipelines.get("ffmpeg")),
                    "audio": pipeline_family_json(inner.pipelines.get("audio")),
                }),
            );
        }
        if want("events") {
            root.insert(
                "logs".into(),
                serde_json::json!({ "byLevel": inner.log_by_level }),
            );
        }
        if want("retention") {
            let r = &inner.retention;
            root.insert(
                "retention".into(),
                serde_json::json!({
                    "runs": r.runs,
                    "lastRunAt": r.last_run_at,
                    "warnings": r.warnings,
                    "warningsByCamera": r.warnings_by_camera,
                    "lastWarning": r.last_warning,
                    "totals": {
                        "removedEvents": r.removed_events,
                        "archivedSnapshots": r.archived_snapshots,
                        "prunedArchives": r.pruned_archives,
                        "diskSavingsBytes": r.disk_savings_bytes,
                    },
                    "totalsByCamera": r.totals_by_camera.iter().map(|(k, (a, p))| {
                        (k.clone(), serde_json::json!({"archivedSnapshots": a, "prunedArchives": p}))
                    }).collect::<serde_json::Map<_, _>>(),
                }),
            );
        }
        if want("events") {
            let detectors: serde_json::Map<String, serde_json::Value> = inner
                .detector_counters
                .iter()
                .map(|(name, counters)| {
                    let (count, sum_ms) = inner.detector_latency.get(name).copied().unwrap_or((0, 0));
                    (
                        name.clone(),
                        serde_json::json!({
                            "counters": counters,
                            "latency": {"count": count, "sumMs": sum_ms},
                        }),
                    )
                })
                .collect();
            root.insert("detectors".into(), serde_json::Value::Object(detectors));
        }
        serde_json::Value::Object(root)
    }

    /// Prometheus text-format exposition, one family per line group.
    pub fn prometheus(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();

        let _ = writeln!(out, "# TYPE guardian_log_level_total counter");
        for (level, n) in &inner.log_by_level {
            let _ = writeln!(out, "guardian_log_level_total{{level=\"{level}\"}} {n}");
        }

        let _ = writeln!(out, "# TYPE guardian_log_level_state gauge");
        for level in inner.log_by_level.keys() {
            let state = if inner.current_log_level.as_deref() == Some(level.as_str()) { 1 } else { 0 };
            let _ = writeln!(out, "guardian_log_level_state{{level=\"{level}\"}} {state}");
        }

        let _ = writeln!(out, "# TYPE guardian_log_level_change_total counter");
        let _ = writeln!(out, "guardian_log_level_change_total {}", inner.log_level_changes);

        let _ = writeln!(out, "# TYPE guardian_ffmpeg_restart_jitter_ms histogram");
        if let Some(family) = inner.pipelines.get("ffmpeg") {
            for (channel, chan) in &family.by_channel {
                for (bucket, n) in &chan.delay_histogram {
                    let _ = writeln!(
                        out,
                        "guardian_ffmpeg_restart_jitter_ms{{channel=\"{channel}\",bucket=\"{bucket}\"}} {n}"
                    );
                }
            }
        }

        let _ = writeln!(out, "# TYPE guardian_transport_fallback_total counter");
        for (kind, family) in &inner.pipelines {
            for (channel, (n, _)) in &family.transport_fallbacks.by_channel {
                let _ = writeln!(
                    out,
                    "guardian_transport_fallback_total{{kind=\"{kind}\",channel=\"{channel}\"}} {n}"
                );
            }
        }

        let _ = writeln!(
            out,
            "# TYPE guardian_retention_disk_savings_bytes_total counter"
        );
        let _ = writeln!(
            out,
            "guardian_retention_disk_savings_bytes_total {}",
            inner.retention.disk_savings_bytes
        );

        let _ = writeln!(out, "# TYPE guardian_detector_counter_total counter");
        for (detector, counters) in &inner.detector_counters {
            for (key, n) in counters {
                let _ = writeln!(
                    out,
                    "guardian_detector_counter_total{{detector=\"{detector}\",key=\"{key}\"}} {n}"
                );
            }
        }

        out
    }
}

fn pipeline_family_json(family: Option<&PipelineFamily>) -> serde_json::Value {
    let Some(family) = family else {
        return serde_json::json!({});
    };
    serde_json::json!({
        "restarts": family.restarts,
        "lastRestartAt": family.last_restart_at,
        "lastRestart": family.last_restart.as_ref().map(restart_descriptor_json),
        "byReason": family.by_reason,
        "byChannel": family.by_channel.iter().map(|(channel, chan)| {
            (channel.clone(), serde_json::json!({
                "restarts": chan.restarts,
                "byReason": chan.by_reason,
                "lastRestart": chan.last_restart.as_ref().map(restart_descriptor_json),
                "lastRestartAt": chan.last_restart_at,
                "watchdogBackoffMs": chan.watchdog_backoff_ms,
                "lastWatchdogJitterMs": chan.last_watchdog_jitter_ms,
                "restartHistory": chan.restart_history.iter().map(restart_descriptor_json).collect::<Vec<_>>(),
                "historyLimit": RESTART_HISTORY_LIMIT,
                "delayHistogram": chan.delay_histogram,
                "attemptHistogram": chan.attempt_histogram,
                "droppedFrames": chan.dropped_frames,
                "health": {
                    "severity": chan.health.severity,
                    "reason": chan.health.reason,
                    "degradedSince": chan.health.degraded_since,
                },
            }))
        }).collect::<serde_json::Map<_, _>>(),
        "transportFallbacks": {
            "total": family.transport_fallbacks.total,
            "last": family.transport_fallbacks.last.as_ref().map(|(from, to, reason)| {
                serde_json::json!({"from": from, "to": to, "reason": reason})
            }),
            "byChannel": family.transport_fallbacks.by_channel.iter().map(|(channel, (n, last))| {
                (channel.clone(), serde_json::json!({
                    "total": n,
                    "last": last.as_ref().map(|(from, to, reason)| {
                        serde_json::json!({"from": from, "to": to, "reason": reason})
                    }),
                }))
            }).collect::<serde_json::Map<_, _>>(),
        },
        "timers": {
            "byChannel": family.timers_by_channel.iter().map(|(channel, t)| {
                (channel.clone(), serde_json::json!({
                    "watchdogTimeoutMs": t.watchdog_timeout_ms,
                    "idleTimeoutMs": t.idle_timeout_ms,
                    "startTimeoutMs": t.start_timeout_ms,
                }))
            }).collect::<serde_json::Map<_, _>>(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_restart_and_buckets_delay() {
        let m = Metrics::new();
        m.record_pipeline_restart(
            PipelineKind::Ffmpeg,
            "video:lobby",
            RestartDescriptor {
                reason: "rtsp-timeout".into(),
                attempt: 1,
                delay_ms: 30,
                jitter_ms: 5,
                at: 1000,
            },
        );
        let snap = m.snapshot(&[]);
        let chan = &snap["pipelines"]["ffmpeg"]["byChannel"]["video:lobby"];
        assert_eq!(chan["restarts"], 1);
        assert_eq!(chan["delayHistogram"]["25-50"], 1);
        assert_eq!(chan["watchdogBackoffMs"], 30);
        assert_eq!(chan["lastWatchdogJitterMs"], 5);
        assert_eq!(chan["restartHistory"].as_array().unwrap().len(), 1);
        assert_eq!(chan["historyLimit"], RESTART_HISTORY_LIMIT);
    }

    #[test]
    fn circuit_breaker_trip_counts_under_by_reason() {
        let m = Metrics::new();
        m.record_circuit_breaker_trip(PipelineKind::Ffmpeg, "video:lobby", 5000);
        let snap = m.snapshot(&[]);
        let family = &snap["pipelines"]["ffmpeg"];
        assert_eq!(family["byReason"]["circuit-breaker"], 1);
        let chan = &family["byChannel"]["video:lobby"];
        assert_eq!(chan["byReason"]["circuit-breaker"], 1);
    }

    #[test]
    fn reset_clears_everything() {
        let m = Metrics::new();
        m.increment_log_level("warn");
        m.reset();
        let snap = m.snapshot(&["events"]);
        assert_eq!(snap["logs"]["byLevel"].as_object().unwrap().len(), 0);
    }
}
