// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Server-Sent Events framing and per-connection subscriber state (§4.6).
//! Each connection gets its own bounded channel fed by a spawned task; the
//! modern equivalent of the teacher's boxed-stream response body, now built
//! on `http_body_util::StreamBody` instead of a hand-rolled `hyper::Body`
//! impl.

use crate::bus::{Bus, BusEvent, Warning};
use crate::config::ConfigManager;
use crate::metrics::Metrics;
use crate::web::{enrich_event, query::Query};
use std::sync::Arc;
use std::time::Duration;
use store::{Event, EventFilter, Severity, Store};
use tokio::sync::mpsc;
use tracing::info;

/// The live-stream filter, a subset of `EventFilter` plus the channels a
/// client repeats in its query string.
#[derive(Clone, Debug, Default)]
pub struct SseFilter {
    pub source: Option<String>,
    pub camera: Option<String>,
    pub channels: Vec<String>,
    pub detector: Option<String>,
    pub severity: Option<Severity>,
    pub search: Option<String>,
}

impl SseFilter {
    pub fn from_query(q: &Query) -> SseFilter {
        let mut channels = q.get_all("channel").into_iter().map(str::to_string).collect::<Vec<_>>();
        channels.extend(q.get_csv("channels"));
        SseFilter {
            source: q.get("source").map(str::to_string),
            camera: q.get("camera").map(str::to_string),
            channels,
            detector: q.get("detector").map(str::to_string),
            severity: q.get("severity").and_then(Severity::parse),
            search: q.get("search").map(str::to_string),
        }
    }

    pub fn matches(&self, e: &Event) -> bool {
        if let Some(s) = &self.source {
            if &e.source != s {
                return false;
            }
        }
        if let Some(d) = &self.detector {
            if &e.detector != d {
                return false;
            }
        }
        if let Some(min) = self.severity {
            if e.severity.rank() < min.rank() {
                return false;
            }
        }
        if let Some(cam) = &self.camera {
            if e.meta.camera.as_deref() != Some(cam.as_str()) {
                return false;
            }
        }
        if !self.channels.is_empty() {
            let chan = e.meta.channel.as_deref().unwrap_or("");
            if !self.channels.iter().any(|c| c == chan) {
                return false;
            }
        }
        if let Some(needle) = &self.search {
            let haystack = format!("{} {} {}", e.message, e.detector, e.source).to_lowercase();
            if !haystack.contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }

    pub fn as_event_filter(&self, min_id: Option<i64>, limit: u32) -> EventFilter {
        EventFilter {
            source: self.source.clone(),
            camera: self.camera.clone(),
            channels: self.channels.clone(),
            detector: self.detector.clone(),
            severity: self.severity,
            min_id,
            limit,
            ..Default::default()
        }
    }
}

pub struct ClientConfig {
    pub retry_ms: u64,
    pub metrics_families: Vec<String>,
    pub last_event_id: Option<i64>,
    pub backlog: bool,
    pub snapshots_prefill: Option<u32>,
    pub faces: bool,
}

impl ClientConfig {
    pub fn from_query(q: &Query) -> ClientConfig {
        let retry_secs: u64 = q.get("retry").and_then(|v| v.parse().ok()).unwrap_or(0);
        let retry_ms = q
            .get("retryMs")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| (retry_secs * 1000).max(1000))
            .clamp(1000, 60_000);
        ClientConfig {
            retry_ms,
            metrics_families: q.get("metrics").map(|v| v.split(',').map(str::to_string).collect()).unwrap_or_default(),
            last_event_id: q.get("lastEventId").and_then(|v| v.parse().ok()),
            backlog: q.flag("backlog"),
            snapshots_prefill: if q.flag("snapshots") {
                Some(q.get("snapshotLimit").and_then(|v| v.parse().ok()).unwrap_or(10))
            } else {
                None
            },
            faces: q.flag("faces") || q.get("q").is_some(),
        }
    }
}

/// Builds the `warning` event payload for a bus warning, shaped per §4.6 as
/// a `type`-tagged envelope so a client can discriminate suppression,
/// retention, and transport-fallback warnings on one SSE event name.
fn warning_payload(w: &Warning) -> serde_json::Value {
    match w {
        Warning::Suppression(w) => serde_json::json!({
            "type": "suppression",
            "suppression": {
                "ruleId": w.rule_id,
                "channel": w.channel,
                "count": w.count,
                "timelineTtlMs": w.timeline_ttl_ms,
                "timelineExpired": w.timeline_expired,
                "at": w.at,
            },
        }),
        Warning::Retention(w) => serde_json::json!({
            "type": "retention",
            "retention": {
                "camera": w.camera,
                "path": w.path,
                "reason": w.reason,
                "at": w.at,
            },
        }),
        Warning::TransportFallback(w) => serde_json::json!({
            "type": "transport-fallback",
            "transportFallback": {
                "channel": w.channel,
                "from": w.from,
                "to": w.to,
                "reason": w.reason,
                "at": w.at,
            },
        }),
    }
}

/// One SSE wire frame: `event: <name>\ndata: <json>\nid: <id>?\n\n`.
pub fn frame(name: &str, data: &serde_json::Value, id: Option<i64>) -> String {
    let mut s = format!("event: {name}\ndata: {data}\n");
    if let Some(id) = id {
        s.push_str(&format!("id: {id}\n"));
    }
    s.push('\n');
    s
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const RETRY_HINT_INTERVAL: Duration = Duration::from_secs(30);
/// How often the metrics digest is re-checked for a delta worth pushing.
/// No dedicated metrics pub/sub exists (§4.7's registry is a plain
/// mutex-protected struct with a pull-only `snapshot()`), so deltas are
/// detected by polling and diffing the serialized digest — the same
/// poll-and-diff shape the hot config watcher uses for file reloads.
const METRICS_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Chunks queued per client before the connection is dropped for
/// backpressure (§5: "if a client write buffer exceeds maxBacklogBytes,
/// drop that client"). A chunk count proxy is used in place of tracking raw
/// byte totals per queued frame.
const MAX_BACKLOG_FRAMES: usize = 4096;

/// Spawns the per-connection task and returns the receiver the gateway
/// streams to the client body.
pub fn spawn(
    bus: Arc<Bus>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    config_manager: Arc<ConfigManager>,
    filter: SseFilter,
    cfg: ClientConfig,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(MAX_BACKLOG_FRAMES);
    tokio::spawn(async move {
        let _ = run(bus, store, metrics, config_manager, filter, cfg, tx).await;
    });
    rx
}

async fn run(
    bus: Arc<Bus>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    config_manager: Arc<ConfigManager>,
    filter: SseFilter,
    cfg: ClientConfig,
    tx: mpsc::Sender<String>,
) -> Result<(), mpsc::error::SendError<String>> {
    tx.send(format!("retry: {}\n\n", cfg.retry_ms)).await?;
    tx.send(frame(
        "stream-status",
        &serde_json::json!({"status": "connected", "retryMs": cfg.retry_ms}),
        None,
    ))
    .await?;

    let families: Vec<&str> = cfg.metrics_families.iter().map(String::as_str).collect();
    let metrics_enabled = !families.iter().any(|f| *f == "none");
    let mut last_metrics_digest = if metrics_enabled {
        let digest = metrics.snapshot(&families);
        tx.send(frame("metrics", &digest, None)).await?;
        Some(digest)
    } else {
        None
    };

    if cfg.faces {
        tx.send(frame(
            "faces",
            &serde_json::json!({"faces": [], "count": 0, "query": serde_json::Value::Null, "threshold": 0.6}),
            None,
        ))
        .await?;
    }

    let mut rx = bus.subscribe();
    let channels = || config_manager.current().video.channels;

    if cfg.backlog {
        if let Some(since) = cfg.last_event_id {
            let backlog = store
                .list(&filter.as_event_filter(Some(since), EventFilter::MAX_LIMIT))
                .map(|r| r.items)
                .unwrap_or_default();
            let ch = channels();
            for e in backlog {
                if filter.matches(&e) {
                    tx.send(frame("message", &enrich_event(&e, &ch), Some(e.id))).await?;
                }
            }
        }
    }

    if let Some(limit) = cfg.snapshots_prefill {
        let mut snap_filter = filter.as_event_filter(None, limit);
        snap_filter.snapshot = Some(store::Presence::With);
        let items = store.list(&snap_filter).map(|r| r.items).unwrap_or_default();
        let ch = channels();
        for e in items.into_iter().rev() {
            tx.send(frame("message", &enrich_event(&e, &ch), Some(e.id))).await?;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut retry_hint = tokio::time::interval(RETRY_HINT_INTERVAL);
    let mut metrics_poll = tokio::time::interval(METRICS_POLL_INTERVAL);

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    Ok(BusEvent::Message(e)) => {
                        if filter.matches(&e) {
                            tx.send(frame("message", &enrich_event(&e, &channels()), Some(e.id))).await?;
                        }
                    }
                    Ok(BusEvent::Warning(w)) => {
                        tx.send(frame("warning", &warning_payload(&w), None)).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        info!(skipped = n, "sse client lagged behind bus, some events dropped for this client");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                tx.send(frame("heartbeat", &serde_json::json!({"ts": jiff::Timestamp::now().as_millisecond()}), None)).await?;
            }
            _ = retry_hint.tick() => {
                tx.send(frame("retry-hint", &serde_json::json!({
                    "baseMs": cfg.retry_ms, "minMs": 1000, "maxMs": 60_000, "recommendedMs": cfg.retry_ms,
                }), None)).await?;
            }
            _ = metrics_poll.tick(), if metrics_enabled => {
                let digest = metrics.snapshot(&families);
                if Some(&digest) != last_metrics_digest.as_ref() {
                    tx.send(frame("metrics", &digest, None)).await?;
                    last_metrics_digest = Some(digest);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_on_channel_and_detector() {
        let filter = SseFilter {
            channels: vec!["video:lobby".to_string()],
            detector: Some("motion".to_string()),
            ..Default::default()
        };
        let mut e = Event {
            id: 1,
            ts: 0,
            source: "video:lobby".into(),
            detector: "motion".into(),
            severity: Severity::Info,
            message: "fired".into(),
            meta: Default::default(),
        };
        e.meta.channel = Some("video:lobby".to_string());
        assert!(filter.matches(&e));
        e.meta.channel = Some("video:porch".to_string());
        assert!(!filter.matches(&e));
    }

    #[test]
    fn suppression_warning_payload_nests_under_type_and_carries_timeline_expired() {
        use crate::bus::SuppressionWarning;
        let payload = warning_payload(&Warning::Suppression(SuppressionWarning {
            rule_id: "r1".into(),
            channel: Some("video:lobby".into()),
            count: 3,
            timeline_ttl_ms: 60_000,
            timeline_expired: true,
            at: 1234,
        }));
        assert_eq!(payload["type"], "suppression");
        assert_eq!(payload["suppression"]["ruleId"], "r1");
        assert_eq!(payload["suppression"]["timelineExpired"], true);
        assert_eq!(payload["suppression"]["timelineTtlMs"], 60_000);
    }

    #[test]
    fn retention_and_transport_fallback_warnings_get_their_own_envelope() {
        use crate::bus::{RetentionWarning, TransportFallbackWarning};
        let retention = warning_payload(&Warning::Retention(RetentionWarning {
            camera: Some("lobby".into()),
            path: Some("/snap/lobby/a.jpg".into()),
            reason: "unlink-failed".into(),
            at: 1,
        }));
        assert_eq!(retention["type"], "retention");
        assert_eq!(retention["retention"]["reason"], "unlink-failed");

        let transport = warning_payload(&Warning::TransportFallback(TransportFallbackWarning {
            channel: "video:lobby".into(),
            from: "tcp".into(),
            to: "udp".into(),
            reason: "watchdog-timeout".into(),
            at: 2,
        }));
        assert_eq!(transport["type"], "transport-fallback");
        assert_eq!(transport["transportFallback"]["to"], "udp");
    }

    #[test]
    fn client_config_clamps_retry() {
        let q = Query::parse("retry=1000000");
        let cfg = ClientConfig::from_query(&q);
        assert_eq!(cfg.retry_ms, 60_000);
    }
}
