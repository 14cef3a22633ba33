// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Event Bus and suppression engine (C3). Modeled as a typed
//! publish-subscribe: a fixed `message` topic fanned out to subscribers that
//! register a handle and can drop it to unsubscribe, per the design notes on
//! "emitter-style fan-out".

use std::collections::VecDeque;
use std::sync::Mutex;
use store::{Event, NewEvent, Store};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone, Debug, Default)]
pub struct Matcher {
    pub detector: Option<String>,
    pub source: Option<String>,
    pub channel: Option<String>,
    pub severity_at_least: Option<store::Severity>,
}

impl Matcher {
    fn matches(&self, e: &NewEvent) -> bool {
        if let Some(d) = &self.detector {
            if &e.detector != d {
                return false;
            }
        }
        if let Some(s) = &self.source {
            if &e.source != s {
                return false;
            }
        }
        if let Some(c) = &self.channel {
            if e.meta.channel.as_deref() != Some(c.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.severity_at_least {
            if e.severity.rank() < min.rank() {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug)]
pub struct SuppressionRule {
    pub id: String,
    pub matcher: Matcher,
    pub suppress_for_ms: Option<i64>,
    pub max_events: Option<u32>,
    pub per_ms: Option<i64>,
    pub timeline_ttl_ms: Option<i64>,
    pub reason: String,
}

#[derive(Default)]
struct Timeline {
    entries: VecDeque<i64>,
}

impl Timeline {
    fn prune(&mut self, now: i64, ttl_ms: Option<i64>) -> u32 {
        let Some(ttl) = ttl_ms else { return 0 };
        let mut pruned = 0;
        while let Some(&front) = self.entries.front() {
            if now - front > ttl {
                self.entries.pop_front();
                pruned += 1;
            } else {
                break;
            }
        }
        pruned
    }
}

#[derive(Clone, Debug)]
pub struct SuppressionWarning {
    pub rule_id: String,
    pub channel: Option<String>,
    pub count: u32,
    pub timeline_ttl_ms: i64,
    /// Always `true`: this warning only fires on TTL-prune (timeline
    /// entries expiring out of the window), never on suppress-for/max-events.
    pub timeline_expired: bool,
    pub at: i64,
}

/// A retention-run warning (§7.4: unlink/archive/vacuum failures) routed to
/// the `warning` SSE channel alongside suppression and transport-fallback
/// warnings.
#[derive(Clone, Debug)]
pub struct RetentionWarning {
    pub camera: Option<String>,
    pub path: Option<String>,
    pub reason: String,
    pub at: i64,
}

/// An RTSP transport-fallback warning (§4.1's transport state machine)
/// routed to the `warning` SSE channel.
#[derive(Clone, Debug)]
pub struct TransportFallbackWarning {
    pub channel: String,
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: i64,
}

#[derive(Clone, Debug)]
pub enum Warning {
    Suppression(SuppressionWarning),
    Retention(RetentionWarning),
    TransportFallback(TransportFallbackWarning),
}

#[derive(Clone, Debug)]
pub enum BusEvent {
    Message(Event),
    Warning(Warning),
}

struct RuleState {
    rule: SuppressionRule,
    timeline: Timeline,
}

struct Inner {
    rules: Vec<RuleState>,
}

/// Publishes events to the store and fans them out to subscribers, applying
/// suppression in declared-rule order: only the first matching rule's
/// policy applies per event.
pub struct Bus {
    store: std::sync::Arc<Store>,
    inner: Mutex<Inner>,
    tx: broadcast::Sender<BusEvent>,
    accepted_counter: std::sync::atomic::AtomicU64,
    suppressed_counter: Mutex<std::collections::BTreeMap<String, u64>>,
}

impl Bus {
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Bus {
            store,
            inner: Mutex::new(Inner { rules: Vec::new() }),
            tx,
            accepted_counter: std::sync::atomic::AtomicU64::new(0),
            suppressed_counter: Mutex::new(Default::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Atomically replaces the rule set, discarding all existing Timelines
    /// (§4.3's `ConfigureSuppression`).
    pub fn configure_suppression(&self, rules: Vec<SuppressionRule>) {
        let mut inner = self.inner.lock().unwrap();
        inner.rules = rules
            .into_iter()
            .map(|rule| RuleState {
                rule,
                timeline: Timeline::default(),
            })
            .collect();
    }

    /// Publishes `event`, persisting and fanning out if not suppressed.
    /// Returns `true` iff the event was accepted.
    pub fn publish(&self, event: NewEvent, now: i64) -> Result<bool, base::Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut warning = None;

        for state in inner.rules.iter_mut() {
            if !state.rule.matcher.matches(&event) {
                continue;
            }
            let pruned = state.timeline.prune(now, state.rule.timeline_ttl_ms);
            if pruned > 0 {
                if let Some(ttl) = state.rule.timeline_ttl_ms {
                    warning = Some(SuppressionWarning {
                        rule_id: state.rule.id.clone(),
                        channel: event.meta.channel.clone(),
                        count: pruned,
                        timeline_ttl_ms: ttl,
                        timeline_expired: true,
                        at: now,
                    });
                }
            }

            if let Some(d) = state.rule.suppress_for_ms {
                if let Some(&last) = state.timeline.entries.back() {
                    if now - last < d {
                        *self
                            .suppressed_counter
                            .lock()
                            .unwrap()
                            .entry(state.rule.id.clone())
                            .or_default() += 1;
                        drop(inner);
                        self.emit_warning_if_any(warning);
                        return Ok(false);
                    }
                }
            }

            if let (Some(max), Some(per_ms)) = (state.rule.max_events, state.rule.per_ms) {
                let window_start = now - per_ms;
                let in_window = state.timeline.entries.iter().filter(|&&t| t >= window_start).count();
                if in_window as u32 >= max {
                    *self
                        .suppressed_counter
                        .lock()
                        .unwrap()
                        .entry(state.rule.id.clone())
                        .or_default() += 1;
                    drop(inner);
                    self.emit_warning_if_any(warning);
                    return Ok(false);
                }
            }

            state.timeline.entries.push_back(now);
            break; // only the first matching rule applies.
        }
        drop(inner);

        self.emit_warning_if_any(warning);

        let id = self.store.insert(&event)?;
        self.accepted_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let persisted = Event {
            id,
            ts: event.ts,
            source: event.source,
            detector: event.detector,
            severity: event.severity,
            message: event.message,
            meta: event.meta,
        };
        let _ = self.tx.send(BusEvent::Message(persisted));
        Ok(true)
    }

    fn emit_warning_if_any(&self, warning: Option<SuppressionWarning>) {
        if let Some(w) = warning {
            info!(rule = %w.rule_id, count = w.count, "suppression timeline expired entries pruned");
            let _ = self.tx.send(BusEvent::Warning(Warning::Suppression(w)));
        }
    }

    /// Publishes a retention/transport-fallback warning directly to
    /// subscribers. Unlike `publish`, these never touch the suppression
    /// rule set or the event store: they aren't `Event`s, just transient
    /// operational notices for the `warning` SSE channel.
    pub fn publish_warning(&self, warning: Warning) {
        let _ = self.tx.send(BusEvent::Warning(warning));
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted_counter.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: i64, detector: &str, source: &str) -> NewEvent {
        NewEvent {
            ts,
            source: source.to_string(),
            detector: detector.to_string(),
            severity: store::Severity::Info,
            message: "fired".to_string(),
            meta: Default::default(),
        }
    }

    #[test]
    fn unmatched_events_are_always_accepted_and_persisted_once() {
        let store = std::sync::Arc::new(Store::open(":memory:").unwrap());
        let bus = Bus::new(store.clone());
        let accepted = bus.publish(event(0, "motion", "video:cam-1"), 0).unwrap();
        assert!(accepted);
        assert_eq!(bus.accepted_count(), 1);
        assert_eq!(
            store
                .list(&store::EventFilter { limit: 50, ..Default::default() })
                .unwrap()
                .total,
            1
        );
    }

    /// Scenario S3 from the testable-properties section.
    #[test]
    fn s3_suppression_window() {
        let store = std::sync::Arc::new(Store::open(":memory:").unwrap());
        let bus = Bus::new(store);
        bus.configure_suppression(vec![SuppressionRule {
            id: "r1".into(),
            matcher: Matcher {
                detector: Some("motion".into()),
                source: Some("video:cam-1".into()),
                channel: None,
                severity_at_least: None,
            },
            suppress_for_ms: Some(1000),
            max_events: None,
            per_ms: None,
            timeline_ttl_ms: None,
            reason: "cooldown".into(),
        }]);

        assert!(bus.publish(event(0, "motion", "video:cam-1"), 0).unwrap());
        assert!(!bus.publish(event(500, "motion", "video:cam-1"), 500).unwrap());
        assert!(bus.publish(event(1200, "motion", "video:cam-1"), 1200).unwrap());
        assert_eq!(bus.accepted_count(), 2);
    }

    #[test]
    fn timeline_expiry_warning_carries_timeline_expired_flag() {
        let store = std::sync::Arc::new(Store::open(":memory:").unwrap());
        let bus = Bus::new(store);
        let mut rx = bus.subscribe();
        bus.configure_suppression(vec![SuppressionRule {
            id: "r1".into(),
            matcher: Matcher {
                detector: Some("motion".into()),
                ..Default::default()
            },
            suppress_for_ms: None,
            max_events: None,
            per_ms: None,
            timeline_ttl_ms: Some(100),
            reason: "ttl".into(),
        }]);
        assert!(bus.publish(event(0, "motion", "video:cam-1"), 0).unwrap());
        // Second event arrives long after the first entry's TTL, pruning it
        // and firing the warning.
        assert!(bus.publish(event(1000, "motion", "video:cam-1"), 1000).unwrap());

        let mut saw_warning = false;
        while let Ok(msg) = rx.try_recv() {
            if let BusEvent::Warning(Warning::Suppression(w)) = msg {
                assert!(w.timeline_expired);
                assert_eq!(w.rule_id, "r1");
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[test]
    fn publish_warning_routes_retention_and_transport_fallback_without_touching_the_store() {
        let store = std::sync::Arc::new(Store::open(":memory:").unwrap());
        let bus = Bus::new(store);
        let mut rx = bus.subscribe();
        bus.publish_warning(Warning::Retention(RetentionWarning {
            camera: Some("lobby".into()),
            path: Some("/snap/lobby/a.jpg".into()),
            reason: "unlink-failed".into(),
            at: 10,
        }));
        bus.publish_warning(Warning::TransportFallback(TransportFallbackWarning {
            channel: "video:lobby".into(),
            from: "tcp".into(),
            to: "udp".into(),
            reason: "watchdog-timeout".into(),
            at: 20,
        }));
        assert_eq!(bus.accepted_count(), 0);
        match rx.try_recv().unwrap() {
            BusEvent::Warning(Warning::Retention(w)) => assert_eq!(w.reason, "unlink-failed"),
            other => panic!("expected retention warning, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            BusEvent::Warning(Warning::TransportFallback(w)) => assert_eq!(w.to, "udp"),
            other => panic!("expected transport-fallback warning, got {other:?}"),
        }
    }

    #[test]
    fn only_first_matching_rule_applies() {
        let store = std::sync::Arc::new(Store::open(":memory:").unwrap());
        let bus = Bus::new(store);
        bus.configure_suppression(vec![
            SuppressionRule {
                id: "narrow".into(),
                matcher: Matcher {
                    detector: Some("motion".into()),
                    ..Default::default()
                },
                suppress_for_ms: Some(100_000),
                max_events: None,
                per_ms: None,
                timeline_ttl_ms: None,
                reason: "narrow".into(),
            },
            SuppressionRule {
                id: "catch-all".into(),
                matcher: Matcher::default(),
                suppress_for_ms: Some(1),
                max_events: None,
                per_ms: None,
                timeline_ttl_ms: None,
                reason: "catch-all".into(),
            },
        ]);
        assert!(bus.publish(event(0, "motion", "video:cam-1"), 0).unwrap());
        // Second motion event hits the narrow rule's long suppression, never
        // reaching the catch-all.
        assert!(!bus.publish(event(10, "motion", "video:cam-1"), 10).unwrap());
    }
}
