// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The event record and the typed-plus-freeform `meta` map it carries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Ordinal used for `severityAtLeast` matchers and the `severity` query filter.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Recognized `meta` keys plus an arbitrary pass-through map for the rest.
///
/// Serializes as a single flat JSON object: recognized fields merge with
/// `extra` so unknown keys round-trip unchanged, per the design notes on the
/// "dynamic meta object" pattern.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose_forecast: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose_threat_summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<serde_json::Value>,

    /// Everything else, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// §6.2: `poseForecast.movementFlags` is serialized as an array of booleans;
/// producers may hand it an array of 0/1 ints, which this coerces in place.
/// Pass-through otherwise — the rest of `poseForecast`'s shape is
/// unspecified and forwarded verbatim (§9's pose-forecast Open Question).
pub fn coerce_pose_forecast(pose_forecast: &mut Option<serde_json::Value>) {
    let Some(serde_json::Value::Object(obj)) = pose_forecast else { return };
    let Some(flags) = obj.get_mut("movementFlags") else { return };
    let serde_json::Value::Array(items) = flags else { return };
    for item in items.iter_mut() {
        if let Some(n) = item.as_i64() {
            *item = serde_json::Value::Bool(n != 0);
        }
    }
}

impl Meta {
    /// Best-effort lookup across recognized fields and the freeform map, for
    /// the `search` query filter which scans `meta.channel`/`meta.camera`/
    /// `meta.snapshot` among other columns.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "channel" => self.channel.clone(),
            "camera" => self.camera.clone(),
            "snapshot" => self.snapshot.clone(),
            _ => self.extra.get(key).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}

/// The core persisted record (§3 of the data model).
///
/// `id` is assigned by the store on insertion and strictly increases with
/// insertion order; `ts` is caller-supplied and may decrease (backdated
/// events are permitted).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub ts: i64,
    pub source: String,
    pub detector: String,
    pub severity: Severity,
    pub message: String,
    pub meta: Meta,
}

/// A not-yet-persisted event, as produced by a detector and handed to the
/// bus/store.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub ts: i64,
    pub source: String,
    pub detector: String,
    pub severity: Severity,
    pub message: String,
    pub meta: Meta,
}

/// Query filters for `Store::list_events`, mirroring the `/api/events` query
/// surface.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub source: Option<String>,
    pub camera: Option<String>,
    pub channels: Vec<String>,
    pub detector: Option<String>,
    pub severity: Option<Severity>,
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    pub search: Option<String>,
    pub snapshot: Option<Presence>,
    pub face_snapshot: Option<Presence>,
    pub min_id: Option<i64>,
    pub limit: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Presence {
    With,
    Without,
}

impl EventFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_pose_forecast_turns_int_flags_into_bools() {
        let mut pf = Some(serde_json::json!({"movementFlags": [0, 1, 1, 0], "other": "x"}));
        coerce_pose_forecast(&mut pf);
        assert_eq!(
            pf,
            Some(serde_json::json!({"movementFlags": [false, true, true, false], "other": "x"}))
        );
    }

    #[test]
    fn coerce_pose_forecast_is_idempotent_on_already_bool_flags() {
        let mut pf = Some(serde_json::json!({"movementFlags": [false, true]}));
        coerce_pose_forecast(&mut pf);
        assert_eq!(pf, Some(serde_json::json!({"movementFlags": [false, true]})));
    }

    #[test]
    fn coerce_pose_forecast_leaves_absent_value_untouched() {
        let mut pf = None;
        coerce_pose_forecast(&mut pf);
        assert_eq!(pf, None);
    }
}
