// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Hot Config Manager (C5): loads the JSON configuration file, validates
//! it as a unit (aggregating every violation into a single error rather than
//! failing on the first, the way `base::Error::chain` aggregates causes
//! rather than discarding them), and watches the file for changes with a
//! poll loop.

use base::channel::ChannelId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{hash_map::DefaultHasher, BTreeMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimit {
    pub count: u32,
    pub per_ms: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SuppressionRuleConfig {
    pub id: String,
    #[serde(default)]
    pub detector: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub severity_at_least: Option<String>,
    #[serde(default)]
    pub suppress_for_ms: Option<i64>,
    #[serde(default)]
    pub max_events: Option<u32>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub timeline_ttl_ms: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SuppressionConfig {
    #[serde(default)]
    pub rules: Vec<SuppressionRuleConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    #[serde(default)]
    pub thresholds: Value,
    #[serde(default)]
    pub retention: Value,
    #[serde(default)]
    pub suppression: SuppressionConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub channel: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    #[serde(default)]
    pub frames_per_second: f64,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub ffmpeg: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersonConfig {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub overrides: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MotionConfig {
    #[serde(default)]
    pub diff_threshold: f64,
    #[serde(default)]
    pub area_threshold: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FallbackEntry {
    #[serde(default)]
    pub device: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub idle_timeout_ms: i64,
    #[serde(default)]
    pub mic_fallbacks: BTreeMap<String, Vec<FallbackEntry>>,
    #[serde(default)]
    pub anomaly: Value,
}

/// The parsed, validated configuration. Unknown top-level keys are kept in
/// `extra` so a reload never silently drops fields a future version added
/// (§6.3: "unknown keys are preserved but not acted on").
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub app: Value,
    #[serde(default)]
    pub logging: Value,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub person: PersonConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration invalid: {}", self.violations.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// Validates `cfg` as a unit, collecting every violation rather than
/// stopping at the first (§4.5).
pub fn validate(cfg: &Config) -> Result<(), ValidationError> {
    let mut v = Vec::new();

    let mut camera_ids = std::collections::HashSet::new();
    let mut camera_channels = std::collections::HashSet::new();
    for cam in &cfg.video.cameras {
        let normalized = ChannelId::normalize(&cam.channel, "video");
        if normalized.as_str().is_empty() || normalized.as_str() == "video:" {
            v.push(format!("camera {:?} has an empty channel", cam.id));
        }
        if !camera_ids.insert(cam.id.clone()) {
            v.push(format!("duplicate camera id {:?}", cam.id));
        }
        if !camera_channels.insert(normalized.clone()) {
            v.push(format!("duplicate camera channel {:?}", normalized.as_str()));
        }
    }

    for channel_key in cfg.video.channels.keys() {
        let normalized = ChannelId::normalize(channel_key, "video");
        if !camera_channels.contains(&normalized) {
            v.push(format!(
                "video.channels key {channel_key:?} does not reference any camera"
            ));
        }
    }

    if cfg.motion.diff_threshold < 0.0 {
        v.push("motion.diffThreshold must be >= 0".to_string());
    }
    if !(0.0..=1.0).contains(&cfg.motion.area_threshold) {
        v.push("motion.areaThreshold must be within [0, 1]".to_string());
    }

    if !(0.0..=1.0).contains(&cfg.person.score) {
        v.push("person.score must be within [0, 1]".to_string());
    }
    for (key, score) in &cfg.person.overrides {
        if !(0.0..=1.0).contains(score) {
            v.push(format!("person.overrides[{key:?}] must be within [0, 1]"));
        }
    }

    if !cfg.audio.channel.trim().is_empty() {
        let audio_channel = ChannelId::normalize(&cfg.audio.channel, "audio")
            .as_str()
            .to_ascii_lowercase();
        let collides = camera_channels
            .iter()
            .any(|c| c.as_str().to_ascii_lowercase() == audio_channel);
        if collides {
            v.push("audio.channel must not equal any video channel".to_string());
        }
    }

    for (os, entries) in &cfg.audio.mic_fallbacks {
        for entry in entries {
            if entry.device.trim().is_empty() {
                v.push(format!("audio.micFallbacks[{os:?}] has an entry with an empty device"));
            }
        }
    }

    for rule in &cfg.events.suppression.rules {
        if let Some(rl) = &rule.rate_limit {
            if rl.per_ms < rl.count as i64 {
                v.push(format!(
                    "suppression rule {:?}: rateLimit.perMs must be >= count",
                    rule.id
                ));
            }
        }
        if rule.max_events.is_some() && rule.suppress_for_ms.is_none() {
            v.push(format!(
                "suppression rule {:?}: maxEvents requires suppressForMs",
                rule.id
            ));
        }
        // §4.3: "maxEvents requires perMs (validated at config load)" — the
        // windowed-count policy is meaningless without the window. `perMs`
        // arrives via `rateLimit.perMs` in this config schema (§4.5), so the
        // two validations together mean a rule declaring `maxEvents` must
        // carry both `suppressForMs` and a `rateLimit`.
        if rule.max_events.is_some() && rule.rate_limit.is_none() {
            v.push(format!(
                "suppression rule {:?}: maxEvents requires rateLimit.perMs",
                rule.id
            ));
        }
    }

    if v.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations: v })
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct KeyDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConfigDiff {
    pub channels: KeyDiff,
    pub cameras: KeyDiff,
}

fn diff_channels(prev: &VideoConfig, next: &VideoConfig) -> KeyDiff {
    let prev_keys: std::collections::BTreeSet<_> = prev.channels.keys().cloned().collect();
    let next_keys: std::collections::BTreeSet<_> = next.channels.keys().cloned().collect();
    let mut d = KeyDiff::default();
    d.added = next_keys.difference(&prev_keys).cloned().collect();
    d.removed = prev_keys.difference(&next_keys).cloned().collect();
    for key in prev_keys.intersection(&next_keys) {
        if prev.channels.get(key) != next.channels.get(key) {
            d.changed.push(key.clone());
        }
    }
    d
}

fn diff_cameras(prev: &VideoConfig, next: &VideoConfig) -> KeyDiff {
    let prev_by_id: BTreeMap<_, _> = prev.cameras.iter().map(|c| (c.id.clone(), c)).collect();
    let next_by_id: BTreeMap<_, _> = next.cameras.iter().map(|c| (c.id.clone(), c)).collect();
    let mut d = KeyDiff::default();
    for id in next_by_id.keys() {
        if !prev_by_id.contains_key(id) {
            d.added.push(id.clone());
        }
    }
    for id in prev_by_id.keys() {
        if !next_by_id.contains_key(id) {
            d.removed.push(id.clone());
        }
    }
    for (id, next_cam) in &next_by_id {
        if let Some(prev_cam) = prev_by_id.get(id) {
            if prev_cam != next_cam {
                d.changed.push(id.clone());
            }
        }
    }
    d
}

pub fn diff(previous: &Config, next: &Config) -> ConfigDiff {
    ConfigDiff {
        channels: diff_channels(&previous.video, &next.video),
        cameras: diff_cameras(&previous.video, &next.video),
    }
}

/// A subscriber applies a diff against the previous/next configuration.
/// Returning `Err` triggers a rollback (§4.5): the manager must therefore
/// require subscribers be idempotent against repeated application of the
/// same config, since a later subscriber's failure re-applies earlier ones'
/// no-op on the reverted config.
pub trait ConfigSubscriber: Send + Sync {
    fn apply(&self, diff: &ConfigDiff, previous: &Config, next: &Config) -> Result<(), String>;
}

struct Inner {
    current: Config,
    last_good_raw: String,
    subscribers: Vec<Arc<dyn ConfigSubscriber>>,
    last_seen_hash: u64,
    last_seen_mtime_ms: i64,
}

/// Owns the active configuration and the poll-based file watcher.
pub struct ConfigManager {
    path: PathBuf,
    inner: Mutex<Inner>,
}

fn hash_of(bytes: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    bytes.hash(&mut h);
    h.finish()
}

impl ConfigManager {
    pub fn load(path: &Path) -> Result<(Config, String), base::Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            base::Error::wrap(base::ErrorKind::NotFound, format!("reading {}", path.display()), e)
        })?;
        let cfg: Config = serde_json::from_str(&raw).map_err(|e| {
            base::Error::wrap(base::ErrorKind::InvalidArgument, "parsing configuration json", e)
        })?;
        validate(&cfg)
            .map_err(|e| base::Error::wrap(base::ErrorKind::InvalidArgument, "validating configuration", e))?;
        Ok((cfg, raw))
    }

    pub fn new(path: PathBuf, initial: Config, initial_raw: String) -> Self {
        let mtime_ms = mtime_ms(&path).unwrap_or(0);
        ConfigManager {
            path,
            inner: Mutex::new(Inner {
                current: initial,
                last_seen_hash: hash_of(initial_raw.as_bytes()),
                last_good_raw: initial_raw,
                subscribers: Vec::new(),
                last_seen_mtime_ms: mtime_ms,
            }),
        }
    }

    pub fn current(&self) -> Config {
        self.inner.lock().unwrap().current.clone()
    }

    pub fn subscribe(&self, sub: Arc<dyn ConfigSubscriber>) {
        self.inner.lock().unwrap().subscribers.push(sub);
    }

    /// Reloads from the on-disk file at `raw`'s path, applying validation,
    /// diffing, subscriber notification, and rollback per §4.5.
    pub fn reload(&self, raw: &str) -> Result<ConfigDiff, String> {
        let next: Config = match serde_json::from_str(raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, "configuration reload failed");
                self.restore_file();
                return Err(format!("parse error: {e}"));
            }
        };
        if let Err(e) = validate(&next) {
            warn!(err = %e, "configuration reload failed");
            self.restore_file();
            return Err(e.to_string());
        }

        let mut inner = self.inner.lock().unwrap();
        let previous = inner.current.clone();
        let d = diff(&previous, &next);

        for sub in inner.subscribers.clone() {
            if let Err(reason) = sub.apply(&d, &previous, &next) {
                warn!(reason, "configuration rollback applied");
                drop(inner);
                self.restore_file();
                return Err(reason);
            }
        }

        inner.current = next;
        inner.last_good_raw = raw.to_string();
        inner.last_seen_hash = hash_of(raw.as_bytes());
        drop(inner);
        info!("configuration reloaded");
        Ok(d)
    }

    fn restore_file(&self) {
        let raw = self.inner.lock().unwrap().last_good_raw.clone();
        if let Err(e) = std::fs::write(&self.path, raw) {
            warn!(err = %e, path = %self.path.display(), "restoring last-known-good configuration file failed");
        }
    }

    /// One poll tick: returns `true` if the file changed (by mtime+hash) and
    /// a reload was attempted, regardless of whether it succeeded.
    pub fn poll_once(&self) -> bool {
        let mtime = match mtime_ms(&self.path) {
            Some(m) => m,
            None => return false,
        };
        let (prev_mtime, prev_hash) = {
            let inner = self.inner.lock().unwrap();
            (inner.last_seen_mtime_ms, inner.last_seen_hash)
        };
        if mtime == prev_mtime {
            return false;
        }
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "reading configuration file during poll failed");
                return false;
            }
        };
        let hash = hash_of(raw.as_bytes());
        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_seen_mtime_ms = mtime;
        }
        if hash == prev_hash {
            return false;
        }
        let _ = self.reload(&raw);
        true
    }

    /// Spawns the poll loop at `poll_interval_ms` (default 2000 per
    /// `config.pollIntervalMs`). Exits when `shutdown` fires.
    pub fn spawn_watch(
        self: Arc<Self>,
        poll_interval_ms: u64,
        shutdown: base::shutdown::Receiver,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(poll_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once();
                    }
                    _ = shutdown.as_future() => break,
                }
            }
        })
    }
}

fn mtime_ms(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(dur.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            video: VideoConfig {
                cameras: vec![CameraConfig {
                    id: "cam-1".into(),
                    channel: "lobby".into(),
                    extra: Default::default(),
                }],
                channels: BTreeMap::from([("video:lobby".to_string(), vec!["cam-1".to_string()])]),
                ..Default::default()
            },
            motion: MotionConfig {
                diff_threshold: 1.0,
                area_threshold: 0.1,
            },
            person: PersonConfig {
                score: 0.5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn valid_minimal_config_passes() {
        assert!(validate(&minimal_config()).is_ok());
    }

    #[test]
    fn aggregates_multiple_violations() {
        let mut cfg = minimal_config();
        cfg.motion.area_threshold = 5.0;
        cfg.person.score = -1.0;
        cfg.audio.channel = "lobby".to_string();
        let err = validate(&cfg).unwrap_err();
        assert!(err.violations.len() >= 3, "{:?}", err.violations);
    }

    #[test]
    fn unreferenced_channel_key_is_rejected() {
        let mut cfg = minimal_config();
        cfg.video.channels.insert("video:ghost".to_string(), vec![]);
        let err = validate(&cfg).unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("video:ghost")));
    }

    #[test]
    fn max_events_without_suppress_for_ms_is_rejected() {
        let mut cfg = minimal_config();
        cfg.events.suppression.rules.push(SuppressionRuleConfig {
            id: "r1".into(),
            max_events: Some(3),
            ..Default::default()
        });
        let err = validate(&cfg).unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("maxEvents")));
    }

    #[test]
    fn max_events_without_rate_limit_is_rejected() {
        let mut cfg = minimal_config();
        cfg.events.suppression.rules.push(SuppressionRuleConfig {
            id: "r1".into(),
            max_events: Some(3),
            suppress_for_ms: Some(1_000),
            ..Default::default()
        });
        let err = validate(&cfg).unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("rateLimit")));
    }

    #[test]
    fn max_events_with_suppress_for_ms_and_rate_limit_passes() {
        let mut cfg = minimal_config();
        cfg.events.suppression.rules.push(SuppressionRuleConfig {
            id: "r1".into(),
            max_events: Some(3),
            suppress_for_ms: Some(1_000),
            rate_limit: Some(RateLimit { count: 3, per_ms: 1_000 }),
            ..Default::default()
        });
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn diff_reports_added_removed_changed_cameras() {
        let mut prev = minimal_config();
        let mut next = minimal_config();
        next.video.cameras.push(CameraConfig {
            id: "cam-2".into(),
            channel: "porch".into(),
            extra: Default::default(),
        });
        prev.video.cameras[0].channel = "lobby-old".into();
        let d = diff(&prev, &next);
        assert_eq!(d.cameras.added, vec!["cam-2".to_string()]);
        assert_eq!(d.cameras.changed, vec!["cam-1".to_string()]);
    }
}
