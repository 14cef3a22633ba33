// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `run`: starts the supervisor process — one capture pipeline per camera,
//! the event bus, retention, hot config watching, and the HTTP/SSE gateway —
//! and runs until a shutdown signal arrives.

use crate::bus::{Bus, Matcher, SuppressionRule};
use crate::capture::{self, Options as CaptureOptions};
use crate::config::{CameraConfig, Config, ConfigDiff, ConfigManager, ConfigSubscriber};
use crate::detect::audio::{self, AudioAnomalyDetector, DftFeatureExtractor};
use crate::detect::motion::{self, MotionDetector, PngDiffScorer};
use crate::detect::person::{NullPersonDetector, PersonGate};
use crate::metrics::Metrics;
use crate::retention::{RetentionConfig, SnapshotMode, SnapshotPolicy, VacuumPolicy, VacuumRun};
use crate::web::{Gateway, GatewayConfig};
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use store::{Meta, NewEvent, Severity};
use tracing::{info, warn};

/// Runs the daemon: captures configured cameras, runs detectors, and serves
/// the HTTP/SSE gateway until shutdown.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the JSON configuration file.
    #[bpaf(long("config"), argument("PATH"), fallback(super::default_config_path()))]
    config: PathBuf,

    /// Address the HTTP/SSE gateway listens on.
    #[bpaf(long("listen"), argument("ADDR"), fallback("0.0.0.0:8080".parse().unwrap()))]
    listen: SocketAddr,
}

fn severity_from_str(s: &str) -> Severity {
    Severity::parse(s).unwrap_or(Severity::Info)
}

fn suppression_rules(cfg: &Config) -> Vec<SuppressionRule> {
    cfg.events
        .suppression
        .rules
        .iter()
        .map(|r| SuppressionRule {
            id: r.id.clone(),
            matcher: Matcher {
                detector: r.detector.clone(),
                source: r.source.clone(),
                channel: r.channel.clone(),
                severity_at_least: r.severity_at_least.as_deref().map(severity_from_str),
            },
            suppress_for_ms: r.suppress_for_ms,
            max_events: r.max_events,
            per_ms: r.rate_limit.as_ref().map(|rl| rl.per_ms),
            timeline_ttl_ms: r.timeline_ttl_ms,
            reason: r.reason.clone().unwrap_or_default(),
        })
        .collect()
}

fn retention_config(cfg: &Config) -> RetentionConfig {
    // `events.retention` is carried as a freeform `Value` in the config
    // struct (§6.3); defaults below match the ones documented in SPEC_FULL
    // §6 when the document omits a key.
    let v = &cfg.events.retention;
    let get_i64 = |key: &str, default: i64| v.get(key).and_then(|x| x.as_i64()).unwrap_or(default);
    let get_bool = |key: &str, default: bool| v.get(key).and_then(|x| x.as_bool()).unwrap_or(default);
    let get_str = |key: &str, default: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .unwrap_or(default)
            .to_string()
    };
    let snapshot_dirs: Vec<PathBuf> = v
        .get("snapshotDirs")
        .and_then(|x| x.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();

    let snapshot_v = v.get("snapshot");
    let mode = match snapshot_v.and_then(|s| s.get("mode")).and_then(|m| m.as_str()) {
        Some("delete") => SnapshotMode::Delete,
        _ => SnapshotMode::Archive,
    };
    let vacuum_v = v.get("vacuum");
    let run = match vacuum_v.and_then(|vv| vv.get("run")).and_then(|r| r.as_str()) {
        Some("always") => VacuumRun::Always,
        Some("never") => VacuumRun::Never,
        _ => VacuumRun::OnChange,
    };

    RetentionConfig {
        enabled: get_bool("enabled", true),
        retention_days: get_i64("retentionDays", 30),
        interval_ms: get_i64("intervalMs", 3_600_000),
        archive_dir: PathBuf::from(get_str("archiveDir", "archive")),
        snapshot_dirs,
        snapshot: SnapshotPolicy {
            mode,
            retention_days: snapshot_v
                .and_then(|s| s.get("retentionDays"))
                .and_then(|x| x.as_i64())
                .unwrap_or(14),
            max_archives_per_camera: snapshot_v
                .and_then(|s| s.get("maxArchivesPerCamera"))
                .and_then(|x| x.as_u64())
                .unwrap_or(100) as u32,
            per_camera_max: Default::default(),
        },
        vacuum: VacuumPolicy {
            run,
            reindex: vacuum_v.and_then(|vv| vv.get("reindex")).and_then(|x| x.as_bool()).unwrap_or(false),
            analyze: vacuum_v.and_then(|vv| vv.get("analyze")).and_then(|x| x.as_bool()).unwrap_or(false),
            optimize: vacuum_v.and_then(|vv| vv.get("optimize")).and_then(|x| x.as_bool()).unwrap_or(false),
            pragmas: vacuum_v
                .and_then(|vv| vv.get("pragmas"))
                .and_then(|p| p.as_array())
                .map(|arr| arr.iter().filter_map(|e| e.as_str().map(String::from)).collect())
                .unwrap_or_default(),
        },
    }
}

pub(crate) fn find_camera_or_err<'a>(cfg: &'a Config, needle: &str) -> Result<&'a crate::config::CameraConfig, Error> {
    super::find_camera(cfg, needle).ok_or_else(|| {
        Error::new(
            base::ErrorKind::NotFound,
            format!("no camera matches {needle:?}"),
        )
    })
}

pub(crate) fn capture_options_for(cfg: &Config, cam: &crate::config::CameraConfig) -> CaptureOptions {
    let ffmpeg = &cfg.video.ffmpeg;
    let get_str = |key: &str, default: &str| {
        cam.extra
            .get(key)
            .and_then(|x| x.as_str())
            .or_else(|| ffmpeg.get(key).and_then(|x| x.as_str()))
            .unwrap_or(default)
            .to_string()
    };
    let get_i64 = |key: &str, default: i64| {
        cam.extra
            .get(key)
            .and_then(|x| x.as_i64())
            .or_else(|| ffmpeg.get(key).and_then(|x| x.as_i64()))
            .unwrap_or(default)
    };
    let rtsp_transport_sequence = cam
        .extra
        .get("rtspTransportSequence")
        .or_else(|| ffmpeg.get("rtspTransportSequence"))
        .and_then(|x| x.as_array())
        .map(|arr| arr.iter().filter_map(|e| e.as_str().map(String::from)).collect())
        .unwrap_or_else(|| vec!["tcp".to_string(), "udp".to_string(), "http".to_string()]);

    CaptureOptions {
        binary: get_str("binary", "ffmpeg"),
        input_args: vec![],
        input_url: get_str("url", ""),
        rtsp_transport_sequence,
        start_timeout_ms: get_i64("startTimeoutMs", 10_000),
        watchdog_timeout_ms: get_i64("watchdogTimeoutMs", 15_000),
        idle_timeout_ms: get_i64("idleTimeoutMs", 15_000),
        force_kill_timeout_ms: get_i64("forceKillTimeoutMs", 5_000),
        max_buffer_bytes: get_i64("maxBufferBytes", 32 * 1024 * 1024) as usize,
        restart_delay_ms: get_i64("restartDelayMs", 1_000),
        restart_max_delay_ms: get_i64("restartMaxDelayMs", 30_000),
        restart_jitter_factor: cam
            .extra
            .get("restartJitterFactor")
            .and_then(|x| x.as_f64())
            .unwrap_or(0.3),
        circuit_breaker_threshold: get_i64("circuitBreakerThreshold", 10) as u32,
    }
}

/// One running camera pipeline (capture handle plus the options it was last
/// started with, so a later diff can tell whether a changed camera needs a
/// subprocess restart or just a live `UpdateOptions`).
struct PipelineEntry {
    handle: capture::Handle,
    options: CaptureOptions,
}

/// Owns the live capture pipelines and applies camera add/remove/change
/// diffs from hot config reloads (§4.5's "Diff application (by
/// subscribers)"). Registered as a [`ConfigSubscriber`] with the
/// [`ConfigManager`]; also used directly at startup to spawn the initial
/// set of cameras, so there's a single code path for "start a camera
/// pipeline" whether it happens at boot or via a later reload.
struct PipelineManager {
    metrics: Arc<Metrics>,
    clocks: Arc<RealClocks>,
    bus: Arc<Bus>,
    pipelines: Mutex<HashMap<String, PipelineEntry>>,
}

/// Capture-relevant fields that can't change without respawning the
/// subprocess (§4.5: "only spawn a new subprocess if inputs that require a
/// subprocess restart changed (input URL, ffmpeg args, sample rate)").
fn requires_subprocess_restart(old: &CaptureOptions, new: &CaptureOptions) -> bool {
    old.binary != new.binary || old.input_args != new.input_args || old.input_url != new.input_url
}

impl PipelineManager {
    fn new(metrics: Arc<Metrics>, clocks: Arc<RealClocks>, bus: Arc<Bus>) -> Self {
        PipelineManager {
            metrics,
            clocks,
            bus,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or restarts) the pipeline for `cam`, replacing any existing
    /// entry for the same camera id. No-ops with a warning if the camera has
    /// no URL configured.
    fn start_camera(&self, cfg: &Config, cam: &CameraConfig) {
        let channel = base::channel::ChannelId::normalize(&cam.channel, "video").to_string();
        let options = capture_options_for(cfg, cam);
        if options.input_url.is_empty() {
            warn!(camera = %cam.id, "camera has no url configured, skipping");
            return;
        }
        // Depth 1: the supervisor's backpressure policy drops a frame
        // outright rather than queueing behind a slow detector (§4.1).
        let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(1);
        let handle = capture::Supervisor::spawn(
            channel.clone(),
            options.clone(),
            self.metrics.clone(),
            self.bus.clone(),
            self.clocks.clone(),
            frame_tx,
        );
        handle.start();
        spawn_camera_detectors(cfg.clone(), channel, cam.id.clone(), frame_rx, self.bus.clone(), self.metrics.clone());
        self.pipelines.lock().unwrap().insert(cam.id.clone(), PipelineEntry { handle, options });
    }

    /// Removes and asynchronously stops the pipeline for `camera_id`, if any.
    fn stop_camera(&self, camera_id: &str) {
        if let Some(entry) = self.pipelines.lock().unwrap().remove(camera_id) {
            tokio::spawn(async move { entry.handle.stop().await });
        }
    }

    /// Drains all pipelines for process shutdown, returning their handles so
    /// the caller can await `stop()` on each.
    fn drain(&self) -> Vec<capture::Handle> {
        self.pipelines
            .lock()
            .unwrap()
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect()
    }
}

impl ConfigSubscriber for PipelineManager {
    fn apply(&self, diff: &ConfigDiff, _previous: &Config, next: &Config) -> Result<(), String> {
        info!(
            added = ?diff.cameras.added,
            removed = ?diff.cameras.removed,
            changed = ?diff.cameras.changed,
            "configuration reload applying camera diff"
        );

        for id in &diff.cameras.removed {
            self.stop_camera(id);
        }

        for id in &diff.cameras.added {
            if let Some(cam) = next.video.cameras.iter().find(|c| &c.id == id) {
                self.start_camera(next, cam);
            }
        }

        for id in &diff.cameras.changed {
            let Some(cam) = next.video.cameras.iter().find(|c| &c.id == id) else {
                continue;
            };
            let new_options = capture_options_for(next, cam);
            let needs_restart = {
                let pipelines = self.pipelines.lock().unwrap();
                match pipelines.get(id) {
                    Some(entry) => requires_subprocess_restart(&entry.options, &new_options),
                    None => true, // not currently running; (re-)start it.
                }
            };
            if needs_restart {
                self.stop_camera(id);
                self.start_camera(next, cam);
            } else {
                let mut pipelines = self.pipelines.lock().unwrap();
                if let Some(entry) = pipelines.get_mut(id) {
                    let updated = new_options.clone();
                    entry.handle.update_options(move |o| *o = updated);
                    entry.options = new_options;
                }
            }
        }

        Ok(())
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e))?;
    rt.block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<i32, Error> {
    let (cfg, raw) = ConfigManager::load(&args.config)?;
    let store = super::open_store(&cfg)?;
    let metrics = Arc::new(Metrics::new());
    let bus = Arc::new(Bus::new(store.clone()));
    bus.configure_suppression(suppression_rules(&cfg));

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

    let clocks = Arc::new(RealClocks);
    let pipelines = Arc::new(PipelineManager::new(metrics.clone(), clocks.clone(), bus.clone()));
    for cam in &cfg.video.cameras {
        pipelines.start_camera(&cfg, cam);
    }

    let config_manager = Arc::new(ConfigManager::new(args.config.clone(), cfg.clone(), raw));
    config_manager.subscribe(pipelines.clone());
    let _config_watch = config_manager
        .clone()
        .spawn_watch(2_000, shutdown_rx.clone());

    if !cfg.audio.channel.trim().is_empty() {
        spawn_audio_pipeline(cfg.clone(), bus.clone(), metrics.clone(), clocks.clone(), shutdown_rx.clone());
    }

    let retention_cfg = retention_config(&cfg);
    let retention_engine = Arc::new(crate::retention::RetentionEngine::new(
        store.clone(),
        clocks.clone(),
        metrics.clone(),
        bus.clone(),
    ));
    let _retention_task = retention_engine.spawn_periodic(retention_cfg, shutdown_rx.clone());

    let gateway = Arc::new(Gateway {
        bus: bus.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
        config: GatewayConfig {
            static_dir: PathBuf::from("static"),
            snapshot_allow_list: retention_config(&cfg).snapshot_dirs,
            snapshot_cache_max_age_secs: 3600,
        },
        config_manager: config_manager.clone(),
    });

    tokio::spawn({
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|e| Error::wrap(base::ErrorKind::Internal, "installing SIGTERM handler", e))?;
        async move {
            tokio::select! {
                _ = sig.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            drop(shutdown_tx);
        }
    });

    info!(addr = %args.listen, "starting HTTP/SSE gateway");
    gateway.serve(args.listen, shutdown_rx.clone()).await?;

    for h in pipelines.drain() {
        h.stop().await;
    }
    Ok(0)
}

/// Per-camera task: consumes decoded PNG frames, runs motion then the
/// person-detector gate, and publishes bus events for each trigger.
fn spawn_camera_detectors(
    cfg: Config,
    channel: String,
    camera_id: String,
    mut frame_rx: tokio::sync::mpsc::Receiver<(Vec<u8>, i64)>,
    bus: Arc<Bus>,
    metrics: Arc<Metrics>,
) {
    tokio::spawn(async move {
        let mut scorer = PngDiffScorer::new(24);
        let mut motion = MotionDetector::new(motion::Options {
            diff_threshold_multiple: 2.0,
            adaptive_area_threshold: cfg.motion.area_threshold.max(0.01),
            debounce_frames: 2,
            backoff_frames: 5,
            min_interval_ms: 2_000,
            baseline_alpha: 0.1,
        });
        let mut person_gate = PersonGate::new(crate::detect::person::Options {
            check_every_n_frames: 30,
            max_detections: 5,
            score_threshold: cfg.person.score,
        });
        let mut person_detector = NullPersonDetector;

        while let Some((frame, ts)) = frame_rx.recv().await {
            let Some((mean_diff, area_fraction)) = scorer.score(&frame) else {
                continue;
            };
            let outcome = motion.handle_sample(mean_diff, area_fraction, ts);
            if outcome.triggered {
                metrics.increment_detector_counter("motion", "triggered", 1);
                person_gate.arm();
                let event = NewEvent {
                    ts,
                    source: channel.clone(),
                    detector: "motion".to_string(),
                    severity: Severity::Info,
                    message: "motion detected".to_string(),
                    meta: Meta {
                        channel: Some(channel.clone()),
                        camera: Some(camera_id.clone()),
                        ..Default::default()
                    },
                };
                if let Err(e) = bus.publish(event, ts) {
                    warn!(err = %e.chain(), "publishing motion event failed");
                }
            }

            if let Some(score) = person_gate.handle_frame(&frame, &mut person_detector) {
                metrics.increment_detector_counter("person", "detected", 1);
                let event = NewEvent {
                    ts,
                    source: channel.clone(),
                    detector: "person".to_string(),
                    severity: Severity::Warning,
                    message: format!("person detected (score={score:.2})"),
                    meta: Meta {
                        channel: Some(channel.clone()),
                        camera: Some(camera_id.clone()),
                        ..Default::default()
                    },
                };
                if let Err(e) = bus.publish(event, ts) {
                    warn!(err = %e.chain(), "publishing person event failed");
                }
            }
        }
    });
}

fn audio_device(cfg: &Config) -> Option<String> {
    let os_key = if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "windows"
    };
    cfg.audio
        .mic_fallbacks
        .get(os_key)
        .and_then(|entries| entries.first())
        .map(|e| e.device.clone())
        .or_else(|| cfg.audio.anomaly.get("device").and_then(|v| v.as_str()).map(String::from))
}

fn audio_anomaly_options(cfg: &Config) -> audio::Options {
    let a = &cfg.audio.anomaly;
    let get_f64 = |key: &str, default: f64| a.get(key).and_then(|x| x.as_f64()).unwrap_or(default);
    let get_i64 = |key: &str, default: i64| a.get(key).and_then(|x| x.as_i64()).unwrap_or(default);
    let get_usize = |key: &str, default: usize| a.get(key).and_then(|x| x.as_u64()).unwrap_or(default as u64) as usize;
    let thresholds = |key: &str| audio::Thresholds {
        rms: a
            .get(key)
            .and_then(|t| t.get("rms"))
            .and_then(|x| x.as_f64())
            .unwrap_or(6.0),
        centroid_jump: a
            .get(key)
            .and_then(|t| t.get("centroidJump"))
            .and_then(|x| x.as_f64())
            .unwrap_or(400.0),
    };
    let night_hours = a
        .get("nightHours")
        .and_then(|v| v.as_array())
        .map(|arr| {
            (
                arr.first().and_then(|x| x.as_u64()).unwrap_or(22) as u8,
                arr.get(1).and_then(|x| x.as_u64()).unwrap_or(6) as u8,
            )
        })
        .unwrap_or((22, 6));

    audio::Options {
        sample_rate: get_i64("sampleRate", 16_000) as u32,
        frame_size: get_usize("frameSize", 1024),
        hop_size: get_usize("hopSize", 512),
        baseline_alpha: get_f64("baselineAlpha", 0.05),
        min_trigger_duration_ms: get_i64("minTriggerDurationMs", 500),
        min_interval_ms: get_i64("minIntervalMs", 5_000),
        day_night: audio::DayNightOptions {
            day: thresholds("dayThresholds"),
            night: thresholds("nightThresholds"),
            night_hours,
            blend_minutes: get_f64("blendMinutes", 30.0),
        },
    }
}

/// Spawns the audio capture + anomaly pipeline. Audio framing is trivial
/// (raw PCM, no frame markers), so this runs its own restart loop built
/// directly on [`capture::backoff::compute`] rather than going through
/// [`capture::Supervisor`], which is specialized to PNG framing for video
/// (recorded as a scope decision in DESIGN.md).
fn spawn_audio_pipeline(
    cfg: Config,
    bus: Arc<Bus>,
    metrics: Arc<Metrics>,
    clocks: Arc<RealClocks>,
    shutdown: base::shutdown::Receiver,
) {
    use crate::capture::backoff::{self, BackoffOptions, RandJitter};
    use tokio::io::AsyncReadExt;

    let channel = base::channel::ChannelId::normalize(&cfg.audio.channel, "audio").to_string();
    let Some(device) = audio_device(&cfg) else {
        warn!("audio.channel configured but no capture device resolved, skipping audio pipeline");
        return;
    };
    let options = audio_anomaly_options(&cfg);
    let backoff_opts = BackoffOptions {
        restart_delay_ms: 1_000,
        restart_max_delay_ms: 30_000,
        restart_jitter_factor: 0.3,
    };

    tokio::spawn(async move {
        let mut jitter = RandJitter;
        let mut detector = AudioAnomalyDetector::new(options.clone());
        let mut extractor = DftFeatureExtractor::new(options.sample_rate);
        let mut attempt = 0u32;

        loop {
            if shutdown.check().is_err() {
                break;
            }
            let mut cmd = tokio::process::Command::new("arecord");
            cmd.args(["-D", &device, "-f", "S16_LE", "-r", &options.sample_rate.to_string(), "-t", "raw"]);
            cmd.stdout(std::process::Stdio::piped());
            cmd.stderr(std::process::Stdio::null());
            cmd.kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %channel, %e, "failed to spawn audio capture");
                    attempt += 1;
                    let backoff = backoff::compute(&backoff_opts, attempt, &mut jitter);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff.delay_ms.max(0) as u64)).await;
                    continue;
                }
            };
            let mut stdout = child.stdout.take().expect("stdout piped");
            let mut buf = [0u8; 4096];
            let mut carry: Option<u8> = None;

            loop {
                tokio::select! {
                    n = stdout.read(&mut buf) => {
                        match n {
                            Ok(0) => break,
                            Ok(n) => {
                                attempt = 0;
                                let mut samples = Vec::with_capacity(n / 2 + 1);
                                let mut chunk = &buf[..n];
                                if let Some(lo) = carry.take() {
                                    if let Some(&hi) = chunk.first() {
                                        samples.push(i16::from_le_bytes([lo, hi]));
                                        chunk = &chunk[1..];
                                    }
                                }
                                let mut it = chunk.chunks_exact(2);
                                for pair in &mut it {
                                    samples.push(i16::from_le_bytes([pair[0], pair[1]]));
                                }
                                if let [last] = it.remainder() {
                                    carry = Some(*last);
                                }

                                let ts = clocks.now_ms();
                                let minute_of_day = minute_of_day(ts);
                                let outcome = detector.handle_samples(&samples, ts, minute_of_day, &mut extractor);
                                if outcome.triggered {
                                    metrics.increment_detector_counter("audio-anomaly", "triggered", 1);
                                    let event = NewEvent {
                                        ts,
                                        source: channel.clone(),
                                        detector: "audio-anomaly".to_string(),
                                        severity: Severity::Warning,
                                        message: "audio anomaly detected".to_string(),
                                        meta: Meta {
                                            channel: Some(channel.clone()),
                                            ..Default::default()
                                        },
                                    };
                                    if let Err(e) = bus.publish(event, ts) {
                                        warn!(err = %e.chain(), "publishing audio-anomaly event failed");
                                    }
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = shutdown.as_future() => {
                        let _ = child.kill().await;
                        return;
                    }
                }
            }

            let _ = child.kill().await;
            attempt += 1;
            let backoff = backoff::compute(&backoff_opts, attempt, &mut jitter);
            info!(channel = %channel, attempt, delay_ms = backoff.delay_ms, "scheduling audio capture restart");
            tokio::time::sleep(std::time::Duration::from_millis(backoff.delay_ms.max(0) as u64)).await;
        }
    });
}

fn minute_of_day(ts_ms: i64) -> f64 {
    use jiff::tz::TimeZone;
    let Ok(zoned) = jiff::Timestamp::from_millisecond(ts_ms).map(|t| t.to_zoned(TimeZone::system())) else {
        return 0.0;
    };
    (zoned.hour() as f64) * 60.0 + zoned.minute() as f64
}
