// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Capture Supervisor (C1): one actor task per channel, reading a
//! decoder subprocess's stdout serially and performing framing, with an
//! `mpsc` command queue so `Start`/`Stop`/reset/update calls serialize
//! against timer firings and frame delivery the way §5 requires.

pub mod backoff;
pub mod framing;
pub mod stderr;

use crate::bus::{Bus, TransportFallbackWarning, Warning};
use crate::metrics::{Metrics, PipelineKind, RestartDescriptor};
use backoff::{BackoffOptions, JitterSource, RandJitter};
use base::clock::Clocks;
use stderr::FailureClass;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use store::{Meta, NewEvent, Severity};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Idle,
    Starting,
    Running,
    Recovering,
    Broken,
}

#[derive(Clone, Debug)]
pub struct TransportState {
    pub sequence: Vec<String>,
    pub index: usize,
}

impl TransportState {
    pub fn current(&self) -> Option<&str> {
        self.sequence.get(self.index).map(String::as_str)
    }

    pub fn base(&self) -> Option<&str> {
        self.sequence.first().map(String::as_str)
    }

    /// Advances the index by one, wrapping, per §4.1's "advance the
    /// sequence index by 1 (wrapping)".
    pub fn advance(&mut self) -> (Option<String>, Option<String>) {
        if self.sequence.len() < 2 {
            return (self.current().map(str::to_string), self.current().map(str::to_string));
        }
        let from = self.current().map(str::to_string);
        self.index = (self.index + 1) % self.sequence.len();
        (from, self.current().map(str::to_string))
    }

    pub fn reset_to_base(&mut self) -> (Option<String>, Option<String>) {
        let from = self.current().map(str::to_string);
        self.index = 0;
        (from, self.current().map(str::to_string))
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub binary: String,
    pub input_args: Vec<String>,
    pub input_url: String,
    pub rtsp_transport_sequence: Vec<String>,
    pub start_timeout_ms: i64,
    pub watchdog_timeout_ms: i64,
    pub idle_timeout_ms: i64,
    pub force_kill_timeout_ms: i64,
    pub max_buffer_bytes: usize,
    pub restart_delay_ms: i64,
    pub restart_max_delay_ms: i64,
    pub restart_jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
}

impl Options {
    fn backoff_options(&self) -> BackoffOptions {
        BackoffOptions {
            restart_delay_ms: self.restart_delay_ms,
            restart_max_delay_ms: self.restart_max_delay_ms,
            restart_jitter_factor: self.restart_jitter_factor,
        }
    }
}

/// Per-channel state (§3's `CaptureState`), as visible to metrics/diagnostics.
#[derive(Clone, Debug)]
pub struct CaptureState {
    pub status: Status,
    pub restart_count: u32,
    pub last_failure_reason: Option<String>,
    pub transport: TransportState,
    pub consecutive_success_frames: u32,
}

pub enum Command2 {
    Start,
    Stop(oneshot::Sender<()>),
    ResetCircuitBreaker { restart: bool },
    ResetTransportFallback { reason: String, record: bool, resets_circuit_breaker: bool },
    UpdateOptions(Box<dyn FnOnce(&mut Options) + Send>),
}

pub struct Handle {
    tx: mpsc::UnboundedSender<Command2>,
}

impl Handle {
    pub fn start(&self) {
        let _ = self.tx.send(Command2::Start);
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command2::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn reset_circuit_breaker(&self, restart: bool) {
        let _ = self.tx.send(Command2::ResetCircuitBreaker { restart });
    }

    pub fn reset_transport_fallback(&self, reason: impl Into<String>, record: bool, resets_circuit_breaker: bool) {
        let _ = self.tx.send(Command2::ResetTransportFallback {
            reason: reason.into(),
            record,
            resets_circuit_breaker,
        });
    }

    /// Applies a partial change to the live `Options` without restarting the
    /// subprocess (§4.1's `UpdateOptions`), e.g. a hot-config reload that
    /// changed `rtspTransportSequence` or a timer budget.
    pub fn update_options(&self, f: impl FnOnce(&mut Options) + Send + 'static) {
        let _ = self.tx.send(Command2::UpdateOptions(Box::new(f)));
    }
}

/// Outcome of one [`Supervisor::pump`] pass: either a classified failure
/// that should drive the restart path, or an explicit `Stop` that should
/// terminate the lifecycle cleanly and ack the caller.
enum PumpOutcome {
    Failure(FailureClass),
    Stopped(Option<oneshot::Sender<()>>),
}

/// A classified failure observed during one lifecycle of the subprocess.
struct Lifecycle {
    seen_classes: std::collections::HashSet<&'static str>,
    saw_start_signal: bool,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            seen_classes: Default::default(),
            saw_start_signal: false,
        }
    }

    /// Returns `true` if this is the first time `class` has been observed
    /// this lifecycle (dedup rule in §4.1).
    fn observe(&mut self, class: FailureClass) -> bool {
        self.seen_classes.insert(class.as_str())
    }
}

pub struct Supervisor<C: Clocks> {
    channel: String,
    options: Options,
    state: CaptureState,
    metrics: Arc<Metrics>,
    bus: Arc<Bus>,
    clocks: Arc<C>,
    jitter: Box<dyn JitterSource>,
    frame_tx: mpsc::Sender<(Vec<u8>, i64)>,
    rx: mpsc::UnboundedReceiver<Command2>,
}

impl<C: Clocks> Supervisor<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        channel: String,
        options: Options,
        metrics: Arc<Metrics>,
        bus: Arc<Bus>,
        clocks: Arc<C>,
        frame_tx: mpsc::Sender<(Vec<u8>, i64)>,
    ) -> Handle
    where
        C: 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = TransportState {
            sequence: options.rtsp_transport_sequence.clone(),
            index: 0,
        };
        metrics.set_pipeline_channel_timers(
            PipelineKind::Ffmpeg,
            &channel,
            options.watchdog_timeout_ms,
            options.idle_timeout_ms,
            options.start_timeout_ms,
        );
        let sup = Supervisor {
            channel,
            options,
            state: CaptureState {
                status: Status::Idle,
                restart_count: 0,
                last_failure_reason: None,
                transport,
                consecutive_success_frames: 0,
            },
            metrics,
            bus,
            clocks,
            jitter: Box::new(RandJitter),
            frame_tx,
            rx,
        };
        tokio::spawn(sup.run());
        Handle { tx }
    }

    /// Records a transport-fallback transition to both the metrics registry
    /// and the `warning` SSE channel (§4.1, §7.4).
    fn warn_transport_fallback(&self, from: &str, to: &str, reason: &str) {
        self.metrics
            .record_transport_fallback(PipelineKind::Ffmpeg, &self.channel, from, to, reason);
        self.bus.publish_warning(Warning::TransportFallback(TransportFallbackWarning {
            channel: self.channel.clone(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
            at: self.clocks.now_ms(),
        }));
    }

    async fn run(mut self) {
        loop {
            match self.rx.recv().await {
                Some(Command2::Start) => self.handle_start().await,
                Some(Command2::Stop(ack)) => {
                    self.state.status = Status::Idle;
                    let _ = ack.send(());
                }
                Some(Command2::ResetCircuitBreaker { restart }) => {
                    self.state.status = Status::Idle;
                    self.state.restart_count = 0;
                    if restart {
                        self.handle_start().await;
                    }
                }
                Some(Command2::ResetTransportFallback {
                    reason,
                    record,
                    resets_circuit_breaker,
                }) => {
                    let (from, to) = self.state.transport.reset_to_base();
                    if record {
                        if let (Some(from), Some(to)) = (from, to) {
                            self.warn_transport_fallback(&from, &to, &reason);
                        }
                    }
                    if resets_circuit_breaker {
                        self.state.restart_count = 0;
                        self.state.status = Status::Idle;
                    }
                }
                Some(Command2::UpdateOptions(f)) => {
                    self.apply_option_update(f);
                }
                None => break,
            }
        }
    }

    async fn handle_start(&mut self) {
        if matches!(self.state.status, Status::Starting | Status::Running) {
            return; // idempotent, per §4.1.
        }
        if matches!(self.state.status, Status::Broken) {
            return; // requires explicit reset.
        }
        self.state.status = Status::Starting;
        self.run_one_lifecycle().await;
    }

    /// Applies an `UpdateOptions` closure, then resyncs `state.transport`
    /// if it touched `rtsp_transport_sequence`: §4.1 requires that "sequence
    /// changes preserve the current transport if still present in the new
    /// sequence, else reset to its base." `state.transport` is a separate
    /// copy (it also tracks the live index), so it doesn't follow
    /// `options.rtsp_transport_sequence` automatically.
    fn apply_option_update(&mut self, f: Box<dyn FnOnce(&mut Options) + Send>) {
        let old_sequence = self.options.rtsp_transport_sequence.clone();
        f(&mut self.options);
        if self.options.rtsp_transport_sequence != old_sequence {
            let new_sequence = self.options.rtsp_transport_sequence.clone();
            let new_index = self
                .state
                .transport
                .current()
                .and_then(|cur| new_sequence.iter().position(|t| t == cur))
                .unwrap_or(0);
            self.state.transport = TransportState {
                sequence: new_sequence,
                index: new_index,
            };
        }
        self.metrics.set_pipeline_channel_timers(
            PipelineKind::Ffmpeg,
            &self.channel,
            self.options.watchdog_timeout_ms,
            self.options.idle_timeout_ms,
            self.options.start_timeout_ms,
        );
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.options.binary);
        cmd.args(&self.options.input_args);
        cmd.arg("-i").arg(&self.options.input_url);
        if self.options.input_url.starts_with("rtsp://") {
            if let Some(transport) = self.state.transport.current() {
                cmd.arg("-rtsp_transport").arg(transport);
            }
        }
        cmd.args(["-f", "image2pipe", "-vcodec", "png", "pipe:1"]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawns the subprocess, reads it to exhaustion (or until `Stop`), and
    /// on failure schedules the next restart. Returns once the lifecycle is
    /// over (subprocess reaped, or a scheduled restart is pending).
    async fn run_one_lifecycle(&mut self) {
        let mut cmd = self.build_command();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let class = stderr::classify_spawn_error(&e);
                warn!(channel = %self.channel, %e, class = class.as_str(), "failed to spawn decoder");
                self.fail(class).await;
                return;
            }
        };

        let mut lifecycle = Lifecycle::new();
        self.state.status = Status::Running;
        match self.pump(&mut child, &mut lifecycle).await {
            PumpOutcome::Failure(class) => {
                let _ = child.kill().await;
                self.fail(class).await;
            }
            PumpOutcome::Stopped(ack) => {
                let _ = child.kill().await;
                self.state.status = Status::Idle;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    /// Reads stdout (framing) and stderr (classification) concurrently
    /// until the process exits or a fatal classification is observed, racing
    /// the start/watchdog/stream-idle timers from §4.1. Also races the
    /// command queue, so `Stop`/`UpdateOptions`/reset calls sent while a
    /// subprocess is healthy and running don't wait behind the next frame or
    /// stderr line (previously only the idle top-level loop serviced `rx`,
    /// so a long-lived healthy stream starved `Stop` indefinitely).
    async fn pump(&mut self, child: &mut Child, lifecycle: &mut Lifecycle) -> PumpOutcome {
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut framer = framing::Framer::new(self.options.max_buffer_bytes);
        let mut stdout = stdout;
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut buf = vec![0u8; 64 * 1024];

        let now = tokio::time::Instant::now();
        let start_deadline = now + Duration::from_millis(self.options.start_timeout_ms.max(0) as u64);
        let mut watchdog_deadline =
            now + Duration::from_millis(self.options.watchdog_timeout_ms.max(0) as u64);
        let mut idle_deadline = now + Duration::from_millis(self.options.idle_timeout_ms.max(0) as u64);
        let mut saw_first_frame = false;

        loop {
            tokio::select! {
                biased;

                // stream-idle is checked before watchdog-timeout when both
                // would fire on the same pass (§9 open question: preserve
                // classification-order precedence).
                _ = tokio::time::sleep_until(idle_deadline) => {
                    return PumpOutcome::Failure(FailureClass::StreamIdle);
                }
                _ = tokio::time::sleep_until(watchdog_deadline) => {
                    return PumpOutcome::Failure(FailureClass::WatchdogTimeout);
                }
                _ = tokio::time::sleep_until(start_deadline), if !saw_first_frame => {
                    return PumpOutcome::Failure(FailureClass::StartTimeout);
                }
                n = stdout.read(&mut buf) => {
                    match n {
                        Ok(0) => return PumpOutcome::Failure(FailureClass::FfmpegExit),
                        Ok(n) => {
                            idle_deadline = tokio::time::Instant::now()
                                + Duration::from_millis(self.options.idle_timeout_ms.max(0) as u64);
                            match framer.feed(&buf[..n]) {
                                Ok(frames) => {
                                    for frame in frames {
                                        saw_first_frame = true;
                                        watchdog_deadline = tokio::time::Instant::now()
                                            + Duration::from_millis(self.options.watchdog_timeout_ms.max(0) as u64);
                                        self.state.consecutive_success_frames += 1;
                                        if self.state.consecutive_success_frames == 1 {
                                            self.state.restart_count = 0;
                                        }
                                        let ts = self.clocks.now_ms();
                                        // Backpressure per §4.1: if the downstream
                                        // handler hasn't drained the previous frame
                                        // yet, drop this one rather than block
                                        // framing (the channel is bounded to depth
                                        // 1 for exactly this purpose).
                                        if let Err(mpsc::error::TrySendError::Full(_)) =
                                            self.frame_tx.try_send((frame, ts))
                                        {
                                            self.metrics.increment_dropped_frames(
                                                PipelineKind::Ffmpeg,
                                                &self.channel,
                                            );
                                        }
                                    }
                                }
                                Err(framing::FeedError::BufferOverflow) => {
                                    if lifecycle.observe(FailureClass::CorruptedFrame) {
                                        return PumpOutcome::Failure(FailureClass::CorruptedFrame);
                                    }
                                }
                            }
                        }
                        Err(_) => return PumpOutcome::Failure(FailureClass::StreamError),
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(class) = stderr::classify_line(&line) {
                                if lifecycle.observe(class) {
                                    return PumpOutcome::Failure(class);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command2::Stop(ack)) => return PumpOutcome::Stopped(ack),
                        Some(Command2::UpdateOptions(f)) => self.apply_option_update(f),
                        Some(Command2::Start) => {} // already running; idempotent per §4.1.
                        Some(Command2::ResetCircuitBreaker { .. }) => {} // only meaningful once broken.
                        Some(Command2::ResetTransportFallback { reason, record, resets_circuit_breaker }) => {
                            let (from, to) = self.state.transport.reset_to_base();
                            if record {
                                if let (Some(from), Some(to)) = (from, to) {
                                    self.warn_transport_fallback(&from, &to, &reason);
                                }
                            }
                            if resets_circuit_breaker {
                                self.state.restart_count = 0;
                            }
                        }
                        None => return PumpOutcome::Stopped(None),
                    }
                }
            }
        }
    }

    async fn fail(&mut self, class: FailureClass) {
        self.state.last_failure_reason = Some(class.as_str().to_string());
        self.state.consecutive_success_frames = 0;

        if class.advances_transport() {
            let (from, to) = self.state.transport.advance();
            if let (Some(from), Some(to)) = (from, to) {
                self.warn_transport_fallback(&from, &to, class.as_str());
            }
        }

        self.state.restart_count += 1;
        if self.state.restart_count >= self.options.circuit_breaker_threshold {
            self.state.status = Status::Broken;
            let now = self.clocks.now_ms();
            self.metrics.set_pipeline_channel_health(
                PipelineKind::Ffmpeg,
                &self.channel,
                Some("critical"),
                Some("circuit-breaker"),
                Some(now),
            );
            self.metrics
                .record_circuit_breaker_trip(PipelineKind::Ffmpeg, &self.channel, now);
            warn!(channel = %self.channel, attempts = self.state.restart_count, "circuit breaker tripped");
            let event = NewEvent {
                ts: now,
                source: self.channel.clone(),
                detector: "capture".to_string(),
                severity: Severity::Critical,
                message: format!("circuit breaker tripped after {} attempts", self.state.restart_count),
                meta: Meta {
                    channel: Some(self.channel.clone()),
                    ..Default::default()
                },
            };
            if let Err(e) = self.bus.publish(event, now) {
                warn!(channel = %self.channel, err = %e.chain(), "publishing circuit-breaker fatal event failed");
            }
            return;
        }

        self.state.status = Status::Recovering;
        let backoff = backoff::compute(
            &self.options.backoff_options(),
            self.state.restart_count,
            self.jitter.as_mut(),
        );
        self.metrics.record_pipeline_restart(
            PipelineKind::Ffmpeg,
            &self.channel,
            RestartDescriptor {
                reason: class.as_str().to_string(),
                attempt: self.state.restart_count,
                delay_ms: backoff.delay_ms,
                jitter_ms: backoff.meta.applied_jitter_ms,
                at: self.clocks.now_ms(),
            },
        );
        info!(
            channel = %self.channel,
            reason = class.as_str(),
            attempt = self.state.restart_count,
            delay_ms = backoff.delay_ms,
            "scheduling restart"
        );
        // Race the backoff sleep against the command queue so `Stop` cancels
        // a pending restart immediately (§4.1: "Stop overrides and cancels
        // any scheduled restart") instead of waiting it out.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(backoff.delay_ms.max(0) as u64);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command2::Stop(ack)) => {
                            self.state.status = Status::Idle;
                            let _ = ack.send(());
                            return;
                        }
                        Some(Command2::UpdateOptions(f)) => self.apply_option_update(f),
                        Some(Command2::ResetCircuitBreaker { restart }) => {
                            self.state.restart_count = 0;
                            if !restart {
                                self.state.status = Status::Idle;
                                return;
                            }
                        }
                        Some(Command2::ResetTransportFallback { reason, record, resets_circuit_breaker }) => {
                            let (from, to) = self.state.transport.reset_to_base();
                            if record {
                                if let (Some(from), Some(to)) = (from, to) {
                                    self.warn_transport_fallback(&from, &to, &reason);
                                }
                            }
                            if resets_circuit_breaker {
                                self.state.restart_count = 0;
                            }
                        }
                        Some(Command2::Start) => {} // a restart is already pending.
                        None => {
                            self.state.status = Status::Idle;
                            return;
                        }
                    }
                }
            }
        }
        // Re-check status: a manual reset may have intervened while waiting.
        if !matches!(self.state.status, Status::Broken) {
            self.state.status = Status::Starting;
            Box::pin(self.run_one_lifecycle()).await;
        }
    }
}

#[derive(Default)]
pub struct HistoryLimited<T> {
    items: VecDeque<T>,
    limit: usize,
}

impl<T> HistoryLimited<T> {
    pub fn new(limit: usize) -> Self {
        HistoryLimited {
            items: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > self.limit {
            self.items.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_advance_wraps() {
        let mut t = TransportState {
            sequence: vec!["tcp".into(), "udp".into(), "http".into()],
            index: 0,
        };
        assert_eq!(t.advance(), (Some("tcp".into()), Some("udp".into())));
        assert_eq!(t.advance(), (Some("udp".into()), Some("http".into())));
        assert_eq!(t.advance(), (Some("http".into()), Some("tcp".into())));
    }

    /// Scenario S2: three timeouts observe tcp -> udp -> http -> (reset) tcp.
    #[test]
    fn s2_transport_fallback_advance_and_reset() {
        let mut t = TransportState {
            sequence: vec!["tcp".into(), "udp".into(), "http".into()],
            index: 0,
        };
        assert_eq!(t.current(), Some("tcp"));
        t.advance();
        assert_eq!(t.current(), Some("udp"));
        t.advance();
        assert_eq!(t.current(), Some("http"));
        let (from, to) = t.reset_to_base();
        assert_eq!(from.as_deref(), Some("http"));
        assert_eq!(to.as_deref(), Some("tcp"));
    }

    #[test]
    fn single_entry_sequence_never_advances() {
        let mut t = TransportState {
            sequence: vec!["tcp".into()],
            index: 0,
        };
        assert_eq!(t.advance(), (Some("tcp".into()), Some("tcp".into())));
    }
}
