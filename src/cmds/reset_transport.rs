// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `reset-transport <channel>`: a one-shot administrative call onto an
//! embedded supervisor for the named channel, resetting its RTSP transport
//! fallback index back to the configured base transport (§4.1's
//! `ResetTransportFallback`).

use crate::bus::Bus;
use crate::capture::{self, Options as CaptureOptions};
use crate::cmds::run::{capture_options_for, find_camera_or_err};
use crate::config::ConfigManager;
use crate::metrics::Metrics;
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Bpaf, Debug)]
#[bpaf(command("reset-transport"))]
pub struct Args {
    /// Camera id or channel to reset.
    #[bpaf(positional("CHANNEL"))]
    channel: String,

    /// Path to the JSON configuration file.
    #[bpaf(long("config"), argument("PATH"), fallback(super::default_config_path()))]
    config: PathBuf,

    /// Also clear the circuit breaker while resetting transport.
    #[bpaf(long("reset-circuit-breaker"), switch)]
    resets_circuit_breaker: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Internal, "building tokio runtime", e))?;
    rt.block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<i32, Error> {
    let (cfg, _raw) = ConfigManager::load(&args.config)?;
    let cam = find_camera_or_err(&cfg, &args.channel)?;
    let options: CaptureOptions = capture_options_for(&cfg, cam);
    let channel = base::channel::ChannelId::normalize(&cam.channel, "video").to_string();

    let store = super::open_store(&cfg)?;
    let bus = Arc::new(Bus::new(store));
    let metrics = Arc::new(Metrics::new());
    let clocks = Arc::new(RealClocks);
    let (frame_tx, _frame_rx) = tokio::sync::mpsc::channel(1);
    let handle = capture::Supervisor::spawn(channel.clone(), options, metrics, bus, clocks, frame_tx);
    handle.reset_transport_fallback("operator requested reset", true, args.resets_circuit_breaker);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.stop().await;

    tracing::info!(channel = %channel, "transport fallback reset to base");
    Ok(0)
}
