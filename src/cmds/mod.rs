// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::config::{CameraConfig, Config};
use base::{Error, ErrorKind};
use std::sync::Arc;
use store::Store;

pub mod check;
pub mod config_cmd;
pub mod reset_circuit_breaker;
pub mod reset_transport;
pub mod run;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "config/default.json";

pub(crate) fn default_config_path() -> std::path::PathBuf {
    DEFAULT_CONFIG_PATH.into()
}

/// Opens the event store at `cfg.database.path`, defaulting to an
/// on-disk file next to the config the way `cmds::run::open_conn` defaults
/// to a well-known directory.
pub(crate) fn open_store(cfg: &Config) -> Result<Arc<Store>, Error> {
    let path = if cfg.database.path.trim().is_empty() {
        "guardian.db"
    } else {
        cfg.database.path.as_str()
    };
    Store::open(path)
        .map(Arc::new)
        .map_err(|e| Error::wrap(ErrorKind::Internal, format!("opening database {path:?}"), e))
}

/// Finds the camera config whose normalized channel or id matches `needle`.
pub(crate) fn find_camera<'a>(cfg: &'a Config, needle: &str) -> Option<&'a CameraConfig> {
    let normalized = base::channel::ChannelId::normalize(needle, "video");
    cfg.video.cameras.iter().find(|c| {
        c.id == needle || base::channel::ChannelId::normalize(&c.channel, "video") == normalized
    })
}
