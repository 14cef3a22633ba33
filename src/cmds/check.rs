// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2018-2020 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to validate the configuration and confirm the database opens,
//! without starting any pipelines (§6.1).

use crate::config::ConfigManager;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::{error, info};

/// Validates config and database without starting pipelines.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the JSON configuration file.
    #[bpaf(long("config"), argument("PATH"), fallback(super::default_config_path()))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (cfg, _raw) = match ConfigManager::load(&args.config) {
        Ok(v) => v,
        Err(e) => {
            error!(err = %e.chain(), "configuration invalid");
            return Ok(1);
        }
    };
    info!(path = %args.config.display(), "configuration is valid");

    match super::open_store(&cfg) {
        Ok(_) => {
            info!("database opens cleanly");
            Ok(0)
        }
        Err(e) => {
            error!(err = %e.chain(), "database failed to open");
            Ok(1)
        }
    }
}
