// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod bus;
mod capture;
mod cmds;
mod config;
mod detect;
mod metrics;
mod retention;
mod web;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Guardian: an edge surveillance supervisor for camera and microphone
/// channels, with motion/person/audio detection, event retention, and a
/// local HTTP/SSE gateway.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    Check(#[bpaf(external(cmds::check::args))] cmds::check::Args),
    Config(#[bpaf(external(cmds::config_cmd::args))] cmds::config_cmd::Args),
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    ResetCircuitBreaker(
        #[bpaf(external(cmds::reset_circuit_breaker::args))] cmds::reset_circuit_breaker::Args,
    ),
    ResetTransport(#[bpaf(external(cmds::reset_transport::args))] cmds::reset_transport::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Check(a) => cmds::check::run(a),
            Args::Config(a) => cmds::config_cmd::run(a),
            Args::Run(a) => cmds::run::run(a),
            Args::ResetCircuitBreaker(a) => cmds::reset_circuit_breaker::run(a),
            Args::ResetTransport(a) => cmds::reset_transport::run(a),
        }
    }
}

fn main() {
    // If using the clock will fail, find out now, before trying to log
    // anything with timestamps, so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment. See the troubleshooting guide."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
