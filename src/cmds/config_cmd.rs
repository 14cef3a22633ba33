// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2017 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `config validate`: validates a candidate configuration file and, when
//! `--against` names a previous-good file, prints the diff that reload would
//! apply (§4.5's `ConfigDiff`) without touching a running instance.

use crate::config::{self, ConfigManager};
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::error;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Action {
    Validate,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validate" => Ok(Action::Validate),
            other => Err(format!("unrecognized config subcommand {other:?}; expected \"validate\"")),
        }
    }
}

/// Validates configuration files without starting a supervisor.
#[derive(Bpaf, Debug)]
#[bpaf(command("config"))]
pub struct Args {
    #[bpaf(positional("ACTION"))]
    action: Action,

    /// Candidate configuration file to validate.
    #[bpaf(positional("PATH"))]
    path: PathBuf,

    /// Previous last-known-good configuration file; when given, the diff
    /// that a running instance's reload would apply is printed.
    #[bpaf(long("against"), argument("PATH"), optional)]
    against: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let Action::Validate = args.action;

    let (next, _raw) = match ConfigManager::load(&args.path) {
        Ok(v) => v,
        Err(e) => {
            error!(err = %e.chain(), "configuration invalid");
            return Ok(1);
        }
    };
    println!("{}: valid", args.path.display());

    if let Some(against) = &args.against {
        let (previous, _raw) = match ConfigManager::load(against) {
            Ok(v) => v,
            Err(e) => {
                error!(err = %e.chain(), "previous configuration invalid");
                return Ok(1);
            }
        };
        let diff = config::diff(&previous, &next);
        println!("{}", serde_json::to_string_pretty(&diff).unwrap_or_default());
    }

    Ok(0)
}
