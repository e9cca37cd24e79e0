// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{Error, ErrorKind};
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;

const DEFAULT_CONFIG_PATH: &str = "/etc/detection-supervisor.toml";

/// Detection Supervisor: watches CCTV streams for parking violations and
/// reports confirmed ones to a backend.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(env!("VERSION")))]
struct Args {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,
}

fn parse_config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .short('c')
        .help("Path to the TOML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_CONFIG_PATH.into())
        .debug_fallback()
}

/// Maps an error's kind to the process's documented exit code: 1 for a fatal
/// configuration problem, 2 for an unrecoverable backend outage at startup
/// with no local stream list to fall back on, 3 for anything else.
fn exit_code(e: &Error) -> i32 {
    match e.kind() {
        ErrorKind::Config => 1,
        ErrorKind::DegradedExternal => 2,
        _ => 3,
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/detection-supervisor`: `detection-supervisor`), falling
    // back to the crate name if conversion to a path/UTF-8 string fails.
    // `bpaf`'s default logic is similar but doesn't have the fallback.
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
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match cmds::run::run(&args.config) {
        Err(e) => {
            error!(%e, "exiting due to error");
            std::process::exit(exit_code(&e));
        }
        Ok(()) => {
            debug!("clean shutdown");
            std::process::exit(0);
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
