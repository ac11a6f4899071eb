//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;
mod dispatch;
mod fib;
mod moduleapi;
mod modules;
mod route;
mod rt;
mod rttable;

use std::path::Path;

use clap::{App, Arg};
use moduleapi::ModuleRunStatus;

fn init_tracing(debug: bool) {
    let default_directive = if debug { "netforeman=debug" } else { "netforeman=info" };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_directive.parse().unwrap())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
}

fn main() {
    let matches = App::new("NetForeman")
        .about("Making sure your network is running smoothly.")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("Enable debug verbosity"),
        )
        .arg(
            Arg::with_name("config_file")
                .value_name("CONFIG-FILE")
                .help("Configuration file")
                .required(true),
        )
        .get_matches();

    let debug = matches.is_present("debug");
    init_tracing(debug);

    let config_file = Path::new(matches.value_of("config_file").unwrap());

    let dispatcher = match dispatch::Dispatcher::load(config_file, &modules::REGISTRY) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            tracing::error!(error = %e, "aborting");
            std::process::exit(1);
        }
    };

    let status = dispatcher.run();

    match status {
        ModuleRunStatus::Ok => tracing::info!("all done, terminating..."),
        ModuleRunStatus::CheckFailed => {
            tracing::warn!("check(s) failed, all actions executed successfully")
        }
        ModuleRunStatus::ActionError => {
            tracing::error!("check(s) failed, at least one action had an error")
        }
        ModuleRunStatus::UnknownError => tracing::error!("finished with unknown errors"),
    }

    std::process::exit(status.exit_code());
}
