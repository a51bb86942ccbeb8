// Copyright 2018 The Molt Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate chrono;
extern crate dirs;
extern crate fern;
#[macro_use]
extern crate log;

extern crate molt_core_lib;
extern crate molt_rpc;

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use molt_core_lib::MoltCore;
use molt_rpc::RpcLoop;

fn main() {
    let logfile = setup_logging();
    match logfile {
        Ok(Some(path)) => info!("logging to {:?}", path),
        Ok(None) => info!("logging to stderr only"),
        Err(e) => eprintln!("failed to initialize logging: {:?}", e),
    }

    let mut state = MoltCore::new();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut rpc_looper = RpcLoop::new(stdout);

    match rpc_looper.mainloop(|| stdin.lock(), &mut state) {
        Ok(()) => info!("runloop ended"),
        Err(err) => error!("exited with error: {}", err),
    }
}

fn log_level_from_env() -> log::LevelFilter {
    match env::var("MOLT_LOG").unwrap_or_default().to_lowercase().as_ref() {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}

/// Sets up logging to stderr and, when a data directory is available,
/// to a logfile. Returns the logfile path, if one is in use.
fn setup_logging() -> Result<Option<PathBuf>, fern::InitError> {
    let level = log_level_from_env();
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr());

    let logfile = logfile_path();
    if let Some(ref path) = logfile {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(logfile)
}

fn logfile_path() -> Option<PathBuf> {
    let mut dir = dirs::data_local_dir()?;
    dir.push("molt");
    fs::create_dir_all(&dir).ok()?;
    dir.push("molt.log");
    Some(dir)
}
