/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The resource manager daemon binary.
//!
//! Builds a [`Manager`](xrm_core::manager::Manager) around whatever device driver is available
//! (here, [`xrm_core::driver::SimDriver`] standing in for real device-driver bindings, which are
//! out of scope for this workspace), then idles until told to shut down. The mutator gate itself
//! is synchronous; tokio only drives this process's own CLI/signal-handling shell.

use std::process::exit;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xrm_core::catalog::Device;
use xrm_core::config::ManagerConfig;
use xrm_core::driver::{flat_cus, SimDriver};
use xrm_core::manager::Manager;

use xrm_daemon::cli::{Command, PARSED_COMMANDS};
use xrm_daemon::error::DaemonError;

/// `RUST_LOG` wins when set; otherwise falls back to the `--log-level` CLI flag.
fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

/// Builds a [`SimDriver`] seeded with `count` devices of two IP kernels each, standing in for
/// real hardware enumeration until a real device-driver binding is wired in.
fn demo_driver(count: u32) -> SimDriver {
    let devices = (0..count)
        .map(|id| {
            let mut dev = Device::new(id, format!("demo{id}"));
            dev.is_loaded = true;
            dev.cus = flat_cus("scaler", 2);
            dev
        })
        .collect();
    SimDriver::new(devices)
}

fn run_serve(args: &xrm_daemon::cli::Serve) -> Result<(), DaemonError> {
    let config = match &args.config {
        Some(path) => ManagerConfig::load(std::path::Path::new(path))?,
        None => ManagerConfig::load_or_create()?,
    };
    config.validate()?;

    let driver = demo_driver(args.sim_devices);
    let manager = Manager::from_driver(&driver, config)?;
    info!(sim_devices = args.sim_devices, "resource manager ready");

    // No transport is wired in (out of scope); this keeps the process alive so an operator can
    // confirm the daemon starts cleanly, and exercises the manager with a synthetic client.
    let probe_client = manager.create_context(Some(std::process::id() as i32));
    if manager.echo_context(probe_client) {
        info!(client_id = probe_client, "startup self-check context created");
    }
    manager.destroy_context(probe_client).ok();

    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let default_serve = xrm_daemon::cli::Serve::default();
    let log_level = match PARSED_COMMANDS.subcommand.as_ref() {
        Some(Command::Serve(serve)) => serve.log_level.as_str(),
        _ => default_serve.log_level.as_str(),
    };
    init_logging(log_level);

    let is_serve = !matches!(
        PARSED_COMMANDS.subcommand.as_ref(),
        Some(Command::Version(_)) | Some(Command::Config(_))
    );
    let result = match PARSED_COMMANDS.subcommand.as_ref() {
        None => run_serve(&default_serve),
        Some(Command::Version(_)) => {
            println!("xrm-daemon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::Config(cfg)) => match &cfg.subcommand {
            xrm_daemon::cli::ConfigCommand::Reset(_) => {
                let default = ManagerConfig::default();
                default
                    .save(&xrm_core::config::CONFIG_FILE)
                    .map_err(DaemonError::from)
            }
        },
        Some(Command::Serve(serve)) => run_serve(serve),
    };

    if let Err(e) = result {
        warn!(error = %e, "xrm-daemon exiting with an error");
        exit(1);
    }

    // "version" and "config reset" are one-shot; only "serve" stays up for a shutdown signal.
    if is_serve {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
            }
        }
    }
}
