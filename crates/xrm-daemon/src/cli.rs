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

//! Command line interface.
use once_cell::sync::Lazy;

/// The parsed command-line arguments provided to this program. Lazily initialized.
///
/// # Exits
///
/// Exits if [`argh::from_env`] would exit -- for example, if `--help` was provided or the
/// program arguments could not be parsed.
pub static PARSED_COMMANDS: Lazy<TopLevel> = Lazy::new(argh::from_env);

/// Top-level CLI commands and options. If no subcommand is given, "serve" runs with defaults.
#[derive(argh::FromArgs, PartialEq, Debug)]
pub struct TopLevel {
    /// subcommands
    #[argh(subcommand)]
    pub subcommand: Option<Command>,
}

/// Subcommands.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Command {
    /// starts the resource manager daemon.
    Serve(Serve),

    /// configuration-related subcommands.
    Config(Config),

    /// prints the daemon version to stdout.
    Version(Version),
}

/// Starts the daemon. This is the default command when no subcommand is provided.
#[derive(argh::FromArgs, PartialEq, Debug, Clone)]
#[argh(subcommand, name = "serve")]
pub struct Serve {
    /// path to the manager config file; defaults to the platform config directory.
    #[argh(option, short = 'c')]
    pub config: Option<String>,
    /// number of devices the built-in simulated driver should enumerate, when no real
    /// device-driver binding is wired in.
    #[argh(option, short = 'd', default = "2")]
    pub sim_devices: u32,
    /// tracing log level (error, warn, info, debug, trace); overridden by `RUST_LOG` if set.
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

impl Default for Serve {
    fn default() -> Serve {
        Serve {
            config: None,
            sim_devices: 2,
            log_level: String::from("info"),
        }
    }
}

/// Configuration-related subcommands.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "config")]
pub struct Config {
    /// config subcommands
    #[argh(subcommand)]
    pub subcommand: ConfigCommand,
}

/// Configuration-related subcommands.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum ConfigCommand {
    /// resets the configuration file to its default settings.
    Reset(Reset),
}

/// Resets the configuration file to its default settings.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "reset")]
pub struct Reset {}

/// Prints the daemon version to stdout.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "version")]
pub struct Version {}

#[cfg(test)]
mod test {
    use super::*;
    use argh::FromArgs;

    #[test]
    fn version() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["version"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Version(Version {}))
            }
        );
    }

    #[test]
    fn config_reset() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["config", "reset"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Config(Config {
                    subcommand: ConfigCommand::Reset(Reset {})
                }))
            }
        );
    }

    #[test]
    fn serve_defaults() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["serve"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    config: None,
                    sim_devices: 2,
                    log_level: "info".to_string(),
                }))
            }
        );
    }

    #[test]
    fn serve_with_config_path() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["serve", "-c", "/etc/xrm.conf.yaml"])
                .expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    config: Some("/etc/xrm.conf.yaml".to_string()),
                    sim_devices: 2,
                    log_level: "info".to_string(),
                }))
            }
        );
    }

    #[test]
    fn serve_with_log_level() {
        assert_eq!(
            TopLevel::from_args(&["xrmd"], &["serve", "-l", "debug"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve {
                    config: None,
                    sim_devices: 2,
                    log_level: "debug".to_string(),
                }))
            }
        );
    }
}
