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

//! Ambient configuration: the manager's tunables, loaded from a YAML file under the platform
//! config directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const FILE_NAME: &str = "xrm.conf.yaml";

/// Configuration and data directories, namespaced the way the rest of this codebase's lineage
/// namespaces its own `ProjectDirs`.
pub static PROJECT_DIRS: Lazy<ProjectDirs> =
    Lazy::new(|| ProjectDirs::from("com", "Xrm", "Xrm").expect("no home directory for this user"));

pub static CONFIG_FILE: Lazy<PathBuf> = Lazy::new(build_config_file_path);

fn build_config_file_path() -> PathBuf {
    PROJECT_DIRS.config_dir().join(Path::new(FILE_NAME))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not create config directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The manager's ambient settings (spec.md §4.H and §9's mutex-gate design note).
///
/// Durations are stored in milliseconds since `std::time::Duration` has no native
/// `serde` impl; [`ManagerConfig::default_blocking_retry_interval`] converts to `Duration` on
/// read. There is no blocking-allocation timeout: spec.md §5 states one is not offered, and a
/// bounded wait is the caller's own responsibility via the non-blocking form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Hard cap on concurrently registered clients (spec.md §4.B `createContext`).
    pub max_concurrent_clients: u32,
    /// Default poll interval, in milliseconds, for a blocking allocation retrying against the
    /// gate (spec.md §4.E "Blocking variants"), used when a request does not supply its own.
    pub default_blocking_retry_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_clients: 1024,
            default_blocking_retry_interval_ms: 200,
        }
    }
}

impl ManagerConfig {
    pub fn default_blocking_retry_interval(&self) -> Duration {
        Duration::from_millis(self.default_blocking_retry_interval_ms)
    }

    /// Loads the config file at [`CONFIG_FILE`], writing out the default if none exists yet.
    pub fn load_or_create() -> Result<Self, ConfigError> {
        let path = CONFIG_FILE.as_path();
        if !path.exists() {
            let default = Self::default();
            default.save(path)?;
            info!(?path, "wrote default manager config");
            return Ok(default);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_yaml::from_slice(&bytes)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validates cross-field constraints a bare `Deserialize` can't express; called once after
    /// load so a malformed file fails loudly instead of silently misbehaving.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_clients == 0 {
            warn!("maxConcurrentClients is 0; no client will ever be able to register");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_yaml() {
        let cfg = ManagerConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: ManagerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.max_concurrent_clients, cfg.max_concurrent_clients);
        assert_eq!(
            back.default_blocking_retry_interval_ms,
            cfg.default_blocking_retry_interval_ms
        );
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xrm.conf.yaml");
        let cfg = ManagerConfig {
            max_concurrent_clients: 7,
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        let loaded = ManagerConfig::load(&path).unwrap();
        assert_eq!(loaded.max_concurrent_clients, 7);
    }
}
