// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Runtime configuration, read from a TOML file.  Every field has a default,
//! so a missing or empty file is a valid configuration.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use annotations::DefaultPorts;
use serde::Deserialize;

use crate::types::VmSyncResult;
use crate::VmSyncError;

/// Environment variable that takes precedence over `encryption_key`.
pub const ENCRYPTION_KEY_ENV: &str = "VMSYNC_ENCRYPTION_KEY";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Secret that note passwords are encrypted under.  Without it,
    /// passwords stay in plaintext.
    pub encryption_key: Option<String>,
    pub ports: DefaultPorts,
    pub wol: WolConfig,
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WolConfig {
    pub broadcast: Ipv4Addr,
    pub port: u16,
}

impl Default for WolConfig {
    fn default() -> Self {
        WolConfig {
            broadcast: Ipv4Addr::BROADCAST,
            port: 9,
        }
    }
}

/// Limits on how hard we look for a host on the local segment.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Most addresses probed by a single sweep
    pub max_hosts: usize,
    /// Timeout handed to each probe process
    pub probe_timeout_ms: u64,
    /// How long we wait for a probe process before killing it
    pub probe_wait_ms: u64,
    pub neighbor_timeout_ms: u64,
    /// Used for the second attempt at reading the neighbor cache
    pub neighbor_fallback_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            max_hosts: 50,
            probe_timeout_ms: 1000,
            probe_wait_ms: 2000,
            neighbor_timeout_ms: 2000,
            neighbor_fallback_timeout_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }

    pub fn neighbor_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbor_timeout_ms)
    }

    pub fn neighbor_fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbor_fallback_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Start stopped VMs so their addresses can be found, and stop them
    /// again afterwards
    pub start_stopped: bool,
    /// How long a VM we started is given to boot
    pub boot_wait_secs: u64,
    /// Group new connections are created under
    pub parent_group: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            start_stopped: true,
            boot_wait_secs: 30,
            parent_group: "ROOT".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }
}

impl Config {
    pub fn from_toml(text: &str) -> VmSyncResult<Config> {
        Ok(toml::from_str(text)?)
    }

    /// Load the config file, if any, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> VmSyncResult<Config> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    VmSyncError::Config(format!(
                        "reading {}: {e}",
                        path.display()
                    ))
                })?;
                Config::from_toml(&text)?
            }
            None => Config::default(),
        };
        config.apply_env(std::env::var(ENCRYPTION_KEY_ENV).ok());
        Ok(config)
    }

    fn apply_env(&mut self, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            self.encryption_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.encryption_key, None);
        assert_eq!(c.ports, DefaultPorts::default());
        assert_eq!(c.wol.broadcast, Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(c.wol.port, 9);
        assert_eq!(c.discovery.max_hosts, 50);
        assert_eq!(c.discovery.probe_wait(), Duration::from_secs(2));
        assert_eq!(c.sync.parent_group, "ROOT");
    }

    #[test]
    fn test_partial_file() {
        let c = Config::from_toml(
            r#"
            encryption_key = "s3cret"

            [ports]
            ssh = 2222

            [wol]
            broadcast = "10.0.0.255"

            [discovery]
            max_hosts = 10
            "#,
        )
        .unwrap();
        assert_eq!(c.encryption_key.as_deref(), Some("s3cret"));
        assert_eq!(c.ports.ssh, 2222);
        assert_eq!(c.ports.rdp, 3389);
        assert_eq!(c.wol.broadcast, Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(c.wol.port, 9);
        assert_eq!(c.discovery.max_hosts, 10);
        assert_eq!(c.discovery.probe_timeout_ms, 1000);
    }

    #[test]
    fn test_bad_file() {
        assert!(matches!(
            Config::from_toml("[wol]\nbroadcast = \"not an ip\""),
            Err(VmSyncError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("colour = \"blue\""),
            Err(VmSyncError::Config(_))
        ));
    }

    #[test]
    fn test_env_override() {
        let mut c = Config::from_toml("encryption_key = \"file\"").unwrap();
        c.apply_env(Some(String::new()));
        assert_eq!(c.encryption_key.as_deref(), Some("file"));
        c.apply_env(Some("env".to_string()));
        assert_eq!(c.encryption_key.as_deref(), Some("env"));
    }
}
