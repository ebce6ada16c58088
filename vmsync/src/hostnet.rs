// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! `HostNetwork` backed by the system's own tools: `arp`, `ip`/`route`
//! and `ping`.  Every command runs under a timeout and is killed if it
//! overruns.

use std::net::Ipv4Addr;
use std::process::Output;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use slog::debug;
use slog::trace;
use tokio::process::Command;

use crate::config::DiscoveryConfig;
use crate::neighbors::HostNetwork;

const ROUTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Short name of this host, as `uname -n` reports it, with any domain
/// stripped.
pub fn local_hostname() -> String {
    const UNAME: &str = "uname";

    if let Ok(out) = std::process::Command::new(UNAME).arg("-n").output() {
        if out.status.success() {
            let name = String::from_utf8_lossy(&out.stdout);
            if let Some(short) = name.trim().split('.').next() {
                if !short.is_empty() {
                    return short.to_string();
                }
            }
        }
    }
    "unknown".to_string()
}

/// `default via 192.168.1.1 dev eth0 proto dhcp`
fn parse_ip_route(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        fields.find(|f| *f == "via")?;
        fields.next()?.parse().ok()
    })
}

/// `    gateway: 192.168.1.1`
fn parse_route_get(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let (_, gw) = line.trim().split_once("gateway:")?;
        gw.trim().parse().ok()
    })
}

pub struct SystemNetwork {
    log: slog::Logger,
    config: DiscoveryConfig,
}

impl SystemNetwork {
    pub fn new(log: &slog::Logger, config: &DiscoveryConfig) -> Self {
        SystemNetwork {
            log: log.new(slog::o!("unit" => "host-network")),
            config: config.clone(),
        }
    }

    // Run a command to completion, or kill it at the deadline.  Dropping the
    // wait future drops the child, and `kill_on_drop` does the rest.
    async fn run(
        &self,
        cmd: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Option<Output> {
        let child = match Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!(self.log, "failed to run {cmd}: {e}");
                return None;
            }
        };
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => Some(out),
            Ok(Err(e)) => {
                debug!(self.log, "{cmd} failed: {e}");
                None
            }
            Err(_) => {
                trace!(self.log, "{cmd} timed out"; "args" => args.join(" "));
                None
            }
        }
    }

    fn ping_args(&self, ip: &str) -> Vec<String> {
        // Linux ping takes -W in seconds, the BSDs in milliseconds.
        let wait = if cfg!(target_os = "linux") {
            self.config.probe_timeout().as_secs().max(1).to_string()
        } else {
            self.config.probe_timeout_ms.to_string()
        };
        ["-c", "1", "-W", wait.as_str(), ip]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[async_trait]
impl HostNetwork for SystemNetwork {
    async fn neighbor_table(&self) -> Option<String> {
        let primary = self
            .run("arp", &["-an"], self.config.neighbor_timeout())
            .await
            .filter(|out| out.status.success());
        let out = match primary {
            Some(out) => out,
            None => {
                debug!(self.log, "arp -an failed, falling back to arp -a");
                self.run("arp", &["-a"], self.config.neighbor_fallback_timeout())
                    .await?
            }
        };
        Some(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn default_gateway(&self) -> Option<Ipv4Addr> {
        if let Some(out) =
            self.run("ip", &["route", "show", "default"], ROUTE_TIMEOUT).await
        {
            if let Some(gw) = parse_ip_route(&String::from_utf8_lossy(&out.stdout))
            {
                return Some(gw);
            }
        }
        let out = self
            .run("route", &["-n", "get", "default"], ROUTE_TIMEOUT)
            .await?;
        parse_route_get(&String::from_utf8_lossy(&out.stdout))
    }

    async fn probe(&self, ip: Ipv4Addr) {
        let args = self.ping_args(&ip.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        // The exit status doesn't matter, only the cache entry it leaves.
        let _ = self.run("ping", &args, self.config.probe_wait()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_route() {
        assert_eq!(
            parse_ip_route("default via 192.168.1.1 dev eth0 proto dhcp metric 100\n"),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(parse_ip_route("default dev wg0 scope link\n"), None);
        assert_eq!(parse_ip_route(""), None);
    }

    #[test]
    fn test_parse_route_get() {
        let out = "   route to: default\ndestination: default\n       \
                   mask: default\n    gateway: 10.20.0.1\n  interface: en0\n";
        assert_eq!(parse_route_get(out), Some(Ipv4Addr::new(10, 20, 0, 1)));
        assert_eq!(parse_route_get("gateway: fe80::1%en0"), None);
    }

    #[test]
    fn test_ping_args() {
        let net = SystemNetwork::new(
            &common::logging::discard(),
            &DiscoveryConfig::default(),
        );
        let args = net.ping_args("10.0.0.1");
        assert_eq!(args[..3], ["-c", "1", "-W"]);
        assert_eq!(args[4], "10.0.0.1");
        if cfg!(target_os = "linux") {
            assert_eq!(args[3], "1");
        } else {
            assert_eq!(args[3], "1000");
        }
    }

    #[tokio::test]
    async fn test_missing_command() {
        let net = SystemNetwork::new(
            &common::logging::discard(),
            &DiscoveryConfig::default(),
        );
        assert!(net
            .run("/nonexistent/vmsync-test", &[], Duration::from_secs(1))
            .await
            .is_none());
    }
}
