// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! A VM's network interfaces, built from what the hypervisor has configured
//! and what the guest agent reports is actually up.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;

use common::network::is_excluded_address;
use common::MacAddr;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;

use crate::neighbors::HostNetwork;
use crate::neighbors::NeighborResolver;

/// An address as the guest agent reports it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuestIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type", default)]
    pub ip_address_type: Option<String>,
    #[serde(default)]
    pub prefix: Option<u8>,
}

/// An interface as the guest agent reports it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub prefix: Option<u8>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct NetworkInterfaceRecord {
    /// Config key (`net0`), or the guest's name for agent-only interfaces
    pub interface: String,
    pub mac: Option<MacAddr>,
    pub model: Option<String>,
    pub bridge: Option<String>,
    pub tag: Option<u16>,
    pub ip_addresses: Vec<InterfaceAddress>,
    /// The interface name inside the guest, when the agent matched it
    pub guest_interface: Option<String>,
}

/// Model recorded for interfaces only the guest agent knows about.
pub const AGENT_MODEL: &str = "agent";

// `net0`, `net1`, ...
fn interface_index(key: &str) -> Option<u32> {
    let digits = key.strip_prefix("net")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn looks_like_mac(token: &str) -> bool {
    token.contains(':') && token.split(':').count() == 6
}

fn parse_device(interface: &str, value: &str) -> NetworkInterfaceRecord {
    let mut rec = NetworkInterfaceRecord {
        interface: interface.to_string(),
        ..Default::default()
    };
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some(("bridge", v)) => rec.bridge = Some(v.to_string()),
            Some(("tag", v)) => rec.tag = v.parse().ok(),
            // `virtio=BC:24:11:...` names both the model and the address.
            Some((k, v)) if looks_like_mac(v) => {
                rec.mac = v.parse().ok();
                rec.model = Some(k.to_string());
            }
            Some(_) => {}
            None if looks_like_mac(part) => rec.mac = part.parse().ok(),
            None => rec.model = Some(part.to_string()),
        }
    }
    rec
}

/// Build one record per `net<N>` entry of a VM config, in index order.
pub fn parse_static_interfaces(
    config: &BTreeMap<String, String>,
) -> Vec<NetworkInterfaceRecord> {
    let mut devices: Vec<(u32, &str, &str)> = config
        .iter()
        .filter_map(|(k, v)| Some((interface_index(k)?, k.as_str(), v.as_str())))
        .collect();
    devices.sort_by_key(|(idx, _, _)| *idx);
    devices
        .into_iter()
        .map(|(_, key, value)| parse_device(key, value))
        .collect()
}

fn usable_addresses(iface: &GuestInterface) -> Vec<InterfaceAddress> {
    iface
        .ip_addresses
        .iter()
        .filter_map(|a| {
            let address: IpAddr = a.ip_address.parse().ok()?;
            (!is_excluded_address(address)).then_some(InterfaceAddress {
                address,
                prefix: a.prefix,
            })
        })
        .collect()
}

/// Attach guest-reported addresses to the configured interfaces, matching
/// on hardware address.  Guest interfaces with no configured counterpart
/// are appended; those without a usable hardware address (loopback, for
/// one) are ignored.
pub fn merge_with_guest_agent(
    log: &slog::Logger,
    static_records: Vec<NetworkInterfaceRecord>,
    guest: &[GuestInterface],
) -> Vec<NetworkInterfaceRecord> {
    let mut agent: Vec<(MacAddr, &GuestInterface)> = Vec::new();
    for iface in guest {
        let Some(mac) = iface
            .hardware_address
            .as_deref()
            .and_then(|m| m.parse::<MacAddr>().ok())
            .filter(|m| !m.is_null())
        else {
            continue;
        };
        if !agent.iter().any(|(m, _)| *m == mac) {
            agent.push((mac, iface));
        }
    }

    let mut seen = Vec::new();
    let mut merged: Vec<NetworkInterfaceRecord> = static_records
        .into_iter()
        .map(|mut rec| {
            let matched = rec
                .mac
                .and_then(|mac| agent.iter().find(|(m, _)| *m == mac));
            match matched {
                Some((mac, iface)) => {
                    rec.ip_addresses = usable_addresses(iface);
                    rec.guest_interface = Some(iface.name.clone());
                    seen.push(*mac);
                }
                None => rec.ip_addresses = Vec::new(),
            }
            rec
        })
        .collect();

    for (mac, iface) in agent.into_iter().filter(|(m, _)| !seen.contains(m)) {
        debug!(log, "guest interface has no configured device";
            "name" => &iface.name, "mac" => %mac);
        merged.push(NetworkInterfaceRecord {
            interface: iface.name.clone(),
            mac: Some(mac),
            model: Some(AGENT_MODEL.to_string()),
            bridge: None,
            tag: None,
            ip_addresses: usable_addresses(iface),
            guest_interface: Some(iface.name.clone()),
        });
    }
    merged
}

/// Hardware addresses of the records, in record order, without repeats.
pub fn hardware_addresses(records: &[NetworkInterfaceRecord]) -> Vec<MacAddr> {
    let mut macs: Vec<MacAddr> = Vec::new();
    for mac in records.iter().filter_map(|r| r.mac) {
        if !macs.contains(&mac) {
            macs.push(mac);
        }
    }
    macs
}

/// The address a remote-desktop connection should use: the first IPv4
/// address the guest agent reported, or failing that wherever the neighbor
/// table finds one of the VM's hardware addresses.
pub async fn resolve_primary_ip<N: HostNetwork>(
    records: &[NetworkInterfaceRecord],
    resolver: &NeighborResolver<N>,
) -> Option<Ipv4Addr> {
    let reported = records
        .iter()
        .flat_map(|r| r.ip_addresses.iter())
        .find_map(|a| match a.address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });
    if reported.is_some() {
        return reported;
    }

    let macs = hardware_addresses(records);
    resolver.find_any_on_network(&macs).await.map(|e| e.ip)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::neighbors::test_support::FakeNetwork;

    fn config(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn guest(json: &str) -> Vec<GuestInterface> {
        serde_json::from_str(json).unwrap()
    }

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_static_interfaces() {
        let recs = parse_static_interfaces(&config(&[
            ("net10", "e1000=aa:bb:cc:00:00:10,bridge=vmbr1"),
            ("net1", "virtio=BC:24:11:A:B:C,bridge=vmbr0,tag=42,firewall=1"),
            ("net0", "virtio,bridge=vmbr0,52:54:00:12:34:56"),
            ("netmask", "255.255.255.0"),
            ("name", "web01"),
        ]));
        assert_eq!(recs.len(), 3);

        assert_eq!(recs[0].interface, "net0");
        assert_eq!(recs[0].model.as_deref(), Some("virtio"));
        assert_eq!(recs[0].mac, Some(mac("52:54:00:12:34:56")));

        assert_eq!(recs[1].interface, "net1");
        assert_eq!(recs[1].model.as_deref(), Some("virtio"));
        assert_eq!(recs[1].mac, Some(mac("bc:24:11:0a:0b:0c")));
        assert_eq!(recs[1].bridge.as_deref(), Some("vmbr0"));
        assert_eq!(recs[1].tag, Some(42));

        assert_eq!(recs[2].interface, "net10");
        assert_eq!(recs[2].model.as_deref(), Some("e1000"));
    }

    #[test]
    fn test_bad_static_mac() {
        let recs =
            parse_static_interfaces(&config(&[("net0", "virtio=zz:1:2:3:4:5")]));
        assert_eq!(recs[0].mac, None);
        assert_eq!(recs[0].model.as_deref(), Some("virtio"));
    }

    const AGENT: &str = r#"[
        {"name": "lo", "hardware-address": "00:00:00:00:00:00",
         "ip-addresses": [{"ip-address": "127.0.0.1", "ip-address-type": "ipv4", "prefix": 8}]},
        {"name": "eth0", "hardware-address": "aa:bb:cc:dd:ee:ff",
         "ip-addresses": [
            {"ip-address": "fe80::a8bb:ccff:fedd:eeff", "ip-address-type": "ipv6", "prefix": 64},
            {"ip-address": "169.254.3.3", "ip-address-type": "ipv4", "prefix": 16},
            {"ip-address": "2001:db8::5", "ip-address-type": "ipv6", "prefix": 64},
            {"ip-address": "10.0.0.5", "ip-address-type": "ipv4", "prefix": 24}]},
        {"name": "docker0", "hardware-address": "02:42:ac:11:00:01",
         "ip-addresses": [{"ip-address": "172.17.0.1", "ip-address-type": "ipv4", "prefix": 16}]},
        {"name": "tun0"}
    ]"#;

    #[test]
    fn test_merge() {
        let log = common::logging::discard();
        let statics = parse_static_interfaces(&config(&[
            ("net0", "virtio=AA-BB-CC-DD-EE-FF,bridge=vmbr0"),
            ("net1", "virtio=52:54:00:00:00:01,bridge=vmbr1"),
        ]));
        let merged = merge_with_guest_agent(&log, statics, &guest(AGENT));
        assert_eq!(merged.len(), 3);

        let eth0 = &merged[0];
        assert_eq!(eth0.guest_interface.as_deref(), Some("eth0"));
        let addrs: Vec<String> =
            eth0.ip_addresses.iter().map(|a| a.address.to_string()).collect();
        assert_eq!(addrs, vec!["2001:db8::5", "10.0.0.5"]);

        assert!(merged[1].ip_addresses.is_empty());
        assert_eq!(merged[1].guest_interface, None);

        let docker = &merged[2];
        assert_eq!(docker.interface, "docker0");
        assert_eq!(docker.model.as_deref(), Some(AGENT_MODEL));
        assert_eq!(docker.mac, Some(mac("02:42:ac:11:00:01")));
    }

    #[tokio::test]
    async fn test_guest_agent_beats_neighbor_table() {
        let log = common::logging::discard();
        let table = "? (10.0.0.9) at aa:bb:cc:dd:ee:ff [ether] on eth0\n";
        let net = Arc::new(FakeNetwork::new(table, table));
        let resolver = NeighborResolver::new(&log, net.clone(), 50);

        let statics = parse_static_interfaces(&config(&[(
            "net0",
            "virtio=AA:BB:CC:DD:EE:FF",
        )]));
        let merged = merge_with_guest_agent(&log, statics, &guest(AGENT));
        assert_eq!(
            resolve_primary_ip(&merged, &resolver).await,
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(net.sweeps(), 0);
    }

    #[tokio::test]
    async fn test_neighbor_fallback() {
        let log = common::logging::discard();
        let table = "? (10.0.0.9) at 52:54:00:00:00:02 [ether] on eth0\n";
        let net = Arc::new(FakeNetwork::new("", table));
        let resolver = NeighborResolver::new(&log, net.clone(), 50);

        let merged = merge_with_guest_agent(
            &log,
            parse_static_interfaces(&config(&[
                ("net0", "virtio=52:54:00:00:00:01"),
                ("net1", "virtio=52:54:00:00:00:02"),
            ])),
            &[],
        );
        assert_eq!(
            resolve_primary_ip(&merged, &resolver).await,
            Some(Ipv4Addr::new(10, 0, 0, 9))
        );
        assert_eq!(net.sweeps(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_resolve() {
        let log = common::logging::discard();
        let net = Arc::new(FakeNetwork::new("", ""));
        let resolver = NeighborResolver::new(&log, net.clone(), 50);
        assert_eq!(resolve_primary_ip(&[], &resolver).await, None);
        assert_eq!(net.sweeps(), 0);
    }
}
