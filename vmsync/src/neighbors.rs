// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use common::network::Ipv4Cidr;
use common::MacAddr;
use slog::debug;
use slog::info;
use slog::trace;

use crate::types::NeighborEntry;

/// The host's view of the local segment.  Every operation is best effort:
/// failures come back as `None` or are silently dropped.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Raw text of the OS neighbor cache.
    async fn neighbor_table(&self) -> Option<String>;

    /// The IPv4 default gateway, used to guess the local segment.
    async fn default_gateway(&self) -> Option<Ipv4Addr>;

    /// Send one probe to `ip`, for the neighbor cache entry it leaves
    /// behind.
    async fn probe(&self, ip: Ipv4Addr);

    /// Probe up to `limit` hosts in `range` concurrently, returning once
    /// every probe has finished or been abandoned.
    async fn sweep(&self, range: Ipv4Cidr, limit: usize) {
        let probes = range.hosts().take(limit).map(|ip| self.probe(ip));
        futures::future::join_all(probes).await;
    }
}

#[async_trait]
impl<T: HostNetwork + ?Sized> HostNetwork for Arc<T> {
    async fn neighbor_table(&self) -> Option<String> {
        self.as_ref().neighbor_table().await
    }

    async fn default_gateway(&self) -> Option<Ipv4Addr> {
        self.as_ref().default_gateway().await
    }

    async fn probe(&self, ip: Ipv4Addr) {
        self.as_ref().probe(ip).await
    }

    async fn sweep(&self, range: Ipv4Cidr, limit: usize) {
        self.as_ref().sweep(range, limit).await
    }
}

/// Parse one line of `arp -a` style output:
///
/// ```text
/// gw.example.com (192.168.1.1) at 0:1b:21:a:b:c on en0 ifscope [ethernet]
/// ? (192.168.1.20) at 52:54:00:12:34:56 [ether] on eth0
/// ```
///
/// Incomplete entries, and anything whose hardware address isn't six
/// colon-separated hex octets, are dropped.
pub fn parse_neighbor_line(line: &str) -> Option<NeighborEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let idx = fields
        .iter()
        .position(|f| f.starts_with('(') && f.ends_with(')'))?;
    if idx == 0 || fields.get(idx + 1) != Some(&"at") {
        return None;
    }

    let ip: Ipv4Addr = fields[idx]
        .trim_start_matches('(')
        .trim_end_matches(')')
        .parse()
        .ok()?;
    let raw_mac: String = fields
        .get(idx + 2)?
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == ':')
        .collect();
    if raw_mac.split(':').count() != 6 {
        return None;
    }
    let mac: MacAddr = raw_mac.parse().ok()?;

    let hostname = match fields[idx - 1] {
        "?" => ip.to_string(),
        name => name.to_string(),
    };
    Some(NeighborEntry { hostname, ip, mac })
}

pub fn parse_neighbor_table(text: &str) -> Vec<NeighborEntry> {
    text.lines().filter_map(parse_neighbor_line).collect()
}

// First entry, in table order, matching the first target that matches
// anything.
fn first_match(
    entries: &[NeighborEntry],
    targets: &[MacAddr],
) -> Option<NeighborEntry> {
    targets
        .iter()
        .find_map(|target| entries.iter().find(|e| e.mac == *target))
        .cloned()
}

pub struct NeighborResolver<N> {
    log: slog::Logger,
    net: N,
    max_hosts: usize,
}

impl<N: HostNetwork> NeighborResolver<N> {
    pub fn new(log: &slog::Logger, net: N, max_hosts: usize) -> Self {
        NeighborResolver {
            log: log.new(slog::o!("unit" => "neighbor-resolver")),
            net,
            max_hosts,
        }
    }

    pub async fn current_entries(&self) -> Vec<NeighborEntry> {
        match self.net.neighbor_table().await {
            Some(text) => {
                let entries = parse_neighbor_table(&text);
                trace!(self.log, "read neighbor table"; "entries" => entries.len());
                entries
            }
            None => {
                debug!(self.log, "neighbor table unavailable");
                Vec::new()
            }
        }
    }

    /// Look `target` up in the neighbor table as it stands.
    pub async fn find_mac(&self, target: MacAddr) -> Option<NeighborEntry> {
        first_match(&self.current_entries().await, &[target])
    }

    /// The /24 around the default gateway.
    pub async fn local_range(&self) -> Option<Ipv4Cidr> {
        let gw = self.net.default_gateway().await?;
        Some(Ipv4Cidr::enclosing_24(gw))
    }

    pub async fn discovery_sweep(&self, range: Ipv4Cidr) {
        info!(self.log, "sweeping local network";
            "range" => %range, "max_hosts" => self.max_hosts);
        self.net.sweep(range, self.max_hosts).await;
    }

    pub async fn find_on_network(
        &self,
        target: MacAddr,
    ) -> Option<NeighborEntry> {
        self.find_any_on_network(&[target]).await
    }

    /// Find the first of `targets` on the local segment.  The table is
    /// checked, then swept at most once for all targets together, then
    /// checked again.
    pub async fn find_any_on_network(
        &self,
        targets: &[MacAddr],
    ) -> Option<NeighborEntry> {
        if targets.is_empty() {
            return None;
        }
        if let Some(hit) = first_match(&self.current_entries().await, targets)
        {
            return Some(hit);
        }

        let Some(range) = self.local_range().await else {
            debug!(self.log, "no default gateway, skipping sweep");
            return None;
        };
        self.discovery_sweep(range).await;

        let hit = first_match(&self.current_entries().await, targets);
        match &hit {
            Some(e) => debug!(self.log, "found after sweep";
                "mac" => %e.mac, "ip" => %e.ip),
            None => debug!(self.log, "not found after sweep";
                "targets" => targets.len()),
        }
        hit
    }

    /// Reverse lookup: the neighbor entry for `ip`, probing it once if it
    /// isn't in the table yet.  Addresses off the local segment never get a
    /// neighbor entry, so they aren't probed.
    pub async fn find_ip(&self, ip: Ipv4Addr) -> Option<NeighborEntry> {
        let lookup = |entries: Vec<NeighborEntry>| {
            entries.into_iter().find(|e| e.ip == ip)
        };
        if let Some(hit) = lookup(self.current_entries().await) {
            return Some(hit);
        }
        if let Some(range) = self.local_range().await {
            if !range.contains(ip) {
                debug!(self.log, "not on the local segment";
                    "ip" => %ip, "range" => %range);
                return None;
            }
        }
        self.net.probe(ip).await;
        lookup(self.current_entries().await)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;

    /// A host network whose neighbor table changes from `before` to `after`
    /// once a sweep (or probe) has run.
    #[derive(Default)]
    pub struct FakeNetwork {
        pub before: String,
        pub after: String,
        pub gateway: Option<Ipv4Addr>,
        pub sweeps: AtomicUsize,
        pub probes: Mutex<Vec<Ipv4Addr>>,
    }

    impl FakeNetwork {
        pub fn new(before: &str, after: &str) -> Self {
            FakeNetwork {
                before: before.to_string(),
                after: after.to_string(),
                gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
                ..Default::default()
            }
        }

        pub fn sweeps(&self) -> usize {
            self.sweeps.load(Ordering::SeqCst)
        }

        fn touched(&self) -> bool {
            self.sweeps() > 0 || !self.probes.lock().unwrap().is_empty()
        }
    }

    #[async_trait]
    impl HostNetwork for FakeNetwork {
        async fn neighbor_table(&self) -> Option<String> {
            match self.touched() {
                true => Some(self.after.clone()),
                false => Some(self.before.clone()),
            }
        }

        async fn default_gateway(&self) -> Option<Ipv4Addr> {
            self.gateway
        }

        async fn probe(&self, ip: Ipv4Addr) {
            self.probes.lock().unwrap().push(ip);
        }

        async fn sweep(&self, _range: Ipv4Cidr, _limit: usize) {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::test_support::FakeNetwork;
    use super::*;

    const LINUX_TABLE: &str = "\
? (192.168.1.1) at 00:1b:21:0a:0b:0c [ether] on eth0
web01.lan (192.168.1.20) at 52:54:00:12:34:56 [ether] on eth0
? (192.168.1.30) at <incomplete> on eth0
";

    const MACOS_TABLE: &str = "\
gw.example.com (192.168.1.1) at 0:1b:21:a:b:c on en0 ifscope [ethernet]
? (192.168.1.44) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
? (192.168.1.255) at ff:ff:ff:ff:ff:ff on en0 ifscope [ethernet]
";

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn resolver(net: Arc<FakeNetwork>) -> NeighborResolver<Arc<FakeNetwork>> {
        NeighborResolver::new(&common::logging::discard(), net, 50)
    }

    #[test]
    fn test_parse_linux() {
        let entries = parse_neighbor_table(LINUX_TABLE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].hostname, "192.168.1.1");
        assert_eq!(entries[1].hostname, "web01.lan");
        assert_eq!(entries[1].mac, mac("52:54:00:12:34:56"));
    }

    #[test]
    fn test_parse_macos_unpadded() {
        let entries = parse_neighbor_table(MACOS_TABLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].hostname, "gw.example.com");
        assert_eq!(entries[0].mac.to_string(), "00:1b:21:0a:0b:0c");
    }

    #[test]
    fn test_parse_rejects_junk() {
        for line in [
            "",
            "Address HWtype HWaddress Flags Mask Iface",
            "(192.168.1.1) at 00:11:22:33:44:55",
            "? (192.168.1.1) at 00:11:22:33:44",
            "? (192.168.1.1) at 001122334455 on en0",
            "? (192.168.1.1) at zz:11:22:33:44:55 on en0",
            "? (fe80::1) at 00:11:22:33:44:55 on en0",
            "? (192.168.1.1) is 00:11:22:33:44:55",
        ] {
            assert!(parse_neighbor_line(line).is_none(), "{line}");
        }
    }

    #[tokio::test]
    async fn test_find_mac_first_wins() {
        let table = format!(
            "{LINUX_TABLE}? (192.168.1.99) at 52:54:00:12:34:56 [ether] on eth0\n"
        );
        let net = Arc::new(FakeNetwork::new(&table, ""));
        let r = resolver(net.clone());
        let hit = r.find_mac(mac("52-54-00-12-34-56")).await.unwrap();
        assert_eq!(hit.ip, Ipv4Addr::new(192, 168, 1, 20));
        assert!(r.find_mac(mac("aa:bb:cc:dd:ee:ff")).await.is_none());
        assert_eq!(net.sweeps(), 0);
    }

    #[tokio::test]
    async fn test_present_needs_no_sweep() {
        let net = Arc::new(FakeNetwork::new(LINUX_TABLE, ""));
        let r = resolver(net.clone());
        assert!(r.find_on_network(mac("52:54:0:12:34:56")).await.is_some());
        assert_eq!(net.sweeps(), 0);
    }

    #[tokio::test]
    async fn test_found_after_single_sweep() {
        let net = Arc::new(FakeNetwork::new(LINUX_TABLE, MACOS_TABLE));
        let r = resolver(net.clone());
        let hit = r.find_on_network(mac("AA-BB-CC-DD-EE-FF")).await.unwrap();
        assert_eq!(hit.ip, Ipv4Addr::new(192, 168, 1, 44));
        assert_eq!(net.sweeps(), 1);
    }

    #[tokio::test]
    async fn test_absent_after_sweep() {
        let net = Arc::new(FakeNetwork::new(LINUX_TABLE, LINUX_TABLE));
        let r = resolver(net.clone());
        assert!(r.find_on_network(mac("aa:bb:cc:dd:ee:01")).await.is_none());
        assert_eq!(net.sweeps(), 1);
    }

    #[tokio::test]
    async fn test_one_sweep_for_many_targets() {
        let net = Arc::new(FakeNetwork::new("", MACOS_TABLE));
        let r = resolver(net.clone());
        let targets =
            [mac("aa:bb:cc:dd:ee:01"), mac("ff:ff:ff:ff:ff:ff")];
        let hit = r.find_any_on_network(&targets).await.unwrap();
        assert_eq!(hit.ip, Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(net.sweeps(), 1);
    }

    #[tokio::test]
    async fn test_no_gateway_no_sweep() {
        let net = Arc::new(FakeNetwork {
            gateway: None,
            ..FakeNetwork::new("", MACOS_TABLE)
        });
        let r = resolver(net.clone());
        assert!(r.find_on_network(mac("aa:bb:cc:dd:ee:ff")).await.is_none());
        assert_eq!(net.sweeps(), 0);
    }

    #[tokio::test]
    async fn test_find_ip_probes_once() {
        let net = Arc::new(FakeNetwork::new("", MACOS_TABLE));
        let r = resolver(net.clone());
        let ip = Ipv4Addr::new(192, 168, 1, 44);
        let hit = r.find_ip(ip).await.unwrap();
        assert_eq!(hit.mac, mac("aa:bb:cc:dd:ee:ff"));
        assert_eq!(*net.probes.lock().unwrap(), vec![ip]);
    }

    #[tokio::test]
    async fn test_find_ip_off_segment_not_probed() {
        let net = Arc::new(FakeNetwork::new("", MACOS_TABLE));
        let r = resolver(net.clone());
        assert!(r.find_ip(Ipv4Addr::new(10, 0, 0, 44)).await.is_none());
        assert!(net.probes.lock().unwrap().is_empty());
    }

    struct CountingProbes(std::sync::Mutex<Vec<Ipv4Addr>>);

    #[async_trait]
    impl HostNetwork for CountingProbes {
        async fn neighbor_table(&self) -> Option<String> {
            None
        }
        async fn default_gateway(&self) -> Option<Ipv4Addr> {
            None
        }
        async fn probe(&self, ip: Ipv4Addr) {
            self.0.lock().unwrap().push(ip);
        }
    }

    #[tokio::test]
    async fn test_default_sweep_limit() {
        let net = CountingProbes(Default::default());
        let range: Ipv4Cidr = "10.1.2.0/24".parse().unwrap();
        net.sweep(range, 50).await;
        let probed = net.0.lock().unwrap();
        assert_eq!(probed.len(), 50);
        assert_eq!(probed[0], Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(probed[49], Ipv4Addr::new(10, 1, 2, 50));
    }
}
