// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Wake-on-LAN magic packets.

use std::net::Ipv4Addr;
use std::net::SocketAddrV4;

use common::MacAddr;
use slog::info;
use tokio::net::UdpSocket;

use crate::types::VmSyncResult;
use crate::VmSyncError;

const SYNC_LEN: usize = 6;
const REPEAT: usize = 16;
pub const MAGIC_PACKET_LEN: usize = SYNC_LEN + REPEAT * 6;

/// Six bytes of 0xff followed by the target address sixteen times.
pub fn magic_packet(mac: MacAddr) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xffu8; MAGIC_PACKET_LEN];
    let octets = mac.octets();
    for chunk in packet[SYNC_LEN..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&octets);
    }
    packet
}

/// Broadcast a magic packet for `mac` to `broadcast:port`.
pub async fn send_magic_packet(
    log: &slog::Logger,
    mac: MacAddr,
    broadcast: Ipv4Addr,
    port: u16,
) -> VmSyncResult<()> {
    let packet = magic_packet(mac);
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .await?;
    socket.set_broadcast(true)?;

    let sent = socket
        .send_to(&packet, SocketAddrV4::new(broadcast, port))
        .await?;
    if sent != packet.len() {
        return Err(VmSyncError::Other(format!(
            "short send of magic packet: {sent} of {} bytes",
            packet.len()
        )));
    }
    info!(log, "sent wake-on-lan packet";
        "mac" => %mac, "broadcast" => %broadcast, "port" => port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_packet_layout() {
        let mac: MacAddr = "9c:6b:00:8e:aa:01".parse().unwrap();
        let packet = magic_packet(mac);
        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xff));
        for i in 0..16 {
            let start = 6 + i * 6;
            assert_eq!(packet[start..start + 6], mac.octets());
        }
    }

    #[tokio::test]
    async fn test_send_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mac = MacAddr::new(0x52, 0x54, 0, 0x12, 0x34, 0x56);

        send_magic_packet(
            &common::logging::discard(),
            mac,
            Ipv4Addr::LOCALHOST,
            port,
        )
        .await
        .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &magic_packet(mac)[..]);
    }
}
