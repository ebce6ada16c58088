// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Returns `true` for addresses that are never useful as a remote-desktop
/// target: IPv4 loopback (127/8) and link-local (169.254/16), and IPv6
/// loopback (::1) and link-local (fe80::/10).
pub fn is_excluded_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("missing '/' in {0:?}")]
    NoSlash(String),
    #[error("bad network address {0:?}")]
    Address(String),
    #[error("bad prefix length {0:?}")]
    PrefixLen(String),
}

/// A block of IPv4 addresses, as swept for neighbors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv4Cidr {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    /// The /24 network containing `addr`.  We have no netmask for the local
    /// segment, so this is what we assume when sweeping from a gateway.
    pub fn enclosing_24(addr: Ipv4Addr) -> Ipv4Cidr {
        let o = addr.octets();
        Ipv4Cidr {
            prefix: Ipv4Addr::new(o[0], o[1], o[2], 0),
            prefix_len: 24,
        }
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.prefix) & self.mask()
    }

    /// Iterate over the usable host addresses in the network, skipping the
    /// network and broadcast addresses.  /31 and /32 networks have no such
    /// reserved addresses, so every address is returned.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let network = u32::from(self.prefix) & self.mask();
        let last = network | !self.mask();
        let (first, last) = if self.prefix_len >= 31 {
            (network, last)
        } else {
            (network + 1, last - 1)
        };
        (first..=last).map(Ipv4Addr::from)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, CidrError> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| CidrError::NoSlash(s.to_string()))?;
        let prefix = addr
            .parse()
            .map_err(|_| CidrError::Address(addr.to_string()))?;
        match len.parse::<u8>() {
            Ok(prefix_len) if prefix_len <= 32 => {
                Ok(Ipv4Cidr { prefix, prefix_len })
            }
            _ => Err(CidrError::PrefixLen(len.to_string())),
        }
    }
}


/// A 48-bit hardware address.
///
/// This is the only representation of a hardware address that should ever be
/// compared.  Hypervisor configs, guest agents and the neighbor cache all
/// format addresses differently ("9C-6B-00-8E-AA-01", "9c:6b:0:8e:aa:1",
/// "9c6b008eaa01"); all of them parse into the same value.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MacAddr {
    a: [u8; 6],
}

impl MacAddr {
    pub const ZERO: Self = MacAddr { a: [0; 6] };

    pub fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> MacAddr {
        MacAddr {
            a: [a, b, c, d, e, f],
        }
    }

    /// Octets in wire order.
    pub fn octets(&self) -> [u8; 6] {
        self.a
    }

    /// All zeros, as guest agents report for interfaces with no hardware
    /// address.
    pub fn is_null(self) -> bool {
        self == Self::ZERO
    }

    /// Reduce `raw` to its canonical form: lowercase, colon-separated,
    /// each octet two digits wide.
    pub fn normalize(raw: &str) -> Result<String, MacError> {
        raw.parse::<MacAddr>().map(|m| m.to_string())
    }

    /// Return `true` if `raw` reduces to exactly six valid hex octets.
    pub fn validate(raw: &str) -> bool {
        raw.parse::<MacAddr>().is_ok()
    }

    /// Compare two textual addresses by their canonical form.  Anything that
    /// fails to parse is unequal to everything, including itself.
    pub fn equals(a: &str, b: &str) -> bool {
        match (a.parse::<MacAddr>(), b.parse::<MacAddr>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    /// Too few octets to be a valid MAC address
    #[error("Too few octets")]
    TooShort,
    /// Too many octets to be a valid MAC address
    #[error("Too many octets")]
    TooLong,
    /// Found an octet with a non-hexadecimal character or invalid separator
    #[error("Invalid octet")]
    InvalidOctet,
}

fn parse_octet(octet: &str) -> Result<u8, MacError> {
    // from_str_radix() would also take a leading '+', which we don't want
    if octet.is_empty()
        || octet.len() > 2
        || !octet.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(MacError::InvalidOctet);
    }
    u8::from_str_radix(octet, 16).map_err(|_| MacError::InvalidOctet)
}

impl FromStr for MacAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let s = s.trim();
        let v: Vec<&str> = if s.contains([':', '-']) {
            s.split([':', '-']).collect()
        } else {
            if !s.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(MacError::InvalidOctet);
            }
            if s.len() < 12 {
                return Err(MacError::TooShort);
            }
            if s.len() > 12 {
                return Err(MacError::TooLong);
            }
            // ASCII from here on, so byte offsets are char offsets
            (0..s.len())
                .step_by(2)
                .map(|i| &s[i..usize::min(i + 2, s.len())])
                .collect()
        };

        if v.len() < 6 {
            return Err(MacError::TooShort);
        }
        if v.len() > 6 {
            return Err(MacError::TooLong);
        }
        let mut a = [0u8; 6];
        for (slot, octet) in a.iter_mut().zip(&v) {
            *slot = parse_octet(octet)?;
        }
        Ok(MacAddr { a })
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.a;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// Serialized in canonical text form, so that anything we emit can be fed
// back through the parser.
impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(de)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}
