// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Remote-desktop protocols a connection can be created for.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rdp,
    Vnc,
    Ssh,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
            Protocol::Ssh => "ssh",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rdp" => Ok(Protocol::Rdp),
            "vnc" => Ok(Protocol::Vnc),
            "ssh" => Ok(Protocol::Ssh),
            _ => Err(format!("unsupported protocol: {s}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Port used for a protocol when the annotation doesn't override it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DefaultPorts {
    pub rdp: u16,
    pub vnc: u16,
    pub ssh: u16,
}

impl Default for DefaultPorts {
    fn default() -> Self {
        DefaultPorts {
            rdp: 3389,
            vnc: 5900,
            ssh: 22,
        }
    }
}

impl DefaultPorts {
    pub fn for_protocol(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Rdp => self.rdp,
            Protocol::Vnc => self.vnc,
            Protocol::Ssh => self.ssh,
        }
    }
}

/// A field of a credential line.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Field {
    Username,
    Password,
    EncryptedPassword,
    Protocols,
    RdpPort,
    VncPort,
    SshPort,
    Port,
    RdpSettings,
    VncSettings,
    WolSettings,
    WolDisabled,
    ConnectionName,
}

/// Every recognized field with the keys accepted for it.  When a line
/// carries more than one spelling of the same field, the earlier spelling in
/// this table wins.  New aliases go here and nowhere else.
pub const FIELDS: &[(Field, &[&str])] = &[
    (Field::Username, &["username", "user"]),
    (Field::Password, &["password", "pass"]),
    (Field::EncryptedPassword, &["encrypted_password"]),
    (Field::Protocols, &["protocols", "protos", "proto"]),
    (Field::RdpPort, &["rdp_port"]),
    (Field::VncPort, &["vnc_port"]),
    (Field::SshPort, &["ssh_port"]),
    (Field::Port, &["port"]),
    (Field::RdpSettings, &["rdp_settings", "rdpSettings"]),
    (Field::VncSettings, &["vnc_settings", "vncSettings"]),
    (Field::WolSettings, &["wol_settings", "wolSettings"]),
    (Field::WolDisabled, &["wol_disabled", "wolDisabled"]),
    (Field::ConnectionName, &["connection_name", "confName"]),
];

impl Field {
    /// The keys accepted for this field, preferred spelling first.
    pub fn aliases(self) -> &'static [&'static str] {
        FIELDS
            .iter()
            .find(|(f, _)| *f == self)
            .map(|(_, aliases)| *aliases)
            .unwrap_or(&[])
    }

    /// Map a key as written in the notes to the field it names.  Keys are
    /// case-sensitive.
    pub fn from_key(key: &str) -> Option<Field> {
        FIELDS
            .iter()
            .find(|(_, aliases)| aliases.contains(&key))
            .map(|(f, _)| *f)
    }

    /// The per-protocol port override field.
    pub fn port_for(protocol: Protocol) -> Field {
        match protocol {
            Protocol::Rdp => Field::RdpPort,
            Protocol::Vnc => Field::VncPort,
            Protocol::Ssh => Field::SshPort,
        }
    }
}

/// The VM-side values available to connection name templates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmIdentity {
    pub name: String,
    pub id: String,
    pub node: String,
    pub ip: String,
}

impl Default for VmIdentity {
    fn default() -> Self {
        VmIdentity {
            name: String::new(),
            id: "unknown".to_string(),
            node: "unknown".to_string(),
            ip: "unknown".to_string(),
        }
    }
}

/// One fully resolved connection: a single protocol from a single
/// credential line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConnectionSpec {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub protocol: Protocol,
    pub name: String,
    pub port: u16,
    pub rdp_settings: BTreeMap<String, String>,
    pub vnc_settings: BTreeMap<String, String>,
    pub wol_settings: BTreeMap<String, String>,
    pub wol_disabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        for p in [Protocol::Rdp, Protocol::Vnc, Protocol::Ssh] {
            assert_eq!(p.as_str().parse::<Protocol>(), Ok(p));
        }
        assert!("ftp".parse::<Protocol>().is_err());
        assert!("RDP".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_aliases_are_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for (_, aliases) in FIELDS {
            for alias in *aliases {
                assert!(seen.insert(*alias), "duplicate alias {alias}");
            }
        }
    }

    #[test]
    fn test_from_key() {
        assert_eq!(Field::from_key("user"), Some(Field::Username));
        assert_eq!(Field::from_key("protos"), Some(Field::Protocols));
        assert_eq!(Field::from_key("confName"), Some(Field::ConnectionName));
        assert_eq!(Field::from_key("confname"), None);
        assert_eq!(Field::from_key("colour"), None);
    }

    #[test]
    fn test_default_ports() {
        let ports = DefaultPorts::default();
        assert_eq!(ports.for_protocol(Protocol::Rdp), 3389);
        assert_eq!(ports.for_protocol(Protocol::Vnc), 5900);
        assert_eq!(ports.for_protocol(Protocol::Ssh), 22);
    }

    #[test]
    fn test_password_not_serialized() {
        let spec = ConnectionSpec {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            protocol: Protocol::Ssh,
            name: "admin@vm-ssh".to_string(),
            port: 22,
            rdp_settings: BTreeMap::new(),
            vnc_settings: BTreeMap::new(),
            wol_settings: BTreeMap::new(),
            wol_disabled: false,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"protocol\":\"ssh\""));
    }
}
