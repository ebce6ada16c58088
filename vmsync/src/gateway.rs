// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Connection records for the remote-desktop gateway, and the directory
//! they are stored in.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use annotations::ConnectionSpec;
use annotations::Protocol;
use async_trait::async_trait;
use common::MacAddr;
use serde::Deserialize;
use serde::Serialize;

use crate::types::VmSyncResult;

/// Identifier of the top of the connection tree.
pub const ROOT_GROUP: &str = "ROOT";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub name: String,
    pub protocol: Protocol,
    pub parent_identifier: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub name: String,
    pub parent_identifier: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ConnectionGroup {
    pub fn organizational(name: &str, parent: &str) -> Self {
        ConnectionGroup {
            identifier: None,
            name: name.to_string(),
            parent_identifier: parent.to_string(),
            kind: "ORGANIZATIONAL".to_string(),
        }
    }
}

#[async_trait]
pub trait GatewayDirectory: Send + Sync {
    /// Every connection, keyed by identifier.
    async fn list_connections(
        &self,
    ) -> VmSyncResult<BTreeMap<String, ConnectionRecord>>;

    async fn get_connection(&self, id: &str) -> VmSyncResult<ConnectionRecord>;

    /// Returns the identifier the directory assigned.
    async fn create_connection(
        &self,
        record: &ConnectionRecord,
    ) -> VmSyncResult<String>;

    async fn update_connection(
        &self,
        id: &str,
        record: &ConnectionRecord,
    ) -> VmSyncResult<()>;

    async fn delete_connection(&self, id: &str) -> VmSyncResult<()>;

    /// Every connection group, keyed by identifier.
    async fn list_groups(
        &self,
    ) -> VmSyncResult<BTreeMap<String, ConnectionGroup>>;

    /// Returns the identifier the directory assigned.  The directory does
    /// not deduplicate, so callers look for an existing group first.
    async fn create_group(
        &self,
        group: &ConnectionGroup,
    ) -> VmSyncResult<String>;
}

#[async_trait]
impl<T: GatewayDirectory + ?Sized> GatewayDirectory for Arc<T> {
    async fn list_connections(
        &self,
    ) -> VmSyncResult<BTreeMap<String, ConnectionRecord>> {
        self.as_ref().list_connections().await
    }
    async fn get_connection(
        &self,
        id: &str,
    ) -> VmSyncResult<ConnectionRecord> {
        self.as_ref().get_connection(id).await
    }
    async fn create_connection(
        &self,
        record: &ConnectionRecord,
    ) -> VmSyncResult<String> {
        self.as_ref().create_connection(record).await
    }
    async fn update_connection(
        &self,
        id: &str,
        record: &ConnectionRecord,
    ) -> VmSyncResult<()> {
        self.as_ref().update_connection(id, record).await
    }
    async fn delete_connection(&self, id: &str) -> VmSyncResult<()> {
        self.as_ref().delete_connection(id).await
    }
    async fn list_groups(
        &self,
    ) -> VmSyncResult<BTreeMap<String, ConnectionGroup>> {
        self.as_ref().list_groups().await
    }
    async fn create_group(
        &self,
        group: &ConnectionGroup,
    ) -> VmSyncResult<String> {
        self.as_ref().create_group(group).await
    }
}

/// Where to send a wake-up for a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WolTarget {
    pub mac: MacAddr,
    pub broadcast: Ipv4Addr,
    pub port: u16,
}

fn flag(value: &str) -> &'static str {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => "true",
        _ => "false",
    }
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn protocol_defaults(spec: &ConnectionSpec) -> BTreeMap<String, String> {
    match spec.protocol {
        Protocol::Rdp => params(&[
            ("security", "any"),
            ("ignore-cert", "true"),
            ("enable-wallpaper", "true"),
            ("enable-theming", "true"),
            ("enable-font-smoothing", "true"),
            ("enable-full-window-drag", "true"),
            ("enable-desktop-composition", "true"),
            ("enable-menu-animations", "true"),
            ("resize-method", "display-update"),
        ]),
        Protocol::Vnc => params(&[
            ("color-depth", "32"),
            ("swap-red-blue", "false"),
            ("cursor", "local"),
            ("encoding", "tight"),
            ("enable-sftp", "false"),
            ("disable-copy", "false"),
            ("disable-paste", "false"),
            ("autoretry", "5"),
            ("read-only", "false"),
        ]),
        Protocol::Ssh => {
            let mut p = params(&[
                ("color-scheme", "gray-black"),
                ("font-name", "monospace"),
                ("font-size", "12"),
                ("enable-sftp", "true"),
            ]);
            p.insert(
                "sftp-directory".to_string(),
                format!("/home/{}", spec.username),
            );
            p
        }
    }
}

fn apply_overrides(
    target: &mut BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) {
    for (key, value) in overrides {
        let value = if key.starts_with("enable-") || key.starts_with("disable-")
        {
            flag(value).to_string()
        } else {
            value.clone()
        };
        target.insert(key.clone(), value);
    }
}

fn wol_parameters(
    target: &WolTarget,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut p = BTreeMap::new();
    p.insert("wol-send-packet".to_string(), "true".to_string());
    p.insert("wol-mac-addr".to_string(), target.mac.to_string());
    p.insert("wol-broadcast-addr".to_string(), target.broadcast.to_string());
    p.insert("wol-udp-port".to_string(), target.port.to_string());

    for (key, value) in overrides {
        if key == "send-packet" {
            p.insert("wol-send-packet".to_string(), flag(value).to_string());
        } else if key.starts_with("wol-") {
            p.insert(key.clone(), value.clone());
        } else {
            p.insert(format!("wol-{key}"), value.clone());
        }
    }
    p
}

/// Turn a connection spec into the record the gateway stores for it.
/// Wake-on-LAN parameters are only added when there is somewhere to send
/// the packet and the spec hasn't opted out.
pub fn build_connection(
    spec: &ConnectionSpec,
    hostname: &str,
    wol: Option<&WolTarget>,
    parent: Option<&str>,
) -> ConnectionRecord {
    let mut parameters = BTreeMap::new();
    parameters.insert("hostname".to_string(), hostname.to_string());
    parameters.insert("port".to_string(), spec.port.to_string());
    match spec.protocol {
        Protocol::Rdp => {
            parameters.insert("username".to_string(), spec.username.clone());
            parameters.insert("password".to_string(), spec.password.clone());
        }
        Protocol::Vnc => {
            parameters.insert("password".to_string(), spec.password.clone());
        }
        Protocol::Ssh => {
            parameters.insert("username".to_string(), spec.username.clone());
            if !spec.password.is_empty() {
                parameters
                    .insert("password".to_string(), spec.password.clone());
            }
        }
    }
    parameters.extend(protocol_defaults(spec));

    match spec.protocol {
        Protocol::Rdp => apply_overrides(&mut parameters, &spec.rdp_settings),
        Protocol::Vnc => apply_overrides(&mut parameters, &spec.vnc_settings),
        Protocol::Ssh => {}
    }

    if let Some(target) = wol.filter(|_| !spec.wol_disabled) {
        parameters.extend(wol_parameters(target, &spec.wol_settings));
    }

    ConnectionRecord {
        identifier: None,
        name: spec.name.clone(),
        protocol: spec.protocol,
        parent_identifier: parent.unwrap_or(ROOT_GROUP).to_string(),
        parameters,
        attributes: params(&[
            ("max-connections", "2"),
            ("max-connections-per-user", "1"),
        ]),
    }
}
