// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Sync one VM at a time from the hypervisor into the gateway.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use annotations::ConnectionSpec;
use annotations::CredentialParser;
use annotations::Vault;
use annotations::VmIdentity;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;

use crate::config::Config;
use crate::gateway::build_connection;
use crate::gateway::ConnectionGroup;
use crate::gateway::ConnectionRecord;
use crate::gateway::GatewayDirectory;
use crate::gateway::WolTarget;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::VmRef;
use crate::hypervisor::VmStatus;
use crate::interfaces;
use crate::neighbors::HostNetwork;
use crate::neighbors::NeighborResolver;
use crate::types::VmSyncResult;

/// What happened to a connection record during a sync.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Created,
    Updated,
    Unchanged,
    Failed,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncReport {
    pub vm: String,
    pub ip: Option<Ipv4Addr>,
    pub notes_updated: bool,
    pub started: bool,
    pub group: Option<String>,
    pub connections: Vec<(String, ConnectionAction)>,
    pub diagnostics: Vec<String>,
}

pub struct VmSync<H, G, N> {
    log: slog::Logger,
    config: Config,
    hypervisor: H,
    gateway: G,
    resolver: NeighborResolver<N>,
    vault: Vault,
    parser: CredentialParser,
    hostname: String,
}

// Fields that, if they differ, mean an existing record is stale.
fn needs_update(existing: &ConnectionRecord, wanted: &ConnectionRecord) -> bool {
    let differs = |k: &str| existing.parameters.get(k) != wanted.parameters.get(k);
    existing.parent_identifier != wanted.parent_identifier
        || existing.protocol != wanted.protocol
        || ["hostname", "username", "password", "port"]
            .into_iter()
            .any(differs)
}

impl<H, G, N> VmSync<H, G, N>
where
    H: Hypervisor,
    G: GatewayDirectory,
    N: HostNetwork,
{
    /// `hostname` is the name of this machine, as name templates see it.
    pub fn new(
        log: &slog::Logger,
        config: &Config,
        hostname: &str,
        hypervisor: H,
        gateway: G,
        net: N,
    ) -> Self {
        let log = log.new(slog::o!("unit" => "vm-sync"));
        let vault = Vault::new(&log, config.encryption_key.as_deref());
        let parser =
            CredentialParser::new(&log, vault.clone(), config.ports, hostname);
        let resolver =
            NeighborResolver::new(&log, net, config.discovery.max_hosts);
        VmSync {
            log,
            config: config.clone(),
            hypervisor,
            gateway,
            resolver,
            vault,
            parser,
            hostname: hostname.to_string(),
        }
    }

    /// Encrypt any plaintext passwords in `notes` and write them back.
    /// Returns the notes now in effect on the hypervisor: the rewrite if it
    /// was saved, otherwise the notes as they were.
    pub async fn persist_notes(&self, vm: &VmRef, notes: &str) -> (String, bool) {
        let rewrite = self.vault.reconcile_notes(notes);
        if !rewrite.changed {
            return (notes.to_string(), false);
        }
        match self.hypervisor.set_notes(vm, &rewrite.text).await {
            Ok(()) => {
                info!(self.log, "encrypted passwords in notes"; "vm" => %vm);
                (rewrite.text, true)
            }
            Err(e) => {
                error!(self.log, "failed to save notes: {e}"; "vm" => %vm);
                (notes.to_string(), false)
            }
        }
    }

    /// Sync every VM on every node whose notes carry credentials.  A VM
    /// that fails is logged and skipped.
    pub async fn sync_all(&self) -> VmSyncResult<Vec<SyncReport>> {
        let mut reports = Vec::new();
        for node in self.hypervisor.list_nodes().await? {
            let vms = match self.hypervisor.list_vms(&node).await {
                Ok(vms) => vms,
                Err(e) => {
                    warn!(self.log, "failed to list VMs: {e}"; "node" => &node);
                    continue;
                }
            };
            for vm in vms {
                match self.sync_vm(&vm).await {
                    Ok(Some(report)) => reports.push(report),
                    Ok(None) => {}
                    Err(e) => warn!(self.log, "sync failed: {e}"; "vm" => %vm),
                }
            }
        }
        Ok(reports)
    }

    /// Sync a single VM.  Returns `None` when its notes hold no credentials.
    pub async fn sync_vm(&self, vm: &VmRef) -> VmSyncResult<Option<SyncReport>> {
        let notes = self.hypervisor.notes(vm).await?;
        if !self.parser.has_credentials(&notes) {
            debug!(self.log, "no credentials in notes"; "vm" => %vm);
            return Ok(None);
        }
        let (notes, notes_updated) = self.persist_notes(vm, &notes).await;

        let started = self.start_if_stopped(vm).await;
        let result = self.sync_running(vm, &notes).await;
        if started {
            if let Err(e) = self.hypervisor.stop_vm(vm).await {
                warn!(self.log, "failed to stop VM again: {e}"; "vm" => %vm);
            }
        }

        let mut report = result?;
        report.notes_updated = notes_updated;
        report.started = started;
        Ok(Some(report))
    }

    // Returns whether we started it.
    async fn start_if_stopped(&self, vm: &VmRef) -> bool {
        if !self.config.sync.start_stopped {
            return false;
        }
        match self.hypervisor.vm_status(vm).await {
            Ok(VmStatus::Stopped) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(self.log, "failed to get VM status: {e}"; "vm" => %vm);
                return false;
            }
        }
        if let Err(e) = self.hypervisor.start_vm(vm).await {
            warn!(self.log, "failed to start VM: {e}"; "vm" => %vm);
            return false;
        }
        info!(self.log, "started VM, waiting for it to boot";
            "vm" => %vm, "secs" => self.config.sync.boot_wait_secs);
        tokio::time::sleep(self.config.sync.boot_wait()).await;
        true
    }

    async fn sync_running(
        &self,
        vm: &VmRef,
        notes: &str,
    ) -> VmSyncResult<SyncReport> {
        let mut report = SyncReport {
            vm: vm.name.clone(),
            ..Default::default()
        };

        let vm_config = self.hypervisor.vm_config(vm).await?;
        let statics = interfaces::parse_static_interfaces(&vm_config);
        let guest = match self.hypervisor.guest_interfaces(vm).await {
            Ok(guest) => guest,
            Err(e) => {
                debug!(self.log, "no guest agent data: {e}"; "vm" => %vm);
                Vec::new()
            }
        };
        let records = interfaces::merge_with_guest_agent(&self.log, statics, &guest);
        let Some(ip) =
            interfaces::resolve_primary_ip(&records, &self.resolver).await
        else {
            warn!(self.log, "no address found, skipping"; "vm" => %vm);
            report
                .diagnostics
                .push(format!("no address found for {}", vm.name));
            return Ok(report);
        };
        report.ip = Some(ip);

        let identity = VmIdentity {
            name: vm.name.clone(),
            id: vm.vmid.to_string(),
            node: vm.node.clone(),
            ip: ip.to_string(),
        };
        let parsed = self.parser.parse_credentials(notes, &identity);
        report.diagnostics.extend(parsed.diagnostics);
        if parsed.specs.is_empty() {
            return Ok(report);
        }

        let parent = self.parent_for(vm, &parsed.specs).await;
        let wol = interfaces::hardware_addresses(&records)
            .first()
            .map(|mac| WolTarget {
                mac: *mac,
                broadcast: self.config.wol.broadcast,
                port: self.config.wol.port,
            });

        let existing = self.gateway.list_connections().await?;
        for spec in &parsed.specs {
            let record = build_connection(
                spec,
                &ip.to_string(),
                wol.as_ref(),
                Some(parent.as_str()),
            );
            let action = self.upsert(&existing, &record).await;
            report.connections.push((record.name, action));
        }
        report.group = Some(parent);
        Ok(report)
    }

    // A VM with several connections gets a group of its own, reused from
    // one sync to the next.
    async fn parent_for(&self, vm: &VmRef, specs: &[ConnectionSpec]) -> String {
        let parent = &self.config.sync.parent_group;
        if specs.len() < 2 {
            return parent.clone();
        }
        match self.gateway.list_groups().await {
            Ok(groups) => {
                let found = groups.into_iter().find(|(_, g)| {
                    g.name == vm.name && g.parent_identifier == *parent
                });
                if let Some((id, _)) = found {
                    debug!(self.log, "reusing connection group";
                        "vm" => %vm, "group" => &id);
                    return id;
                }
            }
            Err(e) => {
                warn!(self.log, "failed to list groups: {e}"; "vm" => %vm);
            }
        }
        let group = ConnectionGroup::organizational(&vm.name, parent);
        match self.gateway.create_group(&group).await {
            Ok(id) => {
                debug!(self.log, "using connection group";
                    "vm" => %vm, "group" => &id);
                id
            }
            Err(e) => {
                warn!(self.log, "failed to create group, using {parent}: {e}";
                    "vm" => %vm);
                parent.clone()
            }
        }
    }

    async fn upsert(
        &self,
        existing: &BTreeMap<String, ConnectionRecord>,
        record: &ConnectionRecord,
    ) -> ConnectionAction {
        // Prefer a same-named record already under the right parent.
        let found = existing
            .iter()
            .filter(|(_, r)| r.name == record.name)
            .min_by_key(|(_, r)| r.parent_identifier != record.parent_identifier);

        let result = match found {
            Some((_, current)) if !needs_update(current, record) => {
                return ConnectionAction::Unchanged;
            }
            Some((id, _)) => self
                .gateway
                .update_connection(id, record)
                .await
                .map(|_| ConnectionAction::Updated),
            None => self
                .gateway
                .create_connection(record)
                .await
                .map(|_| ConnectionAction::Created),
        };
        match result {
            Ok(action) => {
                info!(self.log, "connection {action:?}";
                    "name" => &record.name, "host" => &self.hostname);
                action
            }
            Err(e) => {
                error!(self.log, "failed to write connection: {e}";
                    "name" => &record.name);
                ConnectionAction::Failed
            }
        }
    }
}
