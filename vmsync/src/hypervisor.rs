// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The hypervisor inventory API, as the sync pipeline sees it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::interfaces::GuestInterface;
use crate::types::VmSyncResult;

/// Config key holding the free-text notes of a VM.
pub const NOTES_KEY: &str = "description";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmRef {
    pub node: String,
    pub vmid: u32,
    pub name: String,
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} ({})", self.node, self.vmid, self.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl From<&str> for VmStatus {
    fn from(s: &str) -> Self {
        match s {
            "running" => VmStatus::Running,
            "stopped" | "shutdown" => VmStatus::Stopped,
            "paused" | "suspended" => VmStatus::Paused,
            _ => VmStatus::Unknown,
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn list_nodes(&self) -> VmSyncResult<Vec<String>>;

    async fn list_vms(&self, node: &str) -> VmSyncResult<Vec<VmRef>>;

    /// The flat key/value configuration of a VM, including its `net<N>`
    /// device lines and its notes.
    async fn vm_config(
        &self,
        vm: &VmRef,
    ) -> VmSyncResult<BTreeMap<String, String>>;

    async fn set_notes(&self, vm: &VmRef, notes: &str) -> VmSyncResult<()>;

    /// Interfaces reported by the guest agent.  Fails if the agent isn't
    /// running.
    async fn guest_interfaces(
        &self,
        vm: &VmRef,
    ) -> VmSyncResult<Vec<GuestInterface>>;

    async fn vm_status(&self, vm: &VmRef) -> VmSyncResult<VmStatus>;

    async fn start_vm(&self, vm: &VmRef) -> VmSyncResult<()>;

    async fn stop_vm(&self, vm: &VmRef) -> VmSyncResult<()>;

    /// The notes field on its own.
    async fn notes(&self, vm: &VmRef) -> VmSyncResult<String> {
        let config = self.vm_config(vm).await?;
        Ok(config.get(NOTES_KEY).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl<T: Hypervisor + ?Sized> Hypervisor for Arc<T> {
    async fn list_nodes(&self) -> VmSyncResult<Vec<String>> {
        self.as_ref().list_nodes().await
    }
    async fn list_vms(&self, node: &str) -> VmSyncResult<Vec<VmRef>> {
        self.as_ref().list_vms(node).await
    }
    async fn vm_config(
        &self,
        vm: &VmRef,
    ) -> VmSyncResult<BTreeMap<String, String>> {
        self.as_ref().vm_config(vm).await
    }
    async fn set_notes(&self, vm: &VmRef, notes: &str) -> VmSyncResult<()> {
        self.as_ref().set_notes(vm, notes).await
    }
    async fn guest_interfaces(
        &self,
        vm: &VmRef,
    ) -> VmSyncResult<Vec<GuestInterface>> {
        self.as_ref().guest_interfaces(vm).await
    }
    async fn vm_status(&self, vm: &VmRef) -> VmSyncResult<VmStatus> {
        self.as_ref().vm_status(vm).await
    }
    async fn start_vm(&self, vm: &VmRef) -> VmSyncResult<()> {
        self.as_ref().start_vm(vm).await
    }
    async fn stop_vm(&self, vm: &VmRef) -> VmSyncResult<()> {
        self.as_ref().stop_vm(vm).await
    }
}
