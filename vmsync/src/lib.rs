// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Resolve hypervisor VMs to live addresses on the local network, and turn
//! the credentials in their notes into remote-desktop gateway connections.

pub mod config;
mod errors;
pub mod gateway;
pub mod hostnet;
pub mod hypervisor;
pub mod interfaces;
pub mod neighbors;
pub mod sync;
pub mod types;
pub mod wol;

pub use errors::VmSyncError;
pub use types::VmSyncResult;
