// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::net::Ipv4Addr;

use common::MacAddr;
use serde::Serialize;

use crate::errors;

pub type VmSyncResult<T> = Result<T, errors::VmSyncError>;

/// One row of the host's neighbor cache.  These are rebuilt on every query
/// and never stored.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NeighborEntry {
    /// The name the cache reported, or the address when it had none
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}
