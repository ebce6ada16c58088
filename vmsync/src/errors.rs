// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;

use common::network::MacError;

#[derive(Debug, thiserror::Error)]
pub enum VmSyncError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    /// A hardware address supplied by a caller or a config file didn't parse
    #[error("Invalid hardware address: {0}")]
    Mac(String),
    /// A call to the hypervisor inventory API failed
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),
    /// A call to the gateway connection directory failed
    #[error("Gateway error: {0}")]
    Gateway(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("error: {0}")]
    Other(String),
}

impl convert::From<std::io::Error> for VmSyncError {
    fn from(err: std::io::Error) -> Self {
        VmSyncError::Io(err)
    }
}

impl convert::From<MacError> for VmSyncError {
    fn from(err: MacError) -> Self {
        VmSyncError::Mac(err.to_string())
    }
}

impl convert::From<toml::de::Error> for VmSyncError {
    fn from(err: toml::de::Error) -> Self {
        VmSyncError::Config(err.to_string())
    }
}

impl convert::From<String> for VmSyncError {
    fn from(err: String) -> Self {
        VmSyncError::Other(err)
    }
}

impl convert::From<&str> for VmSyncError {
    fn from(err: &str) -> Self {
        VmSyncError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for VmSyncError {
    fn from(err: anyhow::Error) -> Self {
        VmSyncError::Other(err.to_string())
    }
}
