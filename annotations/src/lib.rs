// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Credential annotations kept in the free-text notes of hypervisor VMs:
//! parsing them into connection specs, and keeping the passwords in them
//! encrypted.

mod notes;
pub mod parser;
pub mod types;
pub mod vault;

pub use notes::NotesRewrite;
pub use parser::CredentialParser;
pub use parser::ParsedCredentials;
pub use types::ConnectionSpec;
pub use types::DefaultPorts;
pub use types::Protocol;
pub use types::VmIdentity;
pub use vault::Vault;
pub use vault::VaultError;
