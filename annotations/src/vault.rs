// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Reversible obfuscation of passwords stored in VM notes.
//!
//! Passwords are sealed with AES-256-GCM under a key derived from a
//! configured secret.  A token is the URL-safe base64 (unpadded) of the
//! 12-byte nonce followed by the ciphertext, which keeps it usable as a bare
//! value in a credential line.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::OsRng;
use aes_gcm::Aes256Gcm;
use aes_gcm::Key;
use aes_gcm::Nonce;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::Digest;
use sha2::Sha256;
use slog::warn;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no encryption key configured")]
    NoKey,
    #[error("malformed token: {0}")]
    Token(String),
    #[error("token does not authenticate under the configured key")]
    Cipher,
    #[error("decrypted password is not valid UTF-8")]
    Utf8,
}

/// Derive the 256-bit key from the configured secret.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Holds the (optional) key.  Without a key every operation degrades to a
/// no-op or an error; nothing panics.
#[derive(Clone)]
pub struct Vault {
    log: slog::Logger,
    key: Option<[u8; 32]>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Vault")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Vault {
    /// An empty secret is treated the same as no secret.
    pub fn new(log: &slog::Logger, secret: Option<&str>) -> Self {
        let log = log.new(slog::o!("unit" => "vault"));
        let key = secret.filter(|s| !s.is_empty()).map(derive_key);
        if key.is_none() {
            warn!(log, "no encryption key configured, passwords stay in plaintext");
        }
        Vault { log, key }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn log(&self) -> &slog::Logger {
        &self.log
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        let key = self.key.as_ref().ok_or(VaultError::NoKey)?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
    }

    pub fn try_encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = self.cipher()?;
        let nonce_bytes = generate_nonce();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| VaultError::Cipher)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Encrypt a password, handing back the plaintext unchanged if there is
    /// no key or the cipher fails.
    pub fn encrypt(&self, plaintext: &str) -> String {
        match self.try_encrypt(plaintext) {
            Ok(token) => token,
            Err(e) => {
                warn!(self.log, "password left unencrypted: {e}");
                plaintext.to_string()
            }
        }
    }

    pub fn decrypt(&self, token: &str) -> Result<String, VaultError> {
        let result = self.cipher().and_then(|cipher| {
            let sealed = URL_SAFE_NO_PAD
                .decode(token.trim().trim_end_matches('='))
                .map_err(|e| VaultError::Token(e.to_string()))?;
            if sealed.len() < NONCE_LEN + TAG_LEN {
                return Err(VaultError::Token(format!(
                    "{} bytes is too short",
                    sealed.len()
                )));
            }
            let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
            let plain = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| VaultError::Cipher)?;
            String::from_utf8(plain).map_err(|_| VaultError::Utf8)
        });
        if let Err(e) = &result {
            warn!(self.log, "password decryption failed: {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(secret: Option<&str>) -> Vault {
        Vault::new(&common::logging::discard(), secret)
    }

    #[test]
    fn test_round_trip() {
        let v = vault(Some("correct horse"));
        for plain in ["hunter2", "", "päss wörd;\"'"] {
            let token = v.try_encrypt(plain).unwrap();
            assert_eq!(v.decrypt(&token).unwrap(), plain);
        }
    }

    #[test]
    fn test_token_shape() {
        let token = vault(Some("k")).encrypt("hunter2");
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, "hunter2");
    }

    #[test]
    fn test_nonce_varies() {
        let v = vault(Some("k"));
        assert_ne!(v.encrypt("same"), v.encrypt("same"));
    }

    #[test]
    fn test_wrong_key() {
        let token = vault(Some("one")).encrypt("hunter2");
        assert!(matches!(
            vault(Some("two")).decrypt(&token),
            Err(VaultError::Cipher)
        ));
    }

    #[test]
    fn test_no_key() {
        let v = vault(None);
        assert!(!v.is_enabled());
        assert_eq!(v.encrypt("hunter2"), "hunter2");
        assert!(matches!(v.decrypt("anything"), Err(VaultError::NoKey)));
        assert!(!vault(Some("")).is_enabled());
    }

    #[test]
    fn test_malformed_tokens() {
        let v = vault(Some("k"));
        assert!(matches!(v.decrypt("abc123"), Err(VaultError::Token(_))));
        assert!(matches!(v.decrypt("not base64!"), Err(VaultError::Token(_))));
    }

    #[test]
    fn test_derive_key_stable() {
        assert_eq!(derive_key("a"), derive_key("a"));
        assert_ne!(derive_key("a"), derive_key("b"));
    }
}
