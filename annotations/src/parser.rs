// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Parsing of credential lines out of free-form VM notes.
//!
//! A credential line is a run of `key:value` pairs terminated by `;`.  Values
//! are either quoted with `"` or `'` (and may then contain whitespace), or
//! bare, in which case they end at whitespace, `;` or a quote.  Anything in
//! the notes that doesn't look like a pair is ignored.

use std::collections::BTreeMap;
use std::ops::Range;

use slog::debug;
use slog::warn;

use crate::types::ConnectionSpec;
use crate::types::DefaultPorts;
use crate::types::Field;
use crate::types::Protocol;
use crate::types::VmIdentity;
use crate::vault::Vault;

/// Template used when neither the line nor the notes name a connection.
pub const DEFAULT_NAME_TEMPLATE: &str = "{user}@{vmname}-{proto}";

const DEFAULT_NAME_DIRECTIVE: &str = "default_conf_name:";

// An unquoted connection name swallows the encrypted password that follows
// it, e.g. `confName:srv encrypted_password:abc`.
const BLEED_MARKER: &str = " encrypted_password:";

/// A single `key:value` pair and the bytes of the line it came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParamToken {
    pub key: String,
    pub value: String,
    pub span: Range<usize>,
    /// Set on both halves of a split `confName` value.  They share a span.
    pub repaired: bool,
}

/// The pairs found on one credential line, in the order they appear.
#[derive(Clone, Debug, Default)]
pub struct ParamMap {
    tokens: Vec<ParamToken>,
}

impl ParamMap {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[ParamToken] {
        &self.tokens
    }

    /// Look up a key exactly as written.  A key repeated on the same line
    /// takes its last value.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.raw_token(key).map(|t| t.value.as_str())
    }

    /// Look up a field through its aliases, in alias precedence order.
    pub fn get(&self, field: Field) -> Option<&str> {
        self.token(field).map(|t| t.value.as_str())
    }

    pub fn token(&self, field: Field) -> Option<&ParamToken> {
        field.aliases().iter().find_map(|alias| self.raw_token(alias))
    }

    /// Every token naming the field under any alias.
    pub fn all_tokens(
        &self,
        field: Field,
    ) -> impl Iterator<Item = &ParamToken> + '_ {
        self.tokens
            .iter()
            .filter(move |t| Field::from_key(&t.key) == Some(field))
    }

    fn raw_token(&self, key: &str) -> Option<&ParamToken> {
        self.tokens.iter().rev().find(|t| t.key == key)
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn ends_bare_value(c: char) -> bool {
    c.is_whitespace() || matches!(c, ';' | '"' | '\'')
}

// Parse the value that follows a key ending at `key_end`.  Returns the raw
// value and the offset just past it.
fn value_after(line: &str, key_end: usize) -> Option<(&str, usize)> {
    let rest = line[key_end..].strip_prefix(':')?;
    let trimmed = rest.trim_start();
    let start = line.len() - trimmed.len();

    match trimmed.chars().next()? {
        quote @ ('"' | '\'') => {
            let body = &trimmed[1..];
            let close = body.find(quote)?;
            Some((&body[..close], start + 1 + close + 1))
        }
        _ => {
            let len = trimmed.find(ends_bare_value).unwrap_or(trimmed.len());
            if len == 0 {
                return None;
            }
            Some((&trimmed[..len], start + len))
        }
    }
}

/// Split a line into `key:value` tokens.  Spans are byte offsets into
/// `line`.  Pairs with an empty value are consumed but not reported.
pub fn tokenize(line: &str) -> Vec<ParamToken> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while let Some(off) = line[pos..].find(is_word) {
        let start = pos + off;
        let key_end = line[start..]
            .find(|c: char| !is_word(c))
            .map_or(line.len(), |len| start + len);

        match value_after(line, key_end) {
            Some((value, end)) => {
                let value = value.trim();
                if !value.is_empty() {
                    tokens.push(ParamToken {
                        key: line[start..key_end].to_string(),
                        value: value.to_string(),
                        span: start..end,
                        repaired: false,
                    });
                }
                pos = end;
            }
            None => pos = key_end,
        }
    }
    tokens
}

/// Tokenize a credential line, splitting an encrypted password back out of
/// an unquoted `confName` that absorbed it.
pub fn parse_line(line: &str) -> ParamMap {
    let mut tokens = tokenize(line);

    let bled = tokens.iter().position(|t| {
        t.key == "confName" && t.value.contains(BLEED_MARKER)
    });
    if let Some(idx) = bled {
        let token = &tokens[idx];
        if let Some((name, rest)) = token.value.split_once(BLEED_MARKER) {
            let secret: String = rest
                .trim_start_matches(['"', '\''])
                .chars()
                .take_while(|c| !ends_bare_value(*c))
                .collect();
            let name = name.trim().to_string();
            let span = token.span.clone();

            tokens[idx].value = name;
            tokens[idx].repaired = true;
            if !secret.is_empty() {
                tokens.insert(
                    idx + 1,
                    ParamToken {
                        key: "encrypted_password".to_string(),
                        value: secret,
                        span,
                        repaired: true,
                    },
                );
            }
        }
    }

    ParamMap { tokens }
}

/// Byte ranges of each `;`-terminated segment of `text`, terminator
/// included.  Trailing text with no terminator is not a segment.
pub fn segments(text: &str) -> Vec<Range<usize>> {
    let mut start = 0;
    text.match_indices(';')
        .map(|(idx, _)| {
            let seg = start..idx + 1;
            start = idx + 1;
            seg
        })
        .collect()
}

// Returns the quoted directive value and its length including quotes.
fn directive_value(s: &str) -> Option<(&str, usize)> {
    if !s.starts_with(['"', '\'']) {
        return None;
    }
    let close = s[1..].find(['"', '\''])?;
    if close == 0 {
        return None;
    }
    Some((&s[1..=close], close + 2))
}

/// Every `default_conf_name:"..."` directive in the notes, with its span.
/// The key is matched case-insensitively.
pub fn name_directives(notes: &str) -> Vec<(Range<usize>, String)> {
    // ASCII lowercasing keeps byte offsets aligned with `notes`.
    let lower = notes.to_ascii_lowercase();
    let mut found = Vec::new();
    let mut from = 0;

    while let Some(off) = lower[from..].find(DEFAULT_NAME_DIRECTIVE) {
        let start = from + off;
        let after_key = start + DEFAULT_NAME_DIRECTIVE.len();
        let rest = &notes[after_key..];
        let value_start = after_key + (rest.len() - rest.trim_start().len());

        match directive_value(&notes[value_start..]) {
            Some((value, len)) => {
                found.push((start..value_start + len, value.trim().to_string()));
                from = value_start + len;
            }
            None => from = after_key,
        }
    }
    found
}

/// Outcome of parsing one VM's notes.  Diagnostics describe lines or
/// protocols that were skipped; they never stop the parse.
#[derive(Clone, Debug, Default)]
pub struct ParsedCredentials {
    pub specs: Vec<ConnectionSpec>,
    pub diagnostics: Vec<String>,
}

fn parse_settings(raw: Option<&str>) -> BTreeMap<String, String> {
    raw.into_iter()
        .flat_map(|raw| raw.split(','))
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

struct TemplateContext<'a> {
    username: &'a str,
    password: &'a str,
    protocol: Protocol,
    port: u16,
    vm: &'a VmIdentity,
    hostname: &'a str,
}

impl TemplateContext<'_> {
    fn lookup(&self, placeholder: &str) -> Option<String> {
        let value = match placeholder {
            "user" | "username" => self.username.to_string(),
            "password" => self.password.to_string(),
            "proto" | "protocol" => self.protocol.to_string(),
            "vmname" => self.vm.name.clone(),
            "vmid" | "vm_id" => self.vm.id.clone(),
            "node" | "vmnode" | "vm_node" => self.vm.node.clone(),
            "ip" | "vmip" | "vm_ip" => self.vm.ip.clone(),
            "hostname" | "host" => self.hostname.to_string(),
            "port" => self.port.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Substitute `{placeholder}`s in a single pass.  Unknown placeholders
    /// and substituted text are left alone.
    fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Turns VM notes into connection specs.
pub struct CredentialParser {
    log: slog::Logger,
    vault: Vault,
    ports: DefaultPorts,
    hostname: String,
}

impl CredentialParser {
    /// `hostname` is the short name of the machine doing the sync, exposed to
    /// name templates as `{hostname}`.  Anything after the first `.` is
    /// dropped.
    pub fn new(
        log: &slog::Logger,
        vault: Vault,
        ports: DefaultPorts,
        hostname: &str,
    ) -> Self {
        let hostname = hostname.split('.').next().unwrap_or_default();
        CredentialParser {
            log: log.new(slog::o!("unit" => "credential-parser")),
            vault,
            ports,
            hostname: hostname.to_string(),
        }
    }

    /// Whether the notes yield at least one usable connection.
    pub fn has_credentials(&self, notes: &str) -> bool {
        !self
            .parse_credentials(notes, &VmIdentity::default())
            .specs
            .is_empty()
    }

    pub fn parse_credentials(
        &self,
        notes: &str,
        vm: &VmIdentity,
    ) -> ParsedCredentials {
        let mut out = ParsedCredentials::default();
        if notes.trim().is_empty() {
            return out;
        }

        // Blank out the directives so the lines that carry them still parse.
        let directives = name_directives(notes);
        let mut text = notes.to_string();
        for (span, _) in &directives {
            text.replace_range(span.clone(), &" ".repeat(span.len()));
        }
        let default_template = directives.first().map(|(_, v)| v.as_str());
        if let Some(t) = default_template {
            debug!(self.log, "default connection name template";
                "vm" => &vm.name, "template" => t);
        }

        for seg in segments(&text) {
            let line = text[seg].trim();
            if line.is_empty() || line == ";" {
                continue;
            }
            self.parse_entry(line, default_template, vm, &mut out);
        }
        debug!(self.log, "parsed notes";
            "vm" => &vm.name,
            "connections" => out.specs.len(),
            "diagnostics" => out.diagnostics.len());
        out
    }

    fn diagnose(&self, vm: &VmIdentity, out: &mut ParsedCredentials, msg: String) {
        warn!(self.log, "{msg}"; "vm" => &vm.name);
        out.diagnostics.push(msg);
    }

    fn parse_entry(
        &self,
        line: &str,
        default_template: Option<&str>,
        vm: &VmIdentity,
        out: &mut ParsedCredentials,
    ) {
        let params = parse_line(line);
        if params.is_empty() {
            debug!(self.log, "no parameters on line"; "vm" => &vm.name);
            return;
        }

        let username = params.get(Field::Username);
        let plain = params.get(Field::Password);
        let encrypted = params.get(Field::EncryptedPassword);
        let protocols = params.get(Field::Protocols);

        let mut missing = Vec::new();
        if username.is_none() {
            missing.push("username");
        }
        if plain.is_none() && encrypted.is_none() {
            missing.push("password");
        }
        if protocols.is_none() {
            missing.push("protocols");
        }
        if !missing.is_empty() {
            self.diagnose(
                vm,
                out,
                format!(
                    "skipping credential line (missing: {})",
                    missing.join(", ")
                ),
            );
            return;
        }
        let (Some(username), Some(protocols)) = (username, protocols) else {
            return;
        };

        let password = match self.resolve_password(username, plain, encrypted) {
            Ok(p) => p,
            Err(msg) => {
                self.diagnose(vm, out, msg);
                return;
            }
        };

        let mut wanted = Vec::new();
        for name in protocols
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
        {
            match name.parse::<Protocol>() {
                Ok(p) if !wanted.contains(&p) => wanted.push(p),
                Ok(_) => {}
                Err(_) => self.diagnose(
                    vm,
                    out,
                    format!(
                        "unsupported protocol '{name}' for user {username}"
                    ),
                ),
            }
        }
        if wanted.is_empty() {
            self.diagnose(
                vm,
                out,
                format!("no supported protocols for user {username}"),
            );
            return;
        }

        let template = params
            .get(Field::ConnectionName)
            .or(default_template)
            .unwrap_or(DEFAULT_NAME_TEMPLATE);
        let wol_settings = parse_settings(params.get(Field::WolSettings));
        let wol_disabled =
            params.get(Field::WolDisabled).is_some_and(is_truthy);

        for protocol in wanted {
            let port = self.resolve_port(&params, protocol, username, vm, out);
            let ctx = TemplateContext {
                username,
                password: &password,
                protocol,
                port,
                vm,
                hostname: &self.hostname,
            };
            let rdp_settings = match protocol {
                Protocol::Rdp => parse_settings(params.get(Field::RdpSettings)),
                _ => BTreeMap::new(),
            };
            let vnc_settings = match protocol {
                Protocol::Vnc => parse_settings(params.get(Field::VncSettings)),
                _ => BTreeMap::new(),
            };
            out.specs.push(ConnectionSpec {
                username: username.to_string(),
                password: password.clone(),
                protocol,
                name: ctx.render(template),
                port,
                rdp_settings,
                vnc_settings,
                wol_settings: wol_settings.clone(),
                wol_disabled,
            });
        }
    }

    // When both forms are present the encrypted one wins only if it no
    // longer matches the plaintext.
    fn resolve_password(
        &self,
        username: &str,
        plain: Option<&str>,
        encrypted: Option<&str>,
    ) -> Result<String, String> {
        match (plain, encrypted) {
            (Some(plain), None) => Ok(plain.to_string()),
            (None, Some(token)) => self.vault.decrypt(token).map_err(|e| {
                format!("failed to decrypt password for user {username}: {e}")
            }),
            (Some(plain), Some(token)) => match self.vault.decrypt(token) {
                Ok(decrypted) if decrypted != plain => {
                    debug!(self.log, "plaintext password is stale";
                        "user" => username);
                    Ok(decrypted)
                }
                _ => Ok(plain.to_string()),
            },
            (None, None) => Err(format!("no password for user {username}")),
        }
    }

    fn resolve_port(
        &self,
        params: &ParamMap,
        protocol: Protocol,
        username: &str,
        vm: &VmIdentity,
        out: &mut ParsedCredentials,
    ) -> u16 {
        let default = self.ports.for_protocol(protocol);
        let Some(raw) = params
            .get(Field::port_for(protocol))
            .or_else(|| params.get(Field::Port))
        else {
            return default;
        };
        match raw.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                self.diagnose(
                    vm,
                    out,
                    format!(
                        "invalid {protocol} port '{raw}' for user {username}, \
                         using {default}"
                    ),
                );
                default
            }
        }
    }
}
