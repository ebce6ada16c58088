// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::ops::Range;

use slog::debug;
use slog::info;
use slog::warn;

use crate::parser::parse_line;
use crate::parser::segments;
use crate::parser::ParamMap;
use crate::parser::ParamToken;
use crate::types::Field;
use crate::vault::Vault;

/// Notes after plaintext passwords have been replaced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotesRewrite {
    pub text: String,
    pub changed: bool,
}

struct Edit {
    span: Range<usize>,
    replacement: String,
}

fn sealed_field(token: &str) -> String {
    format!("encrypted_password:\"{token}\"")
}

// A removed pair takes the blanks in front of it along, so the line doesn't
// collect stray spaces.
fn removal(line: &str, token: &ParamToken) -> Range<usize> {
    let before = &line[..token.span.start];
    let kept = before.trim_end_matches([' ', '\t']).len();
    kept..token.span.end
}

impl Vault {
    /// Replace plaintext passwords in VM notes with encrypted ones.
    ///
    /// Lines with only a plaintext password get it encrypted in place.
    /// Lines with both get the encrypted value refreshed, and the plaintext
    /// dropped, when the two disagree.  Everything else is left byte for
    /// byte, so running this over its own output changes nothing.
    pub fn reconcile_notes(&self, notes: &str) -> NotesRewrite {
        let mut edits = Vec::new();

        for seg in segments(notes) {
            let line = &notes[seg.clone()];
            let params = parse_line(line);
            for edit in self.reconcile_line(line, &params) {
                edits.push(Edit {
                    span: edit.span.start + seg.start..edit.span.end + seg.start,
                    replacement: edit.replacement,
                });
            }
        }

        if edits.is_empty() {
            return NotesRewrite {
                text: notes.to_string(),
                changed: false,
            };
        }

        edits.sort_by_key(|e| std::cmp::Reverse(e.span.start));
        let mut text = notes.to_string();
        for edit in &edits {
            text.replace_range(edit.span.clone(), &edit.replacement);
        }
        info!(self.log(), "encrypted passwords in notes"; "edits" => edits.len());
        let changed = text != notes;
        NotesRewrite { text, changed }
    }

    fn reconcile_line(&self, line: &str, params: &ParamMap) -> Vec<Edit> {
        // Only credential lines are ours to rewrite; prose that happens to
        // read as `pass: ...` is left alone.
        if params.get(Field::Username).is_none()
            || params.get(Field::Protocols).is_none()
        {
            return Vec::new();
        }
        let Some(plain) = params.token(Field::Password) else {
            return Vec::new();
        };
        let user = params.get(Field::Username).unwrap_or("<unknown>");
        let extra_plain = params
            .all_tokens(Field::Password)
            .filter(|t| t.span != plain.span)
            .map(|t| Edit {
                span: removal(line, t),
                replacement: String::new(),
            });

        match params.token(Field::EncryptedPassword) {
            None => {
                let sealed = match self.try_encrypt(&plain.value) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        debug!(self.log(), "leaving plaintext password: {e}";
                            "user" => user);
                        return Vec::new();
                    }
                };
                let mut edits = vec![Edit {
                    span: plain.span.clone(),
                    replacement: sealed_field(&sealed),
                }];
                edits.extend(extra_plain);
                edits
            }
            Some(encrypted) => {
                match self.decrypt(&encrypted.value) {
                    Ok(current) if current == plain.value => return Vec::new(),
                    Ok(_) => {}
                    Err(_) => {
                        warn!(self.log(),
                            "cannot read encrypted password, leaving line";
                            "user" => user);
                        return Vec::new();
                    }
                }
                let sealed = match self.try_encrypt(&plain.value) {
                    Ok(sealed) => sealed,
                    Err(_) => return Vec::new(),
                };

                // A repaired token shares its span with the connection name
                // it was split from, so both get written back.
                let replacement = if encrypted.repaired {
                    let name = params
                        .tokens()
                        .iter()
                        .find(|t| t.repaired && t.key == "confName")
                        .map(|t| t.value.as_str())
                        .unwrap_or_default();
                    format!("confName:\"{name}\" {}", sealed_field(&sealed))
                } else {
                    sealed_field(&sealed)
                };
                let mut edits = vec![
                    Edit {
                        span: encrypted.span.clone(),
                        replacement,
                    },
                    Edit {
                        span: removal(line, plain),
                        replacement: String::new(),
                    },
                ];
                edits.extend(extra_plain);
                edits
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_line;
    use crate::types::Field;
    use crate::vault::Vault;

    fn vault() -> Vault {
        Vault::new(&common::logging::discard(), Some("notes-secret"))
    }

    fn password_of(vault: &Vault, line: &str) -> String {
        let params = parse_line(line);
        let token = params.get(Field::EncryptedPassword).unwrap();
        vault.decrypt(token).unwrap()
    }

    #[test]
    fn test_plaintext_encrypted() {
        let v = vault();
        let notes = r#"Web server
user:"admin" pass:"secret" protos:"rdp";"#;
        let out = v.reconcile_notes(notes);
        assert!(out.changed);
        assert!(out.text.starts_with("Web server\nuser:\"admin\" encrypted_password:\""));
        assert!(out.text.ends_with(" protos:\"rdp\";"));
        assert!(!out.text.contains(r#"pass:"secret""#));
        assert_eq!(password_of(&v, &out.text), "secret");
    }

    #[test]
    fn test_idempotent() {
        let v = vault();
        let notes = r#"user:a pass:b protos:ssh; user:c password:d protos:vnc;"#;
        let first = v.reconcile_notes(notes);
        assert!(first.changed);
        let second = v.reconcile_notes(&first.text);
        assert!(!second.changed);
        assert_eq!(second.text, first.text);
    }

    #[test]
    fn test_stale_encrypted_replaced() {
        let v = vault();
        let old = v.encrypt("old");
        let notes = format!(r#"user:a pass:"new" encrypted_password:"{old}" protos:ssh;"#);
        let out = v.reconcile_notes(&notes);
        assert!(out.changed);
        assert!(!out.text.contains("pass:"));
        assert!(!out.text.contains(&old));
        assert!(out.text.starts_with("user:a encrypted_password:"));
        assert_eq!(password_of(&v, &out.text), "new");
        assert!(!v.reconcile_notes(&out.text).changed);
    }

    #[test]
    fn test_matching_pair_untouched() {
        let v = vault();
        let sealed = v.encrypt("same");
        let notes = format!(r#"user:a pass:same encrypted_password:{sealed} protos:ssh;"#);
        let out = v.reconcile_notes(&notes);
        assert!(!out.changed);
        assert_eq!(out.text, notes);
    }

    #[test]
    fn test_undecryptable_untouched() {
        let v = vault();
        let notes = r#"user:a pass:x encrypted_password:abc123 protos:ssh;"#;
        let out = v.reconcile_notes(notes);
        assert!(!out.changed);
        assert_eq!(out.text, notes);
    }

    #[test]
    fn test_repaired_name_rewritten() {
        let v = vault();
        let old = v.encrypt("old");
        let notes = format!(
            r#"user:a pass:new confName:"srv encrypted_password:{old}" protos:ssh;"#
        );
        let out = v.reconcile_notes(&notes);
        assert!(out.changed);
        assert!(out.text.contains(r#"confName:"srv" encrypted_password:""#));
        assert_eq!(password_of(&v, &out.text), "new");
        assert_eq!(
            parse_line(&out.text).get(Field::ConnectionName),
            Some("srv")
        );
        let again = v.reconcile_notes(&out.text);
        assert!(!again.changed);
        assert_eq!(again.text, out.text);
    }

    #[test]
    fn test_no_key_untouched() {
        let v = Vault::new(&common::logging::discard(), None);
        let notes = "user:a pass:b protos:ssh;";
        let out = v.reconcile_notes(notes);
        assert!(!out.changed);
        assert_eq!(out.text, notes);
    }

    #[test]
    fn test_unterminated_and_prose_untouched() {
        let v = vault();
        let notes = "Backed up nightly; user:a pass:b protos:ssh";
        let out = v.reconcile_notes(notes);
        assert!(!out.changed);
    }

    #[test]
    fn test_prose_pass_untouched() {
        let v = vault();
        let prose = "Console pass: see the wiki;";
        let out = v.reconcile_notes(&format!("{prose} user:a pass:b protos:ssh;"));
        assert!(out.changed);
        let (head, tail) = out.text.split_at(prose.len());
        assert_eq!(head, prose);
        assert!(tail.starts_with(" user:a encrypted_password:"));
        assert!(tail.ends_with(" protos:ssh;"));
        assert_eq!(password_of(&v, tail), "b");
    }

    #[test]
    fn test_incomplete_line_untouched() {
        let v = vault();
        for notes in ["user:a pass:b;", "pass:b protos:ssh;"] {
            let out = v.reconcile_notes(notes);
            assert!(!out.changed, "{notes}");
            assert_eq!(out.text, notes);
        }
    }

    #[test]
    fn test_duplicate_plaintext_dropped() {
        let v = vault();
        let out =
            v.reconcile_notes("user:a pass:pw.one password:pw.two protos:ssh;");
        assert!(!out.text.contains("pw."));
        assert!(out.text.starts_with("user:a encrypted_password:"));
        assert_eq!(password_of(&v, &out.text), "pw.two");
    }
}
