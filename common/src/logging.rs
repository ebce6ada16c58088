// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::str::FromStr;

use slog::{o, Drain};

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum LogFormat {
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h" | "human" => Ok(LogFormat::Human),
            "j" | "json" => Ok(LogFormat::Json),
            _ => Err("invalid log format".to_string()),
        }
    }
}

fn open_log(path: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

fn into_async<D>(drain: D) -> slog::Fuse<slog_async::Async>
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    slog_async::Async::new(drain).build().fuse()
}

/// Build the root logger.
///
/// Without a log file everything goes to stderr: stdout belongs to the
/// command output (connection specs, neighbor tables), which is often piped
/// somewhere else.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match (log_file, log_format) {
        (Some(path), LogFormat::Json) => into_async(
            slog_bunyan::with_name(name, open_log(path)?).build().fuse(),
        ),
        (Some(path), LogFormat::Human) => {
            let decorator = slog_term::PlainDecorator::new(open_log(path)?);
            into_async(slog_term::FullFormat::new(decorator).build().fuse())
        }
        (None, LogFormat::Json) => into_async(
            slog_bunyan::with_name(name, std::io::stderr()).build().fuse(),
        ),
        (None, LogFormat::Human) => {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            into_async(slog_term::CompactFormat::new(decorator).build().fuse())
        }
    };
    Ok(slog::Logger::root(drain, o!("app" => name)))
}

/// A logger that drops everything, for tests and library callers that
/// don't care.
pub fn discard() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}
