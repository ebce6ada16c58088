// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use common::logging::LogFormat;
use common::MacAddr;
use slog::debug;
use slog::info;
use structopt::*;

use annotations::CredentialParser;
use annotations::Vault;
use annotations::VmIdentity;
use vmsync::config::Config;
use vmsync::hostnet;
use vmsync::hostnet::SystemNetwork;
use vmsync::neighbors::NeighborResolver;
use vmsync::wol;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "vmsync",
    about = "hypervisor VM discovery, credential notes and Wake-on-LAN"
)]
struct GlobalOpts {
    #[structopt(long, short = "c", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[structopt(long, help = "log file")]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        default_value = "human",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: LogFormat,

    #[structopt(subcommand)]
    cmd: Commands,
}

#[derive(Debug, StructOpt)]
enum Commands {
    /// Send a Wake-on-LAN magic packet.
    Wol {
        mac: MacAddr,
        #[structopt(long, short = "b")]
        broadcast: Option<Ipv4Addr>,
        #[structopt(long, short = "p")]
        port: Option<u16>,
    },
    /// Show the host's neighbor table.
    #[structopt(visible_alias = "arp")]
    Neighbors,
    /// Find the address currently using a hardware address.
    FindMac {
        mac: MacAddr,
        #[structopt(long, help = "only look at the table as it stands")]
        no_sweep: bool,
    },
    /// Find the hardware address behind an IPv4 address.
    FindIp { ip: Ipv4Addr },
    /// Parse the credential lines of a notes file and print them as JSON.
    ParseNotes {
        file: PathBuf,
        #[structopt(long, default_value = "")]
        vm_name: String,
        #[structopt(long)]
        vm_id: Option<String>,
        #[structopt(long)]
        node: Option<String>,
        #[structopt(long)]
        ip: Option<String>,
    },
    /// Encrypt the plaintext passwords in a notes file.
    ReconcileNotes {
        file: PathBuf,
        #[structopt(long, help = "print the result instead of saving it")]
        dry_run: bool,
    },
}

fn read_notes(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))
}

async fn neighbors(log: &slog::Logger, config: &Config) -> anyhow::Result<()> {
    let net = SystemNetwork::new(log, &config.discovery);
    let resolver = NeighborResolver::new(log, net, config.discovery.max_hosts);
    for e in resolver.current_entries().await {
        println!("{:<16} {:<18} {}", e.ip, e.mac, e.hostname);
    }
    Ok(())
}

async fn find_mac(
    log: &slog::Logger,
    config: &Config,
    mac: MacAddr,
    no_sweep: bool,
) -> anyhow::Result<()> {
    let net = SystemNetwork::new(log, &config.discovery);
    let resolver = NeighborResolver::new(log, net, config.discovery.max_hosts);
    let found = match no_sweep {
        true => resolver.find_mac(mac).await,
        false => resolver.find_on_network(mac).await,
    };
    let e = found.ok_or_else(|| anyhow!("{mac} not found on the network"))?;
    println!("{} {}", e.ip, e.hostname);
    Ok(())
}

async fn find_ip(
    log: &slog::Logger,
    config: &Config,
    ip: Ipv4Addr,
) -> anyhow::Result<()> {
    let net = SystemNetwork::new(log, &config.discovery);
    let resolver = NeighborResolver::new(log, net, config.discovery.max_hosts);
    let e = resolver
        .find_ip(ip)
        .await
        .ok_or_else(|| anyhow!("no neighbor entry for {ip}"))?;
    println!("{} {}", e.mac, e.hostname);
    Ok(())
}

fn parse_notes(
    log: &slog::Logger,
    config: &Config,
    file: &Path,
    vm: VmIdentity,
) -> anyhow::Result<()> {
    let notes = read_notes(file)?;
    let vault = Vault::new(log, config.encryption_key.as_deref());
    let parser = CredentialParser::new(
        log,
        vault,
        config.ports,
        &hostnet::local_hostname(),
    );
    let parsed = parser.parse_credentials(&notes, &vm);
    let out = serde_json::json!({
        "connections": parsed.specs,
        "diagnostics": parsed.diagnostics,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn reconcile_notes(
    log: &slog::Logger,
    config: &Config,
    file: &Path,
    dry_run: bool,
) -> anyhow::Result<()> {
    let vault = Vault::new(log, config.encryption_key.as_deref());
    if !vault.is_enabled() {
        return Err(anyhow!(
            "no encryption key: set encryption_key or {}",
            vmsync::config::ENCRYPTION_KEY_ENV
        ));
    }
    let notes = read_notes(file)?;
    let rewrite = vault.reconcile_notes(&notes);
    if dry_run {
        print!("{}", rewrite.text);
    } else if rewrite.changed {
        std::fs::write(file, &rewrite.text)
            .with_context(|| format!("failed to write {}", file.display()))?;
        info!(log, "encrypted passwords"; "file" => %file.display());
    } else {
        debug!(log, "nothing to encrypt"; "file" => %file.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = GlobalOpts::from_args();
    let log = common::logging::init("vmsync", &opts.log_file, opts.log_format)?;
    let config = Config::load(opts.config.as_deref())?;

    match opts.cmd {
        Commands::Wol {
            mac,
            broadcast,
            port,
        } => wol::send_magic_packet(
            &log,
            mac,
            broadcast.unwrap_or(config.wol.broadcast),
            port.unwrap_or(config.wol.port),
        )
        .await
        .context("failed to send magic packet"),
        Commands::Neighbors => neighbors(&log, &config).await,
        Commands::FindMac { mac, no_sweep } => {
            find_mac(&log, &config, mac, no_sweep).await
        }
        Commands::FindIp { ip } => find_ip(&log, &config, ip).await,
        Commands::ParseNotes {
            file,
            vm_name,
            vm_id,
            node,
            ip,
        } => {
            let defaults = VmIdentity::default();
            let vm = VmIdentity {
                name: vm_name,
                id: vm_id.unwrap_or(defaults.id),
                node: node.unwrap_or(defaults.node),
                ip: ip.unwrap_or(defaults.ip),
            };
            parse_notes(&log, &config, &file, vm)
        }
        Commands::ReconcileNotes { file, dry_run } => {
            reconcile_notes(&log, &config, &file, dry_run)
        }
    }
}
