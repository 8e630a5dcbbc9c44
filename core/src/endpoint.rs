//! Public IPv4 resolution for instance endpoints
//!
//! Strategies are tried in order and the first plausible address wins.

use crate::remote;
use crate::session::{quote, RemoteShell};
use crate::wg_config::WgConfig;
use crate::{EngineConfig, Error, Result};
use ipnet::Ipv4Net;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// What is already known about the instance whose endpoint is wanted
#[derive(Debug, Clone, Copy)]
pub struct EndpointQuery<'a> {
    pub instance: &'a str,
    pub server: Option<&'a WgConfig>,
    pub subnet: Option<Ipv4Net>,
    pub listen_port: Option<u16>,
    pub config: &'a EngineConfig,
}

pub type Strategy = fn(&dyn RemoteShell, &EndpointQuery<'_>) -> Option<Ipv4Addr>;

pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("snat-rule", from_snat),
    ("dnat-rule", from_dnat),
    ("client-endpoint", from_client_endpoint),
    ("lookup-service", from_lookup_service),
    ("interface-address", from_interface),
];

fn snat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"POSTROUTING.*?--to-source\s+(\d{1,3}(?:\.\d{1,3}){3})").expect("valid regex")
    })
}

fn dnat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"DNAT\s+--to-destination\s+(\d{1,3}(?:\.\d{1,3}){3}):(\d+)").expect("valid regex")
    })
}

fn snat_iface_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-o\s+(\S+)\s+-j\s+SNAT").expect("valid regex"))
}

fn inet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"inet\s+(\d{1,3}(?:\.\d{1,3}){3})/(\d+)").expect("valid regex"))
}

fn default_dev_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"default\b.*?\bdev\s+(\S+)").expect("valid regex"))
}

/// A usable public-facing address
pub fn plausible(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified() || addr.is_loopback() || addr.is_broadcast() || addr.is_multicast())
}

fn parse_ip(s: &str) -> Option<Ipv4Addr> {
    s.trim().parse().ok().filter(|a| plausible(*a))
}

/// `PostUp`/`PostDown` commands of the server config, one per element
fn hook_commands(query: &EndpointQuery<'_>) -> Vec<String> {
    let Some(server) = query.server else {
        return Vec::new();
    };
    ["PostUp", "PostDown"]
        .iter()
        .filter_map(|k| server.interface.get(k))
        .flat_map(|v| v.split(';'))
        .map(str::to_string)
        .collect()
}

fn nat_rules(shell: &dyn RemoteShell, chain: &str) -> Vec<String> {
    match shell.exec(&format!("iptables -t nat -S {} 2>/dev/null", chain)) {
        Ok(out) if out.success() => out.stdout.lines().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn from_snat(shell: &dyn RemoteShell, query: &EndpointQuery<'_>) -> Option<Ipv4Addr> {
    let subnet = query.subnet.map(|s| s.trunc().to_string());
    let matches_subnet = |line: &String| subnet.as_ref().map_or(true, |s| line.contains(s.as_str()));
    let mut lines: Vec<String> = hook_commands(query);
    lines.extend(nat_rules(shell, "POSTROUTING"));
    lines
        .iter()
        .filter(|l| matches_subnet(l))
        .find_map(|l| snat_re().captures(l).and_then(|c| parse_ip(&c[1])))
}

fn from_dnat(shell: &dyn RemoteShell, query: &EndpointQuery<'_>) -> Option<Ipv4Addr> {
    let mut lines: Vec<String> = hook_commands(query);
    lines.extend(nat_rules(shell, "PREROUTING"));
    lines.iter().find_map(|l| {
        let caps = dnat_re().captures(l)?;
        let port: u16 = caps[2].parse().ok()?;
        if query.listen_port.is_some_and(|p| p != port) {
            return None;
        }
        parse_ip(&caps[1])
    })
}

/// Endpoint recorded in a client config that already talks to this instance
fn from_client_endpoint(shell: &dyn RemoteShell, query: &EndpointQuery<'_>) -> Option<Ipv4Addr> {
    let pattern = format!("{}-peer*-client.conf", query.instance);
    let files = remote::list_files(shell, &query.config.paths.deploy_dir, &pattern).ok()?;
    files.iter().find_map(|path| {
        let text = remote::read_file(shell, path).ok()??;
        let client = WgConfig::parse(&text)?;
        let (host, _) = client.peers.first()?.endpoint()?;
        parse_ip(host)
    })
}

fn from_lookup_service(shell: &dyn RemoteShell, _query: &EndpointQuery<'_>) -> Option<Ipv4Addr> {
    public_lookup(shell)
}

fn from_interface(shell: &dyn RemoteShell, query: &EndpointQuery<'_>) -> Option<Ipv4Addr> {
    let iface = hook_commands(query)
        .iter()
        .find_map(|l| snat_iface_re().captures(l).map(|c| c[1].to_string()))
        .or_else(|| default_interface(shell))?;
    interface_addresses(shell, &iface).into_iter().next()
}

/// Address reported by an external lookup service
pub fn public_lookup(shell: &dyn RemoteShell) -> Option<Ipv4Addr> {
    let out = shell
        .exec("curl -s -4 --max-time 10 ifconfig.me 2>/dev/null")
        .ok()?;
    out.text().and_then(parse_ip)
}

/// Interface carrying the default route
pub fn default_interface(shell: &dyn RemoteShell) -> Option<String> {
    let out = shell.exec("ip -4 route show default 2>/dev/null").ok()?;
    let text = out.text()?;
    default_dev_re()
        .captures(text)
        .map(|c| c[1].to_string())
}

/// Global IPv4 addresses of `iface`, in the order the kernel lists them
pub fn interface_addresses(shell: &dyn RemoteShell, iface: &str) -> Vec<Ipv4Addr> {
    let Ok(out) = shell.exec(&format!(
        "ip -4 -o addr show dev {} scope global 2>/dev/null",
        quote(iface)
    )) else {
        return Vec::new();
    };
    if !out.success() {
        return Vec::new();
    }
    inet_re()
        .captures_iter(&out.stdout)
        .filter_map(|c| parse_ip(&c[1]))
        .collect()
}

/// Address and prefix assigned to a (WireGuard) interface
pub fn interface_network(shell: &dyn RemoteShell, iface: &str) -> Option<Ipv4Net> {
    let out = shell
        .exec(&format!("ip -4 -o addr show dev {} 2>/dev/null", quote(iface)))
        .ok()?;
    let caps = inet_re().captures(out.text()?)?;
    Ipv4Net::new(caps[1].parse().ok()?, caps[2].parse().ok()?).ok()
}

/// Run the strategy chain
pub fn resolve(shell: &dyn RemoteShell, query: &EndpointQuery<'_>) -> Result<Ipv4Addr> {
    for (name, strategy) in STRATEGIES {
        if let Some(addr) = strategy(shell, query) {
            log::debug!(
                "[{}] endpoint of {} from {}: {}",
                shell.host_id(),
                query.instance,
                name,
                addr
            );
            return Ok(addr);
        }
    }
    log::warn!(
        "[{}] no public address found for {}",
        shell.host_id(),
        query.instance
    );
    Err(Error::NoPublicAddress(query.instance.to_string()))
}

/// Public addresses of the host for multi-homed provisioning
///
/// Returns the default-route interface and its global addresses, with the
/// externally visible one first.
pub fn host_addresses(shell: &dyn RemoteShell) -> Result<(String, Vec<Ipv4Addr>)> {
    let iface = default_interface(shell)
        .ok_or_else(|| Error::NoPublicAddress("host has no default route".to_string()))?;
    let mut addrs = interface_addresses(shell, &iface);
    match public_lookup(shell) {
        Some(public) => {
            addrs.retain(|a| *a != public);
            addrs.insert(0, public);
        }
        None if addrs.is_empty() => {
            return Err(Error::NoPublicAddress(format!(
                "interface {} has no IPv4 address",
                iface
            )))
        }
        None => {}
    }
    Ok((iface, addrs))
}
